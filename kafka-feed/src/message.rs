use std::fmt;

use serde::{Deserialize, Serialize};

/// A topic, optionally narrowed to a single partition. Identity is the pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicSelector {
    pub topic: String,
    pub partition: Option<i32>,
}

impl TopicSelector {
    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
        }
    }

    pub fn partition(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition: Some(partition),
        }
    }

    /// Expands `partitions` into selectors for `topic`; `None` yields the bare topic.
    pub fn expand(topic: &str, partitions: Option<&[i32]>) -> Vec<Self> {
        match partitions {
            None => vec![Self::topic(topic)],
            Some(parts) => parts.iter().map(|p| Self::partition(topic, *p)).collect(),
        }
    }
}

impl fmt::Display for TopicSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.partition {
            Some(partition) => write!(f, "{}[{}]", self.topic, partition),
            None => f.write_str(&self.topic),
        }
    }
}

/// A record handed to us by the consumer client. We never mutate it; it is
/// dispatched once and then acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
}

impl FeedMessage {
    pub fn new(topic: impl Into<String>, key: Option<&[u8]>, value: Option<&[u8]>) -> Self {
        Self {
            topic: topic.into(),
            partition: 0,
            offset: 0,
            key: key.map(<[u8]>::to_vec),
            value: value.map(<[u8]>::to_vec),
        }
    }

    pub fn at(mut self, partition: i32, offset: i64) -> Self {
        self.partition = partition;
        self.offset = offset;
        self
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }
}

/// Something an encoder can turn into bytes: text, raw bytes, or a JSON document.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
    Json(serde_json::Value),
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_owned())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<&[u8]> for Payload {
    fn from(value: &[u8]) -> Self {
        Payload::Binary(value.to_vec())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Binary(value)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

/// A record to publish. Plain payload types convert into an unkeyed message.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub key: Option<Payload>,
    pub value: Payload,
}

impl OutgoingMessage {
    pub fn keyed(key: impl Into<Payload>, value: impl Into<Payload>) -> Self {
        Self {
            key: Some(key.into()),
            value: value.into(),
        }
    }
}

macro_rules! unkeyed_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for OutgoingMessage {
                fn from(value: $ty) -> Self {
                    Self {
                        key: None,
                        value: value.into(),
                    }
                }
            }
        )*
    };
}

unkeyed_from!(&str, String, &[u8], Vec<u8>, serde_json::Value, Payload);
