//! Error taxonomy for both halves of the crate.

use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

use crate::message::TopicSelector;

/// Failures reported by the underlying broker client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no broker reachable at {brokers}: {reason}")]
    ClusterUnavailable { brokers: String, reason: String },
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("{0}")]
    Other(String),
}

impl ClientError {
    /// True for broker-side timeouts, whichever way the client reported them.
    pub fn is_timeout(&self) -> bool {
        match self {
            ClientError::Timeout(_) => true,
            ClientError::Kafka(e) => matches!(
                e.rdkafka_error_code(),
                Some(
                    RDKafkaErrorCode::MessageTimedOut
                        | RDKafkaErrorCode::OperationTimedOut
                        | RDKafkaErrorCode::RequestTimedOut
                )
            ),
            _ => false,
        }
    }
}

/// Errors surfaced to the application by the consumer side.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("cluster unavailable, check broker list {brokers}")]
    ClusterUnavailable {
        brokers: String,
        #[source]
        source: ClientError,
    },
    #[error("topic name must not be empty")]
    EmptyTopic,
    #[error("client rejected subscription change: {0}")]
    Client(#[from] ClientError),
    #[error("consumer loop already started")]
    AlreadyStarted,
    #[error("failed to spawn consumer thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("consumer loop thread panicked")]
    LoopPanicked,
    #[error(transparent)]
    Signal(#[from] SignalError),
}

/// Raised by the registry when asked to remove a selector that is not active.
#[derive(Debug, Error)]
#[error("selector {selector} is not active")]
pub struct SelectorNotFound {
    pub selector: TopicSelector,
}

/// Raised at dispatch time when a fetched message's topic has no bound callback.
#[derive(Debug, Error)]
#[error("no callback registered for topic {topic}")]
pub struct CallbackNotRegistered {
    pub topic: String,
}

/// Everything that can abort one pass of the consumer loop. All of these are
/// recovered by backing off and fetching again.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("fetch failed: {0}")]
    Fetch(#[source] ClientError),
    #[error(transparent)]
    CallbackNotRegistered(#[from] CallbackNotRegistered),
    #[error("callback for topic {topic} failed: {source:#}")]
    Callback {
        topic: String,
        source: anyhow::Error,
    },
    #[error("callback for topic {topic} panicked: {reason}")]
    CallbackPanicked { topic: String, reason: String },
    #[error("acknowledge failed for topic {topic}: {source}")]
    Acknowledge {
        topic: String,
        #[source]
        source: ClientError,
    },
}

impl LoopError {
    /// Label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            LoopError::Fetch(_) => "fetch",
            LoopError::CallbackNotRegistered(_) => "callback_not_registered",
            LoopError::Callback { .. } => "callback",
            LoopError::CallbackPanicked { .. } => "callback_panicked",
            LoopError::Acknowledge { .. } => "acknowledge",
        }
    }

    /// Defects in the application's wiring rather than broker or network trouble.
    pub fn is_defect(&self) -> bool {
        matches!(
            self,
            LoopError::CallbackNotRegistered(_) | LoopError::CallbackPanicked { .. }
        )
    }
}

/// Failure to trap the termination signal.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signal handlers must be installed from within a tokio runtime")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
    #[error("failed to install handler for signal {signal}: {source}")]
    Install {
        signal: i32,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("binary payload is not valid UTF-8")]
    NotUtf8(#[from] std::string::FromUtf8Error),
    #[error("failed to serialize: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// What actually went wrong underneath a producer error.
#[derive(Debug, Error)]
pub enum DeliveryFailure {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Errors surfaced to callers of the producer. Nothing is swallowed: every
/// send or flush failure ends up here after being logged.
#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("cluster unavailable, check broker list {brokers}")]
    ClusterUnavailable {
        brokers: String,
        #[source]
        source: ClientError,
    },
    #[error("topic name must not be empty")]
    EmptyTopic,
    #[error("broker timed out delivering to {topics:?}: {source}")]
    BrokerTimeout {
        topics: Vec<String>,
        #[source]
        source: DeliveryFailure,
    },
    #[error("failed to produce to {topics:?}: {source}")]
    ProducerFailure {
        topics: Vec<String>,
        #[source]
        source: DeliveryFailure,
    },
}

impl ProducerError {
    /// Splits a failure into the timeout / everything-else classes.
    pub(crate) fn classify(topics: Vec<String>, source: DeliveryFailure) -> Self {
        let timed_out = matches!(&source, DeliveryFailure::Client(e) if e.is_timeout());
        if timed_out {
            ProducerError::BrokerTimeout { topics, source }
        } else {
            ProducerError::ProducerFailure { topics, source }
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProducerError::BrokerTimeout { .. })
    }

    /// Topics affected by the failure, empty for construction-time errors.
    pub fn topics(&self) -> &[String] {
        match self {
            ProducerError::BrokerTimeout { topics, .. }
            | ProducerError::ProducerFailure { topics, .. } => topics,
            _ => &[],
        }
    }
}
