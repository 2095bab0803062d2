//! The narrow contract this crate needs from a broker client. The rdkafka
//! implementations live in `kafka_consumer` and `kafka_producer`; tests use the
//! fakes in `test`.

use crate::error::ClientError;
use crate::message::{FeedMessage, TopicSelector};

pub trait ConsumerClient: Send + Sync + 'static {
    /// Replaces the whole active selector set. There is no incremental form.
    fn set_active_selectors(&self, selectors: &[TopicSelector]) -> Result<(), ClientError>;

    fn ensure_topic_exists(&self, topic: &str) -> Result<(), ClientError>;

    /// Blocks until messages are available or the client's own poll window
    /// elapses, in which case the batch is empty.
    fn fetch_next_batch(&self) -> Result<Vec<FeedMessage>, ClientError>;

    /// Marks a message as processed so the next commit covers it.
    fn acknowledge(&self, message: &FeedMessage) -> Result<(), ClientError>;

    fn commit(&self) -> Result<(), ClientError>;
}

pub trait ProducerClient: Send + Sync {
    /// Buffers one record; delivery happens in the background.
    fn send(&self, topic: &str, key: Option<&[u8]>, value: &[u8]) -> Result<(), ClientError>;

    /// Blocks until every buffered record is delivered or has failed.
    fn flush(&self) -> Result<(), ClientError>;
}
