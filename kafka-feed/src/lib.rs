//! Resilient Kafka feeds: a threaded consumer that dispatches messages to
//! per-topic callbacks and survives transient errors until told to stop, and
//! a producer with sync or buffered delivery and classified failures.

pub mod client;
pub mod config;
pub mod consumer;
pub mod encode;
pub mod error;
pub mod kafka_consumer;
pub mod kafka_producer;
pub mod message;
mod metrics_consts;
pub mod producer;
pub mod registry;
pub mod shutdown;

pub use consumer::{ConsumerHandle, ExitAction, FeedConsumer, LoopOptions, LoopStats};
pub use error::{ClientError, ConsumerError, LoopError, ProducerError};
pub use message::{FeedMessage, OutgoingMessage, Payload, TopicSelector};
pub use producer::{DeliveryMode, FeedProducer, ProducerOptions};
pub use registry::{callback, Callback, SharedCallback, SubscriptionRegistry};
pub use shutdown::ShutdownSignal;
