//! Publishing side: encodes records, hands them to the client and classifies
//! what goes wrong. Every failure is logged and returned to the caller.

use std::sync::{Arc, Mutex, PoisonError};

use metrics::counter;
use tracing::{debug, error};

use crate::client::ProducerClient;
use crate::config::{KafkaConfig, ProducerConfig};
use crate::encode::{Encoder, SafeEncoder};
use crate::error::{ClientError, DeliveryFailure, ProducerError};
use crate::kafka_producer::KafkaProducerClient;
use crate::message::OutgoingMessage;
use crate::metrics_consts::{PRODUCER_ERRORS, PRODUCER_FLUSHES, PRODUCER_MESSAGES_SUBMITTED};

/// Whether `send` waits for delivery.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Flush after every `send`; failures surface on the call that caused them.
    #[default]
    Sync,
    /// Buffer until [`FeedProducer::flush`]; a failure reported there may
    /// belong to any send since the previous flush.
    Async,
}

#[derive(Clone)]
pub struct ProducerOptions {
    pub retries: u32,
    pub mode: DeliveryMode,
    pub key_encoder: Arc<dyn Encoder>,
    pub value_encoder: Arc<dyn Encoder>,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            mode: DeliveryMode::Sync,
            key_encoder: Arc::new(SafeEncoder),
            value_encoder: Arc::new(SafeEncoder),
        }
    }
}

impl From<&ProducerConfig> for ProducerOptions {
    fn from(config: &ProducerConfig) -> Self {
        let mode = if config.kafka_producer_async {
            DeliveryMode::Async
        } else {
            DeliveryMode::Sync
        };
        Self {
            retries: config.kafka_producer_retries,
            mode,
            ..Self::default()
        }
    }
}

/// Not internally serialized beyond what the client itself tolerates; callers
/// sharing one producer across threads should expect interleaved batches.
pub struct FeedProducer<C: ProducerClient = KafkaProducerClient> {
    client: C,
    options: ProducerOptions,
    // Topics with sends not yet covered by a flush
    pending: Mutex<Vec<String>>,
}

impl FeedProducer<KafkaProducerClient> {
    pub fn from_config(kafka: &KafkaConfig, config: &ProducerConfig) -> Result<Self, ProducerError> {
        let client = KafkaProducerClient::new(kafka, config).map_err(|e| {
            error!(brokers = %kafka.kafka_hosts, error = %e, "producer constructor error");
            match e {
                ClientError::ClusterUnavailable { .. } => ProducerError::ClusterUnavailable {
                    brokers: kafka.kafka_hosts.clone(),
                    source: e,
                },
                other => ProducerError::ProducerFailure {
                    topics: Vec::new(),
                    source: other.into(),
                },
            }
        })?;

        Ok(Self::new(client, ProducerOptions::from(config)))
    }
}

impl<C: ProducerClient> FeedProducer<C> {
    pub fn new(client: C, options: ProducerOptions) -> Self {
        Self {
            client,
            options,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn with_key_encoder(mut self, encoder: impl Encoder + 'static) -> Self {
        self.options.key_encoder = Arc::new(encoder);
        self
    }

    pub fn with_value_encoder(mut self, encoder: impl Encoder + 'static) -> Self {
        self.options.value_encoder = Arc::new(encoder);
        self
    }

    /// Retry count handed to the client at construction.
    pub fn retries(&self) -> u32 {
        self.options.retries
    }

    pub fn mode(&self) -> DeliveryMode {
        self.options.mode
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Submits `messages` to `topic` in order, then flushes unless running in
    /// [`DeliveryMode::Async`]. Stops at the first message that fails to encode
    /// or submit; earlier ones stay buffered.
    pub fn send<I>(&self, topic: &str, messages: I) -> Result<(), ProducerError>
    where
        I: IntoIterator,
        I::Item: Into<OutgoingMessage>,
    {
        if topic.is_empty() {
            return Err(ProducerError::EmptyTopic);
        }

        self.mark_pending(topic);

        let mut submitted = 0usize;
        for message in messages {
            if let Err(source) = self.submit(topic, message.into()) {
                return Err(self.fail(vec![topic.to_owned()], source));
            }
            submitted += 1;
        }
        counter!(PRODUCER_MESSAGES_SUBMITTED, "topic" => topic.to_owned())
            .increment(submitted as u64);

        debug!(topic, submitted, mode = ?self.options.mode, "about to flush");

        match self.options.mode {
            DeliveryMode::Sync => self.flush(),
            DeliveryMode::Async => Ok(()),
        }
    }

    /// Blocks until everything buffered so far is delivered or has failed.
    pub fn flush(&self) -> Result<(), ProducerError> {
        let topics = std::mem::take(&mut *self.pending_topics());

        match self.client.flush() {
            Ok(()) => {
                counter!(PRODUCER_FLUSHES, "outcome" => "ok").increment(1);
                Ok(())
            }
            Err(e) => {
                counter!(PRODUCER_FLUSHES, "outcome" => "error").increment(1);
                Err(self.fail(topics, e.into()))
            }
        }
    }

    fn submit(&self, topic: &str, message: OutgoingMessage) -> Result<(), DeliveryFailure> {
        let key = message
            .key
            .as_ref()
            .map(|k| self.options.key_encoder.encode(k))
            .transpose()?;
        let value = self.options.value_encoder.encode(&message.value)?;

        self.client.send(topic, key.as_deref(), &value)?;
        Ok(())
    }

    fn mark_pending(&self, topic: &str) {
        let mut pending = self.pending_topics();
        if !pending.iter().any(|t| t == topic) {
            pending.push(topic.to_owned());
        }
    }

    fn pending_topics(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fail(&self, topics: Vec<String>, source: DeliveryFailure) -> ProducerError {
        let err = ProducerError::classify(topics, source);
        if err.is_timeout() {
            counter!(PRODUCER_ERRORS, "class" => "timeout").increment(1);
            error!(topics = ?err.topics(), error = %err, "broker timeout while producing");
        } else {
            counter!(PRODUCER_ERRORS, "class" => "failure").increment(1);
            error!(topics = ?err.topics(), error = %err, "failed to produce");
        }
        err
    }
}
