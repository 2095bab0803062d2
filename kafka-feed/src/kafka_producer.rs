use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer};
use rdkafka::{ClientConfig, ClientContext};
use tracing::{debug, error, info};

use crate::client::ProducerClient;
use crate::config::{KafkaConfig, ProducerConfig};
use crate::error::ClientError;

/// Collects delivery failures reported by rdkafka's background thread so the
/// next flush can surface them.
#[derive(Default)]
pub struct FeedProducerContext {
    failures: Mutex<Vec<(String, KafkaError)>>,
}

impl FeedProducerContext {
    fn take_failures(&self) -> Vec<(String, KafkaError)> {
        std::mem::take(&mut *self.failures.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl ClientContext for FeedProducerContext {}

impl ProducerContext for FeedProducerContext {
    type DeliveryOpaque = ();

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, _: Self::DeliveryOpaque) {
        if let Err((err, message)) = delivery_result {
            let topic = message.topic().to_owned();
            error!(topic = %topic, error = %err, "failed to deliver message");
            self.failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((topic, err.clone()));
        }
    }
}

/// [`ProducerClient`] backed by an rdkafka `ThreadedProducer`.
pub struct KafkaProducerClient {
    producer: ThreadedProducer<FeedProducerContext>,
    flush_timeout: Duration,
}

impl KafkaProducerClient {
    pub fn new(common_config: &KafkaConfig, config: &ProducerConfig) -> Result<Self, ClientError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &common_config.kafka_hosts)
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set(
                "message.send.max.retries",
                config.kafka_producer_retries.to_string(),
            )
            .set("broker.version.fallback", &config.kafka_producer_api_version)
            .set(
                "compression.codec",
                config.kafka_compression_codec.to_owned(),
            );

        if common_config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let producer: ThreadedProducer<FeedProducerContext> =
            client_config.create_with_context(FeedProducerContext::default())?;

        // "Ping" the Kafka brokers by requesting metadata
        match producer
            .client()
            .fetch_metadata(None, common_config.metadata_timeout())
        {
            Ok(metadata) => {
                info!(
                    "Successfully connected to Kafka brokers. Found {} topics.",
                    metadata.topics().len()
                );
            }
            Err(error) => {
                return Err(ClientError::ClusterUnavailable {
                    brokers: common_config.kafka_hosts.clone(),
                    reason: error.to_string(),
                });
            }
        }

        Ok(Self {
            producer,
            flush_timeout: config.flush_timeout(),
        })
    }
}

impl ProducerClient for KafkaProducerClient {
    fn send(&self, topic: &str, key: Option<&[u8]>, value: &[u8]) -> Result<(), ClientError> {
        let mut record: BaseRecord<'_, [u8], [u8]> = BaseRecord::to(topic).payload(value);
        if let Some(key) = key {
            record = record.key(key);
        }

        self.producer.send(record).map_err(|(e, _)| ClientError::from(e))
    }

    fn flush(&self) -> Result<(), ClientError> {
        let flushed = self.producer.flush(self.flush_timeout);
        let mut failures = self.producer.context().take_failures();

        flushed?;

        if failures.is_empty() {
            return Ok(());
        }
        let failed = failures.len();
        let (topic, first) = failures.swap_remove(0);
        debug!(failed, topic = %topic, "reporting first delivery failure since last flush");
        Err(first.into())
    }
}
