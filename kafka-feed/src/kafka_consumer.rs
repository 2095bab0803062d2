use std::collections::HashSet;
use std::time::Duration;

use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use crate::client::ConsumerClient;
use crate::config::{ConsumerConfig, KafkaConfig};
use crate::error::ClientError;
use crate::message::{FeedMessage, TopicSelector};

/// [`ConsumerClient`] backed by an rdkafka `BaseConsumer` with manual
/// assignment. Offsets are stored on acknowledge and committed by rdkafka's
/// auto-commit timer, or explicitly on shutdown.
pub struct KafkaConsumerClient {
    consumer: BaseConsumer,
    brokers: String,
    fetch_timeout: Duration,
    metadata_timeout: Duration,
    max_batch_size: usize,
}

impl KafkaConsumerClient {
    pub fn new(common_config: &KafkaConfig, config: &ConsumerConfig) -> Result<Self, ClientError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &common_config.kafka_hosts)
            .set("group.id", &config.kafka_consumer_group)
            .set(
                "auto.offset.reset",
                config.kafka_consumer_offset_reset.as_str(),
            )
            .set(
                "enable.auto.commit",
                config.kafka_consumer_auto_commit.to_string(),
            )
            .set(
                "auto.commit.interval.ms",
                config.kafka_consumer_auto_commit_interval_ms.to_string(),
            )
            // Only acknowledged messages are eligible for commit
            .set("enable.auto.offset.store", "false");

        if common_config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let consumer: BaseConsumer = client_config.create()?;

        let client = Self {
            consumer,
            brokers: common_config.kafka_hosts.clone(),
            fetch_timeout: config.fetch_timeout(),
            metadata_timeout: common_config.metadata_timeout(),
            max_batch_size: config.kafka_consumer_max_batch_size.max(1),
        };
        client.ping()?;
        Ok(client)
    }

    // "Ping" the Kafka brokers by requesting metadata
    fn ping(&self) -> Result<(), ClientError> {
        match self.consumer.fetch_metadata(None, self.metadata_timeout) {
            Ok(metadata) => {
                info!(
                    "Successfully connected to Kafka brokers. Found {} topics.",
                    metadata.topics().len()
                );
                Ok(())
            }
            Err(error) => Err(ClientError::ClusterUnavailable {
                brokers: self.brokers.clone(),
                reason: error.to_string(),
            }),
        }
    }

    fn partitions_of(&self, topic: &str) -> Result<Vec<i32>, ClientError> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(topic), self.metadata_timeout)?;

        let found = metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic)
            .ok_or_else(|| ClientError::UnknownTopic(topic.to_owned()))?;

        if let Some(err) = found.error() {
            return Err(ClientError::Other(format!(
                "metadata error for topic {topic}: {err:?}"
            )));
        }

        let partitions: Vec<i32> = found.partitions().iter().map(|p| p.id()).collect();
        if partitions.is_empty() {
            return Err(ClientError::UnknownTopic(topic.to_owned()));
        }
        Ok(partitions)
    }
}

impl ConsumerClient for KafkaConsumerClient {
    fn set_active_selectors(&self, selectors: &[TopicSelector]) -> Result<(), ClientError> {
        if selectors.is_empty() {
            self.consumer.unassign()?;
            return Ok(());
        }

        let mut assignment = TopicPartitionList::new();
        for (topic, partition) in assigned_partitions(selectors, |t| self.partitions_of(t))? {
            assignment.add_partition_offset(&topic, partition, Offset::Stored)?;
        }

        debug!(assignment = ?assignment, "assigning partitions");
        self.consumer.assign(&assignment)?;
        Ok(())
    }

    fn ensure_topic_exists(&self, topic: &str) -> Result<(), ClientError> {
        self.partitions_of(topic).map(|_| ())
    }

    fn fetch_next_batch(&self) -> Result<Vec<FeedMessage>, ClientError> {
        let mut batch = Vec::new();

        match self.consumer.poll(self.fetch_timeout) {
            None => return Ok(batch),
            Some(Err(KafkaError::PartitionEOF(_))) => return Ok(batch),
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(message)) => batch.push(to_feed_message(&message)),
        }

        // Drain whatever is already buffered without waiting for more
        while batch.len() < self.max_batch_size {
            match self.consumer.poll(Duration::ZERO) {
                Some(Ok(message)) => batch.push(to_feed_message(&message)),
                Some(Err(KafkaError::PartitionEOF(_))) | None => break,
                Some(Err(e)) => {
                    // Surfaces again on the next poll if it persists
                    warn!(error = %e, batch_size = batch.len(), "kafka error while draining batch");
                    break;
                }
            }
        }

        Ok(batch)
    }

    fn acknowledge(&self, message: &FeedMessage) -> Result<(), ClientError> {
        self.consumer
            .store_offset(&message.topic, message.partition, message.offset + 1)?;
        Ok(())
    }

    fn commit(&self) -> Result<(), ClientError> {
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) => Ok(()),
            // Nothing acknowledged since the last commit
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Resolves selectors to distinct (topic, partition) pairs, keeping first-seen
/// order. A bare topic overlapping one of its own partition selectors must not
/// assign that partition twice; librdkafka rejects the whole assignment if so.
fn assigned_partitions<F>(
    selectors: &[TopicSelector],
    mut partitions_of: F,
) -> Result<Vec<(String, i32)>, ClientError>
where
    F: FnMut(&str) -> Result<Vec<i32>, ClientError>,
{
    let mut seen = HashSet::new();
    let mut pairs = Vec::new();
    for selector in selectors {
        let partitions = match selector.partition {
            Some(partition) => vec![partition],
            None => partitions_of(&selector.topic)?,
        };
        for partition in partitions {
            let pair = (selector.topic.clone(), partition);
            if seen.insert(pair.clone()) {
                pairs.push(pair);
            }
        }
    }
    Ok(pairs)
}

fn to_feed_message<M: Message>(message: &M) -> FeedMessage {
    FeedMessage {
        topic: message.topic().to_owned(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        value: message.payload().map(<[u8]>::to_vec),
    }
}
