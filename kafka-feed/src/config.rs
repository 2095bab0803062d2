use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String, // Initial brokers, not necessarily the whole cluster

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "10000")]
    pub kafka_metadata_timeout_ms: u64, // How long the startup ping waits before declaring the cluster unavailable
}

impl KafkaConfig {
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_metadata_timeout_ms)
    }
}

/// Where a consumer group starts when it has no committed offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OffsetReset {
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

impl fmt::Display for OffsetReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OffsetReset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" | "smallest" => Ok(OffsetReset::Earliest),
            "latest" | "largest" => Ok(OffsetReset::Latest),
            other => Err(format!("unknown offset reset policy: {other}")),
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    pub kafka_consumer_group: String,

    // Fresh messages only unless asked otherwise
    #[envconfig(default = "latest")]
    pub kafka_consumer_offset_reset: OffsetReset,

    #[envconfig(default = "true")]
    pub kafka_consumer_auto_commit: bool,

    #[envconfig(default = "1000")]
    pub kafka_consumer_auto_commit_interval_ms: u32,

    // Upper bound on one poll; an idle poll returns an empty batch
    #[envconfig(default = "1000")]
    pub kafka_consumer_fetch_timeout_ms: u64,

    #[envconfig(default = "500")]
    pub kafka_consumer_max_batch_size: usize,

    #[envconfig(default = "1000")]
    pub feed_consumer_backoff_ms: u64,

    // SIGTERM
    #[envconfig(default = "15")]
    pub feed_consumer_kill_signal: i32,

    // Terminate the whole process after the final commit, not just the loop thread
    #[envconfig(default = "true")]
    pub feed_consumer_exit_process: bool,
}

impl ConsumerConfig {
    pub fn new(consumer_group: &str) -> Self {
        Self {
            kafka_consumer_group: consumer_group.to_owned(),
            kafka_consumer_offset_reset: OffsetReset::Latest,
            kafka_consumer_auto_commit: true,
            kafka_consumer_auto_commit_interval_ms: 1000,
            kafka_consumer_fetch_timeout_ms: 1000,
            kafka_consumer_max_batch_size: 500,
            feed_consumer_backoff_ms: 1000,
            feed_consumer_kill_signal: 15,
            feed_consumer_exit_process: true,
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_consumer_fetch_timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.feed_consumer_backoff_ms)
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct ProducerConfig {
    #[envconfig(default = "3")]
    pub kafka_producer_retries: u32,

    // Buffer sends until an explicit flush instead of flushing on every call
    #[envconfig(default = "false")]
    pub kafka_producer_async: bool,

    // Only used if the broker can't tell us its version
    #[envconfig(default = "0.10.0")]
    pub kafka_producer_api_version: String,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "30000")]
    pub kafka_producer_flush_timeout_ms: u64,

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            kafka_producer_retries: 3,
            kafka_producer_async: false,
            kafka_producer_api_version: "0.10.0".to_string(),
            kafka_producer_linger_ms: 20,
            kafka_message_timeout_ms: 20000,
            kafka_producer_flush_timeout_ms: 30000,
            kafka_compression_codec: "none".to_string(),
        }
    }
}

impl ProducerConfig {
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_producer_flush_timeout_ms)
    }
}
