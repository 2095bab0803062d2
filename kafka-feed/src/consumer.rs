//! Threaded feed consumer: topic registration plus the dispatch loop that runs
//! on its own OS thread until the exit flag is raised.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::signal::unix::SignalKind;
use tracing::{error, info, warn};

use crate::client::ConsumerClient;
use crate::config::{ConsumerConfig, KafkaConfig};
use crate::error::{ClientError, ConsumerError, LoopError};
use crate::kafka_consumer::KafkaConsumerClient;
use crate::message::{FeedMessage, TopicSelector};
use crate::metrics_consts::{
    CONSUMER_ACTIVE_SELECTORS, CONSUMER_BATCHES_FETCHED, CONSUMER_LOOP_ERRORS,
    CONSUMER_MESSAGES_DISPATCHED, CONSUMER_SELECTOR_NOT_FOUND,
};
use crate::registry::{SharedCallback, SubscriptionRegistry};
use crate::shutdown::ShutdownSignal;

pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// What the loop does once the final commit is issued.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExitAction {
    /// Exit the whole process with status 0.
    #[default]
    ExitProcess,
    /// End the loop thread and hand its stats to [`ConsumerHandle::join`].
    Return,
}

#[derive(Clone, Debug)]
pub struct LoopOptions {
    pub backoff: Duration,
    pub exit_action: ExitAction,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_BACKOFF,
            exit_action: ExitAction::default(),
        }
    }
}

impl LoopOptions {
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_exit_action(mut self, exit_action: ExitAction) -> Self {
        self.exit_action = exit_action;
        self
    }
}

impl From<&ConsumerConfig> for LoopOptions {
    fn from(config: &ConsumerConfig) -> Self {
        let exit_action = if config.feed_consumer_exit_process {
            ExitAction::ExitProcess
        } else {
            ExitAction::Return
        };
        Self {
            backoff: config.backoff(),
            exit_action,
        }
    }
}

/// Counters reported by a loop that returned instead of exiting the process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub batches: u64,
    pub dispatched: u64,
    pub recovered_errors: u64,
}

/// Subscribes to topics and runs callbacks for their messages on a dedicated
/// thread. Callbacks must tolerate redelivery: an error mid-batch abandons the
/// rest of the batch until the client hands it out again.
pub struct FeedConsumer<C: ConsumerClient = KafkaConsumerClient> {
    client: Arc<C>,
    registry: Arc<RwLock<SubscriptionRegistry>>,
    shutdown: ShutdownSignal,
    options: LoopOptions,
    started: AtomicBool,
}

impl FeedConsumer<KafkaConsumerClient> {
    /// Traps the configured kill signal and connects to the cluster. Must be
    /// called from within a tokio runtime, which keeps the signal handler alive.
    pub fn from_config(kafka: &KafkaConfig, config: &ConsumerConfig) -> Result<Self, ConsumerError> {
        let shutdown = ShutdownSignal::trap(SignalKind::from_raw(config.feed_consumer_kill_signal))?;

        let client = KafkaConsumerClient::new(kafka, config).map_err(|e| match e {
            ClientError::ClusterUnavailable { .. } => {
                error!(
                    brokers = %kafka.kafka_hosts,
                    "cluster unavailable, check broker string"
                );
                ConsumerError::ClusterUnavailable {
                    brokers: kafka.kafka_hosts.clone(),
                    source: e,
                }
            }
            other => ConsumerError::Client(other),
        })?;

        Ok(Self::new(client, shutdown, LoopOptions::from(config)))
    }
}

impl<C: ConsumerClient> FeedConsumer<C> {
    pub fn new(client: C, shutdown: ShutdownSignal, options: LoopOptions) -> Self {
        Self {
            client: Arc::new(client),
            registry: Arc::new(RwLock::new(SubscriptionRegistry::new())),
            shutdown,
            options,
            started: AtomicBool::new(false),
        }
    }

    /// Routes `topic` to `callback` and re-applies the full selector list.
    /// One callback serves the whole topic; calling this again for the same
    /// topic, with or without partitions, replaces it. If the client rejects
    /// the new list, neither the selectors nor the binding change.
    pub fn add_topic(
        &self,
        topic: &str,
        callback: SharedCallback,
        partitions: Option<&[i32]>,
    ) -> Result<(), ConsumerError> {
        if topic.is_empty() {
            return Err(ConsumerError::EmptyTopic);
        }

        self.client.ensure_topic_exists(topic)?;

        // Held across the client call so changes apply in the order they commit
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let selectors = registry.plan_add(topic, partitions);
        self.apply(&selectors)?;
        let selectors = registry.commit(selectors, Some((topic, callback)));

        match partitions {
            None => info!(topic, "added topic"),
            Some(parts) => info!(topic, partitions = ?parts, "added topic partitions"),
        }
        gauge!(CONSUMER_ACTIVE_SELECTORS).set(selectors.len() as f64);
        Ok(())
    }

    /// Deactivates the selectors for `topic`. Removing something that is not
    /// active is logged and otherwise ignored.
    pub fn remove_topic(&self, topic: &str, partitions: Option<&[i32]>) -> Result<(), ConsumerError> {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let selectors = match registry.plan_remove(topic, partitions) {
            Ok(selectors) => selectors,
            Err(e) => {
                counter!(CONSUMER_SELECTOR_NOT_FOUND).increment(1);
                error!(topic, error = %e, "no such topic, nothing removed");
                return Ok(());
            }
        };
        self.apply(&selectors)?;
        let selectors = registry.commit(selectors, None);

        info!(topic, partitions = ?partitions, "removed topic");
        gauge!(CONSUMER_ACTIVE_SELECTORS).set(selectors.len() as f64);
        Ok(())
    }

    /// Hands the full list to the client. The registry is only updated by the
    /// caller once this succeeds, so it never holds a list the client refused.
    fn apply(&self, selectors: &[TopicSelector]) -> Result<(), ConsumerError> {
        self.client.set_active_selectors(selectors).map_err(|e| {
            error!(error = %e, selectors = selectors.len(), "client rejected selector list, keeping previous one");
            ConsumerError::Client(e)
        })
    }

    pub fn active_selectors(&self) -> Vec<TopicSelector> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .selectors()
            .to_vec()
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Spawns the dispatch loop. Topics can still be added or removed afterwards.
    pub fn start(&self) -> Result<ConsumerHandle, ConsumerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ConsumerError::AlreadyStarted);
        }

        let dispatch = ConsumerLoop {
            client: self.client.clone(),
            registry: self.registry.clone(),
            shutdown: self.shutdown.clone(),
            options: self.options.clone(),
            stats: LoopStats::default(),
        };

        let thread = thread::Builder::new()
            .name("feed-consumer".into())
            .spawn(move || dispatch.run())
            .map_err(ConsumerError::Spawn)?;

        Ok(ConsumerHandle {
            thread,
            shutdown: self.shutdown.clone(),
        })
    }
}

/// Handle on a running loop.
pub struct ConsumerHandle {
    thread: JoinHandle<LoopStats>,
    shutdown: ShutdownSignal,
}

impl ConsumerHandle {
    /// Raises the exit flag, same as receiving the kill signal.
    pub fn stop(&self) {
        self.shutdown.trigger();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Waits for the loop to return. Only returns for [`ExitAction::Return`];
    /// with [`ExitAction::ExitProcess`] the process ends first.
    pub fn join(self) -> Result<LoopStats, ConsumerError> {
        self.thread.join().map_err(|_| ConsumerError::LoopPanicked)
    }
}

enum Flow {
    Continue,
    Exit,
}

struct ConsumerLoop<C> {
    client: Arc<C>,
    registry: Arc<RwLock<SubscriptionRegistry>>,
    shutdown: ShutdownSignal,
    options: LoopOptions,
    stats: LoopStats,
}

impl<C: ConsumerClient> ConsumerLoop<C> {
    fn run(mut self) -> LoopStats {
        info!(backoff_ms = self.options.backoff.as_millis() as u64, "feed consumer loop started");

        loop {
            match self.poll_batch() {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit) => return self.terminate(),
                Err(e) => {
                    report(&e);
                    self.stats.recovered_errors += 1;
                    thread::sleep(self.options.backoff);
                    if self.shutdown.is_triggered() {
                        return self.terminate();
                    }
                }
            }
        }
    }

    /// One fetch-dispatch pass. The flag is checked after every message and
    /// again after the batch, so an empty batch still observes it.
    fn poll_batch(&mut self) -> Result<Flow, LoopError> {
        let batch = self.client.fetch_next_batch().map_err(LoopError::Fetch)?;
        self.stats.batches += 1;
        counter!(CONSUMER_BATCHES_FETCHED).increment(1);

        for message in &batch {
            self.dispatch(message)?;
            self.client
                .acknowledge(message)
                .map_err(|source| LoopError::Acknowledge {
                    topic: message.topic.clone(),
                    source,
                })?;
            if self.shutdown.is_triggered() {
                return Ok(Flow::Exit);
            }
        }

        if self.shutdown.is_triggered() {
            return Ok(Flow::Exit);
        }
        Ok(Flow::Continue)
    }

    fn dispatch(&mut self, message: &FeedMessage) -> Result<(), LoopError> {
        // The read guard is released before the callback runs, so callbacks
        // may add or remove topics themselves.
        let callback = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .callback(&message.topic)?;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            callback.call(message.key(), message.value())
        }));

        match outcome {
            Ok(Ok(())) => {
                self.stats.dispatched += 1;
                counter!(CONSUMER_MESSAGES_DISPATCHED, "topic" => message.topic.clone())
                    .increment(1);
                Ok(())
            }
            Ok(Err(source)) => Err(LoopError::Callback {
                topic: message.topic.clone(),
                source,
            }),
            Err(payload) => Err(LoopError::CallbackPanicked {
                topic: message.topic.clone(),
                reason: panic_reason(&*payload),
            }),
        }
    }

    fn terminate(self) -> LoopStats {
        info!("exit requested, committing offsets");
        if let Err(e) = self.client.commit() {
            error!(error = %e, "final commit failed");
        }

        match self.options.exit_action {
            ExitAction::ExitProcess => {
                info!("feed consumer terminating process");
                std::process::exit(0)
            }
            ExitAction::Return => {
                info!(
                    batches = self.stats.batches,
                    dispatched = self.stats.dispatched,
                    recovered_errors = self.stats.recovered_errors,
                    "feed consumer loop stopped"
                );
                self.stats
            }
        }
    }
}

fn report(err: &LoopError) {
    counter!(CONSUMER_LOOP_ERRORS, "kind" => err.kind()).increment(1);
    if err.is_defect() {
        error!(kind = err.kind(), error = %err, "consumer loop defect, backing off");
    } else {
        warn!(kind = err.kind(), error = %err, "consumer loop error, backing off");
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
