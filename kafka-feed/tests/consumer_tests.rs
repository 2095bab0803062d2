use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use kafka_feed::test::FakeConsumerClient;
use kafka_feed::{
    callback, ClientError, ConsumerError, ExitAction, FeedConsumer, FeedMessage, LoopOptions,
    SharedCallback, ShutdownSignal, TopicSelector,
};
use tracing_subscriber::fmt::MakeWriter;

type Seen = Arc<Mutex<Vec<(Option<Vec<u8>>, Option<Vec<u8>>)>>>;

fn options() -> LoopOptions {
    LoopOptions::default()
        .with_backoff(Duration::from_millis(5))
        .with_exit_action(ExitAction::Return)
}

fn recorder() -> (SharedCallback, Seen) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let cb = callback(move |key, value| {
        sink.lock()
            .unwrap()
            .push((key.map(<[u8]>::to_vec), value.map(<[u8]>::to_vec)));
        Ok(())
    });
    (cb, seen)
}

fn msg(topic: &str, key: &str, value: &str, offset: i64) -> FeedMessage {
    FeedMessage::new(topic, Some(key.as_bytes()), Some(value.as_bytes())).at(0, offset)
}

fn last_applied(consumer: &FeedConsumer<FakeConsumerClient>) -> Vec<TopicSelector> {
    consumer.client().applied().last().cloned().unwrap_or_default()
}

/// Collects formatted log lines written on the current thread.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn during<T>(f: impl FnOnce() -> T) -> (T, String) {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();
        let out = tracing::subscriber::with_default(subscriber, f);
        let text = String::from_utf8_lossy(&logs.0.lock().unwrap()).into_owned();
        (out, text)
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn pair(key: &str, value: &str) -> (Option<Vec<u8>>, Option<Vec<u8>>) {
    (Some(key.as_bytes().to_vec()), Some(value.as_bytes().to_vec()))
}

#[test]
fn dispatches_acknowledges_and_keeps_running() {
    let shutdown = ShutdownSignal::new();
    let client = FakeConsumerClient::new()
        .with_batch(vec![msg("orders", "k1", "v1", 0)])
        .stop_when_drained(shutdown.clone());
    let consumer = FeedConsumer::new(client, shutdown, options());
    let (cb, seen) = recorder();
    consumer.add_topic("orders", cb, None).unwrap();

    let stats = consumer.start().unwrap().join().unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![pair("k1", "v1")]);
    assert_eq!(consumer.client().acknowledged(), vec![msg("orders", "k1", "v1", 0)]);
    // The flag was clear after the first batch, so the loop fetched again
    assert_eq!(consumer.client().fetches(), 2);
    assert_eq!(consumer.client().commits(), 1);
    assert_eq!(stats.dispatched, 1);
    assert_eq!(stats.recovered_errors, 0);
}

#[test]
fn callbacks_fire_in_delivery_order() {
    let shutdown = ShutdownSignal::new();
    let client = FakeConsumerClient::new()
        .with_batch(vec![
            msg("orders", "a", "1", 0),
            msg("payments", "b", "2", 0),
            msg("orders", "c", "3", 1),
        ])
        .stop_when_drained(shutdown.clone());
    let consumer = FeedConsumer::new(client, shutdown, options());
    let (cb, seen) = recorder();
    consumer.add_topic("orders", cb.clone(), None).unwrap();
    consumer.add_topic("payments", cb, None).unwrap();

    consumer.start().unwrap().join().unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![pair("a", "1"), pair("b", "2"), pair("c", "3")]
    );
    assert_eq!(consumer.client().acknowledged().len(), 3);
}

#[test]
fn unregistered_topic_backs_off_once_and_resumes() {
    let shutdown = ShutdownSignal::new();
    let client = FakeConsumerClient::new()
        .with_batch(vec![msg("ghost", "g", "boo", 0)])
        .with_batch(vec![msg("orders", "k1", "v1", 0)])
        .stop_when_drained(shutdown.clone());
    let consumer = FeedConsumer::new(client, shutdown, options());
    let (cb, seen) = recorder();
    consumer.add_topic("orders", cb, None).unwrap();

    let stats = consumer.start().unwrap().join().unwrap();

    assert_eq!(stats.recovered_errors, 1);
    assert_eq!(*seen.lock().unwrap(), vec![pair("k1", "v1")]);
    assert_eq!(
        consumer.client().acknowledged(),
        vec![msg("orders", "k1", "v1", 0)]
    );
}

#[test]
fn callback_error_abandons_rest_of_batch_until_redelivery() {
    let shutdown = ShutdownSignal::new();
    let batch = vec![msg("orders", "k1", "v1", 0), msg("orders", "k2", "v2", 1)];
    let client = FakeConsumerClient::new()
        .with_batch(batch.clone())
        .with_batch(batch)
        .stop_when_drained(shutdown.clone());
    let consumer = FeedConsumer::new(client, shutdown, options());

    let attempts = Arc::new(Mutex::new(Vec::new()));
    let log = attempts.clone();
    let failed_once = Arc::new(Mutex::new(false));
    consumer
        .add_topic(
            "orders",
            callback(move |key, _| {
                let key = String::from_utf8_lossy(key.unwrap_or_default()).to_string();
                log.lock().unwrap().push(key);
                let mut failed = failed_once.lock().unwrap();
                if !*failed {
                    *failed = true;
                    return Err(anyhow!("downstream unavailable"));
                }
                Ok(())
            }),
            None,
        )
        .unwrap();

    let stats = consumer.start().unwrap().join().unwrap();

    // k2 is skipped on the failed pass and only seen on redelivery
    assert_eq!(*attempts.lock().unwrap(), vec!["k1", "k1", "k2"]);
    assert_eq!(stats.recovered_errors, 1);
    assert_eq!(stats.dispatched, 2);
    assert_eq!(consumer.client().acknowledged().len(), 2);
}

#[test]
fn callback_panic_is_contained() {
    let shutdown = ShutdownSignal::new();
    let client = FakeConsumerClient::new()
        .with_batch(vec![msg("explode", "k", "v", 0)])
        .with_batch(vec![msg("orders", "k1", "v1", 0)])
        .stop_when_drained(shutdown.clone());
    let consumer = FeedConsumer::new(client, shutdown, options());
    let (cb, seen) = recorder();
    consumer.add_topic("orders", cb, None).unwrap();
    consumer
        .add_topic("explode", callback(|_, _| panic!("bad callback")), None)
        .unwrap();

    let stats = consumer.start().unwrap().join().unwrap();

    assert_eq!(stats.recovered_errors, 1);
    assert_eq!(*seen.lock().unwrap(), vec![pair("k1", "v1")]);
}

#[test]
fn fetch_errors_are_retried_after_backoff() {
    let shutdown = ShutdownSignal::new();
    let client = FakeConsumerClient::new()
        .with_fetch_error(ClientError::Other("broker transport failure".to_string()))
        .with_fetch_error(ClientError::Timeout("fetch".to_string()))
        .with_batch(vec![msg("orders", "k1", "v1", 0)])
        .stop_when_drained(shutdown.clone());
    let consumer = FeedConsumer::new(client, shutdown, options());
    let (cb, seen) = recorder();
    consumer.add_topic("orders", cb, None).unwrap();

    let stats = consumer.start().unwrap().join().unwrap();

    assert_eq!(stats.recovered_errors, 2);
    assert_eq!(*seen.lock().unwrap(), vec![pair("k1", "v1")]);
}

#[test]
fn exit_flag_mid_batch_commits_once_and_stops_dispatching() {
    let shutdown = ShutdownSignal::new();
    let client = FakeConsumerClient::new().with_batch(vec![
        msg("orders", "k1", "v1", 0),
        msg("orders", "k2", "v2", 1),
        msg("orders", "k3", "v3", 2),
    ]);
    let consumer = FeedConsumer::new(client, shutdown.clone(), options());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    consumer
        .add_topic(
            "orders",
            callback(move |key, _| {
                sink.lock().unwrap().push(key.map(<[u8]>::to_vec));
                shutdown.trigger();
                Ok(())
            }),
            None,
        )
        .unwrap();

    let stats = consumer.start().unwrap().join().unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![Some(b"k1".to_vec())]);
    assert_eq!(consumer.client().acknowledged().len(), 1);
    assert_eq!(consumer.client().commits(), 1);
    assert_eq!(consumer.client().fetches(), 1);
    assert_eq!(stats.dispatched, 1);
}

#[test]
fn exit_flag_is_honoured_while_fetches_keep_failing() {
    let shutdown = ShutdownSignal::new();
    let client = FakeConsumerClient::new()
        .with_fetch_error(ClientError::Other("no route to host".to_string()));
    let consumer = FeedConsumer::new(client, shutdown.clone(), options());
    shutdown.trigger();

    let stats = consumer.start().unwrap().join().unwrap();

    assert_eq!(stats.recovered_errors, 1);
    assert_eq!(consumer.client().fetches(), 1);
    assert_eq!(consumer.client().commits(), 1);
}

#[test]
fn stop_from_handle_ends_an_idle_loop() {
    let consumer = FeedConsumer::new(FakeConsumerClient::new(), ShutdownSignal::new(), options());
    let handle = consumer.start().unwrap();
    assert!(!handle.is_finished());

    handle.stop();
    while !handle.is_finished() {
        thread::sleep(Duration::from_millis(1));
    }
    let stats = handle.join().unwrap();

    assert_eq!(stats.dispatched, 0);
    assert_eq!(consumer.client().commits(), 1);
}

#[test]
fn add_and_remove_reapply_the_whole_selector_list() {
    let consumer = FeedConsumer::new(FakeConsumerClient::new(), ShutdownSignal::new(), options());
    let (cb, _) = recorder();

    consumer.add_topic("orders", cb.clone(), None).unwrap();
    consumer
        .add_topic("payments", cb.clone(), Some(&[0, 1]))
        .unwrap();
    consumer.remove_topic("payments", Some(&[1])).unwrap();

    assert_eq!(
        consumer.client().applied(),
        vec![
            vec![TopicSelector::topic("orders")],
            vec![
                TopicSelector::topic("orders"),
                TopicSelector::partition("payments", 0),
                TopicSelector::partition("payments", 1),
            ],
            vec![
                TopicSelector::topic("orders"),
                TopicSelector::partition("payments", 0),
            ],
        ]
    );
    assert_eq!(consumer.client().ensured(), vec!["orders", "payments"]);
}

#[test]
fn removing_an_unknown_topic_is_a_logged_no_op() {
    let consumer = FeedConsumer::new(FakeConsumerClient::new(), ShutdownSignal::new(), options());
    let (cb, _) = recorder();
    consumer.add_topic("orders", cb, None).unwrap();

    let (removed, logs) = CapturedLogs::during(|| consumer.remove_topic("ghost", None));

    removed.unwrap();
    let line = logs
        .lines()
        .find(|l| l.contains("no such topic, nothing removed"))
        .expect("removal of an inactive topic was not logged");
    assert!(line.contains("ERROR"));
    assert!(line.contains("ghost"));
    assert_eq!(consumer.client().applied().len(), 1);
    assert_eq!(
        consumer.active_selectors(),
        vec![TopicSelector::topic("orders")]
    );
}

#[test]
fn rejected_add_keeps_the_previous_list_and_binding() {
    let consumer = FeedConsumer::new(FakeConsumerClient::new(), ShutdownSignal::new(), options());
    let (cb, _) = recorder();
    consumer.add_topic("orders", cb.clone(), None).unwrap();

    consumer
        .client()
        .reject_next_apply(ClientError::Other("assignment refused".to_string()));
    let err = consumer.add_topic("payments", cb.clone(), None).unwrap_err();

    assert!(matches!(err, ConsumerError::Client(ClientError::Other(_))));
    assert_eq!(consumer.active_selectors(), last_applied(&consumer));
    assert_eq!(
        consumer.active_selectors(),
        vec![TopicSelector::topic("orders")]
    );

    // The refused list is not resent with the next change
    consumer.add_topic("refunds", cb, None).unwrap();
    assert_eq!(
        last_applied(&consumer),
        vec![TopicSelector::topic("orders"), TopicSelector::topic("refunds")]
    );
    assert_eq!(consumer.active_selectors(), last_applied(&consumer));
}

#[test]
fn rejected_remove_keeps_the_previous_list() {
    let consumer = FeedConsumer::new(FakeConsumerClient::new(), ShutdownSignal::new(), options());
    let (cb, _) = recorder();
    consumer.add_topic("orders", cb.clone(), None).unwrap();
    consumer.add_topic("payments", cb, Some(&[0, 1])).unwrap();

    consumer
        .client()
        .reject_next_apply(ClientError::Timeout("assign".to_string()));
    assert!(consumer.remove_topic("payments", Some(&[1])).is_err());

    assert_eq!(consumer.active_selectors(), last_applied(&consumer));
    assert_eq!(consumer.active_selectors().len(), 3);

    consumer.remove_topic("payments", Some(&[1])).unwrap();
    assert_eq!(
        last_applied(&consumer),
        vec![
            TopicSelector::topic("orders"),
            TopicSelector::partition("payments", 0),
        ]
    );
}

#[test]
fn rejected_add_does_not_rebind_the_callback() {
    let shutdown = ShutdownSignal::new();
    let client = FakeConsumerClient::new()
        .with_batch(vec![msg("orders", "k1", "v1", 0)])
        .stop_when_drained(shutdown.clone());
    let consumer = FeedConsumer::new(client, shutdown, options());
    let (kept, kept_seen) = recorder();
    let (refused, refused_seen) = recorder();
    consumer.add_topic("orders", kept, None).unwrap();

    consumer
        .client()
        .reject_next_apply(ClientError::Other("assignment refused".to_string()));
    assert!(consumer.add_topic("orders", refused, Some(&[0])).is_err());

    consumer.start().unwrap().join().unwrap();

    assert_eq!(*kept_seen.lock().unwrap(), vec![pair("k1", "v1")]);
    assert!(refused_seen.lock().unwrap().is_empty());
}

#[test]
fn adding_a_missing_topic_changes_nothing() {
    let client = FakeConsumerClient::new().with_unknown_topic("nowhere");
    let consumer = FeedConsumer::new(client, ShutdownSignal::new(), options());
    let (cb, _) = recorder();

    let err = consumer.add_topic("nowhere", cb, None).unwrap_err();

    assert!(matches!(
        err,
        ConsumerError::Client(ClientError::UnknownTopic(_))
    ));
    assert!(consumer.active_selectors().is_empty());
    assert!(consumer.client().applied().is_empty());
}

#[test]
fn empty_topic_is_rejected() {
    let consumer = FeedConsumer::new(FakeConsumerClient::new(), ShutdownSignal::new(), options());
    let (cb, _) = recorder();

    assert!(matches!(
        consumer.add_topic("", cb, None),
        Err(ConsumerError::EmptyTopic)
    ));
}

#[test]
fn loop_can_only_start_once() {
    let consumer = FeedConsumer::new(FakeConsumerClient::new(), ShutdownSignal::new(), options());
    let handle = consumer.start().unwrap();

    assert!(matches!(consumer.start(), Err(ConsumerError::AlreadyStarted)));

    handle.stop();
    handle.join().unwrap();
}
