use kafka_feed::error::DeliveryFailure;
use kafka_feed::test::{FakeProducerClient, ProducerCall};
use kafka_feed::{ClientError, DeliveryMode, FeedProducer, OutgoingMessage, ProducerError, ProducerOptions};
use serde_json::json;

fn producer(client: FakeProducerClient, mode: DeliveryMode) -> FeedProducer<FakeProducerClient> {
    FeedProducer::new(
        client,
        ProducerOptions {
            mode,
            ..ProducerOptions::default()
        },
    )
}

#[test]
fn flush_timeout_is_a_broker_timeout_naming_the_topic() {
    let client = FakeProducerClient::new().failing_flush(ClientError::Timeout("flush".to_string()));
    let producer = producer(client, DeliveryMode::Sync);

    let err = producer.send("orders", ["m1", "m2"]).unwrap_err();

    assert!(matches!(err, ProducerError::BrokerTimeout { .. }));
    assert_eq!(err.topics(), ["orders".to_string()]);
}

#[test]
fn other_flush_errors_are_producer_failures() {
    let client = FakeProducerClient::new()
        .failing_flush(ClientError::Other("record batch too large".to_string()));
    let producer = producer(client, DeliveryMode::Sync);

    let err = producer.send("orders", ["m1"]).unwrap_err();

    match err {
        ProducerError::ProducerFailure { topics, source } => {
            assert_eq!(topics, vec!["orders".to_string()]);
            assert!(matches!(source, DeliveryFailure::Client(ClientError::Other(_))));
        }
        other => panic!("expected ProducerFailure, got {other:?}"),
    }
}

#[test]
fn async_flush_reports_every_pending_topic() {
    let client = FakeProducerClient::new().failing_flush(ClientError::Timeout("flush".to_string()));
    let producer = producer(client, DeliveryMode::Async);

    producer.send("orders", ["m1"]).unwrap();
    producer.send("payments", ["m2"]).unwrap();
    producer.send("orders", ["m3"]).unwrap();
    let err = producer.flush().unwrap_err();

    assert!(err.is_timeout());
    assert_eq!(
        err.topics(),
        ["orders".to_string(), "payments".to_string()]
    );

    // Pending topics were consumed by the failed flush
    producer.flush().unwrap();
    assert_eq!(producer.client().flush_count(), 2);
}

#[test]
fn keyed_json_records_reach_the_client_encoded() {
    let producer = producer(FakeProducerClient::new(), DeliveryMode::Sync);

    producer
        .send(
            "orders",
            [OutgoingMessage::keyed("order-1", json!({"total": 12}))],
        )
        .unwrap();

    assert_eq!(
        producer.client().calls(),
        vec![
            ProducerCall::Send {
                topic: "orders".to_string(),
                key: Some(b"order-1".to_vec()),
                value: br#"{"total":12}"#.to_vec(),
            },
            ProducerCall::Flush,
        ]
    );
}

#[test]
fn a_failed_sync_send_does_not_poison_the_next_one() {
    let client = FakeProducerClient::new().failing_flush(ClientError::Other("nope".to_string()));
    let producer = producer(client, DeliveryMode::Sync);

    assert!(producer.send("orders", ["m1"]).is_err());
    producer.send("payments", ["m2"]).unwrap();

    assert_eq!(producer.client().flush_count(), 2);
}
