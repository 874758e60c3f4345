//! Service host tests: queueing, retries, recovery and drain
//!
//! The worker runs on a spawned task against mock transports; tests steer
//! it through the handle and the shutdown flag.

mod test_helpers;

use mqtt_log_shipper::config::MqttSection;
use mqtt_log_shipper::qos::QualityOfService;
use mqtt_log_shipper::testing::MockTransportFactory;
use mqtt_log_shipper::{
    LogShipper, MqttLogHandler, RawLogEntry, ShipperConfig, ShipperHandle, ShipperReport,
};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{test_config, TEST_BROKER};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

struct Running {
    handler: Arc<MqttLogHandler<MockTransportFactory>>,
    handle: ShipperHandle,
    shutdown: watch::Sender<bool>,
    worker: JoinHandle<ShipperReport>,
}

fn start(config: ShipperConfig, factory: MockTransportFactory) -> Running {
    let handler = Arc::new(MqttLogHandler::new(factory, &config));
    let (shipper, handle) =
        LogShipper::new(handler.clone(), &config.buffer, config.to_reconnect_config());
    let (shutdown, rx) = watch::channel(false);
    let worker = tokio::spawn(shipper.run(rx));
    Running {
        handler,
        handle,
        shutdown,
        worker,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn published_topics(handler: &MqttLogHandler<MockTransportFactory>) -> Vec<String> {
    handler
        .factory()
        .created()
        .iter()
        .flat_map(|t| t.published())
        .map(|p| p.topic)
        .collect()
}

#[tokio::test]
async fn test_entries_are_delivered_in_order() {
    let running = start(
        test_config(TEST_BROKER, QualityOfService::AtLeastOnce),
        MockTransportFactory::new(),
    );

    for i in 0..5 {
        running
            .handle
            .submit(RawLogEntry::new(format!("svc-{i}"), "line"))
            .await
            .unwrap();
    }
    drop(running.handle);

    let report = timeout(Duration::from_secs(5), running.worker)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.delivered + report.drained, 5);
    assert_eq!(report.dropped, 0);
    assert_eq!(
        published_topics(&running.handler),
        vec!["logs/svc-0", "logs/svc-1", "logs/svc-2", "logs/svc-3", "logs/svc-4"]
    );
    assert!(!running.handler.is_connected());
}

#[tokio::test]
async fn test_failed_publish_is_retried_on_new_connection() {
    let running = start(
        test_config(TEST_BROKER, QualityOfService::AtLeastOnce),
        MockTransportFactory::new(),
    );

    wait_until(|| running.handler.is_connected()).await;
    running.handler.factory().last().unwrap().fail_next_publishes(1);

    running
        .handle
        .submit(RawLogEntry::new("svc-A", "retry me"))
        .await
        .unwrap();
    drop(running.handle);

    let report = running.worker.await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(report.dropped, 0);

    // The failed sender was disposed, so the retry used a second connection
    let created = running.handler.factory().created();
    assert_eq!(created.len(), 2);
    assert_eq!(created[0].published().len(), 0);
    assert_eq!(created[1].published()[0].topic, "logs/svc-A");
}

#[tokio::test]
async fn test_entry_dropped_after_max_attempts() {
    let factory = MockTransportFactory::new();
    factory.set_fail_publish(true);
    let running = start(
        test_config(TEST_BROKER, QualityOfService::AtLeastOnce),
        factory,
    );

    running
        .handle
        .submit(RawLogEntry::new("svc-A", "doomed"))
        .await
        .unwrap();
    drop(running.handle);

    let report = running.worker.await.unwrap();
    assert_eq!(report.delivered + report.drained, 0);
    assert_eq!(report.dropped, 1);
    assert!(published_topics(&running.handler).is_empty());

    // One connection per attempt
    let created = running.handler.factory().created();
    assert_eq!(created.len(), 3);
    assert!(created.iter().all(|t| t.publish_calls() == 1));
}

#[tokio::test]
async fn test_worker_waits_for_broker_to_accept() {
    let factory = MockTransportFactory::refusing();
    let running = start(
        test_config(TEST_BROKER, QualityOfService::AtLeastOnce),
        factory,
    );

    running
        .handle
        .submit(RawLogEntry::new("svc-A", "patient"))
        .await
        .unwrap();

    wait_until(|| running.handler.factory().created().len() >= 3).await;
    assert!(published_topics(&running.handler).is_empty());

    running.handler.factory().set_accept(true);
    wait_until(|| published_topics(&running.handler).len() == 1).await;

    drop(running.handle);
    let report = running.worker.await.unwrap();
    assert_eq!(report.delivered, 1);
}

#[tokio::test]
async fn test_shutdown_drains_queued_entries() {
    let running = start(
        test_config(TEST_BROKER, QualityOfService::AtLeastOnce),
        MockTransportFactory::new(),
    );
    wait_until(|| running.handler.is_connected()).await;
    running
        .handler
        .factory()
        .last()
        .unwrap()
        .set_publish_delay(Duration::from_millis(20));

    for i in 0..4 {
        running
            .handle
            .submit(RawLogEntry::new("svc-A", format!("line {i}")))
            .await
            .unwrap();
    }
    running.shutdown.send(true).unwrap();

    let report = timeout(Duration::from_secs(5), running.worker)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.delivered + report.drained, 4);
    assert_eq!(report.abandoned, 0);

    // New entries are refused once the worker has stopped
    assert!(running
        .handle
        .try_submit(RawLogEntry::new("svc-A", "late"))
        .is_err());
}

#[tokio::test]
async fn test_drain_deadline_abandons_remaining_entries() {
    let mut config = test_config(TEST_BROKER, QualityOfService::AtLeastOnce);
    config.buffer.drain_timeout_ms = 50;
    let running = start(config, MockTransportFactory::refusing());

    for i in 0..3 {
        running
            .handle
            .submit(RawLogEntry::new("svc-A", format!("line {i}")))
            .await
            .unwrap();
    }
    wait_until(|| !running.handler.factory().created().is_empty()).await;
    running.shutdown.send(true).unwrap();

    let report = timeout(Duration::from_secs(5), running.worker)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.delivered + report.drained, 0);
    assert_eq!(report.abandoned, 3);
}

#[tokio::test]
async fn test_address_change_moves_worker_to_new_connection() {
    let running = start(
        test_config(TEST_BROKER, QualityOfService::AtLeastOnce),
        MockTransportFactory::new(),
    );

    running
        .handle
        .submit(RawLogEntry::new("svc-A", "first"))
        .await
        .unwrap();
    wait_until(|| published_topics(&running.handler).len() == 1).await;

    let moved = MqttSection::new("mqtt://other-broker:1883", QualityOfService::AtLeastOnce);
    let applied = running.handler.apply_configuration(moved.into()).unwrap();
    assert!(applied.address_change_pending);

    // The next entry still rides the old session, which is then retired
    running
        .handle
        .submit(RawLogEntry::new("svc-A", "second"))
        .await
        .unwrap();
    running
        .handle
        .submit(RawLogEntry::new("svc-A", "third"))
        .await
        .unwrap();
    drop(running.handle);

    let report = running.worker.await.unwrap();
    assert_eq!(report.delivered + report.drained, 3);

    let created = running.handler.factory().created();
    assert_eq!(created.len(), 2);
    assert_eq!(created[0].published().len(), 2);
    assert_eq!(created[1].published().len(), 1);
    assert!(!running.handler.reconnect_pending());
}
