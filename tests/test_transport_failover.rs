//! Transport selection, failover and degraded-mode recovery
//!
//! Uses the mock transport factory: each selection round creates fresh mock
//! transports whose start behavior the test controls.

use hostlink::jobs::CommandRouter;
use hostlink::testing::{recording_dispatcher, MockBehavior, MockTransportFactory};
use hostlink::transport::{Activation, TransportKind, TransportSelector};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn selector(factory: &Arc<MockTransportFactory>, retry: Duration) -> TransportSelector {
    let (dispatcher, _, _) = recording_dispatcher("web-01", CommandRouter::new());
    dispatcher.emitter().detach();
    TransportSelector::new(factory.clone(), dispatcher, retry)
}

#[tokio::test]
async fn test_queue_preferred_when_both_available() {
    let factory = Arc::new(MockTransportFactory::new(
        MockBehavior::Succeed,
        MockBehavior::Succeed,
    ));
    let mut selector = selector(&factory, Duration::from_secs(60));

    assert_eq!(selector.activate().await, Activation::Active(TransportKind::Queue));
    assert!(factory.last_created(TransportKind::Duplex).is_none());
}

#[tokio::test]
async fn test_falls_back_to_socket_when_queue_fails_to_start() {
    let factory = Arc::new(MockTransportFactory::new(
        MockBehavior::FailStart,
        MockBehavior::Succeed,
    ));
    let mut selector = selector(&factory, Duration::from_secs(60));

    assert_eq!(selector.activate().await, Activation::Active(TransportKind::Duplex));
    let queue = factory.last_created(TransportKind::Queue).unwrap();
    assert!(!queue.is_started());
    assert_eq!(queue.shutdown_reasons(), vec!["start failed".to_string()]);
}

#[tokio::test]
async fn test_permanent_loss_fails_over_to_other_transport() {
    let factory = Arc::new(MockTransportFactory::new(
        MockBehavior::Succeed,
        MockBehavior::Succeed,
    ));
    let (dispatcher, _, _) = recording_dispatcher("web-01", CommandRouter::new());
    let mut selector =
        TransportSelector::new(factory.clone(), Arc::clone(&dispatcher), Duration::from_secs(60));
    assert_eq!(selector.activate().await, Activation::Active(TransportKind::Queue));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = tokio::spawn(selector.supervise(shutdown_rx));

    let queue = factory.last_created(TransportKind::Queue).unwrap();
    queue.lose_permanently("max reconnection attempts exceeded");

    wait_until(|| dispatcher.emitter().active_transport() == Some(TransportKind::Duplex)).await;
    assert_eq!(queue.shutdown_reasons(), vec!["connection lost".to_string()]);

    shutdown_tx.send_replace(true);
    let mut selector = supervisor.await.unwrap();
    assert_eq!(selector.active_kind(), Some(TransportKind::Duplex));

    selector.shutdown("agent stopping").await;
    let duplex = factory.last_created(TransportKind::Duplex).unwrap();
    assert_eq!(duplex.shutdown_reasons(), vec!["agent stopping".to_string()]);
    assert!(dispatcher.emitter().active_transport().is_none());
}

#[tokio::test]
async fn test_degraded_mode_retries_until_a_transport_appears() {
    let factory = Arc::new(MockTransportFactory::new(
        MockBehavior::Unavailable,
        MockBehavior::Unavailable,
    ));
    let (dispatcher, _, _) = recording_dispatcher("web-01", CommandRouter::new());
    let mut selector =
        TransportSelector::new(factory.clone(), Arc::clone(&dispatcher), Duration::from_millis(20));

    assert_eq!(selector.activate().await, Activation::Degraded);
    assert!(selector.is_degraded());
    assert!(dispatcher.emitter().active_transport().is_none());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = tokio::spawn(selector.supervise(shutdown_rx));

    // Still alive and still retrying
    wait_until(|| factory.plans() >= 3).await;
    assert!(!supervisor.is_finished());

    factory.set_behavior(TransportKind::Duplex, MockBehavior::Succeed);
    wait_until(|| dispatcher.emitter().active_transport() == Some(TransportKind::Duplex)).await;

    shutdown_tx.send_replace(true);
    let selector = supervisor.await.unwrap();
    assert!(!selector.is_degraded());
}

#[tokio::test]
async fn test_shutdown_while_degraded_returns_promptly() {
    let factory = Arc::new(MockTransportFactory::new(
        MockBehavior::FailStart,
        MockBehavior::FailStart,
    ));
    let mut selector = selector(&factory, Duration::from_secs(3600));
    assert_eq!(selector.activate().await, Activation::Degraded);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = tokio::spawn(selector.supervise(shutdown_rx));
    shutdown_tx.send_replace(true);

    let selector = timeout(Duration::from_secs(1), supervisor)
        .await
        .expect("supervisor ignored shutdown")
        .unwrap();
    assert!(selector.is_degraded());
    assert_eq!(factory.plans(), 1);
}
