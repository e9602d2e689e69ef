use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;

use meshfleet::{
    ConnectionConfig, ConnectionError, ConnectionState, DeviceScript, FakeTransport,
    ProxyCandidate, ProxyConnectionManager, RadioArbiter,
};

fn address(last: u8) -> meshfleet::DeviceAddress {
    format!("aa:bb:cc:dd:ee:{last:02x}")
        .parse()
        .expect("test address should parse")
}

fn manager_over(transport: Arc<FakeTransport>) -> ProxyConnectionManager {
    ProxyConnectionManager::new(transport, RadioArbiter::new(), ConnectionConfig::default())
}

#[tokio::test(start_paused = true)]
async fn concurrent_ensure_calls_share_one_physical_attempt() {
    let transport = Arc::new(FakeTransport::with_devices([DeviceScript::builder()
        .address(address(1))
        .connect_delay(Duration::from_millis(100))
        .build()]));
    let manager = manager_over(transport.clone());
    let candidates = [ProxyCandidate::known_proxy(address(1))];

    let (first, second) = tokio::join!(
        manager.ensure_connection(&candidates),
        manager.ensure_connection(&candidates),
    );

    assert_eq!(true, first.is_ok());
    assert_eq!(true, second.is_ok());
    assert_eq!(1, transport.connect_attempts());
    assert_eq!(ConnectionState::Ready, manager.state());
}

#[tokio::test]
async fn ready_connection_is_reused_without_reconnecting() {
    let transport = Arc::new(FakeTransport::with_devices([
        DeviceScript::builder().address(address(1)).build(),
        DeviceScript::builder().address(address(2)).build(),
    ]));
    let manager = manager_over(transport.clone());

    manager
        .ensure_connection(&[ProxyCandidate::known_proxy(address(1))])
        .await
        .expect("first candidate should connect");
    let attempts_after_connect = transport.connect_attempts();

    // A different candidate list still reuses the ready proxy.
    manager
        .ensure_connection(&[ProxyCandidate::known_proxy(address(2))])
        .await
        .expect("ready connection should be reused");

    assert_eq!(attempts_after_connect, transport.connect_attempts());
    assert_eq!(Some(address(1)), manager.active_address().await);
}

#[tokio::test(start_paused = true)]
async fn candidates_are_tried_in_order_and_gated_on_the_proxy_service() {
    let transport = Arc::new(FakeTransport::with_devices([
        DeviceScript::builder()
            .address(address(1))
            .proxy_service(false)
            .build(),
        DeviceScript::builder().address(address(2)).build(),
    ]));
    let manager = manager_over(transport.clone());

    manager
        .ensure_connection(&[
            ProxyCandidate::new(address(1)),
            ProxyCandidate::new(address(2)),
        ])
        .await
        .expect("second candidate should connect");

    // The first candidate produced a bare GATT connection and was rejected.
    assert_eq!(Some(address(2)), manager.active_address().await);
    assert_eq!(2, transport.connect_attempts());
}

#[tokio::test(start_paused = true)]
async fn refused_candidate_consumes_the_transport_retry_budget() {
    let transport = Arc::new(FakeTransport::with_devices([DeviceScript::builder()
        .address(address(1))
        .refuse_connects(DeviceScript::always())
        .build()]));
    let manager = manager_over(transport.clone());

    let outcome = manager
        .ensure_connection(&[ProxyCandidate::known_proxy(address(1))])
        .await;

    assert_matches!(outcome, Err(ConnectionError::AllCandidatesFailed { tried: 1 }));
    assert_eq!(3, transport.connect_attempts());
    assert_eq!(ConnectionState::Failed, manager.state());
}

#[tokio::test(start_paused = true)]
async fn failed_attempt_settles_and_releases_for_a_later_retry() {
    let transport = Arc::new(FakeTransport::with_devices([DeviceScript::builder()
        .address(address(1))
        .refuse_connects(3)
        .build()]));
    let manager = manager_over(transport.clone());
    let candidates = [ProxyCandidate::known_proxy(address(1))];

    let first = manager.ensure_connection(&candidates).await;
    assert_matches!(first, Err(ConnectionError::AllCandidatesFailed { .. }));

    // The refusal budget is spent; a fresh call succeeds.
    manager
        .ensure_connection(&candidates)
        .await
        .expect("retry should connect once refusals are exhausted");
    assert_eq!(ConnectionState::Ready, manager.state());
}

#[tokio::test(start_paused = true)]
async fn waiter_on_a_foreign_attempt_recovers_after_its_deadline() {
    let transport = Arc::new(FakeTransport::with_devices([
        DeviceScript::builder()
            .address(address(1))
            .connect_delay(Duration::from_millis(600))
            .build(),
        DeviceScript::builder().address(address(2)).build(),
    ]));
    let manager = Arc::new(ProxyConnectionManager::new(
        transport.clone(),
        RadioArbiter::new(),
        ConnectionConfig::builder()
            .wait_deadline(Duration::from_millis(400))
            .build(),
    ));

    let slow = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .ensure_connection(&[ProxyCandidate::known_proxy(address(1))])
                .await
        })
    };
    tokio::task::yield_now().await;

    // This caller wants a different proxy, waits out the in-flight attempt,
    // then observes the shared outcome instead of racing a second radio
    // connection.
    let joined = manager
        .ensure_connection(&[ProxyCandidate::known_proxy(address(2))])
        .await;

    assert_eq!(true, joined.is_ok());
    // The initiator gave up at its own deadline; the attempt it started
    // still completed and was observed by the second caller.
    assert_matches!(
        slow.await.expect("attempt task should not panic"),
        Err(ConnectionError::WaitDeadlineExceeded { .. })
    );
    assert_eq!(1, transport.connect_attempts());
}

#[tokio::test]
async fn disconnect_releases_the_connection_deterministically() {
    let transport = Arc::new(FakeTransport::with_devices([DeviceScript::builder()
        .address(address(1))
        .build()]));
    let manager = manager_over(transport.clone());

    manager
        .ensure_connection(&[ProxyCandidate::known_proxy(address(1))])
        .await
        .expect("scripted proxy should connect");
    manager.disconnect().await;

    assert_eq!(ConnectionState::Disconnected, manager.state());
    assert_eq!(None, manager.active_address().await);

    manager
        .ensure_connection(&[ProxyCandidate::known_proxy(address(1))])
        .await
        .expect("reconnect after disconnect should work");
    assert_eq!(ConnectionState::Ready, manager.state());
}

#[tokio::test]
async fn state_stream_observes_connecting_then_ready() {
    let transport = Arc::new(FakeTransport::with_devices([DeviceScript::builder()
        .address(address(1))
        .connect_delay(Duration::from_millis(10))
        .build()]));
    let manager = manager_over(transport);
    let mut states = manager.state_stream();

    manager
        .ensure_connection(&[ProxyCandidate::known_proxy(address(1))])
        .await
        .expect("scripted proxy should connect");

    let mut observed = Vec::new();
    while states.has_changed().expect("state sender should be alive") {
        observed.push(*states.borrow_and_update());
        if observed.last() == Some(&ConnectionState::Ready) {
            break;
        }
    }
    assert_eq!(Some(&ConnectionState::Ready), observed.last());
}
