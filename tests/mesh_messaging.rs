use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::time::timeout;

use meshfleet::{
    CleartextCodec, DeviceScript, FakeTransport, MeshController, UnicastAddress,
};

const NET_KEY: &str = "00112233445566778899aabbccddeeff";
const APP_KEY: &str = "ffeeddccbbaa99887766554433221100";
const PROXY: &str = "aa:bb:cc:dd:ee:01";

fn unicast(value: u16) -> UnicastAddress {
    UnicastAddress::try_from(value).expect("test address should be unicast")
}

fn loopback_mesh(nodes: &[u16]) -> Arc<FakeTransport> {
    let mesh_nodes: Vec<UnicastAddress> = nodes.iter().map(|&node| unicast(node)).collect();
    Arc::new(FakeTransport::with_devices([DeviceScript::builder()
        .address(PROXY.parse().expect("proxy address should parse"))
        .mesh_nodes(mesh_nodes)
        .build()]))
}

async fn connected_controller(transport: Arc<FakeTransport>) -> MeshController {
    let controller = MeshController::new(transport, Arc::new(CleartextCodec));
    controller
        .set_mesh_credentials(NET_KEY, APP_KEY)
        .expect("test keys should parse");
    controller
        .ensure_proxy_connection(PROXY, &[])
        .await
        .expect("scripted proxy should connect");
    controller
}

#[tokio::test]
async fn group_message_reaches_every_whitelisted_member() {
    let transport = loopback_mesh(&[0x0005, 0x0006]);
    let controller = connected_controller(transport.clone()).await;

    controller
        .configure_proxy_filter(&[0x0005, 0x0006])
        .await
        .expect("filter should configure");

    let mut events = controller.device_status_events();
    controller
        .send_group_message(0xC001, &[], true)
        .await
        .expect("group message should send");

    let mut replies: BTreeMap<UnicastAddress, bool> = BTreeMap::new();
    while replies.len() < 2 {
        let status = timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("status replies should arrive promptly")
            .expect("router should stay alive");
        replies.insert(status.unicast_address(), status.present_state());
    }

    assert_eq!(
        BTreeMap::from([(unicast(0x0005), true), (unicast(0x0006), true)]),
        replies
    );
    assert_eq!(
        Some(true),
        transport.node_state(&PROXY.parse().expect("proxy address should parse"), unicast(0x0005))
    );
}

#[tokio::test(start_paused = true)]
async fn replies_are_silently_dropped_without_a_configured_filter() {
    let transport = loopback_mesh(&[0x0005]);
    let controller = connected_controller(transport.clone()).await;

    let mut events = controller.device_status_events();
    controller
        .send_group_message(0xC001, &[], true)
        .await
        .expect("send without a filter is accepted");

    // No reply arrives, and no error is surfaced; the outcome is simply
    // inconclusive.
    let silence = timeout(Duration::from_millis(200), events.recv()).await;
    assert_eq!(true, silence.is_err());
    assert_eq!(1, transport.dropped_replies());
}

#[tokio::test]
async fn unicast_message_updates_exactly_one_node() {
    let transport = loopback_mesh(&[0x0005, 0x0006]);
    let controller = connected_controller(transport.clone()).await;
    controller
        .configure_proxy_filter(&[0x0005, 0x0006])
        .await
        .expect("filter should configure");

    let mut events = controller.status_events_for(unicast(0x0005));
    controller
        .send_unicast_message(0x0005, true, Some(PROXY))
        .await
        .expect("unicast message should send");

    let status = timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("status reply should arrive promptly")
        .expect("router should stay alive");
    assert_eq!(unicast(0x0005), status.unicast_address());
    assert_eq!(true, status.present_state());

    let proxy = PROXY.parse().expect("proxy address should parse");
    assert_eq!(Some(true), transport.node_state(&proxy, unicast(0x0005)));
    assert_eq!(None, transport.node_state(&proxy, unicast(0x0006)));
}

#[tokio::test]
async fn repeated_sends_deliver_repeated_statuses_per_address() {
    let transport = loopback_mesh(&[0x0005]);
    let controller = connected_controller(transport).await;
    controller
        .configure_proxy_filter(&[0x0005])
        .await
        .expect("filter should configure");

    let mut events = controller.status_events_for(unicast(0x0005));
    controller
        .send_unicast_message(0x0005, true, None)
        .await
        .expect("first send should go out");
    controller
        .send_unicast_message(0x0005, true, None)
        .await
        .expect("second send should go out");

    // Receivers may reply once per message; duplicates are expected and
    // callers dedupe by address, not transaction id.
    for _expected in 0..2 {
        let status = timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("status reply should arrive promptly")
            .expect("router should stay alive");
        assert_eq!(unicast(0x0005), status.unicast_address());
    }
}

#[tokio::test]
async fn discovery_probe_collects_group_members_via_events() {
    let transport = loopback_mesh(&[0x0005, 0x0006, 0x0007]);
    let controller = connected_controller(transport).await;
    controller
        .configure_proxy_filter(&[0x0005, 0x0006, 0x0007])
        .await
        .expect("filter should configure");

    let mut events = controller.device_status_events();
    controller
        .discover_group_members(0xC001, true)
        .await
        .expect("probe should send");

    let mut members = std::collections::BTreeSet::new();
    while members.len() < 3 {
        let status = timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("confirmations should arrive promptly")
            .expect("router should stay alive");
        members.insert(status.unicast_address());
    }
    assert_eq!(3, members.len());
}

#[tokio::test(start_paused = true)]
async fn malformed_inbound_payloads_are_dropped_not_raised() {
    let proxy: meshfleet::DeviceAddress = PROXY.parse().expect("proxy address should parse");
    // One truncated network PDU and one complete-but-garbage fragment.
    let transport = Arc::new(FakeTransport::with_devices([DeviceScript::builder()
        .address(proxy)
        .mesh_nodes(vec![unicast(0x0005)])
        .canned_mesh_notifications(vec![vec![0x00, 0xFF], vec![0x00, 1, 2, 3, 4, 5, 6, 7]])
        .build()]));
    let controller = connected_controller(transport).await;

    let mut events = controller.device_status_events();
    let silence = timeout(Duration::from_millis(200), events.recv()).await;
    assert_eq!(true, silence.is_err());
}
