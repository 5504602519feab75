use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use linkmux_core::config::ShortLinkConfig;
use linkmux_core::{codes, ActiveLogic, ErrorKind, IPPortItem, IPSourceType, NetType, NetworkInfo};
use linkmux_routing::{AddressHealthTracker, AddressSource, NetworkConfig};
use linkmux_testing_utils::{
    ConnectBehavior, DuplexSocketProvider, FakeDnsResolver, FakeNetworkInfo, FakeShortLinkCodec,
};
use linkmux_worker::{
    short_link_event_channel, ShortLinkDeps, ShortLinkEvent, ShortLinkEventReceiver,
    ShortLinkFactory, ShortLinkRequest, TcpShortLinkFactory,
};

const WAIT: Duration = Duration::from_secs(30);

struct Harness {
    factory: TcpShortLinkFactory,
    provider: Arc<DuplexSocketProvider>,
    dns: Arc<FakeDnsResolver>,
}

fn harness_with(config: ShortLinkConfig, ips: Vec<String>) -> Harness {
    let network = Arc::new(FakeNetworkInfo::new(NetworkInfo::new(NetType::Wifi, "home")));
    let net_config = Arc::new(NetworkConfig::new());
    net_config.set_short_link(8081, "");
    let dns = Arc::new(FakeDnsResolver::new());
    dns.set("short.test", ips);
    let tracker = AddressHealthTracker::new(network.clone(), None);
    let source = Arc::new(AddressSource::new(
        net_config,
        tracker,
        Arc::new(ActiveLogic::new(true)),
        dns.clone(),
        dns.clone(),
        network.clone(),
    ));
    let provider = Arc::new(DuplexSocketProvider::new());
    let deps = ShortLinkDeps {
        source,
        sockets: provider.clone(),
        codec: Arc::new(FakeShortLinkCodec::new()),
        network,
    };
    Harness {
        factory: TcpShortLinkFactory::new(deps, config),
        provider,
        dns,
    }
}

fn harness() -> Harness {
    harness_with(ShortLinkConfig::default(), vec!["10.0.0.2".into()])
}

fn request(worker_id: u64) -> ShortLinkRequest {
    ShortLinkRequest {
        worker_id,
        task_id: 42,
        cgi: "/cgi-bin/echo".into(),
        hosts: vec!["short.test".into()],
        body: b"req".to_vec(),
        ..ShortLinkRequest::default()
    }
}

async fn next_response(events: &mut ShortLinkEventReceiver) -> (Vec<ShortLinkEvent>, ShortLinkEvent) {
    let mut seen = Vec::new();
    let response = tokio::time::timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if matches!(event, ShortLinkEvent::Response { .. }) {
                return Some(event);
            }
            seen.push(event);
        }
        None
    })
    .await
    .ok()
    .flatten();
    let response = response.unwrap_or_else(|| panic!("no response, saw {seen:?}"));
    (seen, response)
}

/// Reads the packed request and answers with `status` and `body`, then hangs up.
async fn answer(provider: &DuplexSocketProvider, status: i32, body: &[u8]) -> Vec<u8> {
    let mut conn = provider.next_accepted().await.expect("connection");
    let expected = b"POST /cgi-bin/echo\nreq".len();
    let mut received = vec![0u8; expected];
    conn.stream.read_exact(&mut received).await.unwrap();
    conn.stream
        .write_all(&FakeShortLinkCodec::response(status, body))
        .await
        .unwrap();
    received
}

#[tokio::test]
async fn test_request_completes_with_body() {
    let h = harness();
    let (tx, mut events) = short_link_event_channel();
    let handle = h.factory.start(request(7), tx);

    let received = answer(&h.provider, 200, b"hello").await;
    assert_eq!(received, b"POST /cgi-bin/echo\nreq");

    let (seen, response) = next_response(&mut events).await;
    assert!(matches!(
        seen.first(),
        Some(ShortLinkEvent::Send { worker_id: 7, task_id: 42 })
    ));
    match response {
        ShortLinkEvent::Response {
            worker_id,
            kind,
            code,
            status,
            body,
            profile,
            ..
        } => {
            assert_eq!(worker_id, 7);
            assert_eq!(kind, ErrorKind::Ok);
            assert_eq!(code, 0);
            assert_eq!(status, 200);
            assert_eq!(body, b"hello");
            assert_eq!(profile.ip, "10.0.0.2");
            assert_eq!(profile.port, 8081);
            assert_eq!(profile.host, "short.test");
            assert_eq!(profile.ip_index, 0);
        }
        other => panic!("unexpected {other:?}"),
    }
    handle.cancel().await;
}

#[tokio::test]
async fn test_redirect_is_http_error_and_reported() {
    let h = harness();
    let (tx, mut events) = short_link_event_channel();
    let _handle = h.factory.start(request(1), tx);

    answer(&h.provider, 302, b"").await;
    let (_, response) = next_response(&mut events).await;
    assert!(matches!(
        response,
        ShortLinkEvent::Response { kind: ErrorKind::Http, code: 302, status: 302, .. }
    ));
    let report = tokio::time::timeout(WAIT, events.recv()).await.unwrap();
    assert!(matches!(
        report,
        Some(ShortLinkEvent::NetworkReport { kind: ErrorKind::Http, code: 302, port: 8081, .. })
    ));
}

#[tokio::test]
async fn test_no_address_fails_with_dns_error() {
    let h = harness_with(ShortLinkConfig::default(), Vec::new());
    let (tx, mut events) = short_link_event_channel();
    let _handle = h.factory.start(request(1), tx);

    let (seen, response) = next_response(&mut events).await;
    assert!(seen.is_empty());
    assert!(matches!(
        response,
        ShortLinkEvent::Response { kind: ErrorKind::Dns, code: codes::DNS_MAKE_SOCKET_PREPARED, .. }
    ));
    assert_eq!(h.provider.connect_count(), 0);
}

#[tokio::test]
async fn test_all_candidates_refused() {
    let h = harness_with(
        ShortLinkConfig::default(),
        vec!["10.0.0.2".into(), "10.0.0.3".into()],
    );
    h.provider.set_behavior("10.0.0.2", 8081, ConnectBehavior::Refuse);
    h.provider.set_behavior("10.0.0.3", 8081, ConnectBehavior::Refuse);
    let (tx, mut events) = short_link_event_channel();
    let _handle = h.factory.start(request(1), tx);

    let (seen, response) = next_response(&mut events).await;
    let reports = seen
        .iter()
        .filter(|e| matches!(e, ShortLinkEvent::NetworkReport { kind: ErrorKind::Socket, .. }))
        .count();
    assert_eq!(reports, 2);
    assert!(matches!(
        response,
        ShortLinkEvent::Response {
            kind: ErrorKind::Socket,
            code: codes::SOCKET_MAKE_SOCKET_PREPARED,
            ..
        }
    ));
    assert_eq!(h.provider.connect_count(), 2);
}

#[tokio::test]
async fn test_peer_close_without_status_line() {
    let h = harness();
    let (tx, mut events) = short_link_event_channel();
    let _handle = h.factory.start(request(1), tx);

    let mut conn = h.provider.next_accepted().await.unwrap();
    let mut received = vec![0u8; b"POST /cgi-bin/echo\nreq".len()];
    conn.stream.read_exact(&mut received).await.unwrap();
    drop(conn);

    let (_, response) = next_response(&mut events).await;
    assert!(matches!(
        response,
        ShortLinkEvent::Response { kind: ErrorKind::Http, code: codes::HTTP_SPLIT_HEAD_BODY, .. }
    ));
}

#[tokio::test]
async fn test_cancel_is_silent() {
    let h = harness();
    let (tx, mut events) = short_link_event_channel();
    let handle = h.factory.start(request(3), tx);

    let conn = h.provider.next_accepted().await.unwrap();
    let first = tokio::time::timeout(WAIT, events.recv()).await.unwrap();
    assert!(matches!(first, Some(ShortLinkEvent::Send { worker_id: 3, .. })));

    handle.cancel().await;
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, ShortLinkEvent::Response { .. }),
            "response after cancel: {event:?}"
        );
    }
    drop(conn);
}

#[tokio::test]
async fn test_proxy_replaces_candidates() {
    let config = ShortLinkConfig {
        proxy_ip: "10.9.9.9".into(),
        proxy_port: 3128,
        ..ShortLinkConfig::default()
    };
    let h = harness_with(config, vec!["10.0.0.2".into()]);
    let (tx, mut events) = short_link_event_channel();
    let mut req = request(1);
    req.use_proxy = true;
    let _handle = h.factory.start(req, tx);

    answer(&h.provider, 200, b"via proxy").await;
    let (_, response) = next_response(&mut events).await;
    match response {
        ShortLinkEvent::Response { kind, profile, .. } => {
            assert_eq!(kind, ErrorKind::Ok);
            assert_eq!(profile.ip, "10.9.9.9");
            assert_eq!(profile.port, 3128);
            assert_eq!(profile.ip_type, IPSourceType::Proxy);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.provider.attempts(), vec![("10.9.9.9".to_string(), 3128)]);
    assert_eq!(h.dns.lookups("short.test"), 0);
}

#[tokio::test]
async fn test_outer_addresses_skip_resolution() {
    let h = harness();
    let (tx, mut events) = short_link_event_channel();
    let mut req = request(1);
    req.outer_addrs = vec![IPPortItem::new("10.1.1.1", 9000, IPSourceType::Debug, "short.test")];
    let _handle = h.factory.start(req, tx);

    answer(&h.provider, 200, b"").await;
    let (_, response) = next_response(&mut events).await;
    assert!(matches!(response, ShortLinkEvent::Response { kind: ErrorKind::Ok, .. }));
    assert_eq!(h.provider.attempts(), vec![("10.1.1.1".to_string(), 9000)]);
    assert_eq!(h.dns.lookups("short.test"), 0);
}
