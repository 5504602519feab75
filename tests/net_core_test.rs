use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use linkmux::core::config::NetworkSettings;
use linkmux::core::traits::{FrameCodec, IdentifyMode, Unpacked};
use linkmux::core::{
    codes, ChannelSelect, ConnectivityStatus, CoreConfig, ErrorKind, LongLinkStatus, NetType,
    NetworkInfo, Task,
};
use linkmux::{Collaborators, NetCore};
use linkmux_testing_utils::{
    AcceptedConn, ConnectBehavior, DuplexSocketProvider, FakeAuthGate, FakeDnsResolver,
    FakeFrameCodec, FakeIdentifyProvider, FakeLongLinkProtocol, FakeNetworkInfo,
    FakeShortLinkCodec, FakeTaskCodec, RecordingListener, TaskBuilder, TestEnv,
    FAKE_NOOP_CMD_ID,
};

const WAIT: Duration = Duration::from_secs(30);
const LONG_IP: &str = "10.0.0.1";
const SHORT_IP: &str = "10.0.0.2";
const LONG_PORT: u16 = 8080;

struct Harness {
    core: NetCore,
    listener: Arc<RecordingListener>,
    provider: Arc<DuplexSocketProvider>,
}

fn config() -> CoreConfig {
    let mut config = CoreConfig::default();
    config.network = NetworkSettings {
        long_link_hosts: vec!["long.test".into()],
        long_link_ports: vec![LONG_PORT],
        short_link_hosts: vec!["short.test".into()],
        short_link_port: 8081,
        ..NetworkSettings::default()
    };
    config
}

/// Core whose long link is refused, so every both-channel task takes the short link.
fn harness(info: NetworkInfo) -> Harness {
    harness_with(info, ConnectBehavior::Refuse)
}

fn harness_with(info: NetworkInfo, long_link: ConnectBehavior) -> Harness {
    let provider = Arc::new(DuplexSocketProvider::new());
    provider.set_behavior(LONG_IP, LONG_PORT, long_link);
    let dns = Arc::new(FakeDnsResolver::new());
    dns.set("long.test", vec![LONG_IP.into()]);
    dns.set("short.test", vec![SHORT_IP.into()]);
    let listener = Arc::new(RecordingListener::new());

    let collaborators = Collaborators {
        sockets: provider.clone(),
        primary_dns: dns.clone(),
        legacy_dns: dns,
        network: Arc::new(FakeNetworkInfo::new(info)),
        auth: Arc::new(FakeAuthGate::new(true)),
        frame_codec: Arc::new(FakeFrameCodec::new()),
        protocol: Arc::new(FakeLongLinkProtocol::new()),
        identify: Arc::new(FakeIdentifyProvider::new(IdentifyMode::Never)),
        task_codec: Arc::new(FakeTaskCodec::new()),
        short_codec: Arc::new(FakeShortLinkCodec::new()),
        store: None,
        listener: listener.clone(),
        foreground: true,
    };
    let core = NetCore::start(config(), collaborators).expect("core starts");
    Harness {
        core,
        listener,
        provider,
    }
}

fn wifi() -> NetworkInfo {
    NetworkInfo::new(NetType::Wifi, "home")
}

fn short_task(task_id: u32) -> Task {
    TaskBuilder::new()
        .with_id(task_id)
        .with_channel(ChannelSelect::SHORT)
        .build()
}

async fn next_short_conn(provider: &DuplexSocketProvider) -> AcceptedConn {
    let conn = tokio::time::timeout(WAIT, provider.next_accepted())
        .await
        .expect("short link connects in time")
        .expect("connection");
    assert_eq!((conn.ip.as_str(), conn.port), (SHORT_IP, 8081));
    conn
}

/// Reads the request of `task_id`, answers with `status` and hangs up.
async fn answer(provider: &DuplexSocketProvider, task_id: u32, status: i32, body: &[u8]) {
    let mut conn = next_short_conn(provider).await;
    let expected = format!("POST /cgi-bin/test\nreq:{task_id}");
    let mut received = vec![0u8; expected.len()];
    conn.stream.read_exact(&mut received).await.unwrap();
    assert_eq!(received, expected.as_bytes());
    conn.stream
        .write_all(&FakeShortLinkCodec::response(status, body))
        .await
        .unwrap();
}

/// Long-link peer that answers noops and records task frames per connection.
/// Connections after the first `silent` ones answer every task with `pong`.
#[derive(Clone, Default)]
struct LongServer {
    frames: Arc<Mutex<Vec<(usize, u32)>>>,
}

impl LongServer {
    fn spawn(provider: Arc<DuplexSocketProvider>, silent: usize) -> Self {
        let server = Self::default();
        let frames = server.frames.clone();
        tokio::spawn(async move {
            let mut index = 0;
            while let Some(conn) = provider.next_accepted().await {
                if conn.port != LONG_PORT {
                    continue;
                }
                tokio::spawn(serve_long(conn.stream, index, index >= silent, frames.clone()));
                index += 1;
            }
        });
        server
    }

    fn tasks_on(&self, conn: usize) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .frames
            .lock()
            .unwrap()
            .iter()
            .filter(|(index, _)| *index == conn)
            .map(|(_, task_id)| *task_id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

async fn serve_long(
    mut stream: DuplexStream,
    conn: usize,
    echo: bool,
    frames: Arc<Mutex<Vec<(usize, u32)>>>,
) {
    let codec = FakeFrameCodec::new();
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        while let Unpacked::Frame(frame) = codec.unpack(&buf) {
            buf.drain(..frame.consumed);
            let reply = if frame.cmd_id == FAKE_NOOP_CMD_ID {
                Some(codec.pack(frame.cmd_id, frame.task_id, &[], &[]))
            } else {
                frames.lock().unwrap().push((conn, frame.task_id));
                echo.then(|| codec.pack(frame.cmd_id, frame.task_id, b"pong", &[]))
            };
            if let Some(reply) = reply {
                if stream.write_all(&reply).await.is_err() {
                    return;
                }
            }
        }
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

fn long_task(task_id: u32, retry_count: i32) -> Task {
    TaskBuilder::new()
        .with_id(task_id)
        .with_channel(ChannelSelect::LONG)
        .with_retry_count(retry_count)
        .build()
}

fn long_connects(provider: &DuplexSocketProvider) -> usize {
    provider
        .attempts()
        .iter()
        .filter(|(ip, port)| ip == LONG_IP && *port == LONG_PORT)
        .count()
}

#[tokio::test]
async fn test_invalid_parameters_end_immediately() {
    let h = harness(wifi());

    let too_many_retries = TaskBuilder::new().with_id(101).with_retry_count(31).build();
    assert!(!h.core.start_task(too_many_retries).await);
    let end = h.listener.end_of(101).expect("ended");
    assert_eq!((end.kind, end.code), (ErrorKind::Local, codes::LOCAL_TASK_PARAM));

    let no_channel = TaskBuilder::new()
        .with_id(102)
        .with_cmd_id(0)
        .with_cgi("")
        .build();
    assert!(!h.core.start_task(no_channel).await);
    let end = h.listener.end_of(102).expect("ended");
    assert_eq!((end.kind, end.code), (ErrorKind::Local, codes::LOCAL_CHANNEL_SELECT));

    assert_eq!(h.listener.profiles().len(), 2);
    h.core.shutdown().await;
}

#[tokio::test]
async fn test_sensitive_task_without_network_ends_with_no_net() {
    let h = harness(NetworkInfo::no_net());

    let task = TaskBuilder::new()
        .with_id(103)
        .with_network_sensitive(true)
        .with_user_context(7u8)
        .build();
    assert!(!h.core.start_task(task).await);

    let end = h.listener.end_of(103).expect("ended");
    assert_eq!((end.kind, end.code), (ErrorKind::Local, codes::LOCAL_NO_NET));
    assert!(end.had_context);
    h.core.shutdown().await;
}

#[tokio::test]
async fn test_short_only_task_completes() {
    let h = harness(wifi());

    assert!(h.core.start_task(short_task(201)).await);
    answer(&h.provider, 201, 200, b"pong").await;

    assert!(TestEnv::wait_until(|| h.listener.end_count(201) == 1, WAIT).await);
    let end = h.listener.end_of(201).unwrap();
    assert_eq!((end.kind, end.code), (ErrorKind::Ok, 0));
    assert!(!h.core.has_task(201).await);

    let reports = h.listener.network_errors();
    assert!(reports
        .iter()
        .any(|r| !r.long_link && r.kind == ErrorKind::Ok && r.ip == SHORT_IP));
    h.core.shutdown().await;
}

#[tokio::test]
async fn test_both_channels_fall_back_to_short_without_long_link() {
    let h = harness(wifi());
    assert_ne!(h.core.long_link_status(), LongLinkStatus::Connected);

    let task = TaskBuilder::new().with_id(202).build();
    assert!(h.core.start_task(task).await);
    answer(&h.provider, 202, 200, b"ok").await;

    assert!(TestEnv::wait_until(|| h.listener.end_count(202) == 1, WAIT).await);
    assert_eq!(h.listener.end_of(202).unwrap().kind, ErrorKind::Ok);
    assert!(h
        .listener
        .connectivity()
        .iter()
        .any(|(overall, _)| *overall == ConnectivityStatus::Connected));
    h.core.shutdown().await;
}

#[tokio::test]
async fn test_refused_by_scheduler_ends_with_start_task_fail() {
    let h = harness(wifi());

    let task = TaskBuilder::new()
        .with_id(203)
        .with_channel(ChannelSelect::SHORT)
        .with_send_only(true)
        .build();
    assert!(!h.core.start_task(task).await);

    let end = h.listener.end_of(203).expect("ended");
    assert_eq!((end.kind, end.code), (ErrorKind::Local, codes::LOCAL_START_TASK_FAIL));
    h.core.shutdown().await;
}

#[tokio::test]
async fn test_stop_task_removes_running_short_task() {
    let h = harness(wifi());

    assert!(h.core.start_task(short_task(204)).await);
    assert!(h.core.has_task(204).await);
    let _conn = next_short_conn(&h.provider).await;

    assert!(h.core.stop_task(204).await);
    assert!(!h.core.has_task(204).await);
    assert!(!h.core.stop_task(204).await);
    assert_eq!(h.listener.end_count(204), 0);
    h.core.shutdown().await;
}

#[tokio::test]
async fn test_clear_tasks_drops_without_callbacks() {
    let h = harness(wifi());

    assert!(h.core.start_task(short_task(205)).await);
    assert!(h.core.start_task(short_task(206)).await);
    h.core.clear_tasks();

    assert!(!h.core.has_task(205).await);
    assert!(!h.core.has_task(206).await);
    assert_eq!(h.core.zombie_count(), 0);
    assert!(h.listener.ends().is_empty());
    h.core.shutdown().await;
}

#[tokio::test]
async fn test_server_ban_is_visible_through_config() {
    let h = harness(wifi());
    assert_eq!(h.core.network_config().short_link_port(), 8081);
    h.core.add_server_ban(LONG_IP);
    h.core.remove_long_ban_ip(LONG_IP);
    h.core.shutdown().await;
}

#[tokio::test]
async fn test_both_channels_prefer_connected_long_link() {
    let h = harness_with(wifi(), ConnectBehavior::Accept);
    let server = LongServer::spawn(h.provider.clone(), 0);
    h.core.make_sure_long_link_connected();
    assert!(TestEnv::wait_until(|| h.core.long_link_is_connected(), WAIT).await);

    assert!(h.core.start_task(TaskBuilder::new().with_id(301).build()).await);
    assert!(TestEnv::wait_until(|| h.listener.end_count(301) == 1, WAIT).await);
    assert_eq!(h.listener.end_of(301).unwrap().kind, ErrorKind::Ok);
    assert_eq!(server.tasks_on(0), vec![301]);
    assert!(h
        .listener
        .network_errors()
        .iter()
        .all(|r| r.long_link && r.ip == LONG_IP));
    h.core.shutdown().await;
}

#[tokio::test]
async fn test_redo_tasks_resends_in_flight_long_tasks() {
    let h = harness_with(wifi(), ConnectBehavior::Accept);
    let server = LongServer::spawn(h.provider.clone(), 1);
    for id in 311..=313 {
        assert!(h.core.start_task(long_task(id, 0)).await);
    }
    assert!(TestEnv::wait_until(|| server.tasks_on(0).len() == 3, WAIT).await);
    let connects = long_connects(&h.provider);

    h.core.redo_tasks().await;
    assert!(TestEnv::wait_until(|| h.listener.ends().len() == 3, WAIT).await);

    for id in 311..=313 {
        assert_eq!(h.listener.end_count(id), 1);
        let end = h.listener.end_of(id).unwrap();
        assert_eq!((end.kind, end.code), (ErrorKind::Ok, 0), "task {id} ended early");
    }
    assert_eq!(server.tasks_on(1), vec![311, 312, 313]);
    assert!(long_connects(&h.provider) > connects);
    h.core.shutdown().await;
}

#[tokio::test]
async fn test_network_change_rebuilds_long_link_and_keeps_retries() {
    let h = harness_with(wifi(), ConnectBehavior::Accept);
    let server = LongServer::spawn(h.provider.clone(), 1);
    for id in 321..=323 {
        assert!(h.core.start_task(long_task(id, 1)).await);
    }
    assert!(TestEnv::wait_until(|| server.tasks_on(0).len() == 3, WAIT).await);
    let connects = long_connects(&h.provider);

    h.core.on_network_change().await;
    assert!(TestEnv::wait_until(|| h.listener.ends().len() == 3, WAIT).await);

    assert!(h.listener.ends().iter().all(|e| e.kind == ErrorKind::Ok));
    assert_eq!(server.tasks_on(1), vec![321, 322, 323]);
    assert!(long_connects(&h.provider) > connects);
    let profiles = h.listener.profiles();
    assert_eq!(profiles.len(), 3);
    assert!(profiles.iter().all(|p| p.remain_retry_count == 1));
    h.core.shutdown().await;
}
