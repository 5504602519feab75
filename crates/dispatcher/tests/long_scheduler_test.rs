use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};

use linkmux_core::config::SchedulerConfig;
use linkmux_core::traits::DecodeResult;
use linkmux_core::{
    codes, ActiveLogic, ChannelType, ConnectProfile, DisconnectReason, ErrorKind, LongLinkStatus,
    NetType, NetworkInfo,
};
use linkmux_dispatcher::{
    FailHandle, LinkTransport, LongLinkTaskScheduler, LongSchedulerDeps, QualityGate, TaskOutcome,
    TaskResultSink,
};
use linkmux_longlink::{link_event_channel, LinkEvent, LinkEventSender, LongLinkConnectMonitor, MonitoredLink};
use linkmux_testing_utils::{
    FakeAuthGate, FakeLongLinkProtocol, FakeNetworkInfo, FakeTaskCodec, TaskBuilder, TestEnv,
};

const WAIT: Duration = Duration::from_secs(120);

/// Long link that connects on demand and records what the scheduler sends.
struct FakeLink {
    status: Mutex<LongLinkStatus>,
    generation: AtomicU64,
    attempts: Mutex<Vec<Instant>>,
    sends: Mutex<Vec<(u64, u32, Vec<u8>)>>,
    stops: Mutex<Vec<u32>>,
    disconnects: Mutex<Vec<DisconnectReason>>,
    connectable: AtomicBool,
    events: LinkEventSender,
}

impl FakeLink {
    fn new(events: LinkEventSender) -> Self {
        Self {
            status: Mutex::new(LongLinkStatus::Idle),
            generation: AtomicU64::new(0),
            attempts: Mutex::new(Vec::new()),
            sends: Mutex::new(Vec::new()),
            stops: Mutex::new(Vec::new()),
            disconnects: Mutex::new(Vec::new()),
            connectable: AtomicBool::new(true),
            events,
        }
    }

    fn current_status(&self) -> LongLinkStatus {
        *self.status.lock().unwrap()
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn send_count(&self) -> usize {
        self.sends.lock().unwrap().len()
    }

    fn sent_task_ids(&self) -> Vec<u32> {
        self.sends.lock().unwrap().iter().map(|(_, id, _)| *id).collect()
    }

    fn respond(&self, task_id: u32, body: &[u8]) {
        let _ = self.events.send(LinkEvent::Response {
            generation: self.current_generation(),
            kind: ErrorKind::Ok,
            code: 0,
            cmd_id: 1,
            task_id,
            body: body.to_vec(),
            ext: Vec::new(),
        });
    }

    /// The peer closed the connection.
    fn drop_connection(&self) {
        *self.status.lock().unwrap() = LongLinkStatus::Disconnected;
        let _ = self.events.send(LinkEvent::Response {
            generation: self.current_generation(),
            kind: ErrorKind::Socket,
            code: codes::SOCKET_RECV_ERR,
            cmd_id: 0,
            task_id: 0,
            body: Vec::new(),
            ext: Vec::new(),
        });
    }

    /// Local teardown. A live connection reports the user break for its
    /// generation after going down.
    fn do_disconnect(&self, reason: DisconnectReason) {
        self.disconnects.lock().unwrap().push(reason);
        let was = std::mem::replace(&mut *self.status.lock().unwrap(), LongLinkStatus::Disconnected);
        let generation = self.current_generation();
        let _ = self.events.send(LinkEvent::StatusChanged {
            generation,
            status: LongLinkStatus::Disconnected,
        });
        if matches!(was, LongLinkStatus::Connected | LongLinkStatus::Connecting) {
            let _ = self.events.send(LinkEvent::Response {
                generation,
                kind: ErrorKind::Cancelled,
                code: codes::SOCKET_USER_BREAK,
                cmd_id: 0,
                task_id: 0,
                body: Vec::new(),
                ext: Vec::new(),
            });
        }
    }
}

#[async_trait]
impl LinkTransport for FakeLink {
    fn status(&self) -> LongLinkStatus {
        self.current_status()
    }

    fn generation(&self) -> u64 {
        self.current_generation()
    }

    fn profile(&self) -> ConnectProfile {
        ConnectProfile {
            generation: self.current_generation(),
            host: "long.test".to_string(),
            ip: "10.0.0.1".to_string(),
            port: 8080,
            ..ConnectProfile::default()
        }
    }

    fn send(&self, task_id: u32, _cmd_id: u32, body: &[u8], _ext: &[u8], _send_only: bool) -> bool {
        if self.current_status() != LongLinkStatus::Connected {
            return false;
        }
        let generation = self.current_generation();
        self.sends
            .lock()
            .unwrap()
            .push((generation, task_id, body.to_vec()));
        let _ = self.events.send(LinkEvent::Send { generation, task_id });
        true
    }

    fn stop(&self, task_id: u32) -> bool {
        self.stops.lock().unwrap().push(task_id);
        true
    }

    async fn disconnect(&self, reason: DisconnectReason) {
        self.do_disconnect(reason);
    }
}

#[async_trait]
impl MonitoredLink for FakeLink {
    fn status(&self) -> LongLinkStatus {
        self.current_status()
    }

    fn last_attempt_at(&self) -> Option<Instant> {
        self.attempts.lock().unwrap().last().copied()
    }

    fn make_sure_connected(&self) -> bool {
        self.attempts.lock().unwrap().push(Instant::now());
        if !self.connectable.load(Ordering::SeqCst) {
            return false;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.status.lock().unwrap() = LongLinkStatus::Connected;
        let _ = self.events.send(LinkEvent::StatusChanged {
            generation,
            status: LongLinkStatus::Connected,
        });
        true
    }

    async fn disconnect(&self, reason: DisconnectReason) {
        self.do_disconnect(reason);
    }
}

#[derive(Default)]
struct RecordingSink {
    ends: Mutex<Vec<TaskOutcome>>,
    pushes: Mutex<Vec<(u32, Vec<u8>)>>,
    reports: Mutex<Vec<(ErrorKind, i32)>>,
    retry_alls: Mutex<Vec<(FailHandle, u32)>>,
}

impl RecordingSink {
    fn ends(&self) -> Vec<TaskOutcome> {
        self.ends.lock().unwrap().clone()
    }

    fn end_count(&self) -> usize {
        self.ends.lock().unwrap().len()
    }
}

impl TaskResultSink for RecordingSink {
    fn on_task_end(&self, outcome: TaskOutcome) {
        self.ends.lock().unwrap().push(outcome);
    }

    fn on_push(&self, cmd_id: u32, _task_id: u32, body: &[u8], _ext: &[u8]) {
        self.pushes.lock().unwrap().push((cmd_id, body.to_vec()));
    }

    fn on_network_report(
        &self,
        _channel: ChannelType,
        kind: ErrorKind,
        code: i32,
        _ip: &str,
        _host: &str,
        _port: u16,
    ) {
        self.reports.lock().unwrap().push((kind, code));
    }

    fn on_retry_all(&self, _kind: ErrorKind, _code: i32, handle: FailHandle, src_task_id: u32) {
        self.retry_alls.lock().unwrap().push((handle, src_task_id));
    }
}

struct Harness {
    link: Arc<FakeLink>,
    codec: Arc<FakeTaskCodec>,
    auth: Arc<FakeAuthGate>,
    sink: Arc<RecordingSink>,
    scheduler: LongLinkTaskScheduler,
}

fn harness() -> Harness {
    let (tx, rx) = link_event_channel();
    let link = Arc::new(FakeLink::new(tx));
    let network = Arc::new(FakeNetworkInfo::new(NetworkInfo::new(NetType::Wifi, "home")));
    let monitor = Arc::new(LongLinkConnectMonitor::new(
        link.clone(),
        Arc::new(ActiveLogic::new(true)),
        network.clone(),
        Duration::from_millis(500),
    ));
    let codec = Arc::new(FakeTaskCodec::new());
    let auth = Arc::new(FakeAuthGate::new(true));
    let sink = Arc::new(RecordingSink::default());

    let deps = LongSchedulerDeps {
        link: link.clone(),
        monitor,
        codec: codec.clone(),
        protocol: Arc::new(FakeLongLinkProtocol::new()),
        auth: auth.clone(),
        network,
        quality: Arc::new(QualityGate::new(false, true, Instant::now())),
        sink: sink.clone(),
    };
    let scheduler = LongLinkTaskScheduler::spawn(deps, SchedulerConfig::default(), rx);
    Harness {
        link,
        codec,
        auth,
        sink,
        scheduler,
    }
}

#[tokio::test(start_paused = true)]
async fn test_response_completes_task() {
    let h = harness();
    let task = TaskBuilder::new().with_id(1).with_retry_count(2).build();
    assert!(h.scheduler.start_task(task).await);
    assert!(TestEnv::wait_until(|| h.link.send_count() == 1, WAIT).await);

    h.link.respond(1, b"pong");
    assert!(TestEnv::wait_until(|| h.sink.end_count() == 1, WAIT).await);

    let outcome = &h.sink.ends()[0];
    assert_eq!(outcome.task_id(), 1);
    assert_eq!(outcome.kind, ErrorKind::Ok);
    assert_eq!(outcome.channel, ChannelType::Long);
    assert_eq!(outcome.profile.history().len(), 1);
    assert_eq!(h.codec.decoded(), vec![(1, b"pong".to_vec())]);
    assert_eq!(h.scheduler.task_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_task_is_refused() {
    let h = harness();
    assert!(h.scheduler.start_task(TaskBuilder::new().with_id(7).build()).await);
    assert!(!h.scheduler.start_task(TaskBuilder::new().with_id(7).build()).await);
    assert_eq!(h.scheduler.task_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_no_retry_task_fails_once_on_link_loss() {
    let h = harness();
    let task = TaskBuilder::new().with_id(1).with_retry_count(0).build();
    assert!(h.scheduler.start_task(task).await);
    assert!(TestEnv::wait_until(|| h.link.send_count() == 1, WAIT).await);

    h.link.drop_connection();
    assert!(TestEnv::wait_until(|| h.sink.end_count() == 1, WAIT).await);

    sleep(Duration::from_secs(10)).await;
    let ends = h.sink.ends();
    assert_eq!(ends.len(), 1);
    assert_eq!(ends[0].kind, ErrorKind::Socket);
    assert_eq!(ends[0].code, codes::SOCKET_RECV_ERR);
    assert_eq!(h.link.send_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_attempts_bounded_by_retry_count() {
    let h = harness();
    let task = TaskBuilder::new().with_id(1).with_retry_count(2).build();
    assert!(h.scheduler.start_task(task).await);

    for attempt in 1..=3 {
        assert!(
            TestEnv::wait_until(|| h.link.send_count() == attempt, WAIT).await,
            "attempt {attempt} was never sent"
        );
        h.link.drop_connection();
    }
    assert!(TestEnv::wait_until(|| h.sink.end_count() == 1, WAIT).await);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(h.link.send_count(), 3);
    let ends = h.sink.ends();
    assert_eq!(ends.len(), 1);
    assert_eq!(ends[0].profile.history().len(), 3);
    assert_eq!(ends[0].profile.remain_retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_remote_close_fails_every_running_task() {
    let h = harness();
    for id in 1..=3 {
        let task = TaskBuilder::new().with_id(id).with_retry_count(0).build();
        assert!(h.scheduler.start_task(task).await);
    }
    assert!(TestEnv::wait_until(|| h.link.send_count() == 3, WAIT).await);

    h.link.drop_connection();
    assert!(TestEnv::wait_until(|| h.sink.end_count() == 3, WAIT).await);
    assert!(h.sink.ends().iter().all(|o| o.kind == ErrorKind::Socket));
    // The link reported its own loss, so the scheduler has nothing to tear down.
    assert!(h.link.disconnects.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stale_connection_error_is_ignored() {
    let h = harness();
    let task = TaskBuilder::new().with_id(1).with_retry_count(1).build();
    assert!(h.scheduler.start_task(task).await);
    assert!(TestEnv::wait_until(|| h.link.send_count() == 1, WAIT).await);

    let _ = h.link.events.send(LinkEvent::Response {
        generation: h.link.current_generation() - 1,
        kind: ErrorKind::Socket,
        code: codes::SOCKET_RECV_ERR,
        cmd_id: 0,
        task_id: 0,
        body: Vec::new(),
        ext: Vec::new(),
    });
    sleep(Duration::from_millis(500)).await;

    assert_eq!(h.sink.end_count(), 0);
    let profile = h.scheduler.task_profile(1).await.expect("task still queued");
    assert!(profile.is_running());
    assert_eq!(profile.remain_retry_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_redo_requeues_without_consuming_retry() {
    let h = harness();
    for id in 1..=2 {
        let task = TaskBuilder::new().with_id(id).with_retry_count(0).build();
        assert!(h.scheduler.start_task(task).await);
    }
    assert!(TestEnv::wait_until(|| h.link.send_count() == 2, WAIT).await);

    h.scheduler.redo_tasks();
    assert!(TestEnv::wait_until(|| h.link.send_count() == 4, WAIT).await);

    assert_eq!(h.sink.end_count(), 0);
    let profile = h.scheduler.task_profile(2).await.expect("task still queued");
    assert_eq!(profile.remain_retry_count, 0);
    assert!(profile.history().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reset_and_redo_survives_user_break() {
    let h = harness();
    for id in 1..=3 {
        let task = TaskBuilder::new().with_id(id).with_retry_count(0).build();
        assert!(h.scheduler.start_task(task).await);
    }
    assert!(TestEnv::wait_until(|| h.link.send_count() == 3, WAIT).await);
    let first_generation = h.link.current_generation();

    h.scheduler.reset_and_redo(DisconnectReason::Reset).await;
    assert_eq!(*h.link.disconnects.lock().unwrap(), vec![DisconnectReason::Reset]);
    assert!(TestEnv::wait_until(|| h.link.send_count() == 6, WAIT).await);

    sleep(Duration::from_secs(3)).await;
    assert_eq!(h.sink.end_count(), 0);
    let resent: Vec<u64> = h.link.sends.lock().unwrap()[3..].iter().map(|(g, _, _)| *g).collect();
    assert!(resent.iter().all(|g| *g > first_generation));
    for id in 1..=3 {
        let profile = h.scheduler.task_profile(id).await.expect("task still queued");
        assert!(profile.is_running());
        assert_eq!(profile.remain_retry_count, 0);
        assert!(profile.history().is_empty());
    }
}

#[tokio::test(start_paused = true)]
async fn test_network_change_redoes_in_flight_tasks() {
    let h = harness();
    for id in 1..=3 {
        let task = TaskBuilder::new().with_id(id).with_retry_count(1).build();
        assert!(h.scheduler.start_task(task).await);
    }
    assert!(TestEnv::wait_until(|| h.link.send_count() == 3, WAIT).await);

    h.scheduler.network_change().await;
    assert!(!h.link.disconnects.lock().unwrap().is_empty());
    assert!(TestEnv::wait_until(|| h.link.send_count() == 6, WAIT).await);

    sleep(Duration::from_secs(3)).await;
    assert_eq!(h.sink.end_count(), 0);
    for id in 1..=3 {
        let profile = h.scheduler.task_profile(id).await.expect("task still queued");
        assert_eq!(profile.remain_retry_count, 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_push_is_forwarded() {
    let h = harness();
    let _ = h.link.events.send(LinkEvent::Response {
        generation: 0,
        kind: ErrorKind::Ok,
        code: 0,
        cmd_id: 99,
        task_id: 0,
        body: b"hello".to_vec(),
        ext: Vec::new(),
    });
    assert!(TestEnv::wait_until(|| !h.sink.pushes.lock().unwrap().is_empty(), WAIT).await);
    assert_eq!(h.sink.pushes.lock().unwrap()[0], (99, b"hello".to_vec()));
    assert_eq!(h.sink.end_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_encode_failure_ends_task_without_sending() {
    let h = harness();
    h.codec.fail_encode(5);
    let task = TaskBuilder::new().with_id(5).with_retry_count(3).build();
    assert!(h.scheduler.start_task(task).await);

    assert!(TestEnv::wait_until(|| h.sink.end_count() == 1, WAIT).await);
    let outcome = &h.sink.ends()[0];
    assert_eq!(outcome.kind, ErrorKind::EnDecode);
    assert_eq!(outcome.code, 0);
    assert_eq!(outcome.handle, FailHandle::TaskEnd);
    assert_eq!(h.link.send_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_send_only_task_ends_after_send() {
    let h = harness();
    let task = TaskBuilder::new().with_id(3).with_send_only(true).build();
    assert!(h.scheduler.start_task(task).await);

    assert!(TestEnv::wait_until(|| h.sink.end_count() == 1, WAIT).await);
    assert_eq!(h.sink.ends()[0].kind, ErrorKind::Ok);
    assert_eq!(h.link.sent_task_ids(), vec![3]);
}

#[tokio::test(start_paused = true)]
async fn test_first_packet_timeout_resets_link() {
    let h = harness();
    let task = TaskBuilder::new().with_id(1).with_retry_count(1).build();
    assert!(h.scheduler.start_task(task).await);
    assert!(TestEnv::wait_until(|| h.link.send_count() == 1, WAIT).await);

    assert!(
        TestEnv::wait_until(
            || h.link.disconnects.lock().unwrap().contains(&DisconnectReason::TaskTimeout),
            WAIT
        )
        .await
    );
    assert!(h
        .sink
        .reports
        .lock()
        .unwrap()
        .contains(&(ErrorKind::NetMsgXp, codes::LONG_FIRST_PKG_TIMEOUT)));
}

#[tokio::test(start_paused = true)]
async fn test_retry_all_verdict_goes_to_sink() {
    let h = harness();
    h.codec.push_verdict(DecodeResult::SessionTimeout);
    let task = TaskBuilder::new().with_id(4).with_retry_count(1).build();
    assert!(h.scheduler.start_task(task).await);
    assert!(TestEnv::wait_until(|| h.link.send_count() == 1, WAIT).await);

    h.link.respond(4, b"expired");
    assert!(TestEnv::wait_until(|| !h.sink.retry_alls.lock().unwrap().is_empty(), WAIT).await);
    assert_eq!(
        h.sink.retry_alls.lock().unwrap()[0],
        (FailHandle::SessionTimeout, 4)
    );

    h.scheduler
        .retry_tasks(ErrorKind::EnDecode, 0, FailHandle::SessionTimeout, 4);
    assert!(TestEnv::wait_until(|| h.link.send_count() == 2, WAIT).await);
    assert_eq!(h.sink.end_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unauthenticated_task_waits() {
    let h = harness();
    h.auth.set(false);
    let task = TaskBuilder::new().with_id(1).with_need_authed(true).build();
    assert!(h.scheduler.start_task(task).await);

    sleep(Duration::from_secs(3)).await;
    assert_eq!(h.link.send_count(), 0);

    h.auth.set(true);
    assert!(TestEnv::wait_until(|| h.link.send_count() == 1, WAIT).await);
}

#[tokio::test(start_paused = true)]
async fn test_stop_running_task() {
    let h = harness();
    let task = TaskBuilder::new().with_id(9).build();
    assert!(h.scheduler.start_task(task).await);
    assert!(TestEnv::wait_until(|| h.link.send_count() == 1, WAIT).await);

    assert!(h.scheduler.stop_task(9).await);
    assert!(!h.scheduler.has_task(9).await);
    assert_eq!(*h.link.stops.lock().unwrap(), vec![9]);
    assert!(!h.scheduler.stop_task(9).await);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_link_holds_tasks() {
    let h = harness();
    h.link.connectable.store(false, Ordering::SeqCst);
    let task = TaskBuilder::new().with_id(1).with_retry_count(0).build();
    assert!(h.scheduler.start_task(task).await);

    sleep(Duration::from_secs(8)).await;
    assert_eq!(h.link.send_count(), 0);
    assert!(h.scheduler.has_task(1).await);

    h.link.connectable.store(true, Ordering::SeqCst);
    assert!(TestEnv::wait_until(|| h.link.send_count() == 1, WAIT).await);
    h.scheduler.shutdown().await;
}
