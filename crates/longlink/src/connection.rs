use std::io::IoSlice;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use linkmux_core::config::LongLinkConfig;
use linkmux_core::traits::{
    BoxedStream, FrameCodec, IdentifyProvider, LongLinkProtocol, NetworkInfoProvider,
    SocketProvider, Unpacked,
};
use linkmux_core::{
    codes, dump_items, ConnectProfile, CoreEvent, DisconnectReason, ErrorKind, EventBus,
    LongLinkStatus, NoopRecord, IDENTIFY_TASK_ID, INVALID_TASK_ID, NOOP_TASK_ID,
};
use linkmux_routing::AddressSource;

use crate::events::{LinkEvent, LinkEventSender};
use crate::heartbeat::{HeartbeatAction, HeartbeatScheduler};
use crate::identify::IdentityHandshake;
use crate::race::{failure_code, race_connect, NoopVerifier, RaceConfig, SOCKET_TIMED_OUT};
use crate::send_queue::{SendEntry, SendQueue};

const RECV_CHUNK: usize = 8 * 1024;
const NOOP_TIMEOUT: Duration = Duration::from_secs(8);
const NOOP_TIMEOUT_AFTER_LATE: Duration = Duration::from_secs(5);
const NOOP_LATE_THRESHOLD: Duration = Duration::from_secs(15 * 60);

fn is_reserved(task_id: u32) -> bool {
    task_id == NOOP_TASK_ID || task_id == IDENTIFY_TASK_ID
}

/// Collaborators of the long link.
#[derive(Clone)]
pub struct LinkDeps {
    pub source: Arc<AddressSource>,
    pub sockets: Arc<dyn SocketProvider>,
    pub codec: Arc<dyn FrameCodec>,
    pub protocol: Arc<dyn LongLinkProtocol>,
    pub identify: Arc<dyn IdentifyProvider>,
    pub network: Arc<dyn NetworkInfoProvider>,
}

struct LinkState {
    status: LongLinkStatus,
    generation: u64,
    queue: SendQueue,
    disconnect: Option<DisconnectReason>,
    last_disconnect: Option<DisconnectReason>,
    profile: ConnectProfile,
    last_recv: Option<Instant>,
    breaker: Arc<Notify>,
    worker: Option<JoinHandle<()>>,
}

struct Inner {
    deps: LinkDeps,
    config: LongLinkConfig,
    heartbeat: Mutex<HeartbeatScheduler>,
    events: LinkEventSender,
    bus: EventBus,
    state: Mutex<LinkState>,
}

/// Heartbeat timers of one connection.
struct NoopTimers {
    deadline: Option<Instant>,
    armed_at: Instant,
    interval: Duration,
    fired: bool,
    first_sent: bool,
    watchdog: Option<Instant>,
}

impl NoopTimers {
    fn new(now: Instant) -> Self {
        Self {
            deadline: None,
            armed_at: now,
            interval: Duration::ZERO,
            fired: false,
            first_sent: false,
            watchdog: None,
        }
    }

    fn arm(&mut self, now: Instant, interval: Duration) {
        self.deadline = Some(now + interval);
        self.armed_at = now;
        self.interval = interval;
        self.fired = false;
    }
}

enum Wake {
    Breaker,
    Watchdog,
    NoopAlarm,
    Wrote(std::io::Result<usize>),
    Read(std::io::Result<usize>),
}

/// The multiplexed persistent connection.
///
/// One worker task per connection attempt owns the socket. The handle side
/// only touches the shared state under the lock and wakes the worker
/// through the breaker.
pub struct LongLinkConnection {
    inner: Arc<Inner>,
}

impl LongLinkConnection {
    pub fn new(
        deps: LinkDeps,
        config: LongLinkConfig,
        heartbeat: HeartbeatScheduler,
        events: LinkEventSender,
        bus: EventBus,
    ) -> Self {
        let state = LinkState {
            status: LongLinkStatus::Idle,
            generation: 0,
            queue: SendQueue::new(),
            disconnect: None,
            last_disconnect: None,
            profile: ConnectProfile::default(),
            last_recv: None,
            breaker: Arc::new(Notify::new()),
            worker: None,
        };
        Self {
            inner: Arc::new(Inner {
                deps,
                config,
                heartbeat: Mutex::new(heartbeat),
                events,
                bus,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn status(&self) -> LongLinkStatus {
        self.inner.state().status
    }

    pub fn generation(&self) -> u64 {
        self.inner.state().generation
    }

    pub fn profile(&self) -> ConnectProfile {
        self.inner.state().profile.clone()
    }

    pub fn last_recv_time(&self) -> Option<Instant> {
        self.inner.state().last_recv
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .state()
            .worker
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Starts a connection attempt unless one is connected or in progress.
    /// Returns true only when already connected.
    pub fn make_sure_connected(&self) -> bool {
        let mut state = self.inner.state();
        if state.status == LongLinkStatus::Connected {
            return true;
        }
        if state.worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }

        state.generation += 1;
        let generation = state.generation;
        state.status = LongLinkStatus::Idle;
        state.profile = ConnectProfile::new_attempt(generation);
        state.profile.conn_reason = state.last_disconnect.map_or(0, |r| r.code());
        state.disconnect = None;
        state.queue.clear();
        state.last_recv = None;
        let breaker = Arc::new(Notify::new());
        state.breaker = Arc::clone(&breaker);

        let inner = Arc::clone(&self.inner);
        state.worker = Some(tokio::spawn(async move {
            inner.run(generation, breaker).await;
        }));
        info!(generation, "启动长链连接");
        false
    }

    /// Queues a framed task request. Fails unless connected.
    pub fn send(&self, task_id: u32, cmd_id: u32, body: &[u8], ext: &[u8], send_only: bool) -> bool {
        let frame = self.inner.deps.codec.pack(cmd_id, task_id, body, ext);
        let mut state = self.inner.state();
        if state.status != LongLinkStatus::Connected {
            return false;
        }
        state
            .queue
            .push(SendEntry::new(task_id, cmd_id, frame, send_only));
        state.breaker.notify_one();
        true
    }

    /// Queues a frame only when nothing else is waiting to be written.
    pub fn send_when_no_data(&self, task_id: u32, cmd_id: u32, body: &[u8], ext: &[u8]) -> bool {
        self.inner.enqueue_when_empty(task_id, cmd_id, body, ext)
    }

    /// Drops a queued task none of whose bytes were written.
    pub fn stop(&self, task_id: u32) -> bool {
        self.inner.state().queue.stop(task_id)
    }

    /// Interrupts the worker and waits for it to finish. No connection state
    /// is touched by the worker once this returns.
    pub async fn disconnect(&self, reason: DisconnectReason) {
        let handle = {
            let mut state = self.inner.state();
            let Some(handle) = state.worker.take() else {
                return;
            };
            if !handle.is_finished() {
                info!(reason = ?reason, generation = state.generation, "断开长链");
                state.disconnect = Some(reason);
                state.last_disconnect = Some(reason);
                state.breaker.notify_one();
            }
            handle
        };
        if let Err(e) = handle.await {
            error!(error = %e, "长链工作任务异常退出");
        }
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn heartbeat(&self) -> MutexGuard<'_, HeartbeatScheduler> {
        self.heartbeat.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: LinkEvent) {
        // The scheduler may already be gone during shutdown.
        let _ = self.events.send(event);
    }

    fn fixed_interval(&self) -> Option<Duration> {
        self.deps
            .protocol
            .fixed_heartbeat_interval()
            .or_else(|| self.heartbeat().fixed_interval())
    }

    fn next_interval(&self) -> Duration {
        match self.fixed_interval() {
            Some(interval) => interval,
            None => self.heartbeat().next_interval(),
        }
    }

    fn disconnect_requested(&self) -> Option<DisconnectReason> {
        self.state().disconnect
    }

    fn enqueue_when_empty(&self, task_id: u32, cmd_id: u32, body: &[u8], ext: &[u8]) -> bool {
        let frame = self.deps.codec.pack(cmd_id, task_id, body, ext);
        let mut state = self.state();
        if state.status != LongLinkStatus::Connected {
            return false;
        }
        let queued = state
            .queue
            .push_when_empty(SendEntry::new(task_id, cmd_id, frame, true));
        if queued {
            state.breaker.notify_one();
        }
        queued
    }

    fn set_status(&self, generation: u64, status: LongLinkStatus) {
        let profile = {
            let mut state = self.state();
            if state.status == status {
                return;
            }
            state.status = status;
            state.profile.clone()
        };
        info!(generation, status = %status, ip = %profile.ip, port = profile.port, "长链状态变化");

        if self.fixed_interval().is_none() {
            let actions = match status {
                LongLinkStatus::Connected => {
                    self.heartbeat().on_long_link_established();
                    Vec::new()
                }
                LongLinkStatus::Disconnected => self.heartbeat().on_long_link_disconnect(),
                _ => Vec::new(),
            };
            self.log_heartbeat_actions(&actions);
        }

        self.emit(LinkEvent::StatusChanged { generation, status });
        self.bus
            .publish(CoreEvent::LongLinkStatus { generation, status });
        if status == LongLinkStatus::Connected {
            self.emit(LinkEvent::NetworkReport {
                kind: ErrorKind::Ok,
                code: 0,
                ip: profile.ip,
                host: profile.host,
                port: profile.port,
            });
        }
    }

    fn log_heartbeat_actions(&self, actions: &[HeartbeatAction]) {
        for action in actions {
            match action {
                HeartbeatAction::BadNetwork => warn!("心跳在最小间隔下持续失败"),
                HeartbeatAction::Disconnect => info!("稳定心跳失败导致断线"),
                HeartbeatAction::CalcEnd | HeartbeatAction::ReCalc => {
                    debug!(action = ?action, "心跳间隔调整")
                }
            }
        }
    }

    /// Delivers the error that ended this connection attempt to the scheduler.
    fn emit_failure(&self, generation: u64, kind: ErrorKind, code: i32, report: bool) {
        let profile = self.state().profile.clone();
        self.emit(LinkEvent::Response {
            generation,
            kind,
            code,
            cmd_id: 0,
            task_id: INVALID_TASK_ID,
            body: Vec::new(),
            ext: Vec::new(),
        });
        if report && kind != ErrorKind::Cancelled {
            self.emit(LinkEvent::NetworkReport {
                kind,
                code,
                ip: profile.ip,
                host: profile.host,
                port: profile.port,
            });
        }
    }

    async fn run(self: Arc<Self>, generation: u64, breaker: Arc<Notify>) {
        let Some(stream) = self.connect(generation, &breaker).await else {
            return;
        };

        let (kind, code) = self.read_write(generation, stream, &breaker).await;
        {
            let mut state = self.state();
            state.profile.disconn_time = Some(Instant::now());
            state.profile.disconn_error_kind = kind;
            state.profile.disconn_error_code = code;
        }
        info!(generation, kind = %kind, code, "长链断开");
        self.set_status(generation, LongLinkStatus::Disconnected);
        if !kind.is_ok() {
            self.emit_failure(generation, kind, code, true);
        }
    }

    async fn connect(&self, generation: u64, breaker: &Notify) -> Option<BoxedStream> {
        self.set_status(generation, LongLinkStatus::Connecting);
        let started = Instant::now();
        {
            let mut state = self.state();
            state.profile.start_time = Some(started);
            state.profile.dns_time = Some(started);
            state.profile.net_type = self.deps.network.network_info().net_type;
        }

        let items = tokio::select! {
            biased;
            _ = breaker.notified() => None,
            items = self.deps.source.long_link_items() => Some(items),
        };
        let Some(items) = items else {
            info!(generation, "解析地址时连接被取消");
            self.set_status(generation, LongLinkStatus::ConnectFailed);
            return None;
        };
        {
            let mut state = self.state();
            state.profile.dns_end_time = Some(Instant::now());
            state.profile.ip_list = items.clone();
        }

        if items.is_empty() {
            error!(generation, "长链没有可用地址");
            self.set_status(generation, LongLinkStatus::ConnectFailed);
            self.emit_failure(generation, ErrorKind::Dns, codes::DNS_MAKE_SOCKET_PREPARED, true);
            return None;
        }
        info!(generation, items = %dump_items(&items), "开始连接长链");

        let verifier = self
            .deps
            .protocol
            .verify_on_connect()
            .then(|| NoopVerifier::new(self.deps.codec.clone(), self.deps.protocol.clone()));
        let outcome = race_connect(
            &self.deps.sockets,
            &items,
            &RaceConfig::from(&self.config),
            verifier.as_ref(),
            breaker,
        )
        .await;

        for (index, e) in &outcome.failures {
            let item = &items[*index];
            self.emit(LinkEvent::NetworkReport {
                kind: e.kind(),
                code: failure_code(e),
                ip: item.ip.clone(),
                host: item.host.clone(),
                port: item.port,
            });
        }

        let Some(winner) = outcome.winner else {
            self.set_status(generation, LongLinkStatus::ConnectFailed);
            if !outcome.cancelled && self.disconnect_requested().is_none() {
                self.emit_failure(
                    generation,
                    ErrorKind::Socket,
                    codes::SOCKET_MAKE_SOCKET_PREPARED,
                    false,
                );
            }
            return None;
        };

        for index in &outcome.abandoned {
            let item = &items[*index];
            self.emit(LinkEvent::NetworkReport {
                kind: ErrorKind::Socket,
                code: SOCKET_TIMED_OUT,
                ip: item.ip.clone(),
                host: item.host.clone(),
                port: item.port,
            });
        }

        {
            let mut state = self.state();
            state.profile.select(winner.index);
            state.profile.conn_time = Some(Instant::now());
            state.profile.conn_rtt = winner.rtt;
            state.profile.conn_cost = outcome.cost;
            if let Some(addr) = winner.local_addr {
                state.profile.local_ip = addr.ip().to_string();
                state.profile.local_port = addr.port();
            }
            if state.disconnect.is_some() {
                drop(state);
                self.set_status(generation, LongLinkStatus::ConnectFailed);
                return None;
            }
        }

        self.set_status(generation, LongLinkStatus::Connected);
        Some(winner.stream)
    }

    async fn read_write(
        &self,
        generation: u64,
        stream: BoxedStream,
        breaker: &Notify,
    ) -> (ErrorKind, i32) {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut identify = IdentityHandshake::new(self.deps.identify.clone());
        let mut noop = NoopTimers::new(Instant::now());
        let mut buf = BytesMut::with_capacity(RECV_CHUNK);

        let (kind, code) = loop {
            if noop.deadline.is_none() {
                self.on_noop_alarm(&mut noop, &mut identify);
            }

            let chunks: Vec<Bytes> = self.state().queue.snapshot();
            let slices: Vec<IoSlice<'_>> = chunks.iter().map(|c| IoSlice::new(c)).collect();
            let has_data = !slices.is_empty();
            let noop_deadline = noop.deadline.unwrap_or_else(Instant::now);
            let watchdog = noop.watchdog;
            if buf.capacity() - buf.len() < RECV_CHUNK / 2 {
                buf.reserve(RECV_CHUNK);
            }

            let wake = tokio::select! {
                biased;
                _ = breaker.notified() => Wake::Breaker,
                _ = sleep_until(watchdog.unwrap_or(noop_deadline)), if watchdog.is_some() => Wake::Watchdog,
                _ = sleep_until(noop_deadline) => Wake::NoopAlarm,
                r = writer.write_vectored(&slices), if has_data => Wake::Wrote(r),
                r = reader.read_buf(&mut buf) => Wake::Read(r),
            };
            if !matches!(wake, Wake::Wrote(Ok(n)) if n > 0) {
                self.state().queue.release();
            }

            match wake {
                Wake::Breaker => {
                    if let Some(reason) = self.disconnect_requested() {
                        info!(generation, reason = ?reason, "长链收到断开请求");
                        break (ErrorKind::Cancelled, codes::SOCKET_USER_BREAK);
                    }
                }
                Wake::Watchdog => {
                    warn!(generation, "心跳响应超时");
                    break (ErrorKind::Socket, codes::SOCKET_RECV_ERR);
                }
                Wake::NoopAlarm => {
                    noop.deadline = None;
                    noop.fired = true;
                }
                Wake::Wrote(Ok(0)) => {
                    break (ErrorKind::Socket, codes::SOCKET_WRITE_NONBLOCK);
                }
                Wake::Wrote(Ok(n)) => {
                    let progress = self.state().queue.advance(n);
                    for p in progress {
                        if p.started && !is_reserved(p.task_id) {
                            self.emit(LinkEvent::Send {
                                generation,
                                task_id: p.task_id,
                            });
                        }
                        if p.completed {
                            debug!(task_id = p.task_id, cmd_id = p.cmd_id, send_only = p.send_only, "任务数据发送完成");
                        }
                    }
                    let interval = noop.interval;
                    if noop.deadline.is_some() {
                        noop.arm(Instant::now(), interval);
                    }
                }
                Wake::Wrote(Err(e)) => {
                    warn!(generation, error = %e, "长链写入失败");
                    break (
                        ErrorKind::Socket,
                        e.raw_os_error().unwrap_or(codes::SOCKET_WRITE_NONBLOCK),
                    );
                }
                Wake::Read(Ok(0)) => {
                    info!(generation, "对端关闭长链");
                    break (ErrorKind::Socket, codes::SOCKET_SHUTDOWN);
                }
                Wake::Read(Err(e)) => {
                    warn!(generation, error = %e, "长链读取失败");
                    break (
                        ErrorKind::Socket,
                        e.raw_os_error().unwrap_or(codes::SOCKET_RECV_ERR),
                    );
                }
                Wake::Read(Ok(_)) => {
                    if let Err(failure) =
                        self.dispatch_frames(generation, &mut buf, &mut identify, &mut noop)
                    {
                        break failure;
                    }
                }
            }
        };

        if noop.watchdog.is_some() {
            self.finish_noop(false, code == codes::SOCKET_RECV_ERR);
        }
        self.state().queue.release();
        (kind, code)
    }

    fn on_noop_alarm(&self, noop: &mut NoopTimers, identify: &mut IdentityHandshake) {
        let now = Instant::now();
        let fixed = self.fixed_interval();
        if noop.first_sent && noop.fired && fixed.is_none() {
            self.heartbeat().judge_doze_style(now);
        }
        let actual = if noop.fired {
            now.saturating_duration_since(noop.armed_at)
        } else {
            Duration::ZERO
        };

        if noop.watchdog.is_none() {
            let late = actual >= NOOP_LATE_THRESHOLD;
            if self.noop_request(identify) {
                let timeout = if late { NOOP_TIMEOUT_AFTER_LATE } else { NOOP_TIMEOUT };
                noop.watchdog = Some(now + timeout);
                if fixed.is_none() {
                    self.heartbeat().on_heartbeat_start(now);
                }
                self.state().profile.noop_history.push(NoopRecord {
                    sent_at: now,
                    interval: noop.interval,
                    succeeded: None,
                });
            }
        }

        noop.first_sent = true;
        let interval = self.next_interval();
        noop.arm(now, interval);
        debug!(interval = ?interval, "下一次心跳");
    }

    fn noop_request(&self, identify: &mut IdentityHandshake) -> bool {
        if let Some(request) = identify.challenge_buffer() {
            let frame = self
                .deps
                .codec
                .pack(request.cmd_id, request.task_id, &request.body, &[]);
            let mut state = self.state();
            state
                .queue
                .push(SendEntry::new(request.task_id, request.cmd_id, frame, true));
            drop(state);
            identify.set_task_id(request.task_id);
            return true;
        }

        let (body, ext) = self.deps.protocol.noop_request_body();
        let queued =
            self.enqueue_when_empty(NOOP_TASK_ID, self.deps.protocol.noop_cmd_id(), &body, &ext);
        if !queued {
            debug!("发送队列非空，跳过本次心跳");
        }
        queued
    }

    fn finish_noop(&self, success: bool, fail_timeout: bool) {
        if let Some(record) = self.state().profile.noop_history.last_mut() {
            record.succeeded = Some(success);
        }
        if self.fixed_interval().is_none() {
            let actions = self.heartbeat().on_heart_result(success, fail_timeout);
            self.log_heartbeat_actions(&actions);
        }
    }

    fn dispatch_frames(
        &self,
        generation: u64,
        buf: &mut BytesMut,
        identify: &mut IdentityHandshake,
        noop: &mut NoopTimers,
    ) -> Result<(), (ErrorKind, i32)> {
        while !buf.is_empty() {
            match self.deps.codec.unpack(buf) {
                Unpacked::Error => {
                    error!(generation, cached = buf.len(), "长链数据解包失败");
                    return Err((ErrorKind::NetMsgXp, codes::NETMSGXP_HANDLE_BUFFER_ERR));
                }
                Unpacked::NeedMore {
                    task_id,
                    package_len,
                } => {
                    if let Some(task_id) = task_id.filter(|id| !is_reserved(*id)) {
                        self.emit(LinkEvent::Recv {
                            generation,
                            task_id,
                            cached: buf.len(),
                            total: package_len,
                        });
                    }
                    return Ok(());
                }
                Unpacked::Frame(frame) => {
                    if frame.consumed == 0 || frame.consumed > buf.len() {
                        error!(generation, consumed = frame.consumed, "帧长度异常");
                        return Err((ErrorKind::NetMsgXp, codes::NETMSGXP_HANDLE_BUFFER_ERR));
                    }
                    buf.advance(frame.consumed);
                    self.state().last_recv = Some(Instant::now());

                    let mut is_noop = false;
                    if identify.is_identify_response(frame.cmd_id, frame.task_id) {
                        is_noop = true;
                        if identify.on_identify_response(&frame.body) {
                            let profile = self.state().profile.clone();
                            self.emit(LinkEvent::NetworkReport {
                                kind: ErrorKind::Ok,
                                code: 0,
                                ip: profile.ip,
                                host: profile.host,
                                port: profile.port,
                            });
                        }
                    }
                    if self.deps.protocol.is_noop_response(
                        frame.cmd_id,
                        frame.task_id,
                        &frame.body,
                        &frame.ext,
                    ) {
                        is_noop = true;
                    }
                    if is_noop {
                        if noop.watchdog.take().is_some() {
                            debug!(generation, "收到心跳响应");
                            self.finish_noop(true, false);
                        }
                        continue;
                    }

                    self.emit(LinkEvent::Response {
                        generation,
                        kind: ErrorKind::Ok,
                        code: 0,
                        cmd_id: frame.cmd_id,
                        task_id: frame.task_id,
                        body: frame.body,
                        ext: frame.ext,
                    });
                }
            }
        }
        Ok(())
    }
}
