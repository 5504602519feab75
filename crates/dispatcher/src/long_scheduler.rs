//! 长链任务调度：排队、超时扫描、发送准入与失败重试。
//!
//! 调度器是一个独立的 tokio 任务，所有状态只在该任务内修改。外部通过
//! [`LongLinkTaskScheduler`] 句柄投递命令，长链事件经 [`LinkEventReceiver`] 到达。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use linkmux_core::config::SchedulerConfig;
use linkmux_core::resilience::TimeoutStatus;
use linkmux_core::timeouts::{first_pkg_timeout, pkg_pkg_timeout, read_write_timeout};
use linkmux_core::traits::{
    AuthGate, DecodeResult, EncodedRequest, LongLinkProtocol, NetworkInfoProvider, TaskCodec,
};
use linkmux_core::{
    codes, ChannelType, DisconnectReason, ErrorKind, LongLinkStatus, NetType, Task, TaskProfile,
    INVALID_TASK_ID,
};
use linkmux_longlink::{LinkEvent, LinkEventReceiver, LongLinkConnectMonitor};

use crate::outcome::{FailHandle, TaskOutcome, TaskResultSink};
use crate::quality::QualityGate;
use crate::queue::TaskQueue;
use crate::transport::LinkTransport;

/// Collaborators of the long-link scheduler.
#[derive(Clone)]
pub struct LongSchedulerDeps {
    pub link: Arc<dyn LinkTransport>,
    pub monitor: Arc<LongLinkConnectMonitor>,
    pub codec: Arc<dyn TaskCodec>,
    pub protocol: Arc<dyn LongLinkProtocol>,
    pub auth: Arc<dyn AuthGate>,
    pub network: Arc<dyn NetworkInfoProvider>,
    pub quality: Arc<QualityGate>,
    pub sink: Arc<dyn TaskResultSink>,
}

enum Command {
    Start {
        task: Task,
        reply: oneshot::Sender<bool>,
    },
    Stop {
        task_id: u32,
        reply: oneshot::Sender<bool>,
    },
    Has {
        task_id: u32,
        reply: oneshot::Sender<bool>,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
    Profile {
        task_id: u32,
        reply: oneshot::Sender<Option<TaskProfile>>,
    },
    ContinuousFails {
        reply: oneshot::Sender<u32>,
    },
    Clear,
    Redo,
    ResetRedo {
        reason: DisconnectReason,
        reply: oneshot::Sender<()>,
    },
    Retry {
        kind: ErrorKind,
        code: i32,
        handle: FailHandle,
        src_task_id: u32,
    },
    NetworkChange {
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// Handle of the long-link scheduler actor.
pub struct LongLinkTaskScheduler {
    commands: mpsc::UnboundedSender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LongLinkTaskScheduler {
    pub fn spawn(deps: LongSchedulerDeps, config: SchedulerConfig, events: LinkEventReceiver) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let core = LongCore::new(deps, config);
        let worker = tokio::spawn(core.run(rx, events));
        Self {
            commands: tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).ok()?;
        rx.await.ok()
    }

    fn post(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("长链调度器已停止，忽略命令");
        }
    }

    /// Queues the task. False when it could not be accepted.
    pub async fn start_task(&self, task: Task) -> bool {
        self.request(|reply| Command::Start { task, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn stop_task(&self, task_id: u32) -> bool {
        self.request(|reply| Command::Stop { task_id, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn has_task(&self, task_id: u32) -> bool {
        self.request(|reply| Command::Has { task_id, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn task_count(&self) -> usize {
        self.request(|reply| Command::Count { reply })
            .await
            .unwrap_or(0)
    }

    /// Snapshot of a queued task's run state.
    pub async fn task_profile(&self, task_id: u32) -> Option<TaskProfile> {
        self.request(|reply| Command::Profile { task_id, reply })
            .await
            .flatten()
    }

    pub async fn continuous_fail_count(&self) -> u32 {
        self.request(|reply| Command::ContinuousFails { reply })
            .await
            .unwrap_or(0)
    }

    /// Drops every task without a callback and resets the link.
    pub fn clear_tasks(&self) {
        self.post(Command::Clear);
    }

    /// Puts running tasks back into the waiting state without consuming a retry.
    pub fn redo_tasks(&self) {
        self.post(Command::Redo);
    }

    /// Tears the link down and redoes every task. The tasks are released from
    /// the old connection before it closes, so its teardown report fails nothing.
    pub async fn reset_and_redo(&self, reason: DisconnectReason) {
        let _ = self
            .request(|reply| Command::ResetRedo { reason, reply })
            .await;
    }

    /// Fails every running task with the given verdict.
    pub fn retry_tasks(&self, kind: ErrorKind, code: i32, handle: FailHandle, src_task_id: u32) {
        self.post(Command::Retry {
            kind,
            code,
            handle,
            src_task_id,
        });
    }

    /// Rebuilds the link for a new network and redoes its tasks. True when a
    /// fresh connection was started right away.
    pub async fn network_change(&self) -> bool {
        self.request(|reply| Command::NetworkChange { reply })
            .await
            .unwrap_or(false)
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(error = %e, "长链调度任务异常退出");
            }
        }
    }
}

impl Drop for LongLinkTaskScheduler {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            worker.abort();
        }
    }
}

struct LongCore {
    deps: LongSchedulerDeps,
    config: SchedulerConfig,
    queue: TaskQueue,
    last_batch_error_time: Option<Instant>,
    retry_interval: Duration,
    continuous_fail_count: u32,
}

impl LongCore {
    fn new(deps: LongSchedulerDeps, config: SchedulerConfig) -> Self {
        Self {
            deps,
            config,
            queue: TaskQueue::new(),
            last_batch_error_time: None,
            retry_interval: Duration::ZERO,
            continuous_fail_count: 0,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, mut events: LinkEventReceiver) {
        let mut tick = tokio::time::interval(self.config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("长链调度器启动");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(command) => self.on_command(command).await,
                },
                Some(event) = events.recv() => self.on_link_event(event).await,
                _ = tick.tick() => self.run_loop().await,
            }
        }
        info!(remaining = self.queue.len(), "长链调度器停止");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Start { task, reply } => {
                let accepted = self.start_task(task);
                let _ = reply.send(accepted);
                if accepted {
                    self.run_loop().await;
                }
            }
            Command::Stop { task_id, reply } => {
                let _ = reply.send(self.stop_task(task_id));
            }
            Command::Has { task_id, reply } => {
                let _ = reply.send(self.queue.contains(task_id));
            }
            Command::Count { reply } => {
                let _ = reply.send(self.queue.len());
            }
            Command::Profile { task_id, reply } => {
                let _ = reply.send(self.queue.get(task_id).cloned());
            }
            Command::ContinuousFails { reply } => {
                let _ = reply.send(self.continuous_fail_count);
            }
            Command::Clear => self.clear_tasks().await,
            Command::Redo => {
                self.redo_tasks();
                self.run_loop().await;
            }
            Command::ResetRedo { reason, reply } => {
                self.redo_tasks();
                self.deps.link.disconnect(reason).await;
                let _ = reply.send(());
                self.run_loop().await;
            }
            Command::Retry {
                kind,
                code,
                handle,
                src_task_id,
            } => {
                self.batch_error(kind, code, handle, src_task_id, None).await;
                self.run_loop().await;
            }
            Command::NetworkChange { reply } => {
                let reconnecting = self.deps.monitor.network_change().await;
                self.redo_tasks();
                let _ = reply.send(reconnecting);
                self.run_loop().await;
            }
            Command::Shutdown => {}
        }
    }

    fn start_task(&mut self, task: Task) -> bool {
        if self.queue.contains(task.task_id) {
            warn!(task_id = task.task_id, "长链任务已存在");
            return false;
        }
        info!(
            task_id = task.task_id,
            cmd_id = task.cmd_id,
            retry = task.retry_count,
            priority = task.priority,
            "长链任务入队"
        );
        let mut profile = TaskProfile::new(task, Instant::now());
        profile.link_type = Some(ChannelType::Long);
        self.queue.push(profile);
        true
    }

    fn stop_task(&mut self, task_id: u32) -> bool {
        let Some(profile) = self.queue.remove(task_id) else {
            return false;
        };
        if profile.is_running() {
            self.deps.link.stop(task_id);
        }
        info!(task_id, "长链任务被停止");
        true
    }

    async fn clear_tasks(&mut self) {
        let dropped = self.queue.drain();
        info!(count = dropped.len(), "清空长链任务");
        self.deps.link.disconnect(DisconnectReason::Reset).await;
    }

    fn redo_tasks(&mut self) {
        for profile in self.queue.iter_mut() {
            profile.init_send_param();
        }
        self.retry_interval = Duration::ZERO;
        debug!(count = self.queue.len(), "长链任务重做");
    }

    async fn run_loop(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let now = Instant::now();
        self.run_on_timeout(now).await;
        self.run_on_start_task(now).await;
    }

    async fn run_on_timeout(&mut self, now: Instant) {
        let net = self.deps.network.network_info().net_type;
        let pkg_pkg = pkg_pkg_timeout(net);
        let mut socket_timeout_code = 0;
        let mut src_task_id = INVALID_TASK_ID;
        let mut timed_out = Vec::new();

        for profile in self.queue.iter_mut() {
            let task_id = profile.task.task_id;
            if profile.is_running() {
                let tp = &profile.transfer_profile;
                let since_send = tp.start_send_time.map(|t| now.saturating_duration_since(t));
                let since_recv = tp.last_receive_pkg_time.map(|t| now.saturating_duration_since(t));
                let since_first_send = tp
                    .first_start_send_time
                    .map(|t| now.saturating_duration_since(t));

                if since_send.is_some_and(|d| d >= tp.first_pkg_timeout) && since_recv.is_none() {
                    warn!(task_id, timeout = ?tp.first_pkg_timeout, "长链首包超时");
                    socket_timeout_code = codes::LONG_FIRST_PKG_TIMEOUT;
                    src_task_id = task_id;
                    if profile.remain_retry_count > 0 {
                        profile.last_failed_timeout_status = profile.current_timeout_status;
                    }
                } else if since_send.is_some() && since_recv.is_some_and(|d| d >= pkg_pkg) {
                    warn!(task_id, timeout = ?pkg_pkg, "长链包间超时");
                    socket_timeout_code = codes::LONG_PKG_PKG_TIMEOUT;
                    src_task_id = task_id;
                } else if since_first_send.is_some_and(|d| d >= tp.read_write_timeout) {
                    warn!(task_id, timeout = ?tp.read_write_timeout, "长链读写超时");
                    socket_timeout_code = codes::LONG_READ_WRITE_TIMEOUT;
                    src_task_id = task_id;
                }
            }
            if profile.is_timed_out(now) {
                timed_out.push(task_id);
            }
        }

        for task_id in &timed_out {
            warn!(task_id, "长链任务总超时");
            self.single_resp(*task_id, ErrorKind::Local, codes::LOCAL_TASK_TIMEOUT, FailHandle::TaskTimeout, now);
        }

        if socket_timeout_code != 0 {
            self.deps.quality.record_failure(now);
            let profile = self.deps.link.profile();
            self.batch_error(
                ErrorKind::NetMsgXp,
                socket_timeout_code,
                FailHandle::Default,
                src_task_id,
                None,
            )
            .await;
            self.deps.sink.on_network_report(
                ChannelType::Long,
                ErrorKind::NetMsgXp,
                socket_timeout_code,
                &profile.ip,
                &profile.host,
                profile.port,
            );
        } else if !timed_out.is_empty() {
            self.batch_error(
                ErrorKind::NetMsgXp,
                codes::LOCAL_TASK_TIMEOUT,
                FailHandle::Default,
                INVALID_TASK_ID,
                None,
            )
            .await;
        }
    }

    /// Encodes the task and passes the payload through flood control.
    fn encode(&self, task_id: u32, net: NetType, now: Instant) -> Option<Result<EncodedRequest, (ErrorKind, i32)>> {
        let profile = self.queue.get(task_id)?;
        let request = match self.deps.codec.req_to_buf(&profile.task, ChannelType::Long) {
            Ok(request) => request,
            Err(e) => {
                error!(task_id, cmd_id = profile.task.cmd_id, error = %e, "长链任务编码失败");
                return Some(Err((ErrorKind::EnDecode, 0)));
            }
        };
        if let Err(rejection) = self.deps.quality.check_flood(&profile.task, &request.body, net, now) {
            warn!(task_id, rejection = ?rejection, "长链任务被防雪崩拦截");
            return Some(Err((ErrorKind::Local, codes::LOCAL_ANTI_AVALANCHE)));
        }
        Some(Ok(request))
    }

    async fn run_on_start_task(&mut self, now: Instant) {
        let can_retry = self
            .last_batch_error_time
            .map_or(true, |t| now.saturating_duration_since(t) >= self.retry_interval);
        let net = self.deps.network.network_info().net_type;
        let mut authed: Option<bool> = None;
        let mut sent_count = self.queue.running_count();

        for task_id in self.queue.ids() {
            let Some((need_authed, checked)) = self.queue.get(task_id).and_then(|p| {
                let waiting = !p.is_running()
                    && (can_retry || p.task.retry_count <= p.remain_retry_count);
                waiting.then_some((p.task.need_authed, p.anti_avalanche_checked))
            }) else {
                continue;
            };
            if need_authed {
                let ok = match authed {
                    Some(ok) => ok,
                    None => {
                        let ok = self.deps.auth.ensure_authenticated().await;
                        authed = Some(ok);
                        ok
                    }
                };
                if !ok {
                    continue;
                }
            }

            let mut encoded = None;
            if !checked {
                match self.encode(task_id, net, now) {
                    Some(Ok(request)) => encoded = Some(request),
                    Some(Err((kind, code))) => {
                        self.single_resp(task_id, kind, code, FailHandle::TaskEnd, now);
                        continue;
                    }
                    None => continue,
                }
                if let Some(profile) = self.queue.get_mut(task_id) {
                    profile.anti_avalanche_checked = true;
                }
            }

            if !self.deps.monitor.make_sure_connected() {
                continue;
            }

            let request = match encoded {
                Some(request) => request,
                None => match self.encode(task_id, net, now) {
                    Some(Ok(request)) => request,
                    Some(Err((kind, code))) => {
                        self.single_resp(task_id, kind, code, FailHandle::TaskEnd, now);
                        continue;
                    }
                    None => continue,
                },
            };

            let gate_status = self.deps.quality.timeout_status();
            let link = Arc::clone(&self.deps.link);
            let Some(profile) = self.queue.get_mut(task_id) else {
                continue;
            };
            let status = if profile.last_failed_timeout_status == Some(TimeoutStatus::Excellent) {
                TimeoutStatus::Evaluating
            } else {
                gate_status
            };
            profile.current_timeout_status = Some(if profile.task.server_process_cost <= 0 {
                status
            } else {
                TimeoutStatus::Evaluating
            });

            let tp = &mut profile.transfer_profile;
            tp.loop_start_task_time = Some(now);
            tp.first_pkg_timeout = first_pkg_timeout(
                profile.task.server_process_cost,
                request.body.len(),
                sent_count,
                net,
                status,
            );
            tp.read_write_timeout = read_write_timeout(tp.first_pkg_timeout);
            tp.send_data_size = request.body.len() + request.ext.len();

            let task = &profile.task;
            if !link.send(task_id, task.cmd_id, &request.body, &request.ext, task.send_only) {
                warn!(task_id, cmd_id = task.cmd_id, "长链发送失败，等待下一轮");
                continue;
            }
            profile.running_id = link.generation();
            profile.transfer_profile.connect_profile = link.profile();
            sent_count += 1;
            debug!(
                task_id,
                generation = profile.running_id,
                first_pkg_timeout = ?profile.transfer_profile.first_pkg_timeout,
                "长链任务已提交发送"
            );

            if profile.task.send_only {
                self.single_resp(task_id, ErrorKind::Ok, 0, FailHandle::NoError, now);
            }
        }
    }

    /// Applies the completion policy to one task. True when the task ended.
    fn single_resp(&mut self, task_id: u32, kind: ErrorKind, code: i32, handle: FailHandle, now: Instant) -> bool {
        if kind.is_ok() {
            self.retry_interval = Duration::ZERO;
            self.continuous_fail_count = 0;
        } else {
            self.continuous_fail_count += 1;
        }

        let Some(profile) = self.queue.get_mut(task_id) else {
            return false;
        };
        profile.transfer_profile.error_kind = kind;
        profile.transfer_profile.error_code = code;

        if profile.remain_retry_count <= 0 || kind.is_ok() || handle.is_terminal() {
            let Some(mut profile) = self.queue.remove(task_id) else {
                return false;
            };
            profile.end_task_time = Some(now);
            profile.err_kind = kind;
            profile.err_code = code;
            profile.push_history();

            let cost = profile.elapsed(now);
            if kind.is_ok() {
                info!(task_id, cmd_id = profile.task.cmd_id, cost = ?cost, "长链任务完成");
            } else {
                warn!(
                    task_id,
                    cmd_id = profile.task.cmd_id,
                    kind = %kind,
                    code,
                    handle = ?handle,
                    cost = ?cost,
                    attempts = profile.history().len(),
                    "长链任务失败结束"
                );
            }
            metrics::counter!("linkmux_task_end_total", "kind" => kind.as_str()).increment(1);
            self.deps.sink.on_task_end(TaskOutcome {
                channel: ChannelType::Long,
                kind,
                code,
                handle,
                profile,
            });
            return true;
        }

        warn!(
            task_id,
            cmd_id = profile.task.cmd_id,
            kind = %kind,
            code,
            remain = profile.remain_retry_count,
            "长链任务失败，准备重试"
        );
        profile.remain_retry_count -= 1;
        profile.push_history();
        profile.init_send_param();
        metrics::counter!("linkmux_task_retry_total", "channel" => ChannelType::Long.as_str()).increment(1);
        false
    }

    /// Fails every running task. With a `generation` only tasks on that
    /// connection are touched and the link is left alone, since it is gone.
    async fn batch_error(
        &mut self,
        kind: ErrorKind,
        code: i32,
        handle: FailHandle,
        src_task_id: u32,
        generation: Option<u64>,
    ) {
        let now = Instant::now();
        let targets: Vec<u32> = self
            .queue
            .iter()
            .filter(|p| p.is_running() && generation.map_or(true, |g| g == p.running_id))
            .map(|p| p.task.task_id)
            .collect();
        if !targets.is_empty() {
            info!(kind = %kind, code, count = targets.len(), "长链批量失败");
        }
        for task_id in &targets {
            let task_code = if src_task_id == INVALID_TASK_ID || src_task_id == *task_id {
                code
            } else {
                0
            };
            self.single_resp(*task_id, kind, task_code, handle, now);
        }

        self.last_batch_error_time = Some(now);
        if kind != ErrorKind::Local && !targets.is_empty() {
            self.retry_interval = self.config.retry_interval();
        }
        if generation.is_some() {
            return;
        }

        if kind == ErrorKind::NetMsgXp {
            self.deps.link.disconnect(DisconnectReason::TaskTimeout).await;
        } else if handle.is_retry_all() {
            self.retry_interval = Duration::ZERO;
            self.deps.link.disconnect(DisconnectReason::DecodeError).await;
        } else if handle == FailHandle::Default && !matches!(kind, ErrorKind::Dns | ErrorKind::Socket) {
            self.deps.link.disconnect(DisconnectReason::DecodeError).await;
        }
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::StatusChanged { generation, status } => {
                debug!(generation, status = %status, "长链状态通知");
                if status == LongLinkStatus::Connected {
                    self.run_loop().await;
                }
            }
            LinkEvent::Send { generation, task_id } => {
                if let Some(profile) = self.running_on(task_id, generation) {
                    let now = Instant::now();
                    let tp = &mut profile.transfer_profile;
                    tp.first_start_send_time.get_or_insert(now);
                    tp.start_send_time = Some(now);
                    tp.sent_size = tp.send_data_size;
                }
            }
            LinkEvent::Recv {
                generation,
                task_id,
                cached,
                total,
            } => {
                if let Some(profile) = self.running_on(task_id, generation) {
                    let tp = &mut profile.transfer_profile;
                    tp.received_size = cached;
                    tp.receive_data_size = total;
                    tp.last_receive_pkg_time = Some(Instant::now());
                }
            }
            LinkEvent::Response {
                generation,
                kind,
                code,
                cmd_id,
                task_id,
                body,
                ext,
            } => {
                self.on_response(generation, kind, code, cmd_id, task_id, body, ext)
                    .await;
            }
            LinkEvent::NetworkReport {
                kind,
                code,
                ip,
                host,
                port,
            } => {
                self.deps
                    .sink
                    .on_network_report(ChannelType::Long, kind, code, &ip, &host, port);
            }
        }
    }

    fn running_on(&mut self, task_id: u32, generation: u64) -> Option<&mut TaskProfile> {
        self.queue
            .get_mut(task_id)
            .filter(|p| p.is_running() && p.running_id == generation)
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_response(
        &mut self,
        generation: u64,
        kind: ErrorKind,
        code: i32,
        cmd_id: u32,
        task_id: u32,
        body: Vec<u8>,
        ext: Vec<u8>,
    ) {
        if !kind.is_ok() {
            self.batch_error(kind, code, FailHandle::Default, INVALID_TASK_ID, Some(generation))
                .await;
            return;
        }

        if self.deps.protocol.is_push(cmd_id, task_id, &body, &ext) {
            debug!(cmd_id, task_id, len = body.len(), "长链推送");
            self.deps.sink.on_push(cmd_id, task_id, &body, &ext);
            return;
        }

        let now = Instant::now();
        let net = self.deps.network.network_info().net_type;
        let codec = Arc::clone(&self.deps.codec);
        let Some(profile) = self.running_on(task_id, generation) else {
            debug!(task_id, cmd_id, generation, "响应没有对应的运行中任务");
            return;
        };
        let tp = &mut profile.transfer_profile;
        tp.received_size = body.len() + ext.len();
        tp.receive_data_size = tp.received_size;
        tp.last_receive_pkg_time = Some(now);
        let started = tp.start_send_time.or(tp.loop_start_task_time);
        let total_size = tp.send_data_size + tp.received_size;
        let connect = tp.connect_profile.clone();

        let verdict = codec.buf_to_resp(&profile.task, &body, &ext, ChannelType::Long);
        match verdict {
            DecodeResult::NoError => {
                let cost = started.map_or(Duration::ZERO, |t| now.saturating_duration_since(t));
                self.deps.quality.record(total_size, cost, net, now);
                self.single_resp(task_id, ErrorKind::Ok, 0, FailHandle::NoError, now);
                self.deps.sink.on_network_report(
                    ChannelType::Long,
                    ErrorKind::Ok,
                    0,
                    &connect.ip,
                    &connect.host,
                    connect.port,
                );
            }
            DecodeResult::SessionTimeout | DecodeResult::RetryAll => {
                warn!(task_id, verdict = ?verdict, "长链响应要求重做全部任务");
                self.deps
                    .sink
                    .on_retry_all(ErrorKind::EnDecode, 0, FailHandle::from(verdict), task_id);
            }
            DecodeResult::TaskEnd => {
                self.single_resp(task_id, ErrorKind::EnDecode, 0, FailHandle::TaskEnd, now);
            }
            DecodeResult::Default => {
                warn!(task_id, cmd_id, "长链响应解码失败");
                self.batch_error(ErrorKind::EnDecode, 0, FailHandle::Default, task_id, None)
                    .await;
                self.deps.sink.on_network_report(
                    ChannelType::Long,
                    ErrorKind::EnDecode,
                    0,
                    &connect.ip,
                    &connect.host,
                    connect.port,
                );
            }
        }
    }
}
