//! 短链任务调度：每次尝试启动一个独立的短链工作任务。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use linkmux_core::config::SchedulerConfig;
use linkmux_core::resilience::TimeoutStatus;
use linkmux_core::timeouts::{first_pkg_timeout, pkg_pkg_timeout, read_write_timeout};
use linkmux_core::traits::{AuthGate, DecodeResult, EncodedRequest, NetworkInfoProvider, TaskCodec};
use linkmux_core::{codes, ChannelType, ConnectProfile, ErrorKind, NetType, Task, TaskProfile, INVALID_TASK_ID};
use linkmux_worker::{
    short_link_event_channel, ShortLinkEvent, ShortLinkEventReceiver, ShortLinkEventSender,
    ShortLinkFactory, ShortLinkHandle, ShortLinkRequest,
};

use crate::outcome::{FailHandle, TaskOutcome, TaskResultSink};
use crate::quality::QualityGate;
use crate::queue::TaskQueue;

#[derive(Clone)]
pub struct ShortSchedulerDeps {
    pub factory: Arc<dyn ShortLinkFactory>,
    pub codec: Arc<dyn TaskCodec>,
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
    DefaultUseProxy {
        reply: oneshot::Sender<bool>,
    },
    Clear,
    Redo,
    Retry {
        kind: ErrorKind,
        code: i32,
        handle: FailHandle,
        src_task_id: u32,
    },
    Shutdown,
}

/// Handle of the short-link scheduler actor.
pub struct ShortLinkTaskScheduler {
    commands: mpsc::UnboundedSender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ShortLinkTaskScheduler {
    pub fn spawn(deps: ShortSchedulerDeps, config: SchedulerConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = short_link_event_channel();
        let core = ShortCore::new(deps, config, events_tx);
        let worker = tokio::spawn(core.run(rx, events_rx));
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
            warn!("短链调度器已停止，忽略命令");
        }
    }

    /// Queues the task. Send-only tasks are refused.
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

    pub async fn task_profile(&self, task_id: u32) -> Option<TaskProfile> {
        self.request(|reply| Command::Profile { task_id, reply })
            .await
            .flatten()
    }

    /// Whether new attempts go through the proxy by default.
    pub async fn default_use_proxy(&self) -> bool {
        self.request(|reply| Command::DefaultUseProxy { reply })
            .await
            .unwrap_or(false)
    }

    pub fn clear_tasks(&self) {
        self.post(Command::Clear);
    }

    /// Cancels running workers and requeues their tasks without consuming a retry.
    pub fn redo_tasks(&self) {
        self.post(Command::Redo);
    }

    pub fn retry_tasks(&self, kind: ErrorKind, code: i32, handle: FailHandle, src_task_id: u32) {
        self.post(Command::Retry {
            kind,
            code,
            handle,
            src_task_id,
        });
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
                error!(error = %e, "短链调度任务异常退出");
            }
        }
    }
}

impl Drop for ShortLinkTaskScheduler {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            worker.abort();
        }
    }
}

struct ShortCore {
    deps: ShortSchedulerDeps,
    config: SchedulerConfig,
    queue: TaskQueue,
    workers: HashMap<u64, ShortLinkHandle>,
    events: ShortLinkEventSender,
    next_worker_id: u64,
    default_use_proxy: bool,
}

impl ShortCore {
    fn new(deps: ShortSchedulerDeps, config: SchedulerConfig, events: ShortLinkEventSender) -> Self {
        Self {
            deps,
            config,
            queue: TaskQueue::new(),
            workers: HashMap::new(),
            events,
            next_worker_id: 1,
            default_use_proxy: false,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, mut events: ShortLinkEventReceiver) {
        let mut tick = tokio::time::interval(self.config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("短链调度器启动");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(command) => self.on_command(command).await,
                },
                Some(event) = events.recv() => self.on_worker_event(event).await,
                _ = tick.tick() => self.run_loop().await,
            }
        }

        for (_, handle) in self.workers.drain() {
            handle.cancel().await;
        }
        info!(remaining = self.queue.len(), "短链调度器停止");
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
                let stopped = match self.queue.remove(task_id) {
                    Some(profile) => {
                        self.delete_worker(profile.running_id).await;
                        info!(task_id, "短链任务被停止");
                        true
                    }
                    None => false,
                };
                let _ = reply.send(stopped);
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
            Command::DefaultUseProxy { reply } => {
                let _ = reply.send(self.default_use_proxy);
            }
            Command::Clear => {
                let dropped = self.queue.drain();
                for (_, handle) in self.workers.drain() {
                    handle.cancel().await;
                }
                info!(count = dropped.len(), "清空短链任务");
            }
            Command::Redo => {
                self.redo_tasks().await;
                self.run_loop().await;
            }
            Command::Retry {
                kind,
                code,
                handle,
                src_task_id,
            } => {
                self.batch_error(kind, code, handle, src_task_id).await;
                self.run_loop().await;
            }
            Command::Shutdown => {}
        }
    }

    fn start_task(&mut self, task: Task) -> bool {
        if task.send_only {
            error!(task_id = task.task_id, cmd_id = task.cmd_id, "短链不支持只发送任务");
            return false;
        }
        if self.queue.contains(task.task_id) {
            warn!(task_id = task.task_id, "短链任务已存在");
            return false;
        }
        info!(
            task_id = task.task_id,
            cgi = %task.cgi,
            retry = task.retry_count,
            priority = task.priority,
            "短链任务入队"
        );
        let mut profile = TaskProfile::new(task, Instant::now());
        profile.link_type = Some(ChannelType::Short);
        self.queue.push(profile);
        true
    }

    async fn delete_worker(&mut self, worker_id: u64) {
        if let Some(handle) = self.workers.remove(&worker_id) {
            handle.cancel().await;
        }
    }

    async fn redo_tasks(&mut self) {
        let running: Vec<(u32, u64)> = self
            .queue
            .iter()
            .filter(|p| p.is_running())
            .map(|p| (p.task.task_id, p.running_id))
            .collect();
        for (task_id, worker_id) in running {
            self.delete_worker(worker_id).await;
            if let Some(profile) = self.queue.get_mut(task_id) {
                profile.init_send_param();
            }
        }
        debug!(count = self.queue.len(), "短链任务重做");
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
        let mut failures = Vec::new();

        for profile in self.queue.iter_mut() {
            let task_id = profile.task.task_id;
            let mut failure = None;
            if profile.is_running() {
                let tp = &profile.transfer_profile;
                let since_send = tp.start_send_time.map(|t| now.saturating_duration_since(t));
                let since_recv = tp.last_receive_pkg_time.map(|t| now.saturating_duration_since(t));

                if since_send.is_some_and(|d| d >= tp.first_pkg_timeout) && since_recv.is_none() {
                    failure = Some((ErrorKind::Http, codes::HTTP_FIRST_PKG_TIMEOUT, FailHandle::Default));
                    if profile.remain_retry_count > 0 {
                        profile.last_failed_timeout_status = profile.current_timeout_status;
                    }
                } else if since_send.is_some() && since_recv.is_some_and(|d| d >= pkg_pkg) {
                    failure = Some((ErrorKind::Http, codes::HTTP_PKG_PKG_TIMEOUT, FailHandle::Default));
                }

                let tp = &profile.transfer_profile;
                if tp
                    .first_start_send_time
                    .is_some_and(|t| now.saturating_duration_since(t) >= tp.read_write_timeout)
                {
                    failure = Some((ErrorKind::Http, codes::HTTP_READ_WRITE_TIMEOUT, FailHandle::Default));
                }
            }
            if profile.is_timed_out(now) {
                failure = Some((ErrorKind::Local, codes::LOCAL_TASK_TIMEOUT, FailHandle::TaskTimeout));
            }
            if let Some(failure) = failure {
                failures.push((task_id, failure, profile.transfer_profile.connect_profile.clone()));
            }
        }

        for (task_id, (kind, code, handle), connect) in failures {
            warn!(task_id, kind = %kind, code, "短链任务超时");
            if kind != ErrorKind::Local {
                self.deps.quality.record_failure(now);
                self.report(kind, code, &connect);
            }
            self.single_resp(task_id, kind, code, handle, now).await;
        }
    }

    fn report(&self, kind: ErrorKind, code: i32, connect: &ConnectProfile) {
        self.deps.sink.on_network_report(
            ChannelType::Short,
            kind,
            code,
            &connect.ip,
            &connect.host,
            connect.port,
        );
    }

    fn encode(&self, task_id: u32, net: NetType, now: Instant) -> Option<Result<EncodedRequest, (ErrorKind, i32)>> {
        let profile = self.queue.get(task_id)?;
        let request = match self.deps.codec.req_to_buf(&profile.task, ChannelType::Short) {
            Ok(request) => request,
            Err(e) => {
                error!(task_id, cgi = %profile.task.cgi, error = %e, "短链任务编码失败");
                return Some(Err((ErrorKind::EnDecode, 0)));
            }
        };
        if let Err(rejection) = self.deps.quality.check_flood(&profile.task, &request.body, net, now) {
            warn!(task_id, rejection = ?rejection, "短链任务被防雪崩拦截");
            return Some(Err((ErrorKind::Local, codes::LOCAL_ANTI_AVALANCHE)));
        }
        Some(Ok(request))
    }

    async fn run_on_start_task(&mut self, now: Instant) {
        let net = self.deps.network.network_info().net_type;
        let mut authed: Option<bool> = None;
        let mut sent_count = self.queue.running_count();

        for task_id in self.queue.ids() {
            let Some(need_authed) = self.queue.get(task_id).and_then(|p| {
                let waiting = !p.is_running()
                    && p.retry_start_time
                        .map_or(true, |t| now.saturating_duration_since(t) >= p.retry_interval);
                waiting.then_some(p.task.need_authed)
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

            let request = match self.encode(task_id, net, now) {
                Some(Ok(request)) => request,
                Some(Err((kind, code))) => {
                    self.single_resp(task_id, kind, code, FailHandle::TaskEnd, now).await;
                    continue;
                }
                None => continue,
            };

            let worker_id = self.next_worker_id;
            self.next_worker_id += 1;
            let gate_status = self.deps.quality.timeout_status();
            let default_use_proxy = self.default_use_proxy;
            let Some(profile) = self.queue.get_mut(task_id) else {
                continue;
            };
            profile.anti_avalanche_checked = true;
            profile.use_proxy = if profile.remain_retry_count == 0 && profile.task.retry_count > 0 {
                !default_use_proxy
            } else {
                default_use_proxy
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
            profile.running_id = worker_id;

            let task = &profile.task;
            debug!(
                task_id,
                worker_id,
                use_proxy = profile.use_proxy,
                first_pkg_timeout = ?profile.transfer_profile.first_pkg_timeout,
                "启动短链工作任务"
            );
            let request = ShortLinkRequest {
                worker_id,
                task_id,
                cgi: task.cgi.clone(),
                hosts: task.short_link_hosts.clone(),
                body: request.body,
                ext: request.ext,
                use_proxy: profile.use_proxy,
                outer_addrs: Vec::new(),
            };
            let handle = self.deps.factory.start(request, self.events.clone());
            self.workers.insert(worker_id, handle);
            sent_count += 1;
        }
    }

    /// Applies the completion policy to one task. True when the task ended.
    async fn single_resp(&mut self, task_id: u32, kind: ErrorKind, code: i32, handle: FailHandle, now: Instant) -> bool {
        let Some(profile) = self.queue.get_mut(task_id) else {
            return false;
        };
        if kind.is_ok() {
            self.default_use_proxy = profile.use_proxy;
        }
        profile.transfer_profile.error_kind = kind;
        profile.transfer_profile.error_code = code;
        let worker_id = profile.running_id;

        if profile.remain_retry_count <= 0
            || kind.is_ok()
            || handle.is_terminal()
            || profile.force_no_retry
        {
            let Some(mut profile) = self.queue.remove(task_id) else {
                return false;
            };
            self.delete_worker(worker_id).await;
            profile.end_task_time = Some(now);
            profile.err_kind = kind;
            profile.err_code = code;
            profile.push_history();

            let cost = profile.elapsed(now);
            if kind.is_ok() {
                info!(task_id, cgi = %profile.task.cgi, cost = ?cost, "短链任务完成");
            } else {
                warn!(
                    task_id,
                    cgi = %profile.task.cgi,
                    kind = %kind,
                    code,
                    handle = ?handle,
                    cost = ?cost,
                    attempts = profile.history().len(),
                    "短链任务失败结束"
                );
            }
            metrics::counter!("linkmux_task_end_total", "kind" => kind.as_str()).increment(1);
            self.deps.sink.on_task_end(TaskOutcome {
                channel: ChannelType::Short,
                kind,
                code,
                handle,
                profile,
            });
            return true;
        }

        warn!(
            task_id,
            cgi = %profile.task.cgi,
            kind = %kind,
            code,
            remain = profile.remain_retry_count,
            "短链任务失败，准备重试"
        );
        profile.remain_retry_count -= 1;
        profile.push_history();
        profile.init_send_param();
        profile.retry_start_time = (handle != FailHandle::SessionTimeout).then_some(now);
        profile.retry_interval = self.config.retry_interval();
        self.delete_worker(worker_id).await;
        metrics::counter!("linkmux_task_retry_total", "channel" => ChannelType::Short.as_str()).increment(1);
        false
    }

    async fn batch_error(&mut self, kind: ErrorKind, code: i32, handle: FailHandle, src_task_id: u32) {
        let now = Instant::now();
        let targets: Vec<u32> = self
            .queue
            .iter()
            .filter(|p| p.is_running())
            .filter(|p| handle != FailHandle::SessionTimeout || p.task.need_authed)
            .map(|p| p.task.task_id)
            .collect();
        if !targets.is_empty() {
            info!(kind = %kind, code, count = targets.len(), "短链批量失败");
        }
        for task_id in targets {
            let task_code = if src_task_id == INVALID_TASK_ID || src_task_id == task_id {
                code
            } else {
                0
            };
            self.single_resp(task_id, kind, task_code, handle, now).await;
        }
    }

    async fn on_worker_event(&mut self, event: ShortLinkEvent) {
        match event {
            ShortLinkEvent::Send { worker_id, .. } => {
                if let Some(profile) = self.queue.find_running(worker_id) {
                    let now = Instant::now();
                    let tp = &mut profile.transfer_profile;
                    tp.first_start_send_time.get_or_insert(now);
                    tp.start_send_time = Some(now);
                    tp.sent_size = tp.send_data_size;
                }
            }
            ShortLinkEvent::Recv {
                worker_id,
                cached,
                total,
                ..
            } => {
                if let Some(profile) = self.queue.find_running(worker_id) {
                    let tp = &mut profile.transfer_profile;
                    tp.received_size = cached;
                    tp.receive_data_size = total;
                    tp.last_receive_pkg_time = Some(Instant::now());
                }
            }
            ShortLinkEvent::Response {
                worker_id,
                kind,
                code,
                status,
                body,
                profile,
                ..
            } => {
                self.workers.remove(&worker_id);
                self.on_response(worker_id, kind, code, status, body, profile)
                    .await;
            }
            ShortLinkEvent::NetworkReport {
                kind,
                code,
                ip,
                host,
                port,
            } => {
                self.deps
                    .sink
                    .on_network_report(ChannelType::Short, kind, code, &ip, &host, port);
            }
        }
    }

    async fn on_response(
        &mut self,
        worker_id: u64,
        kind: ErrorKind,
        code: i32,
        status: i32,
        body: Vec<u8>,
        connect: ConnectProfile,
    ) {
        let now = Instant::now();
        let net = self.deps.network.network_info().net_type;
        let codec = Arc::clone(&self.deps.codec);
        let Some(profile) = self.queue.find_running(worker_id) else {
            debug!(worker_id, "短链响应没有对应的运行中任务");
            return;
        };
        let task_id = profile.task.task_id;
        profile.transfer_profile.connect_profile = connect.clone();

        if !kind.is_ok() {
            debug!(task_id, kind = %kind, code, status, "短链尝试失败");
            if kind == ErrorKind::Socket && code == codes::SOCKET_MAKE_SOCKET_PREPARED {
                self.deps.quality.record_failure(now);
            }
            self.single_resp(task_id, kind, code, FailHandle::Default, now).await;
            return;
        }

        let tp = &mut profile.transfer_profile;
        tp.received_size = body.len();
        tp.receive_data_size = body.len();
        tp.last_receive_pkg_time = Some(now);
        let started = tp.start_send_time.or(tp.loop_start_task_time);
        let total_size = tp.send_data_size + body.len();

        let verdict = codec.buf_to_resp(&profile.task, &body, &[], ChannelType::Short);
        match verdict {
            DecodeResult::NoError => {
                let cost = started.map_or(Duration::ZERO, |t| now.saturating_duration_since(t));
                self.deps.quality.record(total_size, cost, net, now);
                self.single_resp(task_id, ErrorKind::Ok, 0, FailHandle::NoError, now).await;
                self.report(ErrorKind::Ok, 0, &connect);
            }
            DecodeResult::SessionTimeout | DecodeResult::RetryAll => {
                warn!(task_id, verdict = ?verdict, "短链响应要求重做全部任务");
                self.deps
                    .sink
                    .on_retry_all(ErrorKind::EnDecode, 0, FailHandle::from(verdict), task_id);
            }
            DecodeResult::TaskEnd => {
                self.single_resp(task_id, ErrorKind::EnDecode, 0, FailHandle::TaskEnd, now).await;
            }
            DecodeResult::Default => {
                warn!(task_id, "短链响应解码失败");
                self.single_resp(task_id, ErrorKind::EnDecode, 0, FailHandle::Default, now).await;
            }
        }
    }
}
