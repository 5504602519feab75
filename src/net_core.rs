//! 传输核心门面：校验并分发任务，协调两个调度器、僵尸任务与网络事件。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use linkmux_core::timeouts::{exceeds_limits, DEFAULT_RETRY_COUNT};
use linkmux_core::traits::{
    AuthGate, DnsResolver, FrameCodec, IdentifyProvider, KeyValueStore, LongLinkProtocol,
    NetworkInfoProvider, ShortLinkCodec, SocketProvider, TaskCodec, TransportListener,
};
use linkmux_core::{
    codes, ActiveLogic, ChannelSelect, ChannelStrategy, ChannelType, ConnectProfile, CoreConfig,
    CoreEvent, DisconnectReason, ErrorKind, EventBus, LongLinkStatus, Subscription, Task,
    TaskProfile,
};
use linkmux_dispatcher::{
    LongLinkTaskScheduler, LongSchedulerDeps, QualityGate, ShortLinkTaskScheduler,
    ShortSchedulerDeps, ZombieAction, ZombieTaskStore,
};
use linkmux_longlink::{
    link_event_channel, HeartbeatScheduler, LinkDeps, LongLinkConnectMonitor, LongLinkConnection,
};
use linkmux_routing::{AddressHealthTracker, AddressSource, NetworkConfig};
use linkmux_worker::{ShortLinkDeps, TcpShortLinkFactory};

use crate::router::{CompletionRouter, Followup};

/// Foreground time after a transition during which a long-capable task
/// asks for the long link.
pub const FOREGROUND_CONNECT_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Everything the host application injects.
#[derive(Clone)]
pub struct Collaborators {
    pub sockets: Arc<dyn SocketProvider>,
    pub primary_dns: Arc<dyn DnsResolver>,
    pub legacy_dns: Arc<dyn DnsResolver>,
    pub network: Arc<dyn NetworkInfoProvider>,
    pub auth: Arc<dyn AuthGate>,
    pub frame_codec: Arc<dyn FrameCodec>,
    pub protocol: Arc<dyn LongLinkProtocol>,
    pub identify: Arc<dyn IdentifyProvider>,
    pub task_codec: Arc<dyn TaskCodec>,
    pub short_codec: Arc<dyn ShortLinkCodec>,
    pub store: Option<Arc<dyn KeyValueStore>>,
    pub listener: Arc<dyn TransportListener>,
    pub foreground: bool,
}

/// Applies the parameter limits and channel defaults. The error is the
/// local error code the task ends with.
pub fn prepare_task(task: &mut Task) -> Result<(), i32> {
    if exceeds_limits(task) {
        return Err(codes::LOCAL_TASK_PARAM);
    }
    if task.channel_select.has_long() && task.cmd_id == 0 {
        task.channel_select = task.channel_select.without(ChannelSelect::LONG);
    }
    if task.channel_select.has_short() && task.cgi.is_empty() {
        task.channel_select = task.channel_select.without(ChannelSelect::SHORT);
    }
    if task.channel_select.is_empty() {
        return Err(codes::LOCAL_CHANNEL_SELECT);
    }
    if task.retry_count < 0 {
        task.retry_count = DEFAULT_RETRY_COUNT;
    }
    Ok(())
}

/// Picks the channel for a prepared task. `long_task_count` is only
/// consulted for fast-strategy tasks that could go either way.
pub fn choose_channel(
    select: ChannelSelect,
    strategy: ChannelStrategy,
    long_connected: bool,
    long_task_count: impl FnOnce() -> usize,
    fast_limit: usize,
) -> ChannelType {
    if !select.has_short() {
        return ChannelType::Long;
    }
    if !select.has_long() || !long_connected {
        return ChannelType::Short;
    }
    if strategy == ChannelStrategy::Fast && long_task_count() > fast_limit {
        return ChannelType::Short;
    }
    ChannelType::Long
}

struct Inner {
    config: CoreConfig,
    active: Arc<ActiveLogic>,
    network: Arc<dyn NetworkInfoProvider>,
    bus: EventBus,
    source: Arc<AddressSource>,
    link: Arc<LongLinkConnection>,
    monitor: Arc<LongLinkConnectMonitor>,
    quality: Arc<QualityGate>,
    zombie: Arc<ZombieTaskStore>,
    router: Arc<CompletionRouter>,
    long: LongLinkTaskScheduler,
    short: ShortLinkTaskScheduler,
}

/// The transport core. Must be started inside a tokio runtime.
pub struct NetCore {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
    _status: Subscription,
}

impl NetCore {
    pub fn start(config: CoreConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let Collaborators {
            sockets,
            primary_dns,
            legacy_dns,
            network,
            auth,
            frame_codec,
            protocol,
            identify,
            task_codec,
            short_codec,
            store,
            listener,
            foreground,
        } = collaborators;

        let now = Instant::now();
        let active = Arc::new(ActiveLogic::new(foreground));
        let bus = EventBus::default();

        let net_config = Arc::new(NetworkConfig::from_settings(&config.network));
        let tracker = AddressHealthTracker::new(Arc::clone(&network), store.clone());
        let source = Arc::new(AddressSource::new(
            net_config,
            tracker,
            Arc::clone(&active),
            primary_dns,
            legacy_dns,
            Arc::clone(&network),
        ));

        let heartbeat = HeartbeatScheduler::new(
            config.heartbeat.clone(),
            Arc::clone(&active),
            Arc::clone(&network),
            store,
        );
        let (link_tx, link_rx) = link_event_channel();
        let link = Arc::new(LongLinkConnection::new(
            LinkDeps {
                source: Arc::clone(&source),
                sockets: Arc::clone(&sockets),
                codec: frame_codec,
                protocol: Arc::clone(&protocol),
                identify,
                network: Arc::clone(&network),
            },
            config.long_link.clone(),
            heartbeat,
            link_tx,
            bus.clone(),
        ));
        let monitor = Arc::new(LongLinkConnectMonitor::new(
            link.clone(),
            Arc::clone(&active),
            Arc::clone(&network),
            config.scheduler.reconnect_delay(),
        ));
        monitor.start(&bus);

        let quality = Arc::new(QualityGate::new(
            config.flood_control_enabled,
            active.is_active_at(now),
            now,
        ));
        let zombie = Arc::new(ZombieTaskStore::new(
            config.scheduler.zombie_retry_interval(),
            now,
        ));

        let (followup_tx, followup_rx) = mpsc::unbounded_channel();
        let router = Arc::new(CompletionRouter::new(
            listener,
            Arc::clone(&zombie),
            Arc::clone(&active),
            Arc::clone(&source),
            Arc::clone(&network),
            Arc::clone(&link),
            config.short_link.error_threshold,
            followup_tx,
        ));

        let long = LongLinkTaskScheduler::spawn(
            LongSchedulerDeps {
                link: link.clone(),
                monitor: Arc::clone(&monitor),
                codec: Arc::clone(&task_codec),
                protocol,
                auth: Arc::clone(&auth),
                network: Arc::clone(&network),
                quality: Arc::clone(&quality),
                sink: router.clone(),
            },
            config.scheduler.clone(),
            link_rx,
        );
        let factory = TcpShortLinkFactory::new(
            ShortLinkDeps {
                source: Arc::clone(&source),
                sockets,
                codec: short_codec,
                network: Arc::clone(&network),
            },
            config.short_link.clone(),
        );
        let short = ShortLinkTaskScheduler::spawn(
            ShortSchedulerDeps {
                factory: Arc::new(factory),
                codec: task_codec,
                auth,
                network: Arc::clone(&network),
                quality: Arc::clone(&quality),
                sink: router.clone(),
            },
            config.scheduler.clone(),
        );

        let status_router = Arc::clone(&router);
        let status = bus.subscribe("connectivity", move |event| {
            if let CoreEvent::LongLinkStatus { status, .. } = event {
                status_router.on_long_status(status);
            }
        });

        let inner = Arc::new(Inner {
            config,
            active,
            network,
            bus,
            source,
            link,
            monitor,
            quality,
            zombie,
            router,
            long,
            short,
        });
        let worker = tokio::spawn(Arc::clone(&inner).run(followup_rx));
        info!("传输核心已启动");

        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
            _status: status,
        })
    }

    /// Validates and dispatches a task. False when the task was ended
    /// right away; its end callback has fired in that case.
    pub async fn start_task(&self, task: Task) -> bool {
        self.inner.start_task(task).await
    }

    pub async fn stop_task(&self, task_id: u32) -> bool {
        let inner = &self.inner;
        if inner.long.stop_task(task_id).await || inner.zombie.stop(task_id) {
            return true;
        }
        if inner.short.stop_task(task_id).await {
            return true;
        }
        warn!(task_id, "未找到要停止的任务");
        false
    }

    pub async fn has_task(&self, task_id: u32) -> bool {
        let inner = &self.inner;
        inner.long.has_task(task_id).await
            || inner.zombie.has(task_id)
            || inner.short.has_task(task_id).await
    }

    /// Drops every task on both channels and in the zombie store without callbacks.
    pub fn clear_tasks(&self) {
        let inner = &self.inner;
        inner.long.clear_tasks();
        let dropped = inner.zombie.clear();
        inner.router.clear_zombie_marks();
        inner.short.clear_tasks();
        info!(zombies = dropped.len(), "清空全部任务");
    }

    /// Resets the long link and restarts every running task without using a retry.
    pub async fn redo_tasks(&self) {
        let inner = &self.inner;
        info!("重做全部任务");
        inner.source.clear_cache();
        inner.long.reset_and_redo(DisconnectReason::Reset).await;
        inner.link.make_sure_connected();
        inner.handle_zombies(inner.zombie.redo(Instant::now())).await;
        inner.short.redo_tasks();
    }

    pub async fn on_network_change(&self) {
        let inner = &self.inner;
        let info = inner.network.network_info();
        info!(net = info.net_type.as_str(), label = %info.label, "网络变化");

        inner.source.clear_cache();
        inner.quality.reset_timeout();
        inner.bus.publish(CoreEvent::NetworkChanged);
        let reconnecting = inner.long.network_change().await;
        debug!(reconnecting, "长链已按新网络重建");
        inner.handle_zombies(inner.zombie.redo(Instant::now())).await;
        inner.short.redo_tasks();
        inner.router.reset_connectivity();
    }

    pub fn on_foreground(&self, foreground: bool) {
        let inner = &self.inner;
        let now = Instant::now();
        if inner.active.set_foreground(foreground, now) {
            info!(foreground, "前后台切换");
            inner.bus.publish(CoreEvent::Foreground(foreground));
            inner.quality.on_active(inner.active.is_active_at(now), now);
        }
    }

    /// Active signal from the host; switches flow control between active and inactive speed.
    pub fn on_signal_active(&self, active: bool) {
        let inner = &self.inner;
        inner.quality.on_active(active, Instant::now());
        inner.bus.publish(CoreEvent::Active(active));
    }

    pub fn set_has_account(&self, has_account: bool) {
        self.inner.active.set_has_account(has_account);
    }

    pub fn make_sure_long_link_connected(&self) -> bool {
        self.inner.link.make_sure_connected()
    }

    pub fn long_link_status(&self) -> LongLinkStatus {
        self.inner.link.status()
    }

    pub fn long_link_is_connected(&self) -> bool {
        self.long_link_status() == LongLinkStatus::Connected
    }

    pub async fn connect_profile(&self, task_id: u32, channel: ChannelType) -> Option<ConnectProfile> {
        match channel {
            ChannelType::Long => Some(self.inner.link.profile()),
            ChannelType::Short => self
                .inner
                .short
                .task_profile(task_id)
                .await
                .map(|p| p.transfer_profile.connect_profile),
        }
    }

    pub fn add_server_ban(&self, ip: &str) {
        self.inner.source.add_server_ban(ip);
    }

    pub fn remove_long_ban_ip(&self, ip: &str) {
        self.inner.source.remove_long_ban_ip(ip);
    }

    pub fn network_config(&self) -> &Arc<NetworkConfig> {
        self.inner.source.config()
    }

    pub fn zombie_count(&self) -> usize {
        self.inner.zombie.len()
    }

    pub async fn shutdown(&self) {
        self.inner.router.followup(Followup::Shutdown);
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(error = %e, "传输核心协调任务异常退出");
            }
        }
        self.inner.long.shutdown().await;
        self.inner.short.shutdown().await;
        self.inner.link.disconnect(DisconnectReason::Released).await;
        info!("传输核心已停止");
    }
}

impl Drop for NetCore {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            worker.abort();
        }
    }
}

impl Inner {
    async fn run(self: Arc<Self>, mut followups: mpsc::UnboundedReceiver<Followup>) {
        let mut ticker = interval(self.config.scheduler.zombie_check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                followup = followups.recv() => match followup {
                    Some(Followup::RetryAll { kind, code, handle, src_task_id }) => {
                        info!(kind = %kind, code, handle = ?handle, src_task_id, "重试全部运行中任务");
                        self.long.retry_tasks(kind, code, handle, src_task_id);
                        self.short.retry_tasks(kind, code, handle, src_task_id);
                    }
                    Some(Followup::RedoZombies) => {
                        self.handle_zombies(self.zombie.redo(Instant::now())).await;
                    }
                    Some(Followup::Shutdown) | None => break,
                },
                _ = ticker.tick() => {
                    self.handle_zombies(self.zombie.tick(Instant::now())).await;
                }
            }
        }
        debug!("传输核心协调任务退出");
    }

    async fn start_task(&self, mut task: Task) -> bool {
        info!(
            task_id = task.task_id,
            cmd_id = task.cmd_id,
            cgi = %task.cgi,
            channel = task.channel_select.bits(),
            retry_count = task.retry_count,
            total_timeout = task.total_timeout,
            "任务开始"
        );
        if let Err(code) = prepare_task(&mut task) {
            warn!(task_id = task.task_id, code, "任务参数无效");
            self.end_now(task, code);
            return false;
        }

        let long_status = self.link.status();
        if task.network_status_sensitive
            && !self.network.network_info().has_net()
            && long_status != LongLinkStatus::Connected
        {
            warn!(task_id = task.task_id, "无网络，网络敏感任务直接结束");
            self.end_now(task, codes::LOCAL_NO_NET);
            return false;
        }

        let now = Instant::now();
        if long_status != LongLinkStatus::Connected
            && task.channel_select.has_long()
            && self.active.is_foreground()
            && now.saturating_duration_since(self.active.last_foreground_change())
                <= FOREGROUND_CONNECT_WINDOW
        {
            self.monitor.make_sure_connected();
        }

        self.dispatch(task).await
    }

    async fn dispatch(&self, task: Task) -> bool {
        let task_id = task.task_id;
        let channel = if task.channel_select == ChannelSelect::BOTH
            && task.channel_strategy == ChannelStrategy::Fast
            && self.link.status() == LongLinkStatus::Connected
        {
            let count = self.long.task_count().await;
            debug!(task_id, long_tasks = count, "快速策略检查长链任务数");
            choose_channel(
                task.channel_select,
                task.channel_strategy,
                true,
                || count,
                self.config.long_link.fast_strategy_task_limit,
            )
        } else {
            choose_channel(
                task.channel_select,
                task.channel_strategy,
                self.link.status() == LongLinkStatus::Connected,
                || 0,
                self.config.long_link.fast_strategy_task_limit,
            )
        };

        let accepted = match channel {
            ChannelType::Long => self.long.start_task(task.clone()).await,
            ChannelType::Short => self.short.start_task(task.clone()).await,
        };
        if !accepted {
            error!(task_id, channel = channel.as_str(), "调度器拒绝任务");
            self.end_now(task, codes::LOCAL_START_TASK_FAIL);
            return false;
        }
        self.zombie.on_start_task(task_id, Instant::now());
        true
    }

    fn end_now(&self, task: Task, code: i32) {
        let mut profile = TaskProfile::new(task, Instant::now());
        profile.err_kind = ErrorKind::Local;
        profile.err_code = code;
        self.router.end_task(&profile, ErrorKind::Local, code);
    }

    async fn handle_zombies(&self, actions: Vec<ZombieAction>) {
        for action in actions {
            match action {
                ZombieAction::Restart(task) => {
                    debug!(task_id = task.task_id, "僵尸任务重新发起");
                    self.router.mark_from_zombie(task.task_id);
                    self.dispatch(task).await;
                }
                ZombieAction::TimedOut(task) => {
                    self.end_now(task, codes::LOCAL_TASK_TIMEOUT);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(cmd_id: u32, cgi: &str, select: ChannelSelect) -> Task {
        let mut task = Task::new(cmd_id, cgi);
        task.channel_select = select;
        task
    }

    #[test]
    fn test_prepare_rejects_out_of_range_parameters() {
        let mut t = task(1, "/cgi", ChannelSelect::BOTH);
        t.retry_count = 31;
        assert_eq!(prepare_task(&mut t), Err(codes::LOCAL_TASK_PARAM));

        let mut t = task(1, "/cgi", ChannelSelect::BOTH);
        t.server_process_cost = 2 * 60 * 1000 + 1;
        assert_eq!(prepare_task(&mut t), Err(codes::LOCAL_TASK_PARAM));

        let mut t = task(1, "/cgi", ChannelSelect::BOTH);
        t.total_timeout = 10 * 60 * 1000 + 1;
        assert_eq!(prepare_task(&mut t), Err(codes::LOCAL_TASK_PARAM));
    }

    #[test]
    fn test_prepare_clears_unusable_channels() {
        let mut t = task(0, "/cgi", ChannelSelect::BOTH);
        assert_eq!(prepare_task(&mut t), Ok(()));
        assert_eq!(t.channel_select, ChannelSelect::SHORT);

        let mut t = task(7, "", ChannelSelect::BOTH);
        assert_eq!(prepare_task(&mut t), Ok(()));
        assert_eq!(t.channel_select, ChannelSelect::LONG);

        let mut t = task(0, "", ChannelSelect::BOTH);
        assert_eq!(prepare_task(&mut t), Err(codes::LOCAL_CHANNEL_SELECT));
    }

    #[test]
    fn test_prepare_fills_default_retry() {
        let mut t = task(1, "/cgi", ChannelSelect::SHORT);
        t.retry_count = -1;
        assert_eq!(prepare_task(&mut t), Ok(()));
        assert_eq!(t.retry_count, DEFAULT_RETRY_COUNT);

        let mut t = task(1, "/cgi", ChannelSelect::SHORT);
        t.retry_count = 5;
        assert_eq!(prepare_task(&mut t), Ok(()));
        assert_eq!(t.retry_count, 5);
    }

    #[test]
    fn test_choose_channel() {
        use ChannelStrategy::*;

        assert_eq!(choose_channel(ChannelSelect::LONG, Normal, false, || 0, 10), ChannelType::Long);
        assert_eq!(choose_channel(ChannelSelect::SHORT, Normal, true, || 0, 10), ChannelType::Short);
        assert_eq!(choose_channel(ChannelSelect::BOTH, Normal, true, || 50, 10), ChannelType::Long);
        assert_eq!(choose_channel(ChannelSelect::BOTH, Normal, false, || 0, 10), ChannelType::Short);
        assert_eq!(choose_channel(ChannelSelect::BOTH, Fast, true, || 10, 10), ChannelType::Long);
        assert_eq!(choose_channel(ChannelSelect::BOTH, Fast, true, || 11, 10), ChannelType::Short);
    }

    #[test]
    fn test_choose_channel_counts_lazily() {
        let mut called = false;
        let channel = choose_channel(
            ChannelSelect::BOTH,
            ChannelStrategy::Fast,
            false,
            || {
                called = true;
                0
            },
            10,
        );
        assert_eq!(channel, ChannelType::Short);
        assert!(!called);
    }
}
