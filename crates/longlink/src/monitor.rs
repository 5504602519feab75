use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use linkmux_core::traits::NetworkInfoProvider;
use linkmux_core::{ActiveLogic, ActiveState, CoreEvent, DisconnectReason, EventBus, LongLinkStatus};

use crate::connection::LongLinkConnection;

/// Reconnect intervals in seconds, indexed by [`ConnectKind`] then [`ActiveState::index`].
const INTERVALS: [[u64; 5]; 3] = [
    [5, 10, 20, 30, 300],
    [15, 30, 240, 300, 600],
    [0, 0, 0, 0, 0],
];
const NO_ACCOUNT_INACTIVE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectKind {
    TaskConnect,
    LongLinkConnect,
    NetworkChangeConnect,
}

impl ConnectKind {
    fn index(&self) -> usize {
        match self {
            ConnectKind::TaskConnect => 0,
            ConnectKind::LongLinkConnect => 1,
            ConnectKind::NetworkChangeConnect => 2,
        }
    }
}

/// Minimum spacing between connection attempts.
pub fn connect_interval(
    kind: ConnectKind,
    state: ActiveState,
    has_net: bool,
    has_account: bool,
) -> Duration {
    let secs = INTERVALS[kind.index()][state.index()];
    if kind != ConnectKind::LongLinkConnect {
        return Duration::from_secs(secs);
    }
    if !matches!(state, ActiveState::Inactive | ActiveState::ForegroundActive) {
        return Duration::from_secs(secs);
    }

    if state == ActiveState::Inactive && !has_account {
        NO_ACCOUNT_INACTIVE
    } else if !has_net {
        Duration::from_secs(secs * 3 + 600)
    } else if !has_account {
        Duration::from_secs(secs * 2 + 300)
    } else {
        Duration::from_secs(secs + rand::rng().random_range(0..20))
    }
}

/// The parts of the long link the monitor drives.
#[async_trait]
pub trait MonitoredLink: Send + Sync {
    fn status(&self) -> LongLinkStatus;

    /// When the current or last attempt started resolving addresses.
    fn last_attempt_at(&self) -> Option<Instant>;

    fn make_sure_connected(&self) -> bool;

    async fn disconnect(&self, reason: DisconnectReason);
}

#[async_trait]
impl MonitoredLink for LongLinkConnection {
    fn status(&self) -> LongLinkStatus {
        LongLinkConnection::status(self)
    }

    fn last_attempt_at(&self) -> Option<Instant> {
        self.profile().dns_time
    }

    fn make_sure_connected(&self) -> bool {
        LongLinkConnection::make_sure_connected(self)
    }

    async fn disconnect(&self, reason: DisconnectReason) {
        LongLinkConnection::disconnect(self, reason).await
    }
}

struct MonitorInner {
    link: Arc<dyn MonitoredLink>,
    active: Arc<ActiveLogic>,
    network: Arc<dyn NetworkInfoProvider>,
    reconnect_delay: Duration,
    alarm: Mutex<Option<Instant>>,
    alarm_changed: Notify,
}

/// Paces long-link reconnects: immediately for tasks and network changes,
/// on a backoff table otherwise, and shortly after every loss of the link.
pub struct LongLinkConnectMonitor {
    inner: Arc<MonitorInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LongLinkConnectMonitor {
    pub fn new(
        link: Arc<dyn MonitoredLink>,
        active: Arc<ActiveLogic>,
        network: Arc<dyn NetworkInfoProvider>,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                link,
                active,
                network,
                reconnect_delay,
                alarm: Mutex::new(None),
                alarm_changed: Notify::new(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Follows link status and foreground signals on `bus` until dropped.
    pub fn start(&self, bus: &EventBus) {
        let inner = Arc::clone(&self.inner);
        let rx = bus.receiver();
        let handle = tokio::spawn(async move { inner.run(rx).await });
        let previous = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Connects if the task backoff allows. True when already connected.
    pub fn make_sure_connected(&self) -> bool {
        self.inner.interval_connect(ConnectKind::TaskConnect);
        self.inner.link.status() == LongLinkStatus::Connected
    }

    /// Drops the current link and starts over on the new network.
    pub async fn network_change(&self) -> bool {
        info!("网络变化，重建长链");
        self.inner.link.disconnect(DisconnectReason::NetworkChange).await;
        self.inner
            .interval_connect(ConnectKind::NetworkChangeConnect)
            .is_zero()
    }

    pub fn auto_interval_connect(&self) {
        self.inner.auto_interval_connect();
    }

    pub fn on_status_changed(&self, status: LongLinkStatus) {
        self.inner.on_status_changed(status);
    }

    pub fn alarm_deadline(&self) -> Option<Instant> {
        *self.inner.alarm()
    }
}

impl Drop for LongLinkConnectMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

impl MonitorInner {
    fn alarm(&self) -> MutexGuard<'_, Option<Instant>> {
        self.alarm.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn arm(&self, after: Duration) {
        *self.alarm() = Some(Instant::now() + after);
        self.alarm_changed.notify_one();
    }

    fn cancel(&self) {
        *self.alarm() = None;
        self.alarm_changed.notify_one();
    }

    /// Returns the time left before an attempt of `kind` is allowed, zero
    /// once connecting or after starting one.
    fn interval_connect(&self, kind: ConnectKind) -> Duration {
        if self.link.status().is_connecting_or_connected() {
            return Duration::ZERO;
        }
        let now = Instant::now();
        let interval = connect_interval(
            kind,
            self.active.state_at(now),
            self.network.network_info().has_net(),
            self.active.has_account(),
        );
        let elapsed = self
            .link
            .last_attempt_at()
            .map(|at| now.saturating_duration_since(at));
        match elapsed {
            Some(elapsed) if elapsed < interval => interval - elapsed,
            _ => {
                debug!(kind = ?kind, interval = ?interval, "发起长链重连");
                self.link.make_sure_connected();
                Duration::ZERO
            }
        }
    }

    fn auto_interval_connect(&self) {
        self.cancel();
        let remain = self.interval_connect(ConnectKind::LongLinkConnect);
        if !remain.is_zero() {
            debug!(remain = ?remain, "等待长链重连间隔");
            self.arm(remain);
        }
    }

    fn on_status_changed(&self, status: LongLinkStatus) {
        self.cancel();
        if matches!(
            status,
            LongLinkStatus::ConnectFailed | LongLinkStatus::Disconnected
        ) {
            self.arm(self.reconnect_delay);
        }
    }

    async fn run(self: Arc<Self>, mut rx: broadcast::Receiver<CoreEvent>) {
        loop {
            let deadline = *self.alarm();
            tokio::select! {
                event = rx.recv() => match event {
                    Ok(CoreEvent::LongLinkStatus { status, .. }) => self.on_status_changed(status),
                    Ok(CoreEvent::Foreground(_)) | Ok(CoreEvent::Active(_)) => self.auto_interval_connect(),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "连接监控丢失部分事件");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    *self.alarm() = None;
                    self.auto_interval_connect();
                }
                _ = self.alarm_changed.notified() => {}
            }
        }
    }
}
