use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use linkmux_core::traits::{KeyValueStore, NetworkInfoProvider};
use linkmux_core::IPPortItem;

const BAN_FAIL_COUNT: u32 = 3;
const BAN_TIME: Duration = Duration::from_secs(6 * 60);
const MAX_BAN_TIME: Duration = Duration::from_secs(30 * 60);
const SERVER_BAN_TIME: Duration = Duration::from_secs(30 * 60);
const SUCCESS_UPDATE_INTERVAL: Duration = Duration::from_secs(10);
const FAIL_UPDATE_INTERVAL: Duration = Duration::from_secs(10);
const RECORD_RETENTION_SECS: i64 = 24 * 60 * 60;
const HISTORY_KEY_PREFIX: &str = "ipport_history/";

/// Ban length for an outcome window, `None` when the pair is not bannable.
///
/// Bit 0 is the most recent outcome, a set bit is a failure.
pub fn ban_duration(records: u8) -> Option<Duration> {
    if records.count_ones() < BAN_FAIL_COUNT {
        return None;
    }
    let streak = records.trailing_ones();
    let mut ban = BAN_TIME;
    if streak > BAN_FAIL_COUNT {
        ban += BAN_TIME * (streak - BAN_FAIL_COUNT);
    }
    Some(ban.min(MAX_BAN_TIME))
}

#[derive(Debug, Clone)]
struct BanItem {
    ip: String,
    port: u16,
    records: u8,
    last_fail_time: Option<Instant>,
    last_suc_time: Option<Instant>,
}

impl BanItem {
    fn new(ip: &str, port: u16) -> Self {
        Self {
            ip: ip.to_string(),
            port,
            records: 0,
            last_fail_time: None,
            last_suc_time: None,
        }
    }

    fn matches(&self, ip: &str, port: u16) -> bool {
        self.ip == ip && self.port == port
    }

    fn is_banned(&self, now: Instant) -> bool {
        let Some(ban) = ban_duration(self.records) else {
            return false;
        };
        self.last_fail_time
            .is_some_and(|at| now.saturating_duration_since(at) < ban)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HistoryItem {
    ip: String,
    port: u16,
    history: u64,
}

/// Long-term outcome history of one network, 64 outcomes per endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HistoryRecord {
    time: DateTime<Utc>,
    items: Vec<HistoryItem>,
}

impl HistoryRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.time).num_seconds();
        age < 0 || age >= RECORD_RETENTION_SECS
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    ban_list: Vec<BanItem>,
    server_bans: HashMap<String, Instant>,
    records: HashMap<String, HistoryRecord>,
}

impl TrackerState {
    fn find(&self, ip: &str, port: u16) -> Option<&BanItem> {
        self.ban_list.iter().find(|item| item.matches(ip, port))
    }

    fn can_update(&self, ip: &str, port: u16, success: bool, now: Instant) -> bool {
        let Some(item) = self.find(ip, port) else {
            return true;
        };
        let (last, interval) = if success {
            (item.last_suc_time, SUCCESS_UPDATE_INTERVAL)
        } else {
            (item.last_fail_time, FAIL_UPDATE_INTERVAL)
        };
        last.map_or(true, |at| now.saturating_duration_since(at) > interval)
    }

    fn update_ban_list(&mut self, ip: &str, port: u16, success: bool, now: Instant) {
        let index = match self.ban_list.iter().position(|item| item.matches(ip, port)) {
            Some(index) => index,
            None => {
                self.ban_list.push(BanItem::new(ip, port));
                self.ban_list.len() - 1
            }
        };
        let item = &mut self.ban_list[index];
        item.records = (item.records << 1) | u8::from(!success);
        if success {
            item.last_suc_time = Some(now);
        } else {
            item.last_fail_time = Some(now);
        }
    }

    fn is_server_banned(&mut self, ip: &str, now: Instant) -> bool {
        let Some(at) = self.server_bans.get(ip) else {
            return false;
        };
        if now.saturating_duration_since(*at) < SERVER_BAN_TIME {
            return true;
        }
        self.server_bans.remove(ip);
        false
    }

    fn is_excluded(&mut self, ip: &str, port: u16, now: Instant) -> bool {
        let banned = self.find(ip, port).is_some_and(|item| item.is_banned(now));
        banned || self.is_server_banned(ip, now)
    }
}

/// Remembers how each `(ip, port)` behaved and bans endpoints that keep failing.
///
/// Short-term state is an 8-outcome window per endpoint that drives bans.
/// Long-term state is a 64-outcome history per network that is persisted
/// and folded back into the window when the network is entered again.
pub struct AddressHealthTracker {
    store: Option<Arc<dyn KeyValueStore>>,
    network: Arc<dyn NetworkInfoProvider>,
    state: Mutex<TrackerState>,
}

impl AddressHealthTracker {
    pub fn new(network: Arc<dyn NetworkInfoProvider>, store: Option<Arc<dyn KeyValueStore>>) -> Self {
        let tracker = Self {
            store,
            network,
            state: Mutex::new(TrackerState::default()),
        };
        tracker.load_records();
        tracker.init_history_to_banned_list(false);
        tracker
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_net_key(&self) -> Option<String> {
        let info = self.network.network_info();
        if !info.has_net() {
            return None;
        }
        Some(
            info.net_key()
                .unwrap_or_else(|| info.net_type.as_str().to_string()),
        )
    }

    fn load_records(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let keys = match store.keys(HISTORY_KEY_PREFIX) {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "读取IP历史记录失败");
                return;
            }
        };

        let now = Utc::now();
        let mut state = self.lock();
        for key in keys {
            let parsed = store
                .read(&key)
                .ok()
                .flatten()
                .and_then(|raw| serde_json::from_str::<HistoryRecord>(&raw).ok());
            match parsed {
                Some(record) if !record.is_expired(now) => {
                    let net_key = key.trim_start_matches(HISTORY_KEY_PREFIX).to_string();
                    state.records.insert(net_key, record);
                }
                _ => {
                    debug!(key = %key, "清理过期或损坏的IP历史记录");
                    Self::remove_record(store.as_ref(), &key);
                }
            }
        }
    }

    fn save_records(&self, state: &mut TrackerState) {
        let Some(store) = &self.store else {
            return;
        };
        let now = Utc::now();
        state.records.retain(|net_key, record| {
            if record.is_expired(now) {
                Self::remove_record(store.as_ref(), &format!("{HISTORY_KEY_PREFIX}{net_key}"));
                return false;
            }
            true
        });
        for (net_key, record) in &state.records {
            Self::write_record(store.as_ref(), net_key, record);
        }
    }

    fn remove_record(store: &dyn KeyValueStore, key: &str) {
        if let Err(e) = store.remove(key) {
            warn!(key = %key, error = %e, "删除IP历史记录失败");
        }
    }

    fn write_record(store: &dyn KeyValueStore, net_key: &str, record: &HistoryRecord) {
        let key = format!("{HISTORY_KEY_PREFIX}{net_key}");
        match serde_json::to_string(record) {
            Ok(raw) => {
                if let Err(e) = store.write(&key, &raw) {
                    warn!(key = %key, error = %e, "保存IP历史记录失败");
                }
            }
            Err(e) => warn!(key = %key, error = %e, "序列化IP历史记录失败"),
        }
    }

    /// Rebuilds the ban window from the current network's persisted history.
    ///
    /// Each group of 8 historical outcomes becomes one bit, set when any of
    /// them failed. The newest group lands in bit 0.
    pub fn init_history_to_banned_list(&self, save: bool) {
        let net_key = self.current_net_key();
        let mut state = self.lock();
        if save {
            self.save_records(&mut state);
        }
        state.ban_list.clear();

        let Some(net_key) = net_key else {
            return;
        };
        let Some(record) = state.records.get(&net_key).cloned() else {
            return;
        };
        for item in record.items {
            let mut ban_item = BanItem::new(&item.ip, item.port);
            for group in (0..8).rev() {
                let bits = (item.history >> (group * 8)) & 0xFF;
                ban_item.records = (ban_item.records << 1) | u8::from(bits != 0);
            }
            state.ban_list.push(ban_item);
        }
        info!(net = %net_key, count = state.ban_list.len(), "从历史记录恢复IP封禁列表");
    }

    /// Records one outcome. Repeated outcomes of the same kind within 10 s are ignored.
    pub fn update(&self, ip: &str, port: u16, success: bool, now: Instant) {
        let Some(net_key) = self.current_net_key() else {
            return;
        };
        let mut state = self.lock();
        if !state.can_update(ip, port, success, now) {
            return;
        }
        state.update_ban_list(ip, port, success, now);
        if !success && state.find(ip, port).is_some_and(|item| item.is_banned(now)) {
            warn!(ip, port, "IP端口失败次数过多，已被封禁");
            metrics::counter!("linkmux_address_banned_total").increment(1);
        }

        let record = state
            .records
            .entry(net_key.clone())
            .or_insert_with(|| HistoryRecord {
                time: Utc::now(),
                items: Vec::new(),
            });
        let index = match record.items.iter().position(|i| i.ip == ip && i.port == port) {
            Some(index) => index,
            None => {
                record.items.push(HistoryItem {
                    ip: ip.to_string(),
                    port,
                    history: 0,
                });
                record.items.len() - 1
            }
        };
        let item = &mut record.items[index];
        item.history = (item.history << 1) | u64::from(!success);

        if let Some(store) = &self.store {
            Self::write_record(store.as_ref(), &net_key, record);
        }
    }

    /// Drops every outcome and server ban recorded for `ip`.
    pub fn remove_banned(&self, ip: &str) {
        let mut state = self.lock();
        state.ban_list.retain(|item| item.ip != ip);
        state.server_bans.remove(ip);
    }

    /// Excludes every port of `ip` for 30 minutes.
    pub fn add_server_ban(&self, ip: &str, now: Instant) {
        if ip.is_empty() {
            return;
        }
        warn!(ip, "服务器要求封禁IP");
        self.lock().server_bans.insert(ip.to_string(), now);
    }

    pub fn is_banned(&self, ip: &str, port: u16, now: Instant) -> bool {
        self.lock().is_excluded(ip, port, now)
    }

    /// Current ban length for the pair, whether or not it already elapsed.
    pub fn ban_duration_of(&self, ip: &str, port: u16) -> Option<Duration> {
        self.lock()
            .find(ip, port)
            .and_then(|item| ban_duration(item.records))
    }

    /// Removes banned endpoints, then orders the rest and keeps at most `need`.
    pub fn sort_and_filter(&self, items: &mut Vec<IPPortItem>, need: usize, now: Instant) {
        let mut state = self.lock();

        items.retain(|item| {
            let excluded = state.is_excluded(&item.ip, item.port, now);
            if excluded {
                warn!(ip = %item.ip, port = item.port, "IP端口处于封禁期，跳过");
            }
            !excluded
        });

        Self::sort_by_history(&state, items);
        items.truncate(need);
    }

    fn sort_by_history(state: &TrackerState, items: &mut Vec<IPPortItem>) {
        let mut rng = rand::rng();
        items.shuffle(&mut rng);

        // Keep equal ips apart so one bad host cannot take consecutive slots.
        let count = items.len();
        for i in 1..count.saturating_sub(1) {
            if items[i].ip != items[i - 1].ip {
                continue;
            }
            match (i + 1..count).find(|&j| items[j].ip != items[i - 1].ip) {
                Some(j) => items.swap(i, j),
                None => break,
            }
        }

        let (mut history, fresh): (Vec<IPPortItem>, Vec<IPPortItem>) = items
            .drain(..)
            .partition(|item| state.find(&item.ip, item.port).is_some());

        history.sort_by(|l, r| {
            let (Some(l), Some(r)) = (state.find(&l.ip, l.port), state.find(&r.ip, r.port)) else {
                return std::cmp::Ordering::Equal;
            };
            l.records
                .count_ones()
                .cmp(&r.records.count_ones())
                .then_with(|| l.last_fail_time.cmp(&r.last_fail_time))
                .then_with(|| r.last_suc_time.cmp(&l.last_suc_time))
        });

        let mut history = VecDeque::from(history);
        let mut fresh = VecDeque::from(fresh);
        while !history.is_empty() || !fresh.is_empty() {
            let pick = rng.random_range(0..history.len() + fresh.len());
            let next = if pick < history.len() {
                history.pop_front()
            } else {
                fresh.pop_front()
            };
            items.extend(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkmux_core::{IPSourceType, NetType, NetworkInfo};
    use linkmux_testing_utils::{FakeNetworkInfo, MemoryKeyValueStore};

    fn tracker() -> (AddressHealthTracker, Arc<MemoryKeyValueStore>) {
        let store = Arc::new(MemoryKeyValueStore::new());
        let network = Arc::new(FakeNetworkInfo::new(NetworkInfo::new(NetType::Wifi, "office")));
        (
            AddressHealthTracker::new(network, Some(store.clone() as Arc<dyn KeyValueStore>)),
            store,
        )
    }

    fn item(ip: &str, port: u16) -> IPPortItem {
        IPPortItem::new(ip, port, IPSourceType::Dns, "host")
    }

    fn fail_times(tracker: &AddressHealthTracker, ip: &str, port: u16, times: u32, start: Instant) -> Instant {
        let mut now = start;
        for _ in 0..times {
            tracker.update(ip, port, false, now);
            now += Duration::from_secs(11);
        }
        now
    }

    #[test]
    fn test_ban_duration_grows_with_streak() {
        assert_eq!(ban_duration(0b0000_0011), None);
        assert_eq!(ban_duration(0b0000_0111), Some(BAN_TIME));
        assert_eq!(ban_duration(0b0000_1111), Some(BAN_TIME * 2));
        assert_eq!(ban_duration(0b0001_0101), Some(BAN_TIME));
        assert_eq!(ban_duration(0xFF), Some(MAX_BAN_TIME));
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_failures_ban_until_elapsed() {
        let (tracker, _) = tracker();
        let start = Instant::now();
        let now = fail_times(&tracker, "1.1.1.1", 80, 3, start);

        let mut items = vec![item("1.1.1.1", 80), item("2.2.2.2", 80)];
        tracker.sort_and_filter(&mut items, 5, now);
        assert_eq!(items, vec![item("2.2.2.2", 80)]);

        let later = now + BAN_TIME;
        let mut items = vec![item("1.1.1.1", 80)];
        tracker.sort_and_filter(&mut items, 5, later);
        assert_eq!(items.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fourth_failure_extends_ban() {
        let (tracker, _) = tracker();
        let start = Instant::now();
        let now = fail_times(&tracker, "1.1.1.1", 80, 3, start);
        let third = tracker.ban_duration_of("1.1.1.1", 80).unwrap();

        fail_times(&tracker, "1.1.1.1", 80, 1, now);
        let fourth = tracker.ban_duration_of("1.1.1.1", 80).unwrap();
        assert!(fourth > third);
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_within_interval_are_ignored() {
        let (tracker, _) = tracker();
        let now = Instant::now();
        for _ in 0..5 {
            tracker.update("1.1.1.1", 80, false, now);
        }
        assert_eq!(tracker.ban_duration_of("1.1.1.1", 80), None);
        assert!(!tracker.is_banned("1.1.1.1", 80, now));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_ban_covers_all_ports() {
        let (tracker, _) = tracker();
        let now = Instant::now();
        tracker.add_server_ban("3.3.3.3", now);
        assert!(tracker.is_banned("3.3.3.3", 80, now));
        assert!(tracker.is_banned("3.3.3.3", 443, now));
        assert!(!tracker.is_banned("3.3.3.3", 443, now + SERVER_BAN_TIME));

        tracker.add_server_ban("3.3.3.3", now);
        tracker.remove_banned("3.3.3.3");
        assert!(!tracker.is_banned("3.3.3.3", 80, now));
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_history_sorts_before_failing() {
        let (tracker, _) = tracker();
        let now = Instant::now();
        tracker.update("1.1.1.1", 80, true, now);
        tracker.update("2.2.2.2", 80, false, now);
        tracker.update("2.2.2.2", 80, false, now + Duration::from_secs(11));

        for _ in 0..20 {
            let mut items = vec![item("2.2.2.2", 80), item("1.1.1.1", 80)];
            tracker.sort_and_filter(&mut items, 5, now + Duration::from_secs(30));
            assert_eq!(items, vec![item("1.1.1.1", 80), item("2.2.2.2", 80)]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_truncates_to_need() {
        let (tracker, _) = tracker();
        let mut items: Vec<_> = (1..=8).map(|i| item(&format!("10.0.0.{i}"), 80)).collect();
        tracker.sort_and_filter(&mut items, 5, Instant::now());
        assert_eq!(items.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_survives_restart() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let network = Arc::new(FakeNetworkInfo::new(NetworkInfo::new(NetType::Wifi, "office")));
        let now = Instant::now();
        {
            let tracker = AddressHealthTracker::new(
                network.clone(),
                Some(store.clone() as Arc<dyn KeyValueStore>),
            );
            fail_times(&tracker, "1.1.1.1", 80, 3, now);
        }
        assert_eq!(store.keys(HISTORY_KEY_PREFIX).unwrap().len(), 1);

        let tracker = AddressHealthTracker::new(network, Some(store as Arc<dyn KeyValueStore>));
        // Three failures fold into the newest bit only.
        assert_eq!(tracker.ban_duration_of("1.1.1.1", 80), None);
        let mut items = vec![item("1.1.1.1", 80), item("9.9.9.9", 80)];
        tracker.sort_and_filter(&mut items, 5, now);
        assert_eq!(items.len(), 2);
    }

    /// Store whose removals always fail.
    struct StickyStore {
        inner: MemoryKeyValueStore,
        removals: std::sync::atomic::AtomicUsize,
    }

    impl KeyValueStore for StickyStore {
        fn read(&self, key: &str) -> linkmux_core::TransportResult<Option<String>> {
            self.inner.read(key)
        }

        fn write(&self, key: &str, value: &str) -> linkmux_core::TransportResult<()> {
            self.inner.write(key, value)
        }

        fn remove(&self, _key: &str) -> linkmux_core::TransportResult<()> {
            self.removals
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(linkmux_core::TransportError::storage("read-only"))
        }

        fn keys(&self, prefix: &str) -> linkmux_core::TransportResult<Vec<String>> {
            self.inner.keys(prefix)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_record_dropped_when_remove_fails() {
        let store = Arc::new(StickyStore {
            inner: MemoryKeyValueStore::new(),
            removals: std::sync::atomic::AtomicUsize::new(0),
        });
        let network = Arc::new(FakeNetworkInfo::new(NetworkInfo::new(NetType::Wifi, "office")));
        let tracker = AddressHealthTracker::new(network, Some(store.clone() as Arc<dyn KeyValueStore>));

        let stale = HistoryRecord {
            time: Utc::now() - chrono::Duration::seconds(RECORD_RETENTION_SECS + 60),
            items: Vec::new(),
        };
        tracker.lock().records.insert("stale-net".into(), stale);
        tracker.init_history_to_banned_list(true);

        assert_eq!(store.removals.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(!tracker.lock().records.contains_key("stale-net"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_net_ignores_updates() {
        let network = Arc::new(FakeNetworkInfo::new(NetworkInfo::no_net()));
        let tracker = AddressHealthTracker::new(network, None);
        fail_times(&tracker, "1.1.1.1", 80, 3, Instant::now());
        assert_eq!(tracker.ban_duration_of("1.1.1.1", 80), None);
    }
}
