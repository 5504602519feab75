use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use linkmux_core::config::HeartbeatConfig;
use linkmux_core::traits::{KeyValueStore, NetworkInfoProvider};
use linkmux_core::{ActiveLogic, NetType};

/// Rounds per connection before the learned interval is used.
pub const NET_STABLE_TEST_COUNT: u32 = 3;
const BASE_SUCC_COUNT: u32 = 3;
const MAX_HEART_FAIL_COUNT: u32 = 3;
const MIN_HEART_FAIL_REPORT: u32 = 6;
const PROBE_AFTER_SECS: i64 = 7 * 24 * 60 * 60;
const MAX_SECTIONS: usize = 20;
const DOZE_SKEW: Duration = Duration::from_secs(20);
const SECTION_KEY_PREFIX: &str = "heartbeat/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartType {
    #[default]
    None,
    Smart,
    Doze,
}

/// Notable transitions of the interval machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    CalcEnd,
    ReCalc,
    Disconnect,
    BadNetwork,
}

/// Persisted per-network tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HeartSection {
    modify_time: i64,
    cur_heart: u64,
    fail_count: u32,
    stable: bool,
    net_type: NetType,
    heart_type: HeartType,
    min_heart_fail: u32,
}

#[derive(Debug, Clone)]
struct NetHeartInfo {
    net_detail: String,
    net_type: NetType,
    modify_time: DateTime<Utc>,
    cur_heart: Duration,
    succ_count: u32,
    fail_count: u32,
    min_fail_count: u32,
    heart_type: HeartType,
    stable: bool,
}

impl NetHeartInfo {
    fn cleared(min: Duration) -> Self {
        Self {
            net_detail: String::new(),
            net_type: NetType::NoNet,
            modify_time: DateTime::<Utc>::default(),
            cur_heart: min,
            succ_count: 0,
            fail_count: 0,
            min_fail_count: 0,
            heart_type: HeartType::None,
            stable: false,
        }
    }
}

/// Adapts the noop interval to what the current network tolerates.
///
/// Each connection first runs a few rounds at the minimum interval. After
/// that a success streak probes a longer interval and a failure streak steps
/// back and marks the result stable. State is kept per network so switching
/// back restores what was learned.
pub struct HeartbeatScheduler {
    config: HeartbeatConfig,
    active: Arc<ActiveLogic>,
    network: Arc<dyn NetworkInfoProvider>,
    store: Option<Arc<dyn KeyValueStore>>,
    waiting_response: bool,
    success_count: u32,
    last_heart: Duration,
    current: NetHeartInfo,
    doze_count: i32,
    normal_count: i32,
    noop_started_at: Option<Instant>,
}

impl HeartbeatScheduler {
    pub fn new(
        config: HeartbeatConfig,
        active: Arc<ActiveLogic>,
        network: Arc<dyn NetworkInfoProvider>,
        store: Option<Arc<dyn KeyValueStore>>,
    ) -> Self {
        let min = config.min_interval();
        Self {
            config,
            active,
            network,
            store,
            waiting_response: false,
            success_count: 0,
            last_heart: min,
            current: NetHeartInfo::cleared(min),
            doze_count: 0,
            normal_count: 0,
            noop_started_at: None,
        }
    }

    fn min(&self) -> Duration {
        self.config.min_interval()
    }

    /// Highest interval the machine settles on.
    fn ceiling(&self) -> Duration {
        self.config
            .max_interval()
            .saturating_sub(self.config.success_step())
            .max(self.min())
    }

    /// Configured override that bypasses the adaptive interval.
    pub fn fixed_interval(&self) -> Option<Duration> {
        self.config.fixed_interval_secs.map(Duration::from_secs)
    }

    pub fn current_interval(&self) -> Duration {
        self.current.cur_heart
    }

    pub fn is_stable(&self) -> bool {
        self.current.stable
    }

    pub fn net_detail(&self) -> &str {
        &self.current.net_detail
    }

    pub fn on_heartbeat_start(&mut self, now: Instant) {
        self.noop_started_at = Some(now);
        self.waiting_response = true;
    }

    pub fn on_long_link_established(&mut self) {
        self.load_section();
        self.success_count = 0;
    }

    pub fn on_long_link_disconnect(&mut self) -> Vec<HeartbeatAction> {
        let actions = self.on_heart_result(false, false);
        if !self.current.stable {
            debug!(net = %self.current.net_detail, heart = ?self.current.cur_heart, "心跳未稳定");
            return actions;
        }
        self.current.succ_count = 0;
        self.last_heart = self.min();
        actions
    }

    pub fn on_heart_result(&mut self, success: bool, fail_timeout: bool) -> Vec<HeartbeatAction> {
        let mut actions = Vec::new();
        if !self.waiting_response {
            return actions;
        }
        if !success && self.success_count >= NET_STABLE_TEST_COUNT && self.current.stable {
            actions.push(HeartbeatAction::Disconnect);
        }
        debug!(success, fail_timeout, "心跳结果");
        self.waiting_response = false;

        if self.current.net_detail.is_empty() {
            return actions;
        }

        if success {
            self.success_count += 1;
        }

        if self.success_count < NET_STABLE_TEST_COUNT {
            self.current.min_fail_count = if success {
                0
            } else {
                self.current.min_fail_count + 1
            };
            if self.current.min_fail_count >= MIN_HEART_FAIL_REPORT
                && self.network.network_info().has_net()
            {
                warn!(net = %self.current.net_detail, "最小心跳间隔连续失败，网络质量差");
                actions.push(HeartbeatAction::BadNetwork);
                self.current.min_fail_count = 0;
            }
            return actions;
        }

        if self.last_heart != self.current.cur_heart {
            debug!("本次心跳间隔与当前值不一致，忽略");
            return actions;
        }

        if success {
            self.current.succ_count += 1;
            self.current.fail_count = 0;
        } else {
            self.current.fail_count += 1;
        }

        let ceiling = self.ceiling();
        if success && self.current.stable {
            if self.current.cur_heart >= ceiling {
                return actions;
            }
            let age = Utc::now()
                .signed_duration_since(self.current.modify_time)
                .num_seconds();
            if age >= PROBE_AFTER_SECS {
                info!(heart = ?self.current.cur_heart, "稳定心跳超过7天，尝试更长间隔");
                self.current.cur_heart += self.config.success_step();
                self.current.succ_count = 0;
                self.current.stable = false;
                self.current.fail_count = 0;
                actions.push(HeartbeatAction::ReCalc);
                self.save_section();
            }
            return actions;
        }

        if success {
            if self.current.succ_count >= BASE_SUCC_COUNT {
                if self.current.cur_heart >= ceiling {
                    self.current.cur_heart = ceiling;
                    self.current.succ_count = 0;
                    self.current.stable = true;
                    self.current.heart_type = self.heart_type_now();
                    info!(net = %self.current.net_detail, heart = ?self.current.cur_heart, "找到合适的心跳间隔");
                    actions.push(HeartbeatAction::CalcEnd);
                } else {
                    self.current.succ_count = 0;
                    let old = self.current.cur_heart;
                    self.current.cur_heart = if self.is_doze_style() {
                        ceiling
                    } else {
                        (self.current.cur_heart + self.config.heart_step()).min(ceiling)
                    };
                    info!(from = ?old, to = ?self.current.cur_heart, "增大心跳间隔");
                }
            }
        } else {
            if self.last_heart == self.min() {
                return actions;
            }
            if self.current.fail_count >= MAX_HEART_FAIL_COUNT {
                if self.current.stable {
                    self.current.cur_heart = self.min();
                    self.current.succ_count = 0;
                    self.current.stable = false;
                    self.current.fail_count = 0;
                    actions.push(HeartbeatAction::ReCalc);
                    info!("稳定心跳间隔失效，重新计算");
                } else {
                    let step_back = self.config.heart_step() + self.config.success_step();
                    self.current.cur_heart = if self.is_doze_style() {
                        self.min()
                    } else {
                        match self.current.cur_heart.checked_sub(step_back) {
                            Some(lower) if lower > self.min() => lower,
                            _ => self.min(),
                        }
                    };
                    self.current.succ_count = 0;
                    self.current.fail_count = 0;
                    self.current.stable = true;
                    self.current.heart_type = self.heart_type_now();
                    info!(heart = ?self.current.cur_heart, "心跳间隔计算完成");
                    actions.push(HeartbeatAction::CalcEnd);
                }
            }
        }

        self.save_section();
        actions
    }

    fn heart_type_now(&self) -> HeartType {
        if self.is_doze_style() {
            HeartType::Doze
        } else {
            HeartType::Smart
        }
    }

    /// Compares the actual noop spacing against the interval while inactive on mobile.
    pub fn judge_doze_style(&mut self, now: Instant) {
        if self.active.is_active() {
            return;
        }
        let Some(started) = self.noop_started_at.take() else {
            return;
        };
        if !self.network.network_info().is_mobile() {
            return;
        }
        let actual = now.saturating_duration_since(started);
        let skew = if actual > self.last_heart {
            actual - self.last_heart
        } else {
            self.last_heart - actual
        };
        if skew >= DOZE_SKEW {
            self.doze_count += 1;
            self.normal_count = (self.normal_count - 1).max(0);
        } else {
            self.normal_count += 1;
            self.doze_count = (self.doze_count - 1).max(0);
        }
    }

    pub fn is_doze_style(&self) -> bool {
        self.doze_count > 2 * self.normal_count && self.network.network_info().is_mobile()
    }

    pub fn next_interval(&mut self) -> Duration {
        let min = self.min();
        if self.active.is_active()
            || self.success_count < NET_STABLE_TEST_COUNT
            || self.current.net_detail.is_empty()
        {
            self.last_heart = min;
            return min;
        }

        self.last_heart = self.current.cur_heart;
        if self.is_doze_style()
            && self.current.heart_type != HeartType::Doze
            && self.last_heart != self.ceiling()
        {
            self.current.cur_heart = min;
            self.last_heart = min;
        }
        if self.last_heart >= self.config.max_interval() || self.last_heart < min {
            self.current.cur_heart = min;
            self.last_heart = min;
        }
        metrics::gauge!("linkmux_heartbeat_interval_seconds").set(self.last_heart.as_secs_f64());
        self.last_heart
    }

    fn load_section(&mut self) {
        let info = self.network.network_info();
        let Some(net_detail) = info.net_key() else {
            self.current = NetHeartInfo::cleared(self.min());
            warn!("网络标识为空，心跳使用默认值");
            return;
        };
        if net_detail == self.current.net_detail {
            return;
        }

        self.current = NetHeartInfo::cleared(self.min());
        self.current.net_detail = net_detail.clone();
        self.current.net_type = info.net_type;

        match self.read_section(&net_detail) {
            Some(section) => {
                self.current.modify_time = DateTime::from_timestamp(section.modify_time, 0)
                    .unwrap_or_default();
                self.current.cur_heart = Duration::from_secs(section.cur_heart);
                self.current.fail_count = section.fail_count;
                self.current.stable = section.stable;
                self.current.net_type = section.net_type;
                self.current.heart_type = section.heart_type;
                self.current.min_fail_count = section.min_heart_fail;

                if self.current.cur_heart < self.min() {
                    self.current.cur_heart = self.min();
                }
                if self.current.cur_heart > self.config.max_interval() {
                    self.current.cur_heart = self.ceiling();
                }
                let now = Utc::now();
                if self.current.modify_time > now {
                    self.current.modify_time = now;
                }
            }
            None => {
                self.limit_sections();
                self.save_section();
            }
        }
        info!(
            net = %self.current.net_detail,
            heart = ?self.current.cur_heart,
            stable = self.current.stable,
            "加载心跳配置"
        );
    }

    fn section_key(net_detail: &str) -> String {
        format!("{SECTION_KEY_PREFIX}{net_detail}")
    }

    fn read_section(&self, net_detail: &str) -> Option<HeartSection> {
        let store = self.store.as_ref()?;
        let raw = store.read(&Self::section_key(net_detail)).ok().flatten()?;
        serde_json::from_str(&raw).ok()
    }

    /// Keeps room for one more section, evicting invalid ones first and then
    /// the least recently modified.
    fn limit_sections(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let Ok(keys) = store.keys(SECTION_KEY_PREFIX) else {
            return;
        };
        if keys.len() < MAX_SECTIONS {
            return;
        }
        warn!(count = keys.len(), max = MAX_SECTIONS, "心跳配置分节过多，清理最旧的分节");

        let now = Utc::now().timestamp();
        let mut valid = Vec::new();
        for key in keys {
            let section = store
                .read(&key)
                .ok()
                .flatten()
                .and_then(|raw| serde_json::from_str::<HeartSection>(&raw).ok());
            match section {
                Some(section) if section.modify_time <= now => valid.push((section.modify_time, key)),
                _ => {
                    let _ = store.remove(&key);
                }
            }
        }
        valid.sort();
        let excess = (valid.len() + 1).saturating_sub(MAX_SECTIONS);
        for (_, key) in valid.into_iter().take(excess) {
            let _ = store.remove(&key);
        }
    }

    fn save_section(&mut self) {
        if self.current.net_detail.is_empty() {
            return;
        }
        self.current.modify_time = Utc::now();
        let Some(store) = &self.store else {
            return;
        };
        let section = HeartSection {
            modify_time: self.current.modify_time.timestamp(),
            cur_heart: self.current.cur_heart.as_secs(),
            fail_count: self.current.fail_count,
            stable: self.current.stable,
            net_type: self.current.net_type,
            heart_type: self.current.heart_type,
            min_heart_fail: self.current.min_fail_count,
        };
        let key = Self::section_key(&self.current.net_detail);
        match serde_json::to_string(&section) {
            Ok(raw) => {
                if let Err(e) = store.write(&key, &raw) {
                    warn!(key = %key, error = %e, "保存心跳配置失败");
                }
            }
            Err(e) => warn!(error = %e, "序列化心跳配置失败"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkmux_core::NetworkInfo;
    use linkmux_testing_utils::{FakeNetworkInfo, MemoryKeyValueStore};

    fn inactive_scheduler(
        store: Arc<MemoryKeyValueStore>,
        network: Arc<FakeNetworkInfo>,
    ) -> HeartbeatScheduler {
        let active = Arc::new(ActiveLogic::new(false));
        HeartbeatScheduler::new(
            HeartbeatConfig::default(),
            active,
            network,
            Some(store as Arc<dyn KeyValueStore>),
        )
    }

    fn round(hb: &mut HeartbeatScheduler, success: bool) -> Vec<HeartbeatAction> {
        hb.next_interval();
        hb.on_heartbeat_start(Instant::now());
        hb.on_heart_result(success, false)
    }

    fn wifi() -> Arc<FakeNetworkInfo> {
        Arc::new(FakeNetworkInfo::new(NetworkInfo::new(NetType::Wifi, "home")))
    }

    #[tokio::test(start_paused = true)]
    async fn test_ceiling_never_drops_below_min() {
        let config = HeartbeatConfig {
            max_interval_secs: 10,
            success_step_secs: 60,
            ..HeartbeatConfig::default()
        };
        let active = Arc::new(ActiveLogic::new(false));
        let hb = HeartbeatScheduler::new(config, active, wifi(), None);
        assert_eq!(hb.ceiling(), Duration::from_secs(270));
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_app_uses_min_interval() {
        let active = Arc::new(ActiveLogic::new(true));
        let mut hb = HeartbeatScheduler::new(HeartbeatConfig::default(), active, wifi(), None);
        hb.on_long_link_established();
        assert_eq!(hb.next_interval(), Duration::from_secs(270));
    }

    #[tokio::test(start_paused = true)]
    async fn test_evaluation_rounds_then_probe_up() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let mut hb = inactive_scheduler(store, wifi());
        tokio::time::advance(linkmux_core::active::INACTIVE_AFTER).await;
        hb.on_long_link_established();

        for _ in 0..NET_STABLE_TEST_COUNT {
            round(&mut hb, true);
        }
        assert_eq!(hb.current_interval(), Duration::from_secs(270));

        for _ in 0..BASE_SUCC_COUNT {
            round(&mut hb, true);
        }
        assert_eq!(hb.current_interval(), Duration::from_secs(330));
        assert_eq!(hb.next_interval(), Duration::from_secs(330));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_step_back_and_stabilize() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let mut hb = inactive_scheduler(store, wifi());
        tokio::time::advance(linkmux_core::active::INACTIVE_AFTER).await;
        hb.on_long_link_established();

        for _ in 0..NET_STABLE_TEST_COUNT + 2 * BASE_SUCC_COUNT {
            round(&mut hb, true);
        }
        assert_eq!(hb.current_interval(), Duration::from_secs(390));

        let mut actions = Vec::new();
        for _ in 0..MAX_HEART_FAIL_COUNT {
            actions.extend(round(&mut hb, false));
        }
        assert!(hb.is_stable());
        assert_eq!(hb.current_interval(), Duration::from_secs(310));
        assert!(actions.contains(&HeartbeatAction::CalcEnd));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_capped_below_max() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let mut hb = inactive_scheduler(store, wifi());
        tokio::time::advance(linkmux_core::active::INACTIVE_AFTER).await;
        hb.on_long_link_established();

        for _ in 0..200 {
            round(&mut hb, true);
        }
        assert_eq!(hb.current_interval(), Duration::from_secs(1690));
        assert!(hb.is_stable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_persists_per_network() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let network = wifi();
        {
            let mut hb = inactive_scheduler(store.clone(), network.clone());
            tokio::time::advance(linkmux_core::active::INACTIVE_AFTER).await;
            hb.on_long_link_established();
            for _ in 0..NET_STABLE_TEST_COUNT + BASE_SUCC_COUNT {
                round(&mut hb, true);
            }
        }

        let mut hb = inactive_scheduler(store, network.clone());
        hb.on_long_link_established();
        assert_eq!(hb.current_interval(), Duration::from_secs(330));

        network.set(NetworkInfo::new(NetType::Wifi, "office"));
        hb.on_long_link_established();
        assert_eq!(hb.net_detail(), "wifi_office");
        assert_eq!(hb.current_interval(), Duration::from_secs(270));
    }

    #[tokio::test]
    async fn test_sections_are_bounded() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let network = wifi();
        let mut hb = inactive_scheduler(store.clone(), network.clone());
        for i in 0..30 {
            network.set(NetworkInfo::new(NetType::Wifi, format!("net{i}")));
            hb.on_long_link_established();
        }
        assert!(store.keys(SECTION_KEY_PREFIX).unwrap().len() <= MAX_SECTIONS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_doze_style_on_mobile_skew() {
        let network = Arc::new(FakeNetworkInfo::new(NetworkInfo::new(NetType::Mobile, "cmnet")));
        let active = Arc::new(ActiveLogic::new(false));
        let mut hb = HeartbeatScheduler::new(HeartbeatConfig::default(), active, network, None);
        tokio::time::advance(linkmux_core::active::INACTIVE_AFTER).await;

        for _ in 0..3 {
            let interval = hb.next_interval();
            let start = Instant::now();
            hb.on_heartbeat_start(start);
            hb.judge_doze_style(start + interval + Duration::from_secs(60));
        }
        assert!(hb.is_doze_style());
    }
}
