use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::models::NetType;

/// Sentinel payload length marking a failed round trip.
pub const FAILED_PKG_LEN: usize = 0xFFFF_FFFF;

const SMALL_PKG_LEN: usize = 3 * 1024;
const MIDDLE_PKG_LEN: usize = 30 * 1024;
const BIG_PKG_LEN: usize = 60 * 1024;

const WIFI_COSTS: [Duration; 4] = [
    Duration::from_millis(1_000),
    Duration::from_millis(3_000),
    Duration::from_millis(7_000),
    Duration::from_millis(10_000),
];
const MOBILE_COSTS: [Duration; 4] = [
    Duration::from_millis(4_500),
    Duration::from_millis(9_000),
    Duration::from_millis(16_000),
    Duration::from_millis(25_000),
];

const MAX_CONTINUOUS_GOOD: u32 = 10;
const MIN_NORMAL_PKG_COUNT: u32 = 5;
const WINDOW_SIZE: usize = 10;
const WINDOW_FULL: u16 = (1 << WINDOW_SIZE) - 1;
const COUNT_EXPIRE: Duration = Duration::from_secs(3 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TimeoutStatus {
    #[default]
    Evaluating,
    Excellent,
    Bad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sample {
    MeetExpect,
    BigMeetExpect,
    Normal,
    Failed,
}

/// Three-state link quality estimate fed by completed round trips.
#[derive(Debug)]
pub struct AdaptiveTimeout {
    status: TimeoutStatus,
    continuous_good_count: u32,
    latest_good_time: Option<Instant>,
    window: u16,
    window_modify_time: Option<Instant>,
    window_pos: Option<usize>,
}

impl Default for AdaptiveTimeout {
    fn default() -> Self {
        Self::new()
    }
}

impl AdaptiveTimeout {
    pub fn new() -> Self {
        Self {
            status: TimeoutStatus::Evaluating,
            continuous_good_count: 0,
            latest_good_time: None,
            window: WINDOW_FULL,
            window_modify_time: None,
            window_pos: None,
        }
    }

    pub fn status(&self) -> TimeoutStatus {
        self.status
    }

    pub fn continuous_good_count(&self) -> u32 {
        self.continuous_good_count
    }

    pub fn good_bits(&self) -> u32 {
        self.window.count_ones()
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.record(FAILED_PKG_LEN, Duration::ZERO, NetType::Wifi, now);
    }

    /// Feeds one completed task: total bytes moved and the time it took.
    pub fn record(&mut self, total_size: usize, cost: Duration, net: NetType, now: Instant) {
        let sample = Self::classify(total_size, cost, net);
        self.switch_status(sample, now);
        debug!(
            sample = ?sample,
            good_count = self.continuous_good_count,
            good_bits = self.good_bits(),
            status = ?self.status,
            "动态超时状态更新"
        );
    }

    fn classify(total_size: usize, cost: Duration, net: NetType) -> Sample {
        if total_size == FAILED_PKG_LEN || cost.is_zero() {
            return Sample::Failed;
        }
        let costs = if net == NetType::Mobile {
            &MOBILE_COSTS
        } else {
            &WIFI_COSTS
        };
        let (bucket, big) = if total_size < SMALL_PKG_LEN {
            (0, false)
        } else if total_size <= MIDDLE_PKG_LEN {
            (1, true)
        } else if total_size <= BIG_PKG_LEN {
            (2, true)
        } else {
            (3, true)
        };
        match (cost <= costs[bucket], big) {
            (true, false) => Sample::MeetExpect,
            (true, true) => Sample::BigMeetExpect,
            (false, _) => Sample::Normal,
        }
    }

    fn switch_status(&mut self, sample: Sample, now: Instant) {
        let expired = self
            .window_modify_time
            .map_or(true, |t| now.saturating_duration_since(t) > COUNT_EXPIRE);
        if expired {
            self.window_modify_time = Some(now);
            self.window_pos = None;
            self.window = if self.status == TimeoutStatus::Bad {
                0
            } else {
                WINDOW_FULL
            };
        }

        let pos = match self.window_pos {
            Some(p) if p + 1 < WINDOW_SIZE => p + 1,
            _ => 0,
        };
        self.window_pos = Some(pos);

        let evaluating = self.status == TimeoutStatus::Evaluating;
        match sample {
            Sample::MeetExpect | Sample::BigMeetExpect => {
                if evaluating {
                    self.continuous_good_count += 1;
                    self.latest_good_time = Some(now);
                }
                self.window |= 1 << pos;
            }
            Sample::Normal => {
                if evaluating {
                    self.continuous_good_count = 0;
                    self.latest_good_time = None;
                }
                self.window |= 1 << pos;
            }
            Sample::Failed => {
                self.continuous_good_count = 0;
                self.latest_good_time = None;
                self.window &= !(1 << pos);
            }
        }

        match self.status {
            TimeoutStatus::Evaluating => {
                let recent = self
                    .latest_good_time
                    .is_some_and(|t| now.saturating_duration_since(t) <= COUNT_EXPIRE);
                if self.continuous_good_count >= MAX_CONTINUOUS_GOOD && recent {
                    self.status = TimeoutStatus::Excellent;
                } else if self.good_bits() <= MIN_NORMAL_PKG_COUNT {
                    self.status = TimeoutStatus::Bad;
                    self.window_modify_time = None;
                }
            }
            TimeoutStatus::Excellent => {
                if self.continuous_good_count == 0 && self.latest_good_time.is_none() {
                    self.status = TimeoutStatus::Evaluating;
                }
            }
            TimeoutStatus::Bad => {
                if self.good_bits() > MIN_NORMAL_PKG_COUNT {
                    self.status = TimeoutStatus::Evaluating;
                    self.window_modify_time = None;
                }
            }
        }
    }
}
