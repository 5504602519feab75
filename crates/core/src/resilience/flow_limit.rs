use tokio::time::Instant;
use tracing::{debug, error};

use crate::models::Task;

const INACTIVE_SPEED: u64 = 2 * 1024 * 1024 / 3600;
const ACTIVE_SPEED: u64 = 8 * 1024 * 1024 / 3600;
const INACTIVE_MIN_VOL: u64 = 6 * 1024 * 1024;
const MAX_VOL: u64 = 8 * 1024 * 1024;

/// Leaky-bucket byte budget, drained at a speed depending on app activity.
#[derive(Debug)]
pub struct FlowLimit {
    funnel_speed: u64,
    cur_vol: u64,
    last_flush: Instant,
}

impl FlowLimit {
    pub fn new(is_active: bool, now: Instant) -> Self {
        Self {
            funnel_speed: Self::speed(is_active),
            cur_vol: 0,
            last_flush: now,
        }
    }

    fn speed(is_active: bool) -> u64 {
        if is_active {
            ACTIVE_SPEED
        } else {
            INACTIVE_SPEED
        }
    }

    pub fn current_volume(&self) -> u64 {
        self.cur_vol
    }

    pub fn check(&mut self, task: &Task, len: usize, now: Instant) -> bool {
        if !task.limit_flow {
            return true;
        }
        self.flush(now);

        let len = len as u64;
        if self.cur_vol.saturating_add(len) > MAX_VOL {
            error!(
                task_id = task.task_id,
                cmd_id = task.cmd_id,
                cgi = %task.cgi,
                cur_vol = self.cur_vol,
                len,
                "流量超限，拒绝发送"
            );
            return false;
        }
        self.cur_vol += len;
        true
    }

    pub fn active(&mut self, is_active: bool, now: Instant) {
        self.flush(now);
        if !is_active && self.cur_vol > INACTIVE_MIN_VOL {
            self.cur_vol = INACTIVE_MIN_VOL;
        }
        self.funnel_speed = Self::speed(is_active);
        debug!(is_active, funnel_speed = self.funnel_speed, "流量漏斗速度切换");
    }

    fn flush(&mut self, now: Instant) {
        let interval = now.saturating_duration_since(self.last_flush).as_secs();
        if interval == 0 {
            return;
        }
        self.cur_vol = self.cur_vol.saturating_sub(interval.saturating_mul(self.funnel_speed));
        self.last_flush = now;
    }
}
