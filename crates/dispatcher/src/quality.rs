use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use linkmux_core::resilience::{AdaptiveTimeout, FloodControl, FloodRejection, TimeoutStatus};
use linkmux_core::{NetType, Task};

/// Flood control and the adaptive timeout estimate, shared by both schedulers.
#[derive(Debug)]
pub struct QualityGate {
    flood: Mutex<FloodControl>,
    timeout: Mutex<AdaptiveTimeout>,
    flood_enabled: bool,
}

impl QualityGate {
    pub fn new(flood_enabled: bool, is_active: bool, now: Instant) -> Self {
        Self {
            flood: Mutex::new(FloodControl::new(is_active, now)),
            timeout: Mutex::new(AdaptiveTimeout::new()),
            flood_enabled,
        }
    }

    fn flood(&self) -> MutexGuard<'_, FloodControl> {
        self.flood.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn timeout(&self) -> MutexGuard<'_, AdaptiveTimeout> {
        self.timeout.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn check_flood(
        &self,
        task: &Task,
        buf: &[u8],
        net: NetType,
        now: Instant,
    ) -> Result<(), FloodRejection> {
        if !self.flood_enabled {
            return Ok(());
        }
        self.flood().check(task, buf, net, now)
    }

    pub fn on_active(&self, is_active: bool, now: Instant) {
        self.flood().on_active(is_active, now);
    }

    pub fn timeout_status(&self) -> TimeoutStatus {
        self.timeout().status()
    }

    pub fn record(&self, total_size: usize, cost: Duration, net: NetType, now: Instant) {
        self.timeout().record(total_size, cost, net, now);
    }

    pub fn record_failure(&self, now: Instant) {
        self.timeout().record_failure(now);
    }

    pub fn reset_timeout(&self) {
        self.timeout().reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_gate_admits_everything() {
        let now = Instant::now();
        let gate = QualityGate::new(false, true, now);
        let task = Task::with_id(1);
        for _ in 0..500 {
            assert!(gate.check_flood(&task, b"same", NetType::Mobile, now).is_ok());
        }
    }

    #[test]
    fn test_enabled_gate_rejects_repeats() {
        let now = Instant::now();
        let gate = QualityGate::new(true, true, now);
        let task = Task::with_id(1);
        let rejected = (0..200)
            .filter(|_| gate.check_flood(&task, b"same", NetType::Wifi, now).is_err())
            .count();
        assert!(rejected > 0);
    }

    #[test]
    fn test_failure_resets_to_evaluating() {
        let gate = QualityGate::new(true, true, Instant::now());
        gate.record_failure(Instant::now());
        assert_ne!(gate.timeout_status(), TimeoutStatus::Excellent);
        gate.reset_timeout();
        assert_eq!(gate.timeout_status(), TimeoutStatus::Evaluating);
    }
}
