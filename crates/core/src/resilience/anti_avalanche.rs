use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::warn;

use super::{FlowLimit, FrequencyLimit};
use crate::models::{NetType, Task};

/// Which gate rejected a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FloodRejection {
    Frequency { span: Duration },
    Flow { len: usize },
}

/// Gate every outgoing task payload passes before it is handed to a link.
#[derive(Debug)]
pub struct FloodControl {
    frequency: FrequencyLimit,
    flow: FlowLimit,
}

impl FloodControl {
    pub fn new(is_active: bool, now: Instant) -> Self {
        Self {
            frequency: FrequencyLimit::new(now),
            flow: FlowLimit::new(is_active, now),
        }
    }

    pub fn check(
        &mut self,
        task: &Task,
        buf: &[u8],
        net: NetType,
        now: Instant,
    ) -> Result<(), FloodRejection> {
        if let Err(span) = self.frequency.check(task, buf, now) {
            warn!(task_id = task.task_id, span_ms = span.as_millis() as u64, "频率限制触发");
            metrics::counter!("linkmux_flood_rejected_total", "gate" => "frequency").increment(1);
            return Err(FloodRejection::Frequency { span });
        }

        if net == NetType::Mobile && !self.flow.check(task, buf.len(), now) {
            warn!(task_id = task.task_id, len = buf.len(), "流量限制触发");
            metrics::counter!("linkmux_flood_rejected_total", "gate" => "flow").increment(1);
            return Err(FloodRejection::Flow { len: buf.len() });
        }

        Ok(())
    }

    pub fn on_active(&mut self, is_active: bool, now: Instant) {
        self.flow.active(is_active, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_gate_only_on_mobile() {
        let now = Instant::now();
        let mut gate = FloodControl::new(true, now);
        let task = Task::with_id(1);
        let big = vec![0_u8; 9 * 1024 * 1024];
        assert!(gate.check(&task, &big, NetType::Wifi, now).is_ok());

        let mut fresh = Task::with_id(2);
        fresh.limit_frequency = false;
        assert_eq!(
            gate.check(&fresh, &big, NetType::Mobile, now),
            Err(FloodRejection::Flow { len: big.len() })
        );
    }

    #[test]
    fn test_frequency_gate_reports_span() {
        let now = Instant::now();
        let mut gate = FloodControl::new(true, now);
        let task = Task::with_id(1);
        for _ in 0..105 {
            assert!(gate.check(&task, b"ping", NetType::Wifi, now).is_ok());
        }
        let later = now + Duration::from_secs(2);
        assert_eq!(
            gate.check(&task, b"ping", NetType::Wifi, later),
            Err(FloodRejection::Frequency {
                span: Duration::from_secs(2)
            })
        );
    }
}
