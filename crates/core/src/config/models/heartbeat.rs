use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    pub success_step_secs: u64,
    pub heart_step_secs: u64,
    /// Overrides the adaptive interval when set.
    pub fixed_interval_secs: Option<u64>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: 270,
            max_interval_secs: 1710,
            success_step_secs: 20,
            heart_step_secs: 60,
            fixed_interval_secs: None,
        }
    }
}

impl HeartbeatConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_interval_secs)
    }

    pub fn success_step(&self) -> Duration {
        Duration::from_secs(self.success_step_secs)
    }

    pub fn heart_step(&self) -> Duration {
        Duration::from_secs(self.heart_step_secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_interval_secs == 0 {
            return Err(anyhow::anyhow!("最小心跳间隔必须大于0"));
        }
        if self.max_interval_secs
            < self
                .min_interval_secs
                .saturating_add(self.success_step_secs)
        {
            return Err(anyhow::anyhow!(
                "最大心跳间隔({})必须不小于最小心跳间隔({})与成功步长({})之和",
                self.max_interval_secs,
                self.min_interval_secs,
                self.success_step_secs
            ));
        }
        if self.heart_step_secs == 0 {
            return Err(anyhow::anyhow!("心跳调整步长必须大于0"));
        }
        if self.fixed_interval_secs == Some(0) {
            return Err(anyhow::anyhow!("固定心跳间隔必须大于0"));
        }
        Ok(())
    }
}
