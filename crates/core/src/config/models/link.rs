use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LongLinkConfig {
    pub connect_timeout_ms: u64,
    pub connect_interval_ms: u64,
    pub max_concurrent_connects: usize,
    /// Fast-strategy tasks fall back to short link above this many long-link tasks.
    pub fast_strategy_task_limit: usize,
}

impl Default for LongLinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 12_000,
            connect_interval_ms: 4_000,
            max_concurrent_connects: 3,
            fast_strategy_task_limit: 10,
        }
    }
}

impl LongLinkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn connect_interval(&self) -> Duration {
        Duration::from_millis(self.connect_interval_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connect_timeout_ms == 0 {
            return Err(anyhow::anyhow!("长链接连接超时必须大于0"));
        }
        if self.max_concurrent_connects == 0 {
            return Err(anyhow::anyhow!("长链接最大并发连接数必须大于0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShortLinkConfig {
    pub connect_timeout_ms: u64,
    pub connect_interval_ms: u64,
    pub use_proxy: bool,
    /// HTTP proxy used by tasks that run with `use_proxy`. Empty disables it.
    pub proxy_ip: String,
    pub proxy_port: u16,
    /// Consecutive short-link errors after which connectivity reads ServerFailed.
    pub error_threshold: u32,
}

impl Default for ShortLinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            connect_interval_ms: 4_000,
            use_proxy: false,
            proxy_ip: String::new(),
            proxy_port: 0,
            error_threshold: 3,
        }
    }
}

impl ShortLinkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn connect_interval(&self) -> Duration {
        Duration::from_millis(self.connect_interval_ms)
    }

    pub fn proxy(&self) -> Option<(&str, u16)> {
        (!self.proxy_ip.is_empty() && self.proxy_port != 0)
            .then_some((self.proxy_ip.as_str(), self.proxy_port))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connect_timeout_ms == 0 {
            return Err(anyhow::anyhow!("短链接连接超时必须大于0"));
        }
        if self.error_threshold == 0 {
            return Err(anyhow::anyhow!("短链接错误阈值必须大于0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    pub retry_interval_ms: u64,
    pub zombie_check_interval_ms: u64,
    pub zombie_retry_interval_secs: u64,
    pub reconnect_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            retry_interval_ms: 1_000,
            zombie_check_interval_ms: 3_000,
            zombie_retry_interval_secs: 60,
            reconnect_delay_ms: 500,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn zombie_check_interval(&self) -> Duration {
        Duration::from_millis(self.zombie_check_interval_ms)
    }

    pub fn zombie_retry_interval(&self) -> Duration {
        Duration::from_secs(self.zombie_retry_interval_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(anyhow::anyhow!("调度周期必须大于0"));
        }
        if self.zombie_check_interval_ms == 0 {
            return Err(anyhow::anyhow!("僵尸任务检查周期必须大于0"));
        }
        Ok(())
    }
}
