use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use super::{
    heartbeat::HeartbeatConfig,
    link::{LongLinkConfig, SchedulerConfig, ShortLinkConfig},
    network::NetworkSettings,
};
use crate::logging::LogConfig;

/// Transport core configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub long_link: LongLinkConfig,
    pub short_link: ShortLinkConfig,
    pub heartbeat: HeartbeatConfig,
    pub scheduler: SchedulerConfig,
    pub network: NetworkSettings,
    pub logging: LogConfig,
    /// Frequency and flow limiting in front of both schedulers.
    pub flood_control_enabled: bool,
}

impl CoreConfig {
    /// Load configuration from a TOML file and `LINKMUX_` environment overrides.
    ///
    /// Nested keys use a double underscore, e.g. `LINKMUX_HEARTBEAT__MIN_INTERVAL_SECS=300`.
    /// With no path the default locations are tried and built-in defaults apply
    /// when none exists.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/linkmux.toml", "linkmux.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("LINKMUX")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: CoreConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: CoreConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.long_link.validate().context("长链接配置验证失败")?;
        self.short_link.validate().context("短链接配置验证失败")?;
        self.heartbeat.validate().context("心跳配置验证失败")?;
        self.scheduler.validate().context("调度配置验证失败")?;
        self.network.validate().context("网络配置验证失败")?;
        self.logging
            .validate()
            .map_err(|e| anyhow::anyhow!(e))
            .context("日志配置验证失败")?;

        Ok(())
    }
}
