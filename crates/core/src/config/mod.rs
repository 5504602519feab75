//! 传输核心配置
//!
//! 配置按模块分节：长链接、短链接、心跳、调度、网络地址与日志。
//! 加载顺序为内置默认值、TOML 文件、`LINKMUX_` 前缀的环境变量，后者优先级最高。
//! 每一节都提供 `validate`，加载完成后统一校验。

pub mod models;

pub use models::{
    CoreConfig, HeartbeatConfig, LongLinkConfig, NetworkSettings, SchedulerConfig,
    ShortLinkConfig,
};
