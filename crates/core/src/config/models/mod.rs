pub mod core_config;
pub mod heartbeat;
pub mod link;
pub mod network;

pub use core_config::CoreConfig;
pub use heartbeat::HeartbeatConfig;
pub use link::{LongLinkConfig, SchedulerConfig, ShortLinkConfig};
pub use network::NetworkSettings;
