//! 长链接：连接状态机、心跳间隔自适应、身份校验与重连节奏控制

pub mod connection;
pub mod events;
pub mod heartbeat;
pub mod identify;
pub mod monitor;
pub mod race;
pub mod send_queue;

pub use connection::{LinkDeps, LongLinkConnection};
pub use events::{link_event_channel, LinkEvent, LinkEventReceiver, LinkEventSender};
pub use heartbeat::{HeartbeatAction, HeartbeatScheduler};
pub use identify::IdentityHandshake;
pub use monitor::{connect_interval, ConnectKind, LongLinkConnectMonitor, MonitoredLink};
pub use race::{race_connect, RaceConfig, RaceOutcome};
