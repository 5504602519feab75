//! 移动端网络传输核心。
//!
//! [`NetCore`] 接收应用任务，按通道选择规则分发到长链或短链调度器，
//! 并把结果、推送、网络错误与连通状态通过
//! [`TransportListener`](linkmux_core::traits::TransportListener) 回调给应用。

pub mod connectivity;
pub mod net_core;
mod router;

pub use connectivity::ConnectivityTracker;
pub use net_core::{choose_channel, prepare_task, Collaborators, NetCore, FOREGROUND_CONNECT_WINDOW};

pub use linkmux_core as core;
pub use linkmux_dispatcher as dispatcher;
pub use linkmux_infrastructure as infrastructure;
pub use linkmux_routing as routing;
