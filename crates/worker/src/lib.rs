//! 短链接：每个任务一条连接，发送请求、读取完整响应后即关闭。
//!
//! 调度器通过 [`ShortLinkFactory`] 为每次尝试启动一个 [`ShortLinkHandle`]，
//! 工作任务的进展以 [`ShortLinkEvent`] 回传。

pub mod events;
pub mod factory;
pub mod shortlink;

pub use events::{short_link_event_channel, ShortLinkEvent, ShortLinkEventReceiver, ShortLinkEventSender};
pub use factory::{ShortLinkFactory, TcpShortLinkFactory};
pub use shortlink::{Breaker, ShortLinkDeps, ShortLinkHandle, ShortLinkRequest, ShortLinkWorker};
