//! 任务调度：长链与短链各有一个调度器，负责排队、超时、重试与结果回调。
//!
//! 调度器以单个 tokio 任务的形式运行，所有状态只在该任务内修改，
//! 外部通过句柄发送命令。后台期间失败的任务交给 [`ZombieTaskStore`]。

pub mod long_scheduler;
pub mod outcome;
pub mod quality;
pub mod queue;
pub mod short_scheduler;
pub mod transport;
pub mod zombie;

pub use long_scheduler::{LongLinkTaskScheduler, LongSchedulerDeps};
pub use outcome::{FailHandle, TaskOutcome, TaskResultSink};
pub use quality::QualityGate;
pub use queue::TaskQueue;
pub use short_scheduler::{ShortLinkTaskScheduler, ShortSchedulerDeps};
pub use transport::LinkTransport;
pub use zombie::{ZombieAction, ZombieTaskStore};
