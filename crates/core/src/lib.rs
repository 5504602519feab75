//! linkmux 传输核心的共享部分：任务与连接模型、注入式接口、配置、日志、
//! 事件总线和流控/超时算法。调度器与链接实现都建立在这里的类型之上。

pub mod active;
pub mod config;
pub mod events;
pub mod logging;
pub mod models;
pub mod resilience;
pub mod timeouts;
pub mod traits;

pub use active::{ActiveLogic, ActiveState};
pub use config::CoreConfig;
pub use events::{CoreEvent, EventBus, Subscription};
pub use linkmux_errors::{codes, ErrorKind, TransportError, TransportResult};
pub use models::*;
