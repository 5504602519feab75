use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub const INVALID_TASK_ID: u32 = 0;
pub const NOOP_TASK_ID: u32 = 0xFFFF_FFFF;
pub const IDENTIFY_TASK_ID: u32 = 0xFFFF_FFFE;

pub const TASK_PRIORITY_HIGHEST: i32 = 0;
pub const TASK_PRIORITY_NORMAL: i32 = 3;
pub const TASK_PRIORITY_LOWEST: i32 = 5;

static NEXT_TASK_ID: AtomicU32 = AtomicU32::new(1);

/// Hands out process-unique task ids, skipping the reserved values.
pub fn next_task_id() -> u32 {
    loop {
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        if id != INVALID_TASK_ID && id != NOOP_TASK_ID && id != IDENTIFY_TASK_ID {
            return id;
        }
    }
}

/// Bitset of channels a task may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct ChannelSelect(u8);

impl ChannelSelect {
    pub const NONE: ChannelSelect = ChannelSelect(0);
    pub const SHORT: ChannelSelect = ChannelSelect(1);
    pub const LONG: ChannelSelect = ChannelSelect(2);
    pub const BOTH: ChannelSelect = ChannelSelect(3);

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn has_short(&self) -> bool {
        self.0 & Self::SHORT.0 != 0
    }

    pub fn has_long(&self) -> bool {
        self.0 & Self::LONG.0 != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn without(self, other: ChannelSelect) -> ChannelSelect {
        ChannelSelect(self.0 & !other.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ChannelStrategy {
    #[default]
    Normal,
    Fast,
    DisasterRecovery,
}

/// The concrete channel a task attempt runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelType {
    Short,
    Long,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Short => "short",
            ChannelType::Long => "long",
        }
    }
}

/// Opaque application value that rides along with a task.
#[derive(Clone)]
pub struct UserContext(Arc<dyn Any + Send + Sync>);

impl UserContext {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for UserContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UserContext(..)")
    }
}

/// One application-level request/response unit.
#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: u32,
    pub cmd_id: u32,
    pub cgi: String,
    pub short_link_hosts: Vec<String>,
    pub long_link_hosts: Vec<String>,
    pub channel_select: ChannelSelect,
    pub channel_strategy: ChannelStrategy,
    pub send_only: bool,
    pub need_authed: bool,
    pub limit_flow: bool,
    pub limit_frequency: bool,
    pub network_status_sensitive: bool,
    pub priority: i32,
    /// Negative means "use the default".
    pub retry_count: i32,
    /// Milliseconds the server is expected to spend, negative when unknown.
    pub server_process_cost: i32,
    /// Milliseconds, negative when unset.
    pub total_timeout: i32,
    pub user_context: Option<UserContext>,
    pub report_arg: String,
}

impl Task {
    pub fn new(cmd_id: u32, cgi: impl Into<String>) -> Self {
        Self {
            task_id: next_task_id(),
            cmd_id,
            cgi: cgi.into(),
            ..Self::default()
        }
    }

    pub fn with_id(task_id: u32) -> Self {
        Self {
            task_id,
            ..Self::default()
        }
    }
}

impl Default for Task {
    fn default() -> Self {
        Self {
            task_id: INVALID_TASK_ID,
            cmd_id: 0,
            cgi: String::new(),
            short_link_hosts: Vec::new(),
            long_link_hosts: Vec::new(),
            channel_select: ChannelSelect::BOTH,
            channel_strategy: ChannelStrategy::Normal,
            send_only: false,
            need_authed: false,
            limit_flow: true,
            limit_frequency: true,
            network_status_sensitive: false,
            priority: TASK_PRIORITY_NORMAL,
            retry_count: -1,
            server_process_cost: -1,
            total_timeout: -1,
            user_context: None,
            report_arg: String::new(),
        }
    }
}
