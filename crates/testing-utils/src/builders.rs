//! Test data builders with sensible defaults and easy customization.

use linkmux_core::{ChannelSelect, ChannelStrategy, Task, UserContext};

/// Builder for test [`Task`]s. Defaults to a both-channels task with
/// cmd id 1 and cgi `/cgi-bin/test`.
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new() -> Self {
        let mut task = Task::new(1, "/cgi-bin/test");
        task.short_link_hosts = vec!["short.test".to_string()];
        task.long_link_hosts = vec!["long.test".to_string()];
        Self { task }
    }

    pub fn with_id(mut self, task_id: u32) -> Self {
        self.task.task_id = task_id;
        self
    }

    pub fn with_cmd_id(mut self, cmd_id: u32) -> Self {
        self.task.cmd_id = cmd_id;
        self
    }

    pub fn with_cgi(mut self, cgi: &str) -> Self {
        self.task.cgi = cgi.to_string();
        self
    }

    pub fn with_channel(mut self, channel: ChannelSelect) -> Self {
        self.task.channel_select = channel;
        self
    }

    pub fn with_strategy(mut self, strategy: ChannelStrategy) -> Self {
        self.task.channel_strategy = strategy;
        self
    }

    pub fn with_retry_count(mut self, retry_count: i32) -> Self {
        self.task.retry_count = retry_count;
        self
    }

    pub fn with_total_timeout_ms(mut self, total_timeout: i32) -> Self {
        self.task.total_timeout = total_timeout;
        self
    }

    pub fn with_server_cost_ms(mut self, cost: i32) -> Self {
        self.task.server_process_cost = cost;
        self
    }

    pub fn with_send_only(mut self, send_only: bool) -> Self {
        self.task.send_only = send_only;
        self
    }

    pub fn with_need_authed(mut self, need_authed: bool) -> Self {
        self.task.need_authed = need_authed;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.task.priority = priority;
        self
    }

    pub fn with_limit_flow(mut self, limit_flow: bool) -> Self {
        self.task.limit_flow = limit_flow;
        self
    }

    pub fn with_limit_frequency(mut self, limit_frequency: bool) -> Self {
        self.task.limit_frequency = limit_frequency;
        self
    }

    pub fn with_network_sensitive(mut self, sensitive: bool) -> Self {
        self.task.network_status_sensitive = sensitive;
        self
    }

    pub fn with_short_hosts(mut self, hosts: &[&str]) -> Self {
        self.task.short_link_hosts = hosts.iter().map(|h| h.to_string()).collect();
        self
    }

    pub fn with_long_hosts(mut self, hosts: &[&str]) -> Self {
        self.task.long_link_hosts = hosts.iter().map(|h| h.to_string()).collect();
        self
    }

    pub fn with_user_context<T: std::any::Any + Send + Sync>(mut self, value: T) -> Self {
        self.task.user_context = Some(UserContext::new(value));
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}
