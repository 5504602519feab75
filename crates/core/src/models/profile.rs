use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use linkmux_errors::{codes, ErrorKind};

use super::address::{IPPortItem, IPSourceType};
use super::status::NetType;
use super::task::{ChannelType, Task};
use crate::resilience::TimeoutStatus;
use crate::timeouts::compute_task_timeout;

/// One heartbeat round on a connection.
#[derive(Debug, Clone)]
pub struct NoopRecord {
    pub sent_at: Instant,
    pub interval: Duration,
    pub succeeded: Option<bool>,
}

/// Snapshot of one physical connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectProfile {
    pub attempt_id: Uuid,
    pub generation: u64,
    pub net_type: NetType,
    pub host: String,
    pub ip: String,
    pub port: u16,
    /// Index of the winning candidate in `ip_list`, -1 when none connected.
    pub ip_index: i32,
    pub ip_type: IPSourceType,
    pub ip_list: Vec<IPPortItem>,
    pub start_time: Option<Instant>,
    pub dns_time: Option<Instant>,
    pub dns_end_time: Option<Instant>,
    pub conn_time: Option<Instant>,
    pub conn_rtt: Duration,
    pub conn_cost: Duration,
    pub local_ip: String,
    pub local_port: u16,
    pub conn_reason: i32,
    pub disconn_time: Option<Instant>,
    pub disconn_error_kind: ErrorKind,
    pub disconn_error_code: i32,
    pub noop_history: Vec<NoopRecord>,
}

impl Default for ConnectProfile {
    fn default() -> Self {
        Self {
            attempt_id: Uuid::nil(),
            generation: 0,
            net_type: NetType::default(),
            host: String::new(),
            ip: String::new(),
            port: 0,
            ip_index: -1,
            ip_type: IPSourceType::None,
            ip_list: Vec::new(),
            start_time: None,
            dns_time: None,
            dns_end_time: None,
            conn_time: None,
            conn_rtt: Duration::ZERO,
            conn_cost: Duration::ZERO,
            local_ip: String::new(),
            local_port: 0,
            conn_reason: 0,
            disconn_time: None,
            disconn_error_kind: ErrorKind::Ok,
            disconn_error_code: 0,
            noop_history: Vec::new(),
        }
    }
}

impl ConnectProfile {
    pub fn new_attempt(generation: u64) -> Self {
        Self {
            attempt_id: Uuid::new_v4(),
            generation,
            ..Self::default()
        }
    }

    pub fn select(&mut self, index: usize) {
        if let Some(item) = self.ip_list.get(index) {
            self.host = item.host.clone();
            self.ip = item.ip.clone();
            self.port = item.port;
            self.ip_type = item.source_type;
            self.ip_index = index as i32;
        }
    }
}

/// Per-attempt telemetry of a task.
#[derive(Debug, Clone, Default)]
pub struct TransferProfile {
    pub connect_profile: ConnectProfile,
    pub loop_start_task_time: Option<Instant>,
    pub first_pkg_timeout: Duration,
    pub read_write_timeout: Duration,
    pub first_start_send_time: Option<Instant>,
    pub start_send_time: Option<Instant>,
    pub last_receive_pkg_time: Option<Instant>,
    pub sent_size: usize,
    pub send_data_size: usize,
    pub received_size: usize,
    pub receive_data_size: usize,
    pub error_kind: ErrorKind,
    pub error_code: i32,
}

impl TransferProfile {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Coarse stage at which a task attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailStep {
    Succ,
    Dns,
    Connect,
    FirstPkg,
    PkgPkg,
    Decode,
    Other,
    Timeout,
    Server,
}

/// Scheduler-owned run state wrapped around a [`Task`].
#[derive(Debug, Clone)]
pub struct TaskProfile {
    pub task: Task,
    pub transfer_profile: TransferProfile,
    history: Vec<TransferProfile>,
    /// Identifies the connection generation or worker the task is running on, 0 when idle.
    pub running_id: u64,
    pub task_timeout: Duration,
    pub start_task_time: Instant,
    pub end_task_time: Option<Instant>,
    pub retry_start_time: Option<Instant>,
    pub remain_retry_count: i32,
    pub force_no_retry: bool,
    pub last_failed_timeout_status: Option<TimeoutStatus>,
    pub current_timeout_status: Option<TimeoutStatus>,
    pub anti_avalanche_checked: bool,
    pub use_proxy: bool,
    pub retry_interval: Duration,
    pub err_kind: ErrorKind,
    pub err_code: i32,
    pub link_type: Option<ChannelType>,
}

impl TaskProfile {
    pub fn new(task: Task, now: Instant) -> Self {
        let task_timeout = compute_task_timeout(&task);
        let remain_retry_count = task.retry_count.max(0);
        Self {
            task,
            transfer_profile: TransferProfile::default(),
            history: Vec::new(),
            running_id: 0,
            task_timeout,
            start_task_time: now,
            end_task_time: None,
            retry_start_time: None,
            remain_retry_count,
            force_no_retry: false,
            last_failed_timeout_status: None,
            current_timeout_status: None,
            anti_avalanche_checked: false,
            use_proxy: false,
            retry_interval: Duration::ZERO,
            err_kind: ErrorKind::Ok,
            err_code: 0,
            link_type: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running_id != 0
    }

    pub fn init_send_param(&mut self) {
        self.transfer_profile.reset();
        self.running_id = 0;
    }

    pub fn push_history(&mut self) {
        self.history.push(self.transfer_profile.clone());
    }

    pub fn history(&self) -> &[TransferProfile] {
        &self.history
    }

    /// Number of attempts recorded so far, including the one in flight.
    pub fn attempt_count(&self) -> usize {
        self.history.len() + usize::from(self.is_running())
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.start_task_time)
    }

    pub fn is_timed_out(&self, now: Instant) -> bool {
        self.elapsed(now) >= self.task_timeout
    }

    pub fn fail_step(&self) -> FailStep {
        let tp = &self.transfer_profile;
        if self.err_kind == ErrorKind::Ok && self.err_code == 0 {
            return FailStep::Succ;
        }
        if self.err_kind == ErrorKind::Dns {
            return FailStep::Dns;
        }
        if tp.connect_profile.ip_index == -1 {
            return FailStep::Connect;
        }
        if tp.last_receive_pkg_time.is_none() {
            return FailStep::FirstPkg;
        }
        if self.err_kind == ErrorKind::EnDecode {
            return FailStep::Decode;
        }
        if matches!(
            self.err_kind,
            ErrorKind::Socket | ErrorKind::Http | ErrorKind::NetMsgXp
        ) {
            return FailStep::PkgPkg;
        }
        if self.err_code == codes::LOCAL_TASK_TIMEOUT {
            return FailStep::Timeout;
        }
        if self.err_kind == ErrorKind::Server || self.err_kind == ErrorKind::Ok {
            return FailStep::Server;
        }
        FailStep::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> TaskProfile {
        let mut task = Task::with_id(7);
        task.retry_count = 2;
        TaskProfile::new(task, Instant::now())
    }

    #[test]
    fn test_new_profile_state() {
        let p = profile();
        assert_eq!(p.remain_retry_count, 2);
        assert!(!p.is_running());
        assert!(p.history().is_empty());
        assert_eq!(p.fail_step(), FailStep::Succ);
    }

    #[test]
    fn test_history_is_append_only() {
        let mut p = profile();
        p.running_id = 3;
        p.transfer_profile.sent_size = 10;
        p.push_history();
        p.init_send_param();
        assert_eq!(p.history().len(), 1);
        assert_eq!(p.history()[0].sent_size, 10);
        assert_eq!(p.transfer_profile.sent_size, 0);
        assert_eq!(p.running_id, 0);
    }

    #[test]
    fn test_fail_step_classification() {
        let mut p = profile();
        p.err_kind = ErrorKind::Dns;
        p.err_code = -1;
        assert_eq!(p.fail_step(), FailStep::Dns);

        p.err_kind = ErrorKind::Socket;
        assert_eq!(p.fail_step(), FailStep::Connect);

        p.transfer_profile.connect_profile.ip_index = 0;
        assert_eq!(p.fail_step(), FailStep::FirstPkg);

        p.transfer_profile.last_receive_pkg_time = Some(Instant::now());
        assert_eq!(p.fail_step(), FailStep::PkgPkg);

        p.err_kind = ErrorKind::EnDecode;
        assert_eq!(p.fail_step(), FailStep::Decode);

        p.err_kind = ErrorKind::Local;
        p.err_code = codes::LOCAL_TASK_TIMEOUT;
        assert_eq!(p.fail_step(), FailStep::Timeout);

        p.err_kind = ErrorKind::Server;
        p.err_code = 5;
        assert_eq!(p.fail_step(), FailStep::Server);
    }
}
