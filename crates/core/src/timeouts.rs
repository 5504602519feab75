//! Timeout arithmetic shared by both schedulers.

use std::time::Duration;

use crate::models::{NetType, Task};
use crate::resilience::TimeoutStatus;

pub const MAX_SERVER_PROCESS_COST: Duration = Duration::from_secs(2 * 60);
pub const MAX_RETRY_COUNT: i32 = 30;
pub const MAX_TOTAL_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_RETRY_COUNT: i32 = 1;

const BASE_READ_WRITE_TIMEOUT: Duration = Duration::from_secs(15);
const TRY_SLACK: Duration = Duration::from_secs(5);

const FIRST_PKG_BASE_WIFI: Duration = Duration::from_secs(12);
const FIRST_PKG_BASE_MOBILE: Duration = Duration::from_secs(15);
const FIRST_PKG_MAX_WIFI: Duration = Duration::from_secs(25);
const FIRST_PKG_MAX_MOBILE: Duration = Duration::from_secs(35);
const FIRST_PKG_EXCELLENT_WIFI: Duration = Duration::from_secs(7);
const FIRST_PKG_EXCELLENT_MOBILE: Duration = Duration::from_secs(10);
const SENT_TASK_ALLOWANCE: Duration = Duration::from_secs(1);
const PKG_PKG_WIFI: Duration = Duration::from_secs(12);
const PKG_PKG_MOBILE: Duration = Duration::from_secs(30);

/// Bytes per second assumed for the slowest acceptable link.
pub const MIN_TRANSFER_RATE: u64 = 10 * 1024;
const MAX_RECV_LEN: u64 = 64 * 1024;

fn server_cost(task: &Task) -> Option<Duration> {
    (task.server_process_cost > 0).then(|| Duration::from_millis(task.server_process_cost as u64))
}

/// True when the task violates the hard parameter limits.
pub fn exceeds_limits(task: &Task) -> bool {
    server_cost(task).is_some_and(|c| c > MAX_SERVER_PROCESS_COST)
        || task.retry_count > MAX_RETRY_COUNT
        || (task.total_timeout > 0
            && Duration::from_millis(task.total_timeout as u64) > MAX_TOTAL_TIMEOUT)
}

/// Overall budget for a task across all of its attempts.
pub fn compute_task_timeout(task: &Task) -> Duration {
    let rw = BASE_READ_WRITE_TIMEOUT + server_cost(task).unwrap_or_default();
    let tries = task.retry_count.max(0) as u32 + 1;
    let timeout = (rw + TRY_SLACK) * tries;
    if task.total_timeout > 0 {
        timeout.min(Duration::from_millis(task.total_timeout as u64))
    } else {
        timeout
    }
}

fn transfer_time(len: usize) -> Duration {
    Duration::from_millis(len as u64 * 1000 / MIN_TRANSFER_RATE)
}

/// Time allowed between send start and the first response byte.
pub fn first_pkg_timeout(
    server_process_cost: i32,
    send_len: usize,
    sent_count: usize,
    net: NetType,
    status: TimeoutStatus,
) -> Duration {
    let mobile = net == NetType::Mobile;
    if status == TimeoutStatus::Excellent {
        return if mobile {
            FIRST_PKG_EXCELLENT_MOBILE
        } else {
            FIRST_PKG_EXCELLENT_WIFI
        };
    }
    let (base, cap) = if mobile {
        (FIRST_PKG_BASE_MOBILE, FIRST_PKG_MAX_MOBILE)
    } else {
        (FIRST_PKG_BASE_WIFI, FIRST_PKG_MAX_WIFI)
    };
    let timeout = if server_process_cost > 0 {
        Duration::from_millis(server_process_cost as u64) + base
    } else {
        (base + transfer_time(send_len)).min(cap)
    };
    timeout + SENT_TASK_ALLOWANCE * sent_count as u32
}

pub fn read_write_timeout(first_pkg_timeout: Duration) -> Duration {
    first_pkg_timeout + transfer_time(MAX_RECV_LEN as usize)
}

pub fn pkg_pkg_timeout(net: NetType) -> Duration {
    if net == NetType::Mobile {
        PKG_PKG_MOBILE
    } else {
        PKG_PKG_WIFI
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_timeout_scales_with_retries() {
        let mut task = Task::with_id(1);
        task.retry_count = 0;
        assert_eq!(compute_task_timeout(&task), Duration::from_secs(20));

        task.retry_count = 2;
        assert_eq!(compute_task_timeout(&task), Duration::from_secs(60));

        task.server_process_cost = 5_000;
        assert_eq!(compute_task_timeout(&task), Duration::from_secs(75));
    }

    #[test]
    fn test_task_timeout_capped_by_total() {
        let mut task = Task::with_id(1);
        task.retry_count = 5;
        task.total_timeout = 8_000;
        assert_eq!(compute_task_timeout(&task), Duration::from_secs(8));
    }

    #[test]
    fn test_parameter_limits() {
        let mut task = Task::with_id(1);
        assert!(!exceeds_limits(&task));
        task.retry_count = 31;
        assert!(exceeds_limits(&task));
        task.retry_count = 1;
        task.total_timeout = 11 * 60 * 1000;
        assert!(exceeds_limits(&task));
        task.total_timeout = -1;
        task.server_process_cost = 3 * 60 * 1000;
        assert!(exceeds_limits(&task));
    }

    #[test]
    fn test_first_pkg_timeout() {
        let wifi = first_pkg_timeout(-1, 0, 0, NetType::Wifi, TimeoutStatus::Evaluating);
        assert_eq!(wifi, Duration::from_secs(12));

        let big = first_pkg_timeout(-1, 10 * 1024 * 1024, 0, NetType::Wifi, TimeoutStatus::Evaluating);
        assert_eq!(big, Duration::from_secs(25));

        let queued = first_pkg_timeout(-1, 0, 3, NetType::Mobile, TimeoutStatus::Bad);
        assert_eq!(queued, Duration::from_secs(18));

        let with_cost = first_pkg_timeout(2_000, 0, 0, NetType::Wifi, TimeoutStatus::Evaluating);
        assert_eq!(with_cost, Duration::from_secs(14));

        let excellent = first_pkg_timeout(-1, 0, 0, NetType::Mobile, TimeoutStatus::Excellent);
        assert_eq!(excellent, Duration::from_secs(10));
    }

    #[test]
    fn test_read_write_timeout_adds_receive_window() {
        let rw = read_write_timeout(Duration::from_secs(12));
        assert_eq!(rw, Duration::from_millis(12_000 + 6_400));
    }
}
