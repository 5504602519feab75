use linkmux_core::traits::DecodeResult;
use linkmux_core::{ChannelType, ErrorKind, TaskProfile};

/// How a failed attempt is to be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailHandle {
    NoError,
    /// Retry while retries remain.
    Default,
    /// End the task now.
    TaskEnd,
    TaskTimeout,
    /// Requeue without waiting for the retry interval.
    SessionTimeout,
    RetryAll,
}

impl FailHandle {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FailHandle::TaskEnd | FailHandle::TaskTimeout)
    }

    pub fn is_retry_all(&self) -> bool {
        matches!(self, FailHandle::SessionTimeout | FailHandle::RetryAll)
    }
}

impl From<DecodeResult> for FailHandle {
    fn from(result: DecodeResult) -> Self {
        match result {
            DecodeResult::NoError => FailHandle::NoError,
            DecodeResult::SessionTimeout => FailHandle::SessionTimeout,
            DecodeResult::RetryAll => FailHandle::RetryAll,
            DecodeResult::TaskEnd => FailHandle::TaskEnd,
            DecodeResult::Default => FailHandle::Default,
        }
    }
}

/// A task the scheduler is done with.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub channel: ChannelType,
    pub kind: ErrorKind,
    pub code: i32,
    pub handle: FailHandle,
    pub profile: TaskProfile,
}

impl TaskOutcome {
    pub fn task_id(&self) -> u32 {
        self.profile.task.task_id
    }
}

/// Where schedulers deliver results. Implementations must not block on the
/// scheduler that is calling them.
pub trait TaskResultSink: Send + Sync {
    fn on_task_end(&self, outcome: TaskOutcome);

    fn on_push(&self, cmd_id: u32, task_id: u32, body: &[u8], ext: &[u8]);

    fn on_network_report(
        &self,
        channel: ChannelType,
        kind: ErrorKind,
        code: i32,
        ip: &str,
        host: &str,
        port: u16,
    );

    /// The codec asked for every running task on both channels to be redone.
    fn on_retry_all(&self, kind: ErrorKind, code: i32, handle: FailHandle, src_task_id: u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_verdict_mapping() {
        assert_eq!(FailHandle::from(DecodeResult::NoError), FailHandle::NoError);
        assert!(FailHandle::from(DecodeResult::TaskEnd).is_terminal());
        assert!(FailHandle::from(DecodeResult::RetryAll).is_retry_all());
        assert!(FailHandle::from(DecodeResult::SessionTimeout).is_retry_all());
        assert!(!FailHandle::from(DecodeResult::Default).is_terminal());
    }
}
