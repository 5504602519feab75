use tokio::sync::mpsc;

use linkmux_core::{ErrorKind, LongLinkStatus};

/// Notifications from the long-link worker to its scheduler. Every event
/// carries the connection generation it was produced on, so events of a
/// torn-down connection can be told apart from the current one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    StatusChanged {
        generation: u64,
        status: LongLinkStatus,
    },
    /// First bytes of the task went out.
    Send { generation: u64, task_id: u32 },
    /// Partial frame of the task received.
    Recv {
        generation: u64,
        task_id: u32,
        cached: usize,
        total: usize,
    },
    /// A complete frame, or with `task_id == 0` and a non-ok kind, the error
    /// that ended the connection.
    Response {
        generation: u64,
        kind: ErrorKind,
        code: i32,
        cmd_id: u32,
        task_id: u32,
        body: Vec<u8>,
        ext: Vec<u8>,
    },
    NetworkReport {
        kind: ErrorKind,
        code: i32,
        ip: String,
        host: String,
        port: u16,
    },
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;
pub type LinkEventReceiver = mpsc::UnboundedReceiver<LinkEvent>;

pub fn link_event_channel() -> (LinkEventSender, LinkEventReceiver) {
    mpsc::unbounded_channel()
}
