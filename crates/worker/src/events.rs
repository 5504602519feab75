use tokio::sync::mpsc;

use linkmux_core::{ConnectProfile, ErrorKind};

/// Progress of one short-link worker. `worker_id` is the running id the
/// scheduler handed out when it started the attempt.
#[derive(Debug, Clone)]
pub enum ShortLinkEvent {
    /// The request went out on a fresh connection.
    Send { worker_id: u64, task_id: u32 },
    Recv {
        worker_id: u64,
        task_id: u32,
        cached: usize,
        total: usize,
    },
    /// Final result of the attempt. Emitted at most once per worker and
    /// never after a cancel.
    Response {
        worker_id: u64,
        task_id: u32,
        kind: ErrorKind,
        code: i32,
        status: i32,
        body: Vec<u8>,
        profile: ConnectProfile,
    },
    NetworkReport {
        kind: ErrorKind,
        code: i32,
        ip: String,
        host: String,
        port: u16,
    },
}

impl ShortLinkEvent {
    pub fn worker_id(&self) -> Option<u64> {
        match self {
            ShortLinkEvent::Send { worker_id, .. }
            | ShortLinkEvent::Recv { worker_id, .. }
            | ShortLinkEvent::Response { worker_id, .. } => Some(*worker_id),
            ShortLinkEvent::NetworkReport { .. } => None,
        }
    }
}

pub type ShortLinkEventSender = mpsc::UnboundedSender<ShortLinkEvent>;
pub type ShortLinkEventReceiver = mpsc::UnboundedReceiver<ShortLinkEvent>;

pub fn short_link_event_channel() -> (ShortLinkEventSender, ShortLinkEventReceiver) {
    mpsc::unbounded_channel()
}
