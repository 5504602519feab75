use std::time::Duration;

use linkmux_errors::TransportResult;

use crate::models::{ChannelType, Task};

/// One complete long-link frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub cmd_id: u32,
    pub task_id: u32,
    pub body: Vec<u8>,
    pub ext: Vec<u8>,
    /// Bytes of the input buffer the frame occupied.
    pub consumed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unpacked {
    /// The buffer holds a partial frame; the header may already name its task.
    NeedMore {
        task_id: Option<u32>,
        package_len: usize,
    },
    Frame(Frame),
    Error,
}

/// Long-link wire framing.
pub trait FrameCodec: Send + Sync {
    fn pack(&self, cmd_id: u32, task_id: u32, body: &[u8], ext: &[u8]) -> Vec<u8>;

    fn unpack(&self, buf: &[u8]) -> Unpacked;
}

/// Heartbeat predicates of the long-link protocol.
pub trait LongLinkProtocol: Send + Sync {
    fn noop_cmd_id(&self) -> u32;

    fn noop_request_body(&self) -> (Vec<u8>, Vec<u8>) {
        (Vec::new(), Vec::new())
    }

    fn is_noop_response(&self, cmd_id: u32, task_id: u32, _body: &[u8], _ext: &[u8]) -> bool {
        cmd_id == self.noop_cmd_id() || task_id == crate::models::NOOP_TASK_ID
    }

    /// A fixed heartbeat interval, `None` lets the adaptive scheduler decide.
    fn fixed_heartbeat_interval(&self) -> Option<Duration> {
        None
    }

    fn is_push(&self, _cmd_id: u32, task_id: u32, _body: &[u8], _ext: &[u8]) -> bool {
        task_id == crate::models::INVALID_TASK_ID
    }

    /// Exchange one noop on every fresh connection before it counts as connected.
    fn verify_on_connect(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifyMode {
    Never,
    Now,
    Next,
}

#[derive(Debug, Clone)]
pub struct IdentifyChallenge {
    pub mode: IdentifyMode,
    pub cmd_id: u32,
    pub buffer: Vec<u8>,
    pub hash: Vec<u8>,
}

impl IdentifyChallenge {
    pub fn never() -> Self {
        Self {
            mode: IdentifyMode::Never,
            cmd_id: 0,
            buffer: Vec::new(),
            hash: Vec::new(),
        }
    }
}

/// Identity-check hooks exchanged over the long link.
pub trait IdentifyProvider: Send + Sync {
    fn challenge(&self) -> IdentifyChallenge;

    fn is_identify_response(&self, cmd_id: u32, task_id: u32) -> bool;

    fn verify(&self, body: &[u8], hash: &[u8]) -> bool;
}

/// Verdict of the application codec on a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeResult {
    NoError,
    SessionTimeout,
    RetryAll,
    TaskEnd,
    Default,
}

#[derive(Debug, Clone, Default)]
pub struct EncodedRequest {
    pub body: Vec<u8>,
    pub ext: Vec<u8>,
}

/// Bridge between tasks and their request/response bytes.
pub trait TaskCodec: Send + Sync {
    fn req_to_buf(&self, task: &Task, channel: ChannelType) -> TransportResult<EncodedRequest>;

    fn buf_to_resp(&self, task: &Task, body: &[u8], ext: &[u8], channel: ChannelType)
        -> DecodeResult;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpParse {
    NeedMore,
    Complete { status: i32, body: Vec<u8> },
    /// Malformed input, carrying the HTTP error code to report.
    Error(i32),
}

/// Short-link request packer and response parser.
pub trait ShortLinkCodec: Send + Sync {
    fn pack(&self, host: &str, cgi: &str, body: &[u8], ext: &[u8]) -> Vec<u8>;

    /// Parses everything received so far. `eof` is set once the peer closed.
    fn parse(&self, buf: &[u8], eof: bool) -> HttpParse;
}
