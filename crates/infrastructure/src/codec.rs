//! 长链帧格式：定长头部加扩展与包体。
//!
//! 头部全部为大端：
//!
//! | 字段 | 长度 |
//! |---|---|
//! | 帧总长 | 4 |
//! | cmd_id | 4 |
//! | task_id | 4 |
//! | 扩展长度 | 4 |
//!
//! 头部之后依次是扩展与包体。

use std::time::Duration;

use linkmux_core::traits::{
    Frame, FrameCodec, IdentifyChallenge, IdentifyProvider, LongLinkProtocol, Unpacked,
};

pub const FRAME_HEADER_LEN: usize = 16;
pub const DEFAULT_MAX_FRAME_LEN: usize = 4 * 1024 * 1024;
pub const DEFAULT_NOOP_CMD_ID: u32 = 6;

#[derive(Debug, Clone)]
pub struct LengthPrefixedCodec {
    max_frame_len: usize,
}

impl Default for LengthPrefixedCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LengthPrefixedCodec {
    pub fn new() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len.max(FRAME_HEADER_LEN);
        self
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

impl FrameCodec for LengthPrefixedCodec {
    fn pack(&self, cmd_id: u32, task_id: u32, body: &[u8], ext: &[u8]) -> Vec<u8> {
        let total = FRAME_HEADER_LEN + ext.len() + body.len();
        let mut frame = Vec::with_capacity(total);
        frame.extend_from_slice(&(total as u32).to_be_bytes());
        frame.extend_from_slice(&cmd_id.to_be_bytes());
        frame.extend_from_slice(&task_id.to_be_bytes());
        frame.extend_from_slice(&(ext.len() as u32).to_be_bytes());
        frame.extend_from_slice(ext);
        frame.extend_from_slice(body);
        frame
    }

    fn unpack(&self, buf: &[u8]) -> Unpacked {
        if buf.len() < FRAME_HEADER_LEN {
            return Unpacked::NeedMore {
                task_id: None,
                package_len: 0,
            };
        }
        let total = read_u32(buf, 0) as usize;
        let cmd_id = read_u32(buf, 4);
        let task_id = read_u32(buf, 8);
        let ext_len = read_u32(buf, 12) as usize;
        if total < FRAME_HEADER_LEN || total > self.max_frame_len || ext_len > total - FRAME_HEADER_LEN {
            return Unpacked::Error;
        }
        if buf.len() < total {
            return Unpacked::NeedMore {
                task_id: Some(task_id),
                package_len: total,
            };
        }
        let body_start = FRAME_HEADER_LEN + ext_len;
        Unpacked::Frame(Frame {
            cmd_id,
            task_id,
            ext: buf[FRAME_HEADER_LEN..body_start].to_vec(),
            body: buf[body_start..total].to_vec(),
            consumed: total,
        })
    }
}

/// Heartbeat conventions for servers speaking [`LengthPrefixedCodec`].
#[derive(Debug, Clone)]
pub struct DefaultLongLinkProtocol {
    noop_cmd_id: u32,
    fixed_interval: Option<Duration>,
    verify_on_connect: bool,
}

impl Default for DefaultLongLinkProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultLongLinkProtocol {
    pub fn new() -> Self {
        Self {
            noop_cmd_id: DEFAULT_NOOP_CMD_ID,
            fixed_interval: None,
            verify_on_connect: false,
        }
    }

    pub fn with_noop_cmd_id(mut self, cmd_id: u32) -> Self {
        self.noop_cmd_id = cmd_id;
        self
    }

    pub fn with_fixed_interval(mut self, interval: Duration) -> Self {
        self.fixed_interval = Some(interval);
        self
    }

    pub fn with_verify_on_connect(mut self, verify: bool) -> Self {
        self.verify_on_connect = verify;
        self
    }
}

impl LongLinkProtocol for DefaultLongLinkProtocol {
    fn noop_cmd_id(&self) -> u32 {
        self.noop_cmd_id
    }

    fn fixed_heartbeat_interval(&self) -> Option<Duration> {
        self.fixed_interval
    }

    fn verify_on_connect(&self) -> bool {
        self.verify_on_connect
    }
}

/// Servers that never ask for an identity check. Every connection is
/// usable as soon as it is established.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIdentityCheck;

impl IdentifyProvider for NoIdentityCheck {
    fn challenge(&self) -> IdentifyChallenge {
        IdentifyChallenge::never()
    }

    fn is_identify_response(&self, _cmd_id: u32, _task_id: u32) -> bool {
        false
    }

    fn verify(&self, _body: &[u8], _hash: &[u8]) -> bool {
        true
    }
}
