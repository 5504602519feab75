use std::sync::Arc;

use tracing::{debug, info, warn};

use linkmux_core::traits::{IdentifyMode, IdentifyProvider};
use linkmux_core::IDENTIFY_TASK_ID;

/// Identify request ready to be packed onto the link.
#[derive(Debug, Clone)]
pub struct IdentifyRequest {
    pub cmd_id: u32,
    pub task_id: u32,
    pub body: Vec<u8>,
}

/// Per-connection identity check: at most one challenge is in flight, and a
/// verified connection is never challenged again.
pub struct IdentityHandshake {
    provider: Arc<dyn IdentifyProvider>,
    checked: bool,
    pending_task_id: Option<u32>,
    cmd_id: u32,
    hash: Vec<u8>,
}

impl IdentityHandshake {
    pub fn new(provider: Arc<dyn IdentifyProvider>) -> Self {
        Self {
            provider,
            checked: false,
            pending_task_id: None,
            cmd_id: 0,
            hash: Vec::new(),
        }
    }

    pub fn is_checked(&self) -> bool {
        self.checked
    }

    pub fn is_pending(&self) -> bool {
        self.pending_task_id.is_some()
    }

    /// Returns a request to send now, or `None` when no challenge is due.
    pub fn challenge_buffer(&mut self) -> Option<IdentifyRequest> {
        if self.checked || self.is_pending() {
            return None;
        }

        let challenge = self.provider.challenge();
        match challenge.mode {
            IdentifyMode::Never => {
                self.checked = true;
                None
            }
            IdentifyMode::Next => {
                self.checked = false;
                None
            }
            IdentifyMode::Now => {
                self.cmd_id = challenge.cmd_id;
                self.hash = challenge.hash;
                debug!(cmd_id = challenge.cmd_id, "发送身份校验请求");
                Some(IdentifyRequest {
                    cmd_id: challenge.cmd_id,
                    task_id: IDENTIFY_TASK_ID,
                    body: challenge.buffer,
                })
            }
        }
    }

    pub fn set_task_id(&mut self, task_id: u32) {
        self.pending_task_id = Some(task_id);
    }

    pub fn is_identify_response(&self, cmd_id: u32, task_id: u32) -> bool {
        self.is_pending() && self.provider.is_identify_response(cmd_id, task_id)
    }

    /// Consumes the identify response. Returns true once the connection is verified.
    pub fn on_identify_response(&mut self, body: &[u8]) -> bool {
        self.pending_task_id = None;
        if self.provider.verify(body, &self.hash) {
            info!(cmd_id = self.cmd_id, "长链身份校验成功");
            self.checked = true;
            true
        } else {
            warn!(cmd_id = self.cmd_id, "长链身份校验失败");
            false
        }
    }

    pub fn reset(&mut self) {
        self.checked = false;
        self.pending_task_id = None;
        self.cmd_id = 0;
        self.hash.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkmux_testing_utils::FakeIdentifyProvider;

    #[test]
    fn test_never_mode_marks_checked() {
        let provider = Arc::new(FakeIdentifyProvider::new(IdentifyMode::Never));
        let mut handshake = IdentityHandshake::new(provider);
        assert!(handshake.challenge_buffer().is_none());
        assert!(handshake.is_checked());
    }

    #[test]
    fn test_next_mode_defers() {
        let provider = Arc::new(FakeIdentifyProvider::new(IdentifyMode::Next));
        let mut handshake = IdentityHandshake::new(provider);
        assert!(handshake.challenge_buffer().is_none());
        assert!(!handshake.is_checked());
    }

    #[test]
    fn test_now_mode_round_trip() {
        let provider = Arc::new(FakeIdentifyProvider::new(IdentifyMode::Now));
        let mut handshake = IdentityHandshake::new(provider.clone());

        let request = handshake.challenge_buffer().unwrap();
        assert_eq!(request.task_id, IDENTIFY_TASK_ID);
        handshake.set_task_id(request.task_id);
        assert!(handshake.challenge_buffer().is_none());
        assert!(handshake.is_identify_response(request.cmd_id, IDENTIFY_TASK_ID));

        assert!(handshake.on_identify_response(b"ok"));
        assert!(handshake.is_checked());
        assert!(handshake.challenge_buffer().is_none());

        handshake.reset();
        assert!(!handshake.is_checked());
        assert!(handshake.challenge_buffer().is_some());
    }

    #[test]
    fn test_failed_verify_allows_retry() {
        let provider = Arc::new(FakeIdentifyProvider::new(IdentifyMode::Now));
        let mut handshake = IdentityHandshake::new(provider);
        let request = handshake.challenge_buffer().unwrap();
        handshake.set_task_id(request.task_id);
        assert!(!handshake.on_identify_response(b"bad"));
        assert!(!handshake.is_checked());
        assert!(handshake.challenge_buffer().is_some());
    }
}
