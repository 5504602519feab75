use async_trait::async_trait;

use linkmux_core::{ConnectProfile, DisconnectReason, LongLinkStatus};
use linkmux_longlink::LongLinkConnection;

/// The long link as the task scheduler drives it.
#[async_trait]
pub trait LinkTransport: Send + Sync {
    fn status(&self) -> LongLinkStatus;

    /// Generation of the current connection attempt, 0 before the first one.
    fn generation(&self) -> u64;

    fn profile(&self) -> ConnectProfile;

    fn send(&self, task_id: u32, cmd_id: u32, body: &[u8], ext: &[u8], send_only: bool) -> bool;

    fn stop(&self, task_id: u32) -> bool;

    async fn disconnect(&self, reason: DisconnectReason);
}

#[async_trait]
impl LinkTransport for LongLinkConnection {
    fn status(&self) -> LongLinkStatus {
        LongLinkConnection::status(self)
    }

    fn generation(&self) -> u64 {
        LongLinkConnection::generation(self)
    }

    fn profile(&self) -> ConnectProfile {
        LongLinkConnection::profile(self)
    }

    fn send(&self, task_id: u32, cmd_id: u32, body: &[u8], ext: &[u8], send_only: bool) -> bool {
        LongLinkConnection::send(self, task_id, cmd_id, body, ext, send_only)
    }

    fn stop(&self, task_id: u32) -> bool {
        LongLinkConnection::stop(self, task_id)
    }

    async fn disconnect(&self, reason: DisconnectReason) {
        LongLinkConnection::disconnect(self, reason).await;
    }
}
