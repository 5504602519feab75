use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use linkmux_core::traits::{ConnectedStream, SocketProvider};
use linkmux_core::{TransportError, TransportResult};

/// Plain TCP connections through tokio.
#[derive(Debug, Clone)]
pub struct TokioSocketProvider {
    nodelay: bool,
}

impl Default for TokioSocketProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TokioSocketProvider {
    pub fn new() -> Self {
        Self { nodelay: true }
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

#[async_trait]
impl SocketProvider for TokioSocketProvider {
    async fn connect(
        &self,
        ip: &str,
        port: u16,
        timeout: Duration,
    ) -> TransportResult<ConnectedStream> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((ip, port)))
            .await
            .map_err(|_| TransportError::timeout(format!("连接 {ip}:{port} 超时")))?
            .map_err(|e| TransportError::socket(format!("连接 {ip}:{port} 失败: {e}")))?;

        if self.nodelay {
            stream
                .set_nodelay(true)
                .map_err(|e| TransportError::socket(format!("设置 TCP_NODELAY 失败: {e}")))?;
        }
        let local_addr = stream.local_addr().ok();
        debug!(ip, port, local = ?local_addr, "TCP 连接建立");

        Ok(ConnectedStream {
            stream: Box::new(stream),
            local_addr,
        })
    }
}
