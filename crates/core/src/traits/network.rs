use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use linkmux_errors::TransportResult;

use crate::models::NetworkInfo;

/// A connected byte stream.
pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> LinkStream for T {}

pub type BoxedStream = Box<dyn LinkStream>;

pub struct ConnectedStream {
    pub stream: BoxedStream,
    pub local_addr: Option<SocketAddr>,
}

#[async_trait]
pub trait SocketProvider: Send + Sync {
    async fn connect(&self, ip: &str, port: u16, timeout: Duration)
        -> TransportResult<ConnectedStream>;
}

/// Host name resolution. Dropping the future cancels the lookup.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> TransportResult<Vec<String>>;
}

pub trait NetworkInfoProvider: Send + Sync {
    fn network_info(&self) -> NetworkInfo;
}

#[async_trait]
pub trait AuthGate: Send + Sync {
    async fn ensure_authenticated(&self) -> bool;
}
