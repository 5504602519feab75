use std::net::IpAddr;

use async_trait::async_trait;
use tokio::net::lookup_host;
use tracing::debug;

use linkmux_core::traits::DnsResolver;
use linkmux_core::{TransportError, TransportResult};

/// Resolution through the operating system resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDnsResolver;

impl SystemDnsResolver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DnsResolver for SystemDnsResolver {
    async fn resolve(&self, host: &str) -> TransportResult<Vec<String>> {
        if host.parse::<IpAddr>().is_ok() {
            return Ok(vec![host.to_string()]);
        }

        let addrs = lookup_host((host, 0))
            .await
            .map_err(|e| TransportError::dns(host, e.to_string()))?;

        let mut ips: Vec<String> = Vec::new();
        for addr in addrs {
            let ip = addr.ip().to_string();
            if !ips.contains(&ip) {
                ips.push(ip);
            }
        }
        debug!(host, count = ips.len(), "DNS 解析完成");
        Ok(ips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_literal_ip_is_returned_as_is() {
        let ips = SystemDnsResolver::new().resolve("10.1.2.3").await.unwrap();
        assert_eq!(ips, vec!["10.1.2.3".to_string()]);
    }

    #[tokio::test]
    async fn test_localhost_resolves() {
        let ips = SystemDnsResolver::new().resolve("localhost").await.unwrap();
        assert!(!ips.is_empty());
    }
}
