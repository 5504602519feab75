use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a candidate endpoint came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum IPSourceType {
    #[default]
    None,
    NewDns,
    Dns,
    Backup,
    Debug,
    Proxy,
}

impl IPSourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IPSourceType::None => "none",
            IPSourceType::NewDns => "newdns",
            IPSourceType::Dns => "dns",
            IPSourceType::Backup => "backup",
            IPSourceType::Debug => "debug",
            IPSourceType::Proxy => "proxy",
        }
    }
}

/// A candidate endpoint for one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IPPortItem {
    pub ip: String,
    pub port: u16,
    pub source_type: IPSourceType,
    pub host: String,
}

impl IPPortItem {
    pub fn new(
        ip: impl Into<String>,
        port: u16,
        source_type: IPSourceType,
        host: impl Into<String>,
    ) -> Self {
        Self {
            ip: ip.into(),
            port,
            source_type,
            host: host.into(),
        }
    }
}

impl fmt::Display for IPPortItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}({}|{})",
            self.ip,
            self.port,
            self.host,
            self.source_type.as_str()
        )
    }
}

/// Renders a candidate list for log lines.
pub fn dump_items(items: &[IPPortItem]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
