use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum LongLinkStatus {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnected,
    ConnectFailed,
}

impl LongLinkStatus {
    pub fn is_connecting_or_connected(&self) -> bool {
        matches!(self, LongLinkStatus::Connecting | LongLinkStatus::Connected)
    }
}

impl fmt::Display for LongLinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LongLinkStatus::Idle => "idle",
            LongLinkStatus::Connecting => "connecting",
            LongLinkStatus::Connected => "connected",
            LongLinkStatus::Disconnected => "disconnected",
            LongLinkStatus::ConnectFailed => "connect_failed",
        };
        f.write_str(s)
    }
}

/// Connectivity as reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ConnectivityStatus {
    Unavailable,
    Connecting,
    Connected,
    ServerFailed,
    #[default]
    Unknown,
}

/// Why the long link was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectReason {
    Reset,
    NetworkChange,
    TaskTimeout,
    DecodeError,
    Noop,
    NoopTimeout,
    Released,
}

impl DisconnectReason {
    pub fn code(&self) -> i32 {
        match self {
            DisconnectReason::Reset => 10000,
            DisconnectReason::NetworkChange => 10001,
            DisconnectReason::TaskTimeout => 10002,
            DisconnectReason::DecodeError => 10003,
            DisconnectReason::Noop => 10004,
            DisconnectReason::NoopTimeout => 10005,
            DisconnectReason::Released => 10006,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum NetType {
    NoNet,
    #[default]
    Wifi,
    Mobile,
    Other,
}

impl NetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetType::NoNet => "nonet",
            NetType::Wifi => "wifi",
            NetType::Mobile => "mobile",
            NetType::Other => "other",
        }
    }
}

/// Snapshot of the current network, `label` identifies it for persistence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct NetworkInfo {
    pub net_type: NetType,
    pub label: String,
}

impl NetworkInfo {
    pub fn new(net_type: NetType, label: impl Into<String>) -> Self {
        Self {
            net_type,
            label: label.into(),
        }
    }

    pub fn no_net() -> Self {
        Self::new(NetType::NoNet, "")
    }

    pub fn is_mobile(&self) -> bool {
        self.net_type == NetType::Mobile
    }

    pub fn has_net(&self) -> bool {
        self.net_type != NetType::NoNet
    }

    /// Key used to store per-network state.
    pub fn net_key(&self) -> Option<String> {
        if !self.has_net() || self.label.is_empty() {
            return None;
        }
        Some(format!("{}_{}", self.net_type.as_str(), self.label))
    }
}
