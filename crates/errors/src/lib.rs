use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error classification carried by every task completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ErrorKind {
    #[default]
    Ok,
    Local,
    Dns,
    Socket,
    Http,
    EnDecode,
    NetMsgXp,
    Cancelled,
    Server,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Ok => "ok",
            ErrorKind::Local => "local",
            ErrorKind::Dns => "dns",
            ErrorKind::Socket => "socket",
            ErrorKind::Http => "http",
            ErrorKind::EnDecode => "endecode",
            ErrorKind::NetMsgXp => "netmsgxp",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Server => "server",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ErrorKind::Ok)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric error codes paired with an [`ErrorKind`].
pub mod codes {
    pub const OK: i32 = 0;

    // Local
    pub const LOCAL_TASK_TIMEOUT: i32 = -1;
    pub const LOCAL_TASK_REMOVE: i32 = -2;
    pub const LOCAL_START_TASK_FAIL: i32 = -3;
    pub const LOCAL_ANTI_AVALANCHE: i32 = -4;
    pub const LOCAL_CHANNEL_SELECT: i32 = -5;
    pub const LOCAL_NO_NET: i32 = -6;
    pub const LOCAL_CANCEL: i32 = -7;
    pub const LOCAL_CLEAR: i32 = -8;
    pub const LOCAL_RESET: i32 = -9;
    pub const LOCAL_TASK_PARAM: i32 = -12;
    pub const LOCAL_FREQUENCY_LIMIT: i32 = -13;

    // Long link
    pub const LONG_FIRST_PKG_TIMEOUT: i32 = -500;
    pub const LONG_PKG_PKG_TIMEOUT: i32 = -501;
    pub const LONG_READ_WRITE_TIMEOUT: i32 = -502;

    // Http
    pub const HTTP_FIRST_PKG_TIMEOUT: i32 = -500;
    pub const HTTP_PKG_PKG_TIMEOUT: i32 = -501;
    pub const HTTP_READ_WRITE_TIMEOUT: i32 = -502;
    pub const HTTP_SPLIT_HEAD_BODY: i32 = -10194;
    pub const HTTP_PARSE_STATUS_LINE: i32 = -10195;

    // Socket
    pub const SOCKET_NETWORK_CHANGE: i32 = -10086;
    pub const SOCKET_MAKE_SOCKET_PREPARED: i32 = -10087;
    pub const SOCKET_WRITE_NONBLOCK: i32 = -10088;
    pub const SOCKET_READ_ONCE: i32 = -10089;
    pub const SOCKET_SHUTDOWN: i32 = -10090;
    pub const SOCKET_RECV_ERR: i32 = -10091;
    pub const SOCKET_USER_BREAK: i32 = -10093;

    // Dns
    pub const DNS_MAKE_SOCKET_PREPARED: i32 = -10606;

    // NetMsgXP
    pub const NETMSGXP_HANDLE_BUFFER_ERR: i32 = -10504;
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("本地错误: {0}")]
    Local(String),
    #[error("DNS解析失败: {host} - {message}")]
    Dns { host: String, message: String },
    #[error("Socket错误: {0}")]
    Socket(String),
    #[error("HTTP错误: 状态码 {status}")]
    Http { status: i32 },
    #[error("编解码错误: {0}")]
    Codec(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("操作已取消")]
    Cancelled,
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("存储错误: {0}")]
    Storage(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

impl TransportError {
    pub fn local<S: Into<String>>(msg: S) -> Self {
        Self::Local(msg.into())
    }
    pub fn dns<H: Into<String>, S: Into<String>>(host: H, msg: S) -> Self {
        Self::Dns {
            host: host.into(),
            message: msg.into(),
        }
    }
    pub fn socket<S: Into<String>>(msg: S) -> Self {
        Self::Socket(msg.into())
    }
    pub fn codec<S: Into<String>>(msg: S) -> Self {
        Self::Codec(msg.into())
    }
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Maps the error onto the task-level classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Dns { .. } => ErrorKind::Dns,
            TransportError::Socket(_) | TransportError::Timeout(_) => ErrorKind::Socket,
            TransportError::Http { .. } => ErrorKind::Http,
            TransportError::Codec(_) | TransportError::Serialization(_) => ErrorKind::EnDecode,
            TransportError::Cancelled => ErrorKind::Cancelled,
            TransportError::Local(_)
            | TransportError::Configuration(_)
            | TransportError::Storage(_)
            | TransportError::Internal(_) => ErrorKind::Local,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Internal(_) | TransportError::Configuration(_)
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Dns { .. }
                | TransportError::Socket(_)
                | TransportError::Timeout(_)
                | TransportError::Http { .. }
        )
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => TransportError::Timeout(err.to_string()),
            _ => TransportError::Socket(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for TransportError {
    fn from(err: anyhow::Error) -> Self {
        TransportError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests;
