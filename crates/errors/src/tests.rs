use crate::*;

#[test]
fn test_transport_error_display() {
    let dns = TransportError::dns("long.example.com", "no record");
    assert_eq!(dns.to_string(), "DNS解析失败: long.example.com - no record");

    let socket = TransportError::socket("connection refused");
    assert_eq!(socket.to_string(), "Socket错误: connection refused");

    let http = TransportError::Http { status: 302 };
    assert_eq!(http.to_string(), "HTTP错误: 状态码 302");

    assert_eq!(TransportError::Cancelled.to_string(), "操作已取消");
}

#[test]
fn test_error_kind_mapping() {
    assert_eq!(TransportError::dns("h", "x").kind(), ErrorKind::Dns);
    assert_eq!(TransportError::socket("x").kind(), ErrorKind::Socket);
    assert_eq!(TransportError::timeout("x").kind(), ErrorKind::Socket);
    assert_eq!(TransportError::codec("x").kind(), ErrorKind::EnDecode);
    assert_eq!(TransportError::storage("x").kind(), ErrorKind::Local);
    assert_eq!(TransportError::Cancelled.kind(), ErrorKind::Cancelled);
}

#[test]
fn test_fatal_and_retryable() {
    assert!(TransportError::Internal("x".into()).is_fatal());
    assert!(TransportError::config_error("x").is_fatal());
    assert!(!TransportError::socket("x").is_fatal());

    assert!(TransportError::socket("x").is_retryable());
    assert!(TransportError::dns("h", "x").is_retryable());
    assert!(!TransportError::codec("x").is_retryable());
    assert!(!TransportError::Cancelled.is_retryable());
}

#[test]
fn test_io_error_conversion() {
    let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
    assert!(matches!(
        TransportError::from(timed_out),
        TransportError::Timeout(_)
    ));

    let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
    assert!(matches!(TransportError::from(reset), TransportError::Socket(_)));
}

#[test]
fn test_error_kind_display() {
    assert_eq!(ErrorKind::NetMsgXp.to_string(), "netmsgxp");
    assert_eq!(ErrorKind::default(), ErrorKind::Ok);
    assert!(ErrorKind::Ok.is_ok());
    assert!(!ErrorKind::Local.is_ok());
}
