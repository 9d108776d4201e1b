//! 错误类型转换实现
//!
//! 传输层错误到各调用入口错误的映射

use super::{ConfigError, ConnectError, MetadataError, SendError, TransportError};
use std::io;

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => TransportError::Timeout,
            io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => {
                TransportError::Unreachable(err.to_string())
            }
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => TransportError::ConnectionLost(err.to_string()),
            _ => TransportError::Transient(err.to_string()),
        }
    }
}

impl From<TransportError> for ConnectError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unreachable(reason) => ConnectError::Unreachable(reason),
            TransportError::Timeout => ConnectError::Unreachable("连接超时".to_string()),
            other => ConnectError::HandshakeFailed(other.to_string()),
        }
    }
}

impl From<TransportError> for MetadataError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::UnknownTopic(topic) => MetadataError::UnknownTopic(topic),
            _ => MetadataError::Timeout,
        }
    }
}

impl From<TransportError> for SendError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConnectionLost(_) => SendError::Closed,
            TransportError::Timeout => SendError::TimedOut,
            other => SendError::Rejected(other.to_string()),
        }
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_map_to_connect_errors() {
        assert!(matches!(
            ConnectError::from(TransportError::Unreachable("down".into())),
            ConnectError::Unreachable(_)
        ));
        assert!(matches!(
            ConnectError::from(TransportError::Timeout),
            ConnectError::Unreachable(_)
        ));
        assert!(matches!(
            ConnectError::from(TransportError::Authentication("sasl".into())),
            ConnectError::HandshakeFailed(_)
        ));
    }

    #[test]
    fn unknown_topic_survives_metadata_mapping() {
        assert_eq!(
            MetadataError::from(TransportError::UnknownTopic("orders".into())),
            MetadataError::UnknownTopic("orders".into())
        );
        assert_eq!(
            MetadataError::from(TransportError::Transient("x".into())),
            MetadataError::Timeout
        );
    }

    #[test]
    fn produce_timeout_is_not_a_definite_rejection() {
        let err = SendError::from(TransportError::Timeout);
        assert_eq!(err, SendError::TimedOut);
        assert!(!err.is_definite());
        assert!(SendError::from(TransportError::Rejected("too large".into())).is_definite());
    }

    #[test]
    fn io_errors_are_classified() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(
            TransportError::from(refused),
            TransportError::Unreachable(_)
        ));
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(TransportError::from(reset).is_fatal());
    }
}
