use std::io;

use thiserror::Error;

/// Failure categories of the bridge.
///
/// Only the source and startup-reachability variants are fatal; everything else is
/// logged and counted by the component that hit it.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("cannot open telegram source `{source_name}`: {error}")]
    SourceUnavailable {
        source_name: String,
        #[source]
        error: io::Error,
    },

    #[error("telegram source read failed: {0}")]
    SourceReadFailure(#[source] io::Error),

    #[error("cannot parse value `{value}` of field {code}")]
    ParseMismatch { code: String, value: String },

    #[error("broker {host}:{port} unreachable after {waited_secs}s")]
    BrokerUnreachableAtStartup {
        host: String,
        port: u16,
        waited_secs: u64,
    },

    #[error("publish to `{topic}` failed: {reason}")]
    BrokerPublishFailure { topic: String, reason: String },

    #[error("broker disconnected: {0}")]
    BrokerDisconnect(String),

    #[error("protocol {requested} not supported by this build, using {selected}")]
    ProtocolDowngrade {
        requested: &'static str,
        selected: &'static str,
    },

    #[error("{0}")]
    ConfigurationMisuse(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BridgeError {
    /// Whether this failure must take the whole process down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::SourceUnavailable { .. }
                | BridgeError::SourceReadFailure(_)
                | BridgeError::BrokerUnreachableAtStartup { .. }
                | BridgeError::Config(_)
        )
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(BridgeError::SourceReadFailure(io::ErrorKind::UnexpectedEof.into()).is_fatal());
        assert!(BridgeError::BrokerUnreachableAtStartup {
            host: "broker".into(),
            port: 1883,
            waited_secs: 3600
        }
        .is_fatal());
        assert!(!BridgeError::BrokerDisconnect("lost".into()).is_fatal());
        assert!(!BridgeError::ConfigurationMisuse("no sink".into()).is_fatal());
        assert!(!BridgeError::ParseMismatch {
            code: "1-0:1.7.0".into(),
            value: "x".into()
        }
        .is_fatal());
    }

    #[test]
    fn test_display_messages() {
        let err = BridgeError::ProtocolDowngrade {
            requested: "MQTTv5",
            selected: "MQTTv311",
        };
        assert_eq!(
            err.to_string(),
            "protocol MQTTv5 not supported by this build, using MQTTv311"
        );
    }
}
