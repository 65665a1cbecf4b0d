use crate::config::ConfigError;
use presence_transport::TransportError;

/// Errors surfaced to local callers and to the server's own run loop.
/// `HandlerContractViolation` and a closed mailbox (`ServerGone`) are fatal:
/// the server task exits and every in-flight and future `TrackerHandle`
/// call fails.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// `update` targeted a `(pid, topic, key)` with no live presence.
    #[error("no presence for that (pid, topic, key)")]
    NoPresence,

    /// The diff handler returned anything other than success. Fatal.
    #[error("diff handler contract violation: {0}")]
    HandlerContractViolation(String),

    /// A broadcast or direct send failed at the transport layer. Transient;
    /// not retried at this layer (the next heartbeat implicitly retries).
    #[error("transport failure: {0}")]
    TransportFailure(#[from] TransportError),

    /// A wire message failed to (de)serialize.
    #[error("(de)serialization failure: {0}")]
    Serialization(String),

    /// Configuration failed `TrackerConfig::validate`.
    #[error("invalid tracker configuration: {0}")]
    Config(#[from] ConfigError),

    /// The server's mailbox is closed; it has already exited (normally
    /// after a `HandlerContractViolation`).
    #[error("tracker server is no longer running")]
    ServerGone,
}

pub type Result<T> = std::result::Result<T, TrackerError>;
