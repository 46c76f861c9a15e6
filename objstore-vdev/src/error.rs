use std::io;

/// Every error surface this crate exposes to a host.
///
/// Variant names track the host-visible codes named in the external
/// interface rather than Rust idiom (`BadLabel`, not `InvalidBucket`), since
/// that is what callers match against.
#[derive(Debug, thiserror::Error)]
pub enum VdevError {
    #[error("missing required config key `{0}`")]
    MissingConfigKey(&'static str),

    #[error("device path (bucket) is empty")]
    BadLabel,

    #[error("failed to connect to agent at {path}: {source}")]
    OpenFailed {
        path: std::path::PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("device is unreadable")]
    DeviceUnreadable,

    #[error("operation not supported")]
    NotSupported,

    #[error("protocol fault: {0}")]
    Protocol(String),

    #[error("device is degraded by a prior protocol fault")]
    Degraded,

    #[error("request table is full, would block")]
    WouldBlock,
}

impl VdevError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        VdevError::Protocol(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, VdevError>;
