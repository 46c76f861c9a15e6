//! A leaf vdev adapter that exposes a remote object store as a block
//! device, by speaking a framed key/value protocol to a local agent
//! process over a Unix domain socket.
//!
//! [`Device`] is the entry point: `init` it from a host-supplied config
//! map, `open` it against a bucket, and submit reads/writes/ioctls with
//! [`Device::io_start`]. Completions arrive asynchronously over the
//! channel each submission returns.

/// Public so alternate agent implementations can speak the same framing
/// and tag encoding without reverse-engineering it from this crate's wire
/// output.
pub mod codec;
mod config;
mod device;
mod error;
mod io;
/// Public for the same reason as [`codec`]: the field and type-string
/// constants here ARE the protocol.
pub mod protocol;
mod reader;
mod request_table;
mod serial;
mod transport;

pub use config::{
    ConnectionConfig, CONFIG_KEY_CREDENTIALS, CONFIG_KEY_CREDENTIALS_LOCATION,
    CONFIG_KEY_ENDPOINT, CONFIG_KEY_REGION,
};
pub use device::{Device, OpenResult, SpaLoadState, SpaMode, Tunables};
pub use error::{Result, VdevError};
pub use io::{
    Completion, CompletionReceiver, CompletionSender, IoDirection, IoOutcome, IoRequest,
    IoctlKind, Priority,
};
pub use protocol::{DEFAULT_ASHIFT, DEFAULT_SOCKET_PATH, MAX_OUTSTANDING_REQUESTS, PSIZE};
pub use request_table::PriorityStats;
