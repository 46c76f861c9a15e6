//! Host-facing I/O types: what gets submitted and what comes back.

use std::time::Instant;

use crate::error::VdevError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

/// Priority class, carried through only so a host-side stats layer can
/// attribute queued/active counts the way the original vdev queue does;
/// this core does not interpret it otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    Sync,
    Async,
    Scrub,
    Trim,
}

/// What the host asked the device to do.
#[derive(Debug, Clone)]
pub enum IoRequest {
    Read { offset: u64, size: usize },
    Write { offset: u64, data: Vec<u8> },
    Ioctl(IoctlKind),
    Trim { offset: u64, size: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlKind {
    FlushWriteCache,
    Other,
}

/// A read or write occupying a request-table slot while in flight.
#[derive(Debug)]
pub struct PendingIo {
    pub direction: IoDirection,
    pub block: u64,
    pub size: usize,
    /// Source bytes for a write, or a same-length scratch buffer for a read
    /// that the reader fills in on completion.
    pub buffer: Vec<u8>,
    pub priority: Priority,
    pub submitted_at: Instant,
}

impl PendingIo {
    pub fn for_read(offset: u64, size: usize, priority: Priority) -> Self {
        PendingIo {
            direction: IoDirection::Read,
            block: offset >> crate::protocol::BLOCK_SHIFT,
            size,
            buffer: vec![0u8; size],
            priority,
            submitted_at: Instant::now(),
        }
    }

    pub fn for_write(offset: u64, data: Vec<u8>, priority: Priority) -> Self {
        let size = data.len();
        PendingIo {
            direction: IoDirection::Write,
            block: offset >> crate::protocol::BLOCK_SHIFT,
            size,
            buffer: data,
            priority,
            submitted_at: Instant::now(),
        }
    }
}

/// What a completed or failed `PendingIo` hands back to the host.
#[derive(Debug)]
pub enum IoOutcome {
    /// A read completed; the buffer contains the data read.
    ReadComplete(Vec<u8>),
    /// A write completed.
    WriteComplete,
    /// An ioctl/trim was acknowledged without needing the agent.
    Acked,
    Err(VdevError),
}

/// Delivered to the host over the completion channel.
#[derive(Debug)]
pub struct Completion {
    pub outcome: IoOutcome,
    pub delay: std::time::Duration,
}

pub type CompletionSender = crossbeam_channel::Sender<Completion>;
pub type CompletionReceiver = crossbeam_channel::Receiver<Completion>;

pub fn completion_channel() -> (CompletionSender, CompletionReceiver) {
    crossbeam_channel::unbounded()
}
