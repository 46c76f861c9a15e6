//! Owns the connected socket to the agent: a send-locked write half used by
//! any number of concurrent submitters, and a read half with a single owner
//! (the reader thread).

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::trace;

use crate::codec::KvMap;
use crate::error::VdevError;

pub struct Transport {
    write_half: Mutex<UnixStream>,
}

impl Transport {
    /// Connects to `path` and returns the `Transport` (for sending) plus the
    /// read half (for the reader thread to own exclusively).
    pub fn connect(path: impl AsRef<Path>) -> Result<(Transport, UnixStream), VdevError> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|source| VdevError::OpenFailed {
            path: PathBuf::from(path),
            source,
        })?;
        let read_half = stream.try_clone().map_err(|source| VdevError::OpenFailed {
            path: PathBuf::from(path),
            source,
        })?;
        Ok((
            Transport {
                write_half: Mutex::new(stream),
            },
            read_half,
        ))
    }

    /// Packs `map`, acquires the send lock, and writes the whole frame in a
    /// single call so two concurrent submitters never interleave bytes.
    pub fn send_frame(&self, map: &KvMap) -> Result<(), VdevError> {
        let frame = map.to_frame();
        let mut guard = self.write_half.lock().unwrap();
        trace!(
            "sending {}-byte frame type={:?}",
            frame.len(),
            map.get("Type").and_then(|v| v.as_str())
        );
        guard
            .write_all(&frame)
            .map_err(|e| VdevError::protocol(format!("short write to agent socket: {e}")))
    }

    /// Shuts the write half down so the agent observes EOF and the reader's
    /// blocking `recv` unblocks with a zero-byte read.
    pub fn close(&self) {
        let guard = self.write_half.lock().unwrap();
        let _ = guard.shutdown(std::net::Shutdown::Both);
    }
}

/// Reads exactly `buf.len()` bytes, looping on short reads. A zero-byte read
/// (peer closed) or any I/O error is a protocol fault.
pub fn recv_exact(read_half: &mut UnixStream, buf: &mut [u8]) -> Result<(), VdevError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = read_half
            .read(&mut buf[filled..])
            .map_err(|e| VdevError::protocol(format!("recv error from agent socket: {e}")))?;
        if n == 0 {
            return Err(VdevError::protocol(
                "agent socket closed mid-frame".to_string(),
            ));
        }
        filled += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::thread;

    #[test]
    fn send_frame_then_recv_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut size_buf = [0u8; 8];
            recv_exact(&mut stream, &mut size_buf).unwrap();
            let size = u64::from_le_bytes(size_buf) as usize;
            let mut payload = vec![0u8; size];
            recv_exact(&mut stream, &mut payload).unwrap();
            KvMap::unpack(&payload).unwrap()
        });

        let (transport, _read_half) = Transport::connect(&path).unwrap();
        let mut map = KvMap::new();
        map.insert("Type", "open pool");
        map.insert("GUID", 42u64);
        transport.send_frame(&map).unwrap();

        let received = server.join().unwrap();
        assert_eq!(received, map);
    }

    #[test]
    fn recv_exact_errors_on_peer_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let (_transport, mut read_half) = Transport::connect(&path).unwrap();
        server.join().unwrap();
        let mut buf = [0u8; 8];
        assert!(recv_exact(&mut read_half, &mut buf).is_err());
    }
}
