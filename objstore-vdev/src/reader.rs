//! The dedicated reader thread: decodes frames off the agent socket and
//! demultiplexes each response to the request table or the serial latch.

use std::os::unix::net::UnixStream;
use std::sync::Weak;

use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, error, warn};

use crate::codec::KvMap;
use crate::device::Shared;
use crate::error::VdevError;
use crate::io::{Completion, IoDirection, IoOutcome};
use crate::protocol::*;
use crate::transport::recv_exact;

/// A generous ceiling on a single frame's payload size, so a corrupt or
/// adversarial length prefix cannot make the reader attempt a multi-GB
/// allocation before the decode step has a chance to reject it.
const MAX_FRAME_BYTES: u64 = 256 * 1024 * 1024;

/// Runs until the socket closes or a protocol fault occurs. Holds only a
/// `Weak` reference to the device's shared state so the device can own this
/// thread's `JoinHandle` without a reference cycle.
pub fn run(shared: Weak<Shared>, mut read_half: UnixStream) {
    loop {
        match read_one_frame(&mut read_half) {
            Ok(map) => {
                let Some(shared) = shared.upgrade() else {
                    debug!("device dropped, reader exiting");
                    return;
                };
                if let Err(e) = dispatch(&shared, map) {
                    fault(&shared, e);
                    return;
                }
            }
            Err(e) => {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                fault(&shared, e);
                return;
            }
        }
    }
}

fn read_one_frame(read_half: &mut UnixStream) -> Result<KvMap, VdevError> {
    let mut size_buf = [0u8; 8];
    recv_exact(read_half, &mut size_buf)?;
    let size = (&size_buf[..])
        .read_u64::<LittleEndian>()
        .expect("reading from a fixed 8-byte buffer cannot fail");
    if size > MAX_FRAME_BYTES {
        return Err(VdevError::protocol(format!(
            "agent announced an implausible frame size {size}"
        )));
    }
    let mut payload = vec![0u8; size as usize];
    recv_exact(read_half, &mut payload)?;
    KvMap::unpack(&payload)
}

fn dispatch(shared: &Shared, map: KvMap) -> Result<(), VdevError> {
    let ty = map.get_str(FIELD_TYPE)?;
    debug!("got response from agent type={ty}");
    match ty {
        TYPE_CREATE_POOL_DONE | TYPE_END_TXG_DONE => {
            shared.serial.trip();
            Ok(())
        }
        TYPE_OPEN_POOL_DONE => {
            if let Some(uberblock) = map.get_bytes(FIELD_UBERBLOCK) {
                *shared.uberblock.lock().unwrap() = uberblock.to_vec();
            }
            let next_block = map.get_u64(FIELD_NEXT_BLOCK)?;
            shared
                .next_block
                .store(next_block, std::sync::atomic::Ordering::Release);
            shared.serial.trip();
            Ok(())
        }
        TYPE_READ_DONE => complete_read(shared, &map),
        TYPE_WRITE_DONE => complete_write(shared, &map),
        other => {
            warn!("unrecognized response type from agent: {other}");
            Ok(())
        }
    }
}

fn complete_read(shared: &Shared, map: &KvMap) -> Result<(), VdevError> {
    let req_id = map.get_u64(FIELD_REQUEST_ID)?;
    let block = map.get_u64(FIELD_BLOCK)?;
    let data = map
        .get_bytes(FIELD_DATA)
        .ok_or_else(|| VdevError::protocol("read done missing data field"))?;

    let (mut io, completion) = shared.request_table.complete(req_id)?;
    if io.direction != IoDirection::Read {
        return Err(VdevError::protocol(format!(
            "read done for request {req_id} which was not a read"
        )));
    }
    if io.block != block {
        return Err(VdevError::protocol(format!(
            "read done block mismatch: expected {} got {block}",
            io.block
        )));
    }
    if data.len() != io.size {
        return Err(VdevError::protocol(format!(
            "read done length mismatch: expected {} got {}",
            io.size,
            data.len()
        )));
    }
    io.buffer.copy_from_slice(data);
    let delay = io.submitted_at.elapsed();
    let _ = completion.send(Completion {
        outcome: IoOutcome::ReadComplete(io.buffer),
        delay,
    });
    Ok(())
}

fn complete_write(shared: &Shared, map: &KvMap) -> Result<(), VdevError> {
    let req_id = map.get_u64(FIELD_REQUEST_ID)?;
    let block = map.get_u64(FIELD_BLOCK)?;

    let (io, completion) = shared.request_table.complete(req_id)?;
    if io.direction != IoDirection::Write {
        return Err(VdevError::protocol(format!(
            "write done for request {req_id} which was not a write"
        )));
    }
    if io.block != block {
        return Err(VdevError::protocol(format!(
            "write done block mismatch: expected {} got {block}",
            io.block
        )));
    }
    let delay = io.submitted_at.elapsed();
    let _ = completion.send(Completion {
        outcome: IoOutcome::WriteComplete,
        delay,
    });
    Ok(())
}

/// Promotes a protocol fault to device degradation: fails every in-flight
/// io, releases any blocked serial waiter, and marks the device so future
/// submissions fail fast instead of blocking on a socket that is gone.
fn fault(shared: &Shared, e: VdevError) {
    error!("agent protocol fault, degrading device: {e}");
    let reason = e.to_string();
    shared.mark_degraded(reason.clone());
    shared.request_table.fail_all(reason.clone());
    shared.serial.fault(reason);
}
