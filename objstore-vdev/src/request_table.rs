//! Fixed-capacity table of outstanding host I/Os, keyed by wire request id.

use std::sync::{Condvar, Mutex};

use log::debug;

use crate::error::VdevError;
use crate::io::{Completion, CompletionSender, IoOutcome, PendingIo, Priority};
use crate::protocol::MAX_OUTSTANDING_REQUESTS;

const PRIORITY_COUNT: usize = 4;

fn priority_index(priority: Priority) -> usize {
    match priority {
        Priority::Sync => 0,
        Priority::Async => 1,
        Priority::Scrub => 2,
        Priority::Trim => 3,
    }
}

/// Per-priority-class counters exposed for stats: ios currently occupying a
/// slot, and ios currently parked waiting for one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PriorityStats {
    pub active: u64,
    pub queued: u64,
}

struct Occupant {
    io: PendingIo,
    completion: CompletionSender,
}

struct Inner {
    slots: Vec<Option<Occupant>>,
    /// Set once a protocol fault has drained the table; further submits
    /// fail fast instead of blocking on a reader that will never reply.
    degraded: Option<String>,
    active: [u64; PRIORITY_COUNT],
    queued: [u64; PRIORITY_COUNT],
}

pub struct RequestTable {
    inner: Mutex<Inner>,
    not_full: Condvar,
}

impl RequestTable {
    pub fn new() -> Self {
        RequestTable {
            inner: Mutex::new(Inner {
                slots: (0..MAX_OUTSTANDING_REQUESTS).map(|_| None).collect(),
                degraded: None,
                active: [0; PRIORITY_COUNT],
                queued: [0; PRIORITY_COUNT],
            }),
            not_full: Condvar::new(),
        }
    }

    fn find_free(slots: &[Option<Occupant>]) -> Option<usize> {
        slots.iter().position(|s| s.is_none())
    }

    /// Blocks until a slot is free, installs `io`, and returns its id.
    pub fn submit(&self, io: PendingIo, completion: CompletionSender) -> Result<u64, VdevError> {
        let priority = io.priority;
        let pidx = priority_index(priority);
        let mut guard = self.inner.lock().unwrap();
        loop {
            if guard.degraded.is_some() {
                return Err(VdevError::Degraded);
            }
            if let Some(idx) = Self::find_free(&guard.slots) {
                guard.slots[idx] = Some(Occupant { io, completion });
                guard.active[pidx] += 1;
                return Ok(idx as u64);
            }
            guard.queued[pidx] += 1;
            debug!(
                "request table full, {priority:?} io queued (queued={})",
                guard.queued[pidx]
            );
            guard = self.not_full.wait(guard).unwrap();
            guard.queued[pidx] -= 1;
        }
    }

    /// Non-blocking alternative to `submit`: returns `WouldBlock` instead of
    /// parking the caller's thread when the table is full. Exists for hosts
    /// that cannot afford to block inside their io-start path.
    pub fn try_submit(
        &self,
        io: PendingIo,
        completion: CompletionSender,
    ) -> Result<u64, VdevError> {
        let priority = io.priority;
        let mut guard = self.inner.lock().unwrap();
        if guard.degraded.is_some() {
            return Err(VdevError::Degraded);
        }
        match Self::find_free(&guard.slots) {
            Some(idx) => {
                guard.slots[idx] = Some(Occupant { io, completion });
                guard.active[priority_index(priority)] += 1;
                Ok(idx as u64)
            }
            None => Err(VdevError::WouldBlock),
        }
    }

    /// Removes and returns the occupant of `req_id`, signaling one parked
    /// submitter. A request id that is out of range or already free is a
    /// protocol fault, not a panic.
    pub fn complete(&self, req_id: u64) -> Result<(PendingIo, CompletionSender), VdevError> {
        let mut guard = self.inner.lock().unwrap();
        let idx = usize::try_from(req_id)
            .ok()
            .filter(|i| *i < guard.slots.len())
            .ok_or_else(|| VdevError::protocol(format!("request id {req_id} out of range")))?;
        let occupant = guard.slots[idx]
            .take()
            .ok_or_else(|| VdevError::protocol(format!("request id {req_id} was not in flight")))?;
        guard.active[priority_index(occupant.io.priority)] -= 1;
        debug!("request table released slot {idx} (request id {req_id})");
        self.not_full.notify_one();
        Ok((occupant.io, occupant.completion))
    }

    /// Marks the table degraded and drains every occupied slot, delivering a
    /// protocol-fault outcome to each one's completion channel. Wakes every
    /// parked submitter so none of them block forever.
    pub fn fail_all(&self, reason: String) {
        let mut guard = self.inner.lock().unwrap();
        guard.degraded = Some(reason.clone());
        let occupants: Vec<Occupant> = guard.slots.iter_mut().filter_map(|slot| slot.take()).collect();
        for occupant in occupants {
            guard.active[priority_index(occupant.io.priority)] -= 1;
            let delay = occupant.io.submitted_at.elapsed();
            let _ = occupant.completion.send(Completion {
                outcome: IoOutcome::Err(VdevError::protocol(reason.clone())),
                delay,
            });
        }
        self.not_full.notify_all();
    }

    /// Current active/queued counts for `priority`, exposed for stats.
    pub fn stats(&self, priority: Priority) -> PriorityStats {
        let guard = self.inner.lock().unwrap();
        let idx = priority_index(priority);
        PriorityStats {
            active: guard.active[idx],
            queued: guard.queued[idx],
        }
    }

    #[cfg(test)]
    pub fn occupied_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .slots
            .iter()
            .filter(|s| s.is_some())
            .count()
    }
}

impl Default for RequestTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{completion_channel, Priority};

    #[test]
    fn submit_assigns_lowest_free_index() {
        let table = RequestTable::new();
        let (tx, _rx) = completion_channel();
        let id0 = table
            .submit(PendingIo::for_read(0, 512, Priority::Sync), tx.clone())
            .unwrap();
        let id1 = table
            .submit(PendingIo::for_read(512, 512, Priority::Sync), tx)
            .unwrap();
        assert_eq!(id0, 0);
        assert_eq!(id1, 1);
        assert_eq!(table.occupied_count(), 2);
    }

    #[test]
    fn complete_frees_the_slot_for_reuse() {
        let table = RequestTable::new();
        let (tx, _rx) = completion_channel();
        let id = table
            .submit(PendingIo::for_read(0, 512, Priority::Sync), tx.clone())
            .unwrap();
        table.complete(id).unwrap();
        assert_eq!(table.occupied_count(), 0);
        let id2 = table
            .submit(PendingIo::for_read(4096, 512, Priority::Sync), tx)
            .unwrap();
        assert_eq!(id2, id);
    }

    #[test]
    fn complete_on_unknown_id_is_a_protocol_error_not_a_panic() {
        let table = RequestTable::new();
        assert!(table.complete(7).is_err());
    }

    #[test]
    fn try_submit_reports_would_block_when_full() {
        let table = RequestTable::new();
        let (tx, _rx) = completion_channel();
        for i in 0..MAX_OUTSTANDING_REQUESTS {
            table
                .try_submit(
                    PendingIo::for_read((i as u64) * 512, 512, Priority::Sync),
                    tx.clone(),
                )
                .unwrap();
        }
        let err = table
            .try_submit(PendingIo::for_read(0, 512, Priority::Sync), tx)
            .unwrap_err();
        assert!(matches!(err, VdevError::WouldBlock));
    }

    #[test]
    fn fail_all_delivers_protocol_error_to_every_in_flight_io() {
        let table = RequestTable::new();
        let (tx1, rx1) = completion_channel();
        let (tx2, rx2) = completion_channel();
        table
            .submit(PendingIo::for_read(0, 512, Priority::Sync), tx1)
            .unwrap();
        table
            .submit(PendingIo::for_read(512, 512, Priority::Sync), tx2)
            .unwrap();

        table.fail_all("socket closed".to_string());

        assert!(matches!(
            rx1.try_recv().unwrap().outcome,
            IoOutcome::Err(_)
        ));
        assert!(matches!(
            rx2.try_recv().unwrap().outcome,
            IoOutcome::Err(_)
        ));
        assert_eq!(table.occupied_count(), 0);
    }

    #[test]
    fn submit_after_degraded_fails_fast() {
        let table = RequestTable::new();
        table.fail_all("gone".to_string());
        let (tx, _rx) = completion_channel();
        let err = table
            .submit(PendingIo::for_read(0, 512, Priority::Sync), tx)
            .unwrap_err();
        assert!(matches!(err, VdevError::Degraded));
    }

    #[test]
    fn submit_and_complete_track_the_priority_active_counter() {
        let table = RequestTable::new();
        let (tx, _rx) = completion_channel();
        assert_eq!(table.stats(Priority::Sync).active, 0);
        let id = table
            .submit(PendingIo::for_read(0, 512, Priority::Sync), tx)
            .unwrap();
        assert_eq!(table.stats(Priority::Sync).active, 1);
        assert_eq!(table.stats(Priority::Scrub).active, 0);
        table.complete(id).unwrap();
        assert_eq!(table.stats(Priority::Sync).active, 0);
    }

    #[test]
    fn try_submit_also_tracks_the_priority_active_counter() {
        let table = RequestTable::new();
        let (tx, _rx) = completion_channel();
        table
            .try_submit(PendingIo::for_read(0, 512, Priority::Scrub), tx)
            .unwrap();
        assert_eq!(table.stats(Priority::Scrub).active, 1);
    }

    #[test]
    fn fail_all_zeroes_the_active_counter_for_drained_ios() {
        let table = RequestTable::new();
        let (tx, _rx) = completion_channel();
        table
            .submit(PendingIo::for_read(0, 512, Priority::Sync), tx)
            .unwrap();
        assert_eq!(table.stats(Priority::Sync).active, 1);
        table.fail_all("socket closed".to_string());
        assert_eq!(table.stats(Priority::Sync).active, 0);
    }
}
