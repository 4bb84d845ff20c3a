//! Write gate held closed while a migration rewrites the dataset.
//!
//! Writes arriving in that window are parked and replayed afterwards, in
//! arrival order, against whatever mode the migration left behind.

use parking_lot::Mutex;

use crate::error::Operation;
use crate::types::{Record, RecordKind};

#[derive(Debug, Clone)]
pub(crate) struct PendingWrite {
    pub operation: Operation,
    pub record: Record,
}

pub(crate) enum Admission {
    Proceed(PendingWrite),
    Queued,
}

#[derive(Default)]
struct GateState {
    migrating: bool,
    queue: Vec<PendingWrite>,
}

#[derive(Default)]
pub(crate) struct WriteGate {
    state: Mutex<GateState>,
}

impl WriteGate {
    pub fn close(&self) {
        self.state.lock().migrating = true;
    }

    pub fn admit(&self, write: PendingWrite) -> Admission {
        let mut state = self.state.lock();
        if state.migrating {
            state.queue.push(write);
            Admission::Queued
        } else {
            Admission::Proceed(write)
        }
    }

    /// Take the parked writes, or reopen the gate if there are none.
    ///
    /// Checking and reopening happen under one lock, so a write can never
    /// slip in between the last drain and the reopen.
    pub fn drain_or_open(&self) -> Vec<PendingWrite> {
        let mut state = self.state.lock();
        if state.queue.is_empty() {
            state.migrating = false;
        }
        std::mem::take(&mut state.queue)
    }

    /// Whether a parked write will create this record.
    pub fn holds(&self, kind: RecordKind, id: &str) -> bool {
        self.state
            .lock()
            .queue
            .iter()
            .any(|w| w.record.kind() == kind && w.record.id() == id)
    }
}
