use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use super::error::{CloseReason, PeerError, Result};

/// Type-erased view of an outstanding call, as stored in the table
pub(crate) trait Completion: Send {
    fn set_id(&mut self, id: u64);

    /// Decode `result` into the reply and signal completion.
    /// An undecodable result is returned as a protocol error after the call
    /// itself has been failed.
    fn complete(self: Box<Self>, result: Value) -> Result<()>;

    fn fail(self: Box<Self>, error: PeerError);
}

struct Table {
    seq: u64,
    calls: HashMap<u64, Box<dyn Completion>>,
    closed: Option<CloseReason>,
}

/// Pending call table plus the sequence counter, under one lock
pub(crate) struct PendingCalls {
    table: Mutex<Table>,
}

impl PendingCalls {
    pub(crate) fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                seq: 0,
                calls: HashMap::new(),
                closed: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Assign the next ID (first is 1) and store the entry.
    ///
    /// Once the table is closed no ID is assigned: the entry is failed with
    /// the close reason and `None` is returned.
    pub(crate) fn register(&self, mut entry: Box<dyn Completion>) -> Option<u64> {
        let mut table = self.lock();
        if let Some(reason) = table.closed.clone() {
            drop(table);
            entry.fail(PeerError::Closed(reason));
            return None;
        }

        table.seq += 1;
        let id = table.seq;
        entry.set_id(id);
        table.calls.insert(id, entry);
        Some(id)
    }

    /// Remove and return the entry for `id`, if still pending
    pub(crate) fn take(&self, id: u64) -> Option<Box<dyn Completion>> {
        self.lock().calls.remove(&id)
    }

    /// Refuse new calls and fail every pending one. Returns how many were failed.
    pub(crate) fn close(&self, reason: CloseReason) -> usize {
        let drained: Vec<Box<dyn Completion>> = {
            let mut table = self.lock();
            if table.closed.is_none() {
                table.closed = Some(reason.clone());
            }
            table.calls.drain().map(|(_, entry)| entry).collect()
        };

        let count = drained.len();
        for entry in drained {
            entry.fail(PeerError::Closed(reason.clone()));
        }
        count
    }

    pub(crate) fn close_reason(&self) -> Option<CloseReason> {
        self.lock().closed.clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().calls.len()
    }
}
