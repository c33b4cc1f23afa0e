//! In-memory checkpoint store for tests and dry runs.

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::checkpoint::CheckpointStore;

#[derive(Debug, Default)]
struct Slot {
    bytes: Option<Vec<u8>>,
    failures_left: u32,
    writes: u64,
}

/// Keeps the snapshot in memory. Clones share the same slot so a test can
/// simulate a restart by handing a clone to a new session.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
    slot: Arc<Mutex<Slot>>,
}

impl InMemoryCheckpointStore {
    /// Make the next `count` writes fail with an I/O error.
    pub fn fail_next_writes(&self, count: u32) {
        self.slot.lock().failures_left = count;
    }

    /// Successful writes so far.
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.slot.lock().writes
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let mut slot = self.slot.lock();
        if slot.failures_left > 0 {
            slot.failures_left -= 1;
            return Err(io::Error::other("injected checkpoint write failure"));
        }
        slot.bytes = Some(bytes.to_vec());
        slot.writes += 1;
        Ok(())
    }

    fn read(&self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.slot.lock().bytes.clone())
    }

    fn clear(&self) -> io::Result<()> {
        self.slot.lock().bytes = None;
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".into()
    }
}
