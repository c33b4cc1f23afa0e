//! Durable session snapshots.
//!
//! A checkpoint holds everything a fresh process needs to continue where the
//! previous one stopped: ledger spend still inside the window, the ordered
//! remaining queue, the in-flight item and the resource picture at write
//! time. There is exactly one checkpoint per store; each save overwrites it.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::core::arbiter::ResourceSnapshot;
use crate::core::error::GovernorError;
use crate::core::ledger::{is_expired, BudgetLedger, LedgerEntry};
use crate::util::clock::Clock;
use crate::util::serde::ItemId;

/// Snapshot format version written by this build.
pub const CHECKPOINT_VERSION: u32 = 1;

/// One session snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Format version.
    pub version: u32,
    /// Session that wrote it.
    pub session_id: String,
    /// Write time (ms since epoch).
    pub written_at_ms: u128,
    /// Ledger entries inside the window at write time.
    pub ledger: Vec<LedgerEntry>,
    /// Remaining queue, in processing order.
    pub queue: Vec<ItemId>,
    /// Item that was running when the snapshot was taken.
    pub in_flight: Option<ItemId>,
    /// Items that reached a terminal state; a resumed session skips them.
    #[serde(default)]
    pub finished: Vec<ItemId>,
    /// Arbiter's view at write time.
    pub resources: Option<ResourceSnapshot>,
}

impl Checkpoint {
    /// Capture the current ledger together with queue state.
    #[must_use]
    pub fn capture(
        session_id: impl Into<String>,
        ledger: &BudgetLedger,
        queue: Vec<ItemId>,
        in_flight: Option<ItemId>,
        finished: Vec<ItemId>,
        resources: Option<ResourceSnapshot>,
        written_at_ms: u128,
    ) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            session_id: session_id.into(),
            written_at_ms,
            ledger: ledger.entries(),
            queue,
            in_flight,
            finished,
            resources,
        }
    }

    /// Total tokens recorded in the snapshot's ledger.
    #[must_use]
    pub fn ledger_tokens(&self) -> u64 {
        self.ledger
            .iter()
            .fold(0_u64, |acc, e| acc.saturating_add(e.tokens))
    }

    /// Items to process on resume: the in-flight item first, then the queue.
    #[must_use]
    pub fn resume_order(&self) -> Vec<ItemId> {
        self.in_flight
            .iter()
            .chain(self.queue.iter().filter(|id| Some(*id) != self.in_flight.as_ref()))
            .cloned()
            .collect()
    }
}

/// Byte-level persistence for the single checkpoint.
pub trait CheckpointStore: Send + Sync {
    /// Replace the stored snapshot. Must be atomic: a reader sees either the
    /// old bytes or the new bytes, never a mix.
    fn write(&self, bytes: &[u8]) -> io::Result<()>;

    /// Stored snapshot, or `None` if nothing has been written.
    fn read(&self) -> io::Result<Option<Vec<u8>>>;

    /// Remove the stored snapshot.
    fn clear(&self) -> io::Result<()>;

    /// Where the snapshot lives, for logs.
    fn describe(&self) -> String;
}

/// Saves and loads [`Checkpoint`]s through a [`CheckpointStore`].
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    window: Duration,
    retry_backoff: Duration,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("store", &self.store.describe())
            .field("window", &self.window)
            .field("retry_backoff", &self.retry_backoff)
            .finish_non_exhaustive()
    }
}

impl CheckpointManager {
    /// `window` must match the ledger's so loads prune identically.
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        window: Duration,
        retry_backoff: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            window,
            retry_backoff,
            clock,
        }
    }

    /// Write `checkpoint`, retrying once after the backoff.
    ///
    /// # Errors
    ///
    /// [`GovernorError::CheckpointWrite`] when both attempts fail.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), GovernorError> {
        let bytes = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| GovernorError::CheckpointWrite(format!("encode: {e}")))?;

        if let Err(first) = self.store.write(&bytes) {
            warn!(
                store = %self.store.describe(),
                error = %first,
                backoff = %humantime::format_duration(self.retry_backoff),
                "checkpoint write failed, retrying"
            );
            thread::sleep(self.retry_backoff);
            if let Err(second) = self.store.write(&bytes) {
                error!(
                    store = %self.store.describe(),
                    error = %second,
                    "checkpoint write failed twice, session cannot be resumed"
                );
                return Err(GovernorError::CheckpointWrite(format!(
                    "{}: {second} (first attempt: {first})",
                    self.store.describe()
                )));
            }
        }

        info!(
            store = %self.store.describe(),
            queued = checkpoint.queue.len(),
            in_flight = ?checkpoint.in_flight,
            ledger_tokens = checkpoint.ledger_tokens(),
            "checkpoint written"
        );
        Ok(())
    }

    /// Last snapshot, with ledger entries outside the window dropped.
    ///
    /// # Errors
    ///
    /// [`GovernorError::CheckpointRead`] if the store fails and
    /// [`GovernorError::CheckpointCorrupt`] if the bytes do not decode to a
    /// supported snapshot.
    pub fn load(&self) -> Result<Option<Checkpoint>, GovernorError> {
        let Some(bytes) = self
            .store
            .read()
            .map_err(|e| GovernorError::CheckpointRead(format!("{}: {e}", self.store.describe())))?
        else {
            debug!(store = %self.store.describe(), "no checkpoint to resume from");
            return Ok(None);
        };

        let mut checkpoint: Checkpoint = serde_json::from_slice(&bytes)
            .map_err(|e| GovernorError::CheckpointCorrupt(e.to_string()))?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(GovernorError::CheckpointCorrupt(format!(
                "unsupported version {} (expected {CHECKPOINT_VERSION})",
                checkpoint.version
            )));
        }

        let now = self.clock.now_ms();
        let window = self.window.as_millis();
        let before = checkpoint.ledger.len();
        checkpoint
            .ledger
            .retain(|e| !is_expired(e.timestamp_ms, now, window));
        checkpoint.ledger.sort_by_key(|e| e.timestamp_ms);

        info!(
            session_id = %checkpoint.session_id,
            queued = checkpoint.queue.len(),
            in_flight = ?checkpoint.in_flight,
            expired_entries = before - checkpoint.ledger.len(),
            "checkpoint loaded"
        );
        Ok(Some(checkpoint))
    }

    /// Remove the stored snapshot.
    ///
    /// # Errors
    ///
    /// [`GovernorError::CheckpointWrite`] if the store cannot remove it.
    pub fn clear(&self) -> Result<(), GovernorError> {
        self.store
            .clear()
            .map_err(|e| GovernorError::CheckpointWrite(format!("{}: {e}", self.store.describe())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::checkpoint::InMemoryCheckpointStore;
    use crate::util::clock::ManualClock;

    const HOUR: Duration = Duration::from_secs(3600);

    fn manager(store: &InMemoryCheckpointStore, clock: &ManualClock) -> CheckpointManager {
        CheckpointManager::new(
            Arc::new(store.clone()),
            5 * HOUR,
            Duration::from_millis(1),
            Arc::new(clock.clone()),
        )
    }

    fn ledger(clock: &ManualClock) -> BudgetLedger {
        BudgetLedger::new(200_000, 5 * HOUR, 20_000, Arc::new(clock.clone()))
    }

    #[test]
    fn round_trip_keeps_in_window_entries() {
        let clock = ManualClock::new(10_000_000_000);
        let store = InMemoryCheckpointStore::default();
        let mut l = ledger(&clock);
        l.record(1_000, 500);
        clock.advance(HOUR);
        l.record(2_000, 0);

        let cp = Checkpoint::capture(
            "s1",
            &l,
            vec!["b".into(), "c".into()],
            Some("a".into()),
            vec![],
            None,
            clock.now_ms(),
        );
        let m = manager(&store, &clock);
        m.save(&cp).unwrap();
        let loaded = m.load().unwrap().unwrap();
        assert_eq!(loaded, cp);
        assert_eq!(loaded.resume_order(), vec!["a", "b", "c"]);
    }

    #[test]
    fn load_drops_entries_that_aged_out() {
        let clock = ManualClock::new(10_000_000_000);
        let store = InMemoryCheckpointStore::default();
        let mut l = ledger(&clock);
        l.record(10_000, 0);
        clock.advance(4 * HOUR);
        l.record(3_000, 0);
        let cp = Checkpoint::capture("s1", &l, vec![], None, vec![], None, clock.now_ms());
        let m = manager(&store, &clock);
        m.save(&cp).unwrap();

        clock.advance(2 * HOUR);
        let loaded = m.load().unwrap().unwrap();
        assert_eq!(loaded.ledger.len(), 1);
        assert_eq!(loaded.ledger_tokens(), 3_000);
    }

    #[test]
    fn save_retries_once() {
        let clock = ManualClock::new(10_000_000_000);
        let store = InMemoryCheckpointStore::default();
        let m = manager(&store, &clock);
        let cp = Checkpoint::capture("s1", &ledger(&clock), vec![], None, vec![], None, 0);

        store.fail_next_writes(1);
        m.save(&cp).unwrap();
        assert!(m.load().unwrap().is_some());

        store.fail_next_writes(2);
        assert!(matches!(m.save(&cp), Err(GovernorError::CheckpointWrite(_))));
    }

    #[test]
    fn empty_store_and_garbage() {
        let clock = ManualClock::new(10_000_000_000);
        let store = InMemoryCheckpointStore::default();
        let m = manager(&store, &clock);
        assert!(m.load().unwrap().is_none());
        store.write(b"not json").unwrap();
        assert!(matches!(m.load(), Err(GovernorError::CheckpointCorrupt(_))));
        m.clear().unwrap();
        assert!(m.load().unwrap().is_none());
    }

    #[test]
    fn unknown_version_is_corrupt() {
        let clock = ManualClock::new(10_000_000_000);
        let store = InMemoryCheckpointStore::default();
        let m = manager(&store, &clock);
        let mut cp = Checkpoint::capture("s1", &ledger(&clock), vec![], None, vec![], None, 0);
        cp.version = 99;
        store.write(&serde_json::to_vec(&cp).unwrap()).unwrap();
        assert!(matches!(m.load(), Err(GovernorError::CheckpointCorrupt(_))));
    }
}
