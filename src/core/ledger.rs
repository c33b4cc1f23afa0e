//! Rolling-window token budget ledger.
//!
//! The external API enforces its cap over a trailing window rather than per
//! session, so the ledger keeps timestamped entries and forgets them once they
//! age out. Pruning happens lazily whenever the ledger is read.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::util::clock::Clock;
use crate::util::serde::ResourceEstimate;

/// One consumption record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// When the tokens were charged (ms since epoch).
    pub timestamp_ms: u128,
    /// Tokens charged.
    pub tokens: u64,
}

/// Token consumption tracker against a hard cap over a trailing window.
///
/// Reads take `&self` and prune through an internal lock; `record` takes
/// `&mut self` so only the owner (the admission controller) can charge it.
pub struct BudgetLedger {
    hard_cap: u64,
    reserve: u64,
    window: Duration,
    entries: Mutex<VecDeque<LedgerEntry>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for BudgetLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetLedger")
            .field("hard_cap", &self.hard_cap)
            .field("reserve", &self.reserve)
            .field("window", &self.window)
            .field("entries", &self.entries.lock().len())
            .finish_non_exhaustive()
    }
}

impl BudgetLedger {
    /// Create an empty ledger.
    pub fn new(hard_cap: u64, window: Duration, reserve: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            hard_cap,
            reserve,
            window,
            entries: Mutex::new(VecDeque::new()),
            clock,
        }
    }

    /// Hard cap imposed by the external API.
    #[must_use]
    pub const fn hard_cap(&self) -> u64 {
        self.hard_cap
    }

    /// Tokens withheld for the final checkpoint.
    #[must_use]
    pub const fn reserve(&self) -> u64 {
        self.reserve
    }

    /// Trailing window length.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Charge tokens at the current instant.
    pub fn record(&mut self, tokens_in: u64, tokens_out: u64) {
        let tokens = tokens_in.saturating_add(tokens_out);
        if tokens == 0 {
            return;
        }
        let timestamp_ms = self.clock.now_ms();
        self.entries.get_mut().push_back(LedgerEntry {
            timestamp_ms,
            tokens,
        });
        tracing::debug!(tokens, timestamp_ms, "ledger charged");
    }

    /// Tokens charged inside the window.
    #[must_use]
    pub fn used(&self) -> u64 {
        let mut entries = self.entries.lock();
        self.prune(&mut entries);
        entries.iter().fold(0u64, |acc, e| acc.saturating_add(e.tokens))
    }

    /// `hard_cap - used`; negative when an overage pushed past the cap.
    #[must_use]
    pub fn remaining(&self) -> i128 {
        i128::from(self.hard_cap) - i128::from(self.used())
    }

    /// Budget visible to admission: remaining minus the reserve.
    #[must_use]
    pub fn available(&self) -> i128 {
        self.remaining() - i128::from(self.reserve)
    }

    /// [`Self::available`] clamped at zero.
    #[must_use]
    pub fn available_clamped(&self) -> u64 {
        u64::try_from(self.available().max(0)).unwrap_or(u64::MAX)
    }

    /// `remaining / hard_cap` clamped to `[0, 1]`; the only input to tier
    /// selection.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn remaining_ratio(&self) -> f64 {
        if self.hard_cap == 0 {
            return 0.0;
        }
        let ratio = self.remaining() as f64 / self.hard_cap as f64;
        ratio.clamp(0.0, 1.0)
    }

    /// Whether `estimate` fits: `hard_cap - used - reserve >= total`.
    #[must_use]
    pub fn can_run(&self, estimate: &ResourceEstimate) -> bool {
        self.fits(estimate.total_tokens())
    }

    /// Whether `tokens` fit under the available budget.
    #[must_use]
    pub fn fits(&self, tokens: u64) -> bool {
        self.available() >= i128::from(tokens)
    }

    /// In-window entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<LedgerEntry> {
        let mut entries = self.entries.lock();
        self.prune(&mut entries);
        entries.iter().copied().collect()
    }

    /// Withdraw the most recent entry if it is exactly `tokens`. Used to
    /// return a reservation for an item that never started; returns whether
    /// anything was removed.
    pub fn cancel_last(&mut self, tokens: u64) -> bool {
        let entries = self.entries.get_mut();
        if entries.back().is_some_and(|e| e.tokens == tokens) {
            entries.pop_back();
            true
        } else {
            false
        }
    }

    /// Replace the ledger contents from a checkpoint. Entries outside the
    /// window are dropped so an old snapshot cannot resurrect expired spend.
    pub fn restore(&mut self, restored: impl IntoIterator<Item = LedgerEntry>) {
        let mut sorted: Vec<LedgerEntry> = restored.into_iter().collect();
        sorted.sort_by_key(|e| e.timestamp_ms);
        let entries = self.entries.get_mut();
        entries.clear();
        entries.extend(sorted);
        let mut entries = self.entries.lock();
        self.prune(&mut entries);
    }

    fn prune(&self, entries: &mut VecDeque<LedgerEntry>) {
        let now = self.clock.now_ms();
        let window = self.window.as_millis();
        while let Some(front) = entries.front() {
            if is_expired(front.timestamp_ms, now, window) {
                entries.pop_front();
            } else {
                break;
            }
        }
    }
}

/// An entry is expired once its age reaches the window length.
#[must_use]
pub const fn is_expired(timestamp_ms: u128, now_ms: u128, window_ms: u128) -> bool {
    now_ms.saturating_sub(timestamp_ms) >= window_ms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::clock::ManualClock;

    const HOUR: Duration = Duration::from_secs(3600);

    fn ledger(cap: u64, reserve: u64) -> (BudgetLedger, ManualClock) {
        let clock = ManualClock::new(10_000_000_000);
        let ledger = BudgetLedger::new(cap, 5 * HOUR, reserve, Arc::new(clock.clone()));
        (ledger, clock)
    }

    #[test]
    fn used_sums_in_window_entries() {
        let (mut l, _) = ledger(1_000, 100);
        l.record(100, 50);
        l.record(10, 0);
        assert_eq!(l.used(), 160);
        assert_eq!(l.remaining(), 840);
        assert_eq!(l.available(), 740);
    }

    #[test]
    fn entries_age_out_of_window() {
        let (mut l, clock) = ledger(1_000, 0);
        l.record(300, 0);
        clock.advance(3 * HOUR);
        l.record(200, 0);
        clock.advance(2 * HOUR);
        // first entry is exactly one window old now
        assert_eq!(l.used(), 200);
        clock.advance(3 * HOUR);
        assert_eq!(l.used(), 0);
        assert!(l.entries().is_empty());
    }

    #[test]
    fn pruning_never_counts_stale_entries_for_any_sequence() {
        let (mut l, clock) = ledger(u64::MAX / 2, 0);
        let window_ms = l.window().as_millis();
        let mut stamps = Vec::new();
        for step in 0u64..200 {
            let amount = (step * 7919) % 1_000 + 1;
            stamps.push((clock.now_ms(), amount));
            l.record(amount, 0);
            clock.advance(Duration::from_secs((step * 104_729) % 7_200));
            let now = clock.now_ms();
            let expected: u64 = stamps
                .iter()
                .filter(|(ts, _)| !is_expired(*ts, now, window_ms))
                .map(|(_, a)| a)
                .sum();
            assert_eq!(l.used(), expected, "step {step}");
        }
    }

    #[test]
    fn remaining_can_go_negative_but_ratio_is_clamped() {
        let (mut l, _) = ledger(100, 10);
        l.record(150, 0);
        assert_eq!(l.remaining(), -50);
        assert_eq!(l.available_clamped(), 0);
        assert!((l.remaining_ratio() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn can_run_is_the_reserve_adjusted_identity() {
        let (mut l, _) = ledger(200_000, 20_000);
        l.record(120_000, 30_000);
        let cases = [0u64, 1, 29_999, 30_000, 30_001, 200_000];
        for total in cases {
            let est = ResourceEstimate::tokens(total, 0);
            let identity = i128::from(l.hard_cap()) - i128::from(l.used()) - i128::from(l.reserve())
                >= i128::from(est.total_tokens());
            assert_eq!(l.can_run(&est), identity, "total {total}");
        }
        assert!(l.can_run(&ResourceEstimate::tokens(30_000, 0)));
        assert!(!l.can_run(&ResourceEstimate::tokens(30_001, 0)));
    }

    #[test]
    fn restore_drops_expired_entries_and_sorts() {
        let (mut l, clock) = ledger(1_000, 0);
        let now = clock.now_ms();
        let window = l.window().as_millis();
        l.restore(vec![
            LedgerEntry { timestamp_ms: now - 10, tokens: 5 },
            LedgerEntry { timestamp_ms: now - window - 1, tokens: 500 },
            LedgerEntry { timestamp_ms: now - 20, tokens: 7 },
        ]);
        let entries = l.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].tokens, 7);
        assert_eq!(l.used(), 12);
    }

    #[test]
    fn zero_records_are_skipped() {
        let (mut l, _) = ledger(1_000, 0);
        l.record(0, 0);
        assert!(l.entries().is_empty());
    }

    #[test]
    fn cancel_last_only_removes_a_matching_tail() {
        let (mut l, _) = ledger(1_000, 0);
        l.record(100, 0);
        l.record(40, 2);
        assert!(!l.cancel_last(100));
        assert!(l.cancel_last(42));
        assert_eq!(l.used(), 100);
    }
}
