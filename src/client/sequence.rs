use ethers::types::Address;
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use crate::error::LedgerError;
use crate::services::ledger::LedgerClient;

#[derive(Debug, Default)]
struct Sequence {
    next: Option<u64>,
    /// Claimed and not yet answered by the ledger.
    in_flight: BTreeSet<u64>,
    /// Below `next`, not in flight, and known to be unused on the ledger.
    released: BTreeSet<u64>,
}

impl Sequence {
    fn take(&mut self) -> Option<u64> {
        let claimed = match self.released.pop_first() {
            Some(reused) => reused,
            None => {
                let fresh = self.next?;
                self.next = Some(fresh + 1);
                fresh
            }
        };
        self.in_flight.insert(claimed);
        Some(claimed)
    }
}

/// Locally tracked nonces for one account.
///
/// Several workers share one counter. Every claim reads and bumps the state
/// under one synchronous lock with no await in between, and a number stays
/// reserved until its holder reports back, so no two claims return the same
/// number. `next == None` means "unknown, ask the ledger".
#[derive(Debug, Default)]
pub struct SequenceCounter {
    state: Mutex<Sequence>,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Sequence> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn peek(&self) -> Option<u64> {
        self.lock().next
    }

    /// Takes the lowest released number, else the next fresh one, if the
    /// counter is initialized.
    pub fn claim(&self) -> Option<u64> {
        self.lock().take()
    }

    /// Takes the next number, reading the ledger's pending count first if the
    /// counter is uninitialized.
    pub async fn claim_or_init(
        &self,
        ledger: &dyn LedgerClient,
        account: Address,
    ) -> Result<u64, LedgerError> {
        if let Some(claimed) = self.claim() {
            return Ok(claimed);
        }
        let pending = ledger.get_nonce(account).await?;
        Ok(self.init_and_claim(pending))
    }

    fn init_and_claim(&self, pending: u64) -> u64 {
        let mut state = self.lock();
        // Another worker may have initialized it while we were reading the ledger.
        let next = *state.next.get_or_insert(pending);
        state.take().unwrap_or(next)
    }

    /// True while a number below `nonce` is claimed and unanswered, i.e. a
    /// "nonce too high" for `nonce` may just be a sibling that has not sent yet.
    pub fn has_in_flight_below(&self, nonce: u64) -> bool {
        self.lock().in_flight.range(..nonce).next().is_some()
    }

    /// The ledger took `nonce`.
    pub fn complete(&self, nonce: u64) {
        self.lock().in_flight.remove(&nonce);
    }

    /// The ledger already holds `nonce` from another transaction; stop
    /// tracking it without handing it out again.
    pub fn forget(&self, nonce: u64) {
        self.lock().in_flight.remove(&nonce);
    }

    /// Gives back `nonce` after a submission the ledger did not take. The
    /// next claim reuses it, so a rejected send does not leave a gap.
    pub fn rollback(&self, nonce: u64) {
        let mut state = self.lock();
        if !state.in_flight.remove(&nonce) {
            return;
        }
        state.released.insert(nonce);
        while let Some(next) = state.next {
            match next.checked_sub(1) {
                Some(top) if state.released.remove(&top) => state.next = Some(top),
                _ => break,
            }
        }
    }

    /// Reconciles with the ledger's authoritative pending count. Numbers that
    /// are still in flight stay reserved. Every other number from `pending`
    /// up to the local counter was never used and is handed out again.
    pub fn resync(&self, pending: u64) {
        let mut state = self.lock();
        let next = match state.next {
            Some(next) if !state.in_flight.is_empty() && pending < next => next,
            _ => {
                state.next = Some(pending);
                state.released.clear();
                state.in_flight.retain(|n| *n >= pending);
                return;
            }
        };
        let unused: Vec<u64> = (pending..next)
            .filter(|n| !state.in_flight.contains(n))
            .collect();
        state.released = state.released.split_off(&pending);
        state.released.extend(unused);
    }

    /// Moves the counter up to `pending` without ever moving it back, so
    /// numbers already handed to other workers are not issued twice.
    pub fn advance_to(&self, pending: u64) {
        let mut state = self.lock();
        state.next = Some(state.next.map_or(pending, |n| n.max(pending)));
        state.released = state.released.split_off(&pending);
    }

    pub fn reset(&self) {
        *self.lock() = Sequence::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ledger::InMemoryLedger;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_claim_increments() {
        let counter = SequenceCounter::new();
        assert_eq!(counter.claim(), None);
        counter.resync(7);
        assert_eq!(counter.claim(), Some(7));
        assert_eq!(counter.claim(), Some(8));
        assert_eq!(counter.peek(), Some(9));
    }

    #[test]
    fn test_rollback_rewinds_latest_claim() {
        let counter = SequenceCounter::new();
        counter.resync(3);
        let a = counter.claim().unwrap();
        counter.rollback(a);
        assert_eq!(counter.peek(), Some(3));
        assert_eq!(counter.claim(), Some(3));
    }

    #[test]
    fn test_rollback_under_later_claim_is_reused() {
        let counter = SequenceCounter::new();
        counter.resync(3);
        let a = counter.claim().unwrap();
        let b = counter.claim().unwrap();
        counter.rollback(a);
        assert_eq!(counter.peek(), Some(5));

        assert_eq!(counter.claim(), Some(a));
        assert_eq!(counter.claim(), Some(5));

        // Rolling back a number twice, or one never claimed, changes nothing.
        counter.complete(b);
        counter.rollback(b);
        counter.rollback(42);
        assert_eq!(counter.claim(), Some(6));
    }

    #[test]
    fn test_rollback_collapses_released_tail() {
        let counter = SequenceCounter::new();
        counter.resync(0);
        let a = counter.claim().unwrap();
        let b = counter.claim().unwrap();
        let c = counter.claim().unwrap();
        counter.rollback(b);
        counter.rollback(c);
        assert_eq!(counter.peek(), Some(1));
        counter.complete(a);
        assert_eq!(counter.claim(), Some(1));
    }

    #[test]
    fn test_resync_keeps_outstanding_claims_reserved() {
        let counter = SequenceCounter::new();
        counter.resync(7);
        let seven = counter.claim().unwrap();
        let eight = counter.claim().unwrap();
        let nine = counter.claim().unwrap();
        assert_eq!((seven, eight, nine), (7, 8, 9));

        // 9 was refused as too high while 7 and 8 are still on their way.
        counter.forget(nine);
        counter.resync(7);
        assert!(counter.has_in_flight_below(9));
        assert_eq!(counter.claim(), Some(9));
        assert_eq!(counter.claim(), Some(10));
    }

    #[test]
    fn test_resync_with_nothing_outstanding_overwrites() {
        let counter = SequenceCounter::new();
        counter.resync(5);
        let n = counter.claim().unwrap();
        counter.forget(n);
        counter.resync(0);
        assert_eq!(counter.peek(), Some(0));
        assert_eq!(counter.claim(), Some(0));
        assert!(!counter.has_in_flight_below(0));
    }

    #[test]
    fn test_advance_never_rewinds() {
        let counter = SequenceCounter::new();
        counter.advance_to(4);
        assert_eq!(counter.peek(), Some(4));
        counter.advance_to(2);
        assert_eq!(counter.peek(), Some(4));
        counter.advance_to(9);
        assert_eq!(counter.peek(), Some(9));
    }

    #[test]
    fn test_advance_drops_released_numbers_below_pending() {
        let counter = SequenceCounter::new();
        counter.resync(0);
        let a = counter.claim().unwrap();
        let _b = counter.claim().unwrap();
        counter.rollback(a);

        counter.advance_to(2);
        assert_eq!(counter.claim(), Some(2));
    }

    #[tokio::test]
    async fn test_init_reads_ledger_once() {
        let ledger = InMemoryLedger::new();
        let counter = SequenceCounter::new();
        let account = Address::repeat_byte(9);

        assert_eq!(assert_ok!(counter.claim_or_init(&ledger, account).await), 0);
        ledger.set_unavailable(true);
        assert_eq!(assert_ok!(counter.claim_or_init(&ledger, account).await), 1);

        counter.reset();
        assert_err!(counter.claim_or_init(&ledger, account).await);
    }

    #[test]
    fn test_concurrent_claims_are_unique_and_contiguous() {
        let counter = Arc::new(SequenceCounter::new());
        counter.resync(100);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    (0..500).filter_map(|_| counter.claim()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for n in handle.join().unwrap() {
                assert!(seen.insert(n), "nonce {} claimed twice", n);
            }
        }
        assert_eq!(seen.len(), 4000);
        assert_eq!(seen.iter().min(), Some(&100));
        assert_eq!(seen.iter().max(), Some(&4099));
    }
}
