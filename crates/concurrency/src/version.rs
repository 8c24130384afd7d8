//! Optimistic-lock primitive.

use std::sync::atomic::{AtomicU64, Ordering};

use stockledger_core::{DomainError, DomainResult};

/// Monotonic version number with compare-and-advance semantics.
///
/// This holds no lock. It turns an interleaved write into a detectable,
/// retryable conflict: read the version with the data, mutate, then call
/// [`check_and_update`](Self::check_and_update) right before committing.
/// Versions only move forward, so a stale expectation can never match again.
#[derive(Debug)]
pub struct VersionedCounter {
    version: AtomicU64,
}

impl VersionedCounter {
    /// Version assigned to freshly created state.
    pub const INITIAL: u64 = 1;

    pub fn new() -> Self {
        Self::starting_at(Self::INITIAL)
    }

    pub fn starting_at(version: u64) -> Self {
        Self {
            version: AtomicU64::new(version),
        }
    }

    pub fn current_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Advance the version by one iff it still equals `expected`.
    ///
    /// Returns `false` without mutating when another writer got there first.
    pub fn check_and_update(&self, expected: u64) -> bool {
        let Some(next) = expected.checked_add(1) else {
            return false;
        };
        self.version
            .compare_exchange(expected, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Like [`check_and_update`](Self::check_and_update) but reports the
    /// committed version, or a `VersionConflict` carrying the observed one.
    pub fn advance_from(&self, expected: u64) -> DomainResult<u64> {
        if self.check_and_update(expected) {
            Ok(expected + 1)
        } else {
            Err(DomainError::version_conflict(
                expected,
                Some(self.current_version()),
            ))
        }
    }
}

impl Default for VersionedCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::{Arc, Barrier};

    #[test]
    fn starts_at_one_and_advances_on_match() {
        let counter = VersionedCounter::new();
        assert_eq!(counter.current_version(), 1);
        assert!(counter.check_and_update(1));
        assert_eq!(counter.current_version(), 2);
    }

    #[test]
    fn stale_expectation_is_rejected_without_mutation() {
        let counter = VersionedCounter::starting_at(7);
        assert!(!counter.check_and_update(6));
        assert_eq!(counter.current_version(), 7);

        let err = counter.advance_from(3).unwrap_err();
        assert_eq!(err, DomainError::version_conflict(3, Some(7)));
    }

    #[test]
    fn saturated_version_never_matches() {
        let counter = VersionedCounter::starting_at(u64::MAX);
        assert!(!counter.check_and_update(u64::MAX));
        assert_eq!(counter.current_version(), u64::MAX);
    }

    #[test]
    fn concurrent_writers_with_same_expectation_exactly_one_wins() {
        for _ in 0..50 {
            let counter = Arc::new(VersionedCounter::starting_at(7));
            let barrier = Arc::new(Barrier::new(2));

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let counter = counter.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        counter.check_and_update(7)
                    })
                })
                .collect();

            let wins = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();

            assert_eq!(wins, 1);
            assert_eq!(counter.current_version(), 8);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: the version only ever moves forward, one step per successful check.
        #[test]
        fn version_is_monotonic(expectations in prop::collection::vec(0u64..20, 1..50)) {
            let counter = VersionedCounter::new();
            let mut successes = 0u64;
            for expected in expectations {
                let before = counter.current_version();
                let won = counter.check_and_update(expected);
                let after = counter.current_version();
                prop_assert_eq!(won, before == expected);
                prop_assert_eq!(after, if won { before + 1 } else { before });
                if won {
                    successes += 1;
                }
            }
            prop_assert_eq!(counter.current_version(), VersionedCounter::INITIAL + successes);
        }
    }
}
