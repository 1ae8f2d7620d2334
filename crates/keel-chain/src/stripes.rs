//! Hash-sharded mutexes for pool admission.
//!
//! Admitting a transaction locks the stripe of its own hash and the stripes
//! of every parent it spends, always in ascending stripe order. Two
//! admissions touching the same output record therefore serialize, while
//! unrelated admissions run in parallel.

use parking_lot::{Mutex, MutexGuard};

use keel_core::types::Hash256;

pub struct LockStripes {
    stripes: Vec<Mutex<()>>,
}

/// Held stripes. Released on drop.
pub struct StripeGuard<'a> {
    _guards: Vec<MutexGuard<'a, ()>>,
}

impl LockStripes {
    /// `count` is clamped to at least one stripe.
    pub fn new(count: usize) -> Self {
        Self {
            stripes: (0..count.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.stripes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stripes.is_empty()
    }

    pub fn stripe_of(&self, hash: &Hash256) -> usize {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&hash.as_bytes()[..8]);
        (u64::from_le_bytes(prefix) % self.stripes.len() as u64) as usize
    }

    /// Lock the stripes of all `hashes`, deduplicated, lowest index first.
    pub fn lock_all<'h>(&self, hashes: impl IntoIterator<Item = &'h Hash256>) -> StripeGuard<'_> {
        let mut indices: Vec<usize> = hashes.into_iter().map(|h| self.stripe_of(h)).collect();
        indices.sort_unstable();
        indices.dedup();
        StripeGuard {
            _guards: indices.into_iter().map(|i| self.stripes[i].lock()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn clamps_to_one_stripe() {
        let stripes = LockStripes::new(0);
        assert_eq!(stripes.len(), 1);
        assert_eq!(stripes.stripe_of(&Hash256([0xFF; 32])), 0);
    }

    #[test]
    fn duplicate_hashes_do_not_self_deadlock() {
        let stripes = LockStripes::new(4);
        let h = Hash256([3; 32]);
        let _guard = stripes.lock_all([&h, &h, &h]);
    }

    #[test]
    fn overlapping_sets_serialize_without_deadlock() {
        let stripes = Arc::new(LockStripes::new(16));
        let a = Hash256([1; 32]);
        let b = Hash256([2; 32]);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let stripes = Arc::clone(&stripes);
                thread::spawn(move || {
                    for _ in 0..200 {
                        // Opposite argument orders across threads.
                        let _g = if i % 2 == 0 {
                            stripes.lock_all([&a, &b])
                        } else {
                            stripes.lock_all([&b, &a])
                        };
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    // --- proptest ---

    proptest! {
        #[test]
        fn stripe_index_in_range(count in 1usize..4096, bytes in any::<[u8; 32]>()) {
            let stripes = LockStripes::new(count);
            prop_assert!(stripes.stripe_of(&Hash256(bytes)) < count);
        }

        #[test]
        fn lock_all_accepts_any_hash_set(seeds in proptest::collection::vec(any::<u8>(), 0..16)) {
            let stripes = LockStripes::new(8);
            let hashes: Vec<Hash256> = seeds.iter().map(|s| Hash256([*s; 32])).collect();
            let _guard = stripes.lock_all(hashes.iter());
        }
    }
}
