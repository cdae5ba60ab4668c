//! A fast per-worker PRNG used only for randomized tie-breaking: picking the
//! starting point of the assignable-queue scan and the victim rotation order
//! when stealing.

use std::cell::Cell;
use std::hash::{BuildHasher, RandomState};
use std::sync::atomic::{AtomicUsize, Ordering};

const FIXED_STATE: u64 = 0x9a7013f475bb8c23;

/// [xorshift*] is a fast pseudorandom number generator which will even
/// tolerate weak seeding, as long as it's not zero.
///
/// [xorshift*]: https://en.wikipedia.org/wiki/Xorshift#xorshift*
pub(crate) struct XorShift64Star {
    state: Cell<u64>,
}

impl XorShift64Star {
    /// Returns a generator with a fixed seed, suitable for `const` initializers.
    /// Call [`Self::randomize`] once the owning thread is known.
    #[inline(always)]
    pub(crate) const fn fixed() -> Self {
        Self { state: Cell::new(FIXED_STATE) }
    }

    /// Reseeds from a process-wide counter, so that distinct workers don't all
    /// scan in lock-step.
    pub(crate) fn randomize(&self) {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        let mut seed = 0;
        let rs = RandomState::new();
        while seed == 0 {
            seed = rs.hash_one(COUNTER.fetch_add(1, Ordering::Relaxed));
        }

        self.state.set(seed);
    }

    fn next(&self) -> u64 {
        let mut x = self.state.get();
        debug_assert_ne!(x, 0);
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state.set(x);
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    /// Returns a value uniformly distributed over `0..n`. `n == 0` returns `0`.
    pub(crate) fn next_usize(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        (self.next() % n as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::XorShift64Star;

    #[test]
    fn stays_in_range() {
        let rng = XorShift64Star::fixed();
        rng.randomize();
        for _ in 0..1000 {
            assert!(rng.next_usize(7) < 7);
        }
    }

    #[test]
    fn zero_bound_is_zero() {
        let rng = XorShift64Star::fixed();
        assert_eq!(rng.next_usize(0), 0);
    }
}
