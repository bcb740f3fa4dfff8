//! Byte-based allocation sampling.
//!
//! Every thread keeps a countdown of bytes left until its next sample. The
//! countdown is drawn from an exponential distribution whose mean is the
//! configured sample period, so on average one allocation is recorded for every
//! `period` bytes allocated, and large allocations are proportionally more
//! likely to be picked.
//!
//! This path runs inside the allocator: it neither allocates nor locks.

use std::{
    cell::Cell,
    f64::consts::LN_2,
    sync::atomic::{AtomicU64, Ordering},
};

// 48-bit linear congruential generator (drand48 constants).
const PRNG_MOD_POWER: u32 = 48;
const PRNG_MOD_MASK: u64 = (1 << PRNG_MOD_POWER) - 1;
const PRNG_MULT: u64 = 0x5_DEEC_E66D;
const PRNG_ADD: u64 = 0xB;

/// Number of random bits fed into the exponential draw.
const RANDOM_BITS: u32 = 26;

/// Per-thread sampling state.
#[derive(Debug, Clone, Copy)]
pub struct Sampler {
    period: u64,
    bytes_until_sample: u64,
    rnd: u64,
}

impl Sampler {
    /// Create a sampler with a fresh seed.
    pub fn new(period: u64) -> Self {
        Self::with_seed(period, next_seed())
    }

    /// Create a sampler from an explicit seed, mostly useful for deterministic tests.
    pub fn with_seed(period: u64, seed: u64) -> Self {
        let mut sampler = Self {
            period,
            bytes_until_sample: 0,
            rnd: seed & PRNG_MOD_MASK,
        };

        sampler.bytes_until_sample = sampler.pick_next_sampling_point();

        sampler
    }

    /// The mean number of bytes between two samples.
    #[inline]
    pub fn period(&self) -> u64 {
        self.period
    }

    /// Account `size` bytes and return true if this allocation should be recorded.
    #[inline]
    pub fn should_sample(&mut self, size: usize) -> bool {
        if self.period == 0 {
            return true;
        }

        let size = size as u64;

        if self.bytes_until_sample <= size {
            self.bytes_until_sample = self.pick_next_sampling_point();
            true
        } else {
            self.bytes_until_sample -= size;
            false
        }
    }

    /// Draw the next countdown from an exponential distribution with mean `period`.
    ///
    /// With `q` uniform in `[1, 2^26]`, `-ln(q / 2^26)` is exponentially
    /// distributed with mean 1, so the result never exceeds `26 * ln2 * period + 1`.
    /// Periods too large for that bound saturate at `u64::MAX`.
    fn pick_next_sampling_point(&mut self) -> u64 {
        if self.period == 0 {
            return 0;
        }

        self.rnd = next_random(self.rnd);

        let q = ((self.rnd >> (PRNG_MOD_POWER - RANDOM_BITS)) as u32) + 1;
        let log_val = f64::from(q).log2() - f64::from(RANDOM_BITS);

        // float to int casts saturate.
        let countdown = (log_val.min(0.0) * -(LN_2 * self.period as f64)) as u64;

        countdown.saturating_add(1)
    }
}

#[inline]
fn next_random(rnd: u64) -> u64 {
    PRNG_MULT.wrapping_mul(rnd).wrapping_add(PRNG_ADD) & PRNG_MOD_MASK
}

/// Distinct seed per sampler, spread with splitmix64.
fn next_seed() -> u64 {
    static SEED: AtomicU64 = AtomicU64::new(0x2545_F491_4F6C_DD1D);

    let mut z = SEED.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

thread_local! {
    static THREAD_SAMPLER: Cell<Option<Sampler>> = const { Cell::new(None) };
}

/// Run the calling thread's sampler for an allocation of `size` bytes.
///
/// The thread state is (re)initialized lazily whenever `period` differs from
/// the one it was drawn for, so a new rate only affects fresh countdowns.
/// Once the thread-local storage is torn down only `period == 0` still samples.
#[inline]
pub fn sample_current_thread(period: u64, size: usize) -> bool {
    if period == 0 {
        return true;
    }

    THREAD_SAMPLER
        .try_with(|cell| {
            let mut sampler = match cell.get() {
                Some(sampler) if sampler.period == period => sampler,
                _ => Sampler::new(period),
            };

            let sampled = sampler.should_sample(size);

            cell.set(Some(sampler));

            sampled
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_period_samples_everything() {
        let mut sampler = Sampler::with_seed(0, 1);

        for size in [0, 1, 16, 4096] {
            assert!(sampler.should_sample(size));
        }

        assert!(sample_current_thread(0, 1));
    }

    #[test]
    fn countdown_never_exceeds_bound() {
        let period = 1024;
        let bound = (f64::from(RANDOM_BITS) * LN_2 * period as f64) as u64 + 1;

        for seed in 0..1000 {
            let sampler = Sampler::with_seed(period, seed);
            assert!(sampler.bytes_until_sample >= 1);
            assert!(sampler.bytes_until_sample <= bound);
        }
    }

    #[test]
    fn allocations_larger_than_bound_always_sample() {
        let period = 512;
        let mut sampler = Sampler::with_seed(period, 42);

        for _ in 0..1000 {
            assert!(sampler.should_sample(period as usize * 20));
        }
    }

    #[test]
    fn sample_count_tracks_mean_period() {
        let period = 1024;
        let allocations = 100_000;
        let size = 16;
        let mut sampler = Sampler::with_seed(period, 7);

        let sampled = (0..allocations)
            .filter(|_| sampler.should_sample(size))
            .count();

        // Expected about 100_000 * 16 / 1024 = 1562.
        assert!(sampled > 1000, "too few samples: {sampled}");
        assert!(sampled < 2200, "too many samples: {sampled}");
    }

    #[test]
    fn thread_state_follows_period_change() {
        let large = 1 << 30;

        assert!(sample_current_thread(64, large));

        THREAD_SAMPLER.with(|cell| assert_eq!(cell.get().map(|s| s.period()), Some(64)));

        assert!(sample_current_thread(128, large));

        THREAD_SAMPLER.with(|cell| assert_eq!(cell.get().map(|s| s.period()), Some(128)));
    }

    #[test]
    fn huge_period_does_not_overflow() {
        for seed in 0..64 {
            let mut sampler = Sampler::with_seed(u64::MAX, seed);

            assert!(sampler.bytes_until_sample >= 1);

            for _ in 0..16 {
                sampler.should_sample(16);
            }

            // always sampled, so the countdown is redrawn.
            assert!(sampler.should_sample(usize::MAX));
        }

        for _ in 0..16 {
            sample_current_thread(u64::MAX, 16);
        }
    }

    #[test]
    fn seeds_differ_between_samplers() {
        let a = next_seed();
        let b = next_seed();

        assert_ne!(a, b);
    }
}
