//! A small `Rng` seam so the mutator and schedulers depend on a trait object
//! rather than a concrete generator. Backed by Xoshiro256++ so the `-s`
//! CLI flag can reproduce a run bit-for-bit.

use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

pub trait Rng {
    /// Uniform integer in `[0, bound)`. Panics if `bound == 0`.
    fn below(&mut self, bound: u64) -> u64;

    fn below_usize(&mut self, bound: usize) -> usize {
        self.below(bound as u64) as usize
    }

    /// `true` with probability `num / den`.
    fn chance(&mut self, num: u64, den: u64) -> bool {
        self.below(den) < num
    }

    fn next_u32(&mut self) -> u32;

    fn next_f64(&mut self) -> f64 {
        (self.next_u32() as f64) / (u32::MAX as f64 + 1.0)
    }
}

pub struct Xoshiro {
    inner: Xoshiro256PlusPlus,
}

impl Xoshiro {
    pub fn from_seed(seed: u64) -> Self {
        Self {
            inner: Xoshiro256PlusPlus::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            inner: Xoshiro256PlusPlus::from_entropy(),
        }
    }
}

impl Rng for Xoshiro {
    fn below(&mut self, bound: u64) -> u64 {
        assert!(bound > 0, "below() requires a positive bound");
        self.inner.next_u64() % bound
    }

    fn next_u32(&mut self) -> u32 {
        self.inner.next_u32()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_reproduces_sequence() {
        let mut a = Xoshiro::from_seed(42);
        let mut b = Xoshiro::from_seed(42);
        for _ in 0..100 {
            assert_eq!(a.below(1000), b.below(1000));
        }
    }

    #[test]
    fn below_respects_bound() {
        let mut r = Xoshiro::from_seed(1);
        for _ in 0..1000 {
            assert!(r.below(7) < 7);
        }
    }
}
