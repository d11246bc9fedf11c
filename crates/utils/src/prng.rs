//! Seedable pseudo-random service backing every nondeterministic decision
//! in the obfuscation passes.
//!
//! A single [`Prng`] is built at startup and threaded through each pass, so
//! a run is reproducible from its seed alone. When no seed is supplied the
//! generator seeds itself lazily from the wall clock on first use and logs
//! the derived seed so the run can be replayed.

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Reproducible source of random integers and probabilities.
#[derive(Debug, Default)]
pub struct Prng {
    eng: Option<StdRng>,
}

impl Prng {
    /// Creates a generator that will seed itself from the wall clock on
    /// first use.
    pub const fn unseeded() -> Self {
        Self { eng: None }
    }

    /// Creates a generator seeded with `seed`.
    pub fn seeded(seed: u64) -> Self {
        let mut prng = Self::unseeded();
        prng.seed(Some(seed));
        prng
    }

    /// (Re-)seeds the generator. With `None`, the seed derives from the
    /// current time at millisecond resolution and is logged.
    pub fn seed(&mut self, seed: Option<u64>) {
        let seed = match seed {
            Some(seed) => {
                tracing::info!("prng seeded with {seed}");
                seed
            }
            None => {
                let ms = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or_default();
                tracing::info!("prng seeded from current timestamp: {ms}");
                ms
            }
        };
        self.eng = Some(StdRng::seed_from_u64(seed));
    }

    fn engine(&mut self) -> &mut StdRng {
        if self.eng.is_none() {
            self.seed(None);
        }
        self.eng.as_mut().expect("generator was just seeded")
    }

    fn raw(&mut self) -> u64 {
        self.engine().next_u64()
    }

    /// Returns a uniformly distributed value in `[min, max)`.
    ///
    /// `max == 0` is a degenerate range, not an error: the result is `0`.
    pub fn next_in_range(&mut self, min: u32, max: u32) -> u32 {
        if max == 0 {
            return 0;
        }
        self.engine().random_range(min..max)
    }

    pub fn next_u8(&mut self) -> u8 {
        self.raw() as u8
    }

    pub fn next_u16(&mut self) -> u16 {
        self.raw() as u16
    }

    pub fn next_u32(&mut self) -> u32 {
        self.raw() as u32
    }

    pub fn next_u64(&mut self) -> u64 {
        self.raw()
    }

    /// Memoized draw: returns the value previously associated with `key` in
    /// `memo`, drawing, storing and returning a fresh one otherwise. Gives a
    /// stable pseudo-random mapping over a key domain without recomputation.
    pub fn scramble32(&mut self, key: u32, memo: &mut HashMap<u32, u32>) -> u32 {
        if let Some(&v) = memo.get(&key) {
            return v;
        }
        let v = self.next_u32();
        memo.insert(key, v);
        v
    }
}
