use rand::seq::{IndexedRandom, SliceRandom};
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::crypto::Digest;

/// Seeded source of every random choice a simulation makes.
///
/// Runs with the same seed draw the same numbers in the same order, which is
/// what makes a failing seed replayable.
#[derive(Clone, Debug)]
pub struct SimRandom {
    rng: ChaCha8Rng,
}

impl SimRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Uniform in `[min, max]`.
    pub fn integer(&mut self, min: u64, max: u64) -> u64 {
        if min >= max {
            return min;
        }
        self.rng.random_range(min..=max)
    }

    /// NaN counts as never.
    pub fn chance(&mut self, probability: f64) -> bool {
        if probability.is_nan() {
            return false;
        }
        self.rng.random_bool(probability.clamp(0.0, 1.0))
    }

    /// `count` distinct items in random order (all of them if there are fewer).
    pub fn sample<T: Clone>(&mut self, items: &[T], count: usize) -> Vec<T> {
        items
            .choose_multiple(&mut self.rng, count)
            .cloned()
            .collect()
    }

    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.rng);
    }

    pub fn digest(&mut self) -> Digest {
        let mut bytes = [0u8; 32];
        self.rng.fill_bytes(&mut bytes);
        Digest(bytes)
    }
}
