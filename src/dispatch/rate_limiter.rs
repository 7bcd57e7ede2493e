//! Randomized inter-send delay.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{RateLimitBounds, RuntimeSettings};

impl RateLimitBounds {
    /// Draw a delay uniformly from `[min, max]` at millisecond resolution.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let low = self.min_seconds() * 1000;
        let high = self.max_seconds() * 1000;
        Duration::from_millis(rng.gen_range(low..=high))
    }
}

/// Per-run delay source. Each run owns one, so runs never share RNG state.
pub struct RateLimiter {
    settings: Arc<RuntimeSettings>,
    rng: StdRng,
}

impl RateLimiter {
    pub fn new(settings: Arc<RuntimeSettings>) -> Self {
        Self {
            settings,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic limiter for tests.
    pub fn with_seed(settings: Arc<RuntimeSettings>, seed: u64) -> Self {
        Self {
            settings,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Next gap, read against the bounds in effect right now.
    pub async fn next_delay(&mut self) -> Duration {
        let bounds = self.settings.rate_limits().await;
        bounds.sample(&mut self.rng)
    }
}
