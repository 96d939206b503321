use std::time::Duration;

use rand::{Rng, RngCore};

/// Delay schedule for status polling. Waits start at `base`, double after
/// every poll and stop growing at `cap`.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
    /// Adds up to `delay / jitter_divisor` of random spread so pollers for
    /// batches submitted together drift apart. Zero disables it.
    pub jitter_divisor: u32,
}

impl BackoffConfig {
    /// Delay before poll number `polls + 1`, without jitter.
    pub fn delay_after(&self, polls: u32) -> Duration {
        let factor = 1u32.checked_shl(polls).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Per-batch polling state; one is created for every batch awaiting
/// confirmation.
#[derive(Debug)]
pub struct PollBackoff<R> {
    cfg: BackoffConfig,
    polls: u32,
    rng: R,
}

impl<R: RngCore> PollBackoff<R> {
    pub fn new(cfg: BackoffConfig, rng: R) -> Self {
        Self { cfg, polls: 0, rng }
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.cfg.delay_after(self.polls);
        self.polls = self.polls.saturating_add(1);

        if self.cfg.jitter_divisor == 0 {
            return delay;
        }
        let spread = delay / self.cfg.jitter_divisor;
        if spread.is_zero() {
            return delay;
        }
        let jitter = self.rng.gen_range(Duration::ZERO..=spread);
        (delay + jitter).min(self.cfg.cap)
    }
}
