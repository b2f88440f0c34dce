//! Minimum-gap rate limiter between supervisor turns.
//!
//! This is a rate limiter, not a debounce: `mark()` is called *before* the
//! dispatcher call begins, so the bound is on request rate, not round-trip
//! latency — a slow supervisor turn does not buy the next turn a shorter wait.

use std::time::{Duration, Instant};

pub struct Cooldown {
    min_gap: Duration,
    last_mark: Option<Instant>,
}

impl Cooldown {
    pub fn new(min_gap: Duration) -> Self {
        Self {
            min_gap,
            last_mark: None,
        }
    }

    pub fn can_proceed(&self) -> bool {
        match self.last_mark {
            None => true,
            Some(t) => t.elapsed() >= self.min_gap,
        }
    }

    pub fn remaining(&self) -> Duration {
        match self.last_mark {
            None => Duration::ZERO,
            Some(t) => self.min_gap.saturating_sub(t.elapsed()),
        }
    }

    pub fn mark(&mut self) {
        self.last_mark = Some(Instant::now());
    }

    pub fn reset(&mut self) {
        self.last_mark = None;
    }
}
