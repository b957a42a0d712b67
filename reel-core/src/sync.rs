//! Playback clock
//!
//! Video is the only stream, so the master clock is the wall clock: media
//! time is the time elapsed since playback started.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

pub struct PlaybackClock {
    origin: Instant,
    last_tick_us: AtomicI64,
    ticks: AtomicU64,
}

impl PlaybackClock {
    pub fn start() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(origin: Instant) -> Self {
        Self {
            origin,
            last_tick_us: AtomicI64::new(0),
            ticks: AtomicU64::new(0),
        }
    }

    /// Microseconds of media time at `now`
    pub fn media_time_us_at(&self, now: Instant) -> i64 {
        now.saturating_duration_since(self.origin).as_micros().min(i64::MAX as u128) as i64
    }

    /// Advance one render tick and return its media time
    pub fn tick(&self) -> i64 {
        let now_us = self.media_time_us_at(Instant::now());
        self.last_tick_us.store(now_us, Ordering::Release);
        self.ticks.fetch_add(1, Ordering::Relaxed);
        now_us
    }

    pub fn last_tick_us(&self) -> i64 {
        self.last_tick_us.load(Ordering::Acquire)
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}
