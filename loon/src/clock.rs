// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Time source of the broker.
///
/// Keepalive and retry bookkeeping use the monotonic reading; message and
/// session expiry compare against wall time. Feeding a manual clock makes
/// every timeout testable without sleeping.
pub trait Clock: Send + Sync {
    /// Seconds from an arbitrary fixed origin, never going backwards.
    fn monotonic_secs(&self) -> u64;

    /// Seconds since the unix epoch.
    fn wall_secs(&self) -> u64;
}

/// The real clocks.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic_secs(&self) -> u64 {
        self.origin.elapsed().as_secs()
    }

    fn wall_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs())
    }
}

/// A clock advanced by hand, for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    monotonic: AtomicU64,
    wall: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub fn new(wall_secs: u64) -> Self {
        Self {
            monotonic: AtomicU64::new(0),
            wall: AtomicU64::new(wall_secs),
        }
    }

    /// Move both clocks forward by `secs`.
    pub fn advance(&self, secs: u64) {
        self.monotonic.fetch_add(secs, Ordering::SeqCst);
        self.wall.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn monotonic_secs(&self) -> u64 {
        self.monotonic.load(Ordering::SeqCst)
    }

    fn wall_secs(&self) -> u64 {
        self.wall.load(Ordering::SeqCst)
    }
}
