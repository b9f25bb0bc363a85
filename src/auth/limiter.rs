// Copyright 2026 The OnGarde Project
// SPDX-License-Identifier: Apache-2.0

// Sliding-window rate limiter for key-management endpoints. All dashboard
// traffic is loopback-only, so this is effectively a local abuse cap rather
// than a multi-tenant fairness mechanism.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Key-management operations allowed per source IP per window.
pub const KEY_MANAGEMENT_LIMIT: usize = 20;

/// Window length.
pub const KEY_MANAGEMENT_WINDOW: Duration = Duration::from_secs(60);

pub struct RateLimiter {
    max: usize,
    window: Duration,
    hits: Mutex<HashMap<IpAddr, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    pub fn key_management() -> Self {
        Self::new(KEY_MANAGEMENT_LIMIT, KEY_MANAGEMENT_WINDOW)
    }

    /// Record an attempt from `ip`; returns false when over the limit.
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock().unwrap();
        let bucket = hits.entry(ip).or_default();
        bucket.retain(|t| now.duration_since(*t) < self.window);
        if bucket.len() >= self.max {
            return false;
        }
        bucket.push(now);
        true
    }
}
