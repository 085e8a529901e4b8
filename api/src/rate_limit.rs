// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use shutter_config::RateLimitConfig;
use std::{
    collections::HashMap,
    net::IpAddr,
    sync::Mutex,
    time::{Duration, Instant},
};

// Bound on tracked clients before stale windows are swept out.
const SWEEP_THRESHOLD: usize = 10_000;

struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window request counter per client IP. Clients without a
/// resolvable address are not limited.
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    state: Mutex<HashMap<IpAddr, Window>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            max_requests: config.max_requests,
            window: config.window,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// True when the request is within budget.
    pub fn check(&self, ip: Option<IpAddr>) -> bool {
        let ip = match ip {
            Some(ip) => ip,
            None => return true,
        };
        let now = Instant::now();
        let mut state = self.state.lock().expect("lock poisoned");
        if state.len() > SWEEP_THRESHOLD {
            let window = self.window;
            state.retain(|_, w| now.duration_since(w.started) < window);
        }
        let slot = state.entry(ip).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(slot.started) >= self.window {
            slot.started = now;
            slot.count = 0;
        }
        slot.count += 1;
        slot.count <= self.max_requests
    }
}
