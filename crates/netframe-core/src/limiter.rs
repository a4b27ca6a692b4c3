//! Per-IP connection admission control.
//!
//! Tracks an active-connection count per IP and a running total, refusing
//! admission once either configured ceiling is reached. `Close` decrements
//! and never underflows; entries that drop to zero are eligible for
//! garbage collection but aren't eagerly removed (the next `Admit` for that
//! IP just reuses the zeroed entry).

use std::{
    net::IpAddr,
    sync::atomic::{AtomicU32, Ordering},
};

use dashmap::DashMap;

/// Configuration for a [`ConnectionLimiter`].
#[derive(Debug, Clone, Copy)]
pub struct LimiterConfig {
    /// Maximum concurrent connections from a single IP.
    pub max_per_ip: u32,
    /// Maximum concurrent connections across all IPs.
    pub max_total: u32,
}

/// Per-IP and aggregate connection admission control.
pub struct ConnectionLimiter {
    config: LimiterConfig,
    per_ip: DashMap<IpAddr, u32>,
    total: AtomicU32,
}

impl ConnectionLimiter {
    /// Build a limiter from `config`.
    #[must_use]
    pub fn new(config: LimiterConfig) -> Self {
        Self { config, per_ip: DashMap::new(), total: AtomicU32::new(0) }
    }

    /// Current total across all IPs.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.total.load(Ordering::Acquire)
    }

    /// Current count for a single IP (zero if never seen or fully closed).
    #[must_use]
    pub fn count_for(&self, ip: IpAddr) -> u32 {
        self.per_ip.get(&ip).map_or(0, |c| *c)
    }

    /// Attempt to admit a new connection from `ip`.
    ///
    /// Returns `true` and increments both counters iff the per-IP count is
    /// below `max_per_ip` and the total is below `max_total`. On refusal,
    /// neither counter changes.
    pub fn admit(&self, ip: IpAddr) -> bool {
        // Reserve the total slot first: it's the cheaper, single-counter
        // check, and failing fast here avoids touching the per-IP map.
        loop {
            let current_total = self.total.load(Ordering::Acquire);
            if current_total >= self.config.max_total {
                return false;
            }
            if self
                .total
                .compare_exchange(current_total, current_total + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        let mut entry = self.per_ip.entry(ip).or_insert(0);
        if *entry >= self.config.max_per_ip {
            drop(entry);
            self.total.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        *entry += 1;
        true
    }

    /// Release a connection admitted for `ip`. Never decrements below zero;
    /// calling this for an IP with no admitted connections is a no-op.
    pub fn close(&self, ip: IpAddr) {
        if let Some(mut entry) = self.per_ip.get_mut(&ip) {
            if *entry > 0 {
                *entry -= 1;
                self.total.fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| Some(t.saturating_sub(1))).ok();
            }
        }
    }
}
