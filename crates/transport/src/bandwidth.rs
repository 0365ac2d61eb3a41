//! Router-wide bandwidth accounting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Participating traffic is refused above this rate for low-bandwidth-class
/// routers.
pub const LOW_BANDWIDTH_LIMIT: u64 = 32 * 1024; // bytes/sec

#[derive(Default)]
struct Counters {
    total_in: AtomicU64,
    total_out: AtomicU64,
    in_bw: AtomicU64,
    out_bw: AtomicU64,
}

/// Atomic byte counters sampled at 1 Hz into instantaneous rates.
#[derive(Clone)]
pub struct Bandwidth {
    counters: Arc<Counters>,
}

impl Bandwidth {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn record_received(&self, bytes: u64) {
        self.counters.total_in.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_sent(&self, bytes: u64) {
        self.counters.total_out.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn total_received(&self) -> u64 {
        self.counters.total_in.load(Ordering::Relaxed)
    }

    pub fn total_sent(&self) -> u64 {
        self.counters.total_out.load(Ordering::Relaxed)
    }

    /// Bytes/sec over the last sample window.
    pub fn in_bw(&self) -> u64 {
        self.counters.in_bw.load(Ordering::Relaxed)
    }

    pub fn out_bw(&self) -> u64 {
        self.counters.out_bw.load(Ordering::Relaxed)
    }

    /// Whether instantaneous traffic is over the low-bandwidth cap; used to
    /// refuse additional participating traffic.
    pub fn exceeds_low_limit(&self) -> bool {
        self.in_bw().max(self.out_bw()) > LOW_BANDWIDTH_LIMIT
    }

    pub fn start_sampler(&self) {
        let counters = self.counters.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            let mut last_in = 0u64;
            let mut last_out = 0u64;
            loop {
                tick.tick().await;
                let now_in = counters.total_in.load(Ordering::Relaxed);
                let now_out = counters.total_out.load(Ordering::Relaxed);
                counters.in_bw.store(now_in - last_in, Ordering::Relaxed);
                counters.out_bw.store(now_out - last_out, Ordering::Relaxed);
                last_in = now_in;
                last_out = now_out;
            }
        });
    }
}

impl Default for Bandwidth {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let bw = Bandwidth::new();
        bw.record_received(100);
        bw.record_received(50);
        bw.record_sent(30);
        assert_eq!(bw.total_received(), 150);
        assert_eq!(bw.total_sent(), 30);
    }

    #[test]
    fn test_low_limit_uses_sampled_rate() {
        let bw = Bandwidth::new();
        // no sample taken yet: rates are zero regardless of totals
        bw.record_received(10 * LOW_BANDWIDTH_LIMIT);
        assert!(!bw.exceeds_low_limit());
        bw.counters.in_bw.store(LOW_BANDWIDTH_LIMIT + 1, Ordering::Relaxed);
        assert!(bw.exceeds_low_limit());
    }
}
