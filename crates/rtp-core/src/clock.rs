//! Wallclock abstraction used wherever a component needs to stamp or compare
//! absolute time (NTP timestamps, last-packet bookkeeping, the per-SSRC
//! RTP-timestamp-to-wallclock mapping).
//!
//! Scheduling (jitter-buffer emit waits, NACK/poll/flush timers) is left on
//! tokio's own clock: tests pause and advance it directly with
//! `tokio::time::{pause, advance}` rather than going through a second
//! abstraction here. This `Clock` trait only covers wallclock reads, which
//! tokio's virtual time does not touch.

use std::{
    sync::Arc,
    time::{Instant, SystemTime},
};

use ahash::AHashMap;
use parking_lot::RwLock;

pub trait Clock: Clone + Send + Sync + 'static {
    fn wallclock(&self) -> SystemTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn wallclock(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A settable wallclock for deterministic tests. Paired with
/// `tokio::time::pause`/`advance` for scheduling, this lets a test drive
/// both "what time is it" and "when does the next timer fire" explicitly.
#[derive(Debug, Clone)]
pub struct TestClock(Arc<RwLock<SystemTime>>);

impl TestClock {
    pub fn new(start: SystemTime) -> Self {
        Self(Arc::new(RwLock::new(start)))
    }

    pub fn set(&self, time: SystemTime) {
        *self.0.write() = time;
    }

    pub fn advance(&self, delta: std::time::Duration) {
        let mut guard = self.0.write();
        *guard += delta;
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH)
    }
}

impl Clock for TestClock {
    fn wallclock(&self) -> SystemTime {
        *self.0.read()
    }
}

#[derive(Debug, Clone, Copy)]
struct ClockAnchor {
    first_rtp_ts: u32,
    first_seen: Instant,
    clock_rate: u32,
}

/// Per-SSRC mapping from RTP timestamp to a normalized capture-time estimate
/// (`first_seen + (rtp_ts - first_rtp_ts) / clock_rate`), the bookkeeping a
/// demuxed stream keeps for observability (lip-sync / drift metrics) that is
/// distinct from the jitter buffer's own arrival-time scheduling, which keys
/// off wallclock arrival rather than the media timestamp.
pub struct RtpClockMap {
    anchors: RwLock<AHashMap<u32, ClockAnchor>>,
}

impl RtpClockMap {
    pub fn new() -> Self {
        Self {
            anchors: RwLock::new(AHashMap::new()),
        }
    }

    /// Anchors `ssrc` on first sight and returns the normalized capture-time
    /// estimate for `rtp_ts` relative to that anchor. `clock_rate` is only
    /// consulted the first time `ssrc` is observed.
    pub fn normalize(&self, ssrc: u32, rtp_ts: u32, clock_rate: u32, now: Instant) -> Instant {
        let mut anchors = self.anchors.write();
        let anchor = anchors.entry(ssrc).or_insert(ClockAnchor {
            first_rtp_ts: rtp_ts,
            first_seen: now,
            clock_rate: clock_rate.max(1),
        });

        let delta_ticks = rtp_ts.wrapping_sub(anchor.first_rtp_ts) as i32;
        let delta_secs = delta_ticks as f64 / anchor.clock_rate as f64;

        if delta_secs >= 0.0 {
            anchor.first_seen + std::time::Duration::from_secs_f64(delta_secs)
        } else {
            anchor
                .first_seen
                .checked_sub(std::time::Duration::from_secs_f64(-delta_secs))
                .unwrap_or(anchor.first_seen)
        }
    }

    /// Drops the anchor for `ssrc`, e.g. once the demultiplex tree tears its
    /// stream down.
    pub fn remove(&self, ssrc: u32) {
        self.anchors.write().remove(&ssrc);
    }

    pub fn len(&self) -> usize {
        self.anchors.read().len()
    }
}

impl Default for RtpClockMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_observation_anchors_at_its_own_instant() {
        let map = RtpClockMap::new();
        let now = Instant::now();
        let normalized = map.normalize(7, 1_000, 90_000, now);
        assert_eq!(normalized, now);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn later_timestamp_normalizes_forward_by_the_clock_rate() {
        let map = RtpClockMap::new();
        let start = Instant::now();
        map.normalize(7, 1_000, 90_000, start);

        // 90,000 ticks later at a 90 kHz clock rate is exactly one second on.
        let normalized = map.normalize(7, 1_000 + 90_000, 90_000, start + Duration::from_millis(5));
        assert_eq!(normalized, start + Duration::from_secs(1));
    }

    #[test]
    fn reordered_timestamp_normalizes_backward_from_the_anchor() {
        let map = RtpClockMap::new();
        let start = Instant::now();
        map.normalize(7, 90_000, 90_000, start);

        let normalized = map.normalize(7, 45_000, 90_000, start + Duration::from_millis(600));
        assert_eq!(normalized, start - Duration::from_millis(500));
    }

    #[test]
    fn distinct_ssrcs_get_independent_anchors() {
        let map = RtpClockMap::new();
        let start = Instant::now();
        map.normalize(1, 500, 8_000, start);
        map.normalize(2, 9_000, 48_000, start + Duration::from_millis(10));

        assert_eq!(map.len(), 2);
    }

    #[test]
    fn remove_drops_the_anchor() {
        let map = RtpClockMap::new();
        map.normalize(7, 0, 90_000, Instant::now());
        assert_eq!(map.len(), 1);

        map.remove(7);
        assert_eq!(map.len(), 0);
    }
}
