//! Detects gaps in a monotonically increasing sequence of observed RTP
//! packets and reports the missing sequence numbers in each gap.

use smallvec::SmallVec;

use crate::seq_delta;

/// Stateless in the sense that it only remembers the last sequence seen;
/// one instance sits between each pair of stages in the composite pipeline.
#[derive(Debug, Default)]
pub struct NackEmitter {
    last_seen: Option<u16>,
}

impl NackEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `seq` as observed and returns the sequence numbers missing
    /// between the previous observation and this one, in ascending order.
    ///
    /// The first observation always suppresses emission (there is no prior
    /// sequence to diff against). A `seq` that lands behind the last
    /// observed value by more than a half-epoch wrap is treated as reorder,
    /// not a gap, and is ignored without moving `last_seen` backward.
    pub fn observe(&mut self, seq: u16) -> SmallVec<[u16; 8]> {
        let Some(last_seen) = self.last_seen else {
            self.last_seen = Some(seq);
            return SmallVec::new();
        };

        let delta = seq_delta(last_seen, seq);
        if delta <= 0 {
            // duplicate or reorder: ignore, do not move last_seen backward
            return SmallVec::new();
        }

        self.last_seen = Some(seq);

        let missing_count = delta - 1;
        let mut missing = SmallVec::with_capacity(missing_count as usize);
        let mut cursor = last_seen.wrapping_add(1);
        for _ in 0..missing_count {
            missing.push(cursor);
            cursor = cursor.wrapping_add(1);
        }

        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_observation_suppresses_emission() {
        let mut nack = NackEmitter::new();
        assert!(nack.observe(100).is_empty());
    }

    #[test]
    fn reports_the_gap_between_observations() {
        let mut nack = NackEmitter::new();
        nack.observe(100);
        let missing = nack.observe(105);
        assert_eq!(missing.as_slice(), &[101, 102, 103, 104]);
    }

    #[test]
    fn contiguous_observations_report_nothing() {
        let mut nack = NackEmitter::new();
        nack.observe(100);
        assert!(nack.observe(101).is_empty());
    }

    #[test]
    fn reorder_does_not_move_last_seen_backward() {
        let mut nack = NackEmitter::new();
        nack.observe(100);
        nack.observe(105);
        assert!(nack.observe(103).is_empty());
        // last_seen is still 105; the next forward step reports the real gap
        let missing = nack.observe(107);
        assert_eq!(missing.as_slice(), &[106]);
    }

    #[test]
    fn wraps_across_the_16_bit_boundary() {
        let mut nack = NackEmitter::new();
        nack.observe(u16::MAX - 1);
        let missing = nack.observe(1);
        assert_eq!(missing.as_slice(), &[u16::MAX, 0]);
    }
}
