//! Keyed ring holding recently-sent values for retransmission/feedback
//! lookup by sequence number.
//!
//! Used twice per `spec.md` §3: once per outgoing RTP stream, keyed by RTP
//! sequence number and storing the packet itself (so a NACK can be
//! answered); and once per [`crate::path::Path`], keyed by the path's
//! transport-wide sequence and storing only the send wallclock (so CCFB
//! feedback can be turned into a one-way-delay sample). `T` is generic over
//! those two payloads.

use std::time::SystemTime;

use crate::seq_delta;

const DEFAULT_SIZE: usize = 1 << 14;

#[derive(Debug, Clone)]
struct Entry<T> {
    sequence: u16,
    send_time: SystemTime,
    value: T,
}

/// Fixed-size, power-of-two ring indexed by sequence number modulo its size.
/// Writing entry `s` overwrites the slot at `s mod size`; a later `add`
/// clears any slots it skips over so a retrieval can never return data
/// belonging to a sequence other than the one asked for.
pub struct SendBuffer<T> {
    slots: Vec<Option<Entry<T>>>,
    size: usize,
    last_added: Option<u16>,
}

impl<T> SendBuffer<T> {
    /// `size` must be a power of two; panics otherwise.
    pub fn new(size: usize) -> Self {
        assert!(size.is_power_of_two(), "send buffer size must be a power of two");
        Self {
            slots: (0..size).map(|_| None).collect(),
            size,
            last_added: None,
        }
    }

    fn slot(&self, seq: u16) -> usize {
        seq as usize & (self.size - 1)
    }

    /// Inserts `value`, sent at wallclock `now` as sequence `seq`.
    ///
    /// Same-sequence repeats are no-ops. A sequence that appears to move
    /// backward relative to the last add (a modular distance outside
    /// `[1, 2^15)`) is treated as stale and ignored. A forward add clears
    /// every slot strictly between the previous last-added sequence and the
    /// new one, so a stale retrieval never reads an overwritten slot's old
    /// contents.
    pub fn add(&mut self, seq: u16, now: SystemTime, value: T) {
        let Some(last_added) = self.last_added else {
            let slot = self.slot(seq);
            self.slots[slot] = Some(Entry {
                sequence: seq,
                send_time: now,
                value,
            });
            self.last_added = Some(seq);
            return;
        };

        let delta = seq_delta(last_added, seq);
        if delta == 0 {
            return;
        }
        if !(1..32768).contains(&delta) {
            return;
        }

        let mut cursor = last_added.wrapping_add(1);
        while cursor != seq {
            let slot = self.slot(cursor);
            self.slots[slot] = None;
            cursor = cursor.wrapping_add(1);
        }

        let slot = self.slot(seq);
        self.slots[slot] = Some(Entry {
            sequence: seq,
            send_time: now,
            value,
        });
        self.last_added = Some(seq);
    }

    /// Returns the (send-time, value) pair stored for `seq`, if still
    /// present: the modular distance from `seq` to the last-added sequence
    /// must be less than `min(size, 2^15)`, and the slot must still hold
    /// that exact sequence (otherwise it has been reclaimed by a later add).
    pub fn get(&self, seq: u16) -> Option<(SystemTime, &T)> {
        let last_added = self.last_added?;
        let distance = seq_delta(seq, last_added);
        if distance < 0 || distance as usize >= self.size.min(32768) {
            return None;
        }

        let slot = self.slot(seq);
        let entry = self.slots[slot].as_ref()?;
        if entry.sequence != seq {
            return None;
        }

        Some((entry.send_time, &entry.value))
    }
}

impl<T> Default for SendBuffer<T> {
    fn default() -> Self {
        Self::new(DEFAULT_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rtp_proto::rtp::{RtpHeader, RtpPacket};

    fn packet(seq: u16) -> RtpPacket {
        RtpPacket {
            header: RtpHeader {
                version: 2,
                padding: false,
                marker: false,
                payload_type: 96,
                sequence_number: seq,
                timestamp: 0,
                ssrc: 1,
                csrc: Default::default(),
                extensions: Default::default(),
            },
            payload: Bytes::new(),
        }
    }

    #[test]
    fn retrieves_the_last_added_entry() {
        let mut buf = SendBuffer::new(16);
        let now = SystemTime::UNIX_EPOCH;
        buf.add(5, now, packet(5));

        let (send_time, pkt) = buf.get(5).unwrap();
        assert_eq!(send_time, now);
        assert_eq!(pkt.header.sequence_number, 5);
    }

    #[test]
    fn forward_add_clears_skipped_slots() {
        let mut buf = SendBuffer::new(4);
        let now = SystemTime::UNIX_EPOCH;

        buf.add(0, now, packet(0));
        buf.add(4, now, packet(4)); // same slot as 0, but not contiguous: clears 1..3

        assert!(buf.get(0).is_none());
        assert!(buf.get(4).is_some());
    }

    #[test]
    fn stale_add_is_ignored() {
        let mut buf = SendBuffer::new(16);
        let now = SystemTime::UNIX_EPOCH;

        buf.add(10, now, packet(10));
        buf.add(9, now, packet(9));

        assert!(buf.get(9).is_none());
        assert_eq!(buf.get(10).unwrap().1.header.sequence_number, 10);
    }

    #[test]
    fn duplicate_add_is_a_no_op() {
        let mut buf = SendBuffer::new(16);
        let now = SystemTime::UNIX_EPOCH;

        buf.add(10, now, packet(10));
        buf.add(10, now, packet(10));

        assert_eq!(buf.get(10).unwrap().1.header.sequence_number, 10);
    }

    #[test]
    fn out_of_window_retrieval_is_absent() {
        let mut buf = SendBuffer::new(16);
        let now = SystemTime::UNIX_EPOCH;

        for seq in 0..40u16 {
            buf.add(seq, now, packet(seq));
        }

        assert!(buf.get(0).is_none());
        assert!(buf.get(39).is_some());
    }

    #[test]
    fn stores_a_bare_timestamp_marker_for_the_cc_send_buffer_use_case() {
        let mut buf: SendBuffer<()> = SendBuffer::new(16);
        let now = SystemTime::UNIX_EPOCH;
        buf.add(1, now, ());

        assert_eq!(buf.get(1).unwrap().0, now);
    }
}
