//! Single-stage jitter buffer: a time-ordered reorder queue with a delay
//! floor that emits strictly in sequence-number order.

use std::time::Duration;

use rtp_proto::rtp::RtpPacket;
use tokio::{
    sync::mpsc,
    time::{sleep_until, Instant},
};

struct Entry {
    packet: RtpPacket,
    emit_time: Instant,
}

/// Outcome of a single insert, for the caller to route the packet
/// appropriately (emission itself happens in [`run`]).
enum Insert {
    Inserted,
    Duplicate,
    Evicted(RtpPacket),
}

/// Array of size `2^16` indexed directly by RTP sequence number, a `tail`
/// cursor naming the next sequence to emit, and a live-entry `count`.
///
/// State is owned exclusively by the task running [`run`]; there is no
/// shared-mutability story here, matching the "ownership" resource model for
/// per-stream pipeline state.
pub struct JitterBuffer {
    delay: Duration,
    array: Box<[Option<Entry>]>,
    tail: u16,
    count: u32,
    latest_emitted: Option<Instant>,
}

impl JitterBuffer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            array: (0..=u16::MAX).map(|_| None).collect(),
            tail: 0,
            count: 0,
            latest_emitted: None,
        }
    }

    fn insert(&mut self, pkt: RtpPacket, arrival: Instant) -> Insert {
        let emit_time = arrival + self.delay;

        if let Some(latest) = self.latest_emitted {
            if emit_time < latest {
                return Insert::Evicted(pkt);
            }
        }

        let seq = pkt.header.sequence_number;
        let slot = &mut self.array[seq as usize];
        if slot.is_some() {
            return Insert::Duplicate;
        }

        *slot = Some(Entry { packet: pkt, emit_time });
        self.count += 1;
        Insert::Inserted
    }

    /// Scans from `tail` forward (modulo `2^16`) for the first occupied
    /// slot, returning its sequence and emit time.
    fn next_emit(&self) -> Option<(u16, Instant)> {
        if self.count == 0 {
            return None;
        }

        let mut seq = self.tail;
        for _ in 0..=u16::MAX {
            if let Some(entry) = &self.array[seq as usize] {
                return Some((seq, entry.emit_time));
            }
            seq = seq.wrapping_add(1);
        }

        None
    }

    fn take(&mut self, seq: u16) -> RtpPacket {
        let entry = self.array[seq as usize]
            .take()
            .expect("next_emit only names occupied slots");

        self.count -= 1;
        self.latest_emitted = Some(entry.emit_time);
        self.tail = seq.wrapping_add(1);
        entry.packet
    }

    /// `true` once a packet has been emitted or evicted; used by the
    /// composite pipeline's bypass-on-eviction wiring.
    pub fn has_emitted(&self) -> bool {
        self.latest_emitted.is_some()
    }
}

/// Drives one [`JitterBuffer`] to completion: reads from `input`, holds
/// each packet until its emit time, and forwards it on `output` in
/// sequence-number order. Packets that arrive too late to honor ordering
/// are forwarded on `evict` instead. Exits when `input` closes.
pub async fn run(
    mut buffer: JitterBuffer,
    mut input: mpsc::Receiver<RtpPacket>,
    output: mpsc::Sender<RtpPacket>,
    evict: mpsc::Sender<RtpPacket>,
) {
    loop {
        match buffer.next_emit() {
            None => match input.recv().await {
                Some(pkt) => handle_insert(&mut buffer, pkt, &evict).await,
                None => break,
            },
            Some((seq, emit_time)) => {
                tokio::select! {
                    _ = sleep_until(emit_time) => {
                        let pkt = buffer.take(seq);
                        if output.send(pkt).await.is_err() {
                            break;
                        }
                    }
                    maybe_pkt = input.recv() => {
                        match maybe_pkt {
                            Some(pkt) => handle_insert(&mut buffer, pkt, &evict).await,
                            None => break,
                        }
                    }
                }
            }
        }
    }
}

async fn handle_insert(buffer: &mut JitterBuffer, pkt: RtpPacket, evict: &mpsc::Sender<RtpPacket>) {
    match buffer.insert(pkt, Instant::now()) {
        Insert::Inserted | Insert::Duplicate => {}
        Insert::Evicted(pkt) => {
            let _ = evict.send(pkt).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rtp_proto::rtp::RtpHeader;
    use std::time::Duration as StdDuration;

    fn packet(seq: u16) -> RtpPacket {
        RtpPacket {
            header: RtpHeader {
                version: 2,
                padding: false,
                marker: false,
                payload_type: 96,
                sequence_number: seq,
                timestamp: seq as u32 * 160,
                ssrc: 1,
                csrc: Default::default(),
                extensions: Default::default(),
            },
            payload: Bytes::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ordered_emission_waits_for_delay() {
        let buffer = JitterBuffer::new(StdDuration::from_millis(100));
        let (input_tx, input_rx) = mpsc::channel(8);
        let (output_tx, mut output_rx) = mpsc::channel(8);
        let (evict_tx, _evict_rx) = mpsc::channel(8);

        tokio::spawn(run(buffer, input_rx, output_tx, evict_tx));

        input_tx.send(packet(101)).await.unwrap();
        input_tx.send(packet(100)).await.unwrap();

        assert!(
            tokio::time::timeout(StdDuration::from_millis(50), output_rx.recv())
                .await
                .is_err(),
            "no output before the delay elapses"
        );

        let first = tokio::time::timeout(StdDuration::from_millis(100), output_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.header.sequence_number, 100);

        let second = output_rx.recv().await.unwrap();
        assert_eq!(second.header.sequence_number, 101);
    }

    #[tokio::test(start_paused = true)]
    async fn deduplicates_repeated_sequence() {
        let buffer = JitterBuffer::new(StdDuration::from_millis(50));
        let (input_tx, input_rx) = mpsc::channel(8);
        let (output_tx, mut output_rx) = mpsc::channel(8);
        let (evict_tx, _evict_rx) = mpsc::channel(8);

        tokio::spawn(run(buffer, input_rx, output_tx, evict_tx));

        input_tx.send(packet(100)).await.unwrap();
        input_tx.send(packet(101)).await.unwrap();
        input_tx.send(packet(100)).await.unwrap();

        let first = output_rx.recv().await.unwrap();
        let second = output_rx.recv().await.unwrap();
        assert_eq!(first.header.sequence_number, 100);
        assert_eq!(second.header.sequence_number, 101);

        assert!(
            tokio::time::timeout(StdDuration::from_millis(200), output_rx.recv())
                .await
                .is_err(),
            "the duplicate must not produce a third emission"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reorder_across_two_arrival_batches() {
        let buffer = JitterBuffer::new(StdDuration::from_millis(100));
        let (input_tx, input_rx) = mpsc::channel(16);
        let (output_tx, mut output_rx) = mpsc::channel(16);
        let (evict_tx, _evict_rx) = mpsc::channel(16);

        tokio::spawn(run(buffer, input_rx, output_tx, evict_tx));

        for seq in [101u16, 100, 100, 103] {
            input_tx.send(packet(seq)).await.unwrap();
        }

        tokio::time::sleep(StdDuration::from_millis(50)).await;

        for seq in [106u16, 105, 104, 107] {
            input_tx.send(packet(seq)).await.unwrap();
        }

        let mut first_batch = Vec::new();
        for _ in 0..3 {
            first_batch.push(output_rx.recv().await.unwrap().header.sequence_number);
        }
        assert_eq!(first_batch, vec![100, 101, 103]);

        let mut second_batch = Vec::new();
        for _ in 0..4 {
            second_batch.push(output_rx.recv().await.unwrap().header.sequence_number);
        }
        assert_eq!(second_batch, vec![104, 105, 106, 107]);
    }

    #[tokio::test(start_paused = true)]
    async fn late_packet_is_evicted_without_touching_state() {
        let mut buffer = JitterBuffer::new(StdDuration::from_millis(10));
        let baseline = Instant::now();
        buffer.latest_emitted = Some(baseline + StdDuration::from_secs(10));

        match buffer.insert(packet(1), baseline) {
            Insert::Evicted(pkt) => assert_eq!(pkt.header.sequence_number, 1),
            _ => panic!("expected eviction"),
        }
        assert_eq!(buffer.count, 0);
    }
}
