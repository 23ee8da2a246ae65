//! Chain of single-stage jitter buffers with a NACK emitter between each
//! consecutive pair, funneling every emitter's findings into one batched
//! `TransportLayerNack` flush.

use std::{collections::BTreeSet, time::Duration};

use rtp_proto::{rtcp::RtcpPacket, rtp::RtpPacket};
use smallvec::SmallVec;
use tokio::sync::mpsc;

use super::{buffer, buffer::JitterBuffer, nack::NackEmitter};

/// Handles for one composite pipeline instance: feed packets in, read
/// ordered packets and accumulated NACK feedback out.
pub struct CompositePipeline {
    pub input: mpsc::Sender<RtpPacket>,
    pub output: mpsc::Receiver<RtpPacket>,
    pub nack: mpsc::Receiver<RtcpPacket>,
}

const CHANNEL_CAPACITY: usize = 128;

/// Builds and spawns a pipeline with one stage per entry in `delays`
/// (earliest/shortest first) and starts its funnel flushing every
/// `nack_interval`.
pub fn spawn(
    delays: &[Duration],
    nack_interval: Duration,
    sender_ssrc: u32,
    media_ssrc: u32,
) -> CompositePipeline {
    assert!(!delays.is_empty(), "composite pipeline needs at least one stage");

    let (input_tx, mut current_input_rx) = mpsc::channel::<RtpPacket>(CHANNEL_CAPACITY);
    let (missing_tx, missing_rx) = mpsc::unbounded_channel::<SmallVec<[u16; 8]>>();

    let last_stage = delays.len() - 1;
    let mut final_output_rx = None;

    for (index, &delay) in delays.iter().enumerate() {
        let stage = JitterBuffer::new(delay);
        let (stage_output_tx, stage_output_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (evict_tx, evict_rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(buffer::run(stage, current_input_rx, stage_output_tx, evict_tx));

        if index == last_stage {
            tokio::spawn(drain_final_evictions(evict_rx));
            final_output_rx = Some(stage_output_rx);
        } else {
            let (next_input_tx, next_input_rx) = mpsc::channel(CHANNEL_CAPACITY);
            tokio::spawn(forward_stage(
                stage_output_rx,
                evict_rx,
                next_input_tx,
                missing_tx.clone(),
            ));
            current_input_rx = next_input_rx;
        }
    }

    let (nack_tx, nack_rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(run_funnel(
        missing_rx,
        nack_tx,
        nack_interval,
        sender_ssrc,
        media_ssrc,
    ));

    CompositePipeline {
        input: input_tx,
        output: final_output_rx.expect("at least one stage was built"),
        nack: nack_rx,
    }
}

/// Observes one stage's ordinary output through a NACK emitter and forwards
/// it to the next stage's input; forwards that stage's evictions directly,
/// bypassing the NACK emitter, since a retransmit arriving late at one
/// stage can still be useful at the next.
async fn forward_stage(
    mut stage_output_rx: mpsc::Receiver<RtpPacket>,
    mut evict_rx: mpsc::Receiver<RtpPacket>,
    next_input_tx: mpsc::Sender<RtpPacket>,
    missing_tx: mpsc::UnboundedSender<SmallVec<[u16; 8]>>,
) {
    let mut nack = NackEmitter::new();
    let mut output_done = false;
    let mut evict_done = false;

    loop {
        if output_done && evict_done {
            break;
        }

        tokio::select! {
            maybe = stage_output_rx.recv(), if !output_done => {
                match maybe {
                    Some(pkt) => {
                        let missing = nack.observe(pkt.header.sequence_number);
                        if !missing.is_empty() {
                            let _ = missing_tx.send(missing);
                        }
                        if next_input_tx.send(pkt).await.is_err() {
                            break;
                        }
                    }
                    None => output_done = true,
                }
            }
            maybe = evict_rx.recv(), if !evict_done => {
                match maybe {
                    Some(pkt) => {
                        if next_input_tx.send(pkt).await.is_err() {
                            break;
                        }
                    }
                    None => evict_done = true,
                }
            }
        }
    }
}

async fn drain_final_evictions(mut evict_rx: mpsc::Receiver<RtpPacket>) {
    while evict_rx.recv().await.is_some() {}
}

/// Collects missing sequences from every stage gap and flushes them as
/// `TransportLayerNack` records, grouped into 17-bit NACK pairs, once per
/// `nack_interval`.
async fn run_funnel(
    mut missing_rx: mpsc::UnboundedReceiver<SmallVec<[u16; 8]>>,
    nack_tx: mpsc::Sender<RtcpPacket>,
    nack_interval: Duration,
    sender_ssrc: u32,
    media_ssrc: u32,
) {
    let mut pending: BTreeSet<u16> = BTreeSet::new();
    let mut ticker = tokio::time::interval(nack_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe = missing_rx.recv() => {
                match maybe {
                    Some(batch) => pending.extend(batch),
                    None => break,
                }
            }
            _ = ticker.tick() => {
                if pending.is_empty() {
                    continue;
                }

                let missing: Vec<u16> = pending.iter().copied().collect();
                let pairs = rtp_proto::rtcp::pack_nack_pairs(&missing);
                let packet = RtcpPacket::TransportLayerNack {
                    sender_ssrc,
                    media_ssrc,
                    pairs,
                };

                if nack_tx.send(packet).await.is_err() {
                    break;
                }
                pending.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rtp_proto::rtcp::expand_nack_pairs;
    use rtp_proto::rtp::RtpHeader;

    fn packet(seq: u16) -> RtpPacket {
        RtpPacket {
            header: RtpHeader {
                version: 2,
                padding: false,
                marker: false,
                payload_type: 96,
                sequence_number: seq,
                timestamp: seq as u32 * 160,
                ssrc: 7,
                csrc: Default::default(),
                extensions: Default::default(),
            },
            payload: Bytes::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn three_stage_pipeline_reorders_and_flushes_nack() {
        let delays = [
            Duration::from_millis(20),
            Duration::from_millis(40),
            Duration::from_millis(60),
        ];
        let mut pipeline = spawn(&delays, Duration::from_millis(150), 1, 7);

        for seq in [101u16, 100, 103] {
            pipeline.input.send(packet(seq)).await.unwrap();
        }

        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(pipeline.output.recv().await.unwrap().header.sequence_number);
        }
        assert_eq!(received, vec![100, 101, 103]);

        let nack = tokio::time::timeout(Duration::from_millis(400), pipeline.nack.recv())
            .await
            .unwrap()
            .unwrap();

        match nack {
            RtcpPacket::TransportLayerNack {
                media_ssrc, pairs, ..
            } => {
                assert_eq!(media_ssrc, 7);
                assert_eq!(expand_nack_pairs(&pairs), vec![102]);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }
}
