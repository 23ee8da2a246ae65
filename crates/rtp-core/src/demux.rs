//! SSRC and payload-type demultiplex tree, plus the per-stream pipeline each
//! leaf runs: a single-stage jitter buffer, a persistent NACK timer, and a
//! hookup to a [`DownstreamPublisher`] (`spec.md` §4.G "Demultiplex tree" and
//! "Per-stream pipeline").
//!
//! Both demux stages share one shape: a map keyed by the dimension they
//! split on, a callback invoked the first time a key is seen, and a 1 s
//! sweep that evicts (by dropping the channel, which unwinds the child task)
//! any key idle for more than 30 s.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use ahash::AHashMap;
use rtp_proto::{rtcp::RtcpPacket, rtp::RtpPacket};
use tokio::{sync::mpsc, time::Instant};

use crate::{
    clock::RtpClockMap,
    collab::{CodecSet, DownstreamPublisher},
    jitter,
    seq_delta,
};

const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const CHANNEL_CAPACITY: usize = 128;
const STREAM_NACK_INTERVAL: Duration = Duration::from_millis(150);

/// Default CNAME assigned to an SSRC before its SDES chunk (if any) is ever
/// observed, matching the original demuxer's catch-all bucket.
pub const DEFAULT_CNAME: &str = "default";

/// Handed to the SSRC demuxer's new-source callback: the SSRC itself plus
/// the channel carrying that SSRC's RTP packets onward.
pub struct SsrcHandle {
    pub ssrc: u32,
    pub rtp_rx: mpsc::Receiver<RtpPacket>,
}

/// Splits one RTP stream by SSRC. `on_new_source` runs once per SSRC, the
/// first time it is seen; the SSRC's own channel keeps draining through the
/// returned [`SsrcHandle`] until 30 s pass without a packet.
pub async fn run_ssrc_demux(
    mut rtp_in: mpsc::Receiver<RtpPacket>,
    on_new_source: impl Fn(SsrcHandle) + Send + Sync + 'static,
) {
    struct Child {
        tx: mpsc::Sender<RtpPacket>,
        last_packet: Instant,
    }

    let mut children: AHashMap<u32, Child> = AHashMap::new();
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe = rtp_in.recv() => {
                let Some(packet) = maybe else { break };
                let ssrc = packet.header.ssrc;

                let child = children.entry(ssrc).or_insert_with(|| {
                    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
                    on_new_source(SsrcHandle { ssrc, rtp_rx: rx });
                    Child { tx, last_packet: Instant::now() }
                });

                child.last_packet = Instant::now();
                let _ = child.tx.try_send(packet);
            }
            _ = sweep.tick() => {
                let now = Instant::now();
                children.retain(|ssrc, child| {
                    let alive = now.duration_since(child.last_packet) < INACTIVITY_TIMEOUT;
                    if !alive {
                        log::info!("demux: evicting ssrc {ssrc} after 30s inactivity");
                    }
                    alive
                });
            }
        }
    }
}

/// Handed to the payload-type demuxer's new-source callback.
pub struct PayloadTypeHandle {
    pub ssrc: u32,
    pub mime_family: &'static str,
    pub clock_rate: u32,
    pub rtp_rx: mpsc::Receiver<RtpPacket>,
}

/// Splits one SSRC's RTP stream by the mime-type family (`"audio"` or
/// `"video"`) its payload type resolves to in `codecs`. A payload type the
/// codec set does not recognize is logged and dropped rather than opening a
/// new child, matching the original demuxer's unknown-payload-type warning.
pub async fn run_payload_type_demux(
    ssrc: u32,
    codecs: Arc<CodecSet>,
    mut rtp_in: mpsc::Receiver<RtpPacket>,
    on_new_source: impl Fn(PayloadTypeHandle) + Send + Sync + 'static,
) {
    struct Child {
        tx: mpsc::Sender<RtpPacket>,
        last_packet: Instant,
    }

    let mut children: AHashMap<&'static str, Child> = AHashMap::new();
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe = rtp_in.recv() => {
                let Some(packet) = maybe else { break };

                let Some(codec) = codecs.get(packet.header.payload_type) else {
                    log::warn!(
                        "demux: unknown payload type {} on ssrc {ssrc}",
                        packet.header.payload_type
                    );
                    continue;
                };

                let family = codec.kind.mime_family();
                let child = children.entry(family).or_insert_with(|| {
                    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
                    on_new_source(PayloadTypeHandle {
                        ssrc,
                        mime_family: family,
                        clock_rate: codec.clock_rate,
                        rtp_rx: rx,
                    });
                    Child { tx, last_packet: Instant::now() }
                });

                child.last_packet = Instant::now();
                let _ = child.tx.try_send(packet);
            }
            _ = sweep.tick() => {
                let now = Instant::now();
                children.retain(|family, child| {
                    let alive = now.duration_since(child.last_packet) < INACTIVITY_TIMEOUT;
                    if !alive {
                        log::info!("demux: evicting {family} stream for ssrc {ssrc} after 30s inactivity");
                    }
                    alive
                });
            }
        }
    }
}

/// Groups SSRCs by their last-observed CNAME. Runs after SSRC demuxing
/// rather than gating it: an SSRC is always dispatched on its own merits,
/// and the CNAME grouping this tree records is consulted only for
/// observability (`spec.md` §4.G, resolved in the design notes — see
/// DESIGN.md). SSRCs with no SDES chunk yet fall under [`DEFAULT_CNAME`].
pub struct CnameTree {
    inner: parking_lot::RwLock<CnameState>,
}

struct CnameState {
    ssrc_to_cname: AHashMap<u32, String>,
    cname_last_seen: AHashMap<String, Instant>,
}

impl CnameTree {
    pub fn new() -> Self {
        Self {
            inner: parking_lot::RwLock::new(CnameState {
                ssrc_to_cname: AHashMap::new(),
                cname_last_seen: AHashMap::new(),
            }),
        }
    }

    /// Records that `ssrc` is alive, under whatever CNAME it currently
    /// maps to (or [`DEFAULT_CNAME`] if none has arrived yet).
    pub fn note_ssrc_seen(&self, ssrc: u32, now: Instant) {
        let mut state = self.inner.write();
        let cname = state
            .ssrc_to_cname
            .get(&ssrc)
            .cloned()
            .unwrap_or_else(|| DEFAULT_CNAME.to_string());
        state.cname_last_seen.insert(cname, now);
    }

    /// Applies the CNAME chunks of a decoded `SourceDescription` packet.
    pub fn observe_sdes(&self, chunks: &[(u32, String)], now: Instant) {
        let mut state = self.inner.write();
        for (ssrc, cname) in chunks {
            state.ssrc_to_cname.insert(*ssrc, cname.clone());
            state.cname_last_seen.insert(cname.clone(), now);
        }
    }

    pub fn cname_of(&self, ssrc: u32) -> String {
        self.inner
            .read()
            .ssrc_to_cname
            .get(&ssrc)
            .cloned()
            .unwrap_or_else(|| DEFAULT_CNAME.to_string())
    }

    /// Drops CNAMEs idle for more than 30 s. [`DEFAULT_CNAME`] is the
    /// catch-all bucket and is never evicted.
    pub fn sweep(&self, now: Instant) {
        let mut state = self.inner.write();
        state.cname_last_seen.retain(|cname, last_seen| {
            cname == DEFAULT_CNAME || now.duration_since(*last_seen) < INACTIVITY_TIMEOUT
        });
        let alive: std::collections::HashSet<String> = state.cname_last_seen.keys().cloned().collect();
        state
            .ssrc_to_cname
            .retain(|_, cname| cname == DEFAULT_CNAME || alive.contains(cname));
    }
}

impl Default for CnameTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks sequence gaps in one stream and keeps reporting every still-open
/// gap on each tick of the per-stream NACK timer, rather than the
/// report-once-per-gap behavior of [`crate::jitter::NackEmitter`] used
/// between composite-pipeline stages: the demux tree's leaf streams sit in
/// front of a playout consumer, not another buffering stage, so a request
/// that goes unanswered needs to be retried instead of forgotten.
#[derive(Debug, Default)]
struct MissingTracker {
    highest: Option<u16>,
    missing: BTreeSet<u16>,
}

impl MissingTracker {
    fn observe(&mut self, seq: u16) {
        match self.highest {
            None => self.highest = Some(seq),
            Some(highest) => {
                let delta = seq_delta(highest, seq);
                if delta > 0 {
                    let mut cursor = highest.wrapping_add(1);
                    for _ in 0..(delta - 1) {
                        self.missing.insert(cursor);
                        cursor = cursor.wrapping_add(1);
                    }
                    self.highest = Some(seq);
                }
            }
        }
        self.missing.remove(&seq);
    }

    fn snapshot(&self) -> Vec<u16> {
        self.missing.iter().copied().collect()
    }
}

/// Runs one leaf of the demux tree: a single-stage jitter buffer sized by
/// `jitter_delay`, a [`MissingTracker`] that emits a `TransportLayerNack`
/// every [`STREAM_NACK_INTERVAL`] while a gap remains open, and delivery of
/// ordered output to `publisher`. Exits once `rtp_in` closes.
pub async fn run_stream_pipeline(
    media_ssrc: u32,
    sender_ssrc: u32,
    clock_rate: u32,
    clock_map: Arc<RtpClockMap>,
    mut rtp_in: mpsc::Receiver<RtpPacket>,
    jitter_delay: Duration,
    mut publisher: Box<dyn DownstreamPublisher>,
    nack_tx: mpsc::Sender<RtcpPacket>,
) {
    let (buffer_in_tx, buffer_in_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (buffer_out_tx, mut buffer_out_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (evict_tx, mut evict_rx) = mpsc::channel(CHANNEL_CAPACITY);

    let buffer = jitter::JitterBuffer::new(jitter_delay);
    tokio::spawn(jitter::buffer::run(buffer, buffer_in_rx, buffer_out_tx, evict_tx));

    let mut tracker = MissingTracker::default();
    let mut nack_ticker = tokio::time::interval(STREAM_NACK_INTERVAL);
    nack_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe = rtp_in.recv() => {
                let Some(packet) = maybe else { break };
                tracker.observe(packet.header.sequence_number);
                let normalized = clock_map.normalize(
                    media_ssrc,
                    packet.header.timestamp,
                    clock_rate,
                    Instant::now().into_std(),
                );
                log::trace!(
                    "demux: ssrc {media_ssrc} rtp_ts {} normalizes to {normalized:?}",
                    packet.header.timestamp
                );
                if buffer_in_tx.send(packet).await.is_err() {
                    break;
                }
            }
            maybe = buffer_out_rx.recv() => {
                let Some(packet) = maybe else { break };
                publisher.publish(packet);
            }
            maybe = evict_rx.recv() => {
                // Too-late for this leaf's own delay floor: nothing more to
                // do with it (`spec.md` §7 "BufferTooLate").
                if maybe.is_none() {
                    break;
                }
            }
            _ = nack_ticker.tick() => {
                let missing = tracker.snapshot();
                if !missing.is_empty() {
                    let pairs = rtp_proto::rtcp::pack_nack_pairs(&missing);
                    let packet = RtcpPacket::TransportLayerNack {
                        sender_ssrc,
                        media_ssrc,
                        pairs,
                    };
                    if nack_tx.send(packet).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    clock_map.remove(media_ssrc);
}

/// Wires the whole tree together: SSRC demux, payload-type demux nested
/// under each SSRC, and a stream pipeline nested under each payload-type
/// child, handing every emitted stream's output to a publisher built by
/// `publisher_factory` and every stream's NACKs onto `nack_tx`.
pub fn spawn_demux_tree(
    rtp_in: mpsc::Receiver<RtpPacket>,
    codecs: Arc<CodecSet>,
    cname_tree: Arc<CnameTree>,
    publisher_factory: Arc<dyn Fn(u32, &'static str) -> Box<dyn DownstreamPublisher> + Send + Sync>,
    nack_tx: mpsc::Sender<RtcpPacket>,
    sender_ssrc: u32,
    jitter_delay: Duration,
) {
    let clock_map = Arc::new(RtpClockMap::new());

    {
        let cname_tree = cname_tree.clone();
        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                sweep.tick().await;
                cname_tree.sweep(Instant::now());
            }
        });
    }

    tokio::spawn(run_ssrc_demux(rtp_in, move |ssrc_handle: SsrcHandle| {
        let codecs = codecs.clone();
        let cname_tree = cname_tree.clone();
        let publisher_factory = publisher_factory.clone();
        let nack_tx = nack_tx.clone();
        let clock_map = clock_map.clone();

        tokio::spawn(async move {
            let ssrc = ssrc_handle.ssrc;
            cname_tree.note_ssrc_seen(ssrc, Instant::now());

            run_payload_type_demux(ssrc, codecs, ssrc_handle.rtp_rx, move |pt_handle: PayloadTypeHandle| {
                let publisher = publisher_factory(pt_handle.ssrc, pt_handle.mime_family);
                tokio::spawn(run_stream_pipeline(
                    pt_handle.ssrc,
                    sender_ssrc,
                    pt_handle.clock_rate,
                    clock_map.clone(),
                    pt_handle.rtp_rx,
                    jitter_delay,
                    publisher,
                    nack_tx.clone(),
                ));
            })
            .await;
        });
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rtp_proto::rtp::RtpHeader;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn packet(ssrc: u32, payload_type: u8, seq: u16) -> RtpPacket {
        RtpPacket {
            header: RtpHeader {
                version: 2,
                padding: false,
                marker: false,
                payload_type,
                sequence_number: seq,
                timestamp: seq as u32 * 160,
                ssrc,
                csrc: Default::default(),
                extensions: Default::default(),
            },
            payload: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn ssrc_demux_invokes_callback_once_per_ssrc() {
        let (tx, rx) = mpsc::channel(8);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();

        tokio::spawn(run_ssrc_demux(rx, move |mut handle| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move { while handle.rtp_rx.recv().await.is_some() {} });
        }));

        tx.send(packet(1, 96, 0)).await.unwrap();
        tx.send(packet(1, 96, 1)).await.unwrap();
        tx.send(packet(2, 96, 0)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn payload_type_demux_drops_unknown_payload_types() {
        let (tx, rx) = mpsc::channel(8);
        let codecs = Arc::new(CodecSet::default());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();

        tokio::spawn(run_payload_type_demux(1, codecs, rx, move |mut handle| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move { while handle.rtp_rx.recv().await.is_some() {} });
        }));

        tx.send(packet(1, 255, 0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        tx.send(packet(1, 96, 0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cname_tree_defaults_unregistered_ssrcs() {
        let tree = CnameTree::new();
        assert_eq!(tree.cname_of(42), DEFAULT_CNAME);
    }

    #[test]
    fn cname_tree_applies_sdes_chunks() {
        let tree = CnameTree::new();
        tree.observe_sdes(&[(42, "alice@example".to_string())], Instant::now());
        assert_eq!(tree.cname_of(42), "alice@example");
    }

    #[test]
    fn missing_tracker_reports_and_clears_a_gap() {
        let mut tracker = MissingTracker::default();
        tracker.observe(100);
        tracker.observe(103);
        assert_eq!(tracker.snapshot(), vec![101, 102]);

        tracker.observe(101);
        assert_eq!(tracker.snapshot(), vec![102]);

        tracker.observe(102);
        assert!(tracker.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stream_pipeline_retries_nack_until_the_gap_closes() {
        let (rtp_tx, rtp_rx) = mpsc::channel(8);
        let (publisher, mut published_rx) = crate::collab::ChannelPublisher::new(8);
        let (nack_tx, mut nack_rx) = mpsc::channel(8);

        tokio::spawn(run_stream_pipeline(
            9,
            1,
            90_000,
            Arc::new(RtpClockMap::new()),
            rtp_rx,
            Duration::from_millis(10),
            Box::new(publisher),
            nack_tx,
        ));

        rtp_tx.send(packet(9, 96, 0)).await.unwrap();
        rtp_tx.send(packet(9, 96, 2)).await.unwrap();

        let first_nack = nack_rx.recv().await.unwrap();
        match first_nack {
            RtcpPacket::TransportLayerNack { media_ssrc, pairs, .. } => {
                assert_eq!(media_ssrc, 9);
                assert_eq!(rtp_proto::rtcp::expand_nack_pairs(&pairs), vec![1]);
            }
            other => panic!("unexpected packet: {other:?}"),
        }

        let second_nack = nack_rx.recv().await.unwrap();
        assert!(matches!(second_nack, RtcpPacket::TransportLayerNack { .. }));

        rtp_tx.send(packet(9, 96, 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(
            tokio::time::timeout(Duration::from_millis(300), nack_rx.recv())
                .await
                .is_err(),
            "no further nack once the gap is filled"
        );

        let first = published_rx.recv().await.unwrap();
        assert_eq!(first.header.sequence_number, 0);
    }
}
