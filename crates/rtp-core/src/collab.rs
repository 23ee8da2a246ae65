//! Trait boundaries for the systems this engine treats as external
//! collaborators (`spec.md` §6): an encoder source, a downstream publisher,
//! a signaling channel, and interface discovery. Each trait ships with a
//! small in-repo implementation, enough to exercise the core end to end
//! without depending on SDP, the gRPC control plane, or real hardware
//! codecs — all explicitly out of scope (`spec.md` §1 Non-goals).

use std::net::Ipv4Addr;

use ahash::AHashMap;
use bytes::Bytes;
use rtp_proto::rtp::{RtpHeader, RtpPacket};
use tokio::sync::mpsc;

/// Produces RTP packets for one (SSRC, payload type) stream under external
/// bitrate/loss control (`spec.md` §6: "Encoder source... exposes
/// `set_bitrate(bps)` and `set_packet_loss_percentage(pct)`").
pub trait EncoderSource: Send {
    fn set_bitrate(&mut self, bps: u64);
    fn set_packet_loss_percentage(&mut self, pct: f32);
    /// Produces the next packet to send, if one is ready.
    fn next_packet(&mut self) -> Option<RtpPacket>;
}

/// A synthetic encoder for tests and local exercising of the core: emits
/// fixed-size packets on an incrementing sequence/timestamp, recording
/// bitrate/loss controls rather than acting on them.
pub struct TestEncoder {
    ssrc: u32,
    payload_type: u8,
    sequence: u16,
    timestamp: u32,
    timestamp_step: u32,
    payload_bytes: usize,
    bitrate_bps: u64,
    loss_percentage: f32,
}

impl TestEncoder {
    /// `clock_rate` and `frame_interval_ms` together fix how far the RTP
    /// timestamp advances per packet (e.g. 90,000 Hz / 20 ms for video).
    pub fn new(ssrc: u32, payload_type: u8, clock_rate: u32, frame_interval_ms: u32, payload_bytes: usize) -> Self {
        Self {
            ssrc,
            payload_type,
            sequence: 0,
            timestamp: 0,
            timestamp_step: clock_rate / (1000 / frame_interval_ms.max(1)),
            payload_bytes,
            bitrate_bps: 0,
            loss_percentage: 0.0,
        }
    }

    pub fn bitrate_bps(&self) -> u64 {
        self.bitrate_bps
    }

    pub fn loss_percentage(&self) -> f32 {
        self.loss_percentage
    }
}

impl EncoderSource for TestEncoder {
    fn set_bitrate(&mut self, bps: u64) {
        self.bitrate_bps = bps;
    }

    fn set_packet_loss_percentage(&mut self, pct: f32) {
        self.loss_percentage = pct;
    }

    fn next_packet(&mut self) -> Option<RtpPacket> {
        let packet = RtpPacket {
            header: RtpHeader {
                version: 2,
                padding: false,
                marker: false,
                payload_type: self.payload_type,
                sequence_number: self.sequence,
                timestamp: self.timestamp,
                ssrc: self.ssrc,
                csrc: Default::default(),
                extensions: Default::default(),
            },
            payload: Bytes::from(vec![0u8; self.payload_bytes]),
        };

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(self.timestamp_step);

        Some(packet)
    }
}

/// A payload type's codec family and RTP clock rate — the piece of SDP
/// negotiation the demultiplex tree needs (`spec.md` §4.G "payload-type
/// demuxer") without depending on SDP itself, which is out of scope
/// (`spec.md` §1 Non-goals).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    Vp8,
    Vp9,
    H264,
    H265,
    Opus,
}

impl CodecKind {
    /// The mime-type family (`"audio"` or `"video"`) the payload-type
    /// demuxer groups by.
    pub fn mime_family(&self) -> &'static str {
        match self {
            CodecKind::Vp8 | CodecKind::Vp9 | CodecKind::H264 | CodecKind::H265 => "video",
            CodecKind::Opus => "audio",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CodecInfo {
    pub kind: CodecKind,
    pub clock_rate: u32,
}

/// A fixed payload-type-to-codec registry, standing in for the mapping a
/// real deployment would learn from SDP negotiation.
pub struct CodecSet {
    by_payload_type: AHashMap<u8, CodecInfo>,
}

impl CodecSet {
    pub fn new() -> Self {
        Self {
            by_payload_type: AHashMap::new(),
        }
    }

    pub fn register(&mut self, payload_type: u8, kind: CodecKind, clock_rate: u32) {
        self.by_payload_type.insert(payload_type, CodecInfo { kind, clock_rate });
    }

    pub fn get(&self, payload_type: u8) -> Option<CodecInfo> {
        self.by_payload_type.get(&payload_type).copied()
    }
}

impl Default for CodecSet {
    /// The static assignment used across this codebase's tests and
    /// examples: VP8 on 96, Opus on 111, matching common WebRTC defaults.
    fn default() -> Self {
        let mut set = Self::new();
        set.register(96, CodecKind::Vp8, 90_000);
        set.register(111, CodecKind::Opus, 48_000);
        set
    }
}

/// Consumes RTP for one (stream id, codec) pair (`spec.md` §6: "Downstream
/// publisher").
pub trait DownstreamPublisher: Send {
    fn publish(&mut self, packet: RtpPacket);
}

/// A channel-backed publisher: forwards every packet to an `mpsc::Receiver`
/// a test (or a real downstream consumer) drains.
pub struct ChannelPublisher {
    tx: mpsc::Sender<RtpPacket>,
}

impl ChannelPublisher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<RtpPacket>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl DownstreamPublisher for ChannelPublisher {
    fn publish(&mut self, packet: RtpPacket) {
        let _ = self.tx.try_send(packet);
    }
}

/// One discovered network interface candidate (`spec.md` §4.F: "enumerates
/// candidate interfaces by name-prefix filter... with at least one IPv4
/// address bound to the interface").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceCandidate {
    pub name: String,
    pub address: Ipv4Addr,
}

/// Discovers the current set of usable network interfaces
/// (`rtp_core::bonded`'s poll loop consumes this every ≈ 1 s). The real
/// `getifaddrs`-backed implementation lives in the binaries; library code
/// and tests depend only on this trait.
pub trait InterfaceLister: Send + Sync {
    fn list(&self) -> Vec<InterfaceCandidate>;
}

/// A fixed interface set: the collaborator implementation used by tests and
/// by any deployment that wants to pin the bonded transport's interface set
/// rather than poll the OS.
pub struct StaticInterfaceLister {
    interfaces: Vec<InterfaceCandidate>,
}

impl StaticInterfaceLister {
    pub fn new(interfaces: Vec<InterfaceCandidate>) -> Self {
        Self { interfaces }
    }
}

impl InterfaceLister for StaticInterfaceLister {
    fn list(&self) -> Vec<InterfaceCandidate> {
        self.interfaces.clone()
    }
}

/// A loopback signaling channel standing in for SDP/gRPC control-plane
/// negotiation (`spec.md` §6: "signaling channel"), used only to let tests
/// exercise the shape of the boundary.
pub struct LoopbackSignaling {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl LoopbackSignaling {
    /// Builds two ends already wired to each other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_b) = mpsc::unbounded_channel();
        let (tx_b, rx_a) = mpsc::unbounded_channel();
        (Self { tx: tx_a, rx: rx_a }, Self { tx: tx_b, rx: rx_b })
    }

    pub fn send(&self, message: Bytes) -> bool {
        self.tx.send(message).is_ok()
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_advances_sequence_and_timestamp() {
        let mut encoder = TestEncoder::new(7, 96, 90_000, 20, 1200);
        let first = encoder.next_packet().unwrap();
        let second = encoder.next_packet().unwrap();

        assert_eq!(first.header.sequence_number, 0);
        assert_eq!(second.header.sequence_number, 1);
        assert_eq!(second.header.timestamp - first.header.timestamp, 1800);
    }

    #[test]
    fn test_encoder_records_bitrate_and_loss_controls() {
        let mut encoder = TestEncoder::new(7, 96, 90_000, 20, 1200);
        encoder.set_bitrate(500_000);
        encoder.set_packet_loss_percentage(2.5);

        assert_eq!(encoder.bitrate_bps(), 500_000);
        assert_eq!(encoder.loss_percentage(), 2.5);
    }

    #[tokio::test]
    async fn channel_publisher_forwards_packets() {
        let (mut publisher, mut rx) = ChannelPublisher::new(8);
        let mut encoder = TestEncoder::new(1, 96, 8_000, 20, 16);

        publisher.publish(encoder.next_packet().unwrap());
        let received = rx.recv().await.unwrap();
        assert_eq!(received.header.ssrc, 1);
    }

    #[test]
    fn static_interface_lister_returns_its_fixed_set() {
        let lister = StaticInterfaceLister::new(vec![InterfaceCandidate {
            name: "wlan0".to_string(),
            address: Ipv4Addr::new(192, 168, 1, 20),
        }]);

        let interfaces = lister.list();
        assert_eq!(interfaces.len(), 1);
        assert_eq!(interfaces[0].name, "wlan0");
    }

    #[test]
    fn codec_set_resolves_registered_payload_types_and_not_others() {
        let codecs = CodecSet::default();
        assert_eq!(codecs.get(96).unwrap().kind.mime_family(), "video");
        assert_eq!(codecs.get(111).unwrap().kind.mime_family(), "audio");
        assert!(codecs.get(97).is_none());
    }

    #[tokio::test]
    async fn loopback_signaling_round_trips_a_message() {
        let (a, mut b) = LoopbackSignaling::pair();
        assert!(a.send(Bytes::from_static(b"offer")));

        let received = b.recv().await.unwrap();
        assert_eq!(received.as_ref(), b"offer");
    }
}
