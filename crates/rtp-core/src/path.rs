//! One congestion-controlled path: a single UDP endpoint wrapped with
//! outbound transport-wide-sequence tagging, a periodic sender-clock probe,
//! and a feedback-ingest loop that drives a [`nada`] rate controller
//! (`spec.md` §4.E).

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU16, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rtp_proto::{
    ntp,
    rtcp::{self, CcfbSsrcReport, RtcpPacket},
    rtp::RtpPacket,
};
use tokio::{
    net::UdpSocket,
    sync::{mpsc, oneshot},
    time::Instant,
};

use crate::{nada, send_buffer::SendBuffer, Error};

const CC_SEND_BUFFER_SIZE: usize = 1 << 14;
const SENDER_CLOCK_INTERVAL: Duration = Duration::from_millis(500);
const SILENCE_TIMEOUT: Duration = Duration::from_secs(10);
const READ_BUFFER_SIZE: usize = 2048;
const CHANNEL_CAPACITY: usize = 128;

/// `spec.md` §4.E: "Until the first feedback arrives, the path returns a
/// minimal bitrate (e.g. 1 kbit/s) so the bonded scheduler does not
/// blackhole it."
const BOOTSTRAP_TARGET_RATE_BPS: u64 = 1_000;

struct Shared {
    outbound_seq: AtomicU16,
    /// Keyed by the path's own transport-wide sequence, storing the
    /// encoded packet length in bytes so a returning CCFB entry can be
    /// turned into a bit count for the NADA receiving-rate estimate.
    cc_send_buffer: Mutex<SendBuffer<u32>>,
    nada_sender: Mutex<nada::Sender>,
    nada_receiver: Mutex<nada::Receiver>,
    received_feedback: AtomicBool,
}

/// The write half: tagging, transmission, and the live rate the bonded
/// transport's scheduler should weight this path by.
pub struct PathHandle {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    shared: Arc<Shared>,
}

/// The read half plus the one-shot failure signal, handed to whoever spawned
/// this path (normally [`crate::bonded`]).
pub struct PathEvents {
    pub rtp_rx: mpsc::Receiver<RtpPacket>,
    pub rtcp_rx: mpsc::Receiver<RtcpPacket>,
    pub closed: oneshot::Receiver<Error>,
}

/// Spawns the probe and feedback-ingest tasks for one path and returns its
/// write handle and read-side events. `socket` should already be bound (and,
/// for the bonded transport's case, bound to a specific device); `remote` is
/// the address every probe, tagged RTP packet, and outbound RTCP compound is
/// sent to.
pub fn spawn(socket: UdpSocket, remote: SocketAddr, config: nada::Config) -> (PathHandle, PathEvents) {
    let socket = Arc::new(socket);
    let shared = Arc::new(Shared {
        outbound_seq: AtomicU16::new(0),
        cc_send_buffer: Mutex::new(SendBuffer::new(CC_SEND_BUFFER_SIZE)),
        nada_sender: Mutex::new(nada::Sender::new(config)),
        nada_receiver: Mutex::new(nada::Receiver::new(config)),
        received_feedback: AtomicBool::new(false),
    });

    let (rtp_tx, rtp_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (rtcp_tx, rtcp_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (closed_tx, closed_rx) = oneshot::channel();

    tokio::spawn(run_probe(socket.clone(), remote));
    tokio::spawn(run_reader(socket.clone(), remote, shared.clone(), rtp_tx, rtcp_tx, closed_tx));

    (
        PathHandle { socket, remote, shared },
        PathEvents { rtp_rx, rtcp_rx, closed: closed_rx },
    )
}

impl PathHandle {
    /// (a) Outbound tagging: stamps the next transport-wide sequence onto
    /// `packet`, records `(seq, send time, encoded length)` in the cc send
    /// buffer, and transmits it.
    pub async fn write_rtp(&self, mut packet: RtpPacket) -> Result<(), Error> {
        let seq = self.shared.outbound_seq.fetch_add(1, Ordering::Relaxed);
        packet.header = packet.header.with_transport_wide_sequence(seq);

        let mut buf = BytesMut::new();
        packet.encode(&mut buf);
        let encoded_len = buf.len() as u32;

        self.shared
            .cc_send_buffer
            .lock()
            .add(seq, SystemTime::now(), encoded_len);

        self.socket
            .send_to(&buf, self.remote)
            .await
            .map_err(Error::PathError)?;
        Ok(())
    }

    pub async fn write_rtcp(&self, packets: &[RtcpPacket]) -> Result<(), Error> {
        let compound = rtcp::encode_compound(packets);
        self.socket
            .send_to(&compound, self.remote)
            .await
            .map_err(Error::PathError)?;
        Ok(())
    }

    /// Current send-rate budget, per the NADA sender's `get_target_rate`, or
    /// [`BOOTSTRAP_TARGET_RATE_BPS`] before any feedback has arrived.
    pub fn target_rate_bps(&self, buffer_len: u64) -> u64 {
        if !self.shared.received_feedback.load(Ordering::Relaxed) {
            return BOOTSTRAP_TARGET_RATE_BPS;
        }
        self.shared.nada_sender.lock().get_target_rate(buffer_len)
    }

    /// Current smoothed loss ratio, for the bonded transport's aggregate.
    pub fn loss_ratio(&self) -> f64 {
        self.shared.nada_receiver.lock().loss_ratio()
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }
}

/// (b) Periodic probe: every [`SENDER_CLOCK_INTERVAL`], sends a sender-clock
/// RTCP packet carrying the current wallclock. Not associated with any media
/// SSRC — this is path-level infrastructure, so `sender_ssrc` is always 0.
async fn run_probe(socket: Arc<UdpSocket>, remote: SocketAddr) {
    let mut ticker = tokio::time::interval(SENDER_CLOCK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let mut buf = BytesMut::new();
        rtcp::encode_sender_clock(&mut buf, 0, ntp::to_ntp64(SystemTime::now()));

        if socket.send_to(&buf, remote).await.is_err() {
            break;
        }
    }
}

/// (c) Feedback ingest: reads datagrams off the socket, separates RTP from
/// RTCP, and handles CCFB/receiver-clock locally while passing everything
/// else through to `rtcp_tx`. Signals `closed_tx` once, on a socket error or
/// after [`SILENCE_TIMEOUT`] without a datagram, per `spec.md` §4.E "Path
/// failure".
async fn run_reader(
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    shared: Arc<Shared>,
    rtp_tx: mpsc::Sender<RtpPacket>,
    rtcp_tx: mpsc::Sender<RtcpPacket>,
    closed_tx: oneshot::Sender<Error>,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let deadline = Instant::now() + SILENCE_TIMEOUT;

        let recv = tokio::select! {
            result = socket.recv_from(&mut buf) => result,
            _ = tokio::time::sleep_until(deadline) => {
                let _ = closed_tx.send(Error::PathError(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "no datagram received within the silence timeout",
                )));
                return;
            }
        };

        let (len, from) = match recv {
            Ok(pair) => pair,
            Err(err) => {
                let _ = closed_tx.send(Error::PathError(err));
                return;
            }
        };

        if from != remote || len < 2 {
            continue;
        }

        let datagram = Bytes::copy_from_slice(&buf[..len]);

        if rtp_proto::rtp::is_rtp_payload_type(datagram[1]) {
            if let Ok(packet) = RtpPacket::decode(datagram) {
                let _ = rtp_tx.try_send(packet);
            }
            continue;
        }

        let Ok(compound) = rtcp::decode_compound(datagram) else {
            continue;
        };

        for packet in compound {
            handle_feedback_packet(&shared, packet, &rtcp_tx).await;
        }
    }
}

async fn handle_feedback_packet(shared: &Arc<Shared>, packet: RtcpPacket, rtcp_tx: &mpsc::Sender<RtcpPacket>) {
    match packet {
        RtcpPacket::Ccfb {
            report_timestamp,
            reports,
            ..
        } => handle_ccfb(shared, report_timestamp, reports),
        RtcpPacket::ReceiverClock {
            last_sender_ntp,
            delay_since_receive,
            ..
        } => handle_receiver_clock(shared, last_sender_ntp, delay_since_receive),
        other => {
            let _ = rtcp_tx.try_send(other);
        }
    }
}

/// Flattens every per-SSRC block's entries (the `ssrc` field names whichever
/// stream happened to carry each transport-wide sequence; what matters for
/// lookup is the sequence itself), sorts by transport-wide sequence, and
/// feeds each into the NADA receiver.
fn handle_ccfb(shared: &Arc<Shared>, report_timestamp: u32, reports: Vec<CcfbSsrcReport>) {
    let report_time = ntp::from_ntp32_mid_near(report_timestamp, SystemTime::now());

    let mut entries: Vec<_> = reports.into_iter().flat_map(|r| r.entries).collect();
    entries.sort_by_key(|entry| entry.sequence);

    let mut cc_send_buffer = shared.cc_send_buffer.lock();
    let mut nada_receiver = shared.nada_receiver.lock();

    for entry in entries {
        let Some((send_time, &encoded_len)) = cc_send_buffer.get(entry.sequence) else {
            log::debug!(
                "ccfb feedback for untracked transport-wide sequence {}",
                entry.sequence
            );
            continue;
        };

        if !entry.received {
            nada_receiver.on_packet_lost();
            continue;
        }

        let arrival_time = report_time
            .checked_sub(entry.arrival_offset)
            .unwrap_or(report_time);
        let forward_delay = arrival_time
            .duration_since(send_time)
            .unwrap_or(Duration::ZERO);

        nada_receiver.on_receive_media_packet(forward_delay, encoded_len as u64 * 8, entry.ecn_marked);
    }

    let now = Instant::now();
    let report = nada_receiver.build_report(now);
    drop(nada_receiver);
    drop(cc_send_buffer);

    shared.nada_sender.lock().on_feedback(&report, now);
    shared.received_feedback.store(true, Ordering::Relaxed);
}

/// `spec.md` §4.E: "delivers a current RTT estimate as `NTP_now −
/// last_echoed_sender_NTP − remote_delay`."
fn handle_receiver_clock(shared: &Arc<Shared>, last_sender_ntp: u64, delay_since_receive: u32) {
    let now = SystemTime::now();
    let sent_at = ntp::from_ntp64(last_sender_ntp);

    let Ok(elapsed) = now.duration_since(sent_at) else {
        return;
    };

    let remote_delay = ntp::duration_from_16_16(delay_since_receive);
    let rtt = elapsed.saturating_sub(remote_delay);
    shared.nada_sender.lock().on_rtt_sample(rtt);
}
