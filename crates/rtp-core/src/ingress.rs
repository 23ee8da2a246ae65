//! SSRC return manager: the relay's single ingress listen socket. Splits
//! each datagram into RTP or RTCP by payload-type byte, tracks which sender
//! address last spoke for which SSRC, accumulates per-sender CCFB feedback
//! and flushes it on a timer, and routes outbound RTCP back to the sender(s)
//! named by its destination SSRCs (`spec.md` §4.G "SSRC return manager").

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, SystemTime},
};

use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rtp_proto::{
    ntp,
    rtcp::{self, RtcpPacket},
    rtp::RtpPacket,
};
use tokio::{net::UdpSocket, sync::mpsc};

use crate::Error;

const READ_BUFFER_SIZE: usize = 2048;
const CCFB_FLUSH_INTERVAL: Duration = Duration::from_millis(100);
const CHANNEL_CAPACITY: usize = 128;

/// One sender address's accumulated arrival log since the last CCFB flush,
/// grouped by the SSRC each packet carried — a single remote peer can
/// multiplex several media SSRCs over one socket, matching the Go
/// original's per-sender `ccfb` entry.
///
/// ECN marking is always recorded as `false`: the original reads it off the
/// socket's per-datagram IP-layer control message, a raw `cmsg`/`IP_RECVTOS`
/// facility `tokio::net::UdpSocket` does not expose portably and nothing
/// else in this codebase establishes a pattern for (see DESIGN.md).
#[derive(Default)]
struct CcfbLog {
    by_ssrc: BTreeMap<u32, Vec<(u16, SystemTime, bool)>>,
}

impl CcfbLog {
    fn record(&mut self, ssrc: u32, transport_seq: u16, arrival: SystemTime) {
        self.by_ssrc
            .entry(ssrc)
            .or_default()
            .push((transport_seq, arrival, false));
    }

    /// Drains the log into the `(ssrc, base_sequence, entries)` shape
    /// `rtcp::encode_ccfb` expects, reporting every sequence between the
    /// lowest and highest observed for each SSRC — unseen ones as
    /// not-received — per RFC 8888's fixed-stride report block.
    fn drain_reports(&mut self, reference: SystemTime) -> Vec<(u32, u16, Vec<(bool, bool, Duration)>)> {
        let mut reports = Vec::with_capacity(self.by_ssrc.len());

        for (ssrc, mut observed) in std::mem::take(&mut self.by_ssrc) {
            if observed.is_empty() {
                continue;
            }
            observed.sort_by_key(|(seq, _, _)| *seq);

            let base_sequence = observed[0].0;
            let span = (observed.last().unwrap().0.wrapping_sub(base_sequence) as usize + 1).min(u16::MAX as usize);

            let mut entries: Vec<Option<(bool, bool, Duration)>> = vec![None; span];
            for (seq, arrival, ecn_marked) in observed {
                let offset = seq.wrapping_sub(base_sequence) as usize;
                if let Some(slot) = entries.get_mut(offset) {
                    let arrival_offset = reference.duration_since(arrival).unwrap_or(Duration::ZERO);
                    *slot = Some((true, ecn_marked, arrival_offset));
                }
            }

            let filled: Vec<(bool, bool, Duration)> = entries
                .into_iter()
                .map(|slot| slot.unwrap_or((false, false, Duration::ZERO)))
                .collect();

            reports.push((ssrc, base_sequence, filled));
        }

        reports
    }

    fn is_empty(&self) -> bool {
        self.by_ssrc.is_empty()
    }
}

/// Handles for one ingress manager: RTP/RTCP read from the socket, plus the
/// manager itself for outbound writes.
pub struct IngressEvents {
    pub rtp_rx: mpsc::Receiver<RtpPacket>,
    pub rtcp_rx: mpsc::Receiver<RtcpPacket>,
}

/// The listen socket's SSRC tracking and CCFB feedback state, shared
/// between the reader task, the CCFB flush task, and [`IngressManager`]'s
/// own `write_rtcp`.
struct Shared {
    socket: UdpSocket,
    sources: RwLock<AHashMap<u32, SocketAddr>>,
    ccfb: Mutex<AHashMap<SocketAddr, CcfbLog>>,
    own_ssrc: u32,
}

pub struct IngressManager {
    shared: Arc<Shared>,
}

/// Binds the manager to `socket`, spawns its reader and CCFB-flush tasks,
/// and returns the manager (for outbound writes) alongside the channels
/// carrying its decoded RTP/RTCP.
pub fn spawn(socket: UdpSocket) -> (IngressManager, IngressEvents) {
    let shared = Arc::new(Shared {
        socket,
        sources: RwLock::new(AHashMap::new()),
        ccfb: Mutex::new(AHashMap::new()),
        own_ssrc: rand::random(),
    });

    let (rtp_tx, rtp_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (rtcp_tx, rtcp_rx) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::spawn(run_reader(shared.clone(), rtp_tx, rtcp_tx));
    tokio::spawn(run_ccfb_flush(shared.clone()));

    (IngressManager { shared }, IngressEvents { rtp_rx, rtcp_rx })
}

impl IngressManager {
    /// This manager's own SSRC, used as the sender SSRC on every outbound
    /// CCFB report and available to callers that need to stamp it onto
    /// other RTCP they originate (e.g. the demux tree's NACK timers).
    pub fn own_ssrc(&self) -> u32 {
        self.shared.own_ssrc
    }

    /// Marshals `packets` once and sends a copy to every distinct
    /// destination-SSRC's tracked sender address, skipping (and logging)
    /// any destination SSRC this manager has never seen RTP or RTCP from.
    /// Returns the number of UDP writes issued.
    pub async fn write_rtcp(&self, packets: &[RtcpPacket]) -> usize {
        let compound = rtcp::encode_compound(packets);

        let mut destinations: Vec<SocketAddr> = Vec::new();
        {
            let sources = self.shared.sources.read();
            for packet in packets {
                for ssrc in packet.destination_ssrcs() {
                    match sources.get(&ssrc) {
                        Some(addr) => {
                            if !destinations.contains(addr) {
                                destinations.push(*addr);
                            }
                        }
                        None => log::warn!("{}", Error::RouteUnknown(ssrc)),
                    }
                }
            }
        }

        let mut sent = 0;
        for addr in destinations {
            match self.shared.socket.send_to(&compound, addr).await {
                Ok(_) => sent += 1,
                Err(err) => log::warn!("failed to send rtcp to {addr}: {err}"),
            }
        }
        sent
    }
}

async fn run_reader(shared: Arc<Shared>, rtp_tx: mpsc::Sender<RtpPacket>, rtcp_tx: mpsc::Sender<RtcpPacket>) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let (len, sender) = match shared.socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(err) => {
                log::warn!("ingress read error: {err}");
                continue;
            }
        };

        if len < 2 {
            continue;
        }

        let datagram = Bytes::copy_from_slice(&buf[..len]);

        if rtp_proto::rtp::is_rtp_payload_type(datagram[1]) {
            let Ok(packet) = RtpPacket::decode(datagram) else {
                continue;
            };

            shared.sources.write().insert(packet.header.ssrc, sender);

            if let Some(transport_seq) = packet.header.transport_wide_sequence() {
                shared
                    .ccfb
                    .lock()
                    .entry(sender)
                    .or_default()
                    .record(packet.header.ssrc, transport_seq, SystemTime::now());
            }

            let _ = rtp_tx.try_send(packet);
            continue;
        }

        let Ok(compound) = rtcp::decode_compound(datagram) else {
            continue;
        };

        for packet in compound {
            for ssrc in packet.destination_ssrcs() {
                shared.sources.write().insert(ssrc, sender);
            }
            if rtcp_tx.try_send(packet).is_err() {
                log::debug!("dropping rtcp packet: consumer backpressure or gone");
            }
        }
    }
}

/// Every [`CCFB_FLUSH_INTERVAL`], builds and sends one CCFB report per
/// sender with pending arrivals, using the manager's own fixed
/// `own_ssrc` as the report's sender SSRC. Senders whose write fails lose
/// their accumulated log, matching the Go original's delete-on-failure
/// behavior (the next RTP packet from that address starts a fresh one).
async fn run_ccfb_flush(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(CCFB_FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let now = SystemTime::now();

        let pending: Vec<(SocketAddr, Vec<(u32, u16, Vec<(bool, bool, Duration)>)>)> = {
            let mut ccfb = shared.ccfb.lock();
            ccfb.iter_mut()
                .filter(|(_, log)| !log.is_empty())
                .map(|(addr, log)| (*addr, log.drain_reports(now)))
                .collect()
        };

        for (addr, reports) in pending {
            if reports.is_empty() {
                continue;
            }

            let mut buf = bytes::BytesMut::new();
            rtcp::encode_ccfb(&mut buf, shared.own_ssrc, ntp::to_ntp32_mid(now), &reports);

            if shared.socket.send_to(&buf, addr).await.is_err() {
                shared.ccfb.lock().remove(&addr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtp_proto::rtp::RtpHeader;
    use std::net::Ipv4Addr;

    fn rtp_packet(ssrc: u32, seq: u16, transport_seq: u16) -> RtpPacket {
        RtpPacket {
            header: RtpHeader {
                version: 2,
                padding: false,
                marker: false,
                payload_type: 96,
                sequence_number: seq,
                timestamp: seq as u32 * 160,
                ssrc,
                csrc: Default::default(),
                extensions: Default::default(),
            }
            .with_transport_wide_sequence(transport_seq),
            payload: Bytes::new(),
        }
    }

    async fn bound_socket() -> UdpSocket {
        UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap()
    }

    #[tokio::test]
    async fn reader_tracks_ssrc_source_and_forwards_rtp() {
        let server_socket = bound_socket().await;
        let server_addr = server_socket.local_addr().unwrap();
        let client_socket = bound_socket().await;
        let client_addr = client_socket.local_addr().unwrap();

        let (manager, mut events) = spawn(server_socket);

        let mut buf = bytes::BytesMut::new();
        rtp_packet(42, 0, 0).encode(&mut buf);
        client_socket.send_to(&buf, server_addr).await.unwrap();

        let received = tokio::time::timeout(Duration::from_millis(500), events.rtp_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.header.ssrc, 42);

        assert_eq!(manager.shared.sources.read().get(&42), Some(&client_addr));
    }

    #[tokio::test]
    async fn write_rtcp_routes_to_the_tracked_sender_and_skips_unknown_ssrcs() {
        let server_socket = bound_socket().await;
        let server_addr = server_socket.local_addr().unwrap();
        let client_socket = bound_socket().await;
        let client_addr = client_socket.local_addr().unwrap();

        let (manager, mut events) = spawn(server_socket);

        let mut buf = bytes::BytesMut::new();
        rtp_packet(7, 0, 0).encode(&mut buf);
        client_socket.send_to(&buf, server_addr).await.unwrap();
        events.rtp_rx.recv().await.unwrap();

        let sent = manager
            .write_rtcp(&[RtcpPacket::Goodbye { sources: smallvec::smallvec![7, 999] }])
            .await;
        assert_eq!(sent, 1, "only the known ssrc's address should receive a write");

        let mut recv_buf = vec![0u8; 1500];
        let (len, from) = tokio::time::timeout(Duration::from_millis(500), client_socket.recv_from(&mut recv_buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, server_addr);
        let decoded = rtcp::decode_compound(Bytes::copy_from_slice(&recv_buf[..len])).unwrap();
        assert!(matches!(decoded[0], RtcpPacket::Goodbye { .. }));

        let _ = client_addr;
    }

    #[test]
    fn ccfb_log_reports_a_gap_as_not_received() {
        let mut log = CcfbLog::default();
        let base = SystemTime::now();
        log.record(1, 100, base);
        log.record(1, 102, base + Duration::from_millis(5));

        let reports = log.drain_reports(base + Duration::from_millis(10));
        assert_eq!(reports.len(), 1);
        let (ssrc, base_sequence, entries) = &reports[0];
        assert_eq!(*ssrc, 1);
        assert_eq!(*base_sequence, 100);
        assert_eq!(entries.len(), 3);
        assert!(entries[0].0 && !entries[1].0 && entries[2].0);

        assert!(log.is_empty());
    }
}
