//! The sender binary: a real, host-interface-driven bonded transport, the
//! sender-side retransmission buffer, and a synthetic encoder source
//! (`spec.md` §4.A, §4.F). Matches the relay binary's shape (global
//! allocator, config load, logger init) with the interface discovery
//! collaborator's real implementation (`rtp_core::collab::InterfaceLister`
//! doc comment: "the real `getifaddrs`-backed implementation lives in the
//! binaries").

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::{sync::Arc, time::SystemTime};

use rtp_core::{
    collab::{EncoderSource, InterfaceCandidate, InterfaceLister, TestEncoder},
    send_buffer::SendBuffer,
};
use rtp_proto::rtcp::RtcpPacket;
use rtp_relay::{config::Config, statistics::METRICS};
use rtp_relay_sdk::{SenderSession, SessionHooks};
use smallvec::smallvec;
use tokio::time::{interval, Duration};

/// Discovers usable interfaces through the host's `getifaddrs`-equivalent
/// table (`if_addrs::get_if_addrs`), keeping only non-loopback IPv4
/// addresses whose interface name starts with one of `prefixes`
/// (`spec.md` §4.F). The fixed collaborator used by library code and tests
/// is [`rtp_core::collab::StaticInterfaceLister`]; this is the real
/// implementation that backs it in a running process.
struct OsInterfaceLister {
    prefixes: Vec<String>,
}

impl InterfaceLister for OsInterfaceLister {
    fn list(&self) -> Vec<InterfaceCandidate> {
        let interfaces = match if_addrs::get_if_addrs() {
            Ok(interfaces) => interfaces,
            Err(err) => {
                log::warn!("sender: failed to enumerate host interfaces: {err}");
                return Vec::new();
            }
        };

        interfaces
            .into_iter()
            .filter(|iface| !iface.is_loopback())
            .filter(|iface| self.prefixes.iter().any(|prefix| iface.name.starts_with(prefix.as_str())))
            .filter_map(|iface| match iface.ip() {
                std::net::IpAddr::V4(address) => Some(InterfaceCandidate { name: iface.name, address }),
                std::net::IpAddr::V6(_) => None,
            })
            .collect()
    }
}

/// Surfaces [`SessionHooks`] events onto the Prometheus registry and the log,
/// the embeddable facade's analog to the relay binary's inline metric
/// updates.
struct MetricsHooks;

impl SessionHooks for MetricsHooks {
    fn on_path_opened(&self, interface: &str) {
        log::info!("sender: path opened on interface {interface}");
    }

    fn on_path_closed(&self, interface: &str) {
        log::info!("sender: path closed on interface {interface}");
    }

    fn on_rate_update(&self, target_rate_bps: u64, loss_ratio: f64) {
        METRICS.path_target_rate_bps.set(target_rate_bps as i64);
        log::debug!("sender: aggregate target rate {target_rate_bps} bps, loss ratio {loss_ratio:.4}");
    }
}

const FRAME_INTERVAL_MS: u32 = 20;
const CLOCK_RATE: u32 = 90_000;
const PAYLOAD_BYTES: usize = 1200;
const SDES_INTERVAL: Duration = Duration::from_secs(5);
const SEND_BUFFER_SIZE: usize = 1 << 14;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    rtp_relay::init_logging(&config)?;
    rtp_relay::spawn_metrics_server(&config);

    let own_ssrc: u32 = rand::random();
    log::info!(
        "rtp-sender targeting {} as ssrc {own_ssrc} cname {}",
        config.sender.remote,
        config.sender.cname
    );

    let lister: Arc<dyn InterfaceLister> = Arc::new(OsInterfaceLister {
        prefixes: config.sender.interface_prefixes.clone(),
    });

    let session = SenderSession::start(config.sender.remote, config.nada.to_nada_config(), lister);
    session.watch_rate(Arc::new(MetricsHooks), Duration::from_secs(1));
    session.watch_paths(Arc::new(MetricsHooks), Duration::from_secs(1));

    let mut encoder = TestEncoder::new(own_ssrc, 96, CLOCK_RATE, FRAME_INTERVAL_MS, PAYLOAD_BYTES);
    let mut send_buffer: SendBuffer<rtp_proto::rtp::RtpPacket> = SendBuffer::new(SEND_BUFFER_SIZE);

    let mut frame_ticker = interval(Duration::from_millis(FRAME_INTERVAL_MS as u64));
    frame_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut sdes_ticker = interval(SDES_INTERVAL);
    sdes_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = frame_ticker.tick() => {
                let (target_rate_bps, _) = session.estimated_bitrate();
                encoder.set_bitrate(target_rate_bps);

                if let Some(packet) = encoder.next_packet() {
                    let seq = packet.header.sequence_number;
                    send_buffer.add(seq, SystemTime::now(), packet.clone());

                    match session.write_rtp(packet, 0).await {
                        Ok(()) => METRICS.packets_sent.inc(),
                        Err(err) => log::debug!("sender: dropping frame, no path available: {err}"),
                    }
                }
            }
            _ = sdes_ticker.tick() => {
                let chunks = smallvec![(own_ssrc, config.sender.cname.clone())];
                let _ = session.write_rtcp(&[RtcpPacket::SourceDescription { chunks }]).await;
            }
            maybe = session.read_rtcp() => {
                let Some(packet) = maybe else { break };
                handle_inbound_rtcp(&session, &mut send_buffer, packet).await;
            }
        }
    }

    Ok(())
}

/// Answers a transport-layer NACK with whatever of its missing sequences
/// this sender still has buffered, and logs anything else inbound
/// (`spec.md` §4.A "retransmission lookup").
async fn handle_inbound_rtcp(
    session: &SenderSession,
    send_buffer: &mut SendBuffer<rtp_proto::rtp::RtpPacket>,
    packet: RtcpPacket,
) {
    match packet {
        RtcpPacket::TransportLayerNack { pairs, .. } => {
            for seq in rtp_proto::rtcp::expand_nack_pairs(&pairs) {
                let Some((_, packet)) = send_buffer.get(seq) else {
                    log::debug!("sender: nack for seq {seq} no longer in the send buffer");
                    continue;
                };
                let packet = packet.clone();
                if session.write_rtp(packet, 0).await.is_ok() {
                    METRICS.nacks_satisfied.inc();
                }
            }
        }
        other => log::debug!("sender: unhandled inbound rtcp: {other:?}"),
    }
}
