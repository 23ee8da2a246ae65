//! Bonded transport: a mapping from OS device name to [`path::Path`], kept
//! in sync with the host's network interfaces, plus weighted write-side
//! scheduling and a merged read side (`spec.md` §4.F).

use std::{net::SocketAddr, sync::Arc, time::Duration};

use ahash::AHashMap;
use parking_lot::RwLock;
use rand::Rng;
use rtp_proto::{rtcp::RtcpPacket, rtp::RtpPacket};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::{
    collab::InterfaceLister,
    nada,
    path::{self, PathHandle},
    Error,
};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const MERGED_RTP_CAPACITY: usize = 128;

/// `spec.md` §4.F: "Enumerates candidate interfaces by name-prefix filter
/// (e.g. `usb*`, `wlan*`, `eth*`)".
const NAME_PREFIXES: &[&str] = &["usb", "wlan", "eth"];

struct OpenPath {
    handle: Arc<PathHandle>,
}

/// Holds every currently-open path and schedules writes across them. Spawn
/// [`BondedTransport::run_interface_poll`] alongside to keep the path set in
/// sync with `lister`.
pub struct BondedTransport {
    remote: SocketAddr,
    nada_config: nada::Config,
    paths: RwLock<AHashMap<String, OpenPath>>,
    merged_rtp_tx: mpsc::Sender<RtpPacket>,
    merged_rtp_rx: AsyncMutex<mpsc::Receiver<RtpPacket>>,
    merged_rtcp_tx: mpsc::UnboundedSender<RtcpPacket>,
    merged_rtcp_rx: AsyncMutex<mpsc::UnboundedReceiver<RtcpPacket>>,
}

impl BondedTransport {
    pub fn new(remote: SocketAddr, nada_config: nada::Config) -> Arc<Self> {
        let (merged_rtp_tx, merged_rtp_rx) = mpsc::channel(MERGED_RTP_CAPACITY);
        let (merged_rtcp_tx, merged_rtcp_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            remote,
            nada_config,
            paths: RwLock::new(AHashMap::new()),
            merged_rtp_tx,
            merged_rtp_rx: AsyncMutex::new(merged_rtp_rx),
            merged_rtcp_tx,
            merged_rtcp_rx: AsyncMutex::new(merged_rtcp_rx),
        })
    }

    /// `write_rtp(pkt)`: chooses one path by weighted random selection,
    /// weights proportional to each path's current `target_rate`.
    /// `buffer_len` is the caller's outbound stream send-buffer occupancy in
    /// bytes, forwarded into the chosen path's NADA buffer-occupancy shave.
    pub async fn write_rtp(&self, packet: RtpPacket, buffer_len: u64) -> Result<(), Error> {
        let chosen = {
            let paths = self.paths.read();
            let weighted: Vec<(Arc<PathHandle>, u64)> = paths
                .values()
                .map(|p| (p.handle.clone(), p.handle.target_rate_bps(buffer_len)))
                .collect();
            drop(paths);
            pick_weighted(&weighted)
        };

        let Some(handle) = chosen else {
            return Err(Error::NoPathAvailable);
        };

        handle.write_rtp(packet).await
    }

    /// `write_rtcp(pkts)`: dispatched to one random path (arbitrary choice;
    /// RTCP traffic is small).
    pub async fn write_rtcp(&self, packets: &[RtcpPacket]) -> Result<(), Error> {
        let chosen = {
            let paths = self.paths.read();
            let handles: Vec<Arc<PathHandle>> = paths.values().map(|p| p.handle.clone()).collect();
            drop(paths);
            if handles.is_empty() {
                None
            } else {
                let index = rand::rng().random_range(0..handles.len());
                Some(handles[index].clone())
            }
        };

        let Some(handle) = chosen else {
            return Err(Error::NoPathAvailable);
        };

        handle.write_rtcp(packets).await
    }

    pub async fn read_rtp(&self) -> Option<RtpPacket> {
        self.merged_rtp_rx.lock().await.recv().await
    }

    pub async fn read_rtcp(&self) -> Option<RtcpPacket> {
        self.merged_rtcp_rx.lock().await.recv().await
    }

    /// `get_estimated_bitrate()`: `(Σ target_rate, Σ loss_rate·target_rate /
    /// Σ target_rate)`.
    pub fn get_estimated_bitrate(&self) -> (u64, f64) {
        let paths = self.paths.read();
        let mut total_rate = 0u64;
        let mut weighted_loss = 0.0f64;

        for path in paths.values() {
            let rate = path.handle.target_rate_bps(0);
            total_rate += rate;
            weighted_loss += path.handle.loss_ratio() * rate as f64;
        }

        let loss = if total_rate == 0 {
            0.0
        } else {
            weighted_loss / total_rate as f64
        };

        (total_rate, loss)
    }

    /// The interface names currently backing an open path, for embedders
    /// that want to observe the bonded set without their own poll loop
    /// (`rtp_relay_sdk::SenderSession::watch_paths`).
    pub fn open_interface_names(&self) -> Vec<String> {
        self.paths.read().keys().cloned().collect()
    }

    /// Opens a path bound to `candidate`, recording it under `name` and
    /// spawning a task that forwards its events into the merged channels
    /// until it closes or signals failure.
    fn open_path(self: &Arc<Self>, name: String, candidate: std::net::Ipv4Addr) {
        let bind_addr = SocketAddr::new(candidate.into(), 0);
        let socket = match bind_device_socket(bind_addr) {
            Ok(socket) => socket,
            Err(err) => {
                log::warn!("failed to open path on interface {name}: {err}");
                return;
            }
        };

        let (handle, events) = path::spawn(socket, self.remote, self.nada_config);
        let handle = Arc::new(handle);

        self.paths.write().insert(
            name.clone(),
            OpenPath {
                handle: handle.clone(),
            },
        );

        let this = self.clone();
        tokio::spawn(this.run_path_forwarder(name, events));
    }

    async fn run_path_forwarder(self: Arc<Self>, name: String, mut events: path::PathEvents) {
        loop {
            tokio::select! {
                maybe = events.rtp_rx.recv() => {
                    match maybe {
                        Some(packet) => {
                            if self.merged_rtp_tx.send(packet).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                maybe = events.rtcp_rx.recv() => {
                    match maybe {
                        Some(packet) => {
                            let _ = self.merged_rtcp_tx.send(packet);
                        }
                        None => break,
                    }
                }
                result = &mut events.closed => {
                    if let Ok(err) = result {
                        log::warn!("path on interface {name} failed: {err}");
                    }
                    break;
                }
            }
        }

        self.paths.write().remove(&name);
    }

    /// `spec.md` §4.F: on a ≈ 1 s polling interval, diffs the
    /// discovered-interface set against the active path table, opening
    /// paths for newly-present devices and closing paths for devices no
    /// longer present.
    pub async fn run_interface_poll(self: Arc<Self>, lister: Arc<dyn InterfaceLister>) {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let candidates: Vec<_> = lister
                .list()
                .into_iter()
                .filter(|c| NAME_PREFIXES.iter().any(|prefix| c.name.starts_with(prefix)))
                .collect();

            let present: std::collections::HashSet<String> =
                candidates.iter().map(|c| c.name.clone()).collect();

            let vanished: Vec<String> = {
                let paths = self.paths.read();
                paths
                    .keys()
                    .filter(|name| !present.contains(*name))
                    .cloned()
                    .collect()
            };
            for name in vanished {
                self.paths.write().remove(&name);
            }

            for candidate in candidates {
                let already_open = self.paths.read().contains_key(&candidate.name);
                if !already_open {
                    self.open_path(candidate.name, candidate.address);
                }
            }
        }
    }
}

/// Picks one handle with probability proportional to its weight. Returns
/// `None` if every weight (and thus the total) is zero.
fn pick_weighted(weighted: &[(Arc<PathHandle>, u64)]) -> Option<Arc<PathHandle>> {
    let total: u64 = weighted.iter().map(|(_, w)| w).sum();
    if total == 0 {
        return None;
    }

    let mut pick = rand::rng().random_range(0..total);
    for (handle, weight) in weighted {
        if pick < *weight {
            return Some(handle.clone());
        }
        pick -= weight;
    }

    weighted.last().map(|(handle, _)| handle.clone())
}

/// Binds a UDP socket to `bind_addr`, the address already resolved (by the
/// caller, from an [`InterfaceLister`] candidate) to the interface being
/// opened — the portable stand-in for `SO_BINDTODEVICE` used here (see
/// DESIGN.md). Built through `socket2` so `SO_REUSEADDR` can be set before
/// handing the socket to tokio.
fn bind_device_socket(bind_addr: SocketAddr) -> std::io::Result<tokio::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&bind_addr.into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    tokio::net::UdpSocket::from_std(std_socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{InterfaceCandidate, StaticInterfaceLister};
    use std::net::Ipv4Addr;

    #[test]
    fn pick_weighted_returns_none_for_an_empty_table() {
        assert!(pick_weighted(&[]).is_none());
    }

    /// `spec.md` §8 scenario S6: two paths weighted 1 Mbit/s and 3 Mbit/s
    /// should converge to a 25%/75% split over many draws.
    #[tokio::test]
    async fn pick_weighted_converges_to_the_proportional_split() {
        let light_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let light_remote = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (light, _light_events) =
            path::spawn(light_socket, light_remote.local_addr().unwrap(), nada::Config::default());

        let heavy_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let heavy_remote = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (heavy, _heavy_events) =
            path::spawn(heavy_socket, heavy_remote.local_addr().unwrap(), nada::Config::default());

        let light = Arc::new(light);
        let heavy = Arc::new(heavy);
        let weighted = vec![(light.clone(), 1_000_000u64), (heavy.clone(), 3_000_000u64)];

        const DRAWS: u32 = 10_000;
        let mut light_picks = 0u32;
        for _ in 0..DRAWS {
            if Arc::ptr_eq(&pick_weighted(&weighted).unwrap(), &light) {
                light_picks += 1;
            }
        }

        let ratio = light_picks as f64 / DRAWS as f64;
        assert!((ratio - 0.25).abs() < 0.02, "expected ~25% light-path picks, got {ratio}");
    }

    #[tokio::test]
    async fn estimated_bitrate_is_zero_with_no_open_paths() {
        let transport = BondedTransport::new("127.0.0.1:9".parse().unwrap(), nada::Config::default());
        assert_eq!(transport.get_estimated_bitrate(), (0, 0.0));
    }

    #[tokio::test]
    async fn write_rtp_fails_with_no_path_available_when_no_path_is_open() {
        let transport = BondedTransport::new("127.0.0.1:9".parse().unwrap(), nada::Config::default());
        let packet = crate::collab::TestEncoder::new(1, 96, 8_000, 20, 16)
            .next_packet()
            .unwrap();

        let err = transport.write_rtp(packet, 0).await.unwrap_err();
        assert!(matches!(err, Error::NoPathAvailable));
    }

    #[tokio::test]
    async fn interface_poll_opens_and_closes_paths_as_the_lister_changes() {
        let transport = BondedTransport::new("127.0.0.1:9".parse().unwrap(), nada::Config::default());
        let lister: Arc<dyn crate::collab::InterfaceLister> =
            Arc::new(StaticInterfaceLister::new(vec![InterfaceCandidate {
                name: "wlan0".to_string(),
                address: Ipv4Addr::new(127, 0, 0, 1),
            }]));

        let poll_transport = transport.clone();
        let poll_task = tokio::spawn(poll_transport.run_interface_poll(lister));

        for _ in 0..50 {
            if transport.paths.read().contains_key("wlan0") {
                poll_task.abort();
                assert_eq!(transport.open_interface_names(), vec!["wlan0".to_string()]);
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        poll_task.abort();
        panic!("interface poll never opened a path for wlan0");
    }

    #[tokio::test]
    async fn open_interface_names_is_empty_with_no_open_paths() {
        let transport = BondedTransport::new("127.0.0.1:9".parse().unwrap(), nada::Config::default());
        assert!(transport.open_interface_names().is_empty());
    }
}
