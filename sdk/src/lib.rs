//! # rtp-relay SDK
//!
//! An embeddable facade over `rtp-relay-core`'s bonded transport, for
//! applications that want to drive a sending session from their own process
//! rather than running the `rtp-sender` binary. This mirrors the role the
//! teacher's `sdk` crate plays for `turn-server`: a thin client surface atop
//! the core engine, minus its gRPC control-plane transport (there is no
//! remote control plane in scope here — see `DESIGN.md`).
//!
//! ## Usage
//!
//! ```no_run
//! use std::{net::Ipv4Addr, sync::Arc, time::Duration};
//!
//! use rtp_core::{collab::{InterfaceCandidate, StaticInterfaceLister}, nada};
//! use rtp_relay_sdk::{NoopHooks, SenderSession};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let lister = Arc::new(StaticInterfaceLister::new(vec![InterfaceCandidate {
//!     name: "wlan0".to_string(),
//!     address: Ipv4Addr::new(192, 168, 1, 20),
//! }]));
//!
//! let session = SenderSession::start(
//!     "203.0.113.1:5000".parse()?,
//!     nada::Config::default(),
//!     lister,
//! );
//! session.watch_rate(Arc::new(NoopHooks), Duration::from_secs(1));
//! # Ok(())
//! # }
//! ```

pub use rtp_core;
pub use rtp_proto;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use rtp_core::{bonded::BondedTransport, collab::InterfaceLister, nada};
use rtp_proto::{rtcp::RtcpPacket, rtp::RtpPacket};

/// Lifecycle callbacks an embedder can implement to observe a
/// [`SenderSession`] without polling its accessors directly. Every hook has
/// a default no-op implementation, the same "all handlers optional" shape
/// the teacher's hooks trait uses.
pub trait SessionHooks: Send + Sync {
    /// A new path came up on `interface`.
    #[allow(unused_variables)]
    fn on_path_opened(&self, interface: &str) {}

    /// A previously-open path on `interface` is gone.
    #[allow(unused_variables)]
    fn on_path_closed(&self, interface: &str) {}

    /// The bonded transport's aggregate target rate and weighted loss ratio
    /// changed (`spec.md` §4.F: `get_estimated_bitrate()`).
    #[allow(unused_variables)]
    fn on_rate_update(&self, target_rate_bps: u64, loss_ratio: f64) {}
}

/// A [`SessionHooks`] that ignores every event, the default for an embedder
/// that only wants `SenderSession`'s direct accessors.
pub struct NoopHooks;

impl SessionHooks for NoopHooks {}

/// An embeddable sending session: a bonded transport opened toward `remote`,
/// kept in sync with the host's interfaces by its own background poll task.
/// Wraps the same [`BondedTransport`] the `rtp-sender` binary drives, minus
/// that binary's CLI, config file, and metrics exporter.
pub struct SenderSession {
    transport: Arc<BondedTransport>,
}

impl SenderSession {
    /// Opens a bonded transport toward `remote` and starts its
    /// interface-poll task against `lister` (`spec.md` §4.F).
    pub fn start(remote: SocketAddr, nada_config: nada::Config, lister: Arc<dyn InterfaceLister>) -> Self {
        let transport = BondedTransport::new(remote, nada_config);
        tokio::spawn(transport.clone().run_interface_poll(lister));
        Self { transport }
    }

    /// Wraps an already-constructed transport, for embedders that want to
    /// manage the interface-poll task themselves.
    pub fn from_transport(transport: Arc<BondedTransport>) -> Self {
        Self { transport }
    }

    /// The underlying transport, for callers that need direct access beyond
    /// this facade's surface.
    pub fn transport(&self) -> &Arc<BondedTransport> {
        &self.transport
    }

    pub async fn write_rtp(&self, packet: RtpPacket, buffer_len: u64) -> Result<(), rtp_core::Error> {
        self.transport.write_rtp(packet, buffer_len).await
    }

    pub async fn write_rtcp(&self, packets: &[RtcpPacket]) -> Result<(), rtp_core::Error> {
        self.transport.write_rtcp(packets).await
    }

    pub async fn read_rtp(&self) -> Option<RtpPacket> {
        self.transport.read_rtp().await
    }

    pub async fn read_rtcp(&self) -> Option<RtcpPacket> {
        self.transport.read_rtcp().await
    }

    /// `(target_rate_bps, loss_ratio)` aggregated across every open path.
    pub fn estimated_bitrate(&self) -> (u64, f64) {
        self.transport.get_estimated_bitrate()
    }

    /// Spawns a task that calls `hooks.on_rate_update` on every tick of
    /// `interval` for the lifetime of the process (or until every clone of
    /// the underlying transport is dropped).
    pub fn watch_rate(&self, hooks: Arc<dyn SessionHooks>, interval: Duration) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let (rate, loss) = transport.get_estimated_bitrate();
                hooks.on_rate_update(rate, loss);
            }
        });
    }

    /// Spawns a task that diffs the transport's open-interface set on every
    /// tick of `interval`, calling `on_path_opened`/`on_path_closed` for
    /// whatever changed since the previous tick.
    pub fn watch_paths(&self, hooks: Arc<dyn SessionHooks>, interval: Duration) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let mut known: std::collections::HashSet<String> = std::collections::HashSet::new();
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let current: std::collections::HashSet<String> =
                    transport.open_interface_names().into_iter().collect();

                for name in current.difference(&known) {
                    hooks.on_path_opened(name);
                }
                for name in known.difference(&current) {
                    hooks.on_path_closed(name);
                }
                known = current;
            }
        });
    }
}
