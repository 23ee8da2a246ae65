//! The relay binary: one ingress socket, the SSRC return manager, and the
//! demultiplex tree (`spec.md` §4.G), matching the teacher's `main.rs`
//! shape (global allocator, config load, logger init, delegate to the
//! process's main loop).

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::{sync::Arc, time::Duration};

use rtp_core::{
    collab::{CodecSet, DownstreamPublisher},
    demux::{self, CnameTree},
    ingress::{self, IngressEvents},
};
use rtp_relay::{config::Config, statistics::METRICS};
use tokio::net::UdpSocket;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    rtp_relay::init_logging(&config)?;
    rtp_relay::spawn_metrics_server(&config);

    let socket = UdpSocket::bind(config.relay.listen).await?;
    log::info!("rtp-relay listening on {}", config.relay.listen);

    let (manager, events) = ingress::spawn(socket);
    let manager = Arc::new(manager);
    let IngressEvents { rtp_rx, mut rtcp_rx } = events;

    let codecs = Arc::new(CodecSet::default());
    let cname_tree = Arc::new(CnameTree::new());
    let jitter_delay = config
        .jitter
        .stage_delays()
        .into_iter()
        .next()
        .unwrap_or(Duration::from_millis(120));

    let (nack_tx, mut nack_rx) = tokio::sync::mpsc::channel(128);

    let publisher_factory: Arc<dyn Fn(u32, &'static str) -> Box<dyn DownstreamPublisher> + Send + Sync> =
        Arc::new(|ssrc, family| {
            log::info!("demux: new {family} stream for ssrc {ssrc}");
            let (publisher, receiver) = rtp_core::collab::ChannelPublisher::new(128);
            // Nothing downstream of the relay is in scope for this system
            // (`spec.md` §1 Non-goals: decoding/rendering/recording); drop
            // the receiver so the publisher's channel drains silently.
            drop(receiver);
            Box::new(publisher)
        });

    demux::spawn_demux_tree(
        rtp_rx,
        codecs,
        cname_tree.clone(),
        publisher_factory,
        nack_tx,
        manager.own_ssrc(),
        jitter_delay,
    );

    {
        let manager = manager.clone();
        tokio::spawn(async move {
            while let Some(packet) = nack_rx.recv().await {
                METRICS.nacks_emitted.inc();
                manager.write_rtcp(&[packet]).await;
            }
        });
    }

    while let Some(packet) = rtcp_rx.recv().await {
        match packet {
            rtp_proto::rtcp::RtcpPacket::SourceDescription { chunks } => {
                cname_tree.observe_sdes(&chunks, tokio::time::Instant::now());
            }
            other => log::debug!("relay: unhandled inbound rtcp: {other:?}"),
        }
    }

    Ok(())
}
