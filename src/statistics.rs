//! Prometheus metrics: a global registry of counters/gauges covering
//! packets per path, NACK activity, jitter buffer outcomes, congestion
//! control state, and demux table sizes (`spec.md` §9.3), mirroring the
//! teacher's `statistics.rs::prometheus` submodule but with a `LazyLock`
//! registry instead of `once_cell` (`spec.md` §9's resolved Open Question).
//! The `/metrics` route itself is served through `axum`, matching the
//! teacher's `prometheus.rs`/`api.rs`.

use std::net::SocketAddr;
use std::sync::LazyLock;

use axum::http::{header::CONTENT_TYPE, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{register_int_counter, register_int_gauge, Encoder, IntCounter, IntGauge, TextEncoder};
use tokio::net::TcpListener;

pub static METRICS: LazyLock<Metrics> =
    LazyLock::new(|| Metrics::new().expect("failed to register prometheus metrics"));

pub struct Metrics {
    pub packets_sent: IntCounter,
    pub packets_received: IntCounter,
    pub nacks_emitted: IntCounter,
    pub nacks_satisfied: IntCounter,
    pub jitter_evictions: IntCounter,
    pub jitter_duplicates: IntCounter,
    pub ssrc_table_size: IntGauge,
    pub cname_table_size: IntGauge,
    pub path_target_rate_bps: IntGauge,
    pub path_rtt_ms: IntGauge,
}

impl Metrics {
    fn new() -> prometheus::Result<Self> {
        Ok(Self {
            packets_sent: register_int_counter!(
                "rtp_relay_packets_sent_total",
                "RTP packets transmitted across all open paths"
            )?,
            packets_received: register_int_counter!(
                "rtp_relay_packets_received_total",
                "RTP packets received on the ingress socket"
            )?,
            nacks_emitted: register_int_counter!(
                "rtp_relay_nacks_emitted_total",
                "TransportLayerNack packets emitted by a NACK timer or funnel"
            )?,
            nacks_satisfied: register_int_counter!(
                "rtp_relay_nacks_satisfied_total",
                "Sequence gaps closed by a retransmit before their buffer evicted them"
            )?,
            jitter_evictions: register_int_counter!(
                "rtp_relay_jitter_evictions_total",
                "Packets evicted from a jitter buffer for arriving too late"
            )?,
            jitter_duplicates: register_int_counter!(
                "rtp_relay_jitter_duplicates_total",
                "Duplicate sequence numbers observed by a jitter buffer"
            )?,
            ssrc_table_size: register_int_gauge!(
                "rtp_relay_ssrc_table_size",
                "SSRCs currently tracked by the demultiplex tree"
            )?,
            cname_table_size: register_int_gauge!(
                "rtp_relay_cname_table_size",
                "CNAMEs currently tracked by the CNAME demuxer"
            )?,
            path_target_rate_bps: register_int_gauge!(
                "rtp_relay_path_target_rate_bps",
                "Sum of the most recently observed NADA target rate across open paths"
            )?,
            path_rtt_ms: register_int_gauge!(
                "rtp_relay_path_rtt_ms",
                "Most recent round-trip time sample on any open path, in milliseconds"
            )?,
        })
    }
}

/// Encodes the current metric set as Prometheus text exposition format.
pub fn gather(buf: &mut Vec<u8>) -> prometheus::Result<()> {
    TextEncoder::new().encode(&prometheus::gather(), buf)
}

/// Serves `gather()`'s output on `/metrics`, matching the teacher's
/// `prometheus.rs::start_server` route exactly.
pub async fn run_metrics_server(listen: SocketAddr) -> anyhow::Result<()> {
    let app = Router::new().route(
        "/metrics",
        get(|| async move {
            let mut body = Vec::with_capacity(4096);

            if gather(&mut body).is_err() {
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            } else {
                ([(CONTENT_TYPE, "text/plain")], body).into_response()
            }
        }),
    );

    let listener = TcpListener::bind(listen).await?;
    log::info!("metrics endpoint listening: {listen}");

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_encodes_without_error_once_a_counter_has_moved() {
        METRICS.packets_sent.inc();
        let mut buf = Vec::new();
        gather(&mut buf).unwrap();
        assert!(String::from_utf8(buf).unwrap().contains("rtp_relay_packets_sent_total"));
    }
}
