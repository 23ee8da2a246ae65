//! Library surface shared by the `rtp-relay` and `rtp-sender` binaries:
//! configuration and metrics, the ambient stack neither binary wants to
//! duplicate (`spec.md` §9).

pub mod config;
pub mod statistics;

use std::sync::Arc;

use config::Config;

/// Initializes logging and, if configured, starts the metrics server. Both
/// binaries call this before their own main loop, mirroring the teacher's
/// `main.rs` (`simple_logger::init_with_level` immediately after the config
/// is loaded).
pub fn init_logging(config: &Config) -> anyhow::Result<()> {
    simple_logger::init_with_level(config.log.level.as_level())?;
    Ok(())
}

/// Spawns the metrics endpoint if `config.metrics.listen` is set.
pub fn spawn_metrics_server(config: &Arc<Config>) {
    if let Some(listen) = config.metrics.listen {
        tokio::spawn(async move {
            if let Err(err) = statistics::run_metrics_server(listen).await {
                log::error!("metrics server exited: {err}");
            }
        });
    }
}
