//! Background processing: periodic instance re-discovery.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use dbmonitor_core::config::ConfigSource;
use dbmonitor_core::registry::ConnectionRegistry;

/// Re-reads the configuration every `interval` and registers new instances.
///
/// The first tick is skipped; startup discovery has already run.
pub(crate) async fn discovery_loop(
    registry: Arc<ConnectionRegistry>,
    source: ConfigSource,
    interval: Duration,
) {
    info!(interval_secs = interval.as_secs(), "auto-discovery enabled");

    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tick.tick().await;

    loop {
        tick.tick().await;
        discover_once(&registry, &source).await;
    }
}

/// One discovery pass. A configuration that fails to load is logged and skipped.
pub(crate) async fn discover_once(registry: &ConnectionRegistry, source: &ConfigSource) {
    let t0 = Instant::now();

    let loaded = {
        let source = source.clone();
        tokio::task::spawn_blocking(move || source.load()).await
    };

    let config = match loaded {
        Ok(Ok(config)) => config,
        Ok(Err(e)) => {
            warn!(source = %source, error = %e, "failed to reload configuration");
            return;
        }
        Err(e) => {
            error!(error = %e, "configuration reload panicked in spawn_blocking");
            return;
        }
    };

    let report = registry.discover(config.instances());
    if report.registered.is_empty() && report.failed.is_empty() {
        debug!(
            known = report.already_known,
            duration_ms = t0.elapsed().as_millis() as u64,
            "discovery found no new instances"
        );
    } else {
        info!(
            registered = ?report.registered,
            failed = ?report.failed,
            total = registry.len(),
            duration_ms = t0.elapsed().as_millis() as u64,
            "discovery updated registry"
        );
    }
}
