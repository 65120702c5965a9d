//! SLA and cleanup supervisor.
//!
//! A periodic sweeper that compares every running saga's elapsed time
//! against its template thresholds, fires the catastrophic timeout when
//! `max_duration` is crossed, and garbage-collects terminal sagas after
//! the configured grace period. Spawned by `EngineBuilder::build`; stops
//! when the engine's supervisor token is cancelled.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::engine::EngineInner;

pub(crate) fn spawn_supervisor(inner: Arc<EngineInner>) -> JoinHandle<()> {
    let shutdown = inner.supervisor_shutdown.clone();
    let sla_interval = inner.config.sla_check_interval;
    let cleanup_interval = inner.config.cleanup_interval;

    tokio::spawn(async move {
        let mut sla_ticker = tokio::time::interval(sla_interval);
        let mut cleanup_ticker = tokio::time::interval(cleanup_interval);
        // Skip the immediate first ticks.
        sla_ticker.tick().await;
        cleanup_ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sla_ticker.tick() => {
                    let handles: Vec<_> = inner
                        .sagas
                        .iter()
                        .map(|entry| entry.value().clone())
                        .collect();
                    for handle in handles {
                        inner.evaluate_sla(&handle);
                    }
                }
                _ = cleanup_ticker.tick() => {
                    let reaped = inner.reap_terminal();
                    if reaped > 0 {
                        debug!(reaped, "terminal sagas garbage-collected");
                    }
                }
            }
        }
        info!("sla supervisor stopped");
    })
}
