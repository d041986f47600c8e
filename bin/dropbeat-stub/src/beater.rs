//! ---
//! dbt_section: "11-system-tests"
//! dbt_subsection: "02-stub-daemon"
//! dbt_type: "source"
//! dbt_scope: "code"
//! dbt_description: "Daemon run loop: one ticker per configured url."
//! dbt_version: "v0.0.0-prealpha"
//! dbt_owner: "tbd"
//! ---
use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::BeatSettings;

pub const READY_MESSAGE: &str = "dropbeat is running! Hit CTRL-C to stop it.";

/// Totals reported once the daemon has stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub ticks: u64,
}

#[derive(Debug)]
pub struct Dropbeat {
    settings: BeatSettings,
}

impl Dropbeat {
    pub fn new(settings: BeatSettings) -> Self {
        debug!(
            period = ?settings.period,
            urls = ?settings.urls.iter().map(Url::as_str).collect::<Vec<_>>(),
            metrics = settings.metrics,
            health = settings.health,
            paths = ?settings.paths,
            "Init dropbeat"
        );
        Self { settings }
    }

    /// Tick until `shutdown` resolves, then stop every ticker and wait for it.
    pub async fn run<F>(self, shutdown: F) -> Result<RunSummary>
    where
        F: Future<Output = ()>,
    {
        info!("{READY_MESSAGE}");

        let (stop_tx, stop_rx) = watch::channel(false);
        let workers: Vec<_> = self
            .settings
            .urls
            .iter()
            .cloned()
            .map(|url| {
                tokio::spawn(tick_loop(
                    url,
                    self.settings.period,
                    self.settings.metrics,
                    self.settings.health,
                    stop_rx.clone(),
                ))
            })
            .collect();

        shutdown.await;
        debug!("Stop dropbeat");
        let _ = stop_tx.send(true);

        let mut summary = RunSummary::default();
        for worker in workers {
            summary.ticks += worker.await.context("ticker task failed")?;
        }
        info!(ticks = summary.ticks, "dropbeat stopped");
        Ok(summary)
    }
}

async fn tick_loop(
    url: Url,
    period: Duration,
    metrics: bool,
    health: bool,
    mut stop: watch::Receiver<bool>,
) -> u64 {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut ticks = 0u64;

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {}
        }

        let started = Instant::now();
        ticks += 1;
        if metrics {
            debug!(%url, tick = ticks, "Metrics stats for url");
        }
        if health {
            debug!(%url, tick = ticks, "Health stats for url");
        }
        if started.elapsed() > period {
            warn!(%url, "Ignoring tick(s) due to processing taking longer than one period");
        }
    }
    ticks
}
