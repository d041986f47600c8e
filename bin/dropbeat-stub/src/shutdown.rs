//! ---
//! dbt_section: "11-system-tests"
//! dbt_subsection: "02-stub-daemon"
//! dbt_type: "source"
//! dbt_scope: "code"
//! dbt_description: "Termination signal handling."
//! dbt_version: "v0.0.0-prealpha"
//! dbt_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use tracing::info;

/// Termination signals, registered eagerly.
///
/// Handlers must exist before readiness is announced: a SIGTERM arriving
/// earlier would otherwise hit the default disposition and kill the process
/// with a non-zero status.
pub struct ShutdownSignal {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
}

impl ShutdownSignal {
    #[cfg(unix)]
    pub fn install() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        let terminate =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        let interrupt =
            signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
        Ok(Self {
            terminate,
            interrupt,
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> Result<Self> {
        Ok(Self {})
    }

    /// Resolve once a termination signal arrives.
    #[cfg(unix)]
    pub async fn recv(mut self) {
        tokio::select! {
            _ = self.terminate.recv() => info!("SIGTERM received; shutting down"),
            _ = self.interrupt.recv() => info!("SIGINT received; shutting down"),
        }
    }

    #[cfg(not(unix))]
    pub async fn recv(self) {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(?err, "failed to install Ctrl+C handler");
            return;
        }
        info!("ctrl-c received; shutting down");
    }
}
