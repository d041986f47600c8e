//! ---
//! dbt_section: "11-system-tests"
//! dbt_subsection: "01-harness"
//! dbt_type: "source"
//! dbt_scope: "code"
//! dbt_description: "Error taxonomy surfaced to calling tests."
//! dbt_version: "v0.1.0"
//! dbt_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use thiserror::Error;

use crate::harness::HarnessState;
use crate::template::TemplateError;

pub type Result<T> = std::result::Result<T, HarnessError>;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to render template {}: {source}", template.display())]
    Template {
        template: PathBuf,
        #[source]
        source: TemplateError,
    },
    #[error("failed to spawn {}: {source}", executable.display())]
    Spawn {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out after {timeout:?} waiting for {condition}")]
    Timeout {
        condition: String,
        timeout: Duration,
    },
    #[error("process {pid} did not exit within {timeout:?}, even after SIGKILL")]
    ShutdownTimeout { pid: u32, timeout: Duration },
    #[error("`{operation}` is not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: HarnessState,
    },
    #[error("expected exit code {expected}, process returned {actual}")]
    UnexpectedExit { expected: i32, actual: i32 },
    #[error("failed to send {signal} to process {pid}: {source}")]
    Signal {
        pid: u32,
        signal: Signal,
        #[source]
        source: Errno,
    },
    #[error("invalid harness configuration: {0}")]
    Config(#[source] anyhow::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// True for readiness and shutdown deadline failures.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            HarnessError::Timeout { .. } | HarnessError::ShutdownTimeout { .. }
        )
    }
}
