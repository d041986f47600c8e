//! ---
//! dbt_section: "01-core-functionality"
//! dbt_subsection: "module"
//! dbt_type: "source"
//! dbt_scope: "code"
//! dbt_description: "Shared primitives for the system-test workspace."
//! dbt_version: "v0.0.0-prealpha"
//! dbt_owner: "tbd"
//! ---
//! Shared primitives for the dropbeat system-test workspace.
//! This crate exposes harness configuration loading and tracing setup
//! consumed by the harness library and the stand-in daemon.

pub mod config;
pub mod logging;

pub use config::{BeatConfig, HarnessConfig, LoadedHarnessConfig, LoggingConfig, TimeoutConfig};
pub use logging::{init_test_tracing, init_tracing, ConsoleTarget, LogFormat, LoggingGuard};
