//! ---
//! dbt_section: "11-system-tests"
//! dbt_subsection: "01-harness"
//! dbt_type: "source"
//! dbt_scope: "code"
//! dbt_description: "Process-lifecycle test harness and shared exports."
//! dbt_version: "v0.1.0"
//! dbt_owner: "tbd"
//! ---
//! Drives one black-box daemon through a render → start → wait-for-ready →
//! stop lifecycle and exposes the exit code to the calling test.
//!
//! The only channel to the process under test is the filesystem: the harness
//! writes the rendered configuration, the child writes its log, the harness
//! polls it. The harness is Unix-only because shutdown is signal based.
//!
//! ```no_run
//! use dbt_common::HarnessConfig;
//! use dbt_harness::{ProcessTestHarness, TemplateContext};
//!
//! # fn main() -> dbt_harness::Result<()> {
//! let mut harness = ProcessTestHarness::new(HarnessConfig::default(), "test_base")?;
//! let context = TemplateContext::new().with("path", harness.workspace().log_glob());
//! harness.render_config_template(&context)?;
//! harness.start_beat()?;
//! let ready = harness.log_contains("dropbeat is running");
//! harness.wait_until(ready)?;
//! assert_eq!(harness.kill_and_wait()?, 0);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod harness;
pub mod log;
pub mod process;
pub mod template;
pub mod wait;
pub mod workspace;

pub use error::{HarnessError, Result};
pub use harness::{HarnessState, ProcessTestHarness};
pub use log::LogPredicate;
pub use nix::sys::signal::Signal;
pub use process::{resolve_executable, LaunchSpec, ProcessHandle};
pub use template::{TemplateContext, TemplateError};
pub use wait::{wait_until, Condition};
pub use workspace::TestWorkspace;
