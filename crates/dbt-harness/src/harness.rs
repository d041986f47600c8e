//! ---
//! dbt_section: "11-system-tests"
//! dbt_subsection: "01-harness"
//! dbt_type: "source"
//! dbt_scope: "code"
//! dbt_description: "Lifecycle state machine driving one process under test."
//! dbt_version: "v0.1.0"
//! dbt_owner: "tbd"
//! ---
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dbt_common::config::HarnessConfig;
use nix::sys::signal::Signal;
use tracing::{debug, info, warn};

use crate::error::{HarnessError, Result};
use crate::log::{read_lines, LogPredicate};
use crate::process::{resolve_executable, LaunchSpec, ProcessHandle};
use crate::template::{render_file, TemplateContext};
use crate::wait::{self, Condition};
use crate::workspace::TestWorkspace;

const TEMPLATE_SUFFIX: &str = "yml.tmpl";
const CONFIG_SUFFIX: &str = "yml";
const LOG_SUFFIX: &str = "log";

/// Lifecycle of one test run. Each harness call moves at most one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HarnessState {
    NotStarted,
    ConfigRendered,
    Running,
    ReadyConfirmed,
    Terminating,
    Exited,
}

impl HarnessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HarnessState::NotStarted => "not-started",
            HarnessState::ConfigRendered => "config-rendered",
            HarnessState::Running => "running",
            HarnessState::ReadyConfirmed => "ready-confirmed",
            HarnessState::Terminating => "terminating",
            HarnessState::Exited => "exited",
        }
    }

    /// A process has been spawned and not yet stopped.
    pub fn is_live(&self) -> bool {
        matches!(self, HarnessState::Running | HarnessState::ReadyConfirmed)
    }
}

impl fmt::Display for HarnessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drives one black-box process through render → start → wait-for-ready →
/// stop and reports its exit code.
#[derive(Debug)]
pub struct ProcessTestHarness {
    config: HarnessConfig,
    workspace: TestWorkspace,
    state: HarnessState,
    config_path: Option<PathBuf>,
    process: Option<ProcessHandle>,
}

impl ProcessTestHarness {
    /// Validate `config` and create a fresh working directory for `test_name`.
    pub fn new(config: HarnessConfig, test_name: &str) -> Result<Self> {
        config
            .validate()
            .map_err(HarnessError::Config)?;
        let workspace = TestWorkspace::create(&config.run_root, test_name)?;
        Ok(Self::with_workspace(config, workspace))
    }

    /// Use an already prepared working directory.
    pub fn with_workspace(config: HarnessConfig, workspace: TestWorkspace) -> Self {
        info!(test = %workspace.name(), working_dir = %workspace.root().display(), beat = %config.beat.name, "harness created");
        Self {
            config,
            workspace,
            state: HarnessState::NotStarted,
            config_path: None,
            process: None,
        }
    }

    pub fn state(&self) -> HarnessState {
        self.state
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn workspace(&self) -> &TestWorkspace {
        &self.workspace
    }

    pub fn working_dir(&self) -> &Path {
        self.workspace.root()
    }

    /// Rendered configuration file, once rendered.
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn process(&self) -> Option<&ProcessHandle> {
        self.process.as_ref()
    }

    pub fn process_mut(&mut self) -> Option<&mut ProcessHandle> {
        self.process.as_mut()
    }

    /// `<working_dir>/<beat>.log`, receiving the output of whichever
    /// process this harness starts.
    pub fn log_path(&self) -> PathBuf {
        self.workspace
            .path(format!("{}.{LOG_SUFFIX}", self.config.beat.name))
    }

    pub fn template_path(&self) -> PathBuf {
        self.config
            .template_dir
            .join(format!("{}.{TEMPLATE_SUFFIX}", self.config.beat.name))
    }

    fn require(&self, operation: &'static str, allowed: &[HarnessState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            warn!(operation, state = %self.state, "harness call out of sequence");
            Err(HarnessError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn transition(&mut self, next: HarnessState) {
        debug!(test = %self.workspace.name(), from = %self.state, to = %next, "harness transition");
        self.state = next;
    }

    /// Render `<template_dir>/<beat>.yml.tmpl` into `<working_dir>/<beat>.yml`.
    ///
    /// May be repeated before the process starts; the file is overwritten.
    pub fn render_config_template(&mut self, context: &TemplateContext) -> Result<PathBuf> {
        self.require(
            "render_config_template",
            &[HarnessState::NotStarted, HarnessState::ConfigRendered],
        )?;
        let template = self.template_path();
        let output = self
            .workspace
            .path(format!("{}.{CONFIG_SUFFIX}", self.config.beat.name));
        render_file(&template, &output, context)?;
        self.config_path = Some(output.clone());
        self.transition(HarnessState::ConfigRendered);
        Ok(output)
    }

    /// Launch `name` with `-e -c <rendered config>` from the working directory.
    pub fn start_process(&mut self, name: &str) -> Result<&ProcessHandle> {
        self.require("start_process", &[HarnessState::ConfigRendered])?;
        let spec = self.launch_spec(name)?;
        let process = ProcessHandle::spawn(&spec)?;
        self.transition(HarnessState::Running);
        Ok(self.process.insert(process))
    }

    /// [`ProcessTestHarness::start_process`] for the configured beat.
    pub fn start_beat(&mut self) -> Result<&ProcessHandle> {
        let name = self.config.beat.name.clone();
        self.start_process(&name)
    }

    fn launch_spec(&self, name: &str) -> Result<LaunchSpec> {
        let config_path = self.config_path.clone().ok_or(HarnessError::InvalidState {
            operation: "start_process",
            state: self.state,
        })?;
        let executable = resolve_executable(name, self.config.beat.executable_dir.as_deref())?;

        let mut args: Vec<OsString> = vec!["-e".into(), "-c".into(), config_path.into()];
        args.extend(self.config.beat.extra_args.iter().map(OsString::from));

        Ok(LaunchSpec {
            name: name.to_owned(),
            executable,
            args,
            current_dir: self.workspace.root().to_path_buf(),
            log_path: self.log_path(),
        })
    }

    /// Poll `condition` with the configured ready timeout and poll interval.
    pub fn wait_until<C: Condition>(&mut self, condition: C) -> Result<Duration> {
        let timeouts = self.config.timeouts;
        self.wait_until_within(condition, timeouts.ready, timeouts.poll_interval)
    }

    /// Poll `condition` every `poll_interval` until it holds or `timeout`
    /// elapses. Success confirms readiness.
    pub fn wait_until_within<C: Condition>(
        &mut self,
        condition: C,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Duration> {
        self.require(
            "wait_until",
            &[HarnessState::Running, HarnessState::ReadyConfirmed],
        )?;
        let waited = wait::wait_until(condition, timeout, poll_interval)?;
        if self.state == HarnessState::Running {
            info!(test = %self.workspace.name(), waited_ms = waited.as_millis() as u64, "readiness confirmed");
            self.transition(HarnessState::ReadyConfirmed);
        }
        Ok(waited)
    }

    /// Predicate over the process log; see [`LogPredicate`].
    pub fn log_contains(&self, needle: impl Into<String>) -> LogPredicate {
        LogPredicate::contains(self.log_path(), needle)
    }

    /// Current number of occurrences of `needle` in the process log.
    pub fn log_contains_count(&self, needle: impl Into<String>) -> usize {
        self.log_contains(needle).count()
    }

    /// `wait_until(log_contains(needle))` with the configured defaults.
    pub fn wait_log_contains(&mut self, needle: impl Into<String>) -> Result<Duration> {
        let predicate = self.log_contains(needle);
        self.wait_until(predicate)
    }

    /// Process log split into lines.
    pub fn output_lines(&self) -> Vec<String> {
        read_lines(&self.log_path())
    }

    /// SIGTERM the process with the configured shutdown timeout.
    pub fn kill_and_wait(&mut self) -> Result<i32> {
        let timeout = self.config.timeouts.shutdown;
        self.kill_and_wait_with(Signal::SIGTERM, timeout)
    }

    /// Send `signal`, wait up to `timeout`, escalate to SIGKILL, and return
    /// the exit code.
    pub fn kill_and_wait_with(&mut self, signal: Signal, timeout: Duration) -> Result<i32> {
        self.require(
            "kill_and_wait",
            &[HarnessState::Running, HarnessState::ReadyConfirmed],
        )?;
        let timeouts = self.config.timeouts;
        let Some(process) = self.process.as_mut() else {
            return Err(HarnessError::InvalidState {
                operation: "kill_and_wait",
                state: self.state,
            });
        };
        self.state = HarnessState::Terminating;
        let code = process.kill_and_wait(
            signal,
            timeout,
            timeouts.kill_grace,
            timeouts.poll_interval,
        )?;
        self.transition(HarnessState::Exited);
        info!(test = %self.workspace.name(), exit_code = code, "process stopped");
        Ok(code)
    }

    /// [`ProcessTestHarness::kill_and_wait`] and require `expected` as exit code.
    pub fn check_kill_and_wait(&mut self, expected: i32) -> Result<()> {
        let actual = self.kill_and_wait()?;
        if actual != expected {
            return Err(HarnessError::UnexpectedExit { expected, actual });
        }
        Ok(())
    }

    /// Start `name` and wait for it to exit on its own within `timeout`.
    ///
    /// For processes expected to stop by themselves, such as a daemon
    /// rejecting its configuration. A process still alive at the deadline is
    /// killed and reported as a timeout.
    pub fn run_process(&mut self, name: &str, timeout: Duration) -> Result<i32> {
        self.start_process(name)?;
        let poll_interval = self.config.timeouts.poll_interval;
        let kill_grace = self.config.timeouts.kill_grace;
        let Some(process) = self.process.as_mut() else {
            return Err(HarnessError::InvalidState {
                operation: "run_process",
                state: self.state,
            });
        };
        match process.wait_for_exit(timeout, poll_interval)? {
            Some(code) => {
                self.transition(HarnessState::Exited);
                Ok(code)
            }
            None => {
                let condition = format!("process `{}` to exit", process.name());
                self.state = HarnessState::Terminating;
                process.kill_and_wait(Signal::SIGKILL, kill_grace, kill_grace, poll_interval)?;
                self.transition(HarnessState::Exited);
                Err(HarnessError::Timeout { condition, timeout })
            }
        }
    }
}
