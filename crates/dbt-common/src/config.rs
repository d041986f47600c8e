//! ---
//! dbt_section: "01-core-functionality"
//! dbt_subsection: "module"
//! dbt_type: "source"
//! dbt_scope: "code"
//! dbt_description: "Harness configuration loading and validation."
//! dbt_version: "v0.0.0-prealpha"
//! dbt_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use path_absolutize::Absolutize;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::{ConsoleTarget, LogFormat};

fn default_run_root() -> PathBuf {
    PathBuf::from("target/system-tests/run")
}

fn default_template_dir() -> PathBuf {
    PathBuf::from("tests/system/config")
}

fn default_beat_name() -> String {
    "dropbeat".to_owned()
}

fn default_ready_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_kill_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

/// Per-run configuration for the process test harness.
///
/// Every harness instance receives its own copy, so independent test runs
/// never share ambient state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Directory under which each test gets its own working directory.
    #[serde(default = "default_run_root")]
    pub run_root: PathBuf,
    /// Directory holding `<beat>.yml.tmpl` configuration templates.
    #[serde(default = "default_template_dir")]
    pub template_dir: PathBuf,
    #[serde(default)]
    pub beat: BeatConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where a [`HarnessConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedHarnessConfig {
    pub config: HarnessConfig,
    /// `None` when no file was found and defaults were used.
    pub source: Option<PathBuf>,
}

impl HarnessConfig {
    pub const ENV_CONFIG_PATH: &'static str = "DBT_HARNESS_CONFIG";
    pub const ENV_BEAT_DIR: &'static str = "DBT_BEAT_DIR";

    /// Load configuration from disk, respecting the `DBT_HARNESS_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    ///
    /// Fails when neither the environment override nor any candidate exists.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedHarnessConfig> {
        if let Some(loaded) = Self::try_load(candidates)? {
            return Ok(loaded);
        }

        Err(anyhow!(
            "no harness configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Like [`HarnessConfig::load_with_source`] but falls back to defaults
    /// when no configuration file exists.
    pub fn discover<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedHarnessConfig> {
        if let Some(loaded) = Self::try_load(candidates)? {
            return Ok(loaded);
        }
        debug!("no harness configuration file found; using defaults");
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(LoadedHarnessConfig {
            config,
            source: None,
        })
    }

    fn try_load<P: AsRef<Path>>(candidates: &[P]) -> Result<Option<LoadedHarnessConfig>> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(Some(LoadedHarnessConfig {
                    config,
                    source: Some(path),
                }));
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(Some(LoadedHarnessConfig {
                    config,
                    source: Some(path),
                }));
            }
        }
        Ok(None)
    }

    /// Read, parse and validate a TOML configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(config_path = %path.display(), "loading harness configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let mut config = toml::from_str::<HarnessConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var(Self::ENV_BEAT_DIR) {
            if !dir.trim().is_empty() {
                self.beat.executable_dir = Some(PathBuf::from(dir));
            }
        }
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.beat.name.trim().is_empty() {
            return Err(anyhow!("beat name cannot be empty"));
        }
        self.timeouts.validate()
    }

    /// Anchor relative directories at `base`.
    pub fn resolve_paths(&mut self, base: impl AsRef<Path>) -> Result<()> {
        let base = base.as_ref();
        self.run_root = absolutize(&self.run_root, base)?;
        self.template_dir = absolutize(&self.template_dir, base)?;
        if let Some(dir) = &self.beat.executable_dir {
            self.beat.executable_dir = Some(absolutize(dir, base)?);
        }
        Ok(())
    }

    pub fn with_run_root(mut self, run_root: impl Into<PathBuf>) -> Self {
        self.run_root = run_root.into();
        self
    }

    pub fn with_template_dir(mut self, template_dir: impl Into<PathBuf>) -> Self {
        self.template_dir = template_dir.into();
        self
    }

    pub fn with_beat_name(mut self, name: impl Into<String>) -> Self {
        self.beat.name = name.into();
        self
    }

    pub fn with_executable_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.beat.executable_dir = Some(dir.into());
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            run_root: default_run_root(),
            template_dir: default_template_dir(),
            beat: BeatConfig::default(),
            timeouts: TimeoutConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl std::str::FromStr for HarnessConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: HarnessConfig =
            toml::from_str(content).with_context(|| "failed to parse harness configuration")?;
        config.validate()?;
        Ok(config)
    }
}

fn absolutize(path: &Path, base: &Path) -> Result<PathBuf> {
    Ok(path
        .absolutize_from(base)
        .with_context(|| format!("unable to absolutize {}", path.display()))?
        .into_owned())
}

/// Describes the executable under test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeatConfig {
    #[serde(default = "default_beat_name")]
    pub name: String,
    /// Directory searched before `PATH` when resolving the executable.
    #[serde(default)]
    pub executable_dir: Option<PathBuf>,
    /// Arguments appended after `-e -c <config>`.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for BeatConfig {
    fn default() -> Self {
        Self {
            name: default_beat_name(),
            executable_dir: None,
            extra_args: Vec::new(),
        }
    }
}

/// Deadlines for every blocking harness operation.
#[serde_as]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Upper bound for readiness polling.
    #[serde(rename = "ready_ms", default = "default_ready_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub ready: Duration,
    #[serde(rename = "poll_interval_ms", default = "default_poll_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
    /// Time allowed between the termination signal and escalation.
    #[serde(rename = "shutdown_ms", default = "default_shutdown_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub shutdown: Duration,
    /// Time allowed for the process to disappear after SIGKILL.
    #[serde(rename = "kill_grace_ms", default = "default_kill_grace")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub kill_grace: Duration,
}

impl TimeoutConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(anyhow!("poll interval must be greater than zero"));
        }
        if self.poll_interval > self.ready {
            return Err(anyhow!(
                "poll interval ({:?}) must not exceed the ready timeout ({:?})",
                self.poll_interval,
                self.ready
            ));
        }
        Ok(())
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            ready: default_ready_timeout(),
            poll_interval: default_poll_interval(),
            shutdown: default_shutdown_timeout(),
            kill_grace: default_kill_grace(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Rolling log file directory; console-only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub console: ConsoleTarget,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            format: default_log_format(),
            console: ConsoleTarget::default(),
            file_prefix: None,
        }
    }
}
