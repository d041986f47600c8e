//! ---
//! dbt_section: "11-system-tests"
//! dbt_subsection: "02-stub-daemon"
//! dbt_type: "source"
//! dbt_scope: "code"
//! dbt_description: "Daemon configuration schema, defaults and validation."
//! dbt_version: "v0.0.0-prealpha"
//! dbt_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use tracing::debug;
use url::Url;

const DEFAULT_PERIOD: &str = "10ms";
/// Used when the file sets `period` to an empty string.
const EMPTY_PERIOD_FALLBACK: &str = "10s";
const DEFAULT_URL: &str = "http://127.0.0.1";

/// On-disk YAML layout.
#[derive(Debug, Default, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub dropbeat: DropbeatSection,
    #[serde(default)]
    pub paths: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DropbeatSection {
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub urls: Option<Vec<String>>,
    #[serde(default)]
    pub stats: StatsSection,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatsSection {
    #[serde(default)]
    pub metrics: Option<bool>,
    #[serde(default)]
    pub health: Option<bool>,
}

/// Validated settings the daemon runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct BeatSettings {
    pub period: Duration,
    pub urls: Vec<Url>,
    pub metrics: bool,
    pub health: bool,
    pub paths: Vec<PathBuf>,
}

impl BeatSettings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Error reading config file {}", path.display()))?;
        contents
            .parse()
            .with_context(|| format!("Error reading config file {}", path.display()))
    }

    pub fn from_raw(raw: RawConfig) -> Result<Self> {
        let section = raw.dropbeat;
        let period = match section.period.as_deref().map(str::trim) {
            None => parse_period(DEFAULT_PERIOD)?,
            Some("") => parse_period(EMPTY_PERIOD_FALLBACK)?,
            Some(period) => parse_period(period)?,
        };

        let urls = section
            .urls
            .unwrap_or_else(|| vec![DEFAULT_URL.to_owned()])
            .iter()
            .map(|raw| parse_url(raw))
            .collect::<Result<Vec<_>>>()?;

        let metrics = section.stats.metrics.unwrap_or(true);
        let health = section.stats.health.unwrap_or(true);
        if !metrics && !health {
            bail!("Invalid statistics configuration");
        }

        let paths = raw
            .paths
            .into_iter()
            .map(|path| {
                let path = PathBuf::from(path);
                if path.is_absolute() {
                    Ok(path)
                } else {
                    Err(anyhow!("watch path {} must be absolute", path.display()))
                }
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            period,
            urls,
            metrics,
            health,
            paths,
        })
    }
}

impl std::str::FromStr for BeatSettings {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> Result<Self> {
        // An empty document deserializes as unit, not as a map.
        let raw = if content.trim().is_empty() {
            RawConfig::default()
        } else {
            serde_yaml::from_str::<RawConfig>(content).context("failed to parse YAML")?
        };
        Self::from_raw(raw)
    }
}

fn parse_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .with_context(|| format!("Invalid Dropwizard Metrics URL: {raw}"))?;
    if !url.has_host() {
        bail!("Invalid Dropwizard Metrics URL: {raw} has no host");
    }
    Ok(url)
}

/// Parse a duration such as `10ms`, `1h2m3s` or `1.5s`.
///
/// Whole-number forms go straight to `humantime`. A single fractional term
/// (`1.5s`) is scaled from the unit's length, since `humantime` only accepts
/// integers.
pub fn parse_period(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    let parsed = if trimmed.contains('.') {
        parse_fractional(trimmed)
    } else {
        humantime::parse_duration(trimmed).map_err(Into::into)
    };
    let period = parsed.with_context(|| format!("invalid period {input:?}"))?;
    if period.is_zero() {
        bail!("period {input:?} must be positive");
    }
    Ok(period)
}

fn parse_fractional(term: &str) -> Result<Duration> {
    let unit_start = term
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .ok_or_else(|| anyhow!("missing unit"))?;
    let (number, unit) = term.split_at(unit_start);
    let value: f64 = number.parse()?;
    let unit = humantime::parse_duration(&format!("1{unit}"))?;
    Ok(Duration::try_from_secs_f64(unit.as_secs_f64() * value)?)
}
