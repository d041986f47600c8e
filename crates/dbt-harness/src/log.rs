//! ---
//! dbt_section: "11-system-tests"
//! dbt_subsection: "01-harness"
//! dbt_type: "source"
//! dbt_scope: "code"
//! dbt_description: "Log file probes used for readiness polling."
//! dbt_version: "v0.1.0"
//! dbt_owner: "tbd"
//! ---
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::wait::Condition;

/// Read the whole log file as text.
///
/// A missing file reads as empty. The child may be mid-write, so a torn
/// UTF-8 sequence at the tail is decoded lossily instead of failing.
pub fn read_log(path: &Path) -> String {
    match fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
        Err(err) => {
            debug!(path = %path.display(), error = %err, "log file not readable yet");
            String::new()
        }
    }
}

/// Current log contents split into lines.
pub fn read_lines(path: &Path) -> Vec<String> {
    read_log(path).lines().map(str::to_owned).collect()
}

/// Stateless substring probe over a log file, re-read on every check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPredicate {
    path: PathBuf,
    needle: String,
    ignore_case: bool,
    min_count: usize,
}

impl LogPredicate {
    /// Holds once the log contains `needle` at least once.
    pub fn contains(path: impl Into<PathBuf>, needle: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            needle: needle.into(),
            ignore_case: false,
            min_count: 1,
        }
    }

    pub fn ignore_case(mut self) -> Self {
        self.ignore_case = true;
        self
    }

    /// Require `count` non-overlapping occurrences instead of one.
    pub fn at_least(mut self, count: usize) -> Self {
        self.min_count = count;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn needle(&self) -> &str {
        &self.needle
    }

    /// Number of non-overlapping occurrences in the current contents.
    pub fn count(&self) -> usize {
        count_occurrences(&read_log(&self.path), &self.needle, self.ignore_case)
    }

    pub fn holds(&self) -> bool {
        self.count() >= self.min_count
    }
}

impl Condition for LogPredicate {
    fn check(&mut self) -> bool {
        self.holds()
    }

    fn describe(&self) -> String {
        let times = if self.min_count == 1 {
            String::new()
        } else {
            format!(" {} times", self.min_count)
        };
        format!(
            "{} to contain {:?}{times}",
            self.path.display(),
            self.needle
        )
    }
}

fn count_occurrences(haystack: &str, needle: &str, ignore_case: bool) -> usize {
    if needle.is_empty() {
        return usize::MAX;
    }
    if ignore_case {
        haystack
            .to_lowercase()
            .matches(&needle.to_lowercase())
            .count()
    } else {
        haystack.matches(needle).count()
    }
}
