//! ---
//! dbt_section: "11-system-tests"
//! dbt_subsection: "01-harness"
//! dbt_type: "source"
//! dbt_scope: "code"
//! dbt_description: "Per-test working directories."
//! dbt_version: "v0.1.0"
//! dbt_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use path_absolutize::Absolutize;
use tracing::debug;

use crate::error::{HarnessError, Result};

const LOG_DIR: &str = "log";

/// An isolated working directory for one test run.
///
/// Created fresh on every run: leftovers from a previous run of the same
/// test are removed first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestWorkspace {
    name: String,
    root: PathBuf,
}

impl TestWorkspace {
    /// Create `<run_root>/<slug(test_name)>` and its `log/` directory.
    pub fn create(run_root: impl AsRef<Path>, test_name: &str) -> Result<Self> {
        let name = slugify_test_name(test_name);
        if name.is_empty() {
            return Err(HarnessError::Config(anyhow!(
                "test name {test_name:?} must contain at least one alphanumeric character"
            )));
        }
        let root = run_root.as_ref().absolutize()?.join(&name);
        if root.exists() {
            fs::remove_dir_all(&root)?;
        }
        fs::create_dir_all(root.join(LOG_DIR))?;
        debug!(test = %name, working_dir = %root.display(), "test workspace created");
        Ok(Self { name, root })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Absolute working directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join(LOG_DIR)
    }

    /// Glob matching every file in [`TestWorkspace::log_dir`], e.g. for a
    /// template's `path` value.
    pub fn log_glob(&self) -> String {
        format!("{}/*", self.log_dir().display())
    }
}

/// Filesystem-safe directory name for a test identifier such as
/// `system::test_base`.
pub fn slugify_test_name(input: &str) -> String {
    let mut slug = String::new();
    let mut previous_sep = false;
    for ch in input.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            previous_sep = false;
        } else if matches!(ch, '_' | '-' | '.' | ':' | '/' | ' ') && !previous_sep && !slug.is_empty()
        {
            slug.push('_');
            previous_sep = true;
        }
    }
    if slug.ends_with('_') {
        slug.pop();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_flattens_module_paths() {
        assert_eq!(slugify_test_name("system::test_base"), "system_test_base");
        assert_eq!(slugify_test_name("  Test Base!  "), "test_base");
        assert_eq!(slugify_test_name("__lead"), "lead");
    }

    #[test]
    fn create_wipes_previous_run() {
        let run_root = tempfile::tempdir().unwrap();
        let first = TestWorkspace::create(run_root.path(), "test_base").unwrap();
        fs::write(first.path("stale.log"), "old").unwrap();

        let second = TestWorkspace::create(run_root.path(), "test_base").unwrap();
        assert_eq!(first.root(), second.root());
        assert!(!second.path("stale.log").exists());
        assert!(second.log_dir().is_dir());
    }

    #[test]
    fn log_glob_is_absolute() {
        let run_root = tempfile::tempdir().unwrap();
        let workspace = TestWorkspace::create(run_root.path(), "glob").unwrap();
        let glob = workspace.log_glob();
        assert!(Path::new(&glob).is_absolute());
        assert!(glob.ends_with("/glob/log/*"));
    }

    #[test]
    fn rejects_unusable_names() {
        let run_root = tempfile::tempdir().unwrap();
        let err = TestWorkspace::create(run_root.path(), "::").unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
    }
}
