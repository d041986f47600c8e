//! ---
//! dbt_section: "11-system-tests"
//! dbt_subsection: "01-harness"
//! dbt_type: "source"
//! dbt_scope: "code"
//! dbt_description: "Lifecycle tests driving shell-script beats through the harness."
//! dbt_version: "v0.1.0"
//! dbt_owner: "tbd"
//! ---
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use dbt_common::config::{HarnessConfig, TimeoutConfig};
use dbt_common::logging::init_test_tracing;
use dbt_harness::{
    HarnessError, HarnessState, ProcessTestHarness, Signal, TemplateContext, TemplateError,
};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tempfile::TempDir;

const WELL_BEHAVED: &str = r#"#!/bin/sh
trap 'echo "fakebeat stopped"; exit 0' TERM
cat "$3"
echo "fakebeat is running"
while true; do sleep 0.05; done
"#;

const BAD_EXIT: &str = r#"#!/bin/sh
trap 'exit 3' TERM
echo "fakebeat is running"
while true; do sleep 0.05; done
"#;

const CONFIG_ERROR: &str = r#"#!/bin/sh
echo "Invalid statistics configuration" >&2
exit 1
"#;

const TEMPLATE: &str = "fakebeat:\n  period: {{ period | default(\"1s\") }}\n  paths:\n    - {{ path }}\n";

struct Fixture {
    _dir: TempDir,
    config: HarnessConfig,
}

fn fixture(script: &str) -> Fixture {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let bin = dir.path().join("bin");
    let templates = dir.path().join("templates");
    fs::create_dir_all(&bin).unwrap();
    fs::create_dir_all(&templates).unwrap();

    write_script(&bin.join("fakebeat"), script);
    write_script(&bin.join("otherbeat"), script);
    fs::write(templates.join("fakebeat.yml.tmpl"), TEMPLATE).unwrap();

    let config = HarnessConfig::default()
        .with_run_root(dir.path().join("run"))
        .with_template_dir(templates)
        .with_beat_name("fakebeat")
        .with_executable_dir(bin)
        .with_timeouts(TimeoutConfig {
            ready: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
            shutdown: Duration::from_secs(5),
            kill_grace: Duration::from_secs(2),
        });
    Fixture { _dir: dir, config }
}

fn write_script(path: &Path, body: &str) {
    fs::write(path, body).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

fn context(harness: &ProcessTestHarness) -> TemplateContext {
    TemplateContext::new().with("path", harness.workspace().log_glob())
}

fn alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[test]
fn base_lifecycle_exits_cleanly() {
    let fixture = fixture(WELL_BEHAVED);
    let mut harness = ProcessTestHarness::new(fixture.config.clone(), "base_lifecycle").unwrap();
    assert_eq!(harness.state(), HarnessState::NotStarted);

    let rendered = harness.render_config_template(&context(&harness)).unwrap();
    assert_eq!(harness.state(), HarnessState::ConfigRendered);
    let contents = fs::read_to_string(&rendered).unwrap();
    assert!(!contents.contains("{{"), "unresolved placeholder in {contents}");
    assert!(contents.contains(&harness.workspace().log_glob()));

    let pid = harness.start_beat().unwrap().pid();
    assert_eq!(harness.state(), HarnessState::Running);

    let ready = harness.log_contains("fakebeat is running");
    harness.wait_until(ready).unwrap();
    assert_eq!(harness.state(), HarnessState::ReadyConfirmed);
    assert_eq!(harness.log_contains_count("period: 1s"), 1);

    let exit_code = harness.kill_and_wait().unwrap();
    assert_eq!(exit_code, 0);
    assert_eq!(harness.state(), HarnessState::Exited);
    assert!(!alive(pid));
    assert!(harness
        .output_lines()
        .iter()
        .any(|line| line == "fakebeat stopped"));
}

#[test]
fn kill_before_start_is_rejected_without_spawning() {
    let fixture = fixture(WELL_BEHAVED);
    let mut harness = ProcessTestHarness::new(fixture.config.clone(), "kill_first").unwrap();

    let err = harness.kill_and_wait().unwrap_err();
    assert!(matches!(
        err,
        HarnessError::InvalidState {
            operation: "kill_and_wait",
            state: HarnessState::NotStarted
        }
    ));
    assert!(harness.process().is_none());
    assert!(!harness.log_path().exists());
}

#[test]
fn start_requires_rendered_config() {
    let fixture = fixture(WELL_BEHAVED);
    let mut harness = ProcessTestHarness::new(fixture.config.clone(), "start_first").unwrap();
    let err = harness.start_beat().unwrap_err();
    assert!(matches!(err, HarnessError::InvalidState { .. }));
    assert!(harness.process().is_none());
}

#[test]
fn wait_requires_running_process() {
    let fixture = fixture(WELL_BEHAVED);
    let mut harness = ProcessTestHarness::new(fixture.config.clone(), "wait_first").unwrap();
    harness.render_config_template(&context(&harness)).unwrap();
    let err = harness.wait_until(|| true).unwrap_err();
    assert!(matches!(
        err,
        HarnessError::InvalidState {
            state: HarnessState::ConfigRendered,
            ..
        }
    ));
}

#[test]
fn readiness_timeout_does_not_hang() {
    let fixture = fixture(WELL_BEHAVED);
    let mut harness = ProcessTestHarness::new(fixture.config.clone(), "never_ready").unwrap();
    harness.render_config_template(&context(&harness)).unwrap();
    harness.start_beat().unwrap();

    let never = harness.log_contains("fakebeat is exploding");
    let err = harness
        .wait_until_within(never, Duration::from_millis(300), Duration::from_millis(20))
        .unwrap_err();
    assert!(matches!(err, HarnessError::Timeout { .. }));
    assert!(err.to_string().contains("fakebeat is exploding"));
    assert_eq!(harness.state(), HarnessState::Running);

    assert_eq!(harness.kill_and_wait().unwrap(), 0);
}

#[test]
fn missing_placeholder_leaves_state_untouched() {
    let fixture = fixture(WELL_BEHAVED);
    let mut harness = ProcessTestHarness::new(fixture.config.clone(), "bad_template").unwrap();
    let err = harness
        .render_config_template(&TemplateContext::new())
        .unwrap_err();
    assert!(matches!(
        err,
        HarnessError::Template {
            source: TemplateError::MissingValue(ref name),
            ..
        } if name == "path"
    ));
    assert_eq!(harness.state(), HarnessState::NotStarted);
    assert!(harness.config_path().is_none());
}

#[test]
fn missing_executable_is_a_spawn_error() {
    let fixture = fixture(WELL_BEHAVED);
    let mut harness = ProcessTestHarness::new(fixture.config.clone(), "no_binary").unwrap();
    harness.render_config_template(&context(&harness)).unwrap();
    let err = harness.start_process("no-such-beat").unwrap_err();
    assert!(matches!(err, HarnessError::Spawn { .. }));
    assert_eq!(harness.state(), HarnessState::ConfigRendered);
}

#[test]
fn unexpected_exit_code_is_reported() {
    let fixture = fixture(BAD_EXIT);
    let mut harness = ProcessTestHarness::new(fixture.config.clone(), "bad_exit").unwrap();
    harness.render_config_template(&context(&harness)).unwrap();
    harness.start_beat().unwrap();
    harness.wait_log_contains("fakebeat is running").unwrap();

    let err = harness.check_kill_and_wait(0).unwrap_err();
    assert!(matches!(
        err,
        HarnessError::UnexpectedExit {
            expected: 0,
            actual: 3
        }
    ));
}

#[test]
fn run_process_reports_self_exit() {
    let fixture = fixture(CONFIG_ERROR);
    let mut harness = ProcessTestHarness::new(fixture.config.clone(), "config_error").unwrap();
    harness.render_config_template(&context(&harness)).unwrap();

    let code = harness
        .run_process("fakebeat", Duration::from_secs(5))
        .unwrap();
    assert_eq!(code, 1);
    assert_eq!(harness.state(), HarnessState::Exited);
    assert!(harness
        .log_contains("Invalid statistics configuration")
        .holds());
}

#[test]
fn dropping_harness_reaps_process() {
    let fixture = fixture(WELL_BEHAVED);
    let pid = {
        let mut harness = ProcessTestHarness::new(fixture.config.clone(), "drop").unwrap();
        harness.render_config_template(&context(&harness)).unwrap();
        harness.start_beat().unwrap().pid()
    };
    assert!(!alive(pid));
}

#[test]
fn run_process_kills_a_process_that_outlives_its_deadline() {
    let fixture = fixture(WELL_BEHAVED);
    let mut harness = ProcessTestHarness::new(fixture.config.clone(), "run_timeout").unwrap();
    harness.render_config_template(&context(&harness)).unwrap();

    let err = harness
        .run_process("fakebeat", Duration::from_millis(200))
        .unwrap_err();
    assert!(matches!(
        err,
        HarnessError::Timeout { ref condition, timeout }
            if condition.contains("fakebeat") && timeout == Duration::from_millis(200)
    ));
    assert_eq!(harness.state(), HarnessState::Exited);

    let process = harness.process().unwrap();
    assert_eq!(process.exit_code(), Some(128 + Signal::SIGKILL as i32));
    assert!(!alive(process.pid()));
}

#[test]
fn log_predicate_built_before_start_follows_any_executable() {
    let fixture = fixture(WELL_BEHAVED);
    let mut harness = ProcessTestHarness::new(fixture.config.clone(), "other_binary").unwrap();
    harness.render_config_template(&context(&harness)).unwrap();

    let ready = harness.log_contains("fakebeat is running");
    let expected_log = harness.log_path();
    harness.start_process("otherbeat").unwrap();
    assert_eq!(harness.process().unwrap().log_path(), expected_log);

    harness.wait_until(ready).unwrap();
    assert_eq!(harness.kill_and_wait().unwrap(), 0);
}

#[test]
fn invalid_configuration_keeps_its_cause() {
    let fixture = fixture(WELL_BEHAVED);
    let mut config = fixture.config.clone();
    config.timeouts.poll_interval = Duration::ZERO;

    let err = ProcessTestHarness::new(config, "bad_config").unwrap_err();
    let HarnessError::Config(ref cause) = err else {
        panic!("expected a configuration error, got {err:?}");
    };
    assert!(cause.to_string().contains("poll interval"));
    assert!(std::error::Error::source(&err).is_some());
}
