#![allow(deprecated)] // TODO: move Command::cargo_bin to the cargo_bin_cmd! macro

mod common;

use assert_cmd::Command;
use common::TestProject;
use predicates::prelude::*;

const ONE_SHELL_SERVICE: &str = r#"
[supervisor]
startup_timeout_ms = 200
startup_poll_ms = 20
running_poll_ms = 20
batch_delay_ms = 0

[[services]]
name = "echo"
display_name = "Echo"
command = "/bin/sh"
args = ["-c", "echo hi; exit 0"]

[[services]]
name = "ghost"
command = "bin/ghost"
"#;

fn procwarden() -> Command {
    let mut cmd = Command::cargo_bin("procwarden").unwrap();
    cmd.env("RUST_LOG", "warn");
    cmd
}

#[test]
fn test_cli_help() {
    procwarden()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("stop"));
}

#[test]
fn test_invalid_command() {
    procwarden().arg("invalid-command").assert().failure();
}

#[test]
fn test_status_table_marks_missing_executable() {
    let project = TestProject::new();
    let config = project.write_config(ONE_SHELL_SERVICE);

    procwarden()
        .arg("-c")
        .arg(&config)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("echo"))
        .stdout(predicate::str::contains("stopped"))
        .stdout(predicate::str::contains("(missing)"));
}

#[test]
fn test_status_json() {
    let project = TestProject::new();
    let config = project.write_config(ONE_SHELL_SERVICE);

    let output = procwarden()
        .args(["status", "--json", "-c"])
        .arg(&config)
        .output()
        .unwrap();
    assert!(output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let services = value.as_array().unwrap();
    assert_eq!(services.len(), 2);
    assert_eq!(services[0]["name"], "echo");
    assert_eq!(services[0]["display_name"], "Echo");
    assert_eq!(services[0]["status"], "stopped");
    assert_eq!(services[0]["executable_exists"], true);
    assert_eq!(services[1]["executable_exists"], false);
    assert!(
        services[1]["executable"]
            .as_str()
            .unwrap()
            .ends_with("bin/ghost")
    );
}

#[test]
fn test_missing_config_is_created_with_defaults() {
    let project = TestProject::new();
    let config = project.path().join("nested").join("procwarden.toml");

    procwarden()
        .arg("-c")
        .arg(&config)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("game-server"))
        .stdout(predicate::str::contains("dispatch"))
        .stdout(predicate::str::contains("sdk"));
    assert!(config.exists());
}

#[test]
fn test_invalid_config_fails() {
    let project = TestProject::new();
    let config = project.write_config("[[services]]\nname = 42\n");

    procwarden()
        .arg("-c")
        .arg(&config)
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load config"));
}

#[test]
fn test_run_rejects_unknown_service() {
    let project = TestProject::new();
    let config = project.write_config(ONE_SHELL_SERVICE);

    procwarden()
        .arg("-c")
        .arg(&config)
        .args(["run", "nope"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("unknown service 'nope'"));
}

#[cfg(unix)]
#[test]
fn test_run_exits_once_services_are_gone() {
    let project = TestProject::new();
    let config = project.write_config(ONE_SHELL_SERVICE);

    procwarden()
        .arg("-c")
        .arg(&config)
        .args(["run", "echo"])
        .timeout(std::time::Duration::from_secs(10))
        .assert()
        .success()
        .stdout(predicate::str::contains("✓ echo started"))
        .stdout(predicate::str::contains("Started 1/1 services"))
        .stdout(predicate::str::contains("echo starting → error"))
        .stdout(predicate::str::contains("All services have stopped"));
}

#[test]
fn test_run_with_nothing_startable() {
    let project = TestProject::new();
    let config = project.write_config(ONE_SHELL_SERVICE);

    procwarden()
        .arg("-c")
        .arg(&config)
        .args(["run", "ghost"])
        .timeout(std::time::Duration::from_secs(10))
        .assert()
        .success()
        .stdout(predicate::str::contains("✗ ghost"))
        .stdout(predicate::str::contains("Started 0/1 services"));
}

#[test]
fn test_stop_reports_each_service() {
    let project = TestProject::new();
    let config = project.write_config(ONE_SHELL_SERVICE);

    procwarden()
        .arg("-c")
        .arg(&config)
        .arg("stop")
        .assert()
        .success()
        .stdout(predicate::str::contains("echo was not running"))
        .stdout(predicate::str::contains("ghost was not running"));
}

#[cfg(unix)]
#[test]
fn test_sigterm_stops_supervised_services() {
    use std::io::{BufRead, BufReader, Read};
    use std::process::{Command as StdCommand, Stdio};

    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let project = TestProject::new();
    let config = project.write_config(
        r#"
[supervisor]
startup_timeout_ms = 200
startup_poll_ms = 20

[[services]]
name = "sleeper"
command = "/bin/sh"
args = ["-c", "exec sleep 30"]
"#,
    );

    let mut child = StdCommand::new(assert_cmd::cargo::cargo_bin("procwarden"))
        .arg("-c")
        .arg(&config)
        .arg("run")
        .env("RUST_LOG", "warn")
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    let mut stdout = BufReader::new(child.stdout.take().unwrap());

    let mut service_pid = None;
    let mut line = String::new();
    loop {
        line.clear();
        assert!(stdout.read_line(&mut line).unwrap() > 0, "run exited early");
        if let Some(rest) = line.trim().strip_prefix("✓ sleeper started (pid ") {
            service_pid = rest.trim_end_matches(')').parse::<u32>().ok();
        }
        if line.starts_with("Supervising") {
            break;
        }
    }
    let service_pid = service_pid.unwrap();
    assert!(common::pid_alive(service_pid));

    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).unwrap();

    let mut rest = String::new();
    stdout.read_to_string(&mut rest).unwrap();
    let status = child.wait().unwrap();

    assert!(status.success());
    assert!(rest.contains("stopping all services"), "{rest}");
    assert!(rest.contains("✓ sleeper stopped"), "{rest}");
    assert!(!common::pid_alive(service_pid));
}
