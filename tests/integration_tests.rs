//! Integration tests for the treq binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// A treq command isolated from the user's home and environment.
fn treq(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("treq");
    cmd.current_dir(dir.path())
        .env("HOME", dir.path())
        .env_remove("TREQ_HOST")
        .env_remove("TREQ_PORT")
        .env_remove("RUST_LOG");
    cmd
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_treq_help() {
        let dir = create_temp_project();
        treq(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("watch"));
    }

    #[test]
    fn test_treq_version() {
        let dir = create_temp_project();
        treq(&dir)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_watch_requires_flow() {
        let dir = create_temp_project();
        treq(&dir)
            .arg("watch")
            .assert()
            .failure()
            .stderr(predicate::str::contains("--flow"));
    }
}

// =============================================================================
// Configuration Tests
// =============================================================================

mod configuration {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = create_temp_project();
        treq(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No treq.toml found"))
            .stdout(predicate::str::contains("port = 4097"));
    }

    #[test]
    fn test_config_init_creates_toml() {
        let dir = create_temp_project();
        treq(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created treq.toml"));

        assert!(dir.path().join(".treq/treq.toml").exists());

        treq(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_config_validate_no_config() {
        let dir = create_temp_project();
        treq(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Using defaults (valid)"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".treq")).unwrap();
        let config_content = r#"
[flows]
sweep_interval_secs = 0
"#;
        fs::write(dir.path().join(".treq/treq.toml"), config_content).unwrap();

        treq(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration warnings"))
            .stdout(predicate::str::contains("sweep_interval_secs"));
    }

    #[test]
    fn test_config_shows_toml_content_and_env() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".treq")).unwrap();
        let config_content = r#"
[server]
port = 5123

[runners.preferred]
ts = "tsx"
"#;
        fs::write(dir.path().join(".treq/treq.toml"), config_content).unwrap();

        treq(&dir)
            .args(["config", "show"])
            .env("TREQ_HOST", "0.0.0.0")
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 5123"))
            .stdout(predicate::str::contains("host = \"0.0.0.0\""))
            .stdout(predicate::str::contains("ts = \"tsx\""));
    }
}

// =============================================================================
// End-to-end
// =============================================================================

mod end_to_end {
    use super::*;
    use std::net::TcpListener;
    use std::process::{Child, Stdio};

    struct ServerProcess(Child);

    impl Drop for ServerProcess {
        fn drop(&mut self) {
            let _ = self.0.kill();
            let _ = self.0.wait();
        }
    }

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn test_run_script_through_server() {
        if !treq::runner::detect::is_on_path("bash") {
            return;
        }
        let dir = create_temp_project();
        fs::write(
            dir.path().join("hello.sh"),
            "echo hello from treq\necho oops >&2\n",
        )
        .unwrap();

        let port = free_port();
        let server = std::process::Command::new(assert_cmd::cargo::cargo_bin!("treq"))
            .args(["serve", "--port", &port.to_string()])
            .current_dir(dir.path())
            .env("HOME", dir.path())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        let _server = ServerProcess(server);

        treq(&dir)
            .args(["run", "hello.sh", "--server"])
            .arg(format!("http://127.0.0.1:{}", port))
            .timeout(std::time::Duration::from_secs(60))
            .assert()
            .success()
            .stdout(predicate::str::contains("hello from treq"))
            .stdout(predicate::str::contains("finished in"))
            .stderr(predicate::str::contains("oops"));
    }

    #[test]
    fn test_runner_flag_is_sent_to_server() {
        if !treq::runner::detect::is_on_path("bash") {
            return;
        }
        let dir = create_temp_project();
        fs::write(dir.path().join("hello.sh"), "echo picked\n").unwrap();

        let port = free_port();
        let server = std::process::Command::new(assert_cmd::cargo::cargo_bin!("treq"))
            .args(["serve", "--port", &port.to_string()])
            .current_dir(dir.path())
            .env("HOME", dir.path())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        let _server = ServerProcess(server);
        let url = format!("http://127.0.0.1:{}", port);

        treq(&dir)
            .args(["run", "hello.sh", "--runner", "bash", "--server", &url])
            .timeout(std::time::Duration::from_secs(60))
            .assert()
            .success()
            .stdout(predicate::str::contains("picked"));

        treq(&dir)
            .args(["run", "hello.sh", "--runner", "nope", "--server", &url])
            .timeout(std::time::Duration::from_secs(60))
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown runner 'nope'"));
    }

    #[test]
    fn test_failing_script_exits_nonzero() {
        if !treq::runner::detect::is_on_path("bash") {
            return;
        }
        let dir = create_temp_project();
        fs::write(dir.path().join("fail.sh"), "exit 3\n").unwrap();

        let port = free_port();
        let server = std::process::Command::new(assert_cmd::cargo::cargo_bin!("treq"))
            .args(["serve", "--port", &port.to_string()])
            .current_dir(dir.path())
            .env("HOME", dir.path())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        let _server = ServerProcess(server);

        treq(&dir)
            .args(["run", "fail.sh", "--server"])
            .arg(format!("http://127.0.0.1:{}", port))
            .timeout(std::time::Duration::from_secs(60))
            .assert()
            .failure()
            .stderr(predicate::str::contains("exited with code 3"));
    }
}
