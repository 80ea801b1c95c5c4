#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    io::{BufRead, BufReader},
    path::Path,
    process::{Command as StdCommand, Stdio},
    sync::mpsc,
    thread,
    time::Duration,
};

use assert_cmd::cargo::cargo_bin_cmd;
use common::{touch, write_module, write_script};
use modvisor::codec;
use predicates::prelude::*;
use tempfile::tempdir;

/// `modv` with an isolated home directory and no inherited log filter.
fn modv(home: &Path) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("modv");
    cmd.env("HOME", home).env_remove("RUST_LOG");
    cmd
}

#[test]
fn resolve_prints_matching_file() {
    let temp = tempdir().unwrap();
    let dir = write_module(temp.path(), "tools", "enabled: true\n");
    write_script(&dir, "bin/Deploy.sh", "");

    modv(temp.path())
        .args(["resolve"])
        .arg(&dir)
        .args(["bin", "deploy"])
        .assert()
        .success()
        .stdout(predicate::str::ends_with("bin/Deploy.sh\n"));
}

#[test]
fn resolve_reports_missing_file() {
    let temp = tempdir().unwrap();
    let dir = write_module(temp.path(), "tools", "enabled: true\n");

    modv(temp.path())
        .arg("resolve")
        .arg(&dir)
        .arg("ghost")
        .assert()
        .failure()
        .stderr(predicate::str::contains("File not found").and(predicate::str::contains("ghost.*")));
}

#[test]
fn run_echoes_script_output() {
    let temp = tempdir().unwrap();
    let dir = write_module(temp.path(), "hello", "enabled: true\n");
    write_script(&dir, "greet.sh", "echo \"hello $1\"\n");

    modv(temp.path())
        .arg("run")
        .arg(&dir)
        .args(["greet", "world"])
        .assert()
        .success()
        .stdout("hello world\n");
}

#[test]
fn run_decodes_hex_payload() {
    let temp = tempdir().unwrap();
    let dir = write_module(temp.path(), "payload", "enabled: true\n");
    write_script(
        &dir,
        "emit.sh",
        &format!(
            "echo noise\necho {}\necho ';{};'\n",
            codec::clear_marker(),
            codec::encode("décodé")
        ),
    );

    modv(temp.path())
        .args(["run", "--hide", "--format", "hex"])
        .arg(&dir)
        .arg("emit")
        .assert()
        .success()
        .stdout("décodé\n");
}

#[test]
fn run_propagates_exit_code() {
    let temp = tempdir().unwrap();
    let dir = write_module(temp.path(), "failing", "enabled: true\n");
    write_script(&dir, "fail.sh", "exit 3\n");

    modv(temp.path())
        .arg("run")
        .arg(&dir)
        .arg("fail")
        .assert()
        .code(3);
}

#[test]
fn run_refuses_disabled_module() {
    let temp = tempdir().unwrap();
    let dir = write_module(temp.path(), "off", "enabled: false\n");
    write_script(&dir, "main.sh", "echo should-not-run\n");

    modv(temp.path())
        .arg("run")
        .arg(&dir)
        .arg("main")
        .assert()
        .failure()
        .stdout(predicate::str::contains("should-not-run").not())
        .stderr(predicate::str::contains("Module is disabled"));
}

#[test]
fn cap_prints_json_result() {
    let temp = tempdir().unwrap();
    let dir = write_module(temp.path(), "capper", "enabled: true\n");
    write_script(&dir, "stats.sh", "echo 'progress' >&2\necho '{\"up\": true}'\n");

    modv(temp.path())
        .arg("cap")
        .arg(&dir)
        .arg("stats")
        .assert()
        .success()
        .stdout("{\n  \"up\": true\n}\n");
}

#[test]
fn start_with_timeout_kills_long_script() {
    let temp = tempdir().unwrap();
    let dir = write_module(temp.path(), "slow", "enabled: true\n");
    write_script(&dir, "forever.sh", "sleep 30\n");

    modv(temp.path())
        .args(["start", "--timeout", "1"])
        .arg(&dir)
        .arg("forever")
        .timeout(Duration::from_secs(10))
        .assert()
        .code(124);
}

#[test]
fn scan_lists_modules_with_state() {
    let temp = tempdir().unwrap();
    let root = temp.path().join("mods");
    write_module(&root, "beta", "enabled: false\n");
    write_module(&root, "alpha", "enabled: true\n");
    fs::create_dir_all(root.join("junk")).unwrap();

    let output = modv(temp.path())
        .arg("scan")
        .arg(&root)
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let rows: Vec<Vec<&str>> = stdout.lines().map(|line| line.split('\t').collect()).collect();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][..2], ["alpha", "enabled"]);
    assert_eq!(rows[1][..2], ["beta", "disabled"]);
}

#[test]
fn scan_uses_module_root_from_settings() {
    let temp = tempdir().unwrap();
    let root = temp.path().join("mods");
    write_module(&root, "only", "enabled: true\n");
    let config = temp.path().join("config.yaml");
    fs::write(&config, format!("module_root: {}\n", root.display())).unwrap();

    modv(temp.path())
        .arg("scan")
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::starts_with("only\tenabled\t"));
}

#[test]
fn service_lifecycle_through_cli() {
    let temp = tempdir().unwrap();
    let dir = write_module(temp.path(), "svcmod", "enabled: true\n");
    let marker = temp.path().join("started");
    write_script(
        &dir,
        "svc/Start.sh",
        &format!("echo \"$1\" > '{}'\n", marker.display()),
    );
    write_script(&dir, "svc/Stop.sh", "true\n");
    write_script(&dir, "svc/Running.sh", "echo false\n");

    let service = |action: &str| {
        let mut cmd = modv(temp.path());
        cmd.args(["service", action]).arg(&dir).arg("svc");
        cmd
    };

    service("status").assert().success().stdout("enabled\n");
    service("running").assert().success().stdout("false\n");

    service("disable").assert().success();
    service("status").assert().success().stdout("disabled\n");
    service("start")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Service is disabled"));
    assert!(!marker.exists());

    service("enable").assert().success();
    service("status").assert().success().stdout("enabled\n");

    service("start").arg("blue").assert().success();
    common::wait_for_file_value(&marker, "blue");

    // Lock files live under the isolated home.
    assert!(temp.path().join(".local/share/modvisor/services/svcmod").is_dir());
}

#[test]
fn service_start_restarts_running_service_unless_if_stopped() {
    let temp = tempdir().unwrap();
    let dir = write_module(temp.path(), "busy", "enabled: true\n");
    let marker = temp.path().join("starts");
    write_script(
        &dir,
        "svc/Start.sh",
        &format!("echo start >> '{}'\n", marker.display()),
    );
    write_script(&dir, "svc/Stop.sh", "true\n");
    write_script(&dir, "svc/Running.sh", "echo true\n");

    modv(temp.path())
        .args(["service", "start", "--if-stopped"])
        .arg(&dir)
        .arg("svc")
        .assert()
        .success();
    assert!(!marker.exists());

    modv(temp.path())
        .args(["service", "start"])
        .arg(&dir)
        .arg("svc")
        .assert()
        .success();
    assert_eq!(fs::read_to_string(&marker).unwrap(), "start\n");
}

#[test]
fn watch_prints_changed_files() {
    let temp = tempdir().unwrap();
    let dir = write_module(
        temp.path(),
        "watched",
        "enabled: true\nwatch_files: [/main.py]\n",
    );
    let main = write_script(&dir, "main.py", "print('v1')\n");

    let mut child = StdCommand::new(assert_cmd::cargo::cargo_bin!("modv"))
        .args(["watch", "-n", "1"])
        .arg(&dir)
        .env("HOME", temp.path())
        .env_remove("RUST_LOG")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let stdout = child.stdout.take().unwrap();

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in BufReader::new(stdout).lines().map_while(Result::ok) {
            let _ = tx.send(line);
        }
    });

    // Give the watcher time to register its baseline before touching.
    thread::sleep(Duration::from_millis(500));
    touch(&main, 5);

    let line = rx.recv_timeout(Duration::from_secs(5));
    if line.is_err() {
        let _ = child.kill();
    }
    let status = child.wait().unwrap();
    assert!(line.unwrap().ends_with("main.py"));
    assert!(status.success());
}

#[test]
fn missing_module_fails_cleanly() {
    let temp = tempdir().unwrap();

    modv(temp.path())
        .args(["run"])
        .arg(temp.path().join("nope"))
        .arg("main")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Module not found"));
}
