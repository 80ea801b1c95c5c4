#[path = "common/mod.rs"]
mod common;

use common::{Harness, write_module, write_script};
use modvisor::{
    codec,
    config::Settings,
    error::ToolkitError,
    module::{MODULE_CORES, Module},
    process::{ExitReason, LaunchMode},
};
use serde::Deserialize;
use std::{fs, path::Path, time::Duration};
use tempfile::tempdir;

#[test]
fn resolve_is_case_insensitive_and_extension_agnostic() {
    let temp = tempdir().unwrap();
    let harness = Harness::new(&temp.path().join("state"));
    let dir = write_module(temp.path(), "tools", "enabled: true\n");
    write_script(&dir, "svc/Start.py", "");

    let module = Module::open_with(&dir, harness.context.clone()).unwrap();
    let expected = module.root().join("svc/Start.py");
    assert_eq!(module.resolve_file(&["svc", "start"]).unwrap(), expected);
    assert_eq!(module.resolve_file(&["svc/START"]).unwrap(), expected);

    match module.resolve_file(&["svc/missing"]).unwrap_err() {
        ToolkitError::FileNotFound { pattern } => {
            assert!(pattern.starts_with(&module.root().join("svc").display().to_string()));
            assert!(pattern.ends_with("missing.*"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn directory_without_manifest_is_never_a_module() {
    let temp = tempdir().unwrap();
    let harness = Harness::new(&temp.path().join("state"));
    let dir = temp.path().join("lookalike");
    write_script(&dir, "main.py", "print('hi')");
    write_script(&dir, "module.yml", "enabled: true\n");
    write_script(&dir, "svc/module.yaml", "enabled: true\n");

    let err = Module::open_with(&dir, harness.context.clone()).unwrap_err();
    assert!(matches!(err, ToolkitError::ModuleNotFound { .. }));
}

#[test]
fn disabled_module_never_launches() {
    let temp = tempdir().unwrap();
    let harness = Harness::new(&temp.path().join("state"));
    let dir = write_module(temp.path(), "off", "enabled: false\n");
    write_script(&dir, "main.sh", "echo hi\n");

    let module = Module::open_with(&dir, harness.context.clone()).unwrap();
    for result in [module.run(&["main"], false), module.start(&["main"], false)] {
        assert!(matches!(result, Err(ToolkitError::ModuleDisabled { .. })));
    }
    assert!(harness.launcher.calls().is_empty());
}

#[test]
fn run_passes_arguments_to_plain_scripts() {
    let temp = tempdir().unwrap();
    let harness = Harness::new(&temp.path().join("state"));
    let dir = write_module(temp.path(), "greeter", "enabled: true\n");
    write_script(&dir, "greet.sh", "echo \"$1|$2\"\n");

    let module = Module::open_with(&dir, harness.context.clone()).unwrap();
    let process = module.run(&["greet", "a", "b c"], false).unwrap();

    assert!(process.finished());
    assert_eq!(process.stdout(), "a|b c\n");
    assert_eq!(harness.captured().stdout, "a|b c\n");

    let calls = harness.launcher.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].args[1..], ["a".to_string(), "b c".to_string()]);
    assert_eq!(calls[0].cores, MODULE_CORES);
    assert!(calls[0].wait);
}

#[test]
fn interpreter_scripts_receive_one_packed_argument() {
    let temp = tempdir().unwrap();
    // Any interpreter works; sh echoes the packed argument straight back.
    let settings = Settings {
        python: "sh".into(),
        ..Settings::default()
    };
    let harness = Harness::with_settings(&temp.path().join("state"), settings);
    let dir = write_module(temp.path(), "py", "enabled: true\n");
    let script = write_script(&dir, "tool.py", "echo \"$1\"\n");

    let module = Module::open_with(&dir, harness.context.clone()).unwrap();
    let process = module.run(&["tool", "a", "b c"], true).unwrap();

    let calls = harness.launcher.calls();
    assert_eq!(calls[0].args.len(), 2);
    assert_eq!(
        Path::new(&calls[0].args[0]),
        fs::canonicalize(script).unwrap()
    );
    assert_eq!(process.command()[0], "sh");

    let echoed = process.stdout();
    assert_eq!(codec::decode_args(&echoed).unwrap(), vec!["a", "b c"]);
    assert!(harness.captured().stdout.is_empty());
}

#[derive(Debug, Deserialize, PartialEq)]
struct Report {
    name: String,
    count: u32,
}

#[test]
fn cap_parses_json_output() {
    let temp = tempdir().unwrap();
    let harness = Harness::new(&temp.path().join("state"));
    let dir = write_module(temp.path(), "reporter", "enabled: true\n");
    write_script(
        &dir,
        "report.sh",
        "echo '{\"name\": \"'\"$1\"'\", \"count\": 2}'\n",
    );

    let module = Module::open_with(&dir, harness.context.clone()).unwrap();
    let report: Report = module.cap(&["report", "disk"]).unwrap();

    assert_eq!(
        report,
        Report {
            name: "disk".into(),
            count: 2
        }
    );
    assert!(harness.launcher.calls()[0].hide);
    assert!(harness.captured().stdout.is_empty());
}

#[test]
fn cap_reports_unparsable_output() {
    let temp = tempdir().unwrap();
    let harness = Harness::new(&temp.path().join("state"));
    let dir = write_module(temp.path(), "noisy", "enabled: true\n");
    write_script(&dir, "report.sh", "echo definitely not json\n");

    let module = Module::open_with(&dir, harness.context.clone()).unwrap();
    let err = module.cap::<Report, _>(&["report"]).unwrap_err();
    assert!(matches!(err, ToolkitError::Decode(_)));
}

#[test]
fn start_returns_while_script_runs() {
    let temp = tempdir().unwrap();
    let harness = Harness::new(&temp.path().join("state"));
    let dir = write_module(temp.path(), "daemon", "enabled: true\n");
    write_script(&dir, "loop.sh", "sleep 10\n");

    let module = Module::open_with(&dir, harness.context.clone()).unwrap();
    let process = module.start(&["loop"], true).unwrap();

    assert!(!process.finished());
    assert!(!harness.launcher.calls()[0].wait);
    process.stop().unwrap();
    process.wait();
    assert!(process.finished());
}

#[test]
fn start_with_timeout_lets_the_supervisor_kill_the_script() {
    let temp = tempdir().unwrap();
    let harness = Harness::new(&temp.path().join("state"));
    let dir = write_module(temp.path(), "slow", "enabled: true\n");
    write_script(&dir, "forever.sh", "sleep 30\n");

    let module = Module::open_with(&dir, harness.context.clone()).unwrap();
    let process = module
        .start_with(&["forever"], true, Some(Duration::from_millis(300)))
        .unwrap();
    assert_eq!(
        harness.launcher.calls()[0].timeout,
        Some(Duration::from_millis(300))
    );

    process.wait();
    assert!(process.finished());
    assert_eq!(process.timed_out(), Some(true));
    assert_eq!(process.exit_reason(), Some(ExitReason::TimedOut));
    assert!(process.elapsed() < Duration::from_secs(5));
}

#[test]
fn plain_start_has_no_timeout() {
    let temp = tempdir().unwrap();
    let harness = Harness::new(&temp.path().join("state"));
    let dir = write_module(temp.path(), "quick", "enabled: true\n");
    write_script(&dir, "done.sh", "true\n");

    let module = Module::open_with(&dir, harness.context.clone()).unwrap();
    let process = module.start(&["done"], true).unwrap();
    process.wait();

    assert_eq!(process.timed_out(), None);
    assert_eq!(process.exit_reason(), Some(ExitReason::Finished));
}

#[test]
fn git_runs_in_module_root() {
    let temp = tempdir().unwrap();
    let settings = Settings {
        git: "pwd".into(),
        ..Settings::default()
    };
    let harness = Harness::with_settings(&temp.path().join("state"), settings);
    let dir = write_module(temp.path(), "repo", "enabled: true\n");

    let module = Module::open_with(&dir, harness.context.clone()).unwrap();
    let process = module.git(&["-P"], true).unwrap();

    assert_eq!(process.stdout().trim(), module.root().display().to_string());
    assert_eq!(harness.launcher.calls()[0].mode, LaunchMode::Shell);
}

fn install_settings(python: &str) -> Settings {
    Settings {
        python: python.into(),
        git: "true".into(),
        elevate: false,
        ..Settings::default()
    }
}

#[test]
fn install_initialises_repo_then_upgrades_each_package() {
    let temp = tempdir().unwrap();
    let harness = Harness::with_settings(&temp.path().join("state"), install_settings("echo"));
    let dir = write_module(
        temp.path(),
        "deps",
        "enabled: true\npackages: [alpha, beta]\n",
    );

    let module = Module::open_with(&dir, harness.context.clone()).unwrap();
    module.install(true).unwrap();

    let calls = harness.launcher.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0].args, vec!["true", "init"]);
    assert_eq!(calls[0].working_dir.as_deref(), Some(module.root()));
    for (call, package) in calls[1..].iter().zip(["alpha", "beta"]) {
        assert_eq!(call.mode, LaunchMode::PythonModule);
        assert_eq!(call.args, vec!["pip", "install", "--upgrade", package]);
        assert!(!call.elevated);
        assert!(call.wait);
    }
}

#[test]
fn install_stops_at_first_failing_package() {
    let temp = tempdir().unwrap();
    let harness = Harness::with_settings(&temp.path().join("state"), install_settings("false"));
    let dir = write_module(
        temp.path(),
        "broken",
        "enabled: true\npackages: [alpha, beta]\n",
    );

    let module = Module::open_with(&dir, harness.context.clone()).unwrap();
    let err = module.install(true).unwrap_err();

    assert!(matches!(
        err,
        ToolkitError::InstallFailed { ref package, .. } if package == "alpha"
    ));
    assert_eq!(harness.launcher.calls().len(), 2);
}

#[test]
fn watch_reports_changed_watch_file() {
    let temp = tempdir().unwrap();
    let harness = Harness::new(&temp.path().join("state"));
    let dir = write_module(
        temp.path(),
        "watched",
        "enabled: true\nwatch_files: [/main.py]\n",
    );
    let main = write_script(&dir, "main.py", "print(1)\n");

    let module = Module::open_with(&dir, harness.context.clone()).unwrap();
    let mut watcher = module.watch().interval(Duration::from_millis(20));

    common::touch(&main, 5);
    let changed = watcher.next().unwrap();
    assert_eq!(changed.path(), fs::canonicalize(&main).unwrap());
    assert_eq!(changed.module_root(), module.root());
}
