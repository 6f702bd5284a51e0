use super::*;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const SCRIPTED_BACKEND: &str = r#"#!/bin/sh
echo ok
while read -r cmd rest; do
  case "$cmd" in
    open) echo "ok /tmp" ;;
    print-execute-command) echo "ok" ;;
    capabilities) echo "ok downtmp-host%3D/tmp suggested-normal-user%3Dbuilder" ;;
    close) echo ok ;;
    quit) exit 0 ;;
    *) echo "bad-pkg unknown%20command" ;;
  esac
done
"#;

fn write_backend(dir: &TempDir, name: &str, body: &str) -> Vec<String> {
    let path: PathBuf = dir.path().join(name);
    std::fs::write(&path, body).expect("write backend");
    let mut perms = std::fs::metadata(&path).expect("stat").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod");
    vec![path.display().to_string()]
}

fn quick_timeouts() -> Timeouts {
    Timeouts {
        short_secs: 1,
        copy_secs: 5,
        build_secs: 10,
    }
}

#[test]
fn silent_backend_times_out_waiting_for_banner() {
    let dir = TempDir::new().expect("tempdir");
    let argv = write_backend(&dir, "silent", "#!/bin/sh\nexec sleep 600\n");
    let started = std::time::Instant::now();
    let err = Testbed::start(&argv, quick_timeouts())
        .err()
        .expect("banner should time out");
    assert!(matches!(err, TestbedError::ProtocolTimeout { .. }), "{err}");
    assert!(started.elapsed() < Duration::from_secs(30));
}

#[test]
fn revert_without_capability_is_refused_locally() {
    let dir = TempDir::new().expect("tempdir");
    let argv = write_backend(&dir, "scripted", SCRIPTED_BACKEND);
    let mut testbed = Testbed::start(&argv, quick_timeouts()).expect("start");
    testbed.open().expect("open");
    assert_eq!(testbed.scratch(), Some("/tmp"));
    assert_eq!(testbed.capability_value("downtmp-host"), Some("/tmp"));
    assert_eq!(testbed.capability_value("suggested-normal-user"), Some("builder"));

    let err = testbed.revert().expect_err("no revert capability");
    assert!(matches!(err, TestbedError::RevertUnsupported));
    assert!(!testbed.is_poisoned());
    testbed.close().expect("close after refused revert");
}

#[test]
fn unknown_command_is_bad_request_and_not_fatal() {
    let dir = TempDir::new().expect("tempdir");
    let argv = write_backend(&dir, "scripted", SCRIPTED_BACKEND);
    let mut testbed = Testbed::start(&argv, quick_timeouts()).expect("start");
    testbed.open().expect("open");
    let err = testbed.downtmp("build").expect_err("scripted backend has no downtmp");
    assert!(matches!(err, TestbedError::BadRequest(msg) if msg == "unknown command"));
    assert!(!testbed.is_poisoned());
}

#[test]
fn execute_applies_env_and_cwd() {
    let dir = TempDir::new().expect("tempdir");
    let argv = write_backend(&dir, "scripted", SCRIPTED_BACKEND);
    let mut testbed = Testbed::start(&argv, quick_timeouts()).expect("start");
    testbed.open().expect("open");

    let workdir = TempDir::new().expect("workdir");
    let cwd = workdir.path().display().to_string();
    let mut env = EnvOverrides::new();
    env.insert("REPROCHECK_MARKER".to_string(), Some("set".to_string()));
    env.insert("HOME".to_string(), None);
    let command = vec![
        "sh".to_string(),
        "-c".to_string(),
        "echo \"$REPROCHECK_MARKER ${HOME:-unset}\"; pwd".to_string(),
    ];
    let out = testbed
        .execute(&ExecRequest {
            argv: &command,
            env: &env,
            cwd: Some(&cwd),
            stdin: None,
            kind: CommandKind::Short,
            output: OutputMode::Capture,
        })
        .expect("execute");
    assert_eq!(out.exit_code, 0);
    let stdout = String::from_utf8_lossy(&out.stdout);
    let mut lines = stdout.lines();
    assert_eq!(lines.next(), Some("set unset"));
    let pwd = PathBuf::from(lines.next().expect("pwd line"));
    assert_eq!(
        pwd.canonicalize().expect("canonical pwd"),
        workdir.path().canonicalize().expect("canonical workdir")
    );
}

#[test]
fn dead_backend_poisons_the_session() {
    let dir = TempDir::new().expect("tempdir");
    let argv = write_backend(&dir, "dies", "#!/bin/sh\necho ok\nexit 0\n");
    let mut testbed = Testbed::start(&argv, quick_timeouts()).expect("start");
    let err = testbed.open().expect_err("backend is gone");
    assert!(matches!(err, TestbedError::ChannelLost(_)), "{err}");
    assert!(testbed.is_poisoned());
    assert!(matches!(testbed.downtmp("x"), Err(TestbedError::Poisoned)));
}

#[test]
fn wrap_argv_unsets_before_setting() {
    let mut env = EnvOverrides::new();
    env.insert("B".to_string(), Some("2".to_string()));
    env.insert("A".to_string(), None);
    let argv = vec!["make".to_string()];
    assert_eq!(wrap_argv(&argv, &env, None), vec!["env", "-u", "A", "B=2", "make"]);
    assert_eq!(wrap_argv(&argv, &EnvOverrides::new(), None), vec!["make"]);
    let wrapped = wrap_argv(&argv, &EnvOverrides::new(), Some("/build"));
    assert_eq!(wrapped[0], "sh");
    assert_eq!(&wrapped[4..], ["/build", "make"]);
}

/// Answers like a backend that can reboot, logging every request it gets.
fn logging_backend(log: &Path) -> String {
    format!(
        r#"#!/bin/sh
echo ok
while read -r line; do
  echo "$line" >> {log}
  set -- $line
  case "$1" in
    open) echo "ok /tmp" ;;
    print-execute-command) echo "ok" ;;
    capabilities) echo "ok reboot" ;;
    prepare-reboot|wait-reboot|shell|close) echo ok ;;
    quit) exit 0 ;;
    *) echo "bad-pkg unknown%20command" ;;
  esac
done
"#,
        log = log.display()
    )
}

#[test]
fn reboot_and_shell_requests_reach_the_backend() {
    let dir = TempDir::new().expect("tempdir");
    let log = dir.path().join("requests.log");
    let argv = write_backend(&dir, "rebooting", &logging_backend(&log));
    let mut testbed = Testbed::start(&argv, quick_timeouts()).expect("start");
    testbed.open().expect("open");
    assert!(testbed.has_capability("reboot"));
    testbed.prepare_reboot().expect("prepare-reboot");
    testbed.wait_reboot().expect("wait-reboot");
    testbed.shell("/tmp/build dir").expect("shell");
    testbed.stop();

    let requests = std::fs::read_to_string(&log).expect("request log");
    let requests: Vec<&str> = requests.lines().collect();
    assert_eq!(
        requests,
        vec![
            "open",
            "print-execute-command",
            "capabilities",
            "prepare-reboot",
            "wait-reboot",
            "shell /tmp/build%20dir",
            "close",
            "quit",
        ]
    );
}

/// Hangs on `downtmp`; removes its scratch only when sent SIGTERM.
fn hanging_backend(pid_file: &Path) -> String {
    format!(
        r#"#!/bin/sh
echo $$ > {pid_file}
scratch=$(mktemp -d)
trap 'kill $sleeper 2>/dev/null; rm -rf "$scratch"; exit 143' TERM
echo ok
while read -r cmd rest; do
  case "$cmd" in
    open) echo "ok $scratch" ;;
    print-execute-command) echo "ok" ;;
    capabilities) echo "ok" ;;
    downtmp) sleep 600 & sleeper=$!; wait $sleeper ;;
    quit) exit 0 ;;
    *) echo "bad-pkg unknown%20command" ;;
  esac
done
"#,
        pid_file = pid_file.display()
    )
}

#[test]
fn stop_terminates_a_hung_backend_so_it_can_clean_up() {
    let dir = TempDir::new().expect("tempdir");
    let pid_file = dir.path().join("backend.pid");
    let argv = write_backend(&dir, "hanging", &hanging_backend(&pid_file));
    let mut testbed = Testbed::start(&argv, quick_timeouts()).expect("start");
    testbed.open().expect("open");
    let scratch = PathBuf::from(testbed.scratch().expect("scratch"));
    assert!(scratch.is_dir());

    let err = testbed.downtmp("build").expect_err("backend hangs");
    assert!(matches!(err, TestbedError::ProtocolTimeout { .. }), "{err}");
    assert!(testbed.is_poisoned());

    let started = std::time::Instant::now();
    testbed.stop();
    assert!(started.elapsed() < Duration::from_secs(10), "{:?}", started.elapsed());
    assert!(!scratch.exists(), "backend left {} behind", scratch.display());
    let pid: u32 = std::fs::read_to_string(&pid_file)
        .expect("pid file")
        .trim()
        .parse()
        .expect("pid");
    assert!(!crate::process::pid_alive(pid));
}
