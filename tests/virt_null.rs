//! Driver against the real `reprocheck-virt null` server.

mod common;

use reprocheck::error::TestbedError;
use reprocheck::process::OutputMode;
use reprocheck::testbed::{CommandKind, EnvOverrides, ExecRequest, Testbed, Timeouts};
use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};

fn start() -> Testbed {
    let argv = vec![common::virt_bin().display().to_string(), "null".to_string()];
    Testbed::start(&argv, Timeouts::default()).expect("start null testbed")
}

#[test]
fn session_round_trip() {
    let mut testbed = start();
    let caps = testbed.open().expect("open").to_vec();
    let scratch = testbed.scratch().expect("scratch").to_string();
    assert!(caps.iter().any(|cap| cap.starts_with("downtmp-host=")), "{caps:?}");
    assert!(!testbed.has_capability("revert"));

    let mut env = EnvOverrides::new();
    env.insert("GREETING".to_string(), Some("hi there".to_string()));
    env.insert("HOME".to_string(), None);
    let argv: Vec<String> = ["sh", "-c", "printf '%s|%s|%s' \"$GREETING\" \"${HOME-unset}\" \"$(pwd -P)\""]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let out = testbed
        .execute(&ExecRequest {
            argv: &argv,
            env: &env,
            cwd: Some(&scratch),
            stdin: None,
            kind: CommandKind::Short,
            output: OutputMode::Capture,
        })
        .expect("execute");
    assert_eq!(out.exit_code, 0);
    let canonical = std::fs::canonicalize(&scratch).expect("canonical scratch");
    assert_eq!(
        String::from_utf8_lossy(&out.stdout),
        format!("hi there|unset|{}", canonical.display())
    );

    assert!(matches!(testbed.revert(), Err(TestbedError::RevertUnsupported)));
    assert!(!testbed.is_poisoned());
    testbed.close().expect("close");
    assert!(!std::path::Path::new(&scratch).exists());
    testbed.stop();
}

#[test]
fn copydown_and_copyup_of_a_tree() {
    let host = tempfile::tempdir().expect("host dir");
    std::fs::create_dir_all(host.path().join("src/nested")).expect("mkdir");
    std::fs::write(host.path().join("src/nested/file.txt"), "payload").expect("write");

    let mut testbed = start();
    testbed.open().expect("open");
    let scratch = testbed.scratch().expect("scratch").to_string();
    testbed
        .copydown(
            &format!("{}/", host.path().join("src").display()),
            &format!("{scratch}/tree/"),
        )
        .expect("copydown");
    let back = host.path().join("back");
    testbed
        .copyup(&format!("{scratch}/tree/"), &format!("{}/", back.display()))
        .expect("copyup");
    assert_eq!(
        std::fs::read_to_string(back.join("nested/file.txt")).expect("read back"),
        "payload"
    );
    testbed
        .copyup(
            &format!("{scratch}/tree/nested/file.txt"),
            &host.path().join("single.txt").display().to_string(),
        )
        .expect("copyup file");
    assert_eq!(
        std::fs::read_to_string(host.path().join("single.txt")).expect("read single"),
        "payload"
    );
}

#[test]
fn execute_with_host_stdio_files() {
    let host = tempfile::tempdir().expect("host dir");
    let stdin = host.path().join("stdin");
    let stdout = host.path().join("stdout");
    let stderr = host.path().join("stderr");
    std::fs::write(&stdin, "fed through a file\n").expect("write stdin");

    let mut testbed = start();
    testbed.open().expect("open");
    let scratch = testbed.scratch().expect("scratch").to_string();
    let argv: Vec<String> = ["sh", "-c", "cat; pwd -P; echo oops >&2; exit 4"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let status = testbed
        .execute_with_files(&argv, &stdin, &stdout, &stderr, &scratch)
        .expect("execute");
    assert_eq!(status, 4);
    let canonical = std::fs::canonicalize(&scratch).expect("canonical scratch");
    assert_eq!(
        std::fs::read_to_string(&stdout).expect("stdout file"),
        format!("fed through a file\n{}\n", canonical.display())
    );
    assert_eq!(std::fs::read_to_string(&stderr).expect("stderr file"), "oops\n");
    assert!(!testbed.is_poisoned());
}

#[test]
fn reboot_is_refused_without_the_capability() {
    let mut testbed = start();
    testbed.open().expect("open");
    assert!(!testbed.has_capability("reboot"));
    let err = testbed.prepare_reboot().expect_err("null cannot reboot");
    assert!(
        matches!(&err, TestbedError::CapabilityMissing { capability, .. } if capability == "reboot"),
        "{err}"
    );
    assert!(testbed.wait_reboot().is_err());
    assert!(!testbed.is_poisoned());
}

#[test]
fn raw_protocol_banner_and_errors() {
    let mut child = Command::new(common::virt_bin())
        .arg("null")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn reprocheck-virt");
    {
        let stdin = child.stdin.as_mut().expect("stdin");
        writeln!(stdin, "downtmp foo").expect("write");
        writeln!(stdin, "frobnicate").expect("write");
        writeln!(stdin, "open").expect("write");
        writeln!(stdin, "open extra").expect("write");
        writeln!(stdin, "quit").expect("write");
    }
    let output = child.wait_with_output().expect("wait");
    assert_eq!(output.status.code(), Some(0));
    let text = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "ok");
    assert!(lines[1].starts_with("bad-pkg"), "{text}");
    assert!(lines[2].starts_with("bad-pkg"), "{text}");
    assert!(lines[3].starts_with("ok "), "{text}");
    assert!(lines[4].starts_with("bad-pkg"), "{text}");
    assert_eq!(lines.len(), 5, "{text}");
}

#[test]
fn terminated_server_removes_its_scratch() {
    let mut child = Command::new(common::virt_bin())
        .arg("null")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn reprocheck-virt");
    let mut stdin = child.stdin.take().expect("stdin");
    let mut replies = BufReader::new(child.stdout.take().expect("stdout"));
    let mut line = String::new();
    replies.read_line(&mut line).expect("banner");
    assert_eq!(line, "ok\n");
    writeln!(stdin, "open").expect("write");
    line.clear();
    replies.read_line(&mut line).expect("open reply");
    let scratch = line
        .trim_end()
        .strip_prefix("ok ")
        .expect("open succeeded")
        .to_string();
    assert!(std::path::Path::new(&scratch).is_dir());

    let pid = libc::pid_t::try_from(child.id()).expect("pid");
    // SAFETY: kill(2) only sends a signal.
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    let status = child.wait().expect("wait");
    assert_eq!(status.code(), Some(128 + libc::SIGTERM));
    assert!(!std::path::Path::new(&scratch).exists(), "{scratch} left behind");
    drop(stdin);
}
