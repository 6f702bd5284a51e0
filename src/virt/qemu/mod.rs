//! QEMU virtual machine backend.
//!
//! The guest boots from a throwaway qcow2 overlay. Commands run through a
//! root shell started on the second serial port, with stdio bridged by the
//! shovel over a 9p share mounted in the guest. Revert tears the VM down
//! and boots a fresh overlay.
pub mod console;
pub mod monitor;
pub mod port;

use self::console::Console;
use self::monitor::Monitor;
use super::termination::TrackedDir;
use super::Backend;
use crate::error::{TestbedError, TestbedResult};
use crate::process::{self, OutputMode};
use crate::shovel::{self, SharedDir, ShellChannel, UnixSocketChannel};
use crate::util::{format_command_line, poll_until, shell_quote, truncate_bytes};
use regex::bytes::Regex;
use serde::Deserialize;
use std::fmt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

/// Guest mount point of the host shared directory.
pub const GUEST_SHARED: &str = "/run/reprocheck/shared";
const MOUNT_TAG: &str = "reprocheck";

const SETTLE_DELAY: Duration = Duration::from_secs(3);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const SETUP_TIMEOUT: Duration = Duration::from_secs(60);
const PORT_RANGE: u16 = 100;
const GUEST_SSH_PORT: u16 = 22;
const MIN_NORMAL_UID: u32 = 1000;
const MAX_NORMAL_UID: u32 = 60000;

#[derive(Debug, Clone)]
pub struct QemuOptions {
    pub image: PathBuf,
    pub extra_images: Vec<PathBuf>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub ram_size_mib: u32,
    pub cpus: u32,
    pub qemu_command: Option<String>,
    pub qemu_img_command: String,
    pub boot_timeout: Duration,
    pub port_base: u16,
    pub baseimage: bool,
    pub port_lock_dir: PathBuf,
    /// Program providing the `shovel` subcommand, normally the running binary.
    pub shovel_program: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Closed,
    Booting,
    LoginPromptSeen,
    ShellEstablished,
    SharedMountReady,
    ConfigApplied,
    Ready,
    Rebooting,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VmState::Closed => "closed",
            VmState::Booting => "booting",
            VmState::LoginPromptSeen => "login-prompt-seen",
            VmState::ShellEstablished => "shell-established",
            VmState::SharedMountReady => "shared-mount-ready",
            VmState::ConfigApplied => "config-applied",
            VmState::Ready => "ready",
            VmState::Rebooting => "rebooting",
        };
        f.write_str(name)
    }
}

/// Everything one boot owns. Dropping it removes the work directory.
struct Session {
    workdir: TrackedDir,
    vm: Child,
    console: Option<Console>,
    image_format: String,
    port: Option<u16>,
    suggested_user: Option<String>,
    scratch: Option<String>,
}

impl Session {
    fn path(&self, name: &str) -> PathBuf {
        self.workdir.path().join(name)
    }

    fn shared(&self) -> SharedDir {
        SharedDir {
            host: self.path("shared"),
            guest: GUEST_SHARED.to_string(),
        }
    }
}

pub struct QemuBackend {
    opts: QemuOptions,
    state: VmState,
    session: Option<Session>,
}

#[derive(Deserialize)]
struct ImageInfo {
    format: String,
}

impl QemuBackend {
    pub fn new(opts: QemuOptions) -> Self {
        QemuBackend {
            opts,
            state: VmState::Closed,
            session: None,
        }
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    fn set_state(&mut self, state: VmState) {
        tracing::debug!(from = %self.state, to = %state, "vm state");
        self.state = state;
    }

    fn login_user_is_root(&self) -> bool {
        !matches!(self.opts.user.as_deref(), Some(user) if user != "root")
    }

    fn boot(&mut self) -> TestbedResult<String> {
        self.set_state(VmState::Booting);
        let workdir = TrackedDir::new(
            tempfile::Builder::new()
                .prefix("reprocheck-qemu.")
                .tempdir()?,
        );
        std::fs::create_dir(workdir.path().join("shared"))?;

        let image = std::fs::canonicalize(&self.opts.image).map_err(|err| {
            TestbedError::BootFailure(format!("image {}: {err}", self.opts.image.display()))
        })?;
        let image_format = self.image_format(&image)?;
        let overlay = workdir.path().join("overlay.img");
        self.create_overlay(&image, &image_format, &overlay)?;

        let port = match port::find_free_port(self.opts.port_base, PORT_RANGE, &self.opts.port_lock_dir) {
            Ok(port) => port,
            Err(err) => {
                tracing::warn!(error = %err, "port discovery failed; not forwarding");
                None
            }
        };
        if port.is_none() {
            tracing::info!("no free port to forward");
        }

        let argv = self.qemu_argv(workdir.path(), &overlay, port)?;
        tracing::info!(command = %format_command_line(&argv), "launching vm");
        let vm = spawn_vm(&argv, &workdir.path().join("qemu.log"))?;
        self.session = Some(Session {
            workdir,
            vm,
            console: None,
            image_format,
            port,
            suggested_user: None,
            scratch: None,
        });

        let timeout = self.opts.boot_timeout;
        let session = self.session_mut()?;
        let mut console = Console::connect(&session.path("ttyS0"), "ttyS0", timeout)?;
        wait_login_prompt(&mut console, timeout)?;
        session.console = Some(console);
        self.set_state(VmState::LoginPromptSeen);
        thread::sleep(SETTLE_DELAY);

        self.bring_up()?;
        let scratch = self.run_guest_stdout(&[
            "mktemp".to_string(),
            "-d".to_string(),
            "/tmp/reprocheck.XXXXXX".to_string(),
        ])?;
        let scratch = scratch.trim().to_string();
        if scratch.is_empty() {
            return Err(TestbedError::BootFailure("mktemp in guest printed nothing".to_string()));
        }
        self.session_mut()?.scratch = Some(scratch.clone());
        Ok(scratch)
    }

    /// Login prompt seen → Ready.
    fn bring_up(&mut self) -> TestbedResult<()> {
        self.establish_shell()?;
        self.set_state(VmState::ShellEstablished);

        if self.opts.baseimage {
            let (monitor_path, format) = {
                let session = self.session_mut()?;
                (session.path("monitor"), session.image_format.clone())
            };
            let mut monitor = Monitor::connect(&monitor_path, SETUP_TIMEOUT)?;
            monitor.attach_baseimage(&self.opts.image, &format)?;
        }

        self.mount_shared()?;
        self.set_state(VmState::SharedMountReady);

        let shared = self.session_mut()?.shared();
        shovel::install_helper(&shared.host)?;
        let status = self.run_guest(&["true".to_string()], OutputMode::Capture)?.exit_code;
        if status != 0 {
            return Err(TestbedError::ShellSetupFailure(format!(
                "round trip through the shovel returned {status}"
            )));
        }

        self.apply_config()?;
        self.set_state(VmState::ConfigApplied);

        let passwd = self.run_guest_stdout(&["getent".to_string(), "passwd".to_string()])?;
        let user = suggested_normal_user(&passwd);
        if let Some(user) = &user {
            tracing::debug!(%user, "suggested normal user");
        }
        self.session_mut()?.suggested_user = user;
        self.set_state(VmState::Ready);
        Ok(())
    }

    /// Start a root shell on ttyS1 unless one already answers there.
    fn establish_shell(&mut self) -> TestbedResult<()> {
        let tty1 = self.session_mut()?.path("ttyS1");
        if probe_shell(&tty1)? {
            tracing::debug!("shell already running on ttyS1");
            return Ok(());
        }
        let user = self.opts.user.clone().unwrap_or_else(|| "root".to_string());
        let password = self.opts.password.clone();
        let escalate = !self.login_user_is_root();
        let console = self
            .session_mut()?
            .console
            .as_mut()
            .ok_or_else(|| TestbedError::ShellSetupFailure("ttyS0 is not connected".to_string()))?;

        console.send(&format!("{user}\n"))?;
        let password_prompt = Regex::new(r"(?i)password:\s*").expect("regex for password prompt");
        let shell_prompt = Regex::new(r"[#$] ?$").expect("regex for shell prompt");
        if let Some(password) = &password {
            if console.expect(&password_prompt, PROBE_TIMEOUT)?.is_none() {
                return Err(TestbedError::ShellSetupFailure(format!(
                    "no password prompt after sending user {user}"
                )));
            }
            console.send(&format!("{password}\n"))?;
        }
        if console.expect(&shell_prompt, SETUP_TIMEOUT)?.is_none() {
            return Err(TestbedError::ShellSetupFailure(format!(
                "login as {user} did not reach a shell prompt: {}",
                truncate_bytes(console.tail(), 512)
            )));
        }

        let start = "setsid sh -c 'stty raw -echo 2>/dev/null; PS1= PS2= exec sh' </dev/ttyS1 >/dev/ttyS1 2>&1 &";
        if escalate {
            console.send(&format!("sudo sh -c {}\n", shell_quote(start)))?;
            if let Some(password) = &password {
                if console.expect(&password_prompt, Duration::from_secs(2))?.is_some() {
                    console.send(&format!("{password}\n"))?;
                }
            }
        } else {
            console.send(&format!("{start}\n"))?;
        }

        if !probe_shell(&tty1)? {
            return Err(TestbedError::ShellSetupFailure(
                "no shell answered on ttyS1".to_string(),
            ));
        }
        Ok(())
    }

    fn mount_shared(&mut self) -> TestbedResult<()> {
        let session = self.session_mut()?;
        let tty1 = session.path("ttyS1");
        let flag = session.path("shared").join("done_shared");
        let mut channel = UnixSocketChannel::connect(&tty1)
            .map_err(|err| TestbedError::ChannelLost(format!("connect ttyS1: {err}")))?;
        let line = format!(
            "mkdir -p {GUEST_SHARED} && mount -t 9p -o trans=virtio,access=any,version=9p2000.L {MOUNT_TAG} {GUEST_SHARED} && touch {GUEST_SHARED}/done_shared"
        );
        channel
            .send_line(&line)
            .map_err(|err| TestbedError::ChannelLost(format!("write ttyS1: {err}")))?;
        let mounted = poll_until(SETUP_TIMEOUT, || Ok::<_, TestbedError>(flag.exists().then_some(())))?;
        if mounted.is_none() {
            return Err(TestbedError::BootFailure(format!(
                "guest did not mount the shared directory at {GUEST_SHARED}"
            )));
        }
        let _ = std::fs::remove_file(flag);
        Ok(())
    }

    /// Give the guest the host's timezone so only the variation changes it.
    fn apply_config(&mut self) -> TestbedResult<()> {
        let Some(zone) = host_timezone() else {
            tracing::debug!("host timezone unknown; leaving guest clock zone alone");
            return Ok(());
        };
        let script = format!(
            "[ ! -e /usr/share/zoneinfo/{zone} ] || ln -sf /usr/share/zoneinfo/{zone} /etc/localtime"
        );
        let out = self.run_guest(
            &["sh".to_string(), "-c".to_string(), script],
            OutputMode::Capture,
        )?;
        if out.exit_code != 0 {
            tracing::warn!(%zone, "could not set guest timezone");
        }
        Ok(())
    }

    fn run_guest(&mut self, argv: &[String], output: OutputMode) -> TestbedResult<process::CapturedOutput> {
        let mut full = self.execute_prefix();
        full.extend(argv.iter().cloned());
        let (program, args) = full
            .split_first()
            .ok_or_else(|| TestbedError::Protocol("empty command".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        process::run_with_deadline(&mut cmd, None, output, SETUP_TIMEOUT).map_err(|err| match err {
            process::RunError::TimedOut => TestbedError::ShellSetupFailure(format!(
                "`{}` did not finish in the guest",
                format_command_line(argv)
            )),
            process::RunError::Spawn(err) | process::RunError::Wait(err) => TestbedError::Io(err),
        })
    }

    fn run_guest_stdout(&mut self, argv: &[String]) -> TestbedResult<String> {
        let out = self.run_guest(argv, OutputMode::Capture)?;
        if out.exit_code != 0 {
            return Err(TestbedError::ShellSetupFailure(format!(
                "`{}` failed in the guest with status {}: {}",
                format_command_line(argv),
                out.exit_code,
                truncate_bytes(&out.stderr, 512).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    fn image_format(&self, image: &Path) -> TestbedResult<String> {
        let mut cmd = Command::new(&self.opts.qemu_img_command);
        cmd.arg("info").arg("--output=json").arg(image);
        let out = process::run_with_deadline(&mut cmd, None, OutputMode::Capture, SETUP_TIMEOUT)
            .map_err(|err| TestbedError::BootFailure(format!("qemu-img info: {err:?}")))?;
        if out.exit_code != 0 {
            return Err(TestbedError::BootFailure(format!(
                "qemu-img info {}: {}",
                image.display(),
                truncate_bytes(&out.stderr, 512).trim()
            )));
        }
        let info: ImageInfo = serde_json::from_slice(&out.stdout)
            .map_err(|err| TestbedError::BootFailure(format!("parse qemu-img info: {err}")))?;
        Ok(info.format)
    }

    fn create_overlay(&self, image: &Path, format: &str, overlay: &Path) -> TestbedResult<()> {
        let mut cmd = Command::new(&self.opts.qemu_img_command);
        cmd.args(["create", "-f", "qcow2", "-F", format, "-b"])
            .arg(image)
            .arg(overlay);
        let out = process::run_with_deadline(&mut cmd, None, OutputMode::Capture, SETUP_TIMEOUT)
            .map_err(|err| TestbedError::BootFailure(format!("qemu-img create: {err:?}")))?;
        if out.exit_code != 0 {
            return Err(TestbedError::BootFailure(format!(
                "create overlay: {}",
                truncate_bytes(&out.stderr, 512).trim()
            )));
        }
        Ok(())
    }

    fn qemu_argv(&self, workdir: &Path, overlay: &Path, port: Option<u16>) -> TestbedResult<Vec<String>> {
        let program = match &self.opts.qemu_command {
            Some(program) => program.clone(),
            None => {
                let name = format!("qemu-system-{}", std::env::consts::ARCH);
                which::which(&name)
                    .map_err(|_| TestbedError::BootFailure(format!("{name} not found in PATH")))?
                    .display()
                    .to_string()
            }
        };
        let mut netdev = "user,id=net0".to_string();
        if let Some(port) = port {
            netdev.push_str(&format!(",hostfwd=tcp:127.0.0.1:{port}-:{GUEST_SSH_PORT}"));
        }
        let path = |name: &str| workdir.join(name).display().to_string();
        let mut argv = vec![
            program,
            "-m".to_string(),
            self.opts.ram_size_mib.to_string(),
            "-smp".to_string(),
            self.opts.cpus.to_string(),
            "-nographic".to_string(),
            "-netdev".to_string(),
            netdev,
            "-device".to_string(),
            "virtio-net-pci,netdev=net0".to_string(),
            "-object".to_string(),
            "rng-random,filename=/dev/urandom,id=rng0".to_string(),
            "-device".to_string(),
            "virtio-rng-pci,rng=rng0".to_string(),
            "-monitor".to_string(),
            format!("unix:{},server=on,wait=off", path("monitor")),
            "-serial".to_string(),
            format!("unix:{},server=on,wait=off", path("ttyS0")),
            "-serial".to_string(),
            format!("unix:{},server=on,wait=off", path("ttyS1")),
            "-virtfs".to_string(),
            format!(
                "local,id={MOUNT_TAG},path={},security_model=none,mount_tag={MOUNT_TAG}",
                path("shared")
            ),
            "-drive".to_string(),
            format!("file={},cache=unsafe,if=virtio,index=0,format=qcow2", overlay.display()),
        ];
        for (idx, extra) in self.opts.extra_images.iter().enumerate() {
            argv.push("-drive".to_string());
            argv.push(format!(
                "file={},if=virtio,index={},readonly=on",
                extra.display(),
                idx + 1
            ));
        }
        if kvm_available() {
            argv.push("-enable-kvm".to_string());
        }
        Ok(argv)
    }

    fn recover_after_reboot(&mut self) -> TestbedResult<()> {
        let timeout = self.opts.boot_timeout;
        let console = self
            .session_mut()?
            .console
            .as_mut()
            .ok_or_else(|| TestbedError::BootFailure("ttyS0 is not connected".to_string()))?;
        wait_login_prompt(console, timeout)?;
        self.set_state(VmState::LoginPromptSeen);
        thread::sleep(SETTLE_DELAY);
        self.bring_up()?;
        // The reboot wiped the guest's /tmp; recreate the scratch path.
        if let Some(scratch) = self.session_mut()?.scratch.clone() {
            self.run_guest_stdout(&["mkdir".to_string(), "-p".to_string(), scratch])?;
        }
        Ok(())
    }

    fn session_mut(&mut self) -> TestbedResult<&mut Session> {
        self.session
            .as_mut()
            .ok_or_else(|| TestbedError::Backend("vm is not running".to_string()))
    }

    fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.console = None;
            let pid = session.vm.id();
            if session.vm.try_wait().ok().flatten().is_none() {
                tracing::debug!(pid, "stopping vm");
                process::kill_group(&session.vm);
            }
            let _ = session.vm.wait();
            if let Err(err) = session.workdir.close() {
                tracing::warn!(error = %err, "remove vm work directory");
            }
        }
        self.set_state(VmState::Closed);
    }
}

impl Backend for QemuBackend {
    fn name(&self) -> &'static str {
        "qemu"
    }

    fn open(&mut self) -> TestbedResult<String> {
        if self.session.is_some() {
            return Err(TestbedError::Backend("vm already running".to_string()));
        }
        match self.boot() {
            Ok(scratch) => {
                tracing::info!(%scratch, "vm ready");
                Ok(scratch)
            }
            Err(err) => {
                tracing::error!(state = %self.state, error = %err, "vm setup failed");
                self.teardown();
                Err(err)
            }
        }
    }

    fn capabilities(&self) -> Vec<String> {
        let mut caps = vec![
            "revert".to_string(),
            "root-on-testbed".to_string(),
            "reboot".to_string(),
        ];
        if let Some(session) = &self.session {
            if let Some(user) = &session.suggested_user {
                caps.push(format!("suggested-normal-user={user}"));
            }
            if let Some(port) = session.port {
                caps.push(format!("forwarded-port={port}"));
            }
        }
        caps
    }

    fn execute_prefix(&self) -> Vec<String> {
        let Some(session) = &self.session else {
            return Vec::new();
        };
        vec![
            self.opts.shovel_program.display().to_string(),
            "shovel".to_string(),
            "--shared".to_string(),
            session.path("shared").display().to_string(),
            "--guest-shared".to_string(),
            GUEST_SHARED.to_string(),
            "--socket".to_string(),
            session.path("ttyS1").display().to_string(),
            "--".to_string(),
        ]
    }

    fn revert(&mut self) -> TestbedResult<String> {
        tracing::info!("reverting by rebooting a fresh overlay");
        self.teardown();
        self.open()
    }

    fn cleanup(&mut self) -> TestbedResult<()> {
        self.teardown();
        Ok(())
    }

    fn prepare_reboot(&mut self) -> TestbedResult<()> {
        if self.state != VmState::Ready {
            return Err(TestbedError::Backend(format!(
                "prepare-reboot in state {}",
                self.state
            )));
        }
        if self.opts.baseimage {
            let monitor_path = self.session_mut()?.path("monitor");
            let mut monitor = Monitor::connect(&monitor_path, SETUP_TIMEOUT)?;
            monitor.detach_baseimage()?;
        }
        self.set_state(VmState::Rebooting);
        Ok(())
    }

    fn wait_reboot(&mut self) -> TestbedResult<()> {
        if self.state != VmState::Rebooting {
            return Err(TestbedError::Backend(format!(
                "wait-reboot in state {}",
                self.state
            )));
        }
        let result = self.recover_after_reboot();
        if result.is_err() {
            self.teardown();
        }
        result
    }
}

impl Drop for QemuBackend {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn wait_login_prompt(console: &mut Console, timeout: Duration) -> TestbedResult<()> {
    let login = Regex::new(r"login:\s*").expect("regex for login prompt");
    match console.expect(&login, timeout) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(TestbedError::BootFailure(format!(
            "no login prompt on {} within {timeout:?}",
            console.name()
        ))),
        Err(TestbedError::ChannelLost(msg)) => Err(TestbedError::BootFailure(msg)),
        Err(err) => Err(err),
    }
}

/// Whether a shell on the ttyS1 socket answers an echo probe.
fn probe_shell(tty1: &Path) -> TestbedResult<bool> {
    let mut console = Console::connect(tty1, "ttyS1", PROBE_TIMEOUT)?;
    console.clear()?;
    // The expected text never appears in the command itself, so terminal
    // echo cannot produce a false match.
    console.send("echo reprocheck-$((40 + 2))\n")?;
    let ready = Regex::new("reprocheck-42").expect("regex for shell probe");
    Ok(console.expect(&ready, Duration::from_secs(3))?.is_some())
}

fn spawn_vm(argv: &[String], log: &Path) -> TestbedResult<Child> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| TestbedError::BootFailure("empty qemu command".to_string()))?;
    let log = std::fs::File::create(log)?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log)
        .process_group(0);
    // SAFETY: prctl is async-signal-safe and touches only the child.
    unsafe {
        cmd.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    cmd.spawn()
        .map_err(|err| TestbedError::BootFailure(format!("spawn {program}: {err}")))
}

fn kvm_available() -> bool {
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/kvm")
        .is_ok()
}

/// Zone name of the host, from /etc/timezone or the /etc/localtime link.
fn host_timezone() -> Option<String> {
    if let Ok(text) = std::fs::read_to_string("/etc/timezone") {
        let zone = text.trim();
        if valid_zone(zone) {
            return Some(zone.to_string());
        }
    }
    let target = std::fs::read_link("/etc/localtime").ok()?;
    let target = target.to_string_lossy();
    let (_, zone) = target.split_once("zoneinfo/")?;
    valid_zone(zone).then(|| zone.to_string())
}

fn valid_zone(zone: &str) -> bool {
    !zone.is_empty()
        && zone
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '/' | '_' | '-' | '+'))
}

/// First account with a regular-user UID in `getent passwd` output.
pub fn suggested_normal_user(passwd: &str) -> Option<String> {
    passwd.lines().find_map(|line| {
        let fields: Vec<&str> = line.split(':').collect();
        let uid: u32 = fields.get(2)?.parse().ok()?;
        (MIN_NORMAL_UID..MAX_NORMAL_UID)
            .contains(&uid)
            .then(|| fields[0].to_string())
    })
}

#[cfg(test)]
#[path = "qemu_tests.rs"]
mod tests;
