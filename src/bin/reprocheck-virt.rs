use anyhow::{Context, Result};
use clap::Parser;
use reprocheck::cli::{BackendCommand, QemuArgs, ShovelArgs, VirtArgs};
use reprocheck::error::{TestbedError, AUX_EXIT_BRIDGE_FAILURE, AUX_EXIT_TIMEOUT};
use reprocheck::logging;
use reprocheck::shovel::{self, SharedDir, UnixSocketChannel};
use reprocheck::virt::chroot::ChrootBackend;
use reprocheck::virt::null::NullBackend;
use reprocheck::virt::qemu::port::default_lock_dir;
use reprocheck::virt::qemu::{QemuBackend, QemuOptions};
use reprocheck::virt::{termination, Backend, Server, EXIT_UNEXPECTED};
use std::time::Duration;

fn main() {
    let args = VirtArgs::parse();
    logging::init(args.verbose);
    let code = match args.backend {
        BackendCommand::Null => serve(NullBackend::new()),
        BackendCommand::Chroot(chroot) => serve(ChrootBackend::new(chroot.root)),
        BackendCommand::Qemu(qemu) => match qemu_options(qemu) {
            Ok(opts) => serve(QemuBackend::new(opts)),
            Err(err) => {
                eprintln!("reprocheck-virt: {err:#}");
                EXIT_UNEXPECTED
            }
        },
        BackendCommand::Shovel(args) => shovel_main(&args),
    };
    std::process::exit(code);
}

fn serve<B: Backend>(backend: B) -> i32 {
    tracing::info!(backend = backend.name(), "serving testbed protocol");
    if let Err(err) = termination::install() {
        tracing::warn!(error = %err, "cannot route termination signals");
    }
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    Server::new(backend).run(stdin.lock(), stdout.lock())
}

fn qemu_options(args: QemuArgs) -> Result<QemuOptions> {
    let shovel_program = std::env::current_exe().context("locate reprocheck-virt")?;
    let image = std::fs::canonicalize(&args.image)
        .with_context(|| format!("image {}", args.image.display()))?;
    Ok(QemuOptions {
        image,
        extra_images: args.extra_images,
        user: args.user,
        password: args.password,
        ram_size_mib: args.ram_size,
        cpus: args.cpus,
        qemu_command: args.qemu_command,
        qemu_img_command: args.qemu_img_command,
        boot_timeout: Duration::from_secs(args.boot_timeout),
        port_base: args.port_base,
        baseimage: args.baseimage,
        port_lock_dir: default_lock_dir(),
        shovel_program,
    })
}

/// Execute prefix of the QEMU backend: run one command in the guest.
fn shovel_main(args: &ShovelArgs) -> i32 {
    match run_shovel(args) {
        Ok(status) => status,
        Err(TestbedError::ExecutionTimeout { .. }) => {
            eprintln!("reprocheck-virt shovel: command timed out after {}s", args.timeout);
            AUX_EXIT_TIMEOUT
        }
        Err(err) => {
            eprintln!("reprocheck-virt shovel: {err}");
            AUX_EXIT_BRIDGE_FAILURE
        }
    }
}

fn run_shovel(args: &ShovelArgs) -> Result<i32, TestbedError> {
    let stdin = std::io::stdin();
    shovel::set_nonblocking(&stdin)?;
    let mut channel = UnixSocketChannel::connect(&args.socket).map_err(|err| {
        TestbedError::ChannelLost(format!("connect {}: {err}", args.socket.display()))
    })?;
    let shared = SharedDir {
        host: args.shared.clone(),
        guest: args.guest_shared.clone(),
    };
    shovel::run(
        &mut channel,
        &shared,
        &args.command,
        stdin,
        std::io::stdout(),
        std::io::stderr(),
        Duration::from_secs(args.timeout),
    )
}
