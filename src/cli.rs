//! CLI argument parsing for both binaries.
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// Two-pass reproducibility check.
#[derive(Parser, Debug)]
#[command(
    name = "reprocheck",
    version,
    about = "Build a source tree twice under varied conditions and compare the artifacts",
    after_help = "Exit status:\n  0  artifacts are identical\n  1  artifacts differ (not reproducible)\n  2  usage or configuration error\n  3  build failed or produced no matching artifact\n  4  testbed failure\n  5  diff tool failure\n\nExamples:\n  reprocheck . 'make' 'out/*.tar' -- null\n  reprocheck --variations time,timezone . 'make' hello -- qemu /srv/vm.img\n  reprocheck --dont-vary user_group,domain_host . 'make' hello -- chroot /srv/chroot"
)]
pub struct CheckArgs {
    /// Source tree to build
    #[arg(value_name = "SOURCE_ROOT")]
    pub source_root: Option<PathBuf>,

    /// Build command, run with `sh -ec` inside the testbed
    #[arg(value_name = "BUILD_COMMAND")]
    pub build_command: Option<String>,

    /// Shell glob of the artifacts, relative to the build directory
    #[arg(value_name = "ARTIFACT")]
    pub artifact: Option<String>,

    /// Testbed backend and its arguments (default: null)
    #[arg(last = true, value_name = "TESTBED")]
    pub testbed: Vec<String>,

    /// Config file (default: <SOURCE_ROOT>/.reprocheck.toml if present)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Only apply these variations (comma separated)
    #[arg(long, value_name = "NAMES", value_delimiter = ',', conflicts_with = "dont_vary")]
    pub variations: Option<Vec<String>>,

    /// Apply every variation except these (comma separated)
    #[arg(long, value_name = "NAMES", value_delimiter = ',')]
    pub dont_vary: Option<Vec<String>>,

    /// Keep copied artifacts here instead of a temporary directory
    #[arg(long, value_name = "DIR")]
    pub store_dir: Option<PathBuf>,

    /// Diff tool command line (default: diffoscope, else diff -r)
    #[arg(long, value_name = "CMD")]
    pub diff_tool: Option<String>,

    /// Backend server program (default: reprocheck-virt next to this binary)
    #[arg(long, value_name = "PATH")]
    pub virt_program: Option<PathBuf>,

    /// Timeout for each build command, in seconds
    #[arg(long, value_name = "SECS")]
    pub build_timeout: Option<u64>,

    /// Emit a machine-readable JSON report on stdout
    #[arg(long)]
    pub json: bool,

    /// Print the available variations and exit
    #[arg(long)]
    pub list_variations: bool,

    /// More logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

/// Testbed backend server speaking the control protocol on stdin/stdout.
#[derive(Parser, Debug)]
#[command(
    name = "reprocheck-virt",
    version,
    about = "Testbed backend server for reprocheck",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct VirtArgs {
    /// More logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub backend: BackendCommand,
}

#[derive(Subcommand, Debug)]
pub enum BackendCommand {
    /// Run commands directly on the host
    Null,
    /// Run commands under chroot(8)
    Chroot(ChrootArgs),
    /// Boot a QEMU virtual machine from a disk image
    Qemu(QemuArgs),
    /// Run one command through a VM's serial shell (used as execute prefix)
    #[command(hide = true)]
    Shovel(ShovelArgs),
}

#[derive(Parser, Debug)]
pub struct ChrootArgs {
    /// Root of the chroot tree
    #[arg(value_name = "DIR")]
    pub root: PathBuf,
}

#[derive(Parser, Debug)]
pub struct QemuArgs {
    /// User to log in as on the serial console (default: root)
    #[arg(short, long)]
    pub user: Option<String>,

    /// Password for --user
    #[arg(short, long)]
    pub password: Option<String>,

    /// Guest memory in MiB
    #[arg(long, default_value_t = 1024)]
    pub ram_size: u32,

    /// Guest CPUs
    #[arg(long, default_value_t = 1)]
    pub cpus: u32,

    /// QEMU system emulator (default: qemu-system-<host arch>)
    #[arg(long, value_name = "PROGRAM")]
    pub qemu_command: Option<String>,

    /// qemu-img program
    #[arg(long, value_name = "PROGRAM", default_value = "qemu-img")]
    pub qemu_img_command: String,

    /// Seconds to wait for the login prompt
    #[arg(long, value_name = "SECS", default_value_t = 300)]
    pub boot_timeout: u64,

    /// First host port to try forwarding to the guest's ssh port
    #[arg(long, value_name = "PORT", default_value_t = 10022)]
    pub port_base: u16,

    /// Hot-attach the base image read-only (serial BOOTIMAGE)
    #[arg(long)]
    pub baseimage: bool,

    /// Disk image to boot; never modified
    #[arg(value_name = "IMAGE")]
    pub image: PathBuf,

    /// Extra disk images, attached read-only
    #[arg(value_name = "EXTRA")]
    pub extra_images: Vec<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct ShovelArgs {
    /// Host side of the shared directory
    #[arg(long, value_name = "DIR")]
    pub shared: PathBuf,

    /// Guest mount point of the shared directory
    #[arg(long, value_name = "DIR")]
    pub guest_shared: String,

    /// Unix socket of the serial console running the shell
    #[arg(long, value_name = "PATH")]
    pub socket: PathBuf,

    /// Give up after this many seconds
    #[arg(long, value_name = "SECS", default_value_t = 100_000)]
    pub timeout: u64,

    /// Command to run
    #[arg(last = true, required = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn definitions_are_consistent() {
        CheckArgs::command().debug_assert();
        VirtArgs::command().debug_assert();
    }

    #[test]
    fn testbed_arguments_follow_double_dash() {
        let args = CheckArgs::try_parse_from([
            "reprocheck",
            "--variations",
            "time,timezone",
            ".",
            "make",
            "out.txt",
            "--",
            "qemu",
            "--user",
            "build",
            "/srv/vm.img",
        ])
        .expect("parse");
        assert_eq!(args.variations, Some(vec!["time".to_string(), "timezone".to_string()]));
        assert_eq!(args.testbed, vec!["qemu", "--user", "build", "/srv/vm.img"]);
    }

    #[test]
    fn variations_and_dont_vary_conflict() {
        let result = CheckArgs::try_parse_from([
            "reprocheck",
            "--variations",
            "time",
            "--dont-vary",
            "home",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn qemu_takes_image_and_extras() {
        let args = VirtArgs::try_parse_from([
            "reprocheck-virt",
            "qemu",
            "--ram-size",
            "2048",
            "/srv/vm.img",
            "/srv/extra.img",
        ])
        .expect("parse");
        let BackendCommand::Qemu(qemu) = args.backend else {
            panic!("expected qemu");
        };
        assert_eq!(qemu.ram_size, 2048);
        assert_eq!(qemu.extra_images, vec![PathBuf::from("/srv/extra.img")]);
    }
}
