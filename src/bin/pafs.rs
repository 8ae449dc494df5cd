//! CLI entry point: parses mount options and runs the passthrough session.
//!
//! Grounded in the teacher's `examples/common/args.rs` (`CommonArgs`) and
//! `examples/hello.rs`'s `main`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use fuser::MountOption;
use fuser::Session;
use log::error;
use pafs::config::Options;
use pafs::PassthroughFs;

#[derive(Parser, Debug)]
#[command(name = "pafs", about = "Mount a passthrough view of a source directory")]
struct Args {
    /// Directory to expose through the mount point.
    source: PathBuf,

    /// Where to mount the passthrough filesystem.
    mount_point: PathBuf,

    /// How long the kernel may cache directory entry lookups, in
    /// milliseconds.
    #[arg(long, default_value_t = 0)]
    entry_timeout_ms: u64,

    /// How long the kernel may cache inode attributes, in milliseconds.
    #[arg(long, default_value_t = 0)]
    attr_timeout_ms: u64,

    /// Automatically unmount when the process exits.
    #[arg(long)]
    auto_unmount: bool,

    /// Allow users other than the mount owner (including root) to access
    /// the filesystem.
    #[arg(long)]
    allow_root: bool,

    /// Allow any user to access the filesystem.
    #[arg(long)]
    allow_other: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let opts = Options {
        entry_timeout: Duration::from_millis(args.entry_timeout_ms),
        attr_timeout: Duration::from_millis(args.attr_timeout_ms),
    };

    let fs = match PassthroughFs::new(&args.source, opts) {
        Ok(fs) => fs,
        Err(err) => {
            error!("failed to open {}: {err}", args.source.display());
            return ExitCode::FAILURE;
        }
    };

    let mut mount_options = vec![MountOption::FSName("pafs".to_string())];
    if args.auto_unmount {
        mount_options.push(MountOption::AutoUnmount);
    }
    if args.allow_root {
        mount_options.push(MountOption::AllowRoot);
    }
    if args.allow_other {
        mount_options.push(MountOption::AllowOther);
    }

    let notifier_handle = fs.notifier_handle();

    let session = match Session::new(fs, &args.mount_point, &mount_options) {
        Ok(session) => session,
        Err(err) => {
            error!("failed to mount {}: {err}", args.mount_point.display());
            return ExitCode::FAILURE;
        }
    };

    *notifier_handle.lock() = Some(session.notifier());

    if let Err(err) = session.run() {
        error!("session ended with error: {err}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
