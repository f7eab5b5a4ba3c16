//! `mount.rlfs`: the FUSE front-end binary. Parses mount options, opens the
//! image through `Lfs::mount` (which runs recovery and spawns the
//! cleaner), and hands the result to `fuser::mount2`.
//!
//! Grounded on `fuse-ufs`'s `src/bin/fuser/main.rs`: a `clap`-derived
//! argument struct mapping 1:1 onto `fuser::MountOption`s, `env_logger`
//! initialized from `RUST_LOG` before anything else runs, and the real
//! engine constructed before the kernel ever sees the mountpoint.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use fuser::MountOption;

use rlfs::adapter::LfsAdapter;
use rlfs::fs::MountOptions;
use rlfs::Lfs;

/// Mounts an rlfs image at a directory via FUSE.
#[derive(Parser)]
#[command(name = "mount.rlfs", about = "Mount an rlfs image through FUSE")]
struct Args {
    /// Path to the rlfs image file.
    image: PathBuf,

    /// Directory to mount the file system at.
    mountpoint: PathBuf,

    /// Allow other users to access the mount.
    #[arg(long)]
    allow_other: bool,

    /// Automatically unmount when the mounting process exits.
    #[arg(long)]
    auto_unmount: bool,

    /// Number of blocks held by the buffer cache.
    #[arg(long)]
    buffer_cache_capacity: Option<usize>,

    /// Number of in-memory inodes held by the inode cache.
    #[arg(long)]
    inode_cache_capacity: Option<usize>,

    /// Write-count checkpoint trigger.
    #[arg(long)]
    checkpoint_write_trigger: Option<u32>,

    /// Time-based checkpoint trigger, in seconds.
    #[arg(long)]
    checkpoint_interval_secs: Option<u64>,
}

fn run(args: Args) -> rlfs::Result<()> {
    let mut opts = MountOptions::default();
    if let Some(v) = args.buffer_cache_capacity {
        opts.buffer_cache_capacity = v;
    }
    if let Some(v) = args.inode_cache_capacity {
        opts.inode_cache_capacity = v;
    }
    if let Some(v) = args.checkpoint_write_trigger {
        opts.checkpoint_write_trigger = v;
    }
    if let Some(v) = args.checkpoint_interval_secs {
        opts.checkpoint_interval_secs = v;
    }

    let lfs = Lfs::mount(&args.image, opts)?;

    let mut mount_options = vec![MountOption::FSName("rlfs".to_string()), MountOption::DefaultPermissions];
    if args.allow_other {
        mount_options.push(MountOption::AllowOther);
    }
    if args.auto_unmount {
        mount_options.push(MountOption::AutoUnmount);
    }

    log::info!("mounting {} at {}", args.image.display(), args.mountpoint.display());
    fuser::mount2(LfsAdapter::new(lfs), &args.mountpoint, &mount_options)?;
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("mount.rlfs: {e}");
            ExitCode::FAILURE
        }
    }
}
