use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::error::ErrorKind;
use clap::Parser;
use fuser::MountOption;

use vsfs::fuse::VsfsFuse;
use vsfs::Vsfs;

/// Mount a vsfs image.
#[derive(Parser, Debug)]
#[command(name = "vsfs")]
struct Args {
    /// Path of the file system image
    image: PathBuf,

    /// Where to mount the volume
    mountpoint: PathBuf,

    /// Ask the kernel to unmount when the driver exits
    #[arg(long)]
    auto_unmount: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if e.kind() == ErrorKind::DisplayHelp || e.kind() == ErrorKind::DisplayVersion => {
            e.print().expect("write help");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            e.print().expect("write usage error");
            return ExitCode::FAILURE;
        }
    };
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("vsfs: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let fs = Vsfs::open(&args.image)
        .with_context(|| format!("mount image {}", args.image.display()))?;

    let mut options = vec![MountOption::FSName("vsfs".into())];
    if args.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }
    fuser::mount2(VsfsFuse::new(fs), &args.mountpoint, &options)
        .with_context(|| format!("mount at {}", args.mountpoint.display()))?;
    Ok(())
}
