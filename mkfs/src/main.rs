use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::error::ErrorKind;
use clap::Parser;

use vsfs::layout::{itable_blocks, BSIZE};
use vsfs::mkfs::{format, FormatOpts};
use vsfs::Image;

/// Format a pre-sized image file as an empty vsfs volume.
#[derive(Parser, Debug)]
#[command(name = "mkfs.vsfs")]
struct Args {
    /// Number of inodes the volume will hold
    #[arg(short = 'i', value_name = "N")]
    ninodes: u32,

    /// Overwrite an existing volume
    #[arg(short = 'f')]
    force: bool,

    /// Zero the whole image before formatting
    #[arg(short = 'z')]
    zero: bool,

    /// Path of the image file
    image: PathBuf,
}

fn main() -> ExitCode {
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
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("mkfs.vsfs: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let mut image = Image::map(&args.image)
        .with_context(|| format!("open image {}", args.image.display()))?;
    let nblocks = image.len() / BSIZE;

    format(
        image.as_mut_slice(),
        &FormatOpts {
            ninodes: args.ninodes,
            force: args.force,
            zero: args.zero,
        },
    )
    .with_context(|| format!("format {}", args.image.display()))?;

    let itable = itable_blocks(args.ninodes);
    println!(
        "{}: {} blocks (3 metadata, {} inode table, 1 root directory, {} data), {} inodes",
        args.image.display(),
        nblocks,
        itable,
        nblocks - 4 - itable as usize,
        args.ninodes
    );
    Ok(())
}
