#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use famfs_core::{
    MapMode, ReplayMode, fill_seeded, fsck, kill_superblock, mkdir, mkfile, mkfs, mkmeta,
    open_log, replay_log, replay_shadow, verify_seeded,
};
use famfs_ioctl::DaxKernel;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "famfs", about = "famfs — shared-memory filesystem tooling")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a fresh famfs filesystem onto a DAX device.
    Mkfs {
        /// The DAX device (or raw image file).
        device: PathBuf,
        /// Re-format even if a famfs superblock is present.
        #[arg(long)]
        force: bool,
        /// Destroy the existing superblock instead of formatting.
        #[arg(long, conflicts_with = "force")]
        kill: bool,
    },
    /// Mount a famfs filesystem and create its meta files.
    Mount {
        device: PathBuf,
        mountpoint: PathBuf,
    },
    /// Create the .meta files for an already-mounted filesystem.
    Mkmeta {
        device: PathBuf,
    },
    /// Replay the log to rebuild the namespace.
    Logplay {
        /// Any path inside the mount.
        path: PathBuf,
        /// Validate the log without touching the filesystem.
        #[arg(long)]
        dry_run: bool,
        /// Replay the namespace shape into an ordinary directory.
        #[arg(long, value_name = "DIR", conflicts_with = "dry_run")]
        shadow: Option<PathBuf>,
    },
    /// Check a filesystem: superblock, log, and allocation bitmap.
    Fsck {
        /// An unmounted device/image, or any path inside a mount.
        path: PathBuf,
        /// Also dump geometry details.
        #[arg(long)]
        verbose: bool,
        /// Emit the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Create (and allocate) a file.
    Creat {
        path: PathBuf,
        /// File size in bytes.
        #[arg(short, long)]
        size: u64,
        /// Fill the file from this seed after creation.
        #[arg(short = 'S', long)]
        seed: Option<u64>,
        /// File mode, octal.
        #[arg(short, long, default_value = "644", value_parser = parse_octal)]
        mode: u32,
        #[arg(short, long, default_value_t = 0)]
        uid: u32,
        #[arg(short, long, default_value_t = 0)]
        gid: u32,
    },
    /// Copy a file into a famfs filesystem.
    Cp {
        src: PathBuf,
        dst: PathBuf,
    },
    /// Verify a file against its creation seed.
    Verify {
        path: PathBuf,
        #[arg(short = 'S', long)]
        seed: u64,
    },
    /// Create a directory.
    Mkdir {
        path: PathBuf,
        /// Directory mode, octal.
        #[arg(short, long, default_value = "755", value_parser = parse_octal)]
        mode: u32,
        #[arg(short, long, default_value_t = 0)]
        uid: u32,
        #[arg(short, long, default_value_t = 0)]
        gid: u32,
    },
}

fn parse_octal(value: &str) -> Result<u32, String> {
    let digits = value.strip_prefix("0o").unwrap_or(value);
    u32::from_str_radix(digits, 8).map_err(|_| format!("not an octal mode: {value}"))
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    match run(cli.command) {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            eprintln!("error: {error:#}");
            std::process::exit(1);
        }
    }
}

fn run(command: Command) -> Result<i32> {
    match command {
        Command::Mkfs { device, force, kill } => {
            if kill {
                kill_superblock(&device)?;
                println!("superblock destroyed on {}", device.display());
                return Ok(0);
            }
            let sb = mkfs(&device, force)
                .with_context(|| format!("mkfs on {}", device.display()))?;
            println!(
                "created famfs on {} ({} bytes, log capacity {} bytes)",
                device.display(),
                sb.primary().size,
                sb.log_len
            );
            Ok(0)
        }
        Command::Mount { device, mountpoint } => {
            famfs_ioctl::mount_famfs(&device, &mountpoint)
                .with_context(|| format!("mount {} at {}", device.display(), mountpoint.display()))?;
            let mount = mkmeta(&device, &DaxKernel)?;
            println!("mounted {} at {}", device.display(), mount.display());
            Ok(0)
        }
        Command::Mkmeta { device } => {
            let mount = mkmeta(&device, &DaxKernel)?;
            println!("meta files ready under {}", mount.display());
            Ok(0)
        }
        Command::Logplay {
            path,
            dry_run,
            shadow,
        } => {
            let meta = open_log(&path, false)?;
            let map = famfs_core::FileMap::of_file(&meta.file, MapMode::ReadOnly)?;

            let stats = match shadow {
                Some(dir) => replay_shadow(map.bytes(), &dir)?,
                None => {
                    let mode = if dry_run {
                        ReplayMode::DryRun
                    } else {
                        ReplayMode::Commit
                    };
                    replay_log(map.bytes(), &meta.mount, &DaxKernel, mode)?
                }
            };
            println!(
                "processed {} entries: {} files, {} dirs, {} already present, {} invalid, {} errors",
                stats.processed,
                stats.files_created,
                stats.dirs_created,
                stats.already_present,
                stats.invalid_entries,
                stats.errors
            );
            Ok(if stats.errors > 0 { 1 } else { 0 })
        }
        Command::Fsck {
            path,
            verbose,
            json,
        } => {
            let report = fsck(&path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_fsck_report(&report, verbose);
            }
            Ok(i32::try_from(report.alloc_errors().min(255)).expect("clamped"))
        }
        Command::Creat {
            path,
            size,
            seed,
            mode,
            uid,
            gid,
        } => {
            mkfile(&path, size, mode, uid, gid, &DaxKernel)
                .with_context(|| format!("creat {}", path.display()))?;
            if let Some(seed) = seed {
                fill_seeded(&path, seed)?;
            }
            println!("created {} ({size} bytes)", path.display());
            Ok(0)
        }
        Command::Cp { src, dst } => {
            let bytes = cp_files(&src, &dst)?;
            println!("copied {bytes} bytes to {}", dst.display());
            Ok(0)
        }
        Command::Verify { path, seed } => {
            let mismatches = verify_seeded(&path, seed)?;
            if mismatches == 0 {
                println!("{}: verified against seed {seed}", path.display());
                Ok(0)
            } else {
                println!(
                    "{}: {mismatches} mismatched words against seed {seed}",
                    path.display()
                );
                Ok(1)
            }
        }
        Command::Mkdir {
            path,
            mode,
            uid,
            gid,
        } => {
            mkdir(&path, mode, uid, gid)
                .with_context(|| format!("mkdir {}", path.display()))?;
            println!("created directory {}", path.display());
            Ok(0)
        }
    }
}

fn cp_files(src: &std::path::Path, dst: &std::path::Path) -> Result<u64> {
    famfs_core::cp(src, dst, &DaxKernel)
        .with_context(|| format!("cp {} -> {}", src.display(), dst.display()))
}

fn print_fsck_report(report: &famfs_core::FsckReport, verbose: bool) {
    let sb = &report.superblock;
    println!("famfs superblock:");
    println!("  UUID:        {}", report.uuid_string());
    println!("  version:     {}", sb.version);
    println!("  daxdevs:     {}", sb.devices.len());
    for (i, dev) in sb.devices.iter().enumerate() {
        let tag = if i == 0 { "primary" } else { "        " };
        println!("  {tag}: {}   {}", dev.path, dev.size);
    }

    println!();
    println!("log:");
    println!(
        "  entries in use: {} of {}",
        report.log.entries_in_use, report.log.capacity
    );
    println!("  bytes in use:   {}", report.log.bytes_in_use);

    println!();
    if report.bitmap.alloc_errors > 0 {
        println!(
            "ERROR: {} allocation collisions found",
            report.bitmap.alloc_errors
        );
    } else {
        println!("no allocation errors found");
        match report.bitmap.space_amplification() {
            Some(amp) => println!(
                "  alloc_total={} size_total={} space_amplification={amp:.2}",
                report.bitmap.alloc_total, report.bitmap.size_total
            ),
            None => println!("  no files logged"),
        }
    }

    if verbose {
        println!();
        println!("geometry:");
        println!("  log_offset:  {}", sb.log_offset);
        println!("  log_len:     {}", sb.log_len);
        println!("  bitmap bits: {}", report.bitmap.bitmap_bits);
        println!("  next seqnum: {}", report.log.next_seqnum);
        println!("  invalid log entries: {}", report.bitmap.invalid_entries);
    }
}
