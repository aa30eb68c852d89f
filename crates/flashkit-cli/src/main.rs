//! Flashkit - write disk images to USB drives, SD cards and image files
//!
//! # Usage
//!
//! ```bash
//! # Write an image to a USB drive
//! flashkit write ubuntu.img /dev/sdb
//!
//! # Write a compressed image and verify it
//! flashkit write raspios.img.xz /dev/mmcblk0 --verify
//!
//! # Write into a regular image file
//! flashkit write disk.img.gz copy.img --file
//! ```

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use console::style;
use flashkit_core::Settings;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

/// Flashkit - write disk images to USB drives, SD cards and image files
#[derive(Parser)]
#[command(name = "flashkit")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Suppress ALL output (implies --quiet and --yes)
    #[arg(long, global = true)]
    silent: bool,

    /// Use this configuration file instead of the default location
    #[arg(long, global = true, env = "FLASHKIT_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an image to a drive or image file
    Write {
        /// Source image (raw, .gz, .xz, .zst or .bz2)
        source: PathBuf,

        /// Target device (e.g., /dev/sdb, /dev/disk2, \\.\PhysicalDrive1)
        target: String,

        /// Verify the write by reading it back and comparing checksums
        #[arg(long, conflicts_with = "no_verify")]
        verify: bool,

        /// Skip verification even if enabled in the configuration
        #[arg(long)]
        no_verify: bool,

        /// Skip confirmation prompt (use with caution!)
        #[arg(short = 'y', long)]
        yes: bool,

        /// Block size for writing (e.g., 4K, 1M)
        #[arg(short, long)]
        block_size: Option<String>,

        /// Checksum algorithm used for verification (crc32, md5, sha256, sha512)
        #[arg(long, value_name = "ALGORITHM")]
        checksum: Option<String>,

        /// Largest single coalesced write (e.g., 128K)
        #[arg(long, value_name = "SIZE")]
        max_run: Option<String>,

        /// Do not wipe partition metadata before writing
        #[arg(long)]
        no_clean: bool,

        /// Target is a regular image file (created if missing)
        #[arg(long)]
        file: bool,
    },

    /// Calculate checksum of an image
    Checksum {
        /// Source image
        source: PathBuf,

        /// Checksum algorithm (crc32, md5, sha256, sha512)
        #[arg(short, long)]
        algorithm: Option<String>,

        /// Hash the decompressed contents instead of the file itself
        #[arg(short, long)]
        decompress: bool,
    },

    /// Show or initialize the configuration file
    Config {
        /// Create a configuration file with default values
        #[arg(long, conflicts_with = "path")]
        init: bool,

        /// Print the configuration file path
        #[arg(long)]
        path: bool,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("{} {}", style("Error:").red().bold(), panic_info);
    }));

    if let Err(e) = run() {
        eprintln!("{} {}", style("Error:").red().bold(), e);

        if std::env::var("RUST_BACKTRACE").is_ok() {
            let mut source = e.source();
            while let Some(cause) = source {
                eprintln!("  {} {}", style("Caused by:").yellow(), cause);
                source = cause.source();
            }
        }

        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    // Only the behavior section matters before logging is up
    let quiet = cli.quiet
        || Settings::load_from_path(cli.config.clone().or_else(Settings::config_path))
            .behavior
            .quiet;

    // --silent implies --quiet (no logs at all)
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else if quiet || cli.silent {
        EnvFilter::new("off")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    let silent = cli.silent;

    match cli.command {
        Commands::Write {
            source,
            target,
            verify,
            no_verify,
            yes,
            block_size,
            checksum,
            max_run,
            no_clean,
            file,
        } => commands::write::execute(commands::write::WriteArgs {
            source,
            target,
            verify: match (verify, no_verify) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            },
            skip_confirm: yes || silent,
            block_size,
            checksum,
            max_run,
            no_clean,
            file,
            silent,
            config_file: cli.config,
        }),
        Commands::Checksum {
            source,
            algorithm,
            decompress,
        } => commands::checksum::execute(commands::checksum::ChecksumArgs {
            source,
            algorithm,
            decompress,
            silent,
            config_file: cli.config,
        }),
        Commands::Config { init, path, json } => {
            commands::config::execute(commands::config::ConfigArgs {
                init,
                path,
                json,
                silent,
                config_file: cli.config,
            })
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut std::io::stdout());
            Ok(())
        }
    }
}
