//! Write command - flashes an image onto a drive or image file
//!
//! Defaults come from the configuration file; command line flags override
//! them. The run itself is clean, flash, then optional verify.

use anyhow::{bail, Context, Result};
use console::style;
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flashkit_core::{
    parse_size, ChecksumAlgorithm, DeviceOpener, Error as FlashError, FlashConfig, FlashEvent,
    FlashOutcome, FlashSource, FlashState, Flasher, NoopCleaner, Settings,
};
use flashkit_platform::{has_elevated_privileges, OpenOptions};

use super::{human_size, println_if};

/// Arguments for the write command
pub struct WriteArgs {
    pub source: PathBuf,
    pub target: String,
    /// `None` keeps the configured default
    pub verify: Option<bool>,
    pub skip_confirm: bool,
    pub block_size: Option<String>,
    pub checksum: Option<String>,
    pub max_run: Option<String>,
    pub no_clean: bool,
    pub file: bool,
    pub silent: bool,
    pub config_file: Option<PathBuf>,
}

/// Execute the write command
pub fn execute(args: WriteArgs) -> Result<()> {
    let silent = args.silent;
    let settings =
        Settings::load_from_path(args.config_file.clone().or_else(Settings::config_path));
    let config = resolve_config(&args, &settings)?;

    if !args.file && !has_elevated_privileges() {
        #[cfg(unix)]
        bail!(
            "Root privileges required.\n\
             Try running with: sudo flashkit write ...\n\
             Use --file to write into a regular image file."
        );

        #[cfg(windows)]
        bail!(
            "Administrator privileges required.\n\
             Right-click and select 'Run as administrator'."
        );

        #[cfg(not(any(unix, windows)))]
        bail!("Elevated privileges required for raw device access.");
    }

    // Step 1: Open source
    println_if!(
        silent,
        "{} {}",
        style("Source:").bold(),
        style(args.source.display()).cyan()
    );

    let source = FlashSource::open(&args.source)
        .with_context(|| format!("Failed to open source: {}", args.source.display()))?;

    if source.compression.is_compressed() {
        println_if!(
            silent,
            "  {} {} {}, ~{} uncompressed",
            style("✓").green(),
            human_size(source.size.original),
            source.compression,
            human_size(source.size.final_size)
        );
    } else {
        println_if!(
            silent,
            "  {} {}",
            style("✓").green(),
            human_size(source.size.final_size)
        );
    }

    println_if!(
        silent,
        "{} {}",
        style("Target:").bold(),
        style(&args.target).cyan()
    );
    println_if!(
        silent,
        "  block size {}, verify {}",
        human_size(config.block_size as u64),
        if config.verify {
            config.checksum_algorithm.name()
        } else {
            "off"
        }
    );

    // Step 2: Confirmation (skip_confirm is already true when silent)
    if !args.skip_confirm && !settings.behavior.skip_confirmation {
        println!();
        println!(
            "{}",
            style("ALL DATA ON THE TARGET WILL BE PERMANENTLY LOST!")
                .red()
                .bold()
        );
        println!();

        let name = args
            .source
            .file_name()
            .map_or_else(|| args.source.display().to_string(), |n| n.to_string_lossy().into_owned());

        let proceed = Confirm::new()
            .with_prompt(format!("Write {} to {}?", name, args.target))
            .default(false)
            .interact()?;

        if !proceed {
            println!("{}", style("Aborted.").yellow());
            return Ok(());
        }
    }

    // Step 3: Flash
    println_if!(silent, "\n{}", style("Writing image...").bold());

    let opener = Arc::new(target_opener(&args.target, &config, args.file));
    let pb = create_progress_bar(silent);
    let pb_events = pb.clone();

    let mut flasher =
        Flasher::with_config(config).on_event(move |event| handle_event(&pb_events, event));
    if args.file || args.no_clean {
        flasher = flasher.cleaner(NoopCleaner);
    }
    watch_interrupts(flasher.cancel_handle(), silent)?;

    let result = flasher.run(source, opener);
    pb.finish_and_clear();

    match result {
        Ok(outcome) => {
            print_summary(&outcome, silent);
            Ok(())
        }
        Err(FlashError::Cancelled) => bail!("Write cancelled; the target is incomplete"),
        Err(e) => Err(e).with_context(|| format!("Failed to write {}", args.target)),
    }
}

/// Opener for the target, aligned to the configured block size
///
/// Direct I/O on a block device only accepts writes at multiples of the
/// alignment it was opened with, so it has to match the blocks we write.
fn target_opener(target: &str, config: &FlashConfig, file: bool) -> DeviceOpener {
    DeviceOpener::new(target).options(
        OpenOptions::new()
            .block_size(config.block_size)
            .create(file),
    )
}

/// Merge settings and command line flags into a runtime config
fn resolve_config(args: &WriteArgs, settings: &Settings) -> Result<FlashConfig> {
    let mut config = settings
        .flash
        .to_config()
        .context("Invalid [flash] settings in configuration file")?;

    if let Some(block_size) = &args.block_size {
        let size = parse_size(block_size)
            .with_context(|| format!("Invalid block size: {}", block_size))?;
        config = config.block_size(size);
    }
    if let Some(verify) = args.verify {
        config = config.verify(verify);
    }
    if let Some(name) = &args.checksum {
        let algorithm: ChecksumAlgorithm = name
            .parse()
            .with_context(|| format!("Invalid checksum algorithm: {}", name))?;
        config = config.checksum_algorithm(algorithm);
    }
    if let Some(max_run) = &args.max_run {
        let bytes =
            parse_size(max_run).with_context(|| format!("Invalid run size: {}", max_run))?;
        config = config.max_run_bytes(bytes);
    }

    config.validate().context("Invalid write options")?;
    Ok(config)
}

/// Cancel the run on the first Ctrl+C, exit on the second
fn watch_interrupts(cancel: Arc<AtomicBool>, silent: bool) -> Result<()> {
    let interrupted = AtomicBool::new(false);
    ctrlc::set_handler(move || {
        if interrupted.swap(true, Ordering::SeqCst) {
            if !silent {
                eprintln!("\n{}", style("Forced exit").red().bold());
            }
            std::process::exit(130);
        }
        cancel.store(true, Ordering::SeqCst);
        if !silent {
            eprintln!(
                "\n{}",
                style("Cancelling... Press Ctrl+C again to force exit").yellow()
            );
        }
    })
    .context("Failed to install Ctrl+C handler")
}

fn handle_event(pb: &ProgressBar, event: &FlashEvent) {
    match event {
        FlashEvent::StageEntered(FlashState::Clean) => pb.set_prefix("Cleaning"),
        FlashEvent::StageEntered(FlashState::Flash) => {
            pb.set_prefix("Writing");
            pb.set_position(0);
        }
        FlashEvent::StageEntered(FlashState::Verify) => {
            pb.set_prefix("Verifying");
            pb.set_position(0);
        }
        FlashEvent::Progress(sample) => {
            pb.set_length(sample.length);
            pb.set_position(sample.transferred);
            pb.set_message(format!(
                "{}, ETA: {}",
                sample.speed_display(),
                sample.eta_display()
            ));
        }
        FlashEvent::Checksum(checksum) => {
            tracing::debug!("Source {} checksum: {}", checksum.algorithm, checksum);
        }
        _ => {}
    }
}

fn print_summary(outcome: &FlashOutcome, silent: bool) {
    let secs = outcome.elapsed.as_secs_f64();
    let speed = if secs > 0.0 {
        (outcome.writer.bytes_written as f64 / secs) as u64
    } else {
        0
    };

    println_if!(
        silent,
        "  {} Wrote {} in {:.1}s ({}/s, {} write calls)",
        style("✓").green(),
        human_size(outcome.writer.bytes_written),
        secs,
        human_size(speed),
        outcome.writer.write_calls
    );

    if let Some(checksum) = &outcome.source_checksum {
        println_if!(
            silent,
            "  {} Verified {} ({} {})",
            style("✓").green(),
            human_size(outcome.bytes_hashed),
            checksum.algorithm,
            checksum
        );
    }

    println_if!(silent, "\n{}", style("Done.").green().bold());
}

/// Create the progress bar shared by the write and verify phases
fn create_progress_bar(silent: bool) -> ProgressBar {
    if silent {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(0);
    let style = ProgressStyle::default_bar()
        .template(
            "  {spinner:.green} {prefix:<9} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓░");
    pb.set_style(style);
    pb
}
