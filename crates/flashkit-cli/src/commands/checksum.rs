//! Checksum command - calculates checksum of an image

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use flashkit_core::{
    digest_reader, Block, Checksum, ChecksumAlgorithm, ChecksumStage, FlashSource, Pipeline,
    Settings,
};

use super::{human_size, println_if};

/// Arguments for the checksum command
pub struct ChecksumArgs {
    pub source: PathBuf,
    /// `None` uses the configured algorithm
    pub algorithm: Option<String>,
    pub decompress: bool,
    pub silent: bool,
    pub config_file: Option<PathBuf>,
}

/// Execute the checksum command
pub fn execute(args: ChecksumArgs) -> Result<()> {
    let silent = args.silent;
    let name = match &args.algorithm {
        Some(name) => name.clone(),
        None => {
            Settings::load_from_path(args.config_file.clone().or_else(Settings::config_path))
                .flash
                .checksum
        }
    };
    let algo: ChecksumAlgorithm = name
        .parse()
        .with_context(|| format!("Invalid algorithm: {}", name))?;

    println_if!(
        silent,
        "{} {}",
        style("Source:").bold(),
        style(args.source.display()).cyan()
    );

    let size = std::fs::metadata(&args.source)
        .with_context(|| format!("Failed to open source: {}", args.source.display()))?
        .len();
    println_if!(silent, "  Size: {}", human_size(size));

    println_if!(
        silent,
        "\n{} {} checksum...",
        style("Calculating").bold(),
        algo.name()
    );

    let pb = create_progress_bar(size, silent);
    let checksum = if args.decompress {
        decompressed_checksum(&args.source, algo, &pb)?
    } else {
        let file = File::open(&args.source)
            .with_context(|| format!("Failed to open source: {}", args.source.display()))?;
        let mut reader = pb.wrap_read(file);
        digest_reader(&mut reader, algo, None)
            .context("Failed to calculate checksum")?
            .0
    };
    pb.finish_and_clear();

    // The digest is the useful output, so it is printed even when silent
    if silent {
        println!("{}", checksum.to_hex());
    } else {
        let display = args.source.display().to_string();
        let file_name = args
            .source
            .file_name()
            .map_or(display.clone(), |n| n.to_string_lossy().into_owned());

        println!();
        println!("{} ({}):", style(algo.name()).green().bold(), display);
        println!("{}", checksum.to_hex());

        println!();
        println!("{}:", style("Checksum file format").dim());
        println!("{}  {}", checksum.to_hex(), file_name);
    }

    Ok(())
}

/// Hash what would be written: the source after decompression
fn decompressed_checksum(
    path: &Path,
    algo: ChecksumAlgorithm,
    pb: &ProgressBar,
) -> Result<Checksum> {
    let mut source = FlashSource::open(path)
        .with_context(|| format!("Failed to open source: {}", path.display()))?;

    let (stage, slot) = ChecksumStage::new(algo);
    let mut pipeline = Pipeline::new();
    if let Some(transform) = source.transform.take() {
        pipeline.append(transform);
    }
    pipeline.append(Box::new(stage));

    let mut discard = |_: Block| -> flashkit_core::Result<()> { Ok(()) };
    let mut reader = pb.wrap_read(source.reader);
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buffer).context("Failed to read source")?;
        if n == 0 {
            break;
        }
        pipeline
            .push(Block::raw(buffer[..n].to_vec()), &mut discard)
            .context("Failed to decode source")?;
    }
    pipeline
        .finish(&mut discard)
        .context("Failed to decode source")?;

    let digest = slot.take().context("No checksum was produced")?;
    Ok(digest.checksum)
}

fn create_progress_bar(size: u64, silent: bool) -> ProgressBar {
    if silent {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(size);
    let style = ProgressStyle::default_bar()
        .template("  {spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓░");
    pb.set_style(style);
    pb
}
