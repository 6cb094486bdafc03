use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use fmh_core::fwinfo::{parse_fields, resolve_build_number};
use fmh_core::{BuildConfig, FsSource, ImageAssembler, ImageListing, ImageScanner, ReleaseOverrides};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Flash Module Header image tool", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pack the sections of a build configuration into a flash image
    Build {
        /// Build configuration (TOML)
        #[arg(short, long, default_value = "genimage.toml")]
        config: PathBuf,

        /// Directory holding the section payload files
        #[arg(short, long, default_value = ".")]
        input: PathBuf,

        /// Output directory (overrides `out_dir` from the configuration)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List the sections of a flash image and extract them
    Dump {
        /// Flash image to read
        #[arg(short, long)]
        input: PathBuf,

        /// Directory to create for the listing and payloads
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Block size in KiB (units of 1024 bytes, not 4 KiB pages)
        #[arg(short, long, default_value_t = 64)]
        block: u32,

        /// Print a one-line summary per section instead of extracting
        #[arg(short, long)]
        summary: bool,

        /// Hex offset of the block holding the outermost header
        #[arg(short = 'f', long)]
        fmh_offset: Option<String>,
    },
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let result = match args.command {
        Command::Build {
            config,
            input,
            output,
        } => build(&config, &input, output.as_deref()),
        Command::Dump {
            input,
            output,
            block,
            summary,
            fmh_offset,
        } => dump(&input, output.as_deref(), block, summary, fmh_offset.as_deref()),
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn build(config_path: &Path, input: &Path, output: Option<&Path>) -> Result<()> {
    let config = BuildConfig::load_from_file(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    let out_dir = output
        .map(Path::to_path_buf)
        .or_else(|| config.global.out_dir.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));
    if config.global.output.is_empty() {
        bail!("No output file named in [global]");
    }
    let image_path = out_dir.join(&config.global.output);

    let build_no = resolve_build_number(config.global.build_no, Some(out_dir.as_path()));
    info!(
        config = %config_path.display(),
        image = %image_path.display(),
        build_no,
        "Building flash image"
    );

    let assembler = ImageAssembler::new(config, FsSource::new(input))
        .overrides(ReleaseOverrides::from_env())
        .build_number(build_no);
    let report = assembler
        .build_to_file(&image_path)
        .with_context(|| format!("Failed to build {}", image_path.display()))?;

    println!("{}", report.flash_map());
    if let Some(crc) = report.image_checksum {
        println!("Image checksum is 0x{crc:08X}");
    }
    Ok(())
}

fn dump(
    input: &Path,
    output: Option<&Path>,
    block_kib: u32,
    summary: bool,
    fmh_offset: Option<&str>,
) -> Result<()> {
    if !summary && output.is_none() {
        bail!("An output directory is required unless --summary is given");
    }
    let block_size = block_kib
        .checked_mul(1024)
        .context("Block size too large")?;
    let terminal_offset = fmh_offset
        .map(|s| {
            let digits = s.trim_start_matches("0x").trim_start_matches("0X");
            u64::from_str_radix(digits, 16).with_context(|| format!("Invalid hex offset '{s}'"))
        })
        .transpose()?;

    let mut scanner = ImageScanner::open(input, block_size)
        .with_context(|| format!("Failed to open {}", input.display()))?;
    let image_name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let listing = ImageListing::read(&mut scanner, &image_name, terminal_offset)
        .with_context(|| format!("Can not find FMH header in {}", input.display()))?;

    if let Some(descriptor) = listing.sections.iter().find(|s| s.is_firmware_info()) {
        let blob = scanner.read_payload(descriptor)?;
        for (key, value) in parse_fields(&blob) {
            println!("{key}=\"{value}\"");
        }
        if !scanner.verify(descriptor)? {
            warn!("Image checksum does not match the firmware descriptor");
        }
    }

    if summary {
        println!("--------------------------------------");
        print!("{}", listing.summary());
        return Ok(());
    }

    let Some(out_dir) = output else {
        return Ok(());
    };
    for section in listing.sections.iter().filter(|s| !s.is_firmware_info()) {
        if !scanner.verify(section)? {
            warn!(
                section = %section.name(),
                kind = section.header.module.module_type.kind_name(),
                "Payload checksum mismatch"
            );
        }
    }
    let written = listing.extract(&mut scanner, out_dir)?;
    info!(files = written.len(), dir = %out_dir.display(), "Dump complete");
    Ok(())
}
