use anyhow::Result;
use clap::{Parser, Subcommand};
use fmh_core::{BuildConfig, ImageAssembler, ImageListing, ImageScanner, MemorySource};
use std::path::PathBuf;
use std::process::Command;

const DEMO_CONFIG: &str = r#"
[global]
output = "demo.ima"
flash_size = "1M"
block_size = "64K"
product_name = "Demo"

[[section]]
name = "fwinfo"
major = 1
minor = 0
type = 0x0202
locate = "start"

[[section]]
name = "boot"
major = 1
minor = 3
type = 0x0101
boot_os = true
checksum = true
locate = "64K"
file = "boot.bin"

[[section]]
name = "app"
major = 2
minor = 0
type = 0x0103
execute = true
checksum = true
locate = "end"
fmh_loc = "0x8000"
file = "app.bin"
"#;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the project
    Build,
    /// Run the test suite
    Test,
    /// Build a sample image and list it again
    Demo {
        /// Directory for the generated image
        #[arg(long, default_value = "target/demo")]
        out: PathBuf,
    },
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{what} failed");
    }
    Ok(())
}

fn demo(out: PathBuf) -> Result<()> {
    std::fs::create_dir_all(&out)?;
    let config = BuildConfig::from_toml_str(DEMO_CONFIG)?;
    let image_path = out.join(&config.global.output);

    let source = MemorySource::new()
        .with("boot.bin", (0..0x6000u32).map(|i| i as u8).collect::<Vec<_>>())
        .with("app.bin", vec![0xA5; 0x3000]);
    let report = ImageAssembler::new(config, source).build_to_file(&image_path)?;
    println!("{}", report.flash_map());

    let mut scanner = ImageScanner::open(&image_path, report.geometry.block_size)?;
    let listing = ImageListing::read(&mut scanner, "demo.ima", None)?;
    print!("{}", listing.summary());
    for section in &listing.sections {
        let ok = scanner.verify(section)?;
        println!("{:<8} checksum {}", section.name(), if ok { "ok" } else { "BAD" });
    }
    println!("Wrote {}", image_path.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build => {
            println!("Building project...");
            cargo(&["build", "--workspace"], "Build")?;
        }
        Commands::Test => {
            println!("Running tests...");
            cargo(&["test", "--workspace"], "Tests")?;
        }
        Commands::Demo { out } => {
            println!("Building demo image...");
            demo(out)?;
        }
    }

    Ok(())
}
