mod commands;
mod image;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use sigpatch::EngineConfig;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use commands::hex_utils::{parse_hex_address, parse_offset, parse_relative_operand};
use commands::resolve::ResolveArgs;
use commands::scan::ScanArgs;
use image::LoadedImage;

#[derive(Parser)]
#[command(name = "sigpatch")]
#[command(about = "Signature scanning against PE images on disk")]
struct Args {
    /// Engine settings (JSON)
    #[arg(short, long, global = true, env = "SIGPATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan an image for a byte pattern
    Scan {
        #[arg(short, long)]
        image: PathBuf,
        /// Load address (hex); defaults to the usual executable base
        #[arg(short, long, value_parser = parse_hex_address)]
        base: Option<u64>,
        /// Report every match instead of the first
        #[arg(long)]
        all: bool,
        /// Scan every readable section, not only executable ones
        #[arg(long)]
        all_sections: bool,
        /// Fail unless the pattern matches exactly once
        #[arg(long)]
        unique: bool,
        /// Pattern such as "48 8B 05 ?? ?? ?? ??"
        pattern: String,
    },
    /// Check every entry of a signature file against an image
    Check {
        #[arg(short, long)]
        image: PathBuf,
        #[arg(short, long, value_parser = parse_hex_address)]
        base: Option<u64>,
        #[arg(short, long)]
        signatures: PathBuf,
    },
    /// Derive an address from a pattern match
    Resolve {
        #[arg(short, long)]
        image: PathBuf,
        #[arg(short, long, value_parser = parse_hex_address)]
        base: Option<u64>,
        /// Move the match by a signed offset
        #[arg(long, value_parser = parse_offset, allow_hyphen_values = true)]
        offset: Option<i64>,
        /// Search a second pattern near the match
        #[arg(long)]
        near: Option<String>,
        /// Follow a relative operand, as <size>:<disp>
        #[arg(long, value_parser = parse_relative_operand)]
        rel: Option<commands::hex_utils::RelativeOperand>,
        /// Read a pointer at the result
        #[arg(long)]
        deref: bool,
        /// Walk back to the start of the enclosing function
        #[arg(long)]
        align: bool,
        pattern: String,
    },
    /// Dump mapped image bytes
    Hexdump {
        #[arg(short, long)]
        image: PathBuf,
        #[arg(short, long, value_parser = parse_hex_address)]
        base: Option<u64>,
        #[arg(short, long, value_parser = parse_hex_address)]
        address: u64,
        #[arg(long, default_value = "256")]
        size: usize,
    },
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sigpatch=info".parse()?))
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref());

    match args.command {
        Command::Scan {
            image,
            base,
            all,
            all_sections,
            unique,
            pattern,
        } => {
            let image = LoadedImage::load(&image, base)?;
            commands::scan::run(
                &image,
                &config,
                ScanArgs {
                    pattern: &pattern,
                    all,
                    all_sections,
                    unique,
                },
            )?;
        }
        Command::Check {
            image,
            base,
            signatures,
        } => {
            let image = LoadedImage::load(&image, base)?;
            if !commands::check::run(&image, &config, &signatures)? {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Resolve {
            image,
            base,
            offset,
            near,
            rel,
            deref,
            align,
            pattern,
        } => {
            let image = LoadedImage::load(&image, base)?;
            let args = ResolveArgs {
                pattern,
                offset,
                near,
                rel,
                deref,
                align,
            };
            commands::resolve::run(&image, &config, &args)?;
        }
        Command::Hexdump {
            image,
            base,
            address,
            size,
        } => {
            let image = LoadedImage::load(&image, base)?;
            commands::hexdump::run(&image, address, size)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn load_config(path: Option<&Path>) -> EngineConfig {
    let Some(path) = path else {
        return EngineConfig::default();
    };
    match EngineConfig::load(path) {
        Ok(config) => {
            info!("Loaded config from {:?}", path);
            config
        }
        Err(e) => {
            warn!("Failed to load config: {}, using defaults", e);
            EngineConfig::default()
        }
    }
}
