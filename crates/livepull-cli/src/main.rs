//! Livepull CLI - Inspection tool for the live pull pipeline
//!
//! Features:
//! - Codec detection from init segments
//! - Box tree dumps
//! - Control message encoding/decoding
//! - Client configuration checks

use clap::{Parser, Subcommand};
use livepull_core::config::log_filter;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

/// Livepull CLI - Live stream pull toolkit
#[derive(Parser)]
#[command(name = "livepull")]
#[command(author = "Purple Squirrel Media")]
#[command(version)]
#[command(about = "Inspect init segments, control messages and client configs", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(short, long, global = true, default_value = "text")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect track codecs in an init segment
    Codecs {
        /// Path to the init segment
        file: PathBuf,
    },

    /// Print the box tree of an MP4 file
    Boxes {
        /// Path to the MP4 file
        file: PathBuf,

        /// Maximum nesting depth to descend into
        #[arg(short, long, default_value = "8")]
        depth: usize,
    },

    /// Encode or decode control messages
    Message {
        #[command(subcommand)]
        action: MessageAction,
    },

    /// Load, validate and resolve a client configuration
    Config {
        /// Path to a JSON configuration
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum MessageAction {
    /// Build a wire message from a type and key=value parameters
    Encode {
        /// Message type, e.g. PULL
        msg_type: String,

        /// Parameters as key=value
        params: Vec<String>,
    },

    /// Parse a wire message
    Decode {
        /// Raw message text
        raw: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        EnvFilter::new(log_filter(true))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_filter(false)))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    livepull_core::init();

    match cli.command {
        Commands::Codecs { file } => {
            commands::codecs(&file, &cli.format)?;
        }
        Commands::Boxes { file, depth } => {
            commands::boxes(&file, depth, &cli.format)?;
        }
        Commands::Message { action } => match action {
            MessageAction::Encode { msg_type, params } => {
                commands::encode_message(&msg_type, &params, &cli.format)?;
            }
            MessageAction::Decode { raw } => {
                commands::decode_message(&raw, &cli.format)?;
            }
        },
        Commands::Config { file } => {
            commands::config(&file, &cli.format)?;
        }
    }

    Ok(())
}
