//! Command-line surface of the `voxlink` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "voxlink", version, about = "Live, interruptible voice calls from the terminal")]
pub struct Cli {
    /// Settings file (defaults to the platform data directory)
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a live call; Ctrl-C hangs up
    Call {
        /// Service endpoint (overrides settings and VOXLINK_ENDPOINT)
        #[arg(long)]
        endpoint: Option<String>,
        /// Agent voice name
        #[arg(long)]
        voice: Option<String>,
        /// Persona instructions for the agent
        #[arg(long)]
        instructions: Option<String>,
        /// Input device name
        #[arg(long)]
        input_device: Option<String>,
        /// Output device name
        #[arg(long)]
        output_device: Option<String>,
        /// Replay a WAV file instead of using the microphone
        #[arg(long, conflicts_with = "input_device")]
        input_wav: Option<PathBuf>,
        /// Persist the effective settings before calling
        #[arg(long)]
        save: bool,
    },

    /// List audio input and output devices
    Devices {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}
