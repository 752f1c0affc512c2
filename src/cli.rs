use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::options::{AutoFocusCurveFitting, AutoFocusMethod};

#[derive(Parser)]
#[command(name = "hocus-focus")]
#[command(about = "Telescope autofocus: HFR star detection, focus curve fitting and simulated runs", long_about = None)]
pub struct Cli {
    /// Autofocus options JSON file; missing keys take their defaults
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Detect stars in a FITS file and report their HFR
    Detect {
        /// FITS file to analyze
        fits_path: PathBuf,

        /// Print the full detection result as JSON
        #[arg(long)]
        json: bool,

        /// Write an annotated PNG of the detected stars
        #[arg(short, long)]
        annotate: Option<PathBuf>,

        /// Auto-stretch before detection
        #[arg(long)]
        stretch: bool,

        /// Use only the N brightest stars for the HFR summary (0 for all)
        #[arg(long, default_value = "0")]
        brightest: usize,
    },

    /// Fit focus curves to saved measurement points
    Fit {
        /// JSON array of {"position", "measure", "stdev"} objects
        points: PathBuf,

        /// Measurement method: hfr or contrast
        #[arg(short, long)]
        method: Option<AutoFocusMethod>,

        /// Curve fitting: parabolic, trendparabolic, hyperbolic,
        /// trendhyperbolic, trendlines or gaussian
        #[arg(short, long)]
        fitting: Option<AutoFocusCurveFitting>,

        /// Print the fits as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a complete autofocus against simulated equipment
    Simulate {
        /// Simulator settings JSON file; missing keys take their defaults
        #[arg(long)]
        sim_config: Option<PathBuf>,

        /// Focuser position with the sharpest stars
        #[arg(long)]
        best_focus: Option<i32>,

        /// Focuser position when the run starts
        #[arg(long)]
        start: Option<i32>,

        /// Random seed for the star field and noise
        #[arg(long)]
        seed: Option<u64>,

        /// Directory for frames, annotations and the run report
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}
