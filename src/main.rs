use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use hocus_focus::cli::{Cli, Commands};
use hocus_focus::commands::{detect_stars_in_file, fit_points_file, run_simulation, SimulateArgs};
use hocus_focus::options::AutoFocusOptions;

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let options = match &cli.config {
        Some(path) => AutoFocusOptions::from_file(path)?,
        None => AutoFocusOptions::default(),
    };

    match cli.command {
        Commands::Detect {
            fits_path,
            json,
            annotate,
            stretch,
            brightest,
        } => {
            detect_stars_in_file(
                &fits_path,
                &options,
                json,
                annotate.as_deref(),
                stretch,
                brightest,
            )?;
        }
        Commands::Fit {
            points,
            method,
            fitting,
            json,
        } => {
            fit_points_file(
                &points,
                method.unwrap_or(options.method),
                fitting.unwrap_or(options.curve_fitting),
                &options,
                json,
            )?;
        }
        Commands::Simulate {
            sim_config,
            best_focus,
            start,
            seed,
            output,
        } => {
            let args = SimulateArgs {
                sim_config,
                best_focus,
                start,
                seed,
                output,
            };
            let success = run_simulation(options, args).await?;
            if !success {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
