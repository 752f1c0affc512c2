use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::devices::LogProgress;
use crate::engine::{AutoFocusEngine, AutoFocusEvent};
use crate::options::AutoFocusOptions;
use crate::report::AutoFocusReport;
use crate::simulator::{Simulator, SimulatorConfig};

pub struct SimulateArgs {
    pub sim_config: Option<PathBuf>,
    pub best_focus: Option<i32>,
    pub start: Option<i32>,
    pub seed: Option<u64>,
    pub output: Option<PathBuf>,
}

fn load_simulator_config(args: &SimulateArgs) -> Result<SimulatorConfig> {
    let mut config: SimulatorConfig = match &args.sim_config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read simulator config: {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse simulator config: {}", path.display()))?
        }
        None => SimulatorConfig::default(),
    };
    if let Some(best_focus) = args.best_focus {
        config.best_focus = best_focus;
    }
    if let Some(start) = args.start {
        config.start_position = start;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    Ok(config)
}

/// Run autofocus against the simulator and print the report. Ctrl-C cancels
/// the run. Returns whether focus was found.
pub async fn run_simulation(mut options: AutoFocusOptions, args: SimulateArgs) -> Result<bool> {
    let config = load_simulator_config(&args)?;
    if args.output.is_some() {
        options.save_path = args.output.clone();
    }
    tracing::info!(
        "Simulating {}x{} field with {} stars, best focus {}, starting at {}",
        config.width,
        config.height,
        config.star_count,
        config.best_focus,
        config.start_position
    );

    let simulator = Simulator::new(&config);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let engine =
        AutoFocusEngine::new(simulator.equipment(Arc::new(LogProgress))).with_events(tx);

    let events = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let AutoFocusEvent::MeasurementPointCompleted {
                position,
                measurement,
                ..
            } = &event
            {
                tracing::debug!("Point {}: {}", position, measurement);
            }
        }
    });

    let token = CancelToken::new();
    let interrupt = {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, cancelling autofocus");
                token.cancel();
            }
        })
    };

    let result = engine.run(&options, &token).await;
    interrupt.abort();
    drop(engine);
    if let Err(e) = events.await {
        tracing::warn!("Event listener failed: {}", e);
    }

    let report = AutoFocusReport::new(&result, &options);
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(position) = result.final_position {
        tracing::info!(
            "Focus found at {} (simulated best focus {}, error {})",
            position,
            config.best_focus,
            position - config.best_focus
        );
    }
    Ok(result.success())
}
