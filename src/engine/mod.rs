/// Autofocus state machine
///
/// A run snapshots the equipment, optionally measures the starting HFR, then
/// searches, fits and validates up to `total_number_of_attempts` times. Every
/// exit path restores the equipment it touched before reporting.
pub mod events;
pub mod search;
pub mod state;
pub mod validate;

use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;

use crate::cancel::CancelToken;
use crate::curve_fitting::{CurveFit, CurveFittingBundle, FittingOptions};
use crate::devices::{
    Camera, CaptureParams, DeviceError, FilterWheel, Focuser, Guider, ProgressSink,
};
use crate::measurement::MeasureAndError;
use crate::options::{
    is_supported_combination, AutoFocusCurveFitting, AutoFocusMethod, AutoFocusOptions,
    SubSampleRect,
};
use crate::pipeline::{analyzer_for, ArtifactWriter, FrameAnalyzer, MeasurementPipeline};
use crate::report;
pub use events::{AutoFocusEvent, EventSink};
use search::RunContext;
pub use state::AutoFocusRunState;
use validate::{final_focus_point, validate_fit, validate_improvement, Rejection};

/// Bound on restoring the focuser after an unsuccessful run
const RESTORE_TIMEOUT: Duration = Duration::from_secs(60);

/// Conditions that end an attempt or a run early
#[derive(Debug, thiserror::Error)]
pub enum AutoFocusError {
    #[error("Too many failed measurements: {0}")]
    TooManyFailedMeasurements(usize),

    #[error("Initial HFR measurement failed")]
    InitialHfrFailed,

    #[error("Search exceeded {0} focus points")]
    FocusPointLimit(usize),

    #[error("Autofocus cancelled")]
    Cancelled,

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// How a run ended. Only `Success` moves the focuser to a new focus point.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome")]
pub enum AutoFocusOutcome {
    Success,
    TooManyFailedMeasurements {
        count: usize,
    },
    InitialHfrFailed,
    Timeout,
    Cancelled,
    AttemptsExhausted {
        attempts: u32,
    },
    UnsupportedFitting {
        method: AutoFocusMethod,
        fitting: AutoFocusCurveFitting,
    },
    AlreadyRunning,
    Failed {
        reason: String,
    },
}

impl std::fmt::Display for AutoFocusOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AutoFocusOutcome::Success => write!(f, "autofocus succeeded"),
            AutoFocusOutcome::TooManyFailedMeasurements { count } => {
                write!(f, "{} measurements failed", count)
            }
            AutoFocusOutcome::InitialHfrFailed => write!(f, "initial HFR measurement failed"),
            AutoFocusOutcome::Timeout => write!(f, "autofocus timed out"),
            AutoFocusOutcome::Cancelled => write!(f, "autofocus cancelled"),
            AutoFocusOutcome::AttemptsExhausted { attempts } => {
                write!(f, "no valid focus point after {} attempts", attempts)
            }
            AutoFocusOutcome::UnsupportedFitting { method, fitting } => {
                write!(f, "{:?} fitting is not supported for {:?}", fitting, method)
            }
            AutoFocusOutcome::AlreadyRunning => write!(f, "autofocus already running"),
            AutoFocusOutcome::Failed { reason } => write!(f, "autofocus failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AutoFocusResult {
    pub outcome: AutoFocusOutcome,
    pub initial_position: Option<i32>,
    pub final_position: Option<i32>,
    pub initial_measurement: Option<MeasureAndError>,
    pub final_measurement: Option<MeasureAndError>,
    pub attempts: u32,
    pub images: u32,
    pub temperature: Option<f64>,
    pub filter: Option<String>,
    /// Points of the last attempt, in position order
    pub points: Vec<(i32, MeasureAndError)>,
    pub fittings: CurveFittingBundle,
    pub started_at: DateTime<Local>,
    pub duration: Duration,
    pub save_folder: Option<PathBuf>,
}

impl AutoFocusResult {
    fn new(outcome: AutoFocusOutcome, started_at: DateTime<Local>) -> Self {
        Self {
            outcome,
            initial_position: None,
            final_position: None,
            initial_measurement: None,
            final_measurement: None,
            attempts: 0,
            images: 0,
            temperature: None,
            filter: None,
            points: Vec::new(),
            fittings: CurveFittingBundle::default(),
            started_at,
            duration: Duration::ZERO,
            save_folder: None,
        }
    }

    pub fn success(&self) -> bool {
        self.outcome == AutoFocusOutcome::Success
    }
}

/// The equipment a run drives
#[derive(Clone)]
pub struct Equipment {
    pub focuser: Arc<dyn Focuser>,
    pub camera: Arc<dyn Camera>,
    pub filter_wheel: Option<Arc<dyn FilterWheel>>,
    pub guider: Option<Arc<dyn Guider>>,
    pub progress: Arc<dyn ProgressSink>,
}

/// What the run changed and must put back
#[derive(Debug, Default)]
struct Restore {
    initial_position: Option<i32>,
    original_filter: Option<String>,
    temp_comp_disabled: bool,
    guiding_stopped: bool,
}

/// Clears the in-progress flag when the run ends
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

enum AttemptResult {
    Accepted {
        position: i32,
        final_measurement: Option<MeasureAndError>,
    },
    Rejected(String),
}

enum RunEnd {
    Focused {
        position: i32,
        final_measurement: Option<MeasureAndError>,
    },
    Exhausted {
        attempts: u32,
    },
}

pub struct AutoFocusEngine {
    equipment: Equipment,
    analyzer: Option<Arc<dyn FrameAnalyzer>>,
    events: EventSink,
    running: AtomicBool,
}

impl AutoFocusEngine {
    pub fn new(equipment: Equipment) -> Self {
        Self {
            equipment,
            analyzer: None,
            events: EventSink::default(),
            running: AtomicBool::new(false),
        }
    }

    /// Replace the analyzer chosen from the options' method
    pub fn with_analyzer(mut self, analyzer: Arc<dyn FrameAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn with_events(mut self, sender: UnboundedSender<AutoFocusEvent>) -> Self {
        self.events = EventSink::new(Some(sender));
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run autofocus to completion. Never fails: every ending, including
    /// cancellation and timeout, is reported through the result's outcome.
    pub async fn run(&self, options: &AutoFocusOptions, token: &CancelToken) -> AutoFocusResult {
        let started_at = Local::now();
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::error!("Autofocus requested while another run is active");
            return AutoFocusResult::new(AutoFocusOutcome::AlreadyRunning, started_at);
        }
        let _guard = RunGuard(&self.running);

        if let Err(e) = options.validate() {
            tracing::error!("Invalid autofocus options: {:#}", e);
            return AutoFocusResult::new(
                AutoFocusOutcome::Failed {
                    reason: format!("{:#}", e),
                },
                started_at,
            );
        }
        if !is_supported_combination(options.method, options.curve_fitting) {
            tracing::error!(
                "Curve fitting {:?} cannot be used with {:?}",
                options.curve_fitting,
                options.method
            );
            return AutoFocusResult::new(
                AutoFocusOutcome::UnsupportedFitting {
                    method: options.method,
                    fitting: options.curve_fitting,
                },
                started_at,
            );
        }

        let clock = Instant::now();
        let run_token = token.child_token();
        let timer = run_token.cancel_after(Duration::from_secs(options.timeout_secs));

        let save_folder = options
            .save_path
            .as_ref()
            .map(|p| p.join(started_at.format("%Y-%m-%d_%H-%M-%S").to_string()));
        let analyzer = self
            .analyzer
            .clone()
            .unwrap_or_else(|| Arc::from(analyzer_for(options)));
        let pipeline = Arc::new(MeasurementPipeline::new(
            Arc::clone(&self.equipment.camera),
            analyzer,
            options,
            save_folder
                .as_ref()
                .map(|dir| ArtifactWriter::new(dir, options.save_annotated_images)),
        ));
        let state = Arc::new(AutoFocusRunState::new(
            options.frames_per_point,
            options.max_concurrent,
        ));

        let mut result = AutoFocusResult::new(AutoFocusOutcome::Success, started_at);
        result.save_folder = save_folder.clone();
        let mut restore = Restore::default();

        let outcome = match self
            .prepare(options, &mut restore, &mut result, &run_token)
            .await
        {
            Ok(capture) => {
                let ctx = RunContext {
                    options: options.clone(),
                    focuser: Arc::clone(&self.equipment.focuser),
                    pipeline,
                    state: Arc::clone(&state),
                    capture,
                    events: self.events.clone(),
                    progress: Arc::clone(&self.equipment.progress),
                };
                match self.run_attempts(&ctx, &mut result, &run_token).await {
                    Ok(RunEnd::Focused {
                        position,
                        final_measurement,
                    }) => {
                        result.final_position = Some(position);
                        result.final_measurement = final_measurement;
                        AutoFocusOutcome::Success
                    }
                    Ok(RunEnd::Exhausted { attempts }) => {
                        AutoFocusOutcome::AttemptsExhausted { attempts }
                    }
                    Err(e) => outcome_for_error(e, token, &run_token),
                }
            }
            Err(e) => outcome_for_error(e, token, &run_token),
        };
        timer.abort();

        result.outcome = outcome;
        result.attempts = state.attempt();
        result.images = state.images_taken();
        result.points = state.points().await;
        result.fittings = state.fittings().await;

        if result.success() {
            tracing::info!(
                "Autofocus finished at position {:?} after {} attempt(s)",
                result.final_position,
                result.attempts
            );
        } else {
            tracing::warn!("Autofocus unsuccessful: {}", result.outcome);
            self.equipment
                .progress
                .report(&format!("Autofocus unsuccessful: {}", result.outcome));
        }
        self.cleanup(options, &restore, result.success()).await;
        result.duration = clock.elapsed();

        if let Some(folder) = &save_folder {
            if let Err(e) = report::write_report(&result, options, folder) {
                tracing::warn!("Failed to write autofocus report: {:#}", e);
            }
        }

        self.events.emit(AutoFocusEvent::Completed {
            outcome: result.outcome.clone(),
            initial_position: result.initial_position,
            final_position: result.final_position,
            initial_measurement: result.initial_measurement,
            final_measurement: result.final_measurement,
            duration_secs: result.duration.as_secs_f64(),
            save_folder: result.save_folder.clone(),
        });
        result
    }

    /// Snapshot the focuser and set up filter, temperature compensation,
    /// guiding and the capture parameters
    async fn prepare(
        &self,
        options: &AutoFocusOptions,
        restore: &mut Restore,
        result: &mut AutoFocusResult,
        token: &CancelToken,
    ) -> Result<CaptureParams, AutoFocusError> {
        let focuser = &self.equipment.focuser;
        let status = token
            .run_until_cancelled(focuser.status())
            .await
            .ok_or(AutoFocusError::Cancelled)??;
        restore.initial_position = Some(status.position);
        result.initial_position = Some(status.position);
        result.temperature = status.temperature;

        let mut filter = None;
        if let Some(wheel) = &self.equipment.filter_wheel {
            let current = wheel.current_filter().await?;
            filter = current.clone();
            if let Some(af_filter) = &options.autofocus_filter {
                let resolved = token
                    .run_until_cancelled(wheel.change_filter(af_filter, token))
                    .await
                    .ok_or(AutoFocusError::Cancelled)??;
                tracing::info!("Switched to autofocus filter {}", resolved);
                if current.as_deref() != Some(resolved.as_str()) {
                    restore.original_filter = current;
                }
                filter = Some(resolved);
            }
        }
        result.filter = filter.clone();

        if options.disable_temperature_compensation
            && status.temp_comp_available
            && status.temp_comp_enabled
        {
            focuser.set_temp_comp(false).await?;
            restore.temp_comp_disabled = true;
            tracing::info!("Temperature compensation disabled for autofocus");
        }

        if options.stop_guiding {
            if let Some(guider) = &self.equipment.guider {
                let limit = Duration::from_secs(options.guider_timeout_secs);
                let stopped = token
                    .run_until_cancelled(tokio::time::timeout(limit, guider.stop_guiding(token)))
                    .await
                    .ok_or(AutoFocusError::Cancelled)?
                    .map_err(|_| DeviceError::timeout("stop guiding", limit))??;
                restore.guiding_stopped = stopped;
            }
        }

        let sub_sample = if options.inner_crop_ratio < 1.0 {
            match self.equipment.camera.sensor_size().await {
                Ok((width, height)) => Some(SubSampleRect::centered(
                    width,
                    height,
                    options.inner_crop_ratio,
                )),
                Err(e) => {
                    tracing::warn!("Sensor size unavailable, using full frame: {}", e);
                    None
                }
            }
        } else {
            None
        };

        self.events.emit(AutoFocusEvent::Started {
            initial_position: status.position,
            filter: filter.clone(),
        });
        self.equipment.progress.report(&format!(
            "Autofocus started at focuser position {}",
            status.position
        ));

        Ok(CaptureParams {
            exposure_time_secs: options.exposure_time_secs,
            binning: options.binning,
            gain: options.gain,
            offset: options.offset,
            filter,
            sub_sample,
        })
    }

    async fn run_attempts(
        &self,
        ctx: &RunContext,
        result: &mut AutoFocusResult,
        run_token: &CancelToken,
    ) -> Result<RunEnd, AutoFocusError> {
        let options = &ctx.options;
        let Some(initial_position) = result.initial_position else {
            return Err(AutoFocusError::Device(DeviceError::NotConnected));
        };

        let checks_hfr =
            options.validate_hfr_improvement && options.method == AutoFocusMethod::StarHfr;
        let initial_measurement = if checks_hfr {
            let measurement = ctx.measure_at(initial_position, run_token).await?;
            if measurement.is_failed() {
                return Err(AutoFocusError::InitialHfrFailed);
            }
            tracing::info!("Initial HFR: {}", measurement);
            ctx.events
                .emit(AutoFocusEvent::InitialHfrCalculated { measurement });
            result.initial_measurement = Some(measurement);
            Some(measurement)
        } else {
            None
        };

        let attempts = options.total_number_of_attempts;
        for _ in 0..attempts {
            let attempt = ctx.state.start_attempt().await;
            tracing::info!("Starting autofocus attempt {}/{}", attempt, attempts);
            ctx.events.emit(AutoFocusEvent::IterationStarted { attempt });

            let attempt_token = run_token.child_token();
            let outcome = self
                .run_attempt(ctx, initial_position, initial_measurement, &attempt_token)
                .await;
            attempt_token.cancel();

            let reason = match outcome {
                Ok(AttemptResult::Accepted {
                    position,
                    final_measurement,
                }) => {
                    return Ok(RunEnd::Focused {
                        position,
                        final_measurement,
                    })
                }
                Ok(AttemptResult::Rejected(reason)) => reason,
                Err(AutoFocusError::FocusPointLimit(limit)) => {
                    format!("no focus point within {} points", limit)
                }
                Err(e) => return Err(e),
            };

            tracing::warn!("Autofocus attempt {} failed: {}", attempt, reason);
            ctx.progress
                .report(&format!("Autofocus attempt {} failed: {}", attempt, reason));
            ctx.events
                .emit(AutoFocusEvent::IterationFailed { attempt, reason });

            if attempt < attempts {
                tracing::info!("Restoring focuser to {} before retrying", initial_position);
                ctx.move_focuser(initial_position, run_token).await?;
            }
        }

        Ok(RunEnd::Exhausted { attempts })
    }

    async fn run_attempt(
        &self,
        ctx: &RunContext,
        initial_position: i32,
        initial_measurement: Option<MeasureAndError>,
        token: &CancelToken,
    ) -> Result<AttemptResult, AutoFocusError> {
        let options = &ctx.options;
        ctx.search(initial_position, token).await?;

        let fitting_options = FittingOptions {
            weighted: options.weighted_fitting,
            uneven_hyperbolic: options.uneven_hyperbolic,
            step_size: options.step_size as f64,
        };
        let bundle = ctx
            .state
            .refit_all(options.method, options.curve_fitting, &fitting_options)
            .await;
        log_fits(&bundle);

        let Some(point) = final_focus_point(&bundle, options.curve_fitting) else {
            return Ok(AttemptResult::Rejected(Rejection::MissingFit.to_string()));
        };
        let sampled: Vec<i32> = ctx
            .state
            .points()
            .await
            .into_iter()
            .filter(|(_, m)| !m.is_failed())
            .map(|(position, _)| position)
            .collect();
        if let Err(rejection) = validate_fit(
            &bundle,
            options.curve_fitting,
            &point,
            &sampled,
            options.r_squared_threshold,
        ) {
            return Ok(AttemptResult::Rejected(rejection.to_string()));
        }

        let position = point.x.round() as i32;
        tracing::info!("Calculated focus point {} ({:.3})", position, point.y);

        let final_measurement = match initial_measurement {
            Some(initial) => {
                let measurement = ctx.measure_at(position, token).await?;
                tracing::info!("Final HFR: {}", measurement);
                if let Err(rejection) =
                    validate_improvement(&initial, &measurement, options.hfr_improvement_threshold)
                {
                    return Ok(AttemptResult::Rejected(rejection.to_string()));
                }
                Some(measurement)
            }
            None => {
                ctx.move_focuser(position, token).await?;
                None
            }
        };

        Ok(AttemptResult::Accepted {
            position,
            final_measurement,
        })
    }

    /// Put back everything the run changed. Best effort: failures are logged.
    async fn cleanup(&self, options: &AutoFocusOptions, restore: &Restore, success: bool) {
        // The run token may be cancelled already
        let token = CancelToken::new();

        if !success {
            if let Some(position) = restore.initial_position {
                tracing::info!("Restoring focuser to initial position {}", position);
                match tokio::time::timeout(
                    RESTORE_TIMEOUT,
                    self.equipment.focuser.move_to(position, &token),
                )
                .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::error!("Failed to restore focuser position: {}", e),
                    Err(_) => tracing::error!(
                        "Restoring focuser position timed out after {:?}",
                        RESTORE_TIMEOUT
                    ),
                }
            }
        }

        if let (Some(filter), Some(wheel)) = (&restore.original_filter, &self.equipment.filter_wheel)
        {
            tracing::info!("Restoring filter {}", filter);
            match tokio::time::timeout(RESTORE_TIMEOUT, wheel.change_filter(filter, &token)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::error!("Failed to restore filter {}: {}", filter, e),
                Err(_) => tracing::error!("Restoring filter {} timed out", filter),
            }
        }

        if restore.temp_comp_disabled {
            if let Err(e) = self.equipment.focuser.set_temp_comp(true).await {
                tracing::error!("Failed to re-enable temperature compensation: {}", e);
            }
        }

        if restore.guiding_stopped {
            if let Some(guider) = &self.equipment.guider {
                let limit = Duration::from_secs(options.guider_timeout_secs);
                let resumed = match tokio::time::timeout(limit, guider.start_guiding(&token)).await
                {
                    Ok(Ok(resumed)) => resumed,
                    Ok(Err(e)) => {
                        tracing::error!("Failed to resume guiding: {}", e);
                        false
                    }
                    Err(_) => false,
                };
                if !resumed {
                    tracing::warn!("Guiding did not resume after autofocus");
                    self.equipment
                        .progress
                        .report("Warning: guiding could not be resumed after autofocus");
                }
            }
        }
    }
}

fn outcome_for_error(
    error: AutoFocusError,
    caller: &CancelToken,
    run_token: &CancelToken,
) -> AutoFocusOutcome {
    if caller.is_cancelled() {
        return AutoFocusOutcome::Cancelled;
    }
    if run_token.is_cancelled() {
        return AutoFocusOutcome::Timeout;
    }
    match error {
        AutoFocusError::TooManyFailedMeasurements(count) => {
            AutoFocusOutcome::TooManyFailedMeasurements { count }
        }
        AutoFocusError::InitialHfrFailed => AutoFocusOutcome::InitialHfrFailed,
        AutoFocusError::Cancelled | AutoFocusError::Device(DeviceError::Cancelled) => {
            AutoFocusOutcome::Cancelled
        }
        other => AutoFocusOutcome::Failed {
            reason: other.to_string(),
        },
    }
}

fn log_fits(bundle: &CurveFittingBundle) {
    if let Some(trend) = &bundle.trendline {
        tracing::info!(
            "Trendlines: {} (R² {:.3}/{:.3})",
            trend.expression(),
            trend.left.r_squared,
            trend.right.r_squared
        );
    }
    if let Some(fit) = &bundle.quadratic {
        tracing::info!("Parabolic: {} (R² {:.3})", fit.expression(), fit.r_squared());
    }
    if let Some(fit) = &bundle.hyperbolic {
        tracing::info!("Hyperbolic: {} (R² {:.3})", fit.expression(), fit.r_squared());
    }
    if let Some(fit) = &bundle.gaussian {
        tracing::info!("Gaussian: {} (R² {:.3})", fit.expression(), fit.r_squared());
    }
}
