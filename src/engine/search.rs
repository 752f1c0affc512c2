/// Focuser moves, frame dispatch and the adaptive search over focuser positions
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use super::events::{AutoFocusEvent, EventSink};
use super::state::AutoFocusRunState;
use super::AutoFocusError;
use crate::cancel::CancelToken;
use crate::devices::{CaptureParams, DeviceError, Focuser, ProgressSink};
use crate::image_analysis::RawImage;
use crate::measurement::MeasureAndError;
use crate::options::AutoFocusOptions;
use crate::pipeline::{FrameContext, MeasurementPipeline};

/// Everything one run needs to move, expose and measure
pub(crate) struct RunContext {
    pub options: AutoFocusOptions,
    pub focuser: Arc<dyn Focuser>,
    pub pipeline: Arc<MeasurementPipeline>,
    pub state: Arc<AutoFocusRunState>,
    pub capture: CaptureParams,
    pub events: EventSink,
    pub progress: Arc<dyn ProgressSink>,
}

impl RunContext {
    pub async fn move_focuser(&self, position: i32, token: &CancelToken) -> Result<(), AutoFocusError> {
        let limit = Duration::from_secs(self.options.focuser_move_timeout_secs);
        tracing::debug!("Moving focuser to {}", position);
        let moved = token
            .run_until_cancelled(tokio::time::timeout(
                limit,
                self.focuser.move_to(position, token),
            ))
            .await
            .ok_or(AutoFocusError::Cancelled)?;
        match moved {
            Ok(result) => Ok(result?),
            Err(_) => Err(DeviceError::timeout(format!("focuser move to {}", position), limit).into()),
        }
    }

    /// One exposure at the current position. Capture failures short of
    /// cancellation yield `None` and count as a failed frame.
    async fn capture_frame(
        &self,
        position: i32,
        token: &CancelToken,
    ) -> Result<Option<RawImage>, AutoFocusError> {
        match self.pipeline.capture(&self.capture, token).await {
            Ok(Some(mut raw)) => {
                raw.metadata.focuser_position = Some(position);
                if raw.metadata.exposure_time.is_none() {
                    raw.metadata.exposure_time = Some(self.capture.exposure_time_secs);
                }
                Ok(Some(raw))
            }
            Ok(None) => {
                tracing::warn!("No image captured at focuser position {}", position);
                Ok(None)
            }
            Err(DeviceError::Cancelled) => Err(AutoFocusError::Cancelled),
            Err(e) => {
                tracing::warn!("Capture at focuser position {} failed: {}", position, e);
                Ok(None)
            }
        }
    }

    fn frame_context(&self, position: i32) -> FrameContext {
        FrameContext {
            attempt: self.state.attempt(),
            image_index: self.state.next_image_index(),
            position,
        }
    }

    /// Move to `position`, expose every frame for it and hand each frame to
    /// an analysis task. Returns once the exposures are done; analysis
    /// completes in the background and publishes through the run state.
    pub async fn dispatch_point(
        &self,
        position: i32,
        tasks: &mut JoinSet<()>,
        token: &CancelToken,
    ) -> Result<(), AutoFocusError> {
        self.state.mark_dispatched(position).await;
        self.move_focuser(position, token).await?;

        for _ in 0..self.options.frames_per_point {
            let permit = token
                .run_until_cancelled(self.state.acquire_permit())
                .await
                .ok_or(AutoFocusError::Cancelled)?;
            let raw = self.capture_frame(position, token).await?;
            let ctx = self.frame_context(position);

            let pipeline = Arc::clone(&self.pipeline);
            let state = Arc::clone(&self.state);
            let events = self.events.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let measurement = match raw {
                    Some(raw) => analyze_blocking(pipeline, raw, ctx).await,
                    None => MeasureAndError::failed(),
                };
                if let Some(aggregate) = state.record(position, measurement).await {
                    tracing::info!("Focus point {}: {}", position, aggregate);
                    events.emit(AutoFocusEvent::MeasurementPointCompleted {
                        attempt: ctx.attempt,
                        position,
                        measurement: aggregate,
                    });
                    state.measurement_completed.notify_one();
                }
            });
        }
        Ok(())
    }

    /// Measure one position outside the search, waiting for the result
    pub async fn measure_at(
        &self,
        position: i32,
        token: &CancelToken,
    ) -> Result<MeasureAndError, AutoFocusError> {
        self.move_focuser(position, token).await?;
        let mut frames = Vec::with_capacity(self.options.frames_per_point as usize);
        for _ in 0..self.options.frames_per_point {
            let measurement = match self.capture_frame(position, token).await? {
                Some(raw) => {
                    let ctx = self.frame_context(position);
                    token
                        .run_until_cancelled(analyze_blocking(Arc::clone(&self.pipeline), raw, ctx))
                        .await
                        .ok_or(AutoFocusError::Cancelled)?
                }
                None => MeasureAndError::failed(),
            };
            frames.push(measurement);
        }
        Ok(MeasureAndError::average(&frames))
    }

    async fn wait_for_measurement(&self, token: &CancelToken) -> Result<(), AutoFocusError> {
        token
            .run_until_cancelled(self.state.measurement_completed.notified())
            .await
            .ok_or(AutoFocusError::Cancelled)
    }

    /// Sample focuser positions around `initial_position` until both sides of
    /// the focus curve are covered, then wait for every analysis to finish.
    pub async fn search(&self, initial_position: i32, token: &CancelToken) -> Result<(), AutoFocusError> {
        let mut tasks = JoinSet::new();
        if let Err(e) = self.search_points(initial_position, &mut tasks, token).await {
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            return Err(e);
        }

        loop {
            match token.run_until_cancelled(tasks.join_next()).await {
                None => {
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    return Err(AutoFocusError::Cancelled);
                }
                Some(None) => break,
                Some(Some(Err(e))) if e.is_panic() => {
                    tracing::error!("Measurement task panicked: {}", e);
                }
                Some(Some(_)) => {}
            }
        }

        let snapshot = self.state.refit_trendline(self.options.method).await;
        let limit = self.options.offset_steps as usize;
        if snapshot.failed >= limit {
            return Err(AutoFocusError::TooManyFailedMeasurements(snapshot.failed));
        }
        Ok(())
    }

    async fn search_points(
        &self,
        initial_position: i32,
        tasks: &mut JoinSet<()>,
        token: &CancelToken,
    ) -> Result<(), AutoFocusError> {
        let offset_steps = self.options.offset_steps as i32;
        let step = self.options.step_size;
        let limit = self.options.offset_steps as usize;
        let max_points = self.options.max_focus_points();

        // Initial ladder, moving inward from beyond the starting position
        let start = initial_position + (offset_steps + 1) * step;
        for i in 1..=offset_steps {
            self.dispatch_point(start - i * step, tasks, token).await?;
        }

        loop {
            let snapshot = self.state.refit_trendline(self.options.method).await;
            if snapshot.failed >= limit {
                tracing::warn!(
                    "{} failed measurements, giving up on this attempt",
                    snapshot.failed
                );
                return Err(AutoFocusError::TooManyFailedMeasurements(snapshot.failed));
            }

            // Stopping decisions need completed analyses
            if snapshot.in_progress() >= limit {
                self.wait_for_measurement(token).await?;
                continue;
            }

            let (left, right, best) = match &snapshot.trendline {
                Some(trend) => (trend.left.len(), trend.right.len(), Some(trend.best.x)),
                None => (0, 0, None),
            };
            tracing::debug!(
                "Search: {} dispatched, {} pending, left trend {}, right trend {}",
                snapshot.dispatched,
                snapshot.in_progress(),
                left,
                right
            );

            if let Some(best) = best.filter(|x| x.is_finite()) {
                let direction = if left >= limit && right >= 1 {
                    Some(1)
                } else if right >= limit && left >= 1 {
                    Some(-1)
                } else {
                    None
                };
                if let Some(direction) = direction {
                    let best = best.round() as i32;
                    let mut remaining = Vec::new();
                    for k in 1..=offset_steps {
                        let position = best + direction * k * step;
                        if !self.state.is_dispatched(position).await {
                            remaining.push(position);
                        }
                    }
                    tracing::info!(
                        "Fast-forwarding around {}: {} remaining points",
                        best,
                        remaining.len()
                    );
                    for position in remaining {
                        self.dispatch_point(position, tasks, token).await?;
                    }
                    return Ok(());
                }
            }

            if snapshot.dispatched >= max_points {
                if snapshot.in_progress() > 0 {
                    self.wait_for_measurement(token).await?;
                    continue;
                }
                return Err(AutoFocusError::FocusPointLimit(max_points));
            }

            let next = if left < right {
                snapshot.lowest_dispatched.map(|p| p - step)
            } else {
                snapshot.highest_dispatched.map(|p| p + step)
            }
            .unwrap_or(initial_position);
            self.progress
                .report(&format!("Autofocus: measuring focuser position {}", next));
            self.dispatch_point(next, tasks, token).await?;
        }
    }
}

async fn analyze_blocking(
    pipeline: Arc<MeasurementPipeline>,
    raw: RawImage,
    ctx: FrameContext,
) -> MeasureAndError {
    match tokio::task::spawn_blocking(move || pipeline.analyze_frame(raw, &ctx)).await {
        Ok(measurement) => measurement,
        Err(e) => {
            tracing::error!("Frame {} analysis aborted: {}", ctx.image_index, e);
            MeasureAndError::failed()
        }
    }
}
