/// Run-scoped measurement state shared between the dispatcher and the
/// analysis tasks
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};

use crate::curve_fitting::{CurveFittingBundle, FitPoint, FittingOptions, TrendlineFitting};
use crate::measurement::MeasureAndError;
use crate::options::{AutoFocusCurveFitting, AutoFocusMethod};

#[derive(Debug, Default)]
struct Measurements {
    /// Positions with at least one frame dispatched
    dispatched: BTreeSet<i32>,
    /// Published per-position aggregates
    points: BTreeMap<i32, MeasureAndError>,
    /// Sub-measurements awaiting the rest of their frames
    pending: HashMap<i32, Vec<MeasureAndError>>,
    fittings: CurveFittingBundle,
}

/// Consistent view of the search taken under the lock
#[derive(Debug, Clone)]
pub struct SearchSnapshot {
    pub dispatched: usize,
    pub lowest_dispatched: Option<i32>,
    pub highest_dispatched: Option<i32>,
    pub completed: usize,
    pub failed: usize,
    pub trendline: Option<TrendlineFitting>,
}

impl SearchSnapshot {
    pub fn in_progress(&self) -> usize {
        self.dispatched - self.completed
    }
}

pub struct AutoFocusRunState {
    attempt: AtomicU32,
    image_counter: AtomicU32,
    frames_per_point: usize,
    measurements: Mutex<Measurements>,
    /// Signaled whenever a position's aggregate is published
    pub measurement_completed: Notify,
    permits: Option<Arc<Semaphore>>,
}

impl AutoFocusRunState {
    /// `max_concurrent == 0` leaves analysis unbounded
    pub fn new(frames_per_point: u32, max_concurrent: usize) -> Self {
        Self {
            attempt: AtomicU32::new(0),
            image_counter: AtomicU32::new(0),
            frames_per_point: frames_per_point.max(1) as usize,
            measurements: Mutex::new(Measurements::default()),
            measurement_completed: Notify::new(),
            permits: (max_concurrent > 0).then(|| Arc::new(Semaphore::new(max_concurrent))),
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::SeqCst)
    }

    /// Clear measurements and fits for a new attempt. Image numbering carries on.
    pub async fn start_attempt(&self) -> u32 {
        *self.measurements.lock().await = Measurements::default();
        self.attempt.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn next_image_index(&self) -> u32 {
        self.image_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn images_taken(&self) -> u32 {
        self.image_counter.load(Ordering::SeqCst)
    }

    /// Wait for an analysis slot; `None` when unbounded
    pub async fn acquire_permit(&self) -> Option<OwnedSemaphorePermit> {
        match &self.permits {
            // The semaphore is never closed
            Some(permits) => Arc::clone(permits).acquire_owned().await.ok(),
            None => None,
        }
    }

    pub async fn mark_dispatched(&self, position: i32) {
        self.measurements.lock().await.dispatched.insert(position);
    }

    pub async fn is_dispatched(&self, position: i32) -> bool {
        self.measurements.lock().await.dispatched.contains(&position)
    }

    /// Add one frame's measurement. Returns the aggregate once every frame of
    /// the position has arrived.
    pub async fn record(&self, position: i32, measurement: MeasureAndError) -> Option<MeasureAndError> {
        let mut guard = self.measurements.lock().await;
        let frames = guard.pending.entry(position).or_default();
        frames.push(measurement);
        if frames.len() < self.frames_per_point {
            return None;
        }

        let frames = guard.pending.remove(&position).unwrap_or_default();
        let aggregate = MeasureAndError::average(&frames);
        guard.points.insert(position, aggregate);
        Some(aggregate)
    }

    /// Refit the trendline from the published points and snapshot the search
    pub async fn refit_trendline(&self, method: AutoFocusMethod) -> SearchSnapshot {
        let mut guard = self.measurements.lock().await;
        let points = fit_points(&guard.points);
        let valid = points.iter().filter(|p| p.is_valid()).count();
        guard.fittings.trendline = if valid > 0 {
            Some(TrendlineFitting::calculate(&points, method))
        } else {
            None
        };

        SearchSnapshot {
            dispatched: guard.dispatched.len(),
            lowest_dispatched: guard.dispatched.first().copied(),
            highest_dispatched: guard.dispatched.last().copied(),
            completed: guard.points.len(),
            failed: guard.points.values().filter(|m| m.is_failed()).count(),
            trendline: guard.fittings.trendline.clone(),
        }
    }

    /// Fit every configured curve to the published points
    pub async fn refit_all(
        &self,
        method: AutoFocusMethod,
        fitting: AutoFocusCurveFitting,
        options: &FittingOptions,
    ) -> CurveFittingBundle {
        let mut guard = self.measurements.lock().await;
        let points = fit_points(&guard.points);
        guard.fittings = CurveFittingBundle::calculate(&points, method, fitting, options);
        guard.fittings.clone()
    }

    pub async fn fittings(&self) -> CurveFittingBundle {
        self.measurements.lock().await.fittings.clone()
    }

    /// Published points in position order
    pub async fn points(&self) -> Vec<(i32, MeasureAndError)> {
        let guard = self.measurements.lock().await;
        guard.points.iter().map(|(&p, &m)| (p, m)).collect()
    }
}

fn fit_points(points: &BTreeMap<i32, MeasureAndError>) -> Vec<FitPoint> {
    points
        .iter()
        .map(|(&position, m)| FitPoint::from_measurement(position, m))
        .collect()
}
