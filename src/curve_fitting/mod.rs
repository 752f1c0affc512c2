/// Focus curve fitting
///
/// Every fitter takes `(focuser position, measure, stdev)` samples and reports a
/// closed-form expression, an extremum and an R² goodness of fit. Star HFR
/// curves are minimized; contrast curves are maximized.
pub mod gaussian;
pub mod hyperbolic;
pub mod quadratic;
pub mod trendline;

use serde::{Deserialize, Serialize};

use crate::measurement::MeasureAndError;
use crate::options::{AutoFocusCurveFitting, AutoFocusMethod};

pub use gaussian::GaussianFitting;
pub use hyperbolic::HyperbolicFitting;
pub use quadratic::QuadraticFitting;
pub use trendline::{Trendline, TrendlineFitting};

/// Minimum number of valid samples before any curve is fitted
pub const MIN_FIT_POINTS: usize = 3;

/// One sample of the focus curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitPoint {
    pub x: f64,
    pub y: f64,
    pub error_y: f64,
}

impl FitPoint {
    pub fn new(x: f64, y: f64, error_y: f64) -> Self {
        Self { x, y, error_y }
    }

    pub fn from_measurement(position: i32, measurement: &MeasureAndError) -> Self {
        Self {
            x: position as f64,
            y: measurement.measure,
            error_y: measurement.stdev,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.y > 0.0 && self.y.is_finite() && self.x.is_finite()
    }
}

/// A point on a fitted curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub x: f64,
    pub y: f64,
}

impl DataPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Common surface of the fitted focus curves
pub trait CurveFit {
    /// Human readable closed form, used by reports
    fn expression(&self) -> String;

    /// Curve minimum (HFR) or maximum (contrast)
    fn extremum(&self) -> DataPoint;

    fn r_squared(&self) -> f64;

    fn evaluate(&self, x: f64) -> f64;
}

/// Fitter knobs that come from the autofocus options
#[derive(Debug, Clone, Copy)]
pub struct FittingOptions {
    /// Weight hyperbolic residuals by the inverse of each point's stdev
    pub weighted: bool,
    /// Allow different asymptotic slopes on each side of the hyperbola
    pub uneven_hyperbolic: bool,
    /// Focuser step size; width of the uneven hyperbola's slope blending ramp
    pub step_size: f64,
}

impl Default for FittingOptions {
    fn default() -> Self {
        Self {
            weighted: false,
            uneven_hyperbolic: false,
            step_size: 100.0,
        }
    }
}

/// Coefficient of determination of `f` against `points`: `1 - RSS/TSS`
pub fn r_squared<F: Fn(f64) -> f64>(points: &[FitPoint], f: F) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    let mean = points.iter().map(|p| p.y).sum::<f64>() / points.len() as f64;
    let (rss, tss) = points.iter().fold((0.0, 0.0), |(rss, tss), p| {
        (rss + (p.y - f(p.x)).powi(2), tss + (p.y - mean).powi(2))
    });
    if tss <= 0.0 {
        return if rss <= f64::EPSILON { 1.0 } else { 0.0 };
    }
    1.0 - rss / tss
}

/// Inverse-variance weights, or `None` when any point lacks a usable stdev
pub(crate) fn inverse_variance_weights(points: &[FitPoint]) -> Option<Vec<f64>> {
    if points
        .iter()
        .all(|p| p.error_y.is_finite() && p.error_y > 0.0)
    {
        Some(points.iter().map(|p| 1.0 / (p.error_y * p.error_y)).collect())
    } else {
        None
    }
}

/// Maps focuser positions onto a unit scale centered on the samples so the
/// solvers work on well-conditioned numbers
#[derive(Debug, Clone, Copy)]
pub(crate) struct AxisScale {
    pub center: f64,
    pub scale: f64,
}

impl AxisScale {
    pub fn from_points(points: &[FitPoint]) -> Self {
        let min = points.iter().map(|p| p.x).fold(f64::INFINITY, f64::min);
        let max = points.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max);
        let center = (min + max) / 2.0;
        let half_range = (max - min) / 2.0;
        Self {
            center,
            scale: if half_range > 0.0 { half_range } else { 1.0 },
        }
    }

    pub fn to_unit(&self, x: f64) -> f64 {
        (x - self.center) / self.scale
    }

    pub fn from_unit(&self, u: f64) -> f64 {
        u * self.scale + self.center
    }
}

/// The set of curve fits for one search attempt, recomputed whole whenever a
/// point is added
#[derive(Debug, Clone, Default)]
pub struct CurveFittingBundle {
    pub trendline: Option<TrendlineFitting>,
    pub quadratic: Option<QuadraticFitting>,
    pub hyperbolic: Option<HyperbolicFitting>,
    pub gaussian: Option<GaussianFitting>,
}

impl CurveFittingBundle {
    /// Fit the curves selected by `method` and `fitting` to `points`.
    ///
    /// Failed samples are dropped first; with fewer than [`MIN_FIT_POINTS`]
    /// valid samples every fit is `None`.
    pub fn calculate(
        points: &[FitPoint],
        method: AutoFocusMethod,
        fitting: AutoFocusCurveFitting,
        options: &FittingOptions,
    ) -> Self {
        let valid: Vec<FitPoint> = points.iter().copied().filter(FitPoint::is_valid).collect();
        if valid.len() < MIN_FIT_POINTS {
            return Self::default();
        }

        let mut bundle = Self {
            trendline: Some(TrendlineFitting::calculate(&valid, method)),
            ..Default::default()
        };

        match (method, fitting) {
            (AutoFocusMethod::StarHfr, AutoFocusCurveFitting::Parabolic)
            | (AutoFocusMethod::StarHfr, AutoFocusCurveFitting::TrendParabolic) => {
                bundle.quadratic = QuadraticFitting::calculate(&valid, method);
            }
            (AutoFocusMethod::StarHfr, AutoFocusCurveFitting::Hyperbolic)
            | (AutoFocusMethod::StarHfr, AutoFocusCurveFitting::TrendHyperbolic) => {
                bundle.hyperbolic = HyperbolicFitting::calculate(&valid, options);
            }
            (AutoFocusMethod::ContrastDetection, AutoFocusCurveFitting::Gaussian) => {
                bundle.gaussian = GaussianFitting::calculate(&valid);
            }
            _ => {}
        }

        bundle
    }

    pub fn is_empty(&self) -> bool {
        self.trendline.is_none()
            && self.quadratic.is_none()
            && self.hyperbolic.is_none()
            && self.gaussian.is_none()
    }
}
