/// Final focus point selection and acceptance checks
use crate::curve_fitting::{CurveFit, CurveFittingBundle, DataPoint};
use crate::measurement::MeasureAndError;
use crate::options::AutoFocusCurveFitting;

/// Why a computed focus point was not accepted
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    MissingFit,
    PoorFit { curve: &'static str, r_squared: f64 },
    OutOfRange { position: f64, min: f64, max: f64 },
    InitialMeasurementFailed,
    FinalMeasurementFailed,
    NoImprovement { initial: f64, final_value: f64 },
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::MissingFit => write!(f, "no usable curve fit"),
            Rejection::PoorFit { curve, r_squared } => {
                write!(f, "{} fit R² {:.3} below threshold", curve, r_squared)
            }
            Rejection::OutOfRange { position, min, max } => write!(
                f,
                "focus point {:.0} outside sampled range {:.0}..{:.0}",
                position, min, max
            ),
            Rejection::InitialMeasurementFailed => write!(f, "initial HFR measurement failed"),
            Rejection::FinalMeasurementFailed => write!(f, "final HFR measurement failed"),
            Rejection::NoImprovement {
                initial,
                final_value,
            } => write!(
                f,
                "final HFR {:.3} not better than initial HFR {:.3}",
                final_value, initial
            ),
        }
    }
}

/// The curves whose fit quality decides acceptance for `fitting`
fn relevant_fits(
    bundle: &CurveFittingBundle,
    fitting: AutoFocusCurveFitting,
) -> Option<Vec<(&'static str, f64)>> {
    let trend = |b: &CurveFittingBundle| {
        b.trendline
            .as_ref()
            .map(|t| vec![("left trend", t.left.r_squared), ("right trend", t.right.r_squared)])
    };
    match fitting {
        AutoFocusCurveFitting::Trendlines => trend(bundle),
        AutoFocusCurveFitting::Parabolic => {
            Some(vec![("parabolic", bundle.quadratic.as_ref()?.r_squared())])
        }
        AutoFocusCurveFitting::Hyperbolic => {
            Some(vec![("hyperbolic", bundle.hyperbolic.as_ref()?.r_squared())])
        }
        AutoFocusCurveFitting::Gaussian => {
            Some(vec![("gaussian", bundle.gaussian.as_ref()?.r_squared())])
        }
        AutoFocusCurveFitting::TrendParabolic => {
            let mut fits = trend(bundle)?;
            fits.push(("parabolic", bundle.quadratic.as_ref()?.r_squared()));
            Some(fits)
        }
        AutoFocusCurveFitting::TrendHyperbolic => {
            let mut fits = trend(bundle)?;
            fits.push(("hyperbolic", bundle.hyperbolic.as_ref()?.r_squared()));
            Some(fits)
        }
    }
}

/// Focus point for the configured fitting; the hybrid modes average the
/// trendline intersection with the curve extremum
pub fn final_focus_point(
    bundle: &CurveFittingBundle,
    fitting: AutoFocusCurveFitting,
) -> Option<DataPoint> {
    let trend = || bundle.trendline.as_ref().map(|t| t.extremum());
    let point = match fitting {
        AutoFocusCurveFitting::Trendlines => trend()?,
        AutoFocusCurveFitting::Parabolic => bundle.quadratic.as_ref()?.extremum(),
        AutoFocusCurveFitting::Hyperbolic => bundle.hyperbolic.as_ref()?.extremum(),
        AutoFocusCurveFitting::Gaussian => bundle.gaussian.as_ref()?.extremum(),
        AutoFocusCurveFitting::TrendParabolic => {
            average(trend()?, bundle.quadratic.as_ref()?.extremum())
        }
        AutoFocusCurveFitting::TrendHyperbolic => {
            average(trend()?, bundle.hyperbolic.as_ref()?.extremum())
        }
    };
    point.is_finite().then_some(point)
}

fn average(a: DataPoint, b: DataPoint) -> DataPoint {
    DataPoint::new((a.x + b.x) / 2.0, (a.y + b.y) / 2.0)
}

/// Check fit quality and that `point` interpolates the sampled positions
pub fn validate_fit(
    bundle: &CurveFittingBundle,
    fitting: AutoFocusCurveFitting,
    point: &DataPoint,
    sampled: &[i32],
    r_squared_threshold: f64,
) -> Result<(), Rejection> {
    let fits = relevant_fits(bundle, fitting).ok_or(Rejection::MissingFit)?;
    if r_squared_threshold > 0.0 {
        for (curve, r_squared) in fits {
            if !(r_squared >= r_squared_threshold) {
                return Err(Rejection::PoorFit { curve, r_squared });
            }
        }
    }

    let min = sampled.iter().copied().min().ok_or(Rejection::MissingFit)? as f64;
    let max = sampled.iter().copied().max().ok_or(Rejection::MissingFit)? as f64;
    if point.x < min || point.x > max {
        return Err(Rejection::OutOfRange {
            position: point.x,
            min,
            max,
        });
    }
    Ok(())
}

/// Final HFR must not exceed the initial HFR by more than `threshold`
pub fn validate_improvement(
    initial: &MeasureAndError,
    final_measurement: &MeasureAndError,
    threshold: f64,
) -> Result<(), Rejection> {
    if initial.is_failed() {
        return Err(Rejection::InitialMeasurementFailed);
    }
    if final_measurement.is_failed() {
        return Err(Rejection::FinalMeasurementFailed);
    }
    if final_measurement.measure > initial.measure * (1.0 + threshold) {
        return Err(Rejection::NoImprovement {
            initial: initial.measure,
            final_value: final_measurement.measure,
        });
    }
    Ok(())
}
