/// JSON report written to the run's save folder
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::curve_fitting::{CurveFit, CurveFittingBundle};
use crate::engine::{AutoFocusOutcome, AutoFocusResult};
use crate::measurement::MeasureAndError;
use crate::options::{AutoFocusCurveFitting, AutoFocusMethod, AutoFocusOptions};

pub const REPORT_FILE: &str = "autofocus_report.json";

#[derive(Debug, Serialize)]
pub struct ReportPoint {
    pub position: i32,
    #[serde(flatten)]
    pub measurement: MeasureAndError,
}

#[derive(Debug, Serialize)]
pub struct FitReport {
    pub expression: String,
    pub r_squared: f64,
    pub focus_position: Option<f64>,
    pub focus_value: Option<f64>,
}

impl FitReport {
    fn from_fit(fit: &dyn CurveFit) -> Self {
        let extremum = fit.extremum();
        let finite = extremum.is_finite();
        Self {
            expression: fit.expression(),
            r_squared: fit.r_squared(),
            focus_position: finite.then_some(extremum.x),
            focus_value: finite.then_some(extremum.y),
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct FittingsReport {
    pub trendlines: Option<FitReport>,
    pub parabolic: Option<FitReport>,
    pub hyperbolic: Option<FitReport>,
    pub gaussian: Option<FitReport>,
}

impl From<&CurveFittingBundle> for FittingsReport {
    fn from(bundle: &CurveFittingBundle) -> Self {
        Self {
            trendlines: bundle.trendline.as_ref().map(|f| FitReport::from_fit(f)),
            parabolic: bundle.quadratic.as_ref().map(|f| FitReport::from_fit(f)),
            hyperbolic: bundle.hyperbolic.as_ref().map(|f| FitReport::from_fit(f)),
            gaussian: bundle.gaussian.as_ref().map(|f| FitReport::from_fit(f)),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AutoFocusReport {
    pub timestamp: DateTime<Local>,
    pub outcome: AutoFocusOutcome,
    pub method: AutoFocusMethod,
    pub curve_fitting: AutoFocusCurveFitting,
    pub initial_position: Option<i32>,
    pub final_position: Option<i32>,
    pub initial_measurement: Option<MeasureAndError>,
    pub final_measurement: Option<MeasureAndError>,
    pub temperature: Option<f64>,
    pub filter: Option<String>,
    pub step_size: i32,
    pub attempts: u32,
    pub images: u32,
    pub duration_secs: f64,
    pub points: Vec<ReportPoint>,
    pub fittings: FittingsReport,
}

impl AutoFocusReport {
    pub fn new(result: &AutoFocusResult, options: &AutoFocusOptions) -> Self {
        Self {
            timestamp: result.started_at,
            outcome: result.outcome.clone(),
            method: options.method,
            curve_fitting: options.curve_fitting,
            initial_position: result.initial_position,
            final_position: result.final_position,
            initial_measurement: result.initial_measurement,
            final_measurement: result.final_measurement,
            temperature: result.temperature,
            filter: result.filter.clone(),
            step_size: options.step_size,
            attempts: result.attempts,
            images: result.images,
            duration_secs: result.duration.as_secs_f64(),
            points: result
                .points
                .iter()
                .map(|&(position, measurement)| ReportPoint {
                    position,
                    measurement,
                })
                .collect(),
            fittings: FittingsReport::from(&result.fittings),
        }
    }
}

/// Write the report for `result` into `folder`, creating it when missing
pub fn write_report(
    result: &AutoFocusResult,
    options: &AutoFocusOptions,
    folder: &Path,
) -> Result<PathBuf> {
    std::fs::create_dir_all(folder)
        .with_context(|| format!("Failed to create report folder: {}", folder.display()))?;
    let path = folder.join(REPORT_FILE);
    let json = serde_json::to_string_pretty(&AutoFocusReport::new(result, options))
        .context("Failed to serialize autofocus report")?;
    std::fs::write(&path, json)
        .with_context(|| format!("Failed to write report: {}", path.display()))?;
    tracing::info!("Autofocus report saved to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve_fitting::{FitPoint, FittingOptions};
    use std::time::Duration;

    fn sample_result() -> AutoFocusResult {
        let points: Vec<(i32, MeasureAndError)> = (0..7)
            .map(|i| {
                let position = 10_200 + i * 100;
                let x = position as f64;
                (
                    position,
                    MeasureAndError::new(0.0001 * (x - 10_500.0).powi(2) + 2.0, 0.1),
                )
            })
            .chain(std::iter::once((10_900, MeasureAndError::failed())))
            .collect();
        let fit_points: Vec<FitPoint> = points
            .iter()
            .map(|(p, m)| FitPoint::from_measurement(*p, m))
            .collect();
        AutoFocusResult {
            outcome: AutoFocusOutcome::Success,
            initial_position: Some(10_000),
            final_position: Some(10_500),
            initial_measurement: Some(MeasureAndError::new(27.0, 0.5)),
            final_measurement: Some(MeasureAndError::new(2.0, 0.1)),
            attempts: 1,
            images: 10,
            temperature: Some(3.25),
            filter: Some("L".to_string()),
            fittings: CurveFittingBundle::calculate(
                &fit_points,
                AutoFocusMethod::StarHfr,
                AutoFocusCurveFitting::Parabolic,
                &FittingOptions::default(),
            ),
            points,
            started_at: Local::now(),
            duration: Duration::from_millis(1500),
            save_folder: None,
        }
    }

    #[test]
    fn test_report_contents() {
        let options = AutoFocusOptions {
            curve_fitting: AutoFocusCurveFitting::Parabolic,
            ..Default::default()
        };
        let report = AutoFocusReport::new(&sample_result(), &options);
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["outcome"]["outcome"], "Success");
        assert_eq!(json["final_position"], 10_500);
        assert_eq!(json["temperature"], 3.25);
        assert_eq!(json["points"].as_array().unwrap().len(), 8);
        assert_eq!(json["points"][0]["position"], 10_200);
        // Failed points keep their place with a null stdev
        assert_eq!(json["points"][7]["measure"], 0.0);
        assert!(json["points"][7]["stdev"].is_null());

        let parabolic = &json["fittings"]["parabolic"];
        assert!(parabolic["r_squared"].as_f64().unwrap() > 0.99);
        assert!((parabolic["focus_position"].as_f64().unwrap() - 10_500.0).abs() < 1.0);
        assert!(json["fittings"]["hyperbolic"].is_null());
    }

    #[test]
    fn test_write_report_creates_folder() {
        let folder = std::env::temp_dir()
            .join(format!("hocus-focus-report-{}", std::process::id()))
            .join("run");
        let path = write_report(&sample_result(), &AutoFocusOptions::default(), &folder).unwrap();
        assert_eq!(path, folder.join(REPORT_FILE));
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"initial_position\": 10000"));
        let _ = std::fs::remove_dir_all(folder.parent().unwrap());
    }
}
