use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::curve_fitting::{CurveFit, CurveFittingBundle, FitPoint, FittingOptions};
use crate::engine::validate::final_focus_point;
use crate::measurement::MeasureAndError;
use crate::options::{
    is_supported_combination, AutoFocusCurveFitting, AutoFocusMethod, AutoFocusOptions,
};
use crate::report::FittingsReport;

#[derive(Debug, Deserialize)]
struct PointRecord {
    position: i32,
    measure: f64,
    #[serde(default)]
    stdev: Option<f64>,
}

/// A bare list of points, or a saved run report carrying them
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PointsFile {
    Points(Vec<PointRecord>),
    Report { points: Vec<PointRecord> },
}

pub fn load_points(path: &Path) -> Result<Vec<(i32, MeasureAndError)>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read points file: {}", path.display()))?;
    let file: PointsFile = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse points file: {}", path.display()))?;
    let records = match file {
        PointsFile::Points(points) | PointsFile::Report { points } => points,
    };
    Ok(records
        .into_iter()
        .map(|r| {
            (
                r.position,
                MeasureAndError::new(r.measure, r.stdev.unwrap_or(f64::NAN)),
            )
        })
        .collect())
}

pub fn fit_points(
    points: &[(i32, MeasureAndError)],
    method: AutoFocusMethod,
    fitting: AutoFocusCurveFitting,
    options: &AutoFocusOptions,
) -> CurveFittingBundle {
    let fit_points: Vec<FitPoint> = points
        .iter()
        .map(|(position, m)| FitPoint::from_measurement(*position, m))
        .collect();
    let fitting_options = FittingOptions {
        weighted: options.weighted_fitting,
        uneven_hyperbolic: options.uneven_hyperbolic,
        step_size: options.step_size as f64,
    };
    CurveFittingBundle::calculate(&fit_points, method, fitting, &fitting_options)
}

fn print_fit(name: &str, fit: &dyn CurveFit) {
    let extremum = fit.extremum();
    println!("{}:", name);
    println!("  {}", fit.expression());
    println!("  R²: {:.4}", fit.r_squared());
    if extremum.is_finite() {
        println!("  Focus: {:.1} ({:.3})", extremum.x, extremum.y);
    } else {
        println!("  Focus: n/a");
    }
}

/// Fit the curves for `method`/`fitting` to a points file and print them
pub fn fit_points_file(
    path: &Path,
    method: AutoFocusMethod,
    fitting: AutoFocusCurveFitting,
    options: &AutoFocusOptions,
    json: bool,
) -> Result<()> {
    if !is_supported_combination(method, fitting) {
        anyhow::bail!("{:?} fitting cannot be used with {:?}", fitting, method);
    }
    let points = load_points(path)?;
    tracing::info!("Loaded {} points from {}", points.len(), path.display());

    let bundle = fit_points(&points, method, fitting, options);
    if bundle.is_empty() {
        anyhow::bail!("Not enough valid points to fit a curve");
    }

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&FittingsReport::from(&bundle))?
        );
        return Ok(());
    }

    if let Some(fit) = &bundle.trendline {
        print_fit("Trendlines", fit);
    }
    if let Some(fit) = &bundle.quadratic {
        print_fit("Parabolic", fit);
    }
    if let Some(fit) = &bundle.hyperbolic {
        print_fit("Hyperbolic", fit);
    }
    if let Some(fit) = &bundle.gaussian {
        print_fit("Gaussian", fit);
    }
    match final_focus_point(&bundle, fitting) {
        Some(point) => println!("Final focus point ({:?}): {}", fitting, point.x.round()),
        None => println!("No focus point for {:?}", fitting),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("hocus-focus-{}-{}", std::process::id(), name));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_bare_points_and_report() {
        let bare = write_temp(
            "bare.json",
            r#"[{"position": 100, "measure": 3.5, "stdev": 0.2}, {"position": 200, "measure": 0.0, "stdev": null}]"#,
        );
        let points = load_points(&bare).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0], (100, MeasureAndError::new(3.5, 0.2)));
        assert!(points[1].1.is_failed());

        let report = write_temp(
            "report.json",
            r#"{"outcome": {"outcome": "Success"}, "points": [{"position": 300, "measure": 2.0}]}"#,
        );
        let points = load_points(&report).unwrap();
        assert_eq!(points[0].0, 300);
        assert!(points[0].1.stdev.is_nan());

        let _ = std::fs::remove_file(bare);
        let _ = std::fs::remove_file(report);
    }

    #[test]
    fn test_fit_points_finds_vertex() {
        let points: Vec<(i32, MeasureAndError)> = (0..9)
            .map(|i| {
                let position = 1_000 + i * 50;
                let x = position as f64;
                (position, MeasureAndError::new(0.001 * (x - 1_180.0).powi(2) + 1.5, 0.1))
            })
            .collect();
        let bundle = fit_points(
            &points,
            AutoFocusMethod::StarHfr,
            AutoFocusCurveFitting::Parabolic,
            &AutoFocusOptions::default(),
        );
        let point = final_focus_point(&bundle, AutoFocusCurveFitting::Parabolic).unwrap();
        assert!((point.x - 1_180.0).abs() < 1.0);
    }
}
