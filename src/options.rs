/// Autofocus configuration
///
/// Loaded from JSON (missing keys take their defaults) and validated before a
/// run touches any hardware.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::star_detection::StarDetectorParams;

/// What is measured at each focuser position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AutoFocusMethod {
    /// Average star half-flux radius; smaller is sharper
    #[default]
    StarHfr,
    /// Whole-frame contrast; larger is sharper
    ContrastDetection,
}

/// Which curve determines the final focus point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AutoFocusCurveFitting {
    Parabolic,
    TrendParabolic,
    #[default]
    Hyperbolic,
    TrendHyperbolic,
    Trendlines,
    Gaussian,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ContrastDetectionMethod {
    /// Frame standard deviation over mean
    #[default]
    Statistics,
}

impl std::str::FromStr for AutoFocusMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hfr" | "starhfr" | "star_hfr" => Ok(AutoFocusMethod::StarHfr),
            "contrast" | "contrastdetection" | "contrast_detection" => {
                Ok(AutoFocusMethod::ContrastDetection)
            }
            _ => Err(format!("Unknown autofocus method: {}", s)),
        }
    }
}

impl std::str::FromStr for AutoFocusCurveFitting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "parabolic" => Ok(AutoFocusCurveFitting::Parabolic),
            "trendparabolic" | "trend_parabolic" => Ok(AutoFocusCurveFitting::TrendParabolic),
            "hyperbolic" => Ok(AutoFocusCurveFitting::Hyperbolic),
            "trendhyperbolic" | "trend_hyperbolic" => Ok(AutoFocusCurveFitting::TrendHyperbolic),
            "trendlines" => Ok(AutoFocusCurveFitting::Trendlines),
            "gaussian" => Ok(AutoFocusCurveFitting::Gaussian),
            _ => Err(format!("Unknown curve fitting: {}", s)),
        }
    }
}

/// Whether `fitting` can locate a focus point for `method`
pub fn is_supported_combination(method: AutoFocusMethod, fitting: AutoFocusCurveFitting) -> bool {
    use AutoFocusCurveFitting::*;
    match method {
        AutoFocusMethod::StarHfr => matches!(
            fitting,
            Parabolic | TrendParabolic | Hyperbolic | TrendHyperbolic | Trendlines
        ),
        AutoFocusMethod::ContrastDetection => matches!(fitting, Gaussian | Trendlines),
    }
}

/// Camera sub-frame, in unbinned sensor pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubSampleRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl SubSampleRect {
    /// Centered rectangle covering `ratio` of each sensor dimension
    pub fn centered(sensor_width: u32, sensor_height: u32, ratio: f64) -> Self {
        let ratio = ratio.clamp(0.0, 1.0);
        let width = ((sensor_width as f64 * ratio).round() as u32).max(1);
        let height = ((sensor_height as f64 * ratio).round() as u32).max(1);
        Self {
            x: (sensor_width - width) / 2,
            y: (sensor_height - height) / 2,
            width,
            height,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoFocusOptions {
    /// Points sampled on each side of the focus point
    pub offset_steps: u32,
    /// Focuser steps between samples
    pub step_size: i32,
    pub frames_per_point: u32,
    pub exposure_time_secs: f64,
    pub binning: u16,
    pub gain: Option<i32>,
    pub offset: Option<i32>,
    pub method: AutoFocusMethod,
    pub curve_fitting: AutoFocusCurveFitting,
    pub contrast_method: ContrastDetectionMethod,
    /// Fits below this R² are rejected; 0 disables the check
    pub r_squared_threshold: f64,
    pub validate_hfr_improvement: bool,
    /// Allowed HFR regression relative to the initial HFR, as a fraction
    pub hfr_improvement_threshold: f64,
    pub total_number_of_attempts: u32,
    /// Concurrent frame analyses; 0 means unbounded
    pub max_concurrent: usize,
    pub timeout_secs: u64,
    pub focuser_move_timeout_secs: u64,
    pub guider_timeout_secs: u64,
    pub autofocus_filter: Option<String>,
    pub stop_guiding: bool,
    pub disable_temperature_compensation: bool,
    /// Fraction of the sensor sampled around the center; 1 disables sub-framing
    pub inner_crop_ratio: f64,
    /// Measure only the N brightest stars; 0 uses all of them
    pub use_brightest_stars: usize,
    pub auto_stretch: bool,
    pub debayer: bool,
    /// Weight hyperbolic residuals by each point's inverse stdev
    pub weighted_fitting: bool,
    pub uneven_hyperbolic: bool,
    /// An attempt fails once it holds `offset_steps × factor` points
    pub max_focus_points_factor: u32,
    pub save_path: Option<PathBuf>,
    pub save_annotated_images: bool,
    pub star_detection: StarDetectorParams,
}

impl Default for AutoFocusOptions {
    fn default() -> Self {
        Self {
            offset_steps: 4,
            step_size: 100,
            frames_per_point: 1,
            exposure_time_secs: 4.0,
            binning: 1,
            gain: None,
            offset: None,
            method: AutoFocusMethod::StarHfr,
            curve_fitting: AutoFocusCurveFitting::Hyperbolic,
            contrast_method: ContrastDetectionMethod::Statistics,
            r_squared_threshold: 0.7,
            validate_hfr_improvement: true,
            hfr_improvement_threshold: 0.15,
            total_number_of_attempts: 1,
            max_concurrent: 0,
            timeout_secs: 3600,
            focuser_move_timeout_secs: 60,
            guider_timeout_secs: 60,
            autofocus_filter: None,
            stop_guiding: false,
            disable_temperature_compensation: true,
            inner_crop_ratio: 1.0,
            use_brightest_stars: 0,
            auto_stretch: false,
            debayer: false,
            weighted_fitting: false,
            uneven_hyperbolic: false,
            max_focus_points_factor: 10,
            save_path: None,
            save_annotated_images: true,
            star_detection: StarDetectorParams::default(),
        }
    }
}

impl AutoFocusOptions {
    /// Load options from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read options file: {}", path.display()))?;
        let options: AutoFocusOptions = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse options file: {}", path.display()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.offset_steps == 0 {
            anyhow::bail!("offset_steps must be at least 1");
        }
        if self.step_size <= 0 {
            anyhow::bail!("step_size must be positive, got {}", self.step_size);
        }
        if self.frames_per_point == 0 {
            anyhow::bail!("frames_per_point must be at least 1");
        }
        if self.total_number_of_attempts == 0 {
            anyhow::bail!("total_number_of_attempts must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.r_squared_threshold) {
            anyhow::bail!(
                "r_squared_threshold must be within [0, 1], got {}",
                self.r_squared_threshold
            );
        }
        if self.hfr_improvement_threshold < 0.0 {
            anyhow::bail!("hfr_improvement_threshold must not be negative");
        }
        if !(self.inner_crop_ratio > 0.0 && self.inner_crop_ratio <= 1.0) {
            anyhow::bail!(
                "inner_crop_ratio must be within (0, 1], got {}",
                self.inner_crop_ratio
            );
        }
        if self.exposure_time_secs < 0.0 {
            anyhow::bail!("exposure_time_secs must not be negative");
        }
        Ok(())
    }

    /// Upper bound on points one attempt may collect
    pub fn max_focus_points(&self) -> usize {
        (self.offset_steps as usize) * (self.max_focus_points_factor.max(2) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        AutoFocusOptions::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let options: AutoFocusOptions =
            serde_json::from_str(r#"{"offset_steps": 6, "curve_fitting": "TrendParabolic"}"#)
                .unwrap();
        assert_eq!(options.offset_steps, 6);
        assert_eq!(options.curve_fitting, AutoFocusCurveFitting::TrendParabolic);
        assert_eq!(options.step_size, 100);
        assert_eq!(options.star_detection.minimum_star_bounding_box_size, 5);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let options = AutoFocusOptions {
            step_size: 0,
            ..Default::default()
        };
        assert!(options.validate().is_err());

        let options = AutoFocusOptions {
            r_squared_threshold: 1.5,
            ..Default::default()
        };
        assert!(options.validate().is_err());

        let options = AutoFocusOptions {
            inner_crop_ratio: 0.0,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_supported_combinations() {
        assert!(is_supported_combination(
            AutoFocusMethod::StarHfr,
            AutoFocusCurveFitting::TrendHyperbolic
        ));
        assert!(!is_supported_combination(
            AutoFocusMethod::StarHfr,
            AutoFocusCurveFitting::Gaussian
        ));
        assert!(is_supported_combination(
            AutoFocusMethod::ContrastDetection,
            AutoFocusCurveFitting::Gaussian
        ));
        assert!(!is_supported_combination(
            AutoFocusMethod::ContrastDetection,
            AutoFocusCurveFitting::Hyperbolic
        ));
    }

    #[test]
    fn test_centered_sub_sample() {
        let rect = SubSampleRect::centered(4000, 3000, 0.5);
        assert_eq!(
            rect,
            SubSampleRect {
                x: 1000,
                y: 750,
                width: 2000,
                height: 1500
            }
        );
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!(
            "contrast".parse::<AutoFocusMethod>().unwrap(),
            AutoFocusMethod::ContrastDetection
        );
        assert_eq!(
            "trend_hyperbolic".parse::<AutoFocusCurveFitting>().unwrap(),
            AutoFocusCurveFitting::TrendHyperbolic
        );
        assert!("spline".parse::<AutoFocusCurveFitting>().is_err());
    }
}
