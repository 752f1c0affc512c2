/// Per-frame sharpness measurement strategies
use anyhow::Result;

use crate::image_analysis::PreparedImage;
use crate::measurement::MeasureAndError;
use crate::options::{AutoFocusMethod, AutoFocusOptions, ContrastDetectionMethod};
use crate::star_detection::{detect, StarDetectionResult, StarDetectorParams};

/// Measurement of one frame plus the detection behind it, when there is one
#[derive(Debug, Clone)]
pub struct FrameAnalysis {
    pub measurement: MeasureAndError,
    pub detection: Option<StarDetectionResult>,
}

impl FrameAnalysis {
    pub fn failed() -> Self {
        Self {
            measurement: MeasureAndError::failed(),
            detection: None,
        }
    }
}

/// Turns a prepared frame into a sharpness measurement. Runs on a blocking
/// worker thread.
pub trait FrameAnalyzer: Send + Sync {
    fn analyze(&self, image: &PreparedImage) -> Result<FrameAnalysis>;

    /// Whether frames should be auto-stretched before analysis
    fn wants_stretch(&self) -> bool {
        true
    }
}

/// Mean HFR of the detected stars, with the HFR spread as its error
pub struct StarHfrAnalyzer {
    pub params: StarDetectorParams,
    /// Use only the N brightest stars; 0 for all
    pub brightest: usize,
}

impl FrameAnalyzer for StarHfrAnalyzer {
    fn analyze(&self, image: &PreparedImage) -> Result<FrameAnalysis> {
        let detection = detect(image, &self.params);
        let measurement = match detection.hfr_stats(self.brightest) {
            Some((mean, stdev)) => MeasureAndError::new(mean, stdev),
            None => {
                tracing::debug!(
                    "No stars detected ({} candidates rejected)",
                    detection.metrics.rejected()
                );
                MeasureAndError::failed()
            }
        };
        Ok(FrameAnalysis {
            measurement,
            detection: Some(detection),
        })
    }
}

/// Frame standard deviation over mean; a sharper frame has more contrast
pub struct ContrastStatisticsAnalyzer;

impl FrameAnalyzer for ContrastStatisticsAnalyzer {
    fn analyze(&self, image: &PreparedImage) -> Result<FrameAnalysis> {
        let stats = &image.statistics;
        if stats.mean <= 0.0 {
            anyhow::bail!("Frame mean is {}, contrast undefined", stats.mean);
        }
        Ok(FrameAnalysis {
            measurement: MeasureAndError::new(stats.std_dev / stats.mean, 0.0),
            detection: None,
        })
    }

    fn wants_stretch(&self) -> bool {
        false
    }
}

/// Analyzer matching the configured autofocus method
pub fn analyzer_for(options: &AutoFocusOptions) -> Box<dyn FrameAnalyzer> {
    match options.method {
        AutoFocusMethod::StarHfr => Box::new(StarHfrAnalyzer {
            params: options.star_detection.clone(),
            brightest: options.use_brightest_stars,
        }),
        AutoFocusMethod::ContrastDetection => match options.contrast_method {
            ContrastDetectionMethod::Statistics => Box::new(ContrastStatisticsAnalyzer),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_analysis::{ImageMetadata, ImageStatistics};

    fn prepared(data: Vec<u16>, width: usize, height: usize) -> PreparedImage {
        PreparedImage {
            width,
            height,
            bit_depth: 16,
            statistics: ImageStatistics::calculate(&data, width, height),
            data,
            metadata: ImageMetadata::default(),
            stretched: false,
        }
    }

    #[test]
    fn test_contrast_statistics() {
        let data: Vec<u16> = (0..100).map(|i| if i % 2 == 0 { 900 } else { 1100 }).collect();
        let analysis = ContrastStatisticsAnalyzer
            .analyze(&prepared(data, 10, 10))
            .unwrap();
        let expected = (100.0 * (100.0f64 / 99.0).sqrt()) / 1000.0;
        assert!((analysis.measurement.measure - expected).abs() < 1e-9);
        assert!(analysis.detection.is_none());
    }

    #[test]
    fn test_contrast_rejects_black_frame() {
        assert!(ContrastStatisticsAnalyzer
            .analyze(&prepared(vec![0; 16], 4, 4))
            .is_err());
    }

    #[test]
    fn test_star_analyzer_without_stars_fails_measurement() {
        let analyzer = StarHfrAnalyzer {
            params: StarDetectorParams::default(),
            brightest: 0,
        };
        let analysis = analyzer.analyze(&prepared(vec![6000; 32 * 32], 32, 32)).unwrap();
        assert!(analysis.measurement.is_failed());
        assert_eq!(analysis.detection.unwrap().stars.len(), 0);
    }

    #[test]
    fn test_analyzer_selection() {
        let options = AutoFocusOptions {
            method: AutoFocusMethod::ContrastDetection,
            ..Default::default()
        };
        assert!(!analyzer_for(&options).wants_stretch());
        assert!(analyzer_for(&AutoFocusOptions::default()).wants_stretch());
    }
}
