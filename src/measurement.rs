/// Focus measurements and their aggregation across frames taken at the same
/// focuser position.
use serde::{Deserialize, Serialize};

/// A sharpness measurement with its uncertainty.
///
/// `measure == 0.0` with a NaN `stdev` marks a failed measurement. It is never
/// a legitimate sharpness value: no star can have a zero HFR and no frame has
/// zero contrast.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasureAndError {
    pub measure: f64,
    #[serde(with = "nan_as_null")]
    pub stdev: f64,
}

impl MeasureAndError {
    pub fn new(measure: f64, stdev: f64) -> Self {
        Self { measure, stdev }
    }

    /// The failed-measurement sentinel
    pub fn failed() -> Self {
        Self {
            measure: 0.0,
            stdev: f64::NAN,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.measure == 0.0 || !self.measure.is_finite()
    }

    /// Average several sub-measurements taken at one position.
    ///
    /// Means are averaged and the combined stdev is the square root of the
    /// averaged variances. Failed entries are ignored unless every entry failed,
    /// in which case the result is the failed sentinel.
    pub fn average(measurements: &[MeasureAndError]) -> MeasureAndError {
        let valid: Vec<&MeasureAndError> =
            measurements.iter().filter(|m| !m.is_failed()).collect();
        if valid.is_empty() {
            return MeasureAndError::failed();
        }

        let count = valid.len() as f64;
        let mean = valid.iter().map(|m| m.measure).sum::<f64>() / count;
        let variance = valid
            .iter()
            .map(|m| if m.stdev.is_finite() { m.stdev * m.stdev } else { 0.0 })
            .sum::<f64>()
            / count;

        MeasureAndError {
            measure: mean,
            stdev: variance.sqrt(),
        }
    }
}

impl std::fmt::Display for MeasureAndError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3} ± {:.3}", self.measure, self.stdev)
    }
}

/// JSON has no NaN, so failed stdevs round-trip through `null`.
mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_all_valid() {
        let result = MeasureAndError::average(&[
            MeasureAndError::new(2.0, 0.3),
            MeasureAndError::new(4.0, 0.4),
        ]);
        assert!((result.measure - 3.0).abs() < 1e-12);
        let expected = ((0.09 + 0.16) / 2.0f64).sqrt();
        assert!((result.stdev - expected).abs() < 1e-12);
    }

    #[test]
    fn test_average_all_failed() {
        let result =
            MeasureAndError::average(&[MeasureAndError::failed(), MeasureAndError::failed()]);
        assert_eq!(result.measure, 0.0);
        assert!(result.stdev.is_nan());
        assert!(result.is_failed());
    }

    #[test]
    fn test_average_ignores_failed_entries() {
        let result = MeasureAndError::average(&[
            MeasureAndError::failed(),
            MeasureAndError::new(3.0, 0.2),
            MeasureAndError::failed(),
        ]);
        assert_eq!(result.measure, 3.0);
        assert!((result.stdev - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_average_empty_is_failed() {
        assert!(MeasureAndError::average(&[]).is_failed());
    }

    #[test]
    fn test_failed_stdev_serializes_as_null() {
        let json = serde_json::to_string(&MeasureAndError::failed()).unwrap();
        assert_eq!(json, r#"{"measure":0.0,"stdev":null}"#);
        let back: MeasureAndError = serde_json::from_str(&json).unwrap();
        assert!(back.is_failed());
        assert!(back.stdev.is_nan());
    }
}
