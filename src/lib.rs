pub mod annotate;
pub mod cancel;
pub mod cli;
pub mod commands;
pub mod curve_fitting;
pub mod devices;
pub mod engine;
pub mod image_analysis;
pub mod measurement;
pub mod mtf_stretch;
pub mod options;
pub mod pipeline;
pub mod psf_fitting;
pub mod report;
pub mod simulator;
pub mod solver;
pub mod star_detection;

#[cfg(test)]
mod test_star_detection;

// Re-export commonly used items
pub use cancel::CancelToken;
pub use engine::{AutoFocusEngine, AutoFocusOutcome, AutoFocusResult, Equipment};
pub use image_analysis::{ImageStatistics, RawImage};
pub use measurement::MeasureAndError;
pub use options::AutoFocusOptions;
