/// Files written while focusing: raw frames, detection dumps, annotated frames
use anyhow::{Context, Result};
use image::{ImageBuffer, Luma};
use std::path::{Path, PathBuf};

use crate::annotate::save_annotated_image;
use crate::image_analysis::{PreparedImage, RawImage};
use crate::star_detection::StarDetectionResult;

/// Identifies one captured frame within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameContext {
    pub attempt: u32,
    pub image_index: u32,
    pub position: i32,
}

/// Writes per-attempt artifacts under a run folder
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    root: PathBuf,
    save_annotated: bool,
}

impl ArtifactWriter {
    pub fn new(root: impl Into<PathBuf>, save_annotated: bool) -> Self {
        Self {
            root: root.into(),
            save_annotated,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn attempt_dir(&self, attempt: u32) -> PathBuf {
        self.root.join(format!("attempt{:02}", attempt))
    }

    /// Save the frame as a 16-bit PNG named after its position and HFR
    pub fn save_frame(&self, ctx: &FrameContext, raw: &RawImage, hfr: f64) -> Result<PathBuf> {
        let dir = self.ensure_attempt_dir(ctx.attempt)?;
        let path = dir.join(format!(
            "{:02}_Focuser{}_HFR{:.2}.png",
            ctx.image_index, ctx.position, hfr
        ));

        // Scale up so low bit depth frames remain visible
        let shift = 16u32.saturating_sub(raw.bit_depth as u32);
        let data: Vec<u16> = raw.data.iter().map(|&v| v << shift).collect();
        let buffer =
            ImageBuffer::<Luma<u16>, Vec<u16>>::from_raw(raw.width as u32, raw.height as u32, data)
                .context("Failed to create frame buffer")?;
        buffer
            .save(&path)
            .with_context(|| format!("Failed to save frame to: {}", path.display()))?;
        Ok(path)
    }

    pub fn save_detection(
        &self,
        ctx: &FrameContext,
        detection: &StarDetectionResult,
    ) -> Result<PathBuf> {
        let dir = self.ensure_attempt_dir(ctx.attempt)?;
        let path = dir.join(format!("{:02}_detection.json", ctx.image_index));
        let json = serde_json::to_string_pretty(detection)
            .context("Failed to serialize detection result")?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write detection result: {}", path.display()))?;
        Ok(path)
    }

    /// Annotated PNG of the detected stars, skipped when disabled
    pub fn save_annotated(
        &self,
        ctx: &FrameContext,
        image: &PreparedImage,
        detection: &StarDetectionResult,
    ) -> Result<Option<PathBuf>> {
        if !self.save_annotated {
            return Ok(None);
        }
        let dir = self.ensure_attempt_dir(ctx.attempt)?;
        let path = dir.join(format!("{:02}_annotated.png", ctx.image_index));
        save_annotated_image(image, detection, &path)?;
        Ok(Some(path))
    }

    fn ensure_attempt_dir(&self, attempt: u32) -> Result<PathBuf> {
        let dir = self.attempt_dir(attempt);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::star_detection::{NoiseEstimate, StarDetectorMetrics};

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "hocus-focus-{}-{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_frame_and_detection_written() {
        let root = scratch_dir("artifacts");
        let writer = ArtifactWriter::new(&root, false);
        let ctx = FrameContext {
            attempt: 1,
            image_index: 3,
            position: 10400,
        };

        let raw = RawImage::new(4, 4, 12, vec![100; 16]).unwrap();
        let frame = writer.save_frame(&ctx, &raw, 2.346).unwrap();
        assert_eq!(
            frame.file_name().unwrap().to_string_lossy(),
            "03_Focuser10400_HFR2.35.png"
        );
        assert!(frame.starts_with(root.join("attempt01")));
        let reloaded = image::open(&frame).unwrap().into_luma16();
        assert_eq!(reloaded.get_pixel(0, 0).0[0], 1600);

        let detection = StarDetectionResult {
            stars: Vec::new(),
            metrics: StarDetectorMetrics::default(),
            noise: NoiseEstimate {
                sigma: 0.001,
                background_mean: 0.1,
            },
            threshold: 0.004,
        };
        let json_path = writer.save_detection(&ctx, &detection).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(json_path).unwrap()).unwrap();
        assert_eq!(json["metrics"]["candidates"], 0);

        std::fs::remove_dir_all(&root).unwrap();
    }
}
