use anyhow::{Context, Result};
use bumpalo::Bump;
use fitrs::{Fits, FitsData, FitsDataArray, HeaderValue};
use serde::Serialize;
use std::path::Path;

use crate::mtf_stretch::{stretch_image, StretchParameters};

/// Acquisition context carried alongside pixel data
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImageMetadata {
    pub focuser_position: Option<i32>,
    pub exposure_time: Option<f64>,
    pub filter: Option<String>,
    pub temperature: Option<f64>,
    pub bayer_pattern: Option<String>,
}

/// Unprocessed frame as delivered by a camera or read from disk
#[derive(Debug, Clone)]
pub struct RawImage {
    pub width: usize,
    pub height: usize,
    /// Significant bits per sample; values are normalized against `2^bit_depth - 1`
    pub bit_depth: u8,
    pub data: Vec<u16>,
    pub metadata: ImageMetadata,
}

impl RawImage {
    pub fn new(width: usize, height: usize, bit_depth: u8, data: Vec<u16>) -> Result<Self> {
        if data.len() != width * height {
            anyhow::bail!(
                "Data size mismatch: expected {} pixels, got {}",
                width * height,
                data.len()
            );
        }
        if bit_depth == 0 || bit_depth > 16 {
            anyhow::bail!("Unsupported bit depth: {}", bit_depth);
        }
        Ok(Self {
            width,
            height,
            bit_depth,
            data,
            metadata: ImageMetadata::default(),
        })
    }

    pub fn with_metadata(mut self, metadata: ImageMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn max_value(&self) -> f64 {
        max_value_for_bit_depth(self.bit_depth)
    }

    /// Load a 2-D FITS image using fitrs
    pub fn from_fits(path: &Path) -> Result<Self> {
        let fits = Fits::open(path)
            .with_context(|| format!("Failed to open FITS file: {}", path.display()))?;

        let hdu = fits
            .get(0)
            .ok_or_else(|| anyhow::anyhow!("No primary HDU found in FITS file"))?;

        let naxis = header_integer(&hdu, "NAXIS")
            .ok_or_else(|| anyhow::anyhow!("Missing NAXIS header"))?;
        if naxis < 2 {
            anyhow::bail!("FITS file does not contain 2D image data (NAXIS={})", naxis);
        }
        let width = header_integer(&hdu, "NAXIS1")
            .ok_or_else(|| anyhow::anyhow!("Missing NAXIS1 header"))? as usize;
        let height = header_integer(&hdu, "NAXIS2")
            .ok_or_else(|| anyhow::anyhow!("Missing NAXIS2 header"))? as usize;
        let bitpix = header_integer(&hdu, "BITPIX")
            .ok_or_else(|| anyhow::anyhow!("Missing BITPIX header"))?;

        let metadata = ImageMetadata {
            focuser_position: header_integer(&hdu, "FOCPOS")
                .or_else(|| header_integer(&hdu, "FOCUSPOS")),
            exposure_time: header_real(&hdu, "EXPTIME").or_else(|| header_real(&hdu, "EXPOSURE")),
            filter: header_string(&hdu, "FILTER"),
            temperature: header_real(&hdu, "FOCTEMP"),
            bayer_pattern: header_string(&hdu, "BAYERPAT"),
        };

        // Signed 16-bit data is stored with BZERO=32768; shift it back to unsigned
        let data: Vec<u16> = match hdu.read_data() {
            FitsData::Characters(_) => {
                anyhow::bail!("FITS file contains character data, not image data")
            }
            FitsData::IntegersI32(FitsDataArray { data, .. }) => data
                .into_iter()
                .map(|v| v.map_or(0, |raw| (raw + 32768).clamp(0, 65535) as u16))
                .collect(),
            FitsData::IntegersU32(FitsDataArray { data, .. }) => data
                .into_iter()
                .map(|v| v.map_or(0, |raw| raw.min(65535) as u16))
                .collect(),
            FitsData::FloatingPoint32(FitsDataArray { data, .. }) => data
                .into_iter()
                .map(|v| v.clamp(0.0, 65535.0) as u16)
                .collect(),
            FitsData::FloatingPoint64(FitsDataArray { data, .. }) => data
                .into_iter()
                .map(|v| v.clamp(0.0, 65535.0) as u16)
                .collect(),
        };

        let bit_depth = if bitpix == 8 { 8 } else { 16 };
        tracing::debug!(
            "Loaded FITS {}: {}x{} BITPIX={}",
            path.display(),
            width,
            height,
            bitpix
        );
        Ok(Self::new(width, height, bit_depth, data)?.with_metadata(metadata))
    }
}

fn header_integer(hdu: &fitrs::Hdu, key: &str) -> Option<i32> {
    match hdu.value(key)? {
        HeaderValue::IntegerNumber(n) => Some(*n),
        HeaderValue::RealFloatingNumber(f) => Some(f.round() as i32),
        _ => None,
    }
}

fn header_real(hdu: &fitrs::Hdu, key: &str) -> Option<f64> {
    match hdu.value(key)? {
        HeaderValue::IntegerNumber(n) => Some(*n as f64),
        HeaderValue::RealFloatingNumber(f) => Some(*f),
        _ => None,
    }
}

fn header_string(hdu: &fitrs::Hdu, key: &str) -> Option<String> {
    match hdu.value(key)? {
        HeaderValue::CharacterString(s) => Some(s.trim().to_string()),
        _ => None,
    }
}

pub fn max_value_for_bit_depth(bit_depth: u8) -> f64 {
    ((1u32 << bit_depth.clamp(1, 16)) - 1) as f64
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageStatistics {
    pub width: usize,
    pub height: usize,
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub mad: f64,
}

impl ImageStatistics {
    pub fn calculate(data: &[u16], width: usize, height: usize) -> Self {
        if data.is_empty() {
            return Self {
                width,
                height,
                mean: 0.0,
                median: 0.0,
                std_dev: 0.0,
                min: 0.0,
                max: 0.0,
                mad: 0.0,
            };
        }

        // Scratch copy lives in an arena; frames are large and short-lived
        let arena = Bump::new();
        let mut sorted = bumpalo::vec![in &arena];
        sorted.extend_from_slice(data);
        sorted.sort_unstable();

        let sum: u64 = data.iter().map(|&x| x as u64).sum();
        let mean = sum as f64 / data.len() as f64;

        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] as f64 + sorted[mid] as f64) / 2.0
        } else {
            sorted[mid] as f64
        };

        let variance = if data.len() > 1 {
            data.iter().map(|&x| (x as f64 - mean).powi(2)).sum::<f64>()
                / (data.len() - 1) as f64
        } else {
            0.0
        };

        Self {
            width,
            height,
            mean,
            median,
            std_dev: variance.sqrt(),
            min: sorted[0] as f64,
            max: sorted[sorted.len() - 1] as f64,
            mad: mad_from_histogram(data, median),
        }
    }
}

/// Median absolute deviation, walking a 16-bit histogram outward from the
/// median until half the samples are covered
fn mad_from_histogram(data: &[u16], median: f64) -> f64 {
    let mut counts = vec![0u32; 65536];
    for &v in data {
        counts[v as usize] += 1;
    }

    let half = data.len() as f64 / 2.0;
    let mut idx_down = median.floor() as i64;
    let mut idx_up = median.ceil() as i64;
    let mut occurrences = 0u64;

    while idx_up <= 65535 || idx_down >= 0 {
        if idx_up <= 65535 {
            occurrences += counts[idx_up as usize] as u64;
        }
        if idx_down >= 0 && idx_down != idx_up {
            occurrences += counts[idx_down as usize] as u64;
        }
        if occurrences as f64 > half {
            return (idx_up as f64 - median).abs();
        }
        idx_up += 1;
        idx_down -= 1;
    }
    0.0
}

/// Collapse a one-shot-color frame to luminance, averaging each 2x2 Bayer
/// cell and writing the result back to all four sites
pub fn debayer_luminance(image: &RawImage) -> RawImage {
    let (w, h) = (image.width, image.height);
    let mut data = image.data.clone();
    for y in (0..h.saturating_sub(1)).step_by(2) {
        for x in (0..w.saturating_sub(1)).step_by(2) {
            let cell = [y * w + x, y * w + x + 1, (y + 1) * w + x, (y + 1) * w + x + 1];
            let sum: u32 = cell.iter().map(|&i| image.data[i] as u32).sum();
            let avg = ((sum + 2) / 4) as u16;
            for &i in &cell {
                data[i] = avg;
            }
        }
    }
    RawImage {
        width: w,
        height: h,
        bit_depth: image.bit_depth,
        data,
        metadata: image.metadata.clone(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct PrepareOptions {
    pub debayer: bool,
    pub auto_stretch: bool,
    pub stretch: StretchParameters,
}

/// Frame ready for analysis
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub width: usize,
    pub height: usize,
    pub bit_depth: u8,
    pub data: Vec<u16>,
    pub statistics: ImageStatistics,
    pub metadata: ImageMetadata,
    pub stretched: bool,
}

/// Debayer and optionally stretch a raw frame.
///
/// Statistics always describe the unstretched data so contrast measurements
/// stay comparable across frames.
pub fn prepare_image(raw: RawImage, options: &PrepareOptions) -> Result<PreparedImage> {
    if raw.data.len() != raw.width * raw.height || raw.data.is_empty() {
        anyhow::bail!(
            "Invalid frame: {}x{} with {} samples",
            raw.width,
            raw.height,
            raw.data.len()
        );
    }

    let raw = if options.debayer && raw.metadata.bayer_pattern.is_some() {
        debayer_luminance(&raw)
    } else {
        raw
    };

    let statistics = ImageStatistics::calculate(&raw.data, raw.width, raw.height);

    if options.auto_stretch {
        let data = stretch_image(&raw.data, &statistics, &options.stretch, raw.bit_depth);
        Ok(PreparedImage {
            width: raw.width,
            height: raw.height,
            bit_depth: 16,
            data,
            statistics,
            metadata: raw.metadata,
            stretched: true,
        })
    } else {
        Ok(PreparedImage {
            width: raw.width,
            height: raw.height,
            bit_depth: raw.bit_depth,
            data: raw.data,
            statistics,
            metadata: raw.metadata,
            stretched: false,
        })
    }
}
