/// Simulated equipment
///
/// The camera renders a fixed random star field whose blur follows the
/// focuser's distance from best focus, so a full autofocus run can be
/// exercised without hardware.
use async_trait::async_trait;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::devices::{
    Camera, CaptureParams, DeviceError, DeviceResult, FilterWheel, Focuser, FocuserStatus, Guider,
    ProgressSink,
};
use crate::engine::Equipment;
use crate::image_analysis::{ImageMetadata, RawImage};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub width: usize,
    pub height: usize,
    pub star_count: usize,
    /// Focuser position with the sharpest stars
    pub best_focus: i32,
    pub start_position: i32,
    /// Gaussian sigma in pixels at best focus
    pub min_sigma: f64,
    /// Sigma growth per focuser step away from best focus
    pub sigma_per_step: f64,
    /// Normalized sky level
    pub background: f64,
    /// Peak of the brightest star at best focus, normalized
    pub peak: f64,
    /// Amplitude of uniform per-pixel noise, normalized
    pub noise: f64,
    pub seed: u64,
    pub move_delay_ms: u64,
    pub temperature: f64,
    pub filters: Vec<String>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            star_count: 25,
            best_focus: 10_500,
            start_position: 10_000,
            min_sigma: 1.8,
            sigma_per_step: 0.01,
            background: 0.05,
            peak: 0.5,
            noise: 0.004,
            seed: 42,
            move_delay_ms: 0,
            temperature: 8.0,
            filters: vec!["L".into(), "R".into(), "G".into(), "B".into(), "Ha".into()],
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug)]
struct FocuserState {
    position: i32,
    temp_comp: bool,
}

pub struct SimFocuser {
    state: Mutex<FocuserState>,
    move_delay: Duration,
    temperature: f64,
}

impl SimFocuser {
    pub fn new(config: &SimulatorConfig) -> Self {
        Self {
            state: Mutex::new(FocuserState {
                position: config.start_position,
                temp_comp: true,
            }),
            move_delay: Duration::from_millis(config.move_delay_ms),
            temperature: config.temperature,
        }
    }

    pub fn position(&self) -> i32 {
        lock(&self.state).position
    }

    pub fn temp_comp_enabled(&self) -> bool {
        lock(&self.state).temp_comp
    }
}

#[async_trait]
impl Focuser for SimFocuser {
    async fn move_to(&self, position: i32, token: &CancelToken) -> DeviceResult<()> {
        if !self.move_delay.is_zero() {
            token
                .run_until_cancelled(tokio::time::sleep(self.move_delay))
                .await
                .ok_or(DeviceError::Cancelled)?;
        }
        lock(&self.state).position = position;
        Ok(())
    }

    async fn status(&self) -> DeviceResult<FocuserStatus> {
        let state = lock(&self.state);
        Ok(FocuserStatus {
            position: state.position,
            temperature: Some(self.temperature),
            temp_comp_available: true,
            temp_comp_enabled: state.temp_comp,
        })
    }

    async fn set_temp_comp(&self, enabled: bool) -> DeviceResult<()> {
        lock(&self.state).temp_comp = enabled;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct SimStar {
    x: f64,
    y: f64,
    /// Peak relative to the brightest star
    brightness: f64,
}

pub struct SimCamera {
    focuser: Arc<SimFocuser>,
    config: SimulatorConfig,
    stars: Vec<SimStar>,
    frames: AtomicU64,
}

impl SimCamera {
    pub fn new(config: &SimulatorConfig, focuser: Arc<SimFocuser>) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let margin = 12.0;
        let stars = (0..config.star_count)
            .map(|_| SimStar {
                x: rng.gen_range(margin..(config.width as f64 - margin).max(margin + 1.0)),
                y: rng.gen_range(margin..(config.height as f64 - margin).max(margin + 1.0)),
                brightness: rng.gen_range(0.4..1.0),
            })
            .collect();
        Self {
            focuser,
            config: config.clone(),
            stars,
            frames: AtomicU64::new(0),
        }
    }

    /// Star sigma in pixels at `position`
    pub fn sigma_at(&self, position: i32) -> f64 {
        let defocus = (position - self.config.best_focus) as f64 * self.config.sigma_per_step;
        self.config.min_sigma.hypot(defocus)
    }

    /// Render one 16-bit frame of the region `(x, y, width, height)`.
    /// Total star flux is independent of focus, so defocused stars are dimmer.
    pub fn render(&self, position: i32, region: (usize, usize, usize, usize), seed: u64) -> Vec<u16> {
        let (x0, y0, width, height) = region;
        let sigma = self.sigma_at(position);
        let flux_scale = (self.config.min_sigma / sigma).powi(2);
        let mut pixels = vec![self.config.background; width * height];

        let reach = (5.0 * sigma).ceil();
        for star in &self.stars {
            let amplitude = self.config.peak * star.brightness * flux_scale;
            let sx = star.x - x0 as f64;
            let sy = star.y - y0 as f64;
            let min_x = (sx - reach).max(0.0) as usize;
            let max_x = ((sx + reach).max(0.0) as usize).min(width.saturating_sub(1));
            let min_y = (sy - reach).max(0.0) as usize;
            let max_y = ((sy + reach).max(0.0) as usize).min(height.saturating_sub(1));
            if sx + reach < 0.0 || sy + reach < 0.0 || min_x > max_x || min_y > max_y {
                continue;
            }
            for y in min_y..=max_y {
                for x in min_x..=max_x {
                    let r2 = (x as f64 - sx).powi(2) + (y as f64 - sy).powi(2);
                    pixels[y * width + x] += amplitude * (-r2 / (2.0 * sigma * sigma)).exp();
                }
            }
        }

        let mut rng = StdRng::seed_from_u64(seed);
        pixels
            .into_iter()
            .map(|v| {
                let noisy = if self.config.noise > 0.0 {
                    v + (rng.gen::<f64>() - 0.5) * 2.0 * self.config.noise
                } else {
                    v
                };
                (noisy.clamp(0.0, 1.0) * 65535.0).round() as u16
            })
            .collect()
    }
}

#[async_trait]
impl Camera for SimCamera {
    async fn capture(
        &self,
        params: &CaptureParams,
        token: &CancelToken,
    ) -> DeviceResult<Option<RawImage>> {
        if token.is_cancelled() {
            return Err(DeviceError::Cancelled);
        }
        let region = match params.sub_sample {
            Some(rect) => {
                let (x, y) = (rect.x as usize, rect.y as usize);
                let (w, h) = (rect.width as usize, rect.height as usize);
                if w == 0 || h == 0 || x + w > self.config.width || y + h > self.config.height {
                    return Err(DeviceError::SubSampleRejected(format!(
                        "{}x{} at ({}, {}) exceeds the sensor",
                        w, h, x, y
                    )));
                }
                (x, y, w, h)
            }
            None => (0, 0, self.config.width, self.config.height),
        };

        let position = self.focuser.position();
        let frame = self.frames.fetch_add(1, Ordering::SeqCst);
        let data = self.render(position, region, self.config.seed.wrapping_add(frame + 1));
        tracing::debug!(
            "Simulated frame {} at position {} (sigma {:.2})",
            frame,
            position,
            self.sigma_at(position)
        );

        let raw = RawImage::new(region.2, region.3, 16, data)
            .map_err(|e| DeviceError::Other(e.to_string()))?
            .with_metadata(ImageMetadata {
                focuser_position: Some(position),
                exposure_time: Some(params.exposure_time_secs),
                filter: params.filter.clone(),
                temperature: Some(self.focuser.temperature),
                bayer_pattern: None,
            });
        Ok(Some(raw))
    }

    async fn sensor_size(&self) -> DeviceResult<(u32, u32)> {
        Ok((self.config.width as u32, self.config.height as u32))
    }
}

pub struct SimFilterWheel {
    filters: Vec<String>,
    current: Mutex<Option<String>>,
}

impl SimFilterWheel {
    pub fn new(filters: Vec<String>) -> Self {
        let current = filters.first().cloned();
        Self {
            filters,
            current: Mutex::new(current),
        }
    }
}

#[async_trait]
impl FilterWheel for SimFilterWheel {
    async fn change_filter(&self, filter: &str, _token: &CancelToken) -> DeviceResult<String> {
        let name = self
            .filters
            .iter()
            .find(|f| f.eq_ignore_ascii_case(filter))
            .cloned()
            .ok_or_else(|| DeviceError::Other(format!("Unknown filter: {}", filter)))?;
        *lock(&self.current) = Some(name.clone());
        Ok(name)
    }

    async fn current_filter(&self) -> DeviceResult<Option<String>> {
        Ok(lock(&self.current).clone())
    }
}

#[derive(Debug, Default)]
pub struct SimGuider {
    guiding: Mutex<bool>,
}

impl SimGuider {
    pub fn new(guiding: bool) -> Self {
        Self {
            guiding: Mutex::new(guiding),
        }
    }

    pub fn is_guiding(&self) -> bool {
        *lock(&self.guiding)
    }
}

#[async_trait]
impl Guider for SimGuider {
    async fn stop_guiding(&self, _token: &CancelToken) -> DeviceResult<bool> {
        let mut guiding = lock(&self.guiding);
        let was_guiding = *guiding;
        *guiding = false;
        Ok(was_guiding)
    }

    async fn start_guiding(&self, _token: &CancelToken) -> DeviceResult<bool> {
        *lock(&self.guiding) = true;
        Ok(true)
    }
}

/// A complete simulated rig
pub struct Simulator {
    pub focuser: Arc<SimFocuser>,
    pub camera: Arc<SimCamera>,
    pub filter_wheel: Arc<SimFilterWheel>,
    pub guider: Arc<SimGuider>,
}

impl Simulator {
    pub fn new(config: &SimulatorConfig) -> Self {
        let focuser = Arc::new(SimFocuser::new(config));
        let camera = Arc::new(SimCamera::new(config, Arc::clone(&focuser)));
        Self {
            focuser,
            camera,
            filter_wheel: Arc::new(SimFilterWheel::new(config.filters.clone())),
            guider: Arc::new(SimGuider::new(true)),
        }
    }

    pub fn equipment(&self, progress: Arc<dyn ProgressSink>) -> Equipment {
        Equipment {
            focuser: self.focuser.clone(),
            camera: self.camera.clone(),
            filter_wheel: Some(self.filter_wheel.clone()),
            guider: Some(self.guider.clone()),
            progress,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::SubSampleRect;

    fn params() -> CaptureParams {
        CaptureParams {
            exposure_time_secs: 2.0,
            binning: 1,
            gain: None,
            offset: None,
            filter: Some("L".into()),
            sub_sample: None,
        }
    }

    fn config() -> SimulatorConfig {
        SimulatorConfig {
            width: 96,
            height: 64,
            star_count: 3,
            noise: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_stars_blur_away_from_focus() {
        let config = config();
        let sim = Simulator::new(&config);
        assert!((sim.camera.sigma_at(config.best_focus) - config.min_sigma).abs() < 1e-12);
        assert!(sim.camera.sigma_at(config.best_focus + 300) > 3.0);
        assert_eq!(
            sim.camera.sigma_at(config.best_focus - 200),
            sim.camera.sigma_at(config.best_focus + 200)
        );

        let full = (0, 0, config.width, config.height);
        let sharp = sim.camera.render(config.best_focus, full, 1);
        let blurred = sim.camera.render(config.best_focus + 400, full, 1);
        let peak = |data: &[u16]| data.iter().copied().max().unwrap();
        assert!(peak(&sharp) > peak(&blurred));
        let floor = (config.background * 65535.0).round() as u16;
        assert!(sharp.iter().all(|&v| v >= floor));
    }

    #[tokio::test]
    async fn test_capture_tracks_focuser() {
        let sim = Simulator::new(&config());
        let token = CancelToken::new();
        sim.focuser.move_to(10_250, &token).await.unwrap();
        let raw = sim.camera.capture(&params(), &token).await.unwrap().unwrap();
        assert_eq!(raw.metadata.focuser_position, Some(10_250));
        assert_eq!(raw.metadata.filter.as_deref(), Some("L"));
        assert_eq!((raw.width, raw.height), (96, 64));
    }

    #[tokio::test]
    async fn test_sub_sample() {
        let sim = Simulator::new(&config());
        let token = CancelToken::new();
        let mut params = params();
        params.sub_sample = Some(SubSampleRect::centered(96, 64, 0.5));
        let raw = sim.camera.capture(&params, &token).await.unwrap().unwrap();
        assert_eq!((raw.width, raw.height), (48, 32));

        params.sub_sample = Some(SubSampleRect {
            x: 90,
            y: 0,
            width: 20,
            height: 20,
        });
        assert!(matches!(
            sim.camera.capture(&params, &token).await,
            Err(DeviceError::SubSampleRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_filter_wheel_and_guider() {
        let sim = Simulator::new(&config());
        let token = CancelToken::new();
        assert_eq!(sim.filter_wheel.current_filter().await.unwrap().as_deref(), Some("L"));
        assert_eq!(sim.filter_wheel.change_filter("ha", &token).await.unwrap(), "Ha");
        assert!(sim.filter_wheel.change_filter("OIII", &token).await.is_err());

        assert!(sim.guider.stop_guiding(&token).await.unwrap());
        assert!(!sim.guider.is_guiding());
        assert!(!sim.guider.stop_guiding(&token).await.unwrap());
        assert!(sim.guider.start_guiding(&token).await.unwrap());
    }

    #[tokio::test]
    async fn test_temp_comp_toggle() {
        let sim = Simulator::new(&config());
        assert!(sim.focuser.status().await.unwrap().temp_comp_enabled);
        sim.focuser.set_temp_comp(false).await.unwrap();
        assert!(!sim.focuser.temp_comp_enabled());
    }
}
