/// Frame capture and measurement
///
/// Capture runs on the dispatching task and talks to the camera; analysis is
/// CPU bound and runs on a blocking worker. Analysis never fails: any error
/// becomes the failed-measurement sentinel so the point still gets counted.
pub mod analyze;
pub mod artifacts;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::devices::{Camera, CaptureParams, DeviceError, DeviceResult};
use crate::image_analysis::{prepare_image, PrepareOptions, RawImage};
use crate::measurement::MeasureAndError;
use crate::options::AutoFocusOptions;
pub use analyze::{analyzer_for, FrameAnalysis, FrameAnalyzer};
pub use artifacts::{ArtifactWriter, FrameContext};

/// Captures that return no image before giving up on the frame
pub const CAPTURE_ATTEMPTS: u32 = 3;

pub struct MeasurementPipeline {
    camera: Arc<dyn Camera>,
    analyzer: Arc<dyn FrameAnalyzer>,
    prepare: PrepareOptions,
    artifacts: Option<ArtifactWriter>,
    /// Set once the camera rejects a sub-frame; later captures use full frame
    sub_sample_disabled: AtomicBool,
}

impl MeasurementPipeline {
    pub fn new(
        camera: Arc<dyn Camera>,
        analyzer: Arc<dyn FrameAnalyzer>,
        options: &AutoFocusOptions,
        artifacts: Option<ArtifactWriter>,
    ) -> Self {
        let prepare = PrepareOptions {
            debayer: options.debayer,
            auto_stretch: options.auto_stretch && analyzer.wants_stretch(),
            ..Default::default()
        };
        Self {
            camera,
            analyzer,
            prepare,
            artifacts,
            sub_sample_disabled: AtomicBool::new(false),
        }
    }

    pub fn artifacts(&self) -> Option<&ArtifactWriter> {
        self.artifacts.as_ref()
    }

    /// Take one exposure, retrying when the camera returns nothing. A
    /// rejected sub-frame is retried at full frame and sub-framing stays off
    /// for the rest of the run. `Ok(None)` once the attempts are used up.
    pub async fn capture(
        &self,
        params: &CaptureParams,
        token: &CancelToken,
    ) -> DeviceResult<Option<RawImage>> {
        let mut params = params.clone();
        if self.sub_sample_disabled.load(Ordering::Relaxed) {
            params.sub_sample = None;
        }
        let mut attempts = 0;

        while attempts < CAPTURE_ATTEMPTS {
            if token.is_cancelled() {
                return Err(DeviceError::Cancelled);
            }
            let result = token
                .run_until_cancelled(self.camera.capture(&params, token))
                .await
                .ok_or(DeviceError::Cancelled)?;

            match result {
                Ok(Some(image)) => return Ok(Some(image)),
                Ok(None) => {
                    attempts += 1;
                    tracing::warn!(
                        "Camera returned no image (attempt {}/{})",
                        attempts,
                        CAPTURE_ATTEMPTS
                    );
                }
                Err(DeviceError::SubSampleRejected(reason)) if params.sub_sample.is_some() => {
                    tracing::warn!(
                        "Sub-frame rejected ({}), using full frame for the rest of the run",
                        reason
                    );
                    self.sub_sample_disabled.store(true, Ordering::Relaxed);
                    params.sub_sample = None;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Prepare and analyze one frame, saving artifacts when configured.
    /// Blocking; call from a worker thread.
    pub fn analyze_frame(&self, raw: RawImage, ctx: &FrameContext) -> MeasureAndError {
        let saved_raw = self.artifacts.as_ref().map(|_| raw.clone());

        let prepared = match prepare_image(raw, &self.prepare) {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::error!("Failed to prepare frame {}: {:#}", ctx.image_index, e);
                return MeasureAndError::failed();
            }
        };
        let analysis = match self.analyzer.analyze(&prepared) {
            Ok(analysis) => analysis,
            Err(e) => {
                tracing::error!("Failed to analyze frame {}: {:#}", ctx.image_index, e);
                FrameAnalysis::failed()
            }
        };

        if let (Some(writer), Some(raw)) = (&self.artifacts, saved_raw) {
            if let Err(e) = writer.save_frame(ctx, &raw, analysis.measurement.measure) {
                tracing::warn!("{:#}", e);
            }
            if let Some(detection) = &analysis.detection {
                if let Err(e) = writer.save_detection(ctx, detection) {
                    tracing::warn!("{:#}", e);
                }
                if let Err(e) = writer.save_annotated(ctx, &prepared, detection) {
                    tracing::warn!("{:#}", e);
                }
            }
        }

        analysis.measurement
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::SubSampleRect;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Camera that plays back a fixed list of responses
    struct ScriptedCamera {
        responses: Mutex<Vec<DeviceResult<Option<RawImage>>>>,
        requests: Mutex<Vec<CaptureParams>>,
    }

    impl ScriptedCamera {
        fn new(mut responses: Vec<DeviceResult<Option<RawImage>>>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Camera for ScriptedCamera {
        async fn capture(
            &self,
            params: &CaptureParams,
            _token: &CancelToken,
        ) -> DeviceResult<Option<RawImage>> {
            self.requests.lock().unwrap().push(params.clone());
            self.responses.lock().unwrap().pop().unwrap_or(Ok(None))
        }

        async fn sensor_size(&self) -> DeviceResult<(u32, u32)> {
            Ok((8, 8))
        }
    }

    struct ConstantAnalyzer(f64);

    impl FrameAnalyzer for ConstantAnalyzer {
        fn analyze(&self, _image: &crate::image_analysis::PreparedImage) -> Result<FrameAnalysis> {
            if self.0 < 0.0 {
                anyhow::bail!("analysis blew up");
            }
            Ok(FrameAnalysis {
                measurement: MeasureAndError::new(self.0, 0.1),
                detection: None,
            })
        }
    }

    fn frame() -> RawImage {
        RawImage::new(8, 8, 16, vec![1000; 64]).unwrap()
    }

    fn params(sub_sample: Option<SubSampleRect>) -> CaptureParams {
        CaptureParams {
            exposure_time_secs: 1.0,
            binning: 1,
            gain: None,
            offset: None,
            filter: None,
            sub_sample,
        }
    }

    fn pipeline(camera: Arc<ScriptedCamera>, value: f64) -> MeasurementPipeline {
        MeasurementPipeline::new(
            camera,
            Arc::new(ConstantAnalyzer(value)),
            &AutoFocusOptions::default(),
            None,
        )
    }

    #[tokio::test]
    async fn test_capture_retries_empty_frames() {
        let camera = Arc::new(ScriptedCamera::new(vec![Ok(None), Ok(None), Ok(Some(frame()))]));
        let pipeline = pipeline(camera.clone(), 2.0);
        let image = pipeline
            .capture(&params(None), &CancelToken::new())
            .await
            .unwrap();
        assert!(image.is_some());
        assert_eq!(camera.requests.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_capture_gives_up_after_three_attempts() {
        let camera = Arc::new(ScriptedCamera::new(vec![
            Ok(None),
            Ok(None),
            Ok(None),
            Ok(Some(frame())),
        ]));
        let pipeline = pipeline(camera.clone(), 2.0);
        let image = pipeline
            .capture(&params(None), &CancelToken::new())
            .await
            .unwrap();
        assert!(image.is_none());
        assert_eq!(camera.requests.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_rejected_sub_frame_falls_back_to_full_frame() {
        let camera = Arc::new(ScriptedCamera::new(vec![
            Err(DeviceError::SubSampleRejected("unsupported".into())),
            Ok(Some(frame())),
        ]));
        let pipeline = pipeline(camera.clone(), 2.0);
        let roi = SubSampleRect::centered(8, 8, 0.5);
        let image = pipeline
            .capture(&params(Some(roi)), &CancelToken::new())
            .await
            .unwrap();
        assert!(image.is_some());

        let requests = camera.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].sub_sample, Some(roi));
        assert_eq!(requests[1].sub_sample, None);
    }

    #[tokio::test]
    async fn test_sub_frame_stays_off_after_rejection() {
        let camera = Arc::new(ScriptedCamera::new(vec![
            Err(DeviceError::SubSampleRejected("unsupported".into())),
            Ok(Some(frame())),
            Ok(Some(frame())),
            Ok(Some(frame())),
        ]));
        let pipeline = pipeline(camera.clone(), 2.0);
        let roi = SubSampleRect::centered(8, 8, 0.5);
        let token = CancelToken::new();
        for _ in 0..3 {
            let image = pipeline.capture(&params(Some(roi)), &token).await.unwrap();
            assert!(image.is_some());
        }

        let requests = camera.requests.lock().unwrap();
        assert_eq!(requests.len(), 4);
        let roi_requests = requests.iter().filter(|r| r.sub_sample.is_some()).count();
        assert_eq!(roi_requests, 1);
    }

    #[tokio::test]
    async fn test_capture_honors_cancellation() {
        let camera = Arc::new(ScriptedCamera::new(vec![Ok(Some(frame()))]));
        let pipeline = pipeline(camera, 2.0);
        let token = CancelToken::new();
        token.cancel();
        let result = pipeline.capture(&params(None), &token).await;
        assert!(matches!(result, Err(DeviceError::Cancelled)));
    }

    #[test]
    fn test_analysis_errors_become_sentinel() {
        let ctx = FrameContext {
            attempt: 1,
            image_index: 1,
            position: 100,
        };
        let camera = Arc::new(ScriptedCamera::new(Vec::new()));

        let good = pipeline(camera.clone(), 2.5).analyze_frame(frame(), &ctx);
        assert_eq!(good.measure, 2.5);

        let bad = pipeline(camera, -1.0).analyze_frame(frame(), &ctx);
        assert!(bad.is_failed());
        assert!(bad.stdev.is_nan());
    }
}
