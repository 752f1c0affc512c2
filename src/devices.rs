/// Equipment the autofocus engine drives
///
/// The engine only talks to hardware through these traits; drivers, network
/// bridges and the simulator implement them.
use async_trait::async_trait;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::image_analysis::RawImage;
use crate::options::SubSampleRect;

pub type DeviceResult<T> = Result<T, DeviceError>;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device not connected")]
    NotConnected,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timeout: {operation} did not complete within {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// The camera refused the requested sub-frame
    #[error("Sub-frame rejected: {0}")]
    SubSampleRejected(String),

    #[error("Operation not supported")]
    NotSupported,

    #[error("Device error: {0}")]
    Other(String),
}

impl DeviceError {
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FocuserStatus {
    pub position: i32,
    pub temperature: Option<f64>,
    pub temp_comp_available: bool,
    pub temp_comp_enabled: bool,
}

#[async_trait]
pub trait Focuser: Send + Sync {
    /// Move to an absolute position and wait until the move completes
    async fn move_to(&self, position: i32, token: &CancelToken) -> DeviceResult<()>;

    async fn status(&self) -> DeviceResult<FocuserStatus>;

    async fn set_temp_comp(&self, enabled: bool) -> DeviceResult<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureParams {
    pub exposure_time_secs: f64,
    pub binning: u16,
    pub gain: Option<i32>,
    pub offset: Option<i32>,
    pub filter: Option<String>,
    pub sub_sample: Option<SubSampleRect>,
}

#[async_trait]
pub trait Camera: Send + Sync {
    /// Take one exposure. `Ok(None)` means the camera produced no image and
    /// the capture may be retried.
    async fn capture(
        &self,
        params: &CaptureParams,
        token: &CancelToken,
    ) -> DeviceResult<Option<RawImage>>;

    /// Unbinned sensor dimensions
    async fn sensor_size(&self) -> DeviceResult<(u32, u32)>;
}

#[async_trait]
pub trait FilterWheel: Send + Sync {
    /// Select `filter` and return the name of the filter now in place
    async fn change_filter(&self, filter: &str, token: &CancelToken) -> DeviceResult<String>;

    async fn current_filter(&self) -> DeviceResult<Option<String>>;
}

#[async_trait]
pub trait Guider: Send + Sync {
    /// Returns whether guiding was running and is now stopped
    async fn stop_guiding(&self, token: &CancelToken) -> DeviceResult<bool>;

    async fn start_guiding(&self, token: &CancelToken) -> DeviceResult<bool>;
}

/// Fire-and-forget status line for a user interface
pub trait ProgressSink: Send + Sync {
    fn report(&self, status: &str);
}

/// Sink that forwards status lines to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&self, status: &str) {
        tracing::info!("{}", status);
    }
}
