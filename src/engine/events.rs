/// Progress notifications published while a run is active
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::mpsc::UnboundedSender;

use super::AutoFocusOutcome;
use crate::measurement::MeasureAndError;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum AutoFocusEvent {
    Started {
        initial_position: i32,
        filter: Option<String>,
    },
    InitialHfrCalculated {
        measurement: MeasureAndError,
    },
    IterationStarted {
        attempt: u32,
    },
    MeasurementPointCompleted {
        attempt: u32,
        position: i32,
        measurement: MeasureAndError,
    },
    IterationFailed {
        attempt: u32,
        reason: String,
    },
    Completed {
        outcome: AutoFocusOutcome,
        initial_position: Option<i32>,
        final_position: Option<i32>,
        initial_measurement: Option<MeasureAndError>,
        final_measurement: Option<MeasureAndError>,
        duration_secs: f64,
        save_folder: Option<PathBuf>,
    },
}

/// Cloneable event publisher; a closed or missing receiver drops events
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    sender: Option<UnboundedSender<AutoFocusEvent>>,
}

impl EventSink {
    pub fn new(sender: Option<UnboundedSender<AutoFocusEvent>>) -> Self {
        Self { sender }
    }

    pub fn emit(&self, event: AutoFocusEvent) {
        if let Some(sender) = &self.sender {
            if sender.send(event).is_err() {
                tracing::trace!("Autofocus event receiver closed");
            }
        }
    }
}
