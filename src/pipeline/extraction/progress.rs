//! Live progress for a pipeline run.
//!
//! Events for one run are emitted in stage order and with non-decreasing
//! percent. Reporters are fire-and-forget: a closed channel never fails a run.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressStage {
    Starting,
    Direct,
    Rendering,
    Preprocessing,
    LocalOcr,
    CloudOcr,
    Fallback,
    Complete,
    Failed,
}

impl ProgressStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Direct => "direct",
            Self::Rendering => "rendering",
            Self::Preprocessing => "preprocessing",
            Self::LocalOcr => "local-ocr",
            Self::CloudOcr => "cloud-ocr",
            Self::Fallback => "fallback",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: ProgressStage,
    pub percent: u8,
    pub message: String,
    pub tier: u8,
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

impl<F> ProgressReporter for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn report(&self, event: ProgressEvent) {
        self(event)
    }
}

/// Forwards events into a tokio channel.
pub struct ChannelReporter(pub UnboundedSender<ProgressEvent>);

impl ProgressReporter for ChannelReporter {
    fn report(&self, event: ProgressEvent) {
        // Receiver gone means nobody is watching.
        let _ = self.0.send(event);
    }
}

/// Per-run emitter that keeps percent monotonic and mirrors events to the log.
pub(crate) struct ProgressTracker<'a> {
    reporter: Option<&'a dyn ProgressReporter>,
    last_percent: u8,
}

impl<'a> ProgressTracker<'a> {
    pub(crate) fn new(reporter: Option<&'a dyn ProgressReporter>) -> Self {
        Self {
            reporter,
            last_percent: 0,
        }
    }

    pub(crate) fn emit(&mut self, stage: ProgressStage, percent: u8, tier: u8, message: impl Into<String>) {
        let percent = percent.min(100).max(self.last_percent);
        self.last_percent = percent;
        let message = message.into();

        tracing::debug!(stage = stage.as_str(), percent, tier, message = %message, "Extraction progress");

        if let Some(reporter) = self.reporter {
            reporter.report(ProgressEvent {
                stage,
                percent,
                message,
                tier,
            });
        }
    }
}
