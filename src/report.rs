//! Acquisition records.
//!
//! Every sample ends with a [`SampleReport`] stating its outcome and, per sensor, the
//! session counters, the saved artifact and statistics of the saved frame. A run ends
//! with a [`RunSummary`] that aggregates them. Both are plain `serde` structs so a sink
//! can persist them as JSON next to the frames, which keeps each capture reproducible
//! without the logs.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::frame::FrameStats;
use crate::session::SessionReport;

/// Terminal outcome of one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleStatus {
    /// Both sensors produced a validated frame.
    Complete,
    /// The leader frame was saved; the follower failed.
    Partial,
    /// The leader never produced a validated frame; the follower was not triggered.
    Rejected,
    /// A static configuration fault stopped the sample.
    Abandoned,
}

impl fmt::Display for SampleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SampleStatus::Complete => "complete",
            SampleStatus::Partial => "partial",
            SampleStatus::Rejected => "rejected",
            SampleStatus::Abandoned => "abandoned",
        })
    }
}

/// What one sensor contributed to a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReport {
    /// Sensor tag
    pub sensor: String,
    /// Whether a frame passed validation
    pub accepted: bool,
    /// Session counters
    pub session: SessionReport,
    /// Saved frame, when accepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,
    /// Statistics of the saved frame
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<FrameStats>,
}

/// Record of one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleReport {
    /// Shared sample identifier
    pub sample: String,
    /// Terminal outcome
    pub status: SampleStatus,
    /// Leader contribution; absent only when the sample was abandoned before it finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<SensorReport>,
    /// Follower contribution; absent when the follower was never triggered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follower: Option<SensorReport>,
    /// Configuration fault that abandoned the sample
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the leader session started
    pub started_at: DateTime<Utc>,
    /// When the outcome was decided
    pub finished_at: DateTime<Utc>,
}

/// Samples per outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    /// Samples with both frames
    pub complete: usize,
    /// Samples with the leader frame only
    pub partial: usize,
    /// Samples without frames
    pub rejected: usize,
    /// Samples stopped by a configuration fault
    pub abandoned: usize,
}

impl RunCounts {
    /// Count one more sample with `status`.
    pub fn record(&mut self, status: SampleStatus) {
        match status {
            SampleStatus::Complete => self.complete += 1,
            SampleStatus::Partial => self.partial += 1,
            SampleStatus::Rejected => self.rejected += 1,
            SampleStatus::Abandoned => self.abandoned += 1,
        }
    }

    /// Samples counted.
    pub fn total(&self) -> usize {
        self.complete + self.partial + self.rejected + self.abandoned
    }
}

/// Record of one acquisition run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Unique run identifier
    pub run_id: Uuid,
    /// Version of the acquisition software
    pub software_version: String,
    /// Run start
    pub started_at: DateTime<Utc>,
    /// Run end
    pub finished_at: DateTime<Utc>,
    /// Whether a stop request ended the run before all samples were taken
    pub stopped_early: bool,
    /// Samples per outcome
    pub counts: RunCounts,
    /// Every sample, in acquisition order
    pub samples: Vec<SampleReport>,
}

impl RunSummary {
    /// Empty summary for a run starting now.
    pub fn start() -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: now,
            finished_at: now,
            stopped_early: false,
            counts: RunCounts::default(),
            samples: Vec::new(),
        }
    }

    /// Append a finished sample.
    pub fn push(&mut self, report: SampleReport) {
        self.counts.record(report.status);
        self.samples.push(report);
    }
}
