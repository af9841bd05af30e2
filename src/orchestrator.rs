//! Two-phase acquisition: leader first, follower only when the leader succeeded.
//!
//! For each sample the orchestrator
//!
//! 1. runs the leader session; an exhausted leader marks the sample `Rejected` and the
//!    follower is never triggered,
//! 2. persists the leader frame and restores the leader's starting exposure,
//! 3. runs the follower session; an exhausted follower marks the sample `Partial` (the
//!    leader frame stays on disk), an accepted one is persisted and the sample is
//!    `Complete`.
//!
//! Configuration faults raised while processing frames abandon the sample and the run
//! moves on. Storage errors end the run. There are no retries at this level; every
//! retry happens inside a session's attempt budget.
//!
//! Everything is sequential: one hardware call at a time, one sample at a time. A stop
//! request is honored between samples only.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::calibration::CalibrationStore;
use crate::config::AppConfig;
use crate::error::{AppResult, DaqError};
use crate::report::{RunSummary, SampleReport, SampleStatus, SensorReport};
use crate::session::{CaptureSession, SessionOutcome, SessionReport};
use crate::storage::FrameSink;

/// Drives leader and follower sessions over a sequence of samples.
#[derive(Debug)]
pub struct Orchestrator<S: FrameSink> {
    leader: CaptureSession,
    follower: CaptureSession,
    sink: S,
    inter_sample_delay: Duration,
}

impl<S: FrameSink> Orchestrator<S> {
    /// Assemble from ready-made sessions.
    pub fn new(
        leader: CaptureSession,
        follower: CaptureSession,
        sink: S,
        inter_sample_delay: Duration,
    ) -> Self {
        Self {
            leader,
            follower,
            sink,
            inter_sample_delay,
        }
    }

    /// Build both sessions from configuration and loaded dark frames.
    pub fn from_config(config: &AppConfig, calibration: &CalibrationStore, sink: S) -> Self {
        Self::new(
            CaptureSession::from_settings(&config.leader, calibration),
            CaptureSession::from_settings(&config.follower, calibration),
            sink,
            config.acquisition.inter_sample_delay,
        )
    }

    /// Leader session.
    pub fn leader(&self) -> &CaptureSession {
        &self.leader
    }

    /// Follower session.
    pub fn follower(&self) -> &CaptureSession {
        &self.follower
    }

    /// Output sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Capture one sample with both sensors.
    ///
    /// Returns `Err` only for storage failures and other non-configuration errors.
    pub async fn acquire_sample(&mut self, sample: &str) -> AppResult<SampleReport> {
        let started_at = Utc::now();

        let leader_outcome = match self.leader.run(sample).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_configuration_fault() => {
                return Ok(abandoned(sample, started_at, None, e));
            }
            Err(e) => return Err(e),
        };

        let leader_report = match leader_outcome {
            SessionOutcome::Exhausted { report } => {
                return Ok(SampleReport {
                    sample: sample.to_string(),
                    status: SampleStatus::Rejected,
                    leader: Some(failed(self.leader.tag(), report)),
                    follower: None,
                    error: None,
                    started_at,
                    finished_at: Utc::now(),
                });
            }
            SessionOutcome::Accepted { frame, report } => {
                let artifact = self
                    .sink
                    .write_frame(sample, self.leader.tag(), &frame)
                    .await?;
                SensorReport {
                    sensor: self.leader.tag().to_string(),
                    accepted: true,
                    session: report,
                    artifact: Some(artifact),
                    stats: Some(frame.stats()),
                }
            }
        };

        // Only the leader restarts from a fixed exposure; the follower keeps its last one.
        self.leader.reset_exposure().await;

        let follower_outcome = match self.follower.run(sample).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_configuration_fault() => {
                return Ok(abandoned(sample, started_at, Some(leader_report), e));
            }
            Err(e) => return Err(e),
        };

        let (status, follower_report) = match follower_outcome {
            SessionOutcome::Exhausted { report } => {
                (SampleStatus::Partial, failed(self.follower.tag(), report))
            }
            SessionOutcome::Accepted { frame, report } => {
                let artifact = self
                    .sink
                    .write_frame(sample, self.follower.tag(), &frame)
                    .await?;
                (
                    SampleStatus::Complete,
                    SensorReport {
                        sensor: self.follower.tag().to_string(),
                        accepted: true,
                        session: report,
                        artifact: Some(artifact),
                        stats: Some(frame.stats()),
                    },
                )
            }
        };

        Ok(SampleReport {
            sample: sample.to_string(),
            status,
            leader: Some(leader_report),
            follower: Some(follower_report),
            error: None,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Acquire every sample in order until the list ends or `stop` turns true.
    ///
    /// Devices are closed and the summary handed to the sink whether or not a storage
    /// error ended the run early; the storage error is then returned.
    pub async fn run<I>(
        &mut self,
        samples: I,
        stop: &watch::Receiver<bool>,
    ) -> AppResult<RunSummary>
    where
        I: IntoIterator<Item = String>,
    {
        self.sink.init().await?;
        let mut summary = RunSummary::start();
        info!(run_id = %summary.run_id, "Acquisition run started");

        let result = self.run_samples(samples, stop, &mut summary).await;

        self.leader.shutdown().await;
        self.follower.shutdown().await;
        summary.finished_at = Utc::now();

        if let Err(e) = &result {
            error!(run_id = %summary.run_id, error = %e, "Acquisition run aborted");
        }
        self.sink.finish(&summary).await?;
        result?;

        info!(
            run_id = %summary.run_id,
            complete = summary.counts.complete,
            partial = summary.counts.partial,
            rejected = summary.counts.rejected,
            abandoned = summary.counts.abandoned,
            stopped_early = summary.stopped_early,
            "Acquisition run finished"
        );
        Ok(summary)
    }

    async fn run_samples<I>(
        &mut self,
        samples: I,
        stop: &watch::Receiver<bool>,
        summary: &mut RunSummary,
    ) -> AppResult<()>
    where
        I: IntoIterator<Item = String>,
    {
        let mut samples = samples.into_iter().peekable();
        while let Some(sample) = samples.next() {
            if *stop.borrow() {
                summary.stopped_early = true;
                info!(next = %sample, "Stop requested, ending run");
                break;
            }

            let report = self.acquire_sample(&sample).await?;
            log_outcome(&report);
            self.sink.write_report(&report).await?;
            summary.push(report);

            if samples.peek().is_some() && !self.inter_sample_delay.is_zero() {
                let mut stop = stop.clone();
                tokio::select! {
                    _ = sleep(self.inter_sample_delay) => {}
                    _ = stop_requested(&mut stop) => {}
                }
            }
        }
        Ok(())
    }
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    // Without a sender no stop can arrive.
    let closed = stop.wait_for(|stop| *stop).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

fn failed(sensor: &str, session: SessionReport) -> SensorReport {
    SensorReport {
        sensor: sensor.to_string(),
        accepted: false,
        session,
        artifact: None,
        stats: None,
    }
}

fn abandoned(
    sample: &str,
    started_at: DateTime<Utc>,
    leader: Option<SensorReport>,
    error: DaqError,
) -> SampleReport {
    SampleReport {
        sample: sample.to_string(),
        status: SampleStatus::Abandoned,
        leader,
        follower: None,
        error: Some(error.to_string()),
        started_at,
        finished_at: Utc::now(),
    }
}

fn log_outcome(report: &SampleReport) {
    let sample = report.sample.as_str();
    let counters = |sensor: Option<&SensorReport>| {
        sensor.map(|r| r.session.clone()).unwrap_or_default()
    };
    let leader = counters(report.leader.as_ref());
    let follower = counters(report.follower.as_ref());
    match report.status {
        SampleStatus::Complete => info!(
            sample,
            leader_attempts = leader.attempts,
            leader_final_exposure_ms = leader.final_exposure_ms,
            leader_exposure_adjustments = leader.exposure_adjustments,
            leader_hardware_faults = leader.hardware_faults,
            leader_reinitializations = leader.reinitializations,
            leader_quality_rejections = leader.quality_rejections,
            follower_attempts = follower.attempts,
            follower_final_exposure_ms = follower.final_exposure_ms,
            follower_exposure_adjustments = follower.exposure_adjustments,
            follower_hardware_faults = follower.hardware_faults,
            follower_reinitializations = follower.reinitializations,
            follower_quality_rejections = follower.quality_rejections,
            "sample complete"
        ),
        SampleStatus::Partial => warn!(
            sample,
            leader_attempts = leader.attempts,
            leader_final_exposure_ms = leader.final_exposure_ms,
            leader_exposure_adjustments = leader.exposure_adjustments,
            leader_hardware_faults = leader.hardware_faults,
            leader_reinitializations = leader.reinitializations,
            leader_quality_rejections = leader.quality_rejections,
            follower_attempts = follower.attempts,
            follower_final_exposure_ms = follower.final_exposure_ms,
            follower_exposure_adjustments = follower.exposure_adjustments,
            follower_hardware_faults = follower.hardware_faults,
            follower_reinitializations = follower.reinitializations,
            follower_quality_rejections = follower.quality_rejections,
            "sample partial, follower failed"
        ),
        SampleStatus::Rejected => warn!(
            sample,
            leader_attempts = leader.attempts,
            leader_final_exposure_ms = leader.final_exposure_ms,
            leader_exposure_adjustments = leader.exposure_adjustments,
            leader_hardware_faults = leader.hardware_faults,
            leader_reinitializations = leader.reinitializations,
            leader_quality_rejections = leader.quality_rejections,
            "sample rejected, follower not triggered"
        ),
        SampleStatus::Abandoned => error!(
            sample,
            leader_attempts = leader.attempts,
            follower_attempts = follower.attempts,
            error = report.error.as_deref().unwrap_or_default(),
            "sample abandoned"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SensorSettings;
    use crate::frame::Roi;
    use crate::hardware::{DriverConfig, SimulatedConnector, SimulatedProbe, SimulatedSensorConfig};
    use crate::storage::TiffFrameWriter;
    use std::sync::Arc;

    fn sessions(
        leader_sim: SimulatedSensorConfig,
    ) -> (CaptureSession, CaptureSession, Arc<SimulatedProbe>, Arc<SimulatedProbe>) {
        let mut leader = SensorSettings::leader_default();
        leader.crop = Roi::new(2, 2, 12, 12);
        leader.readout = None;

        let mut follower = SensorSettings::follower_default();
        follower.crop = Roi::new(2, 2, 8, 8);
        follower.pre_capture_delay = Duration::ZERO;

        let leader_connector = SimulatedConnector::new(leader_sim);
        let follower_connector = SimulatedConnector::new(SimulatedSensorConfig {
            channels: 4,
            height: 16,
            width: 16,
            gain: 0.5,
            ..SimulatedSensorConfig::default()
        });
        let (lp, fp) = (leader_connector.probe(), follower_connector.probe());
        (
            CaptureSession::new(&leader, Box::new(leader_connector), None),
            CaptureSession::new(&follower, Box::new(follower_connector), None),
            lp,
            fp,
        )
    }

    fn leader_sim() -> SimulatedSensorConfig {
        SimulatedSensorConfig {
            height: 20,
            width: 20,
            ..SimulatedSensorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_complete_sample_writes_both_frames() {
        let dir = tempfile::tempdir().unwrap();
        let (leader, follower, _, _) = sessions(leader_sim());
        let mut orchestrator = Orchestrator::new(
            leader,
            follower,
            TiffFrameWriter::new(dir.path(), true),
            Duration::ZERO,
        );

        let report = orchestrator.acquire_sample("scene_000").await.unwrap();
        assert_eq!(report.status, SampleStatus::Complete);
        let leader = report.leader.unwrap();
        let follower = report.follower.unwrap();
        assert!(leader.artifact.unwrap().ends_with("thorlabs/scene_000_thorlabs.tif"));
        assert!(follower.artifact.unwrap().ends_with("cubert/scene_000_cubert.tif"));
        assert_eq!(leader.stats.unwrap().shape, [5, 12, 12]);
        assert_eq!(follower.stats.unwrap().shape, [4, 8, 8]);
    }

    #[tokio::test]
    async fn test_rejected_leader_never_triggers_follower() {
        let dir = tempfile::tempdir().unwrap();
        let (leader, follower, _, follower_probe) = sessions(SimulatedSensorConfig {
            gain: 0.0,
            ..leader_sim()
        });
        let mut orchestrator = Orchestrator::new(
            leader,
            follower,
            TiffFrameWriter::new(dir.path(), true),
            Duration::ZERO,
        );

        let report = orchestrator.acquire_sample("scene_000").await.unwrap();
        assert_eq!(report.status, SampleStatus::Rejected);
        assert!(report.follower.is_none());
        assert_eq!(follower_probe.captures(), 0);
        assert_eq!(follower_probe.connects(), 0);
    }

    #[tokio::test]
    async fn test_bad_crop_abandons_sample() {
        let dir = tempfile::tempdir().unwrap();
        let (leader, follower, _, follower_probe) = sessions(SimulatedSensorConfig {
            height: 8,
            width: 8,
            ..leader_sim()
        });
        let mut orchestrator = Orchestrator::new(
            leader,
            follower,
            TiffFrameWriter::new(dir.path(), true),
            Duration::ZERO,
        );

        let report = orchestrator.acquire_sample("scene_000").await.unwrap();
        assert_eq!(report.status, SampleStatus::Abandoned);
        assert!(report.error.unwrap().contains("thorlabs"));
        assert_eq!(follower_probe.captures(), 0);
    }
}
