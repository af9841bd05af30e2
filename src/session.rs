//! Sensor capture session: one validated frame per call, or a terminal failure.
//!
//! A session owns everything one sensor needs to produce a frame: the device handle
//! (opened lazily, replaced after faults), the capture pipeline, the exposure state and
//! the quality gate. [`CaptureSession::run`] walks
//!
//! ```text
//! Idle -> Exposing -> Validating -> Accepted
//!            |   ^         |
//!            |   |         +-> (rejected) -> Exposing
//!            |   +-- AdjustingExposure <-+
//!            +-> HardwareFault -> Reinitializing -> Exposing
//!
//! any state with the budget spent -> Exhausted
//! ```
//!
//! Every pass through `Exposing` spends exactly one attempt of the combined budget,
//! whether it ends in an exposure step, a hardware fault or a quality rejection.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::calibration::{CalibrationFrame, CalibrationStore};
use crate::config::SensorSettings;
use crate::error::{AppResult, DaqError, SensorFault};
use crate::exposure::{step, ExposureAction, ExposureState};
use crate::frame::{ProcessedFrame, RawFrame, Roi};
use crate::hardware::{SensorConnector, SensorDevice, SensorSetup};
use crate::pipeline::CapturePipeline;
use crate::quality::{QualityGate, QualityVerdict};

/// Where a session currently is in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Not running
    Idle,
    /// Capturing a frame
    Exposing,
    /// Checking frame quality
    Validating,
    /// Writing a new exposure
    AdjustingExposure,
    /// A capture or device call failed
    HardwareFault,
    /// Replacing the device handle
    Reinitializing,
    /// A frame passed validation
    Accepted,
    /// The attempt budget ran out
    Exhausted,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Exposing => "exposing",
            SessionPhase::Validating => "validating",
            SessionPhase::AdjustingExposure => "adjusting_exposure",
            SessionPhase::HardwareFault => "hardware_fault",
            SessionPhase::Reinitializing => "reinitializing",
            SessionPhase::Accepted => "accepted",
            SessionPhase::Exhausted => "exhausted",
        };
        f.write_str(name)
    }
}

/// Counters for one session run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    /// Attempts spent (exposures, faults and rejections together)
    pub attempts: u32,
    /// Exposure steps taken
    pub exposure_adjustments: u32,
    /// Capture or device-setting failures
    pub hardware_faults: u32,
    /// Device handles rebuilt after faults
    pub reinitializations: u32,
    /// Frames the quality gate refused
    pub quality_rejections: u32,
    /// Exposure of the last capture attempt
    pub final_exposure_ms: u64,
}

/// Terminal result of [`CaptureSession::run`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// A frame passed validation.
    Accepted {
        /// The validated frame
        frame: ProcessedFrame,
        /// Counters for the run
        report: SessionReport,
    },
    /// The attempt budget ran out.
    Exhausted {
        /// Counters for the run
        report: SessionReport,
    },
}

impl SessionOutcome {
    /// Counters, whatever the outcome.
    pub fn report(&self) -> &SessionReport {
        match self {
            SessionOutcome::Accepted { report, .. } | SessionOutcome::Exhausted { report } => {
                report
            }
        }
    }

    /// Whether a frame was accepted.
    pub fn is_accepted(&self) -> bool {
        matches!(self, SessionOutcome::Accepted { .. })
    }
}

/// Capture session for one sensor.
pub struct CaptureSession {
    tag: String,
    connector: Box<dyn SensorConnector>,
    device: Option<Box<dyn SensorDevice>>,
    pipeline: CapturePipeline,
    exposure: ExposureState,
    reference_channel: Option<usize>,
    gate: QualityGate,
    max_attempts: u32,
    pre_capture_delay: Duration,
    capture_timeout: Option<Duration>,
    readout: Option<Roi>,
    reset_ms: Option<u64>,
    phase: SessionPhase,
}

impl CaptureSession {
    /// Build a session from its settings, an explicit connector and dark frame.
    pub fn new(
        settings: &SensorSettings,
        connector: Box<dyn SensorConnector>,
        calibration: Option<Arc<CalibrationFrame>>,
    ) -> Self {
        Self {
            tag: settings.tag.clone(),
            connector,
            device: None,
            pipeline: CapturePipeline::new(
                settings.tag.clone(),
                settings.kind,
                settings.crop,
                calibration,
            ),
            exposure: settings.exposure_state(),
            reference_channel: settings.reference_channel(),
            gate: QualityGate::new(settings.min_snr),
            max_attempts: settings.max_attempts,
            pre_capture_delay: settings.pre_capture_delay,
            capture_timeout: settings.capture_timeout,
            readout: settings.readout,
            reset_ms: settings.exposure.reset_ms,
            phase: SessionPhase::Idle,
        }
    }

    /// Build a session using the configured driver and the store's dark frame.
    pub fn from_settings(settings: &SensorSettings, calibration: &CalibrationStore) -> Self {
        Self::new(
            settings,
            settings.driver.connector(),
            calibration.get(&settings.tag),
        )
    }

    /// Sensor tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Current state machine phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Current exposure state.
    pub fn exposure(&self) -> &ExposureState {
        &self.exposure
    }

    /// Produce one validated frame for `sample`, or report exhaustion.
    ///
    /// Hardware faults, exposure steps and quality rejections are retried within the
    /// attempt budget. Configuration faults from the pipeline are returned as errors.
    pub async fn run(&mut self, sample: &str) -> AppResult<SessionOutcome> {
        self.exposure.begin_session(self.max_attempts);
        let mut report = SessionReport::default();

        loop {
            if self.exposure.attempts_remaining() == 0 {
                self.phase = SessionPhase::Exhausted;
                report.final_exposure_ms = self.exposure.current_ms();
                warn!(
                    sensor = %self.tag,
                    sample,
                    attempts = report.attempts,
                    exposure_ms = report.final_exposure_ms,
                    "session exhausted"
                );
                return Ok(SessionOutcome::Exhausted { report });
            }

            report.attempts += 1;
            let attempt = report.attempts;
            self.phase = SessionPhase::Exposing;
            let exposure_ms = self.exposure.current_ms();

            let raw = match self.capture().await {
                Ok(raw) => raw,
                Err(fault) => {
                    self.exposure.consume_attempt();
                    report.hardware_faults += 1;
                    warn!(
                        sensor = %self.tag,
                        sample,
                        attempt,
                        exposure_ms,
                        error = %fault,
                        "hardware fault, reinitializing"
                    );
                    self.reinitialize(&mut report).await;
                    continue;
                }
            };

            let frame = self.pipeline.process(raw)?;
            let peak = self.metered_peak(&frame)?;
            let (next, action) = step(self.exposure.clone(), peak);
            self.exposure = next;

            match action {
                ExposureAction::Adjust {
                    from_ms,
                    to_ms,
                    peak,
                } => {
                    self.phase = SessionPhase::AdjustingExposure;
                    report.exposure_adjustments += 1;
                    info!(
                        sensor = %self.tag,
                        sample,
                        attempt,
                        peak,
                        from_ms,
                        to_ms,
                        "exposure adjusted"
                    );
                    if let Err(fault) = self.apply_exposure(to_ms).await {
                        report.hardware_faults += 1;
                        warn!(
                            sensor = %self.tag,
                            sample,
                            attempt,
                            exposure_ms = to_ms,
                            error = %fault,
                            "hardware fault, reinitializing"
                        );
                        self.reinitialize(&mut report).await;
                    }
                    continue;
                }
                ExposureAction::Exhausted { exposure_ms, peak } => {
                    debug!(
                        sensor = %self.tag,
                        sample,
                        attempt,
                        exposure_ms,
                        peak,
                        "exposure did not reach the target band"
                    );
                    continue;
                }
                ExposureAction::Converged { .. } => {}
            }

            self.phase = SessionPhase::Validating;
            match self.gate.evaluate(&frame) {
                QualityVerdict::Accepted { snr } => {
                    self.phase = SessionPhase::Accepted;
                    report.final_exposure_ms = frame.exposure_ms();
                    let stats = frame.stats();
                    info!(
                        sensor = %self.tag,
                        sample,
                        attempt,
                        exposure_ms = frame.exposure_ms(),
                        shape = ?stats.shape,
                        max = stats.max,
                        min = stats.min,
                        mean = stats.mean,
                        snr,
                        "frame accepted"
                    );
                    return Ok(SessionOutcome::Accepted { frame, report });
                }
                QualityVerdict::Rejected { snr, min_snr } => {
                    report.quality_rejections += 1;
                    warn!(
                        sensor = %self.tag,
                        sample,
                        attempt,
                        exposure_ms = frame.exposure_ms(),
                        snr,
                        min_snr,
                        "quality gate rejected frame"
                    );
                }
            }
        }
    }

    /// Restore the configured starting exposure after an accepted sample.
    ///
    /// Sensors without a reset value keep whatever exposure their last search ended on.
    /// Returns the exposure the next session starts from.
    pub async fn reset_exposure(&mut self) -> u64 {
        let Some(reset_ms) = self.reset_ms else {
            return self.exposure.current_ms();
        };
        self.exposure.reset_to(reset_ms);
        let exposure_ms = self.exposure.current_ms();
        if let Err(fault) = self.apply_exposure(exposure_ms).await {
            // The next capture reopens the handle at the reset exposure.
            warn!(sensor = %self.tag, error = %fault, "exposure reset failed, dropping handle");
            self.drop_device().await;
        }
        debug!(sensor = %self.tag, exposure_ms, "exposure reset");
        exposure_ms
    }

    /// Close the device handle, if one is open.
    pub async fn shutdown(&mut self) {
        self.drop_device().await;
        self.phase = SessionPhase::Idle;
    }

    fn metered_peak(&self, frame: &ProcessedFrame) -> AppResult<Option<f64>> {
        match self.reference_channel {
            None => Ok(None),
            Some(channel) => frame.peak(channel).map(Some).ok_or_else(|| {
                DaqError::Configuration(format!(
                    "reference channel {channel} missing on sensor '{}' ({} channels)",
                    self.tag,
                    frame.dim().0
                ))
            }),
        }
    }

    fn setup(&self) -> SensorSetup {
        SensorSetup {
            exposure_ms: self.exposure.current_ms(),
            readout: self.readout,
        }
    }

    async fn capture(&mut self) -> Result<RawFrame, SensorFault> {
        if !self.pre_capture_delay.is_zero() {
            sleep(self.pre_capture_delay).await;
        }
        if self.device.is_none() {
            self.device = Some(self.connect().await?);
        }
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| SensorFault::Connect("no open handle".into()))?;

        match self.capture_timeout {
            Some(limit) => timeout(limit, device.capture_raw())
                .await
                .map_err(|_| SensorFault::Timeout(limit))?,
            None => device.capture_raw().await,
        }
    }

    async fn apply_exposure(&mut self, exposure_ms: u64) -> Result<(), SensorFault> {
        match self.device.as_mut() {
            Some(device) => device.set_exposure(exposure_ms).await,
            // Applied on connect.
            None => Ok(()),
        }
    }

    async fn connect(&self) -> Result<Box<dyn SensorDevice>, SensorFault> {
        let mut device = self.connector.connect().await?;
        if let Err(fault) = device.configure(&self.setup()).await {
            if let Err(close_fault) = device.close().await {
                debug!(sensor = %self.tag, error = %close_fault, "close after failed configure");
            }
            return Err(fault);
        }
        Ok(device)
    }

    async fn drop_device(&mut self) {
        if let Some(mut device) = self.device.take() {
            if let Err(fault) = device.close().await {
                debug!(sensor = %self.tag, error = %fault, "close failed, discarding handle");
            }
        }
    }

    async fn reinitialize(&mut self, report: &mut SessionReport) {
        self.phase = SessionPhase::HardwareFault;
        self.drop_device().await;

        self.phase = SessionPhase::Reinitializing;
        report.reinitializations += 1;
        match self.connect().await {
            Ok(device) => {
                self.device = Some(device);
                info!(
                    sensor = %self.tag,
                    exposure_ms = self.exposure.current_ms(),
                    "sensor reinitialized"
                );
            }
            Err(fault) => {
                warn!(sensor = %self.tag, error = %fault, "reinitialization failed");
            }
        }
    }
}

impl fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureSession")
            .field("tag", &self.tag)
            .field("phase", &self.phase)
            .field("exposure", &self.exposure)
            .field("connected", &self.device.is_some())
            .finish_non_exhaustive()
    }
}
