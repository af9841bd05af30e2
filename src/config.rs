//! Configuration System using Figment
//!
//! Strongly-typed configuration for the acquisition controller. Values are layered, lowest
//! precedence first:
//!
//! 1. built-in defaults describing the two-camera rig,
//! 2. a TOML file,
//! 3. environment variables prefixed with `SCENE_DAQ_`, nested keys separated by `__`.
//!
//! # Environment Variable Overrides
//!
//! ```text
//! SCENE_DAQ_APPLICATION__LOG_LEVEL=debug
//! SCENE_DAQ_LEADER__MAX_ATTEMPTS=20
//! SCENE_DAQ_ACQUISITION__INTER_SAMPLE_DELAY=2s
//! ```
//!
//! # Example file
//!
//! ```toml
//! [application]
//! output_dir = "captures"
//!
//! [leader]
//! calibration = "calibration/thorlabs_master_dark.npy"
//!
//! [leader.exposure.auto]
//! target_peak = 4050.0
//! tolerance = 100.0
//!
//! [follower]
//! calibration = "calibration/cubert_master_dark.npy"
//! pre_capture_delay = "500ms"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::exposure::{ExposureLimits, ExposureState, ExposureTarget, DEFAULT_ATTEMPT_BUDGET};
use crate::frame::Roi;
use crate::hardware::{DriverConfig, SimulatedSensorConfig};
use crate::pipeline::SensorKind;
use crate::quality::QualityGate;

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "SCENE_DAQ_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Run-level acquisition settings
    pub acquisition: AcquisitionConfig,
    /// Sensor that captures first and gates the follower
    pub leader: SensorSettings,
    /// Sensor captured only after the leader succeeded
    pub follower: SensorSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Directory artifacts and reports are written to
    pub output_dir: PathBuf,
}

/// Run-level acquisition settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Pause between consecutive samples, e.g. for a stimulus display to settle
    #[serde(with = "humantime_serde")]
    pub inter_sample_delay: Duration,
    /// Write `{sample}_report.json` and `run_summary.json` next to the frames
    #[serde(default = "default_write_reports")]
    pub write_reports: bool,
    /// First index of numbered samples
    #[serde(default)]
    pub first_index: usize,
}

/// Everything needed to run one sensor's capture session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSettings {
    /// Sensor name used in file names, reports and logs
    pub tag: String,
    /// Sensor family
    pub kind: SensorKind,
    /// Master dark frame (`.npy`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration: Option<PathBuf>,
    /// Region kept from every processed frame
    pub crop: Roi,
    /// Hardware readout window; full sensor when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readout: Option<Roi>,
    /// Combined budget for exposure steps, faults and rejections
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Frames need an SNR strictly above this
    #[serde(default = "default_min_snr")]
    pub min_snr: f64,
    /// Wait before each capture
    #[serde(default, with = "humantime_serde")]
    pub pre_capture_delay: Duration,
    /// Upper bound on waiting for a frame
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub capture_timeout: Option<Duration>,
    /// Exposure policy
    pub exposure: ExposureSettings,
    /// Driver used to open the sensor
    #[serde(default)]
    pub driver: DriverConfig,
}

/// Exposure policy of one sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureSettings {
    /// Exposure of the first capture
    pub initial_ms: u64,
    /// Lower bound
    #[serde(default = "default_min_exposure_ms")]
    pub min_ms: u64,
    /// Upper bound
    #[serde(default = "default_max_exposure_ms")]
    pub max_ms: u64,
    /// Exposure restored after every accepted sample
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_ms: Option<u64>,
    /// Search for the exposure instead of using `initial_ms` as is
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto: Option<AutoExposureSettings>,
}

/// Target band of the exposure search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoExposureSettings {
    /// Upper edge of the accepted peak band
    pub target_peak: f64,
    /// Width of the band below `target_peak`
    pub tolerance: f64,
    /// Processed channel whose peak is metered
    #[serde(default)]
    pub reference_channel: usize,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_write_reports() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    DEFAULT_ATTEMPT_BUDGET
}

fn default_min_snr() -> f64 {
    QualityGate::DEFAULT_MIN_SNR
}

fn default_min_exposure_ms() -> u64 {
    1
}

fn default_max_exposure_ms() -> u64 {
    60_000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig {
                name: "Scene DAQ".to_string(),
                log_level: "info".to_string(),
                output_dir: PathBuf::from("captures"),
            },
            acquisition: AcquisitionConfig {
                inter_sample_delay: Duration::from_secs(1),
                write_reports: true,
                first_index: 0,
            },
            leader: SensorSettings::leader_default(),
            follower: SensorSettings::follower_default(),
        }
    }
}

impl SensorSettings {
    /// Polarization camera: auto exposure from 450 ms toward a 4050 peak, reset to
    /// 255 ms after every accepted sample.
    pub fn leader_default() -> Self {
        Self {
            tag: "thorlabs".to_string(),
            kind: SensorKind::PolarizationMosaic,
            calibration: None,
            crop: Roi::new(399, 1177, 660, 660),
            readout: Some(Roi::new(0, 0, 2048, 2448)),
            max_attempts: DEFAULT_ATTEMPT_BUDGET,
            min_snr: QualityGate::DEFAULT_MIN_SNR,
            pre_capture_delay: Duration::ZERO,
            capture_timeout: None,
            exposure: ExposureSettings {
                initial_ms: 450,
                min_ms: default_min_exposure_ms(),
                max_ms: default_max_exposure_ms(),
                reset_ms: Some(255),
                auto: Some(AutoExposureSettings {
                    target_peak: 4050.0,
                    tolerance: 100.0,
                    reference_channel: 0,
                }),
            },
            driver: DriverConfig::Simulated(SimulatedSensorConfig::polarization_camera()),
        }
    }

    /// Hyperspectral camera: fixed 4500 ms exposure, half a second of settling before
    /// each capture and a 3 s result timeout.
    pub fn follower_default() -> Self {
        Self {
            tag: "cubert".to_string(),
            kind: SensorKind::Hyperspectral,
            calibration: None,
            crop: Roi::new(75, 116, 120, 120),
            readout: None,
            max_attempts: DEFAULT_ATTEMPT_BUDGET,
            min_snr: QualityGate::DEFAULT_MIN_SNR,
            pre_capture_delay: Duration::from_millis(500),
            capture_timeout: Some(Duration::from_secs(3)),
            exposure: ExposureSettings {
                initial_ms: 4500,
                min_ms: default_min_exposure_ms(),
                max_ms: default_max_exposure_ms(),
                reset_ms: None,
                auto: None,
            },
            driver: DriverConfig::Simulated(SimulatedSensorConfig::hyperspectral_camera()),
        }
    }

    /// Exposure bounds.
    pub fn limits(&self) -> ExposureLimits {
        ExposureLimits {
            min_ms: self.exposure.min_ms,
            max_ms: self.exposure.max_ms,
        }
    }

    /// Initial exposure state for a new session.
    pub fn exposure_state(&self) -> ExposureState {
        let limits = self.limits();
        match &self.exposure.auto {
            Some(auto) => ExposureState::adaptive(
                self.exposure.initial_ms,
                ExposureTarget {
                    target_peak: auto.target_peak,
                    tolerance: auto.tolerance,
                },
                limits,
            ),
            None => ExposureState::fixed(self.exposure.initial_ms, limits),
        }
    }

    /// Metered channel, if the exposure is searched.
    pub fn reference_channel(&self) -> Option<usize> {
        self.exposure.auto.as_ref().map(|auto| auto.reference_channel)
    }

    fn validate(&self, role: &str) -> Result<(), ConfigError> {
        let fail = |msg: String| Err(ConfigError::ValidationError(format!("{role}: {msg}")));

        if self.tag.trim().is_empty() {
            return fail("sensor tag must not be empty".into());
        }
        if self.crop.height == 0 || self.crop.width == 0 {
            return fail(format!("crop {} has zero size", self.crop));
        }
        if let Some(readout) = self.readout {
            if !self.crop.fits_within(readout.height, readout.width) {
                return fail(format!(
                    "crop {} does not fit the {}x{} readout",
                    self.crop, readout.height, readout.width
                ));
            }
        }
        if self.max_attempts == 0 {
            return fail("max_attempts must be at least 1".into());
        }
        if !self.min_snr.is_finite() {
            return fail(format!("min_snr {} is not finite", self.min_snr));
        }

        let exposure = &self.exposure;
        if exposure.min_ms == 0 {
            return fail("exposure.min_ms must be at least 1".into());
        }
        if exposure.min_ms > exposure.max_ms {
            return fail(format!(
                "exposure.min_ms {} exceeds exposure.max_ms {}",
                exposure.min_ms, exposure.max_ms
            ));
        }
        if !(exposure.min_ms..=exposure.max_ms).contains(&exposure.initial_ms) {
            return fail(format!(
                "exposure.initial_ms {} outside [{}, {}]",
                exposure.initial_ms, exposure.min_ms, exposure.max_ms
            ));
        }
        if let Some(reset) = exposure.reset_ms {
            if !(exposure.min_ms..=exposure.max_ms).contains(&reset) {
                return fail(format!(
                    "exposure.reset_ms {reset} outside [{}, {}]",
                    exposure.min_ms, exposure.max_ms
                ));
            }
        }
        if let Some(auto) = &exposure.auto {
            if auto.target_peak <= 0.0 || auto.tolerance < 0.0 || auto.tolerance >= auto.target_peak
            {
                return fail(format!(
                    "auto exposure needs 0 <= tolerance < target_peak, got tolerance {} and target {}",
                    auto.tolerance, auto.target_peak
                ));
            }
            // Hyperspectral band counts are only known once a frame arrives.
            if self.kind == SensorKind::PolarizationMosaic {
                let channels = self.kind.processed_channels(1);
                if auto.reference_channel >= channels {
                    return fail(format!(
                        "reference channel {} does not exist ({channels} channels)",
                        auto.reference_channel
                    ));
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl AppConfig {
    /// Load defaults, then `path`, then `SCENE_DAQ_` environment overrides.
    ///
    /// A missing file is not an error; the built-in rig defaults apply.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the sources cannot be merged or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        extract_validated(
            Figment::from(Serialized::defaults(AppConfig::default()))
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    /// Load built-in defaults and environment overrides only.
    pub fn load_defaults() -> Result<Self, ConfigError> {
        extract_validated(
            Figment::from(Serialized::defaults(AppConfig::default()))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Sensor tags are non-empty and distinct
    /// - Exposure bounds are ordered and at least 1 ms
    /// - Crops are non-empty and fit the readout window
    /// - Auto-exposure bands are well formed
    /// - Only the leader resets its exposure between samples
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        self.leader.validate("leader")?;
        self.follower.validate("follower")?;

        let mut tags = HashSet::new();
        for sensor in [&self.leader, &self.follower] {
            if !tags.insert(sensor.tag.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate sensor tag: '{}'",
                    sensor.tag
                )));
            }
        }

        if self.follower.exposure.reset_ms.is_some() {
            return Err(ConfigError::ValidationError(
                "follower: exposure.reset_ms is only supported on the leader".to_string(),
            ));
        }
        Ok(())
    }
}

fn extract_validated(figment: Figment) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = figment.extract()?;
    config.validate()?;
    Ok(config)
}
