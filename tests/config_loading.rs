//! Layered configuration loading: defaults, TOML file, environment.
//!
//! Every test here touches the process environment (directly or through the `Env`
//! provider), so all of them run serially.

use std::time::Duration;

use serial_test::serial;

use scene_daq::config::{AppConfig, ConfigError};
use scene_daq::frame::Roi;
use scene_daq::hardware::DriverConfig;

const ENV_VARS: [&str; 3] = [
    "SCENE_DAQ_APPLICATION__LOG_LEVEL",
    "SCENE_DAQ_LEADER__MAX_ATTEMPTS",
    "SCENE_DAQ_ACQUISITION__INTER_SAMPLE_DELAY",
];

fn clear_env() {
    for var in ENV_VARS {
        std::env::remove_var(var);
    }
}

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    std::fs::write(file.path(), contents).unwrap();
    file
}

#[test]
#[serial]
fn test_toml_overrides_defaults() {
    clear_env();
    let file = write_config(
        r#"
[application]
output_dir = "/data/run_7"

[acquisition]
inter_sample_delay = "250ms"
first_index = 100

[leader]
max_attempts = 20
calibration = "calibration/thorlabs_master_dark.npy"

[leader.exposure.auto]
target_peak = 3000.0
tolerance = 50.0

[follower]
crop = { y = 10, x = 20, height = 64, width = 64 }

[follower.driver]
type = "simulated"
channels = 41
gain = 0.25
"#,
    );

    let config = AppConfig::load_from(file.path()).unwrap();
    assert_eq!(config.application.output_dir.to_str(), Some("/data/run_7"));
    assert_eq!(config.acquisition.inter_sample_delay, Duration::from_millis(250));
    assert_eq!(config.acquisition.first_index, 100);
    assert_eq!(config.leader.max_attempts, 20);
    assert!(config.leader.calibration.is_some());

    let auto = config.leader.exposure.auto.as_ref().unwrap();
    assert_eq!(auto.target_peak, 3000.0);
    assert_eq!(auto.tolerance, 50.0);
    assert_eq!(auto.reference_channel, 0);

    assert_eq!(config.follower.crop, Roi::new(10, 20, 64, 64));
    let DriverConfig::Simulated(sim) = &config.follower.driver;
    assert_eq!(sim.channels, 41);
    assert_eq!(sim.gain, 0.25);

    // Untouched values keep their defaults.
    assert_eq!(config.leader.exposure.initial_ms, 450);
    assert_eq!(config.follower.pre_capture_delay, Duration::from_millis(500));
}

#[test]
#[serial]
fn test_env_overrides_file() {
    clear_env();
    let file = write_config(
        r#"
[application]
log_level = "warn"

[leader]
max_attempts = 20
"#,
    );
    std::env::set_var("SCENE_DAQ_APPLICATION__LOG_LEVEL", "debug");
    std::env::set_var("SCENE_DAQ_LEADER__MAX_ATTEMPTS", "7");
    std::env::set_var("SCENE_DAQ_ACQUISITION__INTER_SAMPLE_DELAY", "3s");

    let result = AppConfig::load_from(file.path());
    clear_env();

    let config = result.unwrap();
    assert_eq!(config.application.log_level, "debug");
    assert_eq!(config.leader.max_attempts, 7);
    assert_eq!(config.acquisition.inter_sample_delay, Duration::from_secs(3));
}

#[test]
#[serial]
fn test_env_overrides_defaults_without_file() {
    clear_env();
    std::env::set_var("SCENE_DAQ_LEADER__MAX_ATTEMPTS", "3");

    let result = AppConfig::load_defaults();
    clear_env();

    let config = result.unwrap();
    assert_eq!(config.leader.max_attempts, 3);
    assert_eq!(config.follower.max_attempts, 15);
}

#[test]
#[serial]
fn test_missing_file_yields_defaults() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();

    let config = AppConfig::load_from(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, AppConfig::default());
}

#[test]
#[serial]
fn test_invalid_file_rejected_by_validation() {
    clear_env();
    let file = write_config(
        r#"
[follower.exposure]
reset_ms = 1000
"#,
    );

    let err = AppConfig::load_from(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::ValidationError(_)));
}

#[test]
#[serial]
fn test_malformed_value_is_load_error() {
    clear_env();
    let file = write_config(
        r#"
[acquisition]
inter_sample_delay = "soon"
"#,
    );

    let err = AppConfig::load_from(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::LoadError(_)));
}

#[test]
#[serial]
fn test_rendered_config_loads_back() {
    clear_env();
    let rendered = toml::to_string_pretty(&AppConfig::default()).unwrap();
    let file = write_config(&rendered);

    let config = AppConfig::load_from(file.path()).unwrap();
    assert_eq!(config, AppConfig::default());
}
