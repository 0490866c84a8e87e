//! Figment layering: defaults, TOML file, environment.

use daq_core::DaqError;
use serial_test::serial;
use srs_daq::config::AppConfig;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

fn toml(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

/// Clears the variables a test set, even when it fails.
struct EnvGuard(&'static [&'static str]);

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for key in self.0 {
            std::env::remove_var(key);
        }
    }
}

#[test]
#[serial]
fn missing_file_yields_defaults() {
    let config = AppConfig::load_from("does/not/exist.toml").unwrap();
    assert_eq!(config, AppConfig::default());
}

#[test]
#[serial]
fn shipped_config_is_valid() {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/srs_daq.toml");
    let config = AppConfig::load_from(path).unwrap();
    assert_eq!(config.stage.port, "/dev/ttyUSB0");
    assert_eq!(config.laser.port, "/dev/ttyUSB1");
    assert_eq!(config.optimizer.points, 200);
    assert!(!config.simulate);
}

#[test]
#[serial]
fn file_overrides_defaults_per_key() {
    let file = toml(
        r#"
        log_level = "debug"

        [stage]
        port = "COM3"

        [optimizer]
        points = 101
        "#,
    );
    let config = AppConfig::load_from(file.path()).unwrap();

    assert_eq!(config.log_level, "debug");
    assert_eq!(config.stage.port, "COM3");
    assert_eq!(config.stage.settle_ms, 50);
    assert_eq!(config.optimizer.points, 101);
    assert_eq!(config.optimizer.half_width_mm, 0.1);
    assert_eq!(config.laser, Default::default());
}

#[test]
#[serial]
fn environment_overrides_file() {
    let _guard = EnvGuard(&["SRS_DAQ_STAGE__PORT", "SRS_DAQ_SIMULATE", "SRS_DAQ_LOCKIN__POLL_DURATION_MS"]);
    std::env::set_var("SRS_DAQ_STAGE__PORT", "/dev/ttyS4");
    std::env::set_var("SRS_DAQ_SIMULATE", "true");
    std::env::set_var("SRS_DAQ_LOCKIN__POLL_DURATION_MS", "80");

    let file = toml(
        r#"
        [stage]
        port = "COM3"
        baud_rate = 9600
        "#,
    );
    let config = AppConfig::load_from(file.path()).unwrap();

    assert_eq!(config.stage.port, "/dev/ttyS4");
    assert_eq!(config.stage.baud_rate, 9600);
    assert!(config.simulate);
    assert_eq!(config.lockin.poll_request().duration.as_millis(), 80);
}

#[test]
#[serial]
fn semantic_errors_are_configuration_errors() {
    let file = toml(
        r#"
        [lockin]
        poll_duration_ms = 500
        poll_timeout_ms = 100
        "#,
    );
    let err = AppConfig::load_from(file.path()).unwrap_err();
    assert!(matches!(err, DaqError::Configuration(_)), "{err}");
}

#[test]
#[serial]
fn type_errors_are_configuration_errors() {
    let file = toml(
        r#"
        [optimizer]
        points = "many"
        "#,
    );
    let err = AppConfig::load_from(file.path()).unwrap_err();
    assert!(matches!(err, DaqError::Configuration(_)), "{err}");
}
