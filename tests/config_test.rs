//! Configuration loading tests
//!
//! Covers the three Figment layers (defaults, TOML file, environment) and
//! the checks `PhantomConfig::validate` runs after loading.

use phantom_core::port_resolver::UsbId;
use std::fs;
use tempfile::TempDir;
use water_phantom::config::PhantomConfig;
use water_phantom::logging::OutputFormat;
use water_phantom::PhantomError;

fn write_config(dir: &TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("water_phantom.toml");
    fs::write(&path, contents).unwrap();
    path
}

#[test]
fn missing_file_falls_back_to_defaults() {
    let dir = TempDir::new().unwrap();
    let config = PhantomConfig::load_from(dir.path().join("absent.toml")).unwrap();

    assert_eq!(config.stepper, PhantomConfig::default().stepper);
    assert!(config.cylinder.enabled);
    assert!(config.validate().is_ok());
}

#[test]
fn file_overrides_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
        [application]
        log_level = "debug"
        log_format = "json"

        [cylinder]
        enabled = false
        port = "/dev/ttyACM7"
        reply_window_ms = 80

        [stepper]
        usb_id = "2a3c:0101"
        max_travel_bottom_cm = 28.5

        [stepper.motor]
        max_velocity = 800

        [motion]
        move_timeout_ms = 30000
        "#,
    );

    let config = PhantomConfig::load_from(&path).unwrap();
    assert_eq!(config.application.log_level, "debug");
    assert_eq!(config.application.log_format, OutputFormat::Json);
    assert!(!config.cylinder.enabled);
    assert_eq!(config.cylinder.driver.port.as_deref(), Some("/dev/ttyACM7"));
    assert_eq!(config.cylinder.driver.reply_window_ms, 80);
    assert_eq!(config.stepper.usb_id, UsbId::new(0x2a3c, 0x0101));
    assert_eq!(config.stepper.max_travel_bottom_cm, 28.5);
    assert_eq!(config.stepper.max_travel_top_cm, 20.0);
    assert_eq!(config.stepper.motor.max_velocity, 800);
    assert_eq!(config.stepper.motor.microsteps, 64);
    assert_eq!(config.motion.move_timeout_ms, 30_000);
    assert!(config.validate().is_ok());
}

#[test]
fn shipped_config_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/water_phantom.toml");
    let config = PhantomConfig::load_from(path).unwrap();

    assert!(config.validate().is_ok());
    assert_eq!(config.stepper.motor, PhantomConfig::default().stepper.motor);
    assert_eq!(config.cylinder.driver.usb_id, UsbId::new(0x2341, 0x0043));
}

#[test]
fn environment_overrides_file() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
        [motion]
        startup_timeout_ms = 1000
        "#,
    );

    std::env::set_var("WATER_PHANTOM_MOTION__STARTUP_TIMEOUT_MS", "4500");
    let config = PhantomConfig::load_from(&path);
    std::env::remove_var("WATER_PHANTOM_MOTION__STARTUP_TIMEOUT_MS");

    assert_eq!(config.unwrap().motion.startup_timeout_ms, 4_500);
}

#[test]
fn malformed_usb_id_fails_to_load() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
        [stepper]
        usb_id = "not-an-id"
        "#,
    );

    assert!(PhantomConfig::load_from(&path).is_err());
}

#[test]
fn invalid_microsteps_fail_validation() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
        [stepper.motor]
        microsteps = 48
        "#,
    );

    let config = PhantomConfig::load_from(&path).unwrap();
    assert!(matches!(config.validate(), Err(PhantomError::Configuration(_))));
}

#[test]
fn inverted_poll_intervals_fail_validation() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
        [motion]
        poll_interval_ms = 100
        max_poll_interval_ms = 10
        "#,
    );

    let err = PhantomConfig::load_from(&path).unwrap().validate().unwrap_err();
    assert!(err.to_string().contains("max_poll_interval_ms"), "{err}");
}

#[test]
fn infinite_backoff_fails_validation() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
        [motion]
        backoff_factor = inf
        "#,
    );

    let config = PhantomConfig::load_from(&path).unwrap();
    assert!(config.motion.backoff_factor.is_infinite());
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("backoff_factor"), "{err}");
}

#[test]
fn unknown_log_format_fails_to_load() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
        [application]
        log_format = "xml"
        "#,
    );

    assert!(PhantomConfig::load_from(&path).is_err());
}
