//! Integration tests for configuration loading

use std::io::Write;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use plantcam::capture::PixelFormat;
use plantcam::error::ConfigError;
use plantcam::storage::Naming;
use plantcam::{Config, SensorKind};

/// `Config::load` reads the process environment; tests that load hold this
static ENV_LOCK: Mutex<()> = Mutex::new(());

#[test]
fn test_config_defaults() {
    let config = Config::default();

    assert_eq!(config.schedule.capture_hour, 15);
    assert_eq!(config.capture.quality, 80);
    assert_eq!(config.stream.quality, 60);
    assert_eq!((config.capture.width, config.capture.height), (800, 600));
    assert_eq!((config.stream.width, config.stream.height), (640, 480));
    assert_eq!(config.capture.pool_size, 2);
    assert_eq!(config.server.port, 8080);
    assert_eq!(config.storage.prefix, "plant_");
    assert_eq!(config.storage.extension, ".jpg");
    assert_eq!(config.capture.sensor, SensorKind::Simulated);
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_file_overrides_defaults() {
    let _env = ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
[capture]
format = "yuyv4"
quality = 90

[schedule]
capture_hour = 6
use_flash = true

[storage]
naming = "timestamp"

[server]
port = 9090
"#
    )
    .unwrap();

    let config = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.capture.format, PixelFormat::Yuyv4);
    assert_eq!(config.capture.quality, 90);
    assert_eq!(config.schedule.capture_hour, 6);
    assert!(config.schedule.use_flash);
    assert_eq!(config.storage.naming, Naming::Timestamp);
    assert_eq!(config.server.port, 9090);
    // Untouched keys keep their defaults
    assert_eq!(config.capture.width, 800);
    assert_eq!(config.stream.boundary, "frame");
}

#[test]
fn test_env_overrides_file() {
    let _env = ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
[capture]
quality = 90

[schedule]
capture_hour = 6

[storage]
prefix = "file_"

[server]
port = 9090
"#
    )
    .unwrap();

    let vars = [
        ("PLANTCAM_SERVER__PORT", "9000"),
        ("PLANTCAM_SCHEDULE__CAPTURE_HOUR", "7"),
        ("PLANTCAM_STORAGE__PREFIX", "img_"),
    ];
    for (key, value) in vars {
        std::env::set_var(key, value);
    }
    let loaded = Config::load(Some(file.path()));
    for (key, _) in vars {
        std::env::remove_var(key);
    }

    let config = loaded.unwrap();
    assert_eq!(config.server.port, 9000);
    assert_eq!(config.schedule.capture_hour, 7);
    assert_eq!(config.storage.prefix, "img_");
    // Keys absent from the environment still come from the file
    assert_eq!(config.capture.quality, 90);
}

#[test]
fn test_invalid_values_are_rejected() {
    let mut config = Config::default();
    config.schedule.capture_hour = 24;
    assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

    let mut config = Config::default();
    config.stream.quality = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.stream.boundary = "two words".into();
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.capture.pool_size = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_derived_settings() {
    let mut config = Config::default();
    config.schedule.use_flash = true;
    config.schedule.utc_offset_minutes = Some(-300);

    let settings = config.orchestrator_settings();
    assert_eq!(settings.still_quality, 80);
    assert!(settings.flash.scheduled);
    assert_eq!(settings.flash.stabilization, Duration::from_millis(300));
    assert_eq!(settings.flash.trailing, Duration::from_millis(50));
    assert_eq!(settings.stream.profile.width, 640);
    assert_eq!(settings.stream.profile.quality, 60);
    assert_eq!(config.still_profile().width, 800);
    assert_eq!(
        config.utc_offset().map(|o| o.local_minus_utc()),
        Some(-300 * 60)
    );
}

#[test]
fn test_simulated_sensor_opens_without_hardware() {
    let config = Config::default();
    assert!(config.open_sensor().is_ok());
    assert!(config.open_illumination().is_ok());
}
