//! Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/basler_daq.toml` (base configuration, optional)
//! 2. Environment variables prefixed with `BASLER_DAQ_`, nested keys separated by `__`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! BASLER_DAQ_APPLICATION__LOG_LEVEL=debug
//! BASLER_DAQ_CAMERA__FRIENDLY_NAME="Basler daA1280-54um (40123456)"
//! BASLER_DAQ_CAMERA__EXPOSURE_MS=5
//! ```
//!
//! Every field has a default, so a missing file yields a usable configuration.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{AppResult, DaqError};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/basler_daq.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "BASLER_DAQ_";

/// Binning factors offered by the viewer.
pub const BINNING_CHOICES: [u32; 2] = [1, 2];

/// Axis unit choices offered by the viewer.
pub const AXIS_UNITS: [&str; 2] = ["pixels", "um"];

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Camera and viewer defaults
    pub camera: CameraConfig,
    /// Kameo actor settings
    pub actors: ActorConfig,
    /// Frame export settings
    pub export: ExportConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit logs as JSON lines
    pub json_logs: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Basler DAQ".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Camera and viewer defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Friendly name of the camera to open; the first camera found when unset
    pub friendly_name: Option<String>,
    /// Exposure time in milliseconds
    pub exposure_ms: f64,
    /// Gain applied on initialization, in dB or raw units depending on the
    /// model. The camera keeps its current gain when unset
    pub gain: Option<f64>,
    /// Pixel size used when the model is not known, in um
    pub pixel_length_um: f64,
    /// Binning on both axes
    pub binning: u32,
    /// Compute frames per second while grabbing
    pub fps_on: bool,
    /// Axis calibration, `pixels` or `um`
    pub axis_units: String,
    /// Timeout of single-image grabs in milliseconds
    pub grab_timeout_ms: u64,
    /// Acquisition frame rate limit in Hz while grabbing
    pub max_frame_rate: Option<f64>,
    /// Number of frames averaged per snapshot
    pub naverage: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            friendly_name: None,
            exposure_ms: 1.0,
            gain: None,
            pixel_length_um: 1.0,
            binning: 1,
            fps_on: true,
            axis_units: "pixels".to_string(),
            grab_timeout_ms: 1000,
            max_frame_rate: None,
            naverage: 1,
        }
    }
}

/// Kameo actor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorConfig {
    /// Buffer of the viewer event channel
    pub event_capacity: usize,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            event_capacity: 256,
        }
    }
}

/// Frame export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Directory for Arrow IPC files written without an explicit path
    pub output_dir: PathBuf,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
        }
    }
}

impl AppConfig {
    /// Load configuration from a specific file path
    ///
    /// Precedence (highest first): environment, file, built-in defaults.
    /// The result is validated.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        tracing::debug!(path = %path.as_ref().display(), "Configuration loaded");
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Binning is one the viewer offers
    /// - Axis units are known
    /// - Exposure, pixel length and frame rate are positive
    /// - At least one frame is averaged
    /// - Event channel capacity is non-zero
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let camera = &self.camera;
        if !BINNING_CHOICES.contains(&camera.binning) {
            return Err(DaqError::Configuration(format!(
                "Invalid binning {}. Must be one of: 1, 2",
                camera.binning
            )));
        }
        if !AXIS_UNITS.contains(&camera.axis_units.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid axis_units '{}'. Must be one of: {}",
                camera.axis_units,
                AXIS_UNITS.join(", ")
            )));
        }
        if !(camera.exposure_ms > 0.0) {
            return Err(DaqError::Configuration(format!(
                "Invalid exposure_ms {}. Must be > 0",
                camera.exposure_ms
            )));
        }
        if !(camera.pixel_length_um > 0.0) {
            return Err(DaqError::Configuration(format!(
                "Invalid pixel_length_um {}. Must be > 0",
                camera.pixel_length_um
            )));
        }
        if let Some(rate) = camera.max_frame_rate {
            if !(rate > 0.0) {
                return Err(DaqError::Configuration(format!(
                    "Invalid max_frame_rate {}. Must be > 0",
                    rate
                )));
            }
        }
        if camera.naverage == 0 {
            return Err(DaqError::Configuration(
                "Invalid naverage 0. Must be >= 1".to_string(),
            ));
        }
        if camera.grab_timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "Invalid grab_timeout_ms 0. Must be > 0".to_string(),
            ));
        }
        if self.actors.event_capacity == 0 {
            return Err(DaqError::Configuration(
                "Invalid event_capacity 0. Must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Effective configuration as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| DaqError::Configuration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.camera.exposure_ms, 1.0);
        assert!(config.camera.fps_on);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = AppConfig::default();
        config.application.log_level = "verbose".to_string();

        let result = config.validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid log_level"));
    }

    #[test]
    fn test_invalid_binning() {
        let mut config = AppConfig::default();
        config.camera.binning = 3;
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("Invalid binning"));
    }

    #[test]
    fn test_invalid_camera_values() {
        let mut config = AppConfig::default();
        config.camera.exposure_ms = 0.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.camera.pixel_length_um = -1.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.camera.naverage = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.camera.axis_units = "mm".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.camera.max_frame_rate = Some(0.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[camera]
friendly_name = "Basler daA1280-54um (40123456)"
exposure_ms = 12.5
binning = 2
axis_units = "um"
"#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(
            config.camera.friendly_name.as_deref(),
            Some("Basler daA1280-54um (40123456)")
        );
        assert_eq!(config.camera.exposure_ms, 12.5);
        assert_eq!(config.camera.binning, 2);
        // Untouched sections keep their defaults
        assert_eq!(config.camera.naverage, 1);
        assert_eq!(config.actors.event_capacity, 256);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[camera]\nbinning = 5").unwrap();
        assert!(matches!(
            AppConfig::load_from(file.path()),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn test_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("basler.toml", "[camera]\nexposure_ms = 3.0")?;
            jail.set_env("BASLER_DAQ_CAMERA__EXPOSURE_MS", "7.5");
            jail.set_env("BASLER_DAQ_APPLICATION__JSON_LOGS", "true");

            let config = AppConfig::load_from("basler.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.camera.exposure_ms, 7.5);
            assert!(config.application.json_logs);
            Ok(())
        });
    }

    #[test]
    fn test_toml_dump_roundtrips() {
        let dumped = AppConfig::default().to_toml().unwrap();
        let parsed: AppConfig = toml::from_str(&dumped).unwrap();
        assert_eq!(parsed.camera.axis_units, "pixels");
    }
}
