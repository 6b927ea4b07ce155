//! Viewer settings tree
//!
//! The parameters a host shows for a 2D camera viewer. Fields are typed
//! observables; hosts that only know names go through [`ViewerSettings::get`]
//! and [`ViewerSettings::set_json`].

use anyhow::{anyhow, Result};

use crate::config::{CameraConfig, AXIS_UNITS, BINNING_CHOICES};
use crate::viewer::observable::{Observable, ParamKind, ParameterBase};

/// Group holding the timing parameters.
pub const TIMING_GROUP: &str = "timing_opts";

/// Settings of the generic camera viewer plus the Basler extras.
#[derive(Debug)]
pub struct ViewerSettings {
    pub camera_list: Observable<String>,
    pub camera_info: Observable<String>,
    pub update_roi: Observable<bool>,
    pub clear_roi: Observable<bool>,
    pub binning: Observable<u32>,
    pub hdet: Observable<u32>,
    pub vdet: Observable<u32>,
    pub exposure_time: Observable<f64>,
    pub fps_on: Observable<bool>,
    pub fps: Observable<f64>,
    pub auto_exposure: Observable<bool>,
    pub gain: Observable<f64>,
    pub pixel_length: Observable<f64>,
    pub axis_units: Observable<String>,
}

impl ViewerSettings {
    /// Settings with defaults taken from the camera configuration.
    pub fn from_config(config: &CameraConfig) -> Self {
        Self {
            camera_list: Observable::new(
                "camera_list",
                config.friendly_name.clone().unwrap_or_default(),
            )
            .with_title("Camera:")
            .with_kind(ParamKind::List),
            camera_info: Observable::new("camera_info", String::new())
                .with_title("Camera model:")
                .read_only(),
            update_roi: Observable::new("update_roi", false)
                .with_title("Update ROI")
                .with_kind(ParamKind::BoolPush),
            clear_roi: Observable::new("clear_roi", false)
                .with_title("Clear ROI+Bin")
                .with_kind(ParamKind::BoolPush),
            binning: Observable::new("binning", config.binning)
                .with_title("Binning")
                .with_limits(&BINNING_CHOICES),
            hdet: Observable::new("hdet", 1u32)
                .with_title("Image width")
                .with_kind(ParamKind::Int)
                .read_only(),
            vdet: Observable::new("vdet", 1u32)
                .with_title("Image height")
                .with_kind(ParamKind::Int)
                .read_only(),
            exposure_time: Observable::new("exposure_time", config.exposure_ms)
                .with_title("Exposure Time (ms)")
                .with_units("ms")
                .with_kind(ParamKind::Float)
                .in_group(TIMING_GROUP)
                .with_validator(|v: &f64| {
                    if *v > 0.0 {
                        Ok(())
                    } else {
                        Err(anyhow!("Exposure time must be positive, got {v}"))
                    }
                }),
            fps_on: Observable::new("fps_on", config.fps_on)
                .with_title("Compute FPS")
                .with_kind(ParamKind::Bool)
                .in_group(TIMING_GROUP),
            fps: Observable::new("fps", 0.0)
                .with_title("FPS")
                .with_kind(ParamKind::Float)
                .in_group(TIMING_GROUP)
                .read_only(),
            auto_exposure: Observable::new("auto_exposure", false)
                .with_title("Automatic exposure:")
                .with_kind(ParamKind::Bool),
            gain: Observable::new("gain", config.gain.unwrap_or(0.0))
                .with_title("Gain (dB)")
                .with_kind(ParamKind::Float),
            pixel_length: Observable::new("pixel_length", config.pixel_length_um)
                .with_title("Pixel size (um)")
                .with_units("um")
                .with_kind(ParamKind::Float)
                .hidden()
                .with_validator(|v: &f64| {
                    if *v > 0.0 {
                        Ok(())
                    } else {
                        Err(anyhow!("Pixel size must be positive, got {v}"))
                    }
                }),
            axis_units: Observable::new("axis_units", config.axis_units.clone())
                .with_title("Axis units")
                .with_limits(&AXIS_UNITS.map(String::from)),
        }
    }

    /// All parameters in display order.
    pub fn parameters(&self) -> Vec<&dyn ParameterBase> {
        let params: [&dyn ParameterBase; 14] = [
            &self.camera_list,
            &self.camera_info,
            &self.update_roi,
            &self.clear_roi,
            &self.binning,
            &self.hdet,
            &self.vdet,
            &self.exposure_time,
            &self.fps_on,
            &self.fps,
            &self.auto_exposure,
            &self.gain,
            &self.pixel_length,
            &self.axis_units,
        ];
        params.to_vec()
    }

    /// Look a parameter up by name or `group/name` path.
    pub fn get(&self, name: &str) -> Option<&dyn ParameterBase> {
        self.parameters()
            .into_iter()
            .find(|p| p.name() == name || p.metadata().path() == name)
    }

    /// Set a parameter from JSON, returning its canonical name.
    ///
    /// Read-only parameters and values outside a list's choices are rejected.
    pub fn set_json(&self, name: &str, value: serde_json::Value) -> Result<String> {
        let param = self
            .get(name)
            .ok_or_else(|| anyhow!("Unknown setting '{name}'"))?;
        param.set_json(value)?;
        Ok(param.name().to_string())
    }

    /// Current value of a parameter as JSON.
    pub fn value_json(&self, name: &str) -> Option<serde_json::Value> {
        self.get(name).and_then(|p| p.get_json().ok())
    }

    /// Offer these cameras in `camera_list`, keeping the selection if still present.
    pub fn set_camera_choices(&mut self, friendly_names: Vec<String>) {
        let current = self.camera_list.get();
        if !friendly_names.contains(&current) {
            if let Some(first) = friendly_names.first() {
                self.camera_list.set_unchecked(first.clone());
            }
        }
        self.camera_list.set_limits(&friendly_names);
    }

    /// Present `gain` as raw integer units.
    pub fn use_raw_gain(&mut self) {
        self.gain.set_kind(ParamKind::Int);
        self.gain.set_title("Gain (raw)");
    }

    /// Snapshot of every parameter with its metadata, keyed by path.
    pub fn snapshot(&self) -> serde_json::Value {
        let entries = self
            .parameters()
            .into_iter()
            .map(|p| {
                let meta = p.metadata();
                (
                    meta.path(),
                    serde_json::json!({
                        "title": meta.title,
                        "kind": meta.kind,
                        "value": p.get_json().unwrap_or(serde_json::Value::Null),
                        "units": meta.units,
                        "readonly": meta.read_only,
                        "visible": meta.visible,
                        "limits": meta.limits,
                    }),
                )
            })
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(entries)
    }
}

impl Default for ViewerSettings {
    fn default() -> Self {
        Self::from_config(&CameraConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let settings = ViewerSettings::default();
        assert_eq!(settings.exposure_time.get(), 1.0);
        assert!(settings.fps_on.get());
        assert_eq!(settings.pixel_length.get(), 1.0);
        assert!(!settings.pixel_length.metadata().visible);
        assert_eq!(settings.gain.metadata().title, "Gain (dB)");
        assert_eq!(settings.axis_units.get(), "pixels");
    }

    #[test]
    fn test_lookup_by_path() {
        let settings = ViewerSettings::default();
        assert_eq!(
            settings.get("timing_opts/exposure_time").unwrap().name(),
            "exposure_time"
        );
        assert_eq!(settings.get("fps").unwrap().metadata().path(), "timing_opts/fps");
        assert!(settings.get("roi_select").is_none());
    }

    #[test]
    fn test_set_json_rules() {
        let settings = ViewerSettings::default();
        assert_eq!(settings.set_json("binning", json!(2)).unwrap(), "binning");
        assert_eq!(settings.binning.get(), 2);

        assert!(settings.set_json("binning", json!(3)).is_err());
        assert!(settings.set_json("hdet", json!(10)).is_err());
        assert!(settings.set_json("exposure_time", json!(-1.0)).is_err());
        assert!(settings.set_json("axis_units", json!("mm")).is_err());
        assert!(settings.set_json("nope", json!(1)).is_err());
    }

    #[test]
    fn test_camera_choices() {
        let mut settings = ViewerSettings::default();
        settings.set_camera_choices(vec!["Basler A (1)".into(), "Basler B (2)".into()]);
        assert_eq!(settings.camera_list.get(), "Basler A (1)");
        assert!(settings.set_json("camera_list", json!("Basler C (3)")).is_err());
        settings.set_json("camera_list", json!("Basler B (2)")).unwrap();

        settings.set_camera_choices(vec!["Basler B (2)".into()]);
        assert_eq!(settings.camera_list.get(), "Basler B (2)");
    }

    #[test]
    fn test_raw_gain_presentation() {
        let mut settings = ViewerSettings::default();
        settings.use_raw_gain();
        assert_eq!(settings.gain.metadata().title, "Gain (raw)");
        assert_eq!(settings.gain.metadata().kind, ParamKind::Int);
    }

    #[test]
    fn test_snapshot() {
        let settings = ViewerSettings::default();
        let snapshot = settings.snapshot();
        assert_eq!(snapshot["timing_opts/exposure_time"]["value"], json!(1.0));
        assert_eq!(snapshot["binning"]["limits"], json!([1, 2]));
        assert_eq!(snapshot["camera_info"]["readonly"], json!(true));
    }
}
