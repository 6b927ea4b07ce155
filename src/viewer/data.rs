//! Data and events emitted by a camera viewer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the exported data group.
pub const EXPORT_NAME: &str = "Camera";
/// Name of the single data item.
pub const DATA_NAME: &str = "Camera Image";

/// Dimensionality of the emitted image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataDim {
    /// A single row or column.
    Data1D,
    /// A full image.
    Data2D,
}

impl fmt::Display for DataDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataDim::Data1D => f.write_str("Data1D"),
            DataDim::Data2D => f.write_str("Data2D"),
        }
    }
}

/// Calibrated axis of an image dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    pub label: String,
    pub units: String,
    /// Array dimension the axis belongs to.
    pub index: usize,
    pub data: Vec<f64>,
}

/// One image with its geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFromCamera {
    pub name: String,
    pub dim: DataDim,
    pub labels: Vec<String>,
    /// Row-major shape, `[rows, cols]` or `[len]`.
    pub shape: Vec<usize>,
    pub data: Vec<u16>,
    pub axes: Vec<Axis>,
}

impl DataFromCamera {
    /// Image in the standard `Camera Image` layout.
    pub fn camera_image(dim: DataDim, shape: Vec<usize>, data: Vec<u16>, axes: Vec<Axis>) -> Self {
        Self {
            name: DATA_NAME.to_string(),
            dim,
            labels: vec![format!("Camera_{dim}")],
            shape,
            data,
            axes,
        }
    }
}

/// Group of data emitted together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataExport {
    pub name: String,
    pub data: Vec<DataFromCamera>,
}

impl DataExport {
    /// Export named `Camera` holding a single image.
    pub fn camera(image: DataFromCamera) -> Self {
        Self {
            name: EXPORT_NAME.to_string(),
            data: vec![image],
        }
    }
}

/// Notification sent by a viewer to its host.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewerEvent {
    /// Status line; `log` asks the host to also record it in its log.
    Status { message: String, log: bool },
    /// Placeholder data used by hosts to reshape their displays.
    TemporaryData(DataExport),
    /// Acquired data.
    Data(DataExport),
    /// A setting changed on the viewer side.
    SettingChanged {
        name: String,
        value: serde_json::Value,
    },
}

impl ViewerEvent {
    /// Status event that is also logged.
    pub fn log(message: impl Into<String>) -> Self {
        ViewerEvent::Status {
            message: message.into(),
            log: true,
        }
    }

    /// Status event for the status bar only.
    pub fn status(message: impl Into<String>) -> Self {
        ViewerEvent::Status {
            message: message.into(),
            log: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camera_image_labels() {
        let image = DataFromCamera::camera_image(DataDim::Data2D, vec![2, 3], vec![0; 6], vec![]);
        assert_eq!(image.labels, vec!["Camera_Data2D".to_string()]);
        assert_eq!(image.name, "Camera Image");

        let export = DataExport::camera(image);
        assert_eq!(export.name, "Camera");
        assert_eq!(export.data.len(), 1);
    }
}
