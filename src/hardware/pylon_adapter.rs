//! Pylon Hardware Adapter
//!
//! Narrow wrapper around the Pylon transport-layer factory and instant camera.
//! Camera features are reached through GenICam node names, exactly as the SDK
//! exposes them (`Width`, `OffsetX`, `ExposureTime`, ...). Backends:
//!
//! - [`MockPylonAdapter`](crate::hardware::mock::MockPylonAdapter): simulated devices
//! - `PylonSdkAdapter`: the real SDK (feature `pylon_hardware`)

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{AppResult, DaqError};
use crate::traits::camera_sensor::{DeviceInfo, PixelFormat};

/// Handle of an attached and opened device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u32);

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device#{}", self.0)
    }
}

/// Value of a GenICam node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeValue {
    Integer(i64),
    Float(f64),
    Enumeration(String),
    Boolean(bool),
}

impl NodeValue {
    /// Integer payload, or a type mismatch error naming `node`.
    pub fn into_integer(self, node: &str) -> AppResult<i64> {
        match self {
            NodeValue::Integer(v) => Ok(v),
            _ => Err(DaqError::NodeTypeMismatch {
                node: node.to_string(),
                expected: "integer",
            }),
        }
    }

    /// Float payload. Integer nodes are widened.
    pub fn into_float(self, node: &str) -> AppResult<f64> {
        match self {
            NodeValue::Float(v) => Ok(v),
            NodeValue::Integer(v) => Ok(v as f64),
            _ => Err(DaqError::NodeTypeMismatch {
                node: node.to_string(),
                expected: "float",
            }),
        }
    }

    /// Enumeration entry.
    pub fn into_enumeration(self, node: &str) -> AppResult<String> {
        match self {
            NodeValue::Enumeration(v) => Ok(v),
            _ => Err(DaqError::NodeTypeMismatch {
                node: node.to_string(),
                expected: "enumeration",
            }),
        }
    }
}

impl fmt::Display for NodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeValue::Integer(v) => write!(f, "{v}"),
            NodeValue::Float(v) => write!(f, "{v}"),
            NodeValue::Enumeration(v) => f.write_str(v),
            NodeValue::Boolean(v) => write!(f, "{v}"),
        }
    }
}

/// Range of an integer node. Valid values are `min + k * inc` up to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegerRange {
    pub min: i64,
    pub max: i64,
    pub inc: i64,
}

impl IntegerRange {
    /// Largest valid value not above `value`, clamped into the range.
    pub fn floor(&self, value: i64) -> i64 {
        let inc = self.inc.max(1);
        let clamped = value.clamp(self.min, self.max.max(self.min));
        self.min + (clamped - self.min) / inc * inc
    }
}

/// Range of a float node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FloatRange {
    pub min: f64,
    pub max: f64,
}

/// How the grab engine treats frames the consumer has not picked up yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrabStrategy {
    /// Deliver every frame in order.
    OneByOne,
    /// Keep only the most recent frame; older ones are reported as skipped.
    LatestImageOnly,
}

/// Successfully grabbed image, unpacked into 16-bit containers.
#[derive(Debug, Clone)]
pub struct GrabbedImage {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub pixels: Vec<u16>,
    /// Stream block id, monotonically increasing per grab session.
    pub block_id: u64,
    pub timestamp_ns: i64,
}

/// Events delivered by a running grab loop.
#[derive(Debug, Clone)]
pub enum GrabEvent {
    Grabbed(GrabbedImage),
    Failed { code: u32, description: String },
    Skipped(u64),
    DeviceRemoved,
}

/// Pylon adapter trait
pub trait PylonAdapter: Send + Sync {
    /// List all devices visible to the transport layers.
    fn enumerate_devices(&self) -> AppResult<Vec<DeviceInfo>>;

    /// Create, attach and open the device with this full name.
    fn open(&self, full_name: &str) -> AppResult<DeviceHandle>;

    /// Close and detach a device.
    fn close(&self, handle: DeviceHandle) -> AppResult<()>;

    /// Identification of an opened device.
    fn device_info(&self, handle: DeviceHandle) -> AppResult<DeviceInfo>;

    /// Whether the node exists on this device.
    fn has_node(&self, handle: DeviceHandle, name: &str) -> bool;

    /// Read a node.
    fn get_node(&self, handle: DeviceHandle, name: &str) -> AppResult<NodeValue>;

    /// Write a node.
    fn set_node(&self, handle: DeviceHandle, name: &str, value: NodeValue) -> AppResult<()>;

    /// Current range of an integer node (may depend on other nodes).
    fn integer_range(&self, handle: DeviceHandle, name: &str) -> AppResult<IntegerRange>;

    /// Current range of a float node.
    fn float_range(&self, handle: DeviceHandle, name: &str) -> AppResult<FloatRange>;

    /// Grab a single image, waiting at most `timeout`.
    fn grab_one(&self, handle: DeviceHandle, timeout: Duration) -> AppResult<GrabbedImage>;

    /// Start the grab loop. Events arrive on the returned receiver until the
    /// guard is dropped or [`PylonAdapter::stop_grabbing`] is called.
    fn start_grabbing(
        self: Arc<Self>,
        handle: DeviceHandle,
        strategy: GrabStrategy,
    ) -> AppResult<(mpsc::Receiver<GrabEvent>, GrabGuard)>;

    /// Stop the grab loop. Stopping an idle device is not an error.
    fn stop_grabbing(&self, handle: DeviceHandle) -> AppResult<()>;

    /// Whether the grab loop is running.
    fn is_grabbing(&self, handle: DeviceHandle) -> bool;
}

/// RAII guard that stops grabbing when dropped
pub struct GrabGuard {
    adapter: Arc<dyn PylonAdapter>,
    handle: DeviceHandle,
}

impl GrabGuard {
    /// Guard the grab loop of `handle` on `adapter`.
    pub fn new(adapter: Arc<dyn PylonAdapter>, handle: DeviceHandle) -> Self {
        Self { adapter, handle }
    }
}

impl fmt::Debug for GrabGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrabGuard")
            .field("handle", &self.handle)
            .finish()
    }
}

impl Drop for GrabGuard {
    fn drop(&mut self) {
        if let Err(e) = self.adapter.stop_grabbing(self.handle) {
            tracing::error!(handle = %self.handle, "Failed to stop grabbing: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_range_floor() {
        let range = IntegerRange {
            min: 16,
            max: 1280,
            inc: 4,
        };
        assert_eq!(range.floor(1283), 1280);
        assert_eq!(range.floor(1281), 1280);
        assert_eq!(range.floor(5000), 1280);
        assert_eq!(range.floor(3), 16);
        assert_eq!(range.floor(19), 16);
        assert_eq!(range.floor(21), 20);
    }

    #[test]
    fn test_node_value_conversions() {
        assert_eq!(NodeValue::Integer(3).into_float("Gain").unwrap(), 3.0);
        assert!(NodeValue::Float(1.0).into_integer("Width").is_err());
        assert_eq!(
            NodeValue::Enumeration("Mono12".into())
                .into_enumeration("PixelFormat")
                .unwrap(),
            "Mono12"
        );
        assert!(NodeValue::Boolean(true).into_enumeration("GainAuto").is_err());
    }
}
