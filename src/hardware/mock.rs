//! Mock Pylon Adapter
//!
//! Simulated Basler devices for testing without hardware or the Pylon SDK.
//! Each simulated device carries a GenICam-like node map with ranges,
//! increments and the usual "locked while grabbing" behaviour, so the
//! controller code above it runs against the same constraints as on a real
//! camera.
//!
//! # Available Devices
//!
//! - [`SimulatedDevice::dart_1280`] - daA1280-54um (USB, gain in dB, 4 px width increment)
//! - [`SimulatedDevice::ace_640_gige`] - acA640-120gm (GigE, raw gain, `*Abs` nodes)
//! - [`SimulatedDevice::dart_1920`] - daA1920-160um (model without a known pixel size)

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use crate::error::{AppResult, DaqError};
use crate::hardware::pylon_adapter::{
    DeviceHandle, FloatRange, GrabEvent, GrabGuard, GrabStrategy, GrabbedImage, IntegerRange,
    NodeValue, PylonAdapter,
};
use crate::traits::camera_sensor::{DeviceInfo, PixelFormat};

/// Nodes the SDK refuses to write while the grab engine runs.
const LOCKED_WHILE_GRABBING: [&str; 5] = [
    "Width",
    "Height",
    "BinningHorizontal",
    "BinningVertical",
    "PixelFormat",
];

/// Error code Pylon reports for an incompletely grabbed buffer.
const INCOMPLETE_BUFFER_CODE: u32 = 0xE100_0014;

/// Output queue depth of the simulated grab engine.
const GRAB_QUEUE_DEPTH: usize = 4;

/// How a simulated model exposes its gain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GainStyle {
    /// `Gain` float node in dB.
    Decibel { max_db: f64 },
    /// `GainRaw` integer node.
    Raw { min: i64, max: i64 },
}

/// Description of a simulated camera.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub model_name: String,
    pub serial_number: String,
    /// `BaslerUsb` or `BaslerGigE`.
    pub device_class: String,
    pub sensor_width: u32,
    pub sensor_height: u32,
    pub width_inc: u32,
    pub height_inc: u32,
    pub gain_style: GainStyle,
    /// `ExposureTime` (SFNC 2) or `ExposureTimeAbs` (legacy GigE).
    pub exposure_node: &'static str,
    /// `AcquisitionFrameRate`, `AcquisitionFrameRateAbs`, or none.
    pub frame_rate_node: Option<&'static str>,
    pub max_frame_rate: f64,
}

impl SimulatedDevice {
    /// Basler dart daA1280-54um, 1280x960.
    pub fn dart_1280() -> Self {
        Self {
            model_name: "daA1280-54um".to_string(),
            serial_number: "40123456".to_string(),
            device_class: "BaslerUsb".to_string(),
            sensor_width: 1280,
            sensor_height: 960,
            width_inc: 4,
            height_inc: 2,
            gain_style: GainStyle::Decibel { max_db: 24.0 },
            exposure_node: "ExposureTime",
            frame_rate_node: Some("AcquisitionFrameRate"),
            max_frame_rate: 60.0,
        }
    }

    /// Basler ace classic acA640-120gm, 659x494, raw gain.
    pub fn ace_640_gige() -> Self {
        Self {
            model_name: "acA640-120gm".to_string(),
            serial_number: "21987654".to_string(),
            device_class: "BaslerGigE".to_string(),
            sensor_width: 659,
            sensor_height: 494,
            width_inc: 1,
            height_inc: 1,
            gain_style: GainStyle::Raw { min: 0, max: 512 },
            exposure_node: "ExposureTimeAbs",
            frame_rate_node: Some("AcquisitionFrameRateAbs"),
            max_frame_rate: 120.0,
        }
    }

    /// Basler dart daA1920-160um, 1920x1200. Absent from the pixel size table.
    pub fn dart_1920() -> Self {
        Self {
            model_name: "daA1920-160um".to_string(),
            serial_number: "40555001".to_string(),
            device_class: "BaslerUsb".to_string(),
            sensor_width: 1920,
            sensor_height: 1200,
            width_inc: 4,
            height_inc: 2,
            gain_style: GainStyle::Decibel { max_db: 24.0 },
            exposure_node: "ExposureTime",
            frame_rate_node: None,
            max_frame_rate: 160.0,
        }
    }

    /// Display name, `Basler <model> (<serial>)`.
    pub fn friendly_name(&self) -> String {
        format!("Basler {} ({})", self.model_name, self.serial_number)
    }

    /// Transport-layer unique name.
    pub fn full_name(&self) -> String {
        format!(
            "{}::{}::{}",
            self.device_class, self.model_name, self.serial_number
        )
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            full_name: self.full_name(),
            model_name: self.model_name.clone(),
            serial_number: self.serial_number.clone(),
            device_class: self.device_class.clone(),
            device_version: format!("{}-sim", self.model_name),
            vendor_name: "Basler".to_string(),
            friendly_name: self.friendly_name(),
            user_defined_name: String::new(),
        }
    }

    fn node_map(&self) -> HashMap<String, SimNode> {
        let mut nodes = HashMap::new();
        let sw = i64::from(self.sensor_width);
        let sh = i64::from(self.sensor_height);

        nodes.insert("SensorWidth".into(), SimNode::read_only(sw));
        nodes.insert("SensorHeight".into(), SimNode::read_only(sh));
        nodes.insert(
            "Width".into(),
            SimNode::integer(sw, i64::from(self.width_inc), sw, i64::from(self.width_inc)),
        );
        nodes.insert(
            "Height".into(),
            SimNode::integer(sh, i64::from(self.height_inc), sh, i64::from(self.height_inc)),
        );
        nodes.insert(
            "OffsetX".into(),
            SimNode::integer(0, 0, sw, i64::from(self.width_inc)),
        );
        nodes.insert(
            "OffsetY".into(),
            SimNode::integer(0, 0, sh, i64::from(self.height_inc)),
        );
        nodes.insert("BinningHorizontal".into(), SimNode::integer(1, 1, 4, 1));
        nodes.insert("BinningVertical".into(), SimNode::integer(1, 1, 4, 1));
        nodes.insert(
            "PixelFormat".into(),
            SimNode::enumeration("Mono8", &["Mono8", "Mono12", "Mono12p"]),
        );
        nodes.insert(
            "GainAuto".into(),
            SimNode::enumeration("Continuous", &["Off", "Once", "Continuous"]),
        );
        nodes.insert(
            "ExposureAuto".into(),
            SimNode::enumeration("Continuous", &["Off", "Once", "Continuous"]),
        );
        nodes.insert(
            self.exposure_node.into(),
            SimNode::Float {
                value: 10_000.0,
                min: 10.0,
                max: 10_000_000.0,
            },
        );
        match self.gain_style {
            GainStyle::Decibel { max_db } => {
                nodes.insert(
                    "Gain".into(),
                    SimNode::Float {
                        value: 0.0,
                        min: 0.0,
                        max: max_db,
                    },
                );
            }
            GainStyle::Raw { min, max } => {
                nodes.insert("GainRaw".into(), SimNode::integer(min, min, max, 1));
            }
        }
        if let Some(node) = self.frame_rate_node {
            nodes.insert(
                node.into(),
                SimNode::Float {
                    value: self.max_frame_rate,
                    min: 1.0,
                    max: self.max_frame_rate,
                },
            );
            nodes.insert(
                "AcquisitionFrameRateEnable".into(),
                SimNode::Boolean(false),
            );
        }
        nodes
    }
}

#[derive(Debug, Clone)]
enum SimNode {
    Integer {
        value: i64,
        min: i64,
        max: i64,
        inc: i64,
        writable: bool,
    },
    Float {
        value: f64,
        min: f64,
        max: f64,
    },
    Enumeration {
        value: String,
        entries: Vec<String>,
    },
    Boolean(bool),
}

impl SimNode {
    fn integer(value: i64, min: i64, max: i64, inc: i64) -> Self {
        SimNode::Integer {
            value,
            min,
            max,
            inc,
            writable: true,
        }
    }

    fn read_only(value: i64) -> Self {
        SimNode::Integer {
            value,
            min: value,
            max: value,
            inc: 1,
            writable: false,
        }
    }

    fn enumeration(value: &str, entries: &[&str]) -> Self {
        SimNode::Enumeration {
            value: value.to_string(),
            entries: entries.iter().map(|e| e.to_string()).collect(),
        }
    }

    fn value(&self) -> NodeValue {
        match self {
            SimNode::Integer { value, .. } => NodeValue::Integer(*value),
            SimNode::Float { value, .. } => NodeValue::Float(*value),
            SimNode::Enumeration { value, .. } => NodeValue::Enumeration(value.clone()),
            SimNode::Boolean(value) => NodeValue::Boolean(*value),
        }
    }
}

struct OpenDevice {
    device: SimulatedDevice,
    nodes: HashMap<String, SimNode>,
    grabbing: bool,
    session: u64,
    stop_tx: Option<oneshot::Sender<()>>,
    block_id: u64,
}

impl OpenDevice {
    fn new(device: SimulatedDevice, nodes: HashMap<String, SimNode>) -> Self {
        Self {
            device,
            nodes,
            grabbing: false,
            session: 0,
            stop_tx: None,
            block_id: 0,
        }
    }

    fn int(&self, name: &str) -> i64 {
        match self.nodes.get(name) {
            Some(SimNode::Integer { value, .. }) => *value,
            _ => 0,
        }
    }

    fn float(&self, name: &str) -> f64 {
        match self.nodes.get(name) {
            Some(SimNode::Float { value, .. }) => *value,
            Some(SimNode::Integer { value, .. }) => *value as f64,
            _ => 0.0,
        }
    }

    fn boolean(&self, name: &str) -> Option<bool> {
        match self.nodes.get(name) {
            Some(SimNode::Boolean(value)) => Some(*value),
            _ => None,
        }
    }

    /// Integer range, with the geometry nodes bounded by each other and by binning.
    fn integer_range(&self, name: &str) -> AppResult<IntegerRange> {
        let (min, max, inc) = match self.nodes.get(name) {
            Some(SimNode::Integer { min, max, inc, .. }) => (*min, *max, *inc),
            Some(_) => {
                return Err(DaqError::NodeTypeMismatch {
                    node: name.to_string(),
                    expected: "integer",
                })
            }
            None => return Err(DaqError::NodeNotAvailable(name.to_string())),
        };
        let binned_w = self.int("SensorWidth") / self.int("BinningHorizontal").max(1);
        let binned_h = self.int("SensorHeight") / self.int("BinningVertical").max(1);
        let max = match name {
            "Width" => binned_w - self.int("OffsetX"),
            "Height" => binned_h - self.int("OffsetY"),
            "OffsetX" => binned_w - self.int("Width"),
            "OffsetY" => binned_h - self.int("Height"),
            _ => max,
        };
        Ok(IntegerRange { min, max, inc })
    }

    fn set(&mut self, name: &str, value: NodeValue) -> AppResult<()> {
        if self.grabbing && LOCKED_WHILE_GRABBING.contains(&name) {
            return Err(DaqError::NodeLocked(name.to_string()));
        }
        let range = match self.nodes.get(name) {
            Some(SimNode::Integer { .. }) => Some(self.integer_range(name)?),
            Some(_) => None,
            None => return Err(DaqError::NodeNotAvailable(name.to_string())),
        };

        let previous_binning = match name {
            "BinningHorizontal" | "BinningVertical" => Some(self.int(name)),
            _ => None,
        };

        let Some(node) = self.nodes.get_mut(name) else {
            return Err(DaqError::NodeNotAvailable(name.to_string()));
        };
        match (node, value) {
            (
                SimNode::Integer {
                    value, writable, ..
                },
                NodeValue::Integer(v),
            ) => {
                if !*writable {
                    return Err(DaqError::Pylon(format!("Node '{name}' is not writable")));
                }
                if let Some(r) = range {
                    if v < r.min || v > r.max || (v - r.min) % r.inc.max(1) != 0 {
                        return Err(DaqError::NodeOutOfRange {
                            node: name.to_string(),
                            value: v.to_string(),
                            constraint: format!("min {}, max {}, inc {}", r.min, r.max, r.inc),
                        });
                    }
                }
                *value = v;
            }
            (SimNode::Float { value, min, max }, NodeValue::Float(v)) => {
                if v < *min || v > *max || !v.is_finite() {
                    return Err(DaqError::NodeOutOfRange {
                        node: name.to_string(),
                        value: v.to_string(),
                        constraint: format!("min {min}, max {max}"),
                    });
                }
                *value = v;
            }
            (SimNode::Float { value, min, max }, NodeValue::Integer(v)) => {
                let v = v as f64;
                if v < *min || v > *max {
                    return Err(DaqError::NodeOutOfRange {
                        node: name.to_string(),
                        value: v.to_string(),
                        constraint: format!("min {min}, max {max}"),
                    });
                }
                *value = v;
            }
            (SimNode::Enumeration { value, entries }, NodeValue::Enumeration(v)) => {
                if !entries.contains(&v) {
                    return Err(DaqError::NodeOutOfRange {
                        node: name.to_string(),
                        value: v,
                        constraint: format!("one of {}", entries.join(", ")),
                    });
                }
                *value = v;
            }
            (SimNode::Boolean(value), NodeValue::Boolean(v)) => *value = v,
            (SimNode::Integer { .. }, _) => {
                return Err(DaqError::NodeTypeMismatch {
                    node: name.to_string(),
                    expected: "integer",
                })
            }
            (SimNode::Float { .. }, _) => {
                return Err(DaqError::NodeTypeMismatch {
                    node: name.to_string(),
                    expected: "float",
                })
            }
            (SimNode::Enumeration { .. }, _) => {
                return Err(DaqError::NodeTypeMismatch {
                    node: name.to_string(),
                    expected: "enumeration",
                })
            }
            (SimNode::Boolean(_), _) => {
                return Err(DaqError::NodeTypeMismatch {
                    node: name.to_string(),
                    expected: "boolean",
                })
            }
        }

        if let Some(old) = previous_binning {
            self.rescale_after_binning(name, old);
        }
        Ok(())
    }

    /// The camera keeps the unbinned area when binning changes, shrinking
    /// the binned geometry as needed.
    fn rescale_after_binning(&mut self, binning_node: &str, old: i64) {
        let new = self.int(binning_node).max(1);
        let (size_node, offset_node, sensor_node, inc) = if binning_node == "BinningHorizontal" {
            ("Width", "OffsetX", "SensorWidth", i64::from(self.device.width_inc))
        } else {
            ("Height", "OffsetY", "SensorHeight", i64::from(self.device.height_inc))
        };
        let binned_max = self.int(sensor_node) / new;
        let size = ((self.int(size_node) * old / new) / inc * inc).clamp(inc, binned_max);
        let offset = ((self.int(offset_node) * old / new) / inc * inc).clamp(0, binned_max - size);
        if let Some(SimNode::Integer { value, .. }) = self.nodes.get_mut(size_node) {
            *value = size;
        }
        if let Some(SimNode::Integer { value, .. }) = self.nodes.get_mut(offset_node) {
            *value = offset;
        }
    }

    fn pixel_format(&self) -> PixelFormat {
        match self.nodes.get("PixelFormat") {
            Some(SimNode::Enumeration { value, .. }) => {
                PixelFormat::parse(value).unwrap_or(PixelFormat::Mono12)
            }
            _ => PixelFormat::Mono12,
        }
    }

    fn exposure_us(&self) -> f64 {
        self.float(self.device.exposure_node)
    }

    fn gain_factor(&self) -> f64 {
        match self.device.gain_style {
            GainStyle::Decibel { .. } => 10f64.powf(self.float("Gain") / 20.0),
            GainStyle::Raw { .. } => 1.0 + self.int("GainRaw") as f64 / 256.0,
        }
    }

    /// Time between frames of the grab loop.
    fn frame_period(&self) -> Duration {
        let exposure = self.exposure_us() / 1e6;
        let rate_limit = match self.device.frame_rate_node {
            Some(node) if self.boolean("AcquisitionFrameRateEnable").unwrap_or(false) => {
                1.0 / self.float(node).max(1e-3)
            }
            _ => 1.0 / self.device.max_frame_rate,
        };
        Duration::from_secs_f64(exposure.max(rate_limit).clamp(1e-3, 10.0))
    }

    /// Synthetic frame: a diagonal sensor gradient scaled by exposure and gain.
    fn synthesize(&mut self, rng: &mut StdRng) -> GrabbedImage {
        let width = self.int("Width").max(0) as u32;
        let height = self.int("Height").max(0) as u32;
        let (ox, oy) = (self.int("OffsetX"), self.int("OffsetY"));
        let (bh, bv) = (
            self.int("BinningHorizontal").max(1),
            self.int("BinningVertical").max(1),
        );
        let pixel_format = self.pixel_format();
        let full_scale = f64::from((1u32 << pixel_format.bit_depth()) - 1);
        let scale = (self.exposure_us() / 10_000.0) * self.gain_factor();
        let diagonal = (self.int("SensorWidth") + self.int("SensorHeight")).max(1) as f64;

        let mut pixels = Vec::with_capacity(width as usize * height as usize);
        for y in 0..i64::from(height) {
            for x in 0..i64::from(width) {
                let sx = (ox + x) * bh;
                let sy = (oy + y) * bv;
                let base = 0.8 * full_scale * (sx + sy) as f64 / diagonal;
                let noise: f64 = rng.gen_range(-4.0..4.0);
                pixels.push((base * scale + noise).clamp(0.0, full_scale) as u16);
            }
        }

        self.block_id += 1;
        GrabbedImage {
            width,
            height,
            pixel_format,
            pixels,
            block_id: self.block_id,
            timestamp_ns: chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0),
        }
    }
}

struct MockState {
    devices: Vec<SimulatedDevice>,
    removed: HashSet<String>,
    open: HashMap<DeviceHandle, OpenDevice>,
    /// Node values of closed devices by serial number, kept like camera RAM.
    retained: HashMap<String, HashMap<String, SimNode>>,
    next_handle: u32,
    failing_grabs: u32,
}

impl MockState {
    fn device(&mut self, handle: DeviceHandle) -> AppResult<&mut OpenDevice> {
        let removed = match self.open.get(&handle) {
            Some(dev) => self.removed.contains(&dev.device.serial_number),
            None => return Err(DaqError::CameraNotOpen(handle.to_string())),
        };
        let dev = self
            .open
            .get_mut(&handle)
            .ok_or_else(|| DaqError::CameraNotOpen(handle.to_string()))?;
        if removed {
            return Err(DaqError::CameraRemoved(dev.device.friendly_name()));
        }
        Ok(dev)
    }
}

/// Simulated Pylon transport layer.
pub struct MockPylonAdapter {
    state: Arc<Mutex<MockState>>,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockPylonAdapter {
    /// Adapter with a dart and an ace camera attached.
    pub fn new() -> Self {
        Self::with_devices(vec![
            SimulatedDevice::dart_1280(),
            SimulatedDevice::ace_640_gige(),
        ])
    }

    /// Adapter with exactly these devices attached.
    pub fn with_devices(devices: Vec<SimulatedDevice>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                devices,
                removed: HashSet::new(),
                open: HashMap::new(),
                retained: HashMap::new(),
                next_handle: 1,
                failing_grabs: 0,
            })),
        }
    }

    /// Make the next `count` grabs fail with an incomplete-buffer error.
    pub fn fail_next_grabs(&self, count: u32) {
        lock(&self.state).failing_grabs = count;
    }

    /// Simulate unplugging the device with this serial number.
    pub fn remove_device(&self, serial_number: &str) {
        let mut state = lock(&self.state);
        state.removed.insert(serial_number.to_string());
        tracing::info!(serial_number, "Mock device removed");
    }

    /// Number of currently opened devices.
    pub fn open_count(&self) -> usize {
        lock(&self.state).open.len()
    }
}

impl Default for MockPylonAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl PylonAdapter for MockPylonAdapter {
    fn enumerate_devices(&self) -> AppResult<Vec<DeviceInfo>> {
        let state = lock(&self.state);
        Ok(state
            .devices
            .iter()
            .filter(|d| !state.removed.contains(&d.serial_number))
            .map(SimulatedDevice::device_info)
            .collect())
    }

    fn open(&self, full_name: &str) -> AppResult<DeviceHandle> {
        let mut state = lock(&self.state);
        let device = state
            .devices
            .iter()
            .find(|d| d.full_name() == full_name && !state.removed.contains(&d.serial_number))
            .cloned()
            .ok_or_else(|| DaqError::CameraNotFound(full_name.to_string()))?;

        if state
            .open
            .values()
            .any(|d| d.device.serial_number == device.serial_number)
        {
            return Err(DaqError::Pylon(format!(
                "Device {} is exclusively opened by another client",
                device.friendly_name()
            )));
        }

        let handle = DeviceHandle(state.next_handle);
        state.next_handle += 1;
        tracing::info!(%handle, model = %device.model_name, "Mock camera opened");
        let nodes = state
            .retained
            .remove(&device.serial_number)
            .unwrap_or_else(|| device.node_map());
        state.open.insert(handle, OpenDevice::new(device, nodes));
        Ok(handle)
    }

    fn close(&self, handle: DeviceHandle) -> AppResult<()> {
        let mut state = lock(&self.state);
        match state.open.remove(&handle) {
            Some(mut dev) => {
                if let Some(tx) = dev.stop_tx.take() {
                    let _ = tx.send(());
                }
                state
                    .retained
                    .insert(dev.device.serial_number.clone(), dev.nodes);
                tracing::info!(%handle, "Mock camera closed");
                Ok(())
            }
            None => Err(DaqError::CameraNotOpen(handle.to_string())),
        }
    }

    fn device_info(&self, handle: DeviceHandle) -> AppResult<DeviceInfo> {
        let mut state = lock(&self.state);
        Ok(state.device(handle)?.device.device_info())
    }

    fn has_node(&self, handle: DeviceHandle, name: &str) -> bool {
        lock(&self.state)
            .open
            .get(&handle)
            .is_some_and(|d| d.nodes.contains_key(name))
    }

    fn get_node(&self, handle: DeviceHandle, name: &str) -> AppResult<NodeValue> {
        let mut state = lock(&self.state);
        state
            .device(handle)?
            .nodes
            .get(name)
            .map(SimNode::value)
            .ok_or_else(|| DaqError::NodeNotAvailable(name.to_string()))
    }

    fn set_node(&self, handle: DeviceHandle, name: &str, value: NodeValue) -> AppResult<()> {
        let mut state = lock(&self.state);
        let dev = state.device(handle)?;
        tracing::trace!(%handle, node = name, %value, "Mock node write");
        dev.set(name, value)
    }

    fn integer_range(&self, handle: DeviceHandle, name: &str) -> AppResult<IntegerRange> {
        let mut state = lock(&self.state);
        state.device(handle)?.integer_range(name)
    }

    fn float_range(&self, handle: DeviceHandle, name: &str) -> AppResult<FloatRange> {
        let mut state = lock(&self.state);
        match state.device(handle)?.nodes.get(name) {
            Some(SimNode::Float { min, max, .. }) => Ok(FloatRange {
                min: *min,
                max: *max,
            }),
            Some(_) => Err(DaqError::NodeTypeMismatch {
                node: name.to_string(),
                expected: "float",
            }),
            None => Err(DaqError::NodeNotAvailable(name.to_string())),
        }
    }

    fn grab_one(&self, handle: DeviceHandle, timeout: Duration) -> AppResult<GrabbedImage> {
        let mut state = lock(&self.state);
        let failing = state.failing_grabs > 0;
        if failing {
            state.failing_grabs -= 1;
        }
        let dev = state.device(handle)?;
        if dev.grabbing {
            return Err(DaqError::Acquisition(
                "Cannot grab one image while the camera is grabbing".to_string(),
            ));
        }
        if dev.exposure_us() / 1e3 > timeout.as_secs_f64() * 1e3 {
            return Err(DaqError::Timeout(timeout.as_millis() as u64));
        }
        if failing {
            return Err(DaqError::GrabFailed {
                code: INCOMPLETE_BUFFER_CODE,
                description: "The buffer was incompletely grabbed".to_string(),
            });
        }
        let mut rng = StdRng::from_entropy();
        Ok(dev.synthesize(&mut rng))
    }

    fn start_grabbing(
        self: Arc<Self>,
        handle: DeviceHandle,
        strategy: GrabStrategy,
    ) -> AppResult<(mpsc::Receiver<GrabEvent>, GrabGuard)> {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let session = {
            let mut state = lock(&self.state);
            let dev = state.device(handle)?;
            if dev.grabbing {
                return Err(DaqError::Acquisition(format!(
                    "Grabbing already in progress for {handle}"
                )));
            }
            dev.grabbing = true;
            dev.session += 1;
            dev.stop_tx = Some(stop_tx);
            dev.session
        };

        let capacity = match strategy {
            GrabStrategy::OneByOne => 16,
            GrabStrategy::LatestImageOnly => GRAB_QUEUE_DEPTH,
        };
        let (tx, rx) = mpsc::channel(capacity);
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let mut rng = StdRng::from_entropy();
            let mut skipped = 0u64;

            loop {
                let period = match lock(&state).open.get(&handle) {
                    Some(dev) => dev.frame_period(),
                    None => break,
                };

                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = &mut stop_rx => {
                        tracing::debug!(%handle, "Mock grab loop stopped via signal");
                        break;
                    }
                }

                let event = {
                    let mut guard = lock(&state);
                    let st = &mut *guard;
                    let failing = st.failing_grabs > 0;
                    if failing {
                        st.failing_grabs -= 1;
                    }
                    match st.device(handle) {
                        Err(DaqError::CameraRemoved(_)) => GrabEvent::DeviceRemoved,
                        Err(_) => break,
                        Ok(_) if failing => GrabEvent::Failed {
                            code: INCOMPLETE_BUFFER_CODE,
                            description: "The buffer was incompletely grabbed".to_string(),
                        },
                        Ok(dev) => GrabEvent::Grabbed(dev.synthesize(&mut rng)),
                    }
                };

                if matches!(event, GrabEvent::DeviceRemoved) {
                    let _ = tx.send(event).await;
                    break;
                }

                match strategy {
                    GrabStrategy::OneByOne => {
                        if tx.send(event).await.is_err() {
                            tracing::debug!(%handle, "Grab receiver dropped");
                            break;
                        }
                    }
                    GrabStrategy::LatestImageOnly => {
                        if skipped > 0 {
                            match tx.try_send(GrabEvent::Skipped(skipped)) {
                                Ok(()) => skipped = 0,
                                Err(TrySendError::Full(_)) => {}
                                Err(TrySendError::Closed(_)) => break,
                            }
                        }
                        match tx.try_send(event) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => skipped += 1,
                            Err(TrySendError::Closed(_)) => {
                                tracing::debug!(%handle, "Grab receiver dropped");
                                break;
                            }
                        }
                    }
                }
            }

            let mut state = lock(&state);
            if let Some(dev) = state.open.get_mut(&handle) {
                if dev.session == session {
                    dev.grabbing = false;
                    dev.stop_tx = None;
                }
            }
        });

        tracing::info!(%handle, ?strategy, "Mock grabbing started");
        let adapter: Arc<dyn PylonAdapter> = self;
        Ok((rx, GrabGuard::new(adapter, handle)))
    }

    fn stop_grabbing(&self, handle: DeviceHandle) -> AppResult<()> {
        let mut state = lock(&self.state);
        if let Some(dev) = state.open.get_mut(&handle) {
            if let Some(tx) = dev.stop_tx.take() {
                let _ = tx.send(());
                tracing::info!(%handle, "Mock grabbing stopped");
            }
            dev.grabbing = false;
        }
        Ok(())
    }

    fn is_grabbing(&self, handle: DeviceHandle) -> bool {
        lock(&self.state)
            .open
            .get(&handle)
            .is_some_and(|d| d.grabbing)
    }
}
