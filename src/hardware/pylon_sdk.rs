//! Pylon SDK backend (feature `pylon_hardware`)
//!
//! The SDK objects borrow the Pylon runtime and are not `Send`, so one
//! dedicated thread owns the runtime, the transport-layer factory and every
//! opened camera. [`PylonSdkAdapter`] forwards trait calls to that thread over
//! a command channel and waits for the reply. Grab loops are polled on the same
//! thread between commands.

use std::collections::HashMap;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::{AppResult, DaqError};
use crate::hardware::pylon_adapter::{
    DeviceHandle, FloatRange, GrabEvent, GrabGuard, GrabStrategy, GrabbedImage, IntegerRange,
    NodeValue, PylonAdapter,
};
use crate::traits::camera_sensor::{DeviceInfo, PixelFormat};

/// Poll period of running grab loops.
const GRAB_POLL_MS: u32 = 5;
const GRAB_QUEUE_DEPTH: usize = 4;

type Reply<T> = std_mpsc::SyncSender<AppResult<T>>;

enum Command {
    Enumerate(Reply<Vec<DeviceInfo>>),
    Open(String, Reply<DeviceHandle>),
    Close(DeviceHandle, Reply<()>),
    Info(DeviceHandle, Reply<DeviceInfo>),
    HasNode(DeviceHandle, String, Reply<bool>),
    GetNode(DeviceHandle, String, Reply<NodeValue>),
    SetNode(DeviceHandle, String, NodeValue, Reply<()>),
    IntegerRange(DeviceHandle, String, Reply<IntegerRange>),
    FloatRange(DeviceHandle, String, Reply<FloatRange>),
    GrabOne(DeviceHandle, Duration, Reply<GrabbedImage>),
    StartGrabbing(DeviceHandle, GrabStrategy, mpsc::Sender<GrabEvent>, Reply<()>),
    StopGrabbing(DeviceHandle, Reply<()>),
    IsGrabbing(DeviceHandle, Reply<bool>),
}

fn sdk_error(e: impl std::fmt::Display) -> DaqError {
    DaqError::Pylon(e.to_string())
}

/// Adapter backed by the Basler Pylon SDK.
pub struct PylonSdkAdapter {
    commands: Mutex<std_mpsc::Sender<Command>>,
}

impl PylonSdkAdapter {
    /// Start the SDK thread and initialize the Pylon runtime.
    pub fn new() -> AppResult<Self> {
        let (tx, rx) = std_mpsc::channel();
        thread::Builder::new()
            .name("pylon-sdk".to_string())
            .spawn(move || sdk_thread(rx))
            .map_err(DaqError::Io)?;
        tracing::info!("Pylon SDK thread started");
        Ok(Self {
            commands: Mutex::new(tx),
        })
    }

    fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> AppResult<T> {
        let (reply_tx, reply_rx) = std_mpsc::sync_channel(1);
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(build(reply_tx))
            .map_err(|_| DaqError::Pylon("Pylon SDK thread has exited".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| DaqError::Pylon("Pylon SDK thread dropped the request".to_string()))?
    }
}

impl PylonAdapter for PylonSdkAdapter {
    fn enumerate_devices(&self) -> AppResult<Vec<DeviceInfo>> {
        self.call(Command::Enumerate)
    }

    fn open(&self, full_name: &str) -> AppResult<DeviceHandle> {
        self.call(|r| Command::Open(full_name.to_string(), r))
    }

    fn close(&self, handle: DeviceHandle) -> AppResult<()> {
        self.call(|r| Command::Close(handle, r))
    }

    fn device_info(&self, handle: DeviceHandle) -> AppResult<DeviceInfo> {
        self.call(|r| Command::Info(handle, r))
    }

    fn has_node(&self, handle: DeviceHandle, name: &str) -> bool {
        self.call(|r| Command::HasNode(handle, name.to_string(), r))
            .unwrap_or(false)
    }

    fn get_node(&self, handle: DeviceHandle, name: &str) -> AppResult<NodeValue> {
        self.call(|r| Command::GetNode(handle, name.to_string(), r))
    }

    fn set_node(&self, handle: DeviceHandle, name: &str, value: NodeValue) -> AppResult<()> {
        self.call(|r| Command::SetNode(handle, name.to_string(), value, r))
    }

    fn integer_range(&self, handle: DeviceHandle, name: &str) -> AppResult<IntegerRange> {
        self.call(|r| Command::IntegerRange(handle, name.to_string(), r))
    }

    fn float_range(&self, handle: DeviceHandle, name: &str) -> AppResult<FloatRange> {
        self.call(|r| Command::FloatRange(handle, name.to_string(), r))
    }

    fn grab_one(&self, handle: DeviceHandle, timeout: Duration) -> AppResult<GrabbedImage> {
        self.call(|r| Command::GrabOne(handle, timeout, r))
    }

    fn start_grabbing(
        self: Arc<Self>,
        handle: DeviceHandle,
        strategy: GrabStrategy,
    ) -> AppResult<(mpsc::Receiver<GrabEvent>, GrabGuard)> {
        let (tx, rx) = mpsc::channel(GRAB_QUEUE_DEPTH);
        self.call(|r| Command::StartGrabbing(handle, strategy, tx, r))?;
        let adapter: Arc<dyn PylonAdapter> = self;
        Ok((rx, GrabGuard::new(adapter, handle)))
    }

    fn stop_grabbing(&self, handle: DeviceHandle) -> AppResult<()> {
        self.call(|r| Command::StopGrabbing(handle, r))
    }

    fn is_grabbing(&self, handle: DeviceHandle) -> bool {
        self.call(|r| Command::IsGrabbing(handle, r)).unwrap_or(false)
    }
}

struct GrabLoop {
    strategy: GrabStrategy,
    events: mpsc::Sender<GrabEvent>,
    pixel_format: PixelFormat,
    skipped: u64,
    block_id: u64,
}

struct OpenCamera<'a> {
    camera: pylon_cxx::InstantCamera<'a>,
    grab: Option<GrabLoop>,
}

fn sdk_thread(commands: std_mpsc::Receiver<Command>) {
    let pylon = pylon_cxx::Pylon::new();
    let factory = pylon_cxx::TlFactory::instance(&pylon);
    let mut cameras: HashMap<DeviceHandle, OpenCamera<'_>> = HashMap::new();
    let mut next_handle = 1u32;

    loop {
        let grabbing = cameras.values().any(|c| c.grab.is_some());
        let command = if grabbing {
            match commands.try_recv() {
                Ok(cmd) => Some(cmd),
                Err(std_mpsc::TryRecvError::Empty) => None,
                Err(std_mpsc::TryRecvError::Disconnected) => break,
            }
        } else {
            match commands.recv() {
                Ok(cmd) => Some(cmd),
                Err(_) => break,
            }
        };

        if let Some(command) = command {
            handle_command(&factory, &mut cameras, &mut next_handle, command);
        }
        for open in cameras.values_mut() {
            poll_grab(open);
        }
    }

    for (_, open) in cameras.drain() {
        let _ = open.camera.stop_grabbing();
        let _ = open.camera.close();
    }
    tracing::info!("Pylon SDK thread exited");
}

fn handle_command<'a>(
    factory: &'a pylon_cxx::TlFactory<'a>,
    cameras: &mut HashMap<DeviceHandle, OpenCamera<'a>>,
    next_handle: &mut u32,
    command: Command,
) {
    fn camera<'c, 'a>(
        cameras: &'c mut HashMap<DeviceHandle, OpenCamera<'a>>,
        handle: DeviceHandle,
    ) -> AppResult<&'c mut OpenCamera<'a>> {
        cameras
            .get_mut(&handle)
            .ok_or_else(|| DaqError::CameraNotOpen(handle.to_string()))
    }

    match command {
        Command::Enumerate(reply) => {
            let result = factory
                .enumerate_devices()
                .map_err(sdk_error)
                .map(|devices| devices.iter().map(device_info).collect());
            let _ = reply.send(result);
        }
        Command::Open(full_name, reply) => {
            let result = (|| {
                let devices = factory.enumerate_devices().map_err(sdk_error)?;
                let info = devices
                    .iter()
                    .find(|d| d.property_value("FullName").ok().as_deref() == Some(&full_name))
                    .ok_or_else(|| DaqError::CameraNotFound(full_name.clone()))?;
                let camera = factory.create_device(info).map_err(sdk_error)?;
                camera.open().map_err(sdk_error)?;
                let handle = DeviceHandle(*next_handle);
                *next_handle += 1;
                cameras.insert(handle, OpenCamera { camera, grab: None });
                Ok(handle)
            })();
            let _ = reply.send(result);
        }
        Command::Close(handle, reply) => {
            let result = match cameras.remove(&handle) {
                Some(open) => {
                    let _ = open.camera.stop_grabbing();
                    open.camera.close().map_err(sdk_error)
                }
                None => Err(DaqError::CameraNotOpen(handle.to_string())),
            };
            let _ = reply.send(result);
        }
        Command::Info(handle, reply) => {
            let result = camera(cameras, handle).map(|c| device_info(c.camera.device_info()));
            let _ = reply.send(result);
        }
        Command::HasNode(handle, name, reply) => {
            let result = camera(cameras, handle).map(|c| read_node(&c.camera, &name).is_ok());
            let _ = reply.send(result);
        }
        Command::GetNode(handle, name, reply) => {
            let result = camera(cameras, handle).and_then(|c| read_node(&c.camera, &name));
            let _ = reply.send(result);
        }
        Command::SetNode(handle, name, value, reply) => {
            let result = camera(cameras, handle).and_then(|c| write_node(&c.camera, &name, value));
            let _ = reply.send(result);
        }
        Command::IntegerRange(handle, name, reply) => {
            let result = camera(cameras, handle).and_then(|c| {
                let node_map = c.camera.node_map().map_err(sdk_error)?;
                let node = node_map
                    .integer_node(&name)
                    .map_err(|_| DaqError::NodeNotAvailable(name.clone()))?;
                Ok(IntegerRange {
                    min: node.min().map_err(sdk_error)?,
                    max: node.max().map_err(sdk_error)?,
                    inc: node.inc().map_err(sdk_error)?,
                })
            });
            let _ = reply.send(result);
        }
        Command::FloatRange(handle, name, reply) => {
            let result = camera(cameras, handle).and_then(|c| {
                let node_map = c.camera.node_map().map_err(sdk_error)?;
                let node = node_map
                    .float_node(&name)
                    .map_err(|_| DaqError::NodeNotAvailable(name.clone()))?;
                Ok(FloatRange {
                    min: node.min().map_err(sdk_error)?,
                    max: node.max().map_err(sdk_error)?,
                })
            });
            let _ = reply.send(result);
        }
        Command::GrabOne(handle, timeout, reply) => {
            let result = camera(cameras, handle).and_then(|c| {
                if c.grab.is_some() {
                    return Err(DaqError::Acquisition(
                        "Cannot grab one image while the camera is grabbing".to_string(),
                    ));
                }
                let pixel_format = current_pixel_format(&c.camera);
                c.camera
                    .start_grabbing(&pylon_cxx::GrabOptions::default().count(1))
                    .map_err(sdk_error)?;
                let mut result = pylon_cxx::GrabResult::new().map_err(sdk_error)?;
                let timeout_ms = timeout.as_millis() as u32;
                let retrieved = c.camera.retrieve_result(
                    timeout_ms,
                    &mut result,
                    pylon_cxx::TimeoutHandling::Return,
                );
                let _ = c.camera.stop_grabbing();
                if !retrieved.map_err(sdk_error)? {
                    return Err(DaqError::Timeout(u64::from(timeout_ms)));
                }
                match convert_result(&result, pixel_format, 1)? {
                    GrabEvent::Grabbed(image) => Ok(image),
                    GrabEvent::Failed { code, description } => {
                        Err(DaqError::GrabFailed { code, description })
                    }
                    _ => Err(DaqError::Acquisition("Unexpected grab result".to_string())),
                }
            });
            let _ = reply.send(result);
        }
        Command::StartGrabbing(handle, strategy, events, reply) => {
            let result = camera(cameras, handle).and_then(|c| {
                if c.grab.is_some() {
                    return Err(DaqError::Acquisition(format!(
                        "Grabbing already in progress for {handle}"
                    )));
                }
                let pixel_format = current_pixel_format(&c.camera);
                c.camera
                    .start_grabbing(&pylon_cxx::GrabOptions::default())
                    .map_err(sdk_error)?;
                c.grab = Some(GrabLoop {
                    strategy,
                    events,
                    pixel_format,
                    skipped: 0,
                    block_id: 0,
                });
                tracing::info!(%handle, ?strategy, "Pylon grabbing started");
                Ok(())
            });
            let _ = reply.send(result);
        }
        Command::StopGrabbing(handle, reply) => {
            let result = match cameras.get_mut(&handle) {
                Some(open) if open.grab.take().is_some() => {
                    tracing::info!(%handle, "Pylon grabbing stopped");
                    open.camera.stop_grabbing().map_err(sdk_error)
                }
                _ => Ok(()),
            };
            let _ = reply.send(result);
        }
        Command::IsGrabbing(handle, reply) => {
            let result = Ok(cameras.get(&handle).is_some_and(|c| c.grab.is_some()));
            let _ = reply.send(result);
        }
    }
}

fn poll_grab(open: &mut OpenCamera<'_>) {
    let Some(grab) = open.grab.as_mut() else {
        return;
    };
    let mut result = match pylon_cxx::GrabResult::new() {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("Cannot allocate grab result: {}", e);
            return;
        }
    };
    let event = match open.camera.retrieve_result(
        GRAB_POLL_MS,
        &mut result,
        pylon_cxx::TimeoutHandling::Return,
    ) {
        Ok(false) => return,
        Ok(true) => {
            grab.block_id += 1;
            match convert_result(&result, grab.pixel_format, grab.block_id) {
                Ok(event) => event,
                Err(e) => GrabEvent::Failed {
                    code: 0,
                    description: e.to_string(),
                },
            }
        }
        Err(e) if open.camera.is_camera_device_removed().unwrap_or(false) => {
            tracing::warn!("Camera removed: {}", e);
            GrabEvent::DeviceRemoved
        }
        Err(e) => GrabEvent::Failed {
            code: 0,
            description: e.to_string(),
        },
    };

    let removed = matches!(event, GrabEvent::DeviceRemoved);
    let closed = match grab.strategy {
        _ if removed => grab.events.blocking_send(event).is_err(),
        GrabStrategy::OneByOne => grab.events.blocking_send(event).is_err(),
        GrabStrategy::LatestImageOnly => {
            if grab.skipped > 0
                && grab
                    .events
                    .try_send(GrabEvent::Skipped(grab.skipped))
                    .is_ok()
            {
                grab.skipped = 0;
            }
            match grab.events.try_send(event) {
                Ok(()) => false,
                Err(TrySendError::Full(_)) => {
                    grab.skipped += 1;
                    false
                }
                Err(TrySendError::Closed(_)) => true,
            }
        }
    };
    if removed || closed {
        open.grab = None;
        let _ = open.camera.stop_grabbing();
    }
}

fn convert_result(
    result: &pylon_cxx::GrabResult,
    pixel_format: PixelFormat,
    block_id: u64,
) -> AppResult<GrabEvent> {
    if !result.grab_succeeded().map_err(sdk_error)? {
        return Ok(GrabEvent::Failed {
            code: result.error_code().map_err(sdk_error)?,
            description: result.error_description().map_err(sdk_error)?,
        });
    }
    let width = result.width().map_err(sdk_error)?;
    let height = result.height().map_err(sdk_error)?;
    let buffer = result.buffer().map_err(sdk_error)?;
    let pixels = match pixel_format {
        PixelFormat::Mono8 => buffer.iter().map(|&b| u16::from(b)).collect(),
        _ => buffer
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect(),
    };
    Ok(GrabEvent::Grabbed(GrabbedImage {
        width,
        height,
        pixel_format,
        pixels,
        block_id,
        timestamp_ns: chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0),
    }))
}

fn current_pixel_format(camera: &pylon_cxx::InstantCamera<'_>) -> PixelFormat {
    match read_node(camera, "PixelFormat") {
        Ok(NodeValue::Enumeration(entry)) => PixelFormat::parse(&entry).unwrap_or(PixelFormat::Mono12),
        _ => PixelFormat::Mono12,
    }
}

fn device_info(info: &pylon_cxx::DeviceInfo) -> DeviceInfo {
    let property = |name: &str| info.property_value(name).unwrap_or_default();
    DeviceInfo {
        full_name: property("FullName"),
        model_name: property("ModelName"),
        serial_number: property("SerialNumber"),
        device_class: property("DeviceClass"),
        device_version: property("DeviceVersion"),
        vendor_name: property("VendorName"),
        friendly_name: property("FriendlyName"),
        user_defined_name: property("UserDefinedName"),
    }
}

/// Read a node, trying each GenICam interface type in turn.
fn read_node(camera: &pylon_cxx::InstantCamera<'_>, name: &str) -> AppResult<NodeValue> {
    let node_map = camera.node_map().map_err(sdk_error)?;
    if let Ok(node) = node_map.integer_node(name) {
        return node.value().map(NodeValue::Integer).map_err(sdk_error);
    }
    if let Ok(node) = node_map.float_node(name) {
        return node.value().map(NodeValue::Float).map_err(sdk_error);
    }
    if let Ok(node) = node_map.enum_node(name) {
        return node.value().map(NodeValue::Enumeration).map_err(sdk_error);
    }
    if let Ok(node) = node_map.boolean_node(name) {
        return node.value().map(NodeValue::Boolean).map_err(sdk_error);
    }
    Err(DaqError::NodeNotAvailable(name.to_string()))
}

fn write_node(
    camera: &pylon_cxx::InstantCamera<'_>,
    name: &str,
    value: NodeValue,
) -> AppResult<()> {
    let node_map = camera.node_map().map_err(sdk_error)?;
    let mismatch = |expected| DaqError::NodeTypeMismatch {
        node: name.to_string(),
        expected,
    };
    let written = match value {
        NodeValue::Integer(v) => match node_map.integer_node(name) {
            Ok(mut node) => node.set_value(v),
            Err(_) => match node_map.float_node(name) {
                Ok(mut node) => node.set_value(v as f64),
                Err(_) => return Err(mismatch("integer")),
            },
        },
        NodeValue::Float(v) => match node_map.float_node(name) {
            Ok(mut node) => node.set_value(v),
            Err(_) => return Err(mismatch("float")),
        },
        NodeValue::Enumeration(v) => match node_map.enum_node(name) {
            Ok(mut node) => node.set_value(&v),
            Err(_) => return Err(mismatch("enumeration")),
        },
        NodeValue::Boolean(v) => match node_map.boolean_node(name) {
            Ok(mut node) => node.set_value(v),
            Err(_) => return Err(mismatch("boolean")),
        },
    };
    written.map_err(|e| {
        if camera.is_grabbing() {
            DaqError::NodeLocked(name.to_string())
        } else {
            sdk_error(e)
        }
    })
}
