//! Basler camera controller
//!
//! Drives one Basler camera through a [`PylonAdapter`] and implements the
//! [`CameraSensor`] contract on top of it. Every open puts the camera into a
//! known state: 12-bit mono pixels, automatic gain and exposure off.
//!
//! Continuous grabbing runs on a tokio task that converts adapter events to
//! [`Frame`]s. Skipped images and failed grabs are logged, a removed device is
//! broadcast to [`BaslerCamera::subscribe_removed`] receivers.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use crate::error::{AppResult, DaqError};
use crate::hardware::pixel_size::pixel_length_um;
use crate::hardware::pylon_adapter::{
    DeviceHandle, GrabEvent, GrabGuard, GrabStrategy, GrabbedImage, NodeValue, PylonAdapter,
};
use crate::traits::camera_sensor::{CameraSensor, DeviceInfo, Frame, PixelFormat, Roi};

/// Default timeout of single-image grabs.
pub const DEFAULT_GRAB_TIMEOUT: Duration = Duration::from_millis(1000);

/// Clamp a detector coordinate into `[0, max]`.
pub fn detector_clamp(value: i64, max: u32) -> u32 {
    value.clamp(0, i64::from(max)) as u32
}

/// How the camera exposes its gain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GainMode {
    /// `Gain` float node, in dB.
    Decibel,
    /// `GainRaw` integer node, in device units.
    Raw,
}

impl GainMode {
    fn node(self) -> &'static str {
        match self {
            GainMode::Decibel => "Gain",
            GainMode::Raw => "GainRaw",
        }
    }
}

struct GrabSession {
    guard: GrabGuard,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Controller of one opened Basler camera.
pub struct BaslerCamera {
    adapter: Arc<dyn PylonAdapter>,
    handle: Option<DeviceHandle>,
    info: DeviceInfo,
    gain_mode: Option<GainMode>,
    exposure_node: &'static str,
    pixel_length: Option<f64>,
    grab_timeout: Duration,
    session: Option<GrabSession>,
    latest: Arc<Mutex<Option<Frame>>>,
    removed_tx: broadcast::Sender<String>,
}

impl BaslerCamera {
    /// All cameras visible to the adapter.
    pub fn list_cameras(adapter: &dyn PylonAdapter) -> AppResult<Vec<DeviceInfo>> {
        adapter.enumerate_devices()
    }

    /// Open the camera whose friendly name matches.
    pub fn open_by_friendly_name(
        adapter: Arc<dyn PylonAdapter>,
        friendly_name: &str,
    ) -> AppResult<Self> {
        let info = adapter
            .enumerate_devices()?
            .into_iter()
            .find(|d| d.friendly_name == friendly_name)
            .ok_or_else(|| DaqError::CameraNotFound(friendly_name.to_string()))?;
        Self::open(adapter, &info.full_name)
    }

    /// Open a camera by transport-layer full name and apply the default configuration.
    pub fn open(adapter: Arc<dyn PylonAdapter>, full_name: &str) -> AppResult<Self> {
        let handle = adapter.open(full_name)?;
        let info = match adapter.device_info(handle) {
            Ok(info) => info,
            Err(e) => {
                let _ = adapter.close(handle);
                return Err(e);
            }
        };
        let (removed_tx, _) = broadcast::channel(4);

        let mut camera = Self {
            adapter,
            handle: Some(handle),
            pixel_length: pixel_length_um(&info.model_name),
            info,
            gain_mode: None,
            exposure_node: "ExposureTime",
            grab_timeout: DEFAULT_GRAB_TIMEOUT,
            session: None,
            latest: Arc::new(Mutex::new(None)),
            removed_tx,
        };
        if let Err(e) = camera.configure() {
            let _ = camera.close();
            return Err(e);
        }

        info!(
            camera = %camera.info.friendly_name,
            gain_mode = ?camera.gain_mode,
            exposure_node = camera.exposure_node,
            "Basler camera opened"
        );
        Ok(camera)
    }

    fn configure(&mut self) -> AppResult<()> {
        let handle = self.handle()?;
        for (node, entry) in [
            ("PixelFormat", PixelFormat::Mono12.as_str()),
            ("GainAuto", "Off"),
            ("ExposureAuto", "Off"),
        ] {
            if self.adapter.has_node(handle, node) {
                self.adapter
                    .set_node(handle, node, NodeValue::Enumeration(entry.to_string()))?;
            }
        }

        self.gain_mode = if self.adapter.has_node(handle, "Gain") {
            Some(GainMode::Decibel)
        } else if self.adapter.has_node(handle, "GainRaw") {
            Some(GainMode::Raw)
        } else {
            None
        };
        self.exposure_node = if self.adapter.has_node(handle, "ExposureTime") {
            "ExposureTime"
        } else {
            "ExposureTimeAbs"
        };
        Ok(())
    }

    /// Use a different timeout for single-image grabs.
    pub fn with_grab_timeout(mut self, timeout: Duration) -> Self {
        self.grab_timeout = timeout;
        self
    }

    fn handle(&self) -> AppResult<DeviceHandle> {
        self.handle
            .ok_or_else(|| DaqError::CameraNotOpen(self.info.friendly_name.clone()))
    }

    fn int_node(&self, name: &str) -> AppResult<i64> {
        self.adapter.get_node(self.handle()?, name)?.into_integer(name)
    }

    /// Whether the device is still open.
    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Model name reported by the device.
    pub fn model_name(&self) -> &str {
        &self.info.model_name
    }

    /// Pixel pitch in um, `None` if the model is not in the table.
    pub fn pixel_length(&self) -> Option<f64> {
        self.pixel_length
    }

    /// Override the pixel pitch, in um.
    pub fn set_pixel_length(&mut self, um: f64) {
        self.pixel_length = Some(um);
    }

    /// Whether the gain is in raw device units instead of dB.
    pub fn raw_gain(&self) -> bool {
        self.gain_mode == Some(GainMode::Raw)
    }

    /// Current gain, in dB or raw units depending on [`Self::raw_gain`].
    pub fn gain(&self) -> AppResult<f64> {
        let mode = self
            .gain_mode
            .ok_or_else(|| DaqError::NodeNotAvailable("Gain".to_string()))?;
        self.adapter
            .get_node(self.handle()?, mode.node())?
            .into_float(mode.node())
    }

    /// Set the gain, clamped to the node range. Raw gains are rounded.
    pub fn set_gain(&mut self, value: f64) -> AppResult<()> {
        let handle = self.handle()?;
        match self.gain_mode {
            Some(GainMode::Decibel) => {
                let range = self.adapter.float_range(handle, "Gain")?;
                let value = value.clamp(range.min, range.max);
                self.adapter.set_node(handle, "Gain", NodeValue::Float(value))
            }
            Some(GainMode::Raw) => {
                let range = self.adapter.integer_range(handle, "GainRaw")?;
                let value = range.floor(value.round() as i64);
                self.adapter
                    .set_node(handle, "GainRaw", NodeValue::Integer(value))
            }
            None => Err(DaqError::NodeNotAvailable("Gain".to_string())),
        }
    }

    /// Switch continuous automatic exposure on or off.
    pub fn set_auto_exposure(&mut self, enabled: bool) -> AppResult<()> {
        let entry = if enabled { "Continuous" } else { "Off" };
        self.adapter.set_node(
            self.handle()?,
            "ExposureAuto",
            NodeValue::Enumeration(entry.to_string()),
        )
    }

    /// Whether continuous automatic exposure is on.
    pub fn auto_exposure(&self) -> AppResult<bool> {
        let mode = self
            .adapter
            .get_node(self.handle()?, "ExposureAuto")?
            .into_enumeration("ExposureAuto")?;
        Ok(mode == "Continuous")
    }

    /// Grab a single image.
    pub fn get_one(&mut self, timeout: Duration) -> AppResult<Frame> {
        if self.acquisition_in_progress() {
            return Err(DaqError::Acquisition(
                "Cannot grab a single image while grabbing".to_string(),
            ));
        }
        let roi = self.get_roi()?;
        let image = self.adapter.grab_one(self.handle()?, timeout)?;
        Ok(frame_from_image(image, roi))
    }

    fn frame_rate_node(&self, handle: DeviceHandle) -> Option<&'static str> {
        ["AcquisitionFrameRate", "AcquisitionFrameRateAbs"]
            .into_iter()
            .find(|node| self.adapter.has_node(handle, node))
    }

    fn apply_frame_rate(&self, handle: DeviceHandle, max_frame_rate: Option<f64>) -> AppResult<()> {
        let has_enable = self.adapter.has_node(handle, "AcquisitionFrameRateEnable");
        let Some(rate) = max_frame_rate else {
            if has_enable {
                self.adapter
                    .set_node(handle, "AcquisitionFrameRateEnable", NodeValue::Boolean(false))?;
            }
            return Ok(());
        };
        let Some(node) = self.frame_rate_node(handle) else {
            debug!(camera = %self.info.friendly_name, "No frame rate node, ignoring limit");
            return Ok(());
        };
        if has_enable {
            self.adapter
                .set_node(handle, "AcquisitionFrameRateEnable", NodeValue::Boolean(true))?;
        }
        let range = self.adapter.float_range(handle, node)?;
        let rate = rate.clamp(range.min, range.max);
        self.adapter.set_node(handle, node, NodeValue::Float(rate))?;
        debug!(node, rate, "Frame rate limit applied");
        Ok(())
    }

    /// Start continuous grabbing, keeping only the latest image.
    ///
    /// `max_frame_rate` caps the acquisition rate in Hz when the camera
    /// supports it. Grabbed frames arrive on the returned receiver and are
    /// also available through [`CameraSensor::read_newest_image`].
    pub fn start_grabbing(&mut self, max_frame_rate: Option<f64>) -> AppResult<mpsc::Receiver<Frame>> {
        if self.acquisition_in_progress() {
            return Err(DaqError::Acquisition("Grabbing already in progress".to_string()));
        }
        // A finished session (device removed) still holds its guard.
        self.stop_grabbing()?;

        let handle = self.handle()?;
        self.apply_frame_rate(handle, max_frame_rate)?;
        let roi = self.get_roi()?;

        let (mut events, guard) = Arc::clone(&self.adapter)
            .start_grabbing(handle, GrabStrategy::LatestImageOnly)?;
        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let latest = Arc::clone(&self.latest);
        let removed_tx = self.removed_tx.clone();
        let camera_name = self.info.friendly_name.clone();

        let grab_loop = async move {
            let mut forward = true;
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(GrabEvent::Grabbed(image)) => {
                            let frame = frame_from_image(image, roi);
                            *latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame.clone());
                            if forward && tx.send(frame).await.is_err() {
                                debug!(camera = %camera_name, "Frame receiver dropped");
                                forward = false;
                            }
                        }
                        Some(GrabEvent::Skipped(count)) => {
                            warn!("{count} images have been skipped.");
                        }
                        Some(GrabEvent::Failed { code, description }) => {
                            warn!("Grab failed with code {code}, {description}.");
                        }
                        Some(GrabEvent::DeviceRemoved) => {
                            warn!(camera = %camera_name, "Camera removed during grabbing");
                            let _ = removed_tx.send(camera_name.clone());
                            break;
                        }
                        None => {
                            debug!(camera = %camera_name, "Grab event channel closed");
                            break;
                        }
                    },
                    _ = &mut shutdown_rx => {
                        debug!(camera = %camera_name, "Grab task shutdown requested");
                        break;
                    }
                }
            }
        };
        let task = tokio::spawn(grab_loop.in_current_span());

        self.session = Some(GrabSession {
            guard,
            shutdown_tx,
            task,
        });
        info!(camera = %self.info.friendly_name, ?max_frame_rate, "Grabbing started");
        Ok(rx)
    }

    /// Stop continuous grabbing. Stopping an idle camera is a no-op.
    pub fn stop_grabbing(&mut self) -> AppResult<()> {
        if let Some(session) = self.session.take() {
            let _ = session.shutdown_tx.send(());
            session.task.abort();
            // Dropping the guard stops the grab engine.
            drop(session.guard);
            self.latest
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            info!(camera = %self.info.friendly_name, "Grabbing stopped");
        }
        Ok(())
    }

    /// Receiver of camera-removed notifications carrying the friendly name.
    pub fn subscribe_removed(&self) -> broadcast::Receiver<String> {
        self.removed_tx.subscribe()
    }
}

fn frame_from_image(image: GrabbedImage, roi: Roi) -> Frame {
    Frame::from_pixels(
        &image.pixels,
        image.width,
        image.height,
        image.pixel_format,
        roi,
        image.block_id,
        image.timestamp_ns,
    )
}

impl CameraSensor for BaslerCamera {
    fn get_device_info(&self) -> AppResult<DeviceInfo> {
        self.adapter.device_info(self.handle()?)
    }

    fn get_exposure(&self) -> AppResult<f64> {
        let micros = self
            .adapter
            .get_node(self.handle()?, self.exposure_node)?
            .into_float(self.exposure_node)?;
        Ok(micros / 1e6)
    }

    fn set_exposure(&mut self, seconds: f64) -> AppResult<()> {
        let handle = self.handle()?;
        let range = self.adapter.float_range(handle, self.exposure_node)?;
        let micros = (seconds * 1e6).clamp(range.min, range.max);
        self.adapter
            .set_node(handle, self.exposure_node, NodeValue::Float(micros))
    }

    fn get_roi(&self) -> AppResult<Roi> {
        let handle = self.handle()?;
        let binning = |node: &str| -> AppResult<i64> {
            if self.adapter.has_node(handle, node) {
                Ok(self.int_node(node)?.max(1))
            } else {
                Ok(1)
            }
        };
        let hbin = binning("BinningHorizontal")?;
        let vbin = binning("BinningVertical")?;
        let (ox, width) = (self.int_node("OffsetX")?, self.int_node("Width")?);
        let (oy, height) = (self.int_node("OffsetY")?, self.int_node("Height")?);

        Ok(Roi {
            hstart: (ox * hbin) as u32,
            hend: ((ox + width) * hbin) as u32,
            vstart: (oy * vbin) as u32,
            vend: ((oy + height) * vbin) as u32,
            hbin: hbin as u32,
            vbin: vbin as u32,
        })
    }

    fn set_roi(&mut self, roi: Roi) -> AppResult<()> {
        let handle = self.handle()?;
        let (det_w, det_h) = self.get_detector_size()?;

        let mut bins = [1i64, 1i64];
        for (slot, (node, requested)) in
            bins.iter_mut()
                .zip([("BinningHorizontal", roi.hbin), ("BinningVertical", roi.vbin)])
        {
            if self.adapter.has_node(handle, node) {
                let range = self.adapter.integer_range(handle, node)?;
                let value = range.floor(i64::from(requested.max(1)));
                self.adapter.set_node(handle, node, NodeValue::Integer(value))?;
                *slot = value;
            } else if requested > 1 {
                warn!(node, requested, "Binning not supported, ignoring");
            }
        }
        let [hbin, vbin] = bins;

        let axes = [
            ("OffsetX", "Width", roi.hstart, roi.hend, det_w, hbin),
            ("OffsetY", "Height", roi.vstart, roi.vend, det_h, vbin),
        ];
        for (offset_node, size_node, start, end, det, bin) in axes {
            let start = detector_clamp(i64::from(start), det);
            let end = detector_clamp(i64::from(end), det);
            let (start, end) = (start.min(end), start.max(end));
            let offset = i64::from(start) / bin;
            let size = i64::from(end - start) / bin;

            // Offset first to zero so the whole size range is reachable.
            self.adapter
                .set_node(handle, offset_node, NodeValue::Integer(0))?;
            let size_range = self.adapter.integer_range(handle, size_node)?;
            let size = size_range.floor(size);
            self.adapter
                .set_node(handle, size_node, NodeValue::Integer(size))?;
            let offset_range = self.adapter.integer_range(handle, offset_node)?;
            let offset = offset_range.floor(offset);
            self.adapter
                .set_node(handle, offset_node, NodeValue::Integer(offset))?;
        }

        debug!(camera = %self.info.friendly_name, requested = %roi, "ROI applied");
        Ok(())
    }

    fn get_detector_size(&self) -> AppResult<(u32, u32)> {
        Ok((
            self.int_node("SensorWidth")? as u32,
            self.int_node("SensorHeight")? as u32,
        ))
    }

    fn read_newest_image(&mut self) -> AppResult<Option<Frame>> {
        if self.session.is_some() {
            return Ok(self
                .latest
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take());
        }
        self.get_one(self.grab_timeout).map(Some)
    }

    fn acquisition_in_progress(&self) -> bool {
        match (self.handle, &self.session) {
            (Some(handle), Some(_)) => self.adapter.is_grabbing(handle),
            _ => false,
        }
    }

    fn clear_acquisition(&mut self) -> AppResult<()> {
        self.stop_grabbing()
    }

    fn setup_acquisition(&mut self) -> AppResult<()> {
        // Pylon needs no buffer setup ahead of grabbing.
        self.handle().map(|_| ())
    }

    fn close(&mut self) -> AppResult<()> {
        self.stop_grabbing()?;
        if let Some(handle) = self.handle.take() {
            self.adapter.close(handle)?;
            info!(camera = %self.info.friendly_name, "Basler camera closed");
        }
        Ok(())
    }
}

impl Drop for BaslerCamera {
    fn drop(&mut self) {
        if let Err(e) = CameraSensor::close(self) {
            tracing::error!(camera = %self.info.friendly_name, "Failed to close camera: {}", e);
        }
    }
}
