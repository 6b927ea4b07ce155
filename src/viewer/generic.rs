//! Generic 2D camera viewer
//!
//! Camera-agnostic viewer logic on top of [`CameraSensor`]: ROI selection and
//! binning, view preparation (data shape and calibrated axes), data emission
//! and frame rate display. Vendor viewers wrap it and add their own settings.
//!
//! ROIs are handled in unbinned sensor pixels. Selections made by the user
//! are in displayed pixels, i.e. binned and relative to the current ROI.

use anyhow::Result;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::DaqError;
use crate::hardware::basler::detector_clamp;
use crate::traits::camera_sensor::{CameraSensor, Frame, FrameAccumulator, Roi};
use crate::viewer::data::{Axis, DataDim, DataExport, DataFromCamera, ViewerEvent};
use crate::viewer::fps::FpsCounter;
use crate::viewer::settings::ViewerSettings;

/// Rectangle selected on the displayed image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoiRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Default for RoiRect {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: 10.0,
            height: 10.0,
        }
    }
}

/// Viewer driving any [`CameraSensor`].
pub struct GenericCameraViewer<C: CameraSensor> {
    controller: Option<C>,
    /// Settings tree shown by the host.
    pub settings: ViewerSettings,
    events: broadcast::Sender<ViewerEvent>,
    roi_rect: RoiRect,
    data_dim: DataDim,
    shape: Option<Vec<usize>>,
    axes: Vec<Axis>,
    fps: FpsCounter,
    initialized: bool,
}

impl<C: CameraSensor> GenericCameraViewer<C> {
    /// Viewer without controller, emitting on `events`.
    pub fn new(settings: ViewerSettings, events: broadcast::Sender<ViewerEvent>) -> Self {
        Self {
            controller: None,
            settings,
            events,
            roi_rect: RoiRect::default(),
            data_dim: DataDim::Data2D,
            shape: None,
            axes: Vec::new(),
            fps: FpsCounter::new(),
            initialized: false,
        }
    }

    /// Send an event to subscribers. Having none is not an error.
    pub fn emit(&self, event: ViewerEvent) {
        let _ = self.events.send(event);
    }

    /// Report the current value of a setting changed on this side.
    pub fn notify(&self, name: &str) {
        if let Some(value) = self.settings.value_json(name) {
            self.emit(ViewerEvent::SettingChanged {
                name: name.to_string(),
                value,
            });
        }
    }

    /// New receiver of viewer events.
    pub fn subscribe(&self) -> broadcast::Receiver<ViewerEvent> {
        self.events.subscribe()
    }

    /// Whether `ini_detector` succeeded and `close` was not called since.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Borrow the controller.
    pub fn controller(&self) -> Result<&C, DaqError> {
        self.controller.as_ref().ok_or(DaqError::NotInitialized)
    }

    /// Borrow the controller mutably.
    pub fn controller_mut(&mut self) -> Result<&mut C, DaqError> {
        self.controller.as_mut().ok_or(DaqError::NotInitialized)
    }

    /// Current dimensionality of emitted data.
    pub fn data_dim(&self) -> DataDim {
        self.data_dim
    }

    /// Axes attached to emitted data.
    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    /// Install a new controller, closing the previous one.
    pub fn ini_detector_init(&mut self, controller: C) {
        if let Some(mut old) = self.controller.replace(controller) {
            if let Err(e) = old.close() {
                warn!("Failed to close previous controller: {}", e);
            }
        }
        self.shape = None;
        self.fps.reset();
    }

    /// Common initialization once the controller is installed.
    pub fn ini_detector(&mut self) -> Result<(String, bool)> {
        let exposure_s = self.settings.exposure_time.get() / 1000.0;
        let controller = self.controller_mut()?;
        let model = controller.get_device_info()?.model_name;
        controller.set_exposure(exposure_s)?;
        let roi = controller.get_roi()?;

        self.settings.camera_info.set_unchecked(model);
        self.notify("camera_info");
        let fps_on = self.settings.fps_on.get();
        self.settings.fps.set_visible(fps_on);
        self.settings.binning.set_unchecked(roi.hbin);
        self.notify("binning");

        self.prepare_view()?;
        self.initialized = true;
        info!(roi = %roi, "Camera viewer initialized");
        Ok(("Initialized camera".to_string(), true))
    }

    /// Apply the consequences of a changed setting.
    pub fn commit_settings(&mut self, name: &str) -> Result<()> {
        match name {
            "exposure_time" => {
                let seconds = self.settings.exposure_time.get() / 1000.0;
                self.controller_mut()?.set_exposure(seconds)?;
            }
            "fps_on" => {
                let on = self.settings.fps_on.get();
                self.settings.fps.set_visible(on);
                if !on {
                    self.fps.reset();
                }
            }
            "update_roi" => {
                if self.settings.update_roi.get() {
                    let new_roi = self.selected_roi()?;
                    self.update_rois(new_roi)?;
                    self.settings.update_roi.set_unchecked(false);
                    self.notify("update_roi");
                }
            }
            "binning" => {
                let bin = self.settings.binning.get();
                let controller = self.controller()?;
                let roi = controller.get_roi()?;
                let (det_w, det_h) = controller.get_detector_size()?;
                self.update_rois(Roi {
                    hend: to_sensor_edge(roi.hend, roi.hbin, det_w),
                    vend: to_sensor_edge(roi.vend, roi.vbin, det_h),
                    hbin: bin,
                    vbin: bin,
                    ..roi
                })?;
            }
            "clear_roi" => {
                if self.settings.clear_roi.get() {
                    let (width, height) = self.controller()?.get_detector_size()?;
                    self.settings.binning.set_unchecked(1);
                    self.notify("binning");
                    self.update_rois(Roi::full_sensor(width, height))?;
                    self.settings.clear_roi.set_unchecked(false);
                    self.notify("clear_roi");
                }
            }
            "axis_units" | "pixel_length" => self.prepare_view()?,
            other => debug!(setting = other, "No action for setting"),
        }
        Ok(())
    }

    /// Store the rectangle selected on the displayed image.
    pub fn roi_select(&mut self, rect: RoiRect) {
        self.roi_rect = rect;
    }

    /// ROI covered by the stored selection, in unbinned sensor pixels.
    fn selected_roi(&self) -> Result<Roi> {
        let controller = self.controller()?;
        let roi = controller.get_roi()?;
        let (det_w, det_h) = controller.get_detector_size()?;
        let rect = self.roi_rect;
        let (hbin, vbin) = (i64::from(roi.hbin), i64::from(roi.vbin));

        let hstart = i64::from(roi.hstart) + rect.x.round() as i64 * hbin;
        let vstart = i64::from(roi.vstart) + rect.y.round() as i64 * vbin;
        let width = rect.width.round() as i64 * hbin;
        let height = rect.height.round() as i64 * vbin;

        Ok(Roi {
            hstart: detector_clamp(hstart, det_w),
            hend: detector_clamp(hstart + width, det_w),
            vstart: detector_clamp(vstart, det_h),
            vend: detector_clamp(vstart + height, det_h),
            hbin: roi.hbin,
            vbin: roi.vbin,
        })
    }

    /// Apply a new ROI unless it equals the current one.
    ///
    /// Returns whether the ROI changed once rounded by the camera. A running
    /// acquisition is cleared; restarting it is up to the caller.
    pub fn update_rois(&mut self, new_roi: Roi) -> Result<bool> {
        let controller = self.controller_mut()?;
        let current = controller.get_roi()?;
        if current == new_roi {
            return Ok(false);
        }
        if controller.acquisition_in_progress() {
            controller.clear_acquisition()?;
        }
        controller.set_roi(new_roi)?;
        if controller.get_roi()? == current {
            debug!(requested = %new_roi, "ROI unchanged after rounding");
            return Ok(false);
        }
        self.emit(ViewerEvent::status(format!("Changed ROI: {new_roi}")));

        let controller = self.controller_mut()?;
        controller.clear_acquisition()?;
        controller.setup_acquisition()?;
        self.prepare_view()?;
        Ok(true)
    }

    fn axis(&self, label: &str, start: u32, bin: u32, len: u32, index: usize) -> Axis {
        let in_um = self.settings.axis_units.get() == "um";
        let pixel_length = self.settings.pixel_length.get();
        let data = (0..len)
            .map(|i| {
                if in_um {
                    f64::from(start + i * bin) * pixel_length
                } else {
                    f64::from(i)
                }
            })
            .collect();
        Axis {
            label: label.to_string(),
            units: if in_um { "um" } else { "pixels" }.to_string(),
            index,
            data,
        }
    }

    /// Recompute image size, data shape and axes from the camera ROI.
    ///
    /// Emits zero-filled temporary data when the shape changed so hosts can
    /// rebuild their displays.
    pub fn prepare_view(&mut self) -> Result<()> {
        let roi = self.controller()?.get_roi()?;
        let (width, height) = (roi.image_width(), roi.image_height());
        self.settings.hdet.set_unchecked(width);
        self.settings.vdet.set_unchecked(height);
        self.notify("hdet");
        self.notify("vdet");

        let (dim, shape, axes) = if width != 1 && height != 1 {
            (
                DataDim::Data2D,
                vec![height as usize, width as usize],
                vec![
                    self.axis("X", roi.hstart, roi.hbin, width, 1),
                    self.axis("Y", roi.vstart, roi.vbin, height, 0),
                ],
            )
        } else if height == 1 {
            (
                DataDim::Data1D,
                vec![width as usize],
                vec![self.axis("X", roi.hstart, roi.hbin, width, 0)],
            )
        } else {
            (
                DataDim::Data1D,
                vec![height as usize],
                vec![self.axis("Y", roi.vstart, roi.vbin, height, 0)],
            )
        };
        self.axes = axes;

        let changed = self.shape.as_ref() != Some(&shape) || self.data_dim != dim;
        self.data_dim = dim;
        if changed {
            let zeros = vec![0u16; shape.iter().product()];
            self.shape = Some(shape.clone());
            debug!(?dim, ?shape, "Data shape changed");
            self.emit(ViewerEvent::TemporaryData(DataExport::camera(
                DataFromCamera::camera_image(dim, shape, zeros, self.axes.clone()),
            )));
        }
        Ok(())
    }

    /// Export of a frame in the prepared layout.
    fn export_frame(&mut self, frame: Frame) -> Result<DataExport> {
        let (dim, shape) = if frame.width != 1 && frame.height != 1 {
            (
                DataDim::Data2D,
                vec![frame.height as usize, frame.width as usize],
            )
        } else {
            (DataDim::Data1D, vec![frame.width.max(frame.height) as usize])
        };
        if self.shape.as_ref() != Some(&shape) {
            self.prepare_view()?;
        }
        Ok(DataExport::camera(DataFromCamera::camera_image(
            dim,
            shape,
            frame.pixels(),
            self.axes.clone(),
        )))
    }

    /// Emit an acquired frame and update the frame rate.
    pub fn emit_frame(&mut self, frame: Frame) {
        match self.export_frame(frame) {
            Ok(export) => self.emit(ViewerEvent::Data(export)),
            Err(e) => self.emit(ViewerEvent::log(e.to_string())),
        }
        if self.settings.fps_on.get() {
            self.update_fps();
        }
    }

    /// Read the newest image(s) and emit them, averaging `naverage` frames.
    ///
    /// Errors are reported as status events.
    pub fn emit_data(&mut self, naverage: u32) {
        match self.read_averaged(naverage.max(1)) {
            Ok(Some(frame)) => self.emit_frame(frame),
            Ok(None) => {
                if self.settings.fps_on.get() {
                    self.update_fps();
                }
            }
            Err(e) => self.emit(ViewerEvent::log(e.to_string())),
        }
    }

    fn read_averaged(&mut self, naverage: u32) -> Result<Option<Frame>> {
        let controller = self.controller_mut()?;
        let mut acc = FrameAccumulator::default();
        for _ in 0..naverage {
            if let Some(frame) = controller.read_newest_image()? {
                acc.add(frame)?;
            }
        }
        Ok(acc.finish())
    }

    /// Register a frame for the FPS display.
    pub fn update_fps(&mut self) {
        self.fps.tick(Instant::now());
        if let Some(fps) = self.fps.rounded() {
            self.settings.fps.set_unchecked(fps);
            self.notify("fps");
        }
    }

    /// Stop and clear any running acquisition.
    pub fn stop(&mut self) -> Result<()> {
        if let Some(controller) = self.controller.as_mut() {
            controller.clear_acquisition()?;
        }
        Ok(())
    }

    /// Close and drop the controller.
    pub fn close(&mut self) -> Result<()> {
        self.initialized = false;
        self.shape = None;
        if let Some(mut controller) = self.controller.take() {
            controller.close()?;
            info!("Camera viewer closed");
        }
        Ok(())
    }
}

/// End coordinate extended to the sensor edge when the pixels left beyond it
/// are too few for one `bin`.
fn to_sensor_edge(end: u32, bin: u32, det: u32) -> u32 {
    if det.saturating_sub(end) < bin {
        det
    } else {
        end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::basler::BaslerCamera;
    use crate::hardware::mock::{MockPylonAdapter, SimulatedDevice};
    use std::sync::Arc;

    fn viewer(device: SimulatedDevice) -> (GenericCameraViewer<BaslerCamera>, broadcast::Receiver<ViewerEvent>) {
        let adapter = Arc::new(MockPylonAdapter::with_devices(vec![device.clone()]));
        let camera = BaslerCamera::open(adapter, &device.full_name()).unwrap();
        let (tx, rx) = broadcast::channel(256);
        let mut viewer = GenericCameraViewer::new(ViewerSettings::default(), tx);
        viewer.ini_detector_init(camera);
        (viewer, rx)
    }

    fn drain(rx: &mut broadcast::Receiver<ViewerEvent>) -> Vec<ViewerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn temporary(events: &[ViewerEvent]) -> Vec<&DataFromCamera> {
        events
            .iter()
            .filter_map(|e| match e {
                ViewerEvent::TemporaryData(export) => export.data.first(),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_ini_detector() {
        let (mut viewer, mut rx) = viewer(SimulatedDevice::ace_640_gige());
        let (info, ok) = viewer.ini_detector().unwrap();
        assert_eq!(info, "Initialized camera");
        assert!(ok);
        assert_eq!(viewer.settings.camera_info.get(), "acA640-120gm");
        assert_eq!((viewer.settings.hdet.get(), viewer.settings.vdet.get()), (659, 494));
        assert!((viewer.controller().unwrap().get_exposure().unwrap() - 0.001).abs() < 1e-9);

        let events = drain(&mut rx);
        let temp = temporary(&events);
        assert_eq!(temp.len(), 1);
        assert_eq!(temp[0].shape, vec![494, 659]);
        assert_eq!(temp[0].labels, vec!["Camera_Data2D".to_string()]);
        assert_eq!(temp[0].axes[0].index, 1);
        assert_eq!(temp[0].axes[1].index, 0);
    }

    #[test]
    fn test_selection_is_relative_and_binned() {
        let (mut viewer, mut rx) = viewer(SimulatedDevice::ace_640_gige());
        viewer.ini_detector().unwrap();

        viewer.settings.binning.set(2).unwrap();
        viewer.commit_settings("binning").unwrap();
        assert_eq!(viewer.controller().unwrap().get_roi().unwrap().hbin, 2);

        viewer.roi_select(RoiRect {
            x: 10.0,
            y: 20.0,
            width: 100.0,
            height: 50.0,
        });
        viewer.settings.update_roi.set(true).unwrap();
        viewer.commit_settings("update_roi").unwrap();

        let roi = viewer.controller().unwrap().get_roi().unwrap();
        assert_eq!((roi.hstart, roi.hend, roi.vstart, roi.vend), (20, 220, 40, 140));
        assert_eq!((viewer.settings.hdet.get(), viewer.settings.vdet.get()), (100, 50));
        assert!(!viewer.settings.update_roi.get());

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            ViewerEvent::Status { message, .. } if message == "Changed ROI: (20, 200, 2, 40, 100, 2)"
        )));
    }

    #[test]
    fn test_clear_roi_restores_full_sensor() {
        let (mut viewer, _rx) = viewer(SimulatedDevice::ace_640_gige());
        viewer.ini_detector().unwrap();
        viewer.settings.binning.set(2).unwrap();
        viewer.commit_settings("binning").unwrap();

        viewer.settings.clear_roi.set(true).unwrap();
        viewer.commit_settings("clear_roi").unwrap();

        assert_eq!(
            viewer.controller().unwrap().get_roi().unwrap(),
            Roi::full_sensor(659, 494)
        );
        assert_eq!(viewer.settings.binning.get(), 1);
        assert!(!viewer.settings.clear_roi.get());
    }

    #[test]
    fn test_single_row_selection_is_1d() {
        let (mut viewer, mut rx) = viewer(SimulatedDevice::ace_640_gige());
        viewer.ini_detector().unwrap();
        drain(&mut rx);

        viewer.roi_select(RoiRect {
            x: 0.0,
            y: 100.0,
            width: 300.0,
            height: 1.0,
        });
        viewer.settings.update_roi.set(true).unwrap();
        viewer.commit_settings("update_roi").unwrap();

        assert_eq!(viewer.data_dim(), DataDim::Data1D);
        let events = drain(&mut rx);
        let temp = temporary(&events);
        assert_eq!(temp.len(), 1);
        assert_eq!(temp[0].shape, vec![300]);
        assert_eq!(temp[0].labels, vec!["Camera_Data1D".to_string()]);
        assert_eq!(temp[0].axes.len(), 1);
        assert_eq!(temp[0].axes[0].label, "X");
    }

    #[test]
    fn test_unchanged_roi_is_noop() {
        let (mut viewer, mut rx) = viewer(SimulatedDevice::ace_640_gige());
        viewer.ini_detector().unwrap();
        drain(&mut rx);

        assert!(!viewer.update_rois(Roi::full_sensor(659, 494)).unwrap());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_axes_in_micrometres() {
        let (mut viewer, _rx) = viewer(SimulatedDevice::ace_640_gige());
        viewer.ini_detector().unwrap();
        viewer
            .update_rois(Roi {
                hstart: 100,
                hend: 300,
                vstart: 50,
                vend: 150,
                hbin: 2,
                vbin: 2,
            })
            .unwrap();

        viewer.settings.pixel_length.set(2.0).unwrap();
        viewer.settings.axis_units.set("um".to_string()).unwrap();
        viewer.commit_settings("axis_units").unwrap();

        let x = &viewer.axes()[0];
        assert_eq!(x.units, "um");
        assert_eq!(x.data.len(), 100);
        assert_eq!(x.data[0], 200.0);
        assert_eq!(x.data[1], 204.0);
    }

    #[test]
    fn test_emit_data() {
        let (mut viewer, mut rx) = viewer(SimulatedDevice::dart_1280());
        viewer.ini_detector().unwrap();
        viewer
            .update_rois(Roi {
                hstart: 0,
                hend: 64,
                vstart: 0,
                vend: 32,
                hbin: 1,
                vbin: 1,
            })
            .unwrap();
        drain(&mut rx);

        viewer.emit_data(3);
        let events = drain(&mut rx);
        let data = events
            .iter()
            .find_map(|e| match e {
                ViewerEvent::Data(export) => Some(export),
                _ => None,
            })
            .unwrap();
        assert_eq!(data.name, "Camera");
        assert_eq!(data.data[0].name, "Camera Image");
        assert_eq!(data.data[0].shape, vec![32, 64]);
        assert_eq!(data.data[0].data.len(), 64 * 32);
    }

    #[test]
    fn test_large_average_on_small_roi() {
        let (mut viewer, mut rx) = viewer(SimulatedDevice::dart_1280());
        viewer.ini_detector().unwrap();
        viewer
            .update_rois(Roi {
                hstart: 0,
                hend: 4,
                vstart: 0,
                vend: 2,
                hbin: 1,
                vbin: 1,
            })
            .unwrap();
        drain(&mut rx);

        viewer.emit_data(20_000);
        let events = drain(&mut rx);
        let data = events
            .iter()
            .find_map(|e| match e {
                ViewerEvent::Data(export) => Some(export),
                _ => None,
            })
            .unwrap();
        assert_eq!(data.data[0].shape, vec![2, 4]);
        assert_eq!(data.data[0].data.len(), 8);
    }

    #[test]
    fn test_fps_on_toggles_fps_display() {
        let (mut viewer, _rx) = viewer(SimulatedDevice::dart_1280());
        viewer.ini_detector().unwrap();
        assert!(viewer.settings.fps.metadata().visible);

        viewer.settings.fps_on.set(false).unwrap();
        viewer.commit_settings("fps_on").unwrap();
        assert!(!viewer.settings.fps.metadata().visible);

        viewer.settings.fps_on.set(true).unwrap();
        viewer.commit_settings("fps_on").unwrap();
        assert!(viewer.settings.fps.metadata().visible);
    }

    #[test]
    fn test_roi_rounding_back_is_noop() {
        let (mut viewer, mut rx) = viewer(SimulatedDevice::ace_640_gige());
        viewer.ini_detector().unwrap();
        viewer.settings.binning.set(2).unwrap();
        viewer.commit_settings("binning").unwrap();
        let binned = viewer.controller().unwrap().get_roi().unwrap();
        assert_eq!(binned.hend, 658);
        drain(&mut rx);

        // One unbinned column short of a whole bin
        let changed = viewer
            .update_rois(Roi {
                hend: 659,
                ..binned
            })
            .unwrap();
        assert!(!changed);
        assert_eq!(viewer.controller().unwrap().get_roi().unwrap(), binned);
        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e, ViewerEvent::Status { .. })));
    }

    #[test]
    fn test_unbinning_restores_odd_sensor_edge() {
        let (mut viewer, _rx) = viewer(SimulatedDevice::ace_640_gige());
        viewer.ini_detector().unwrap();

        viewer.settings.binning.set(2).unwrap();
        viewer.commit_settings("binning").unwrap();
        viewer.settings.binning.set(1).unwrap();
        viewer.commit_settings("binning").unwrap();

        assert_eq!(
            viewer.controller().unwrap().get_roi().unwrap(),
            Roi::full_sensor(659, 494)
        );
        assert_eq!(viewer.settings.hdet.get(), 659);
    }

    #[test]
    fn test_errors_become_status_events() {
        let (mut viewer, mut rx) = viewer(SimulatedDevice::dart_1280());
        viewer.ini_detector().unwrap();
        viewer.close().unwrap();
        assert!(!viewer.is_initialized());
        drain(&mut rx);

        viewer.emit_data(1);
        let events = drain(&mut rx);
        assert_eq!(events, vec![ViewerEvent::log("Camera not initialized")]);
    }
}
