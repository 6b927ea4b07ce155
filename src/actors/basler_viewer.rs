//! Basler viewer actor
//!
//! Kameo actor owning a [`GenericCameraViewer`] over a [`BaslerCamera`] and
//! adding the Basler specific settings: gain, automatic exposure and pixel
//! size. Hosts drive it with messages and follow it through
//! [`ViewerEvent`]s obtained with [`Subscribe`].

use anyhow::{anyhow, Result};
use kameo::{
    actor::{ActorRef, WeakActorRef},
    error::BoxSendError,
    message::{Context, Message},
    Actor,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::DaqError;
use crate::hardware::basler::BaslerCamera;
use crate::hardware::pylon_adapter::PylonAdapter;
use crate::traits::camera_sensor::{CameraSensor, Frame};
use crate::viewer::data::ViewerEvent;
use crate::viewer::generic::{GenericCameraViewer, RoiRect};
use crate::viewer::settings::ViewerSettings;

struct LiveSession {
    id: u64,
    task: JoinHandle<()>,
    shutdown_tx: oneshot::Sender<()>,
}

/// Viewer actor for Basler cameras
pub struct BaslerViewer {
    pub id: String,
    adapter: Arc<dyn PylonAdapter>,
    viewer: GenericCameraViewer<BaslerCamera>,
    grab_timeout: Duration,
    max_frame_rate: Option<f64>,
    initial_gain: Option<f64>,
    self_ref: Option<WeakActorRef<Self>>,
    live: Option<LiveSession>,
    sessions: u64,
}

impl BaslerViewer {
    /// Create a viewer using `adapter`, with defaults from `config`.
    ///
    /// Cameras found on the adapter are offered in `camera_list`.
    pub fn new(id: impl Into<String>, adapter: Arc<dyn PylonAdapter>, config: &AppConfig) -> Self {
        let (events, _) = broadcast::channel(config.actors.event_capacity);
        let mut settings = ViewerSettings::from_config(&config.camera);
        match BaslerCamera::list_cameras(adapter.as_ref()) {
            Ok(devices) => settings.set_camera_choices(
                devices.into_iter().map(|d| d.friendly_name).collect(),
            ),
            Err(e) => warn!("Failed to list cameras: {}", e),
        }

        Self {
            id: id.into(),
            adapter,
            viewer: GenericCameraViewer::new(settings, events),
            grab_timeout: Duration::from_millis(config.camera.grab_timeout_ms),
            max_frame_rate: config.camera.max_frame_rate,
            initial_gain: config.camera.gain,
            self_ref: None,
            live: None,
            sessions: 0,
        }
    }

    /// Create a viewer on the mock adapter with default configuration.
    pub fn mock(id: impl Into<String>) -> Self {
        Self::new(
            id,
            Arc::new(crate::hardware::mock::MockPylonAdapter::new()),
            &AppConfig::default(),
        )
    }

    /// Open the camera selected in `camera_list`.
    fn init_controller(&mut self) -> Result<BaslerCamera> {
        let name = self.viewer.settings.camera_list.get();
        self.viewer
            .emit(ViewerEvent::status(format!("Trying to connect to {name}")));
        match BaslerCamera::open_by_friendly_name(Arc::clone(&self.adapter), &name) {
            Ok(camera) => Ok(camera.with_grab_timeout(self.grab_timeout)),
            Err(e @ DaqError::CameraNotFound(_)) => {
                self.viewer.emit(ViewerEvent::status("Camera not found"));
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn ini_detector(&mut self) -> Result<(String, bool)> {
        self.stop_live();
        // Pylon opens devices exclusively, release ours before reopening.
        if let Err(e) = self.viewer.close() {
            warn!("Failed to close previous camera: {}", e);
        }
        let camera = self.init_controller()?;
        self.viewer.ini_detector_init(camera);
        let (info, initialized) = self.viewer.ini_detector()?;

        let user_length = self.viewer.settings.pixel_length.get();
        let camera = self.viewer.controller_mut()?;
        let model = camera.model_name().to_string();
        let known_length = camera.pixel_length();
        if known_length.is_none() {
            camera.set_pixel_length(user_length);
        }
        let raw_gain = camera.raw_gain();
        match known_length {
            Some(length) => {
                self.viewer.settings.pixel_length.set_unchecked(length);
                self.viewer.settings.pixel_length.set_visible(false);
            }
            None => {
                self.viewer.settings.pixel_length.set_visible(true);
                self.viewer.emit(ViewerEvent::log(format!(
                    "No pixel length known for camera model '{model}', defaulting to user-chosen one"
                )));
            }
        }
        self.viewer.notify("pixel_length");
        if raw_gain {
            self.viewer.settings.use_raw_gain();
        }

        let auto_exposure = self.viewer.settings.auto_exposure.get();
        let initial_gain = self.initial_gain;
        let camera = self.viewer.controller_mut()?;
        camera.set_auto_exposure(auto_exposure)?;
        let gain = match initial_gain {
            Some(value) => camera.set_gain(value).and_then(|()| camera.gain()),
            None => camera.gain(),
        };
        match gain {
            Ok(gain) => {
                self.viewer.settings.gain.set_unchecked(gain);
                self.viewer.notify("gain");
            }
            Err(e) => debug!("Gain not available: {}", e),
        }

        // Axes may depend on the pixel size found above.
        self.viewer.prepare_view()?;
        info!(viewer = %self.id, model = %model, "Basler viewer initialized");
        Ok((info, initialized))
    }

    fn commit_settings(&mut self, name: &str) -> Result<()> {
        match name {
            "auto_exposure" => {
                let enabled = self.viewer.settings.auto_exposure.get();
                self.viewer.controller_mut()?.set_auto_exposure(enabled)?;
            }
            "gain" => {
                let requested = self.viewer.settings.gain.get();
                let camera = self.viewer.controller_mut()?;
                camera.set_gain(requested)?;
                let actual = camera.gain()?;
                if actual != requested {
                    self.viewer.settings.gain.set_unchecked(actual);
                    self.viewer.notify("gain");
                }
            }
            "pixel_length" => {
                let length = self.viewer.settings.pixel_length.get();
                self.viewer.controller_mut()?.set_pixel_length(length);
                self.viewer.commit_settings(name)?;
            }
            "camera_list" => debug!("Camera selection applies on next initialization"),
            _ => {
                let was_live = self.live.is_some();
                self.viewer.commit_settings(name)?;
                // ROI changes stop the acquisition.
                if was_live && !self.viewer.controller()?.acquisition_in_progress() {
                    self.stop_live();
                    self.start_live()?;
                }
            }
        }
        Ok(())
    }

    fn start_live(&mut self) -> Result<()> {
        let weak = self
            .self_ref
            .clone()
            .ok_or_else(|| anyhow!("Viewer actor not started"))?;
        let max_frame_rate = self.max_frame_rate;
        let camera = self.viewer.controller_mut()?;
        let mut removed = camera.subscribe_removed();
        let mut frames = camera.start_grabbing(max_frame_rate)?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        self.sessions += 1;
        let session = self.sessions;

        // Frames are handed back to the actor, which owns the viewer.
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(frame) = frames.recv() => {
                        let Some(actor) = weak.upgrade() else { break };
                        if actor.tell(FrameGrabbed { session, frame }).await.is_err() {
                            break;
                        }
                    }
                    Ok(name) = removed.recv() => {
                        if let Some(actor) = weak.upgrade() {
                            let _ = actor.tell(CameraRemoved { name }).await;
                        }
                        break;
                    }
                    _ = &mut shutdown_rx => break,
                    else => break,
                }
            }
        });

        self.live = Some(LiveSession {
            id: session,
            task,
            shutdown_tx,
        });
        Ok(())
    }

    fn stop_live(&mut self) {
        if let Some(live) = self.live.take() {
            let _ = live.shutdown_tx.send(());
            live.task.abort();
        }
    }
}

impl Actor for BaslerViewer {
    type Args = Self;
    type Error = BoxSendError;

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        info!("Basler viewer {} starting", args.id);
        let mut actor = args;
        actor.self_ref = Some(actor_ref.downgrade());
        Ok(actor)
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        _reason: kameo::error::ActorStopReason,
    ) -> Result<(), Self::Error> {
        self.stop_live();
        if let Err(e) = self.viewer.close() {
            warn!("Failed to close camera: {}", e);
        }
        info!("Basler viewer {} stopped", self.id);
        Ok(())
    }
}

// ============================================================================
// Kameo Message Types
// ============================================================================

/// Open the selected camera and initialize the viewer.
///
/// Replies with the status text and whether initialization succeeded.
#[derive(Debug, Clone)]
pub struct IniDetector;

impl Message<IniDetector> for BaslerViewer {
    type Reply = Result<(String, bool)>;

    async fn handle(&mut self, _msg: IniDetector, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.ini_detector()
    }
}

/// Change a setting by name or path and apply it.
#[derive(Debug, Clone)]
pub struct SetSetting {
    pub name: String,
    pub value: serde_json::Value,
}

impl Message<SetSetting> for BaslerViewer {
    type Reply = Result<()>;

    async fn handle(&mut self, msg: SetSetting, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let name = self.viewer.settings.set_json(&msg.name, msg.value)?;
        debug!(setting = %name, "Setting changed");
        self.commit_settings(&name)
    }
}

/// Store a rectangle selected on the displayed image.
#[derive(Debug, Clone, Copy)]
pub struct SelectRoi {
    pub rect: RoiRect,
}

impl Message<SelectRoi> for BaslerViewer {
    type Reply = Result<()>;

    async fn handle(&mut self, msg: SelectRoi, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.viewer.roi_select(msg.rect);
        Ok(())
    }
}

/// Acquire data: one (averaged) snapshot, or continuous grabbing when `live`.
#[derive(Debug, Clone, Copy)]
pub struct GrabData {
    pub naverage: u32,
    pub live: bool,
}

impl Message<GrabData> for BaslerViewer {
    type Reply = Result<()>;

    async fn handle(&mut self, msg: GrabData, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if msg.live {
            if self.live.is_some() && self.viewer.controller()?.acquisition_in_progress() {
                return Ok(());
            }
            self.stop_live();
            self.viewer.prepare_view()?;
            self.start_live()
        } else {
            self.viewer.prepare_view()?;
            self.viewer.emit_data(msg.naverage);
            Ok(())
        }
    }
}

/// Stop continuous grabbing.
#[derive(Debug, Clone, Copy)]
pub struct Stop;

impl Message<Stop> for BaslerViewer {
    type Reply = Result<()>;

    async fn handle(&mut self, _msg: Stop, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.stop_live();
        self.viewer.stop()
    }
}

/// Stop grabbing and close the camera.
#[derive(Debug, Clone, Copy)]
pub struct Close;

impl Message<Close> for BaslerViewer {
    type Reply = Result<()>;

    async fn handle(&mut self, _msg: Close, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.stop_live();
        self.viewer.close()
    }
}

/// JSON snapshot of all settings, keyed by path.
#[derive(Debug, Clone, Copy)]
pub struct GetSettings;

impl Message<GetSettings> for BaslerViewer {
    type Reply = Result<serde_json::Value>;

    async fn handle(&mut self, _msg: GetSettings, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        Ok(self.viewer.settings.snapshot())
    }
}

/// Receiver of the viewer's events.
#[derive(Debug, Clone, Copy)]
pub struct Subscribe;

impl Message<Subscribe> for BaslerViewer {
    type Reply = Result<broadcast::Receiver<ViewerEvent>>;

    async fn handle(&mut self, _msg: Subscribe, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        Ok(self.viewer.subscribe())
    }
}

/// Frame delivered by the live grabbing task of session `session`.
#[derive(Debug, Clone)]
pub struct FrameGrabbed {
    pub session: u64,
    pub frame: Frame,
}

impl Message<FrameGrabbed> for BaslerViewer {
    type Reply = Result<()>;

    async fn handle(&mut self, msg: FrameGrabbed, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        // Frames queued by a stopped session are stale.
        if self.live.as_ref().is_some_and(|live| live.id == msg.session) {
            self.viewer.emit_frame(msg.frame);
        }
        Ok(())
    }
}

/// The camera disappeared while grabbing.
#[derive(Debug, Clone)]
pub struct CameraRemoved {
    pub name: String,
}

impl Message<CameraRemoved> for BaslerViewer {
    type Reply = Result<()>;

    async fn handle(&mut self, msg: CameraRemoved, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        warn!(camera = %msg.name, "Camera removed");
        self.stop_live();
        self.viewer.emit(ViewerEvent::log("Camera removed"));
        self.viewer.stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockPylonAdapter, SimulatedDevice};

    fn ace_viewer() -> BaslerViewer {
        let adapter = Arc::new(MockPylonAdapter::with_devices(vec![
            SimulatedDevice::ace_640_gige(),
        ]));
        BaslerViewer::new("test", adapter, &AppConfig::default())
    }

    #[test]
    fn test_camera_choices_listed() {
        let viewer = BaslerViewer::mock("test");
        let choices = &viewer.viewer.settings.camera_list.metadata().limits;
        assert_eq!(choices.len(), 2);
        assert_eq!(
            viewer.viewer.settings.camera_list.get(),
            SimulatedDevice::dart_1280().friendly_name()
        );
    }

    #[test]
    fn test_ini_detector_known_pixel_length() {
        let mut viewer = ace_viewer();
        let mut rx = viewer.viewer.subscribe();
        let (info, ok) = viewer.ini_detector().unwrap();
        assert_eq!(info, "Initialized camera");
        assert!(ok);
        assert_eq!(viewer.viewer.settings.pixel_length.get(), 5.6);
        assert!(!viewer.viewer.settings.pixel_length.metadata().visible);
        assert_eq!(viewer.viewer.settings.gain.metadata().title, "Gain (raw)");

        let first = rx.try_recv().unwrap();
        assert_eq!(
            first,
            ViewerEvent::status(format!(
                "Trying to connect to {}",
                SimulatedDevice::ace_640_gige().friendly_name()
            ))
        );
    }

    #[test]
    fn test_ini_detector_unknown_model() {
        let mut device = SimulatedDevice::dart_1280();
        device.model_name = "daA9999-1um".to_string();
        let adapter = Arc::new(MockPylonAdapter::with_devices(vec![device]));
        let mut viewer = BaslerViewer::new("test", adapter, &AppConfig::default());
        let mut rx = viewer.viewer.subscribe();

        viewer.ini_detector().unwrap();
        assert!(viewer.viewer.settings.pixel_length.metadata().visible);
        assert_eq!(viewer.viewer.controller().unwrap().pixel_length(), Some(1.0));

        let mut found = false;
        while let Ok(event) = rx.try_recv() {
            if event
                == ViewerEvent::log(
                    "No pixel length known for camera model 'daA9999-1um', defaulting to user-chosen one",
                )
            {
                found = true;
            }
        }
        assert!(found);
    }

    #[test]
    fn test_ini_detector_camera_gone() {
        let mut viewer = ace_viewer();
        viewer.viewer.settings.camera_list.set_unchecked("Basler nope (0)".to_string());
        let mut rx = viewer.viewer.subscribe();

        let err = viewer.ini_detector().unwrap_err();
        assert_eq!(err.to_string(), "Camera with name Basler nope (0) not found anymore.");
        rx.try_recv().unwrap();
        assert_eq!(rx.try_recv().unwrap(), ViewerEvent::status("Camera not found"));
    }

    #[test]
    fn test_gain_commit_reads_back_clamped_value() {
        let mut viewer = ace_viewer();
        viewer.ini_detector().unwrap();
        viewer.viewer.settings.gain.set(10_000.0).unwrap();
        viewer.commit_settings("gain").unwrap();
        assert_eq!(viewer.viewer.settings.gain.get(), 512.0);
    }

    #[test]
    fn test_ini_detector_twice_reopens_camera() {
        let adapter = Arc::new(MockPylonAdapter::with_devices(vec![
            SimulatedDevice::ace_640_gige(),
        ]));
        let mut viewer = BaslerViewer::new("test", adapter.clone(), &AppConfig::default());

        viewer.ini_detector().unwrap();
        let (info, ok) = viewer.ini_detector().unwrap();
        assert_eq!(info, "Initialized camera");
        assert!(ok);
        assert_eq!(adapter.open_count(), 1);
    }

    #[test]
    fn test_ini_detector_keeps_camera_gain() {
        let device = SimulatedDevice::ace_640_gige();
        let adapter = Arc::new(MockPylonAdapter::with_devices(vec![device.clone()]));
        {
            let mut camera = BaslerCamera::open(adapter.clone(), &device.full_name()).unwrap();
            camera.set_gain(100.0).unwrap();
        }

        let mut viewer = BaslerViewer::new("test", adapter, &AppConfig::default());
        viewer.ini_detector().unwrap();
        assert_eq!(viewer.viewer.settings.gain.get(), 100.0);
        assert_eq!(viewer.viewer.controller().unwrap().gain().unwrap(), 100.0);
    }

    #[test]
    fn test_ini_detector_applies_configured_gain() {
        let mut config = AppConfig::default();
        config.camera.gain = Some(40.0);
        let adapter = Arc::new(MockPylonAdapter::with_devices(vec![
            SimulatedDevice::ace_640_gige(),
        ]));
        let mut viewer = BaslerViewer::new("test", adapter, &config);

        viewer.ini_detector().unwrap();
        assert_eq!(viewer.viewer.settings.gain.get(), 40.0);
        assert_eq!(viewer.viewer.controller().unwrap().gain().unwrap(), 40.0);
    }

    #[test]
    fn test_auto_exposure_commit() {
        let mut viewer = ace_viewer();
        viewer.ini_detector().unwrap();
        assert!(!viewer.viewer.controller().unwrap().auto_exposure().unwrap());

        viewer.viewer.settings.auto_exposure.set(true).unwrap();
        viewer.commit_settings("auto_exposure").unwrap();
        assert!(viewer.viewer.controller().unwrap().auto_exposure().unwrap());

        viewer.viewer.settings.auto_exposure.set(false).unwrap();
        viewer.commit_settings("auto_exposure").unwrap();
        assert!(!viewer.viewer.controller().unwrap().auto_exposure().unwrap());
    }

    #[test]
    fn test_pixel_length_commit_updates_camera() {
        let mut viewer = ace_viewer();
        viewer.ini_detector().unwrap();
        viewer.viewer.settings.pixel_length.set(7.4).unwrap();
        viewer.commit_settings("pixel_length").unwrap();
        assert_eq!(viewer.viewer.controller().unwrap().pixel_length(), Some(7.4));
    }
}
