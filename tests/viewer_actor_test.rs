//! Integration tests for the Basler viewer actor
//!
//! Tests cover:
//! - Actor lifecycle (spawn, initialization, shutdown)
//! - Snapshot and live acquisition through viewer events
//! - ROI changes while grabbing
//! - Camera loss

use basler_daq::actors::{
    BaslerViewer, Close, GetSettings, GrabData, IniDetector, SelectRoi, SetSetting, Stop,
    Subscribe,
};
use basler_daq::config::AppConfig;
use basler_daq::hardware::{MockPylonAdapter, SimulatedDevice};
use basler_daq::viewer::{RoiRect, ViewerEvent};
use kameo::Actor;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Wait for the first event matching `predicate`.
async fn wait_for<F>(events: &mut broadcast::Receiver<ViewerEvent>, mut predicate: F) -> ViewerEvent
where
    F: FnMut(&ViewerEvent) -> bool,
{
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("Event channel closed"),
            }
        }
    })
    .await
    .expect("Timed out waiting for viewer event")
}

fn data_shape(event: &ViewerEvent) -> Option<Vec<usize>> {
    match event {
        ViewerEvent::Data(export) => export.data.first().map(|d| d.shape.clone()),
        _ => None,
    }
}

/// Test initialization and settings snapshot
#[tokio::test]
async fn test_viewer_lifecycle() {
    let actor = BaslerViewer::spawn(BaslerViewer::mock("test_lifecycle"));

    let (status, initialized) = actor.ask(IniDetector).await.expect("Init failed");
    assert_eq!(status, "Initialized camera");
    assert!(initialized);

    let settings = actor.ask(GetSettings).await.expect("Get settings failed");
    assert_eq!(settings["camera_info"]["value"], json!("daA1280-54um"));
    assert_eq!(settings["hdet"]["value"], json!(1280));
    assert_eq!(settings["vdet"]["value"], json!(960));
    assert_eq!(settings["pixel_length"]["value"], json!(3.75));
    assert_eq!(settings["gain"]["title"], json!("Gain (dB)"));

    actor.ask(Close).await.expect("Close failed");
    actor.kill();
    actor.wait_for_shutdown().await;
}

/// Test re-initialization while grabbing
#[tokio::test]
async fn test_reinitialize_while_live() {
    let adapter = Arc::new(MockPylonAdapter::new());
    let actor = BaslerViewer::spawn(BaslerViewer::new(
        "test_reinit",
        adapter.clone(),
        &AppConfig::default(),
    ));
    let mut events = actor.ask(Subscribe).await.expect("Subscribe failed");
    actor.ask(IniDetector).await.expect("Init failed");
    actor
        .ask(GrabData {
            naverage: 1,
            live: true,
        })
        .await
        .expect("Live start failed");
    wait_for(&mut events, |e| matches!(e, ViewerEvent::Data(_))).await;

    let (status, initialized) = actor.ask(IniDetector).await.expect("Re-init failed");
    assert_eq!(status, "Initialized camera");
    assert!(initialized);
    assert_eq!(adapter.open_count(), 1);

    actor.kill();
    actor.wait_for_shutdown().await;
}

/// Test a single averaged snapshot
#[tokio::test]
async fn test_snapshot() {
    let actor = BaslerViewer::spawn(BaslerViewer::mock("test_snap"));
    let mut events = actor.ask(Subscribe).await.expect("Subscribe failed");
    actor.ask(IniDetector).await.expect("Init failed");

    actor
        .ask(GrabData {
            naverage: 2,
            live: false,
        })
        .await
        .expect("Snap failed");

    let event = wait_for(&mut events, |e| matches!(e, ViewerEvent::Data(_))).await;
    let ViewerEvent::Data(export) = event else {
        unreachable!()
    };
    assert_eq!(export.name, "Camera");
    let image = &export.data[0];
    assert_eq!(image.shape, vec![960, 1280]);
    assert_eq!(image.data.len(), 960 * 1280);
    assert_eq!(image.axes.len(), 2);

    actor.kill();
    actor.wait_for_shutdown().await;
}

/// Test continuous grabbing, FPS display and stop
#[tokio::test]
async fn test_live_grabbing() {
    let actor = BaslerViewer::spawn(BaslerViewer::mock("test_live"));
    let mut events = actor.ask(Subscribe).await.expect("Subscribe failed");
    actor.ask(IniDetector).await.expect("Init failed");

    actor
        .ask(GrabData {
            naverage: 1,
            live: true,
        })
        .await
        .expect("Live start failed");

    for _ in 0..3 {
        wait_for(&mut events, |e| matches!(e, ViewerEvent::Data(_))).await;
    }
    wait_for(&mut events, |e| {
        matches!(e, ViewerEvent::SettingChanged { name, .. } if name == "fps")
    })
    .await;

    actor.ask(Stop).await.expect("Stop failed");
    let settings = actor.ask(GetSettings).await.expect("Get settings failed");
    assert!(settings["timing_opts/fps"]["value"].as_f64().unwrap() > 0.0);

    actor.kill();
    actor.wait_for_shutdown().await;
}

/// Test that a ROI change while grabbing restarts acquisition with the new shape
#[tokio::test]
async fn test_roi_change_while_live() {
    let actor = BaslerViewer::spawn(BaslerViewer::mock("test_roi"));
    let mut events = actor.ask(Subscribe).await.expect("Subscribe failed");
    actor.ask(IniDetector).await.expect("Init failed");
    actor
        .ask(GrabData {
            naverage: 1,
            live: true,
        })
        .await
        .expect("Live start failed");
    wait_for(&mut events, |e| matches!(e, ViewerEvent::Data(_))).await;

    actor
        .ask(SelectRoi {
            rect: RoiRect {
                x: 0.0,
                y: 0.0,
                width: 100.0,
                height: 50.0,
            },
        })
        .await
        .expect("Select failed");
    actor
        .ask(SetSetting {
            name: "update_roi".to_string(),
            value: json!(true),
        })
        .await
        .expect("ROI update failed");

    let status = wait_for(&mut events, |e| {
        matches!(e, ViewerEvent::Status { message, .. } if message.starts_with("Changed ROI"))
    })
    .await;
    assert_eq!(status, ViewerEvent::status("Changed ROI: (0, 100, 1, 0, 50, 1)"));
    wait_for(&mut events, |e| data_shape(e) == Some(vec![50, 100])).await;

    let settings = actor.ask(GetSettings).await.expect("Get settings failed");
    assert_eq!(settings["update_roi"]["value"], json!(false));

    actor.ask(Stop).await.expect("Stop failed");
    actor.kill();
    actor.wait_for_shutdown().await;
}

/// Test rejected settings
#[tokio::test]
async fn test_invalid_settings() {
    let actor = BaslerViewer::spawn(BaslerViewer::mock("test_invalid"));
    actor.ask(IniDetector).await.expect("Init failed");

    let unknown = actor
        .ask(SetSetting {
            name: "shutter".to_string(),
            value: json!(1),
        })
        .await;
    assert!(unknown.is_err());

    let read_only = actor
        .ask(SetSetting {
            name: "hdet".to_string(),
            value: json!(10),
        })
        .await;
    assert!(read_only.is_err());

    actor
        .ask(SetSetting {
            name: "timing_opts/exposure_time".to_string(),
            value: json!(2.5),
        })
        .await
        .expect("Exposure change failed");

    actor.kill();
    actor.wait_for_shutdown().await;
}

/// Test camera loss before initialization and during grabbing
#[tokio::test]
async fn test_camera_removed() {
    let adapter = Arc::new(MockPylonAdapter::new());
    let actor = BaslerViewer::spawn(BaslerViewer::new(
        "test_removed",
        adapter.clone(),
        &AppConfig::default(),
    ));
    let mut events = actor.ask(Subscribe).await.expect("Subscribe failed");
    actor.ask(IniDetector).await.expect("Init failed");
    actor
        .ask(GrabData {
            naverage: 1,
            live: true,
        })
        .await
        .expect("Live start failed");
    wait_for(&mut events, |e| matches!(e, ViewerEvent::Data(_))).await;

    adapter.remove_device(&SimulatedDevice::dart_1280().serial_number);
    wait_for(&mut events, |e| *e == ViewerEvent::log("Camera removed")).await;

    let err = actor.ask(IniDetector).await.unwrap_err();
    assert!(err
        .to_string()
        .contains("Camera with name Basler daA1280-54um (40123456) not found anymore."));
    wait_for(&mut events, |e| *e == ViewerEvent::status("Camera not found")).await;

    actor.kill();
    actor.wait_for_shutdown().await;
}
