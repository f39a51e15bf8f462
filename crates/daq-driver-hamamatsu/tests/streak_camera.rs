//! Full system bring-up against an emulated RemoteEx server.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]

mod common;

use common::{wait_until, MockImage, MockRemoteEx, Scripted};
use daq_core::capabilities::{FrameProducer, Parameterized, ShutterControl, Triggerable};
use daq_driver_hamamatsu::metadata;
use daq_driver_hamamatsu::{Binning, HamamatsuRxConfig, ShutterState, StreakCamera};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

fn config(mock: &MockRemoteEx) -> HamamatsuRxConfig {
    let mut config = HamamatsuRxConfig::new("127.0.0.1", mock.port());
    config.command_timeout_ms = 2000;
    config.delay_generator.enabled = true;
    config
}

fn calibrated(mock: &MockRemoteEx) -> HamamatsuRxConfig {
    let mut config = config(mock);
    let mut table = BTreeMap::new();
    table.insert("1e-06".to_string(), 2e-8);
    table.insert("0.001".to_string(), 5e-8);
    config.delay_generator.time_range_to_delay = Some(table);
    config
}

#[tokio::test]
async fn bring_up_leaves_hardware_safe() {
    let mock = MockRemoteEx::streak_system().await;
    let system = StreakCamera::connect(&config(&mock)).await.unwrap();

    assert_eq!(system.software_version(), "9.5 pf12");
    let received = mock.received();
    assert_eq!(received[0], "AppStart()");
    assert!(received.contains(&"DevParamSet(Streakcamera,MCP Gain,0)".to_string()));
    assert!(received.contains(&"DevParamSet(Streakcamera,Mode,Focus)".to_string()));
    assert!(received.contains(&"DevParamSet(Delaybox,Trig. Mode,Ext. rising)".to_string()));
    assert!(received.contains(&"CamParamSet(Setup,ScanMode,Subarray)".to_string()));

    let unit = system.streak_unit();
    assert_eq!(unit.mcp_gain().get(), 0);
    assert!(!unit.streak_mode().get());
    assert_eq!(unit.shutter().map(|s| s.get()), Some(ShutterState::Closed));
    assert_eq!(unit.time_range().get(), 1e-9);
    assert_eq!(unit.metadata()[metadata::HW_VERSION], "C10910");

    let dg = system.delay_generator().unwrap();
    assert_eq!(dg.trigger_rate().map(|r| r.get()), Some(1000.0));
    assert_eq!(dg.trigger_delay().map(|d| d.get()), Some(0.0));
    assert_eq!(dg.delay("delay_b").map(|d| d.range()), Some(Some((0.0, 10.0))));

    let camera = system.readout_camera().unwrap();
    assert_eq!(camera.binning().get(), Binning::new(2, 2));
    assert_eq!(camera.resolution(), (1024, 1024));
    assert_eq!(camera.exposure_time().get(), 0.1);
    assert_eq!(
        camera.metadata()[metadata::SENSOR_SIZE],
        serde_json::json!([2048, 2048])
    );

    let names = system.parameters().names();
    for name in ["mcp_gain", "time_range", "trigger_delay", "binning", "exposure_time"] {
        assert!(names.contains(&name), "{name} missing from {names:?}");
    }
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn setters_write_through() {
    let mock = MockRemoteEx::streak_system().await;
    let system = StreakCamera::connect(&config(&mock)).await.unwrap();
    let unit = system.streak_unit();

    unit.streak_mode().set(true).await.unwrap();
    unit.mcp_gain().set(20).await.unwrap();
    assert_eq!(mock.dev("Streakcamera", "Mode").as_deref(), Some("Operate"));
    assert_eq!(mock.dev("Streakcamera", "MCP Gain").as_deref(), Some("20"));
    assert!(unit.mcp_gain().set(64).await.is_err());

    // focus mode drops the gain first
    unit.streak_mode().set(false).await.unwrap();
    assert_eq!(mock.dev("Streakcamera", "MCP Gain").as_deref(), Some("0"));
    assert_eq!(unit.mcp_gain().get(), 0);

    unit.time_range().set(1e-6).await.unwrap();
    assert_eq!(mock.dev("Streakcamera", "Time Range").as_deref(), Some("1 us"));
    assert!(unit.time_range().set(2e-6).await.is_err());

    let camera = system.readout_camera().unwrap();
    camera.binning().set(Binning::new(4, 4)).await.unwrap();
    assert_eq!(mock.cam("Setup", "Binning").as_deref(), Some("4 x 4"));
    assert_eq!(camera.resolution(), (512, 512));
    assert_eq!(
        camera.metadata()[metadata::BINNING],
        serde_json::json!([4, 4])
    );

    camera.exposure_time().set(0.02).await.unwrap();
    assert_eq!(mock.cam("Live", "Exposure").as_deref(), Some("20 ms"));
    assert_eq!(camera.metadata()[metadata::EXPOSURE_TIME], 0.02);

    assert_eq!(system.delay_generator().unwrap().set_delay("delay_b", 2e-8).await.unwrap(), 2e-8);
    assert_eq!(mock.dev("Delaybox", "Delay B").as_deref(), Some("0.00000002"));
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn poll_notifies_only_on_change() {
    let mock = MockRemoteEx::streak_system().await;
    let system = StreakCamera::connect(&config(&mock)).await.unwrap();
    let unit = system.streak_unit();
    let mut gain = unit.mcp_gain().subscribe();
    gain.borrow_and_update();

    unit.update_settings().await;
    assert!(!gain.has_changed().unwrap());

    mock.set_dev("Streakcamera", "MCP Gain", "7");
    unit.update_settings().await;
    assert!(gain.has_changed().unwrap());
    assert_eq!(*gain.borrow_and_update(), 7);
    assert_eq!(unit.metadata()[metadata::STREAK_MCP_GAIN], 7);
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutter_waits_for_the_blade() {
    let mock = MockRemoteEx::streak_system().await;
    let system = StreakCamera::connect(&config(&mock)).await.unwrap();
    let unit = system.streak_unit();

    let start = Instant::now();
    unit.open_shutter().await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(150));
    assert_eq!(mock.dev("Streakcamera", "Shutter").as_deref(), Some("Open"));
    assert!(unit.is_shutter_open().await.unwrap());

    unit.close_shutter().await.unwrap();
    assert!(!unit.is_shutter_open().await.unwrap());
    system.shutdown().await.unwrap();
}

#[tracing_test::traced_test]
#[tokio::test]
async fn trigger_delay_follows_time_range() {
    let mock = MockRemoteEx::streak_system().await;
    let system = StreakCamera::connect(&calibrated(&mock)).await.unwrap();
    let unit = system.streak_unit();
    let delay = system.delay_generator().unwrap().trigger_delay().unwrap().clone();

    // the device reports a range within tolerance of the 1 us calibration
    mock.set_dev("Streakcamera", "Time Range", "1.000001 us");
    unit.update_settings().await;
    assert!(wait_until(|| mock.dev("Delaybox", "Delay A").as_deref() == Some("0.00000002")).await);
    assert!(wait_until(|| (delay.get() - 2e-8).abs() < 1e-15).await);

    // no calibration for 500 us: nothing written, only a warning
    let writes = mock.count("DevParamSet");
    unit.time_range().set(5e-4).await.unwrap();
    assert!(wait_until(|| logs_contain("is not a key in MD for time range")).await);
    assert_eq!(mock.count("DevParamSet"), writes + 1);
    assert!((delay.get() - 2e-8).abs() < 1e-15);

    unit.time_range().set(1e-3).await.unwrap();
    assert!(wait_until(|| mock.dev("Delaybox", "Delay A").as_deref() == Some("0.00000005")).await);
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn invalid_calibration_aborts_bring_up() {
    let mock = MockRemoteEx::streak_system().await;
    let mut config = config(&mock);
    let mut table = BTreeMap::new();
    table.insert("1e-06".to_string(), 11.0);
    config.delay_generator.time_range_to_delay = Some(table);

    let err = StreakCamera::connect(&config).await.unwrap_err();
    assert!(format!("{err:#}").contains("not in range"), "{err:#}");
    assert_eq!(mock.count("AppEnd"), 1);
}

#[tokio::test]
async fn missing_licence_is_not_ready() {
    let mock = MockRemoteEx::streak_system().await;
    mock.script(
        "AppLicenceGet",
        [Scripted::Status(0, vec!["0".into(), "0".into()])],
    );

    let err = StreakCamera::connect(&config(&mock)).await.unwrap_err();
    assert!(format!("{err:#}").contains("license dongle"), "{err:#}");
    assert_eq!(mock.count("AppEnd"), 1);
    assert_eq!(mock.count("DevParamGet"), 0);
}

#[tokio::test]
async fn communication_error_is_not_ready() {
    let mock = MockRemoteEx::streak_system().await;
    mock.script(
        "AppStart",
        [Scripted::Raw(
            "4,AppStart,Communication error with camera\r0,AppStart,\r".to_string(),
        )],
    );

    let err = StreakCamera::connect(&config(&mock)).await.unwrap_err();
    assert!(format!("{err:#}").contains("not ready"), "{err:#}");
    assert_eq!(mock.count("AppLicenceGet"), 0);
}

#[tokio::test]
async fn missing_camera_is_reported() {
    let mock = MockRemoteEx::streak_system().await;
    mock.script("CamParamGet", [Scripted::Status(2, vec![])]);

    let err = StreakCamera::connect(&config(&mock)).await.unwrap_err();
    assert!(format!("{err:#}").contains("check it is powered"), "{err:#}");
    // the streak unit was made safe again before giving up
    assert_eq!(mock.dev("Streakcamera", "Shutter").as_deref(), Some("Closed"));
    assert_eq!(mock.count("AppEnd"), 1);
}

#[tokio::test]
async fn optional_components_can_be_disabled() {
    let mock = MockRemoteEx::streak_system().await;
    let mut config = config(&mock);
    config.delay_generator.enabled = false;
    config.readout_camera.enabled = false;

    let system = StreakCamera::connect(&config).await.unwrap();
    assert!(system.delay_generator().is_none());
    assert!(system.readout_camera().is_none());
    assert!(!mock.received().iter().any(|c| c.contains("Delaybox") || c.starts_with("Cam")));
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn live_images_carry_merged_metadata() {
    let mock = MockRemoteEx::streak_system().await;
    mock.add_image(MockImage::ramp(8, 4, "17"));
    mock.announce_on_start("17");
    let system = StreakCamera::connect(&config(&mock)).await.unwrap();
    let camera = system.readout_camera().unwrap();

    let mut images = camera.subscribe_images().await.unwrap();
    camera.start_stream().await.unwrap();
    assert!(camera.is_streaming().await.unwrap());

    let image = tokio::time::timeout(Duration::from_secs(5), images.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!((image.width, image.height), (8, 4));
    let md = &image.metadata;
    let hw = md[metadata::HW_VERSION].as_str().unwrap();
    assert!(hw.contains("OrcaFlash 4.0 V3") && hw.ends_with(", C10910"), "{hw}");
    assert_eq!(md[metadata::TRIGGER_RATE], 1000.0);
    assert_eq!(md[metadata::STREAK_MCP_GAIN], 0);
    assert_eq!(md[metadata::BINNING], serde_json::json!([2, 2]));
    assert!(md.get(metadata::TIME_LIST).is_none());
    assert_eq!(camera.frame_count(), 1);

    system.streak_unit().mcp_gain().set(30).await.unwrap();
    camera.stop_stream().await.unwrap();
    assert!(!camera.is_streaming().await.unwrap());
    assert_eq!(mock.dev("Streakcamera", "MCP Gain").as_deref(), Some("0"));
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn triggers_need_arming() {
    let mock = MockRemoteEx::streak_system().await;
    mock.add_image(MockImage::ramp(2, 2, "3"));
    mock.announce_on_start("3");
    let system = StreakCamera::connect(&config(&mock)).await.unwrap();
    let camera = system.readout_camera().unwrap();

    assert!(camera.trigger().await.is_err());
    camera.arm().await.unwrap();
    assert!(camera.is_armed().await.unwrap());

    let mut images = camera.subscribe_images().await.unwrap();
    camera.start_stream().await.unwrap();
    camera.trigger().await.unwrap();
    let image = tokio::time::timeout(Duration::from_secs(5), images.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(image.sequence, 3);
    assert_eq!(mock.count("AcqStart"), 1);

    camera.disarm().await.unwrap();
    assert!(!camera.is_armed().await.unwrap());
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let mock = MockRemoteEx::streak_system().await;
    let system = StreakCamera::connect(&config(&mock)).await.unwrap();
    system.streak_unit().streak_mode().set(true).await.unwrap();
    system.streak_unit().mcp_gain().set(40).await.unwrap();
    system.streak_unit().open_shutter().await.unwrap();

    system.shutdown().await.unwrap();
    system.shutdown().await.unwrap();
    assert_eq!(mock.dev("Streakcamera", "MCP Gain").as_deref(), Some("0"));
    assert_eq!(mock.dev("Streakcamera", "Mode").as_deref(), Some("Focus"));
    assert_eq!(mock.dev("Streakcamera", "Shutter").as_deref(), Some("Closed"));
    assert_eq!(mock.count("AppEnd"), 1);
    assert!(system.invoker().app_info("Version").await.is_err());
}
