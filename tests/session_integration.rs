//! End-to-end scenarios against the simulated driver.

use std::io::Read;
use std::sync::Arc;

use serial_test::serial;

use andor3::mock::MockDriver;
use andor3::{
    AndorError, CameraIdentifier, CameraLog, CameraSession, LogLevel, SdkRuntime, SessionState,
};

fn runtime() -> (Arc<MockDriver>, Arc<SdkRuntime>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let driver = Arc::new(MockDriver::new());
    let runtime = SdkRuntime::new(driver.clone(), CameraLog::new());
    (driver, runtime)
}

#[test]
fn zero_devices_fail_fast_with_connection_error() {
    let (driver, runtime) = runtime();
    driver.set_device_count(0);
    let mut session = CameraSession::new(runtime).unwrap();

    assert!(!session.connect_by_index(0));
    assert_eq!(session.state(), SessionState::Uninitialized);
    assert!(matches!(
        session.last_error(),
        Some(AndorError::Connection(_))
    ));
}

#[test]
fn connect_by_serial_number() {
    let (_driver, runtime) = runtime();
    let mut session = CameraSession::new(runtime).unwrap();

    assert!(session.connect_by_identifier(CameraIdentifier::Serial, "SN123"));
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(session.device_index(), 0);
    assert!(session.last_error().is_none());
}

#[test]
fn connect_by_family_picks_the_second_device() {
    let (_driver, runtime) = runtime();
    let mut session = CameraSession::new(runtime).unwrap();

    assert!(session.connect_by_identifier(CameraIdentifier::Family, "Andor sCMOS"));
    assert_eq!(session.device_index(), 1);
}

#[test]
fn identifier_without_a_match_leaves_the_session_untouched() {
    let (_driver, runtime) = runtime();
    let mut session = CameraSession::new(runtime).unwrap();

    assert!(!session.connect_by_identifier(CameraIdentifier::Serial, "SN999"));
    assert_eq!(session.state(), SessionState::Uninitialized);
    assert!(!session.is_connected());
}

#[test]
fn disconnect_when_uninitialized_is_a_no_op() {
    let (_driver, runtime) = runtime();
    let mut session = CameraSession::new(runtime).unwrap();
    session.disconnect();
    assert_eq!(session.state(), SessionState::Uninitialized);
}

#[test]
fn reconnect_tears_down_the_previous_connection() {
    let (_driver, runtime) = runtime();
    let mut session = CameraSession::new(runtime).unwrap();

    assert!(session.connect_by_index(0));
    assert!(session.connect_by_index(1));
    assert_eq!(session.device_index(), 1);
    assert_eq!(session.state(), SessionState::Connected);
}

#[test]
fn acquisition_sizing_divides_frames_by_accumulation() {
    let (_driver, runtime) = runtime();
    let mut session = CameraSession::new(runtime).unwrap();
    assert!(session.connect_by_index(0));

    session.feature("FrameCount").unwrap().write_as(10_i64).unwrap();
    session
        .feature("AccumulateCount")
        .unwrap()
        .write_as(2_i64)
        .unwrap();
    let image_size: i64 = session.feature("ImageSizeBytes").unwrap().read_as().unwrap();
    assert_eq!(image_size, 1024);

    session.acquisition_start().unwrap();
    assert_eq!(session.state(), SessionState::Acquiring);
    assert_eq!(session.buffer_count(), 5);
    assert_eq!(session.buffer_bytes(), 1024);

    session.acquisition_stop().unwrap();
    assert_eq!(session.state(), SessionState::Connected);
}

#[test]
fn double_start_is_a_no_op() {
    let (_driver, runtime) = runtime();
    let mut session = CameraSession::new(runtime).unwrap();
    assert!(session.connect_by_index(0));

    session.acquisition_start().unwrap();
    let count = session.buffer_count();
    session.acquisition_start().unwrap();
    assert_eq!(session.state(), SessionState::Acquiring);
    assert_eq!(session.buffer_count(), count);
}

#[test]
fn pool_ceiling_caps_the_request() {
    let (_driver, runtime) = runtime();
    let mut session = CameraSession::new(runtime).unwrap();
    assert!(session.connect_by_index(0));
    session.set_max_buffers_number(3);

    session.feature("FrameCount").unwrap().write_as(10_i64).unwrap();
    session.acquisition_start().unwrap();
    assert_eq!(session.buffer_count(), 3);
}

#[test]
#[serial]
fn frames_stream_through_wait_and_requeue() {
    let (_driver, runtime) = runtime();
    let mut session = CameraSession::new(runtime).unwrap();
    assert!(session.connect_by_index(0));

    session.feature("FrameCount").unwrap().write_as(4_i64).unwrap();
    session.acquisition_start().unwrap();

    let mut frames = 0;
    for _ in 0..6 {
        match session.wait_buffer(200).unwrap() {
            Some(frame) => {
                assert_eq!(frame.len(), 1024);
                assert!(!frame.as_slice().is_empty());
                session.requeue(frame).unwrap();
                frames += 1;
            }
            None => break,
        }
    }
    assert!(frames >= 4);

    session.acquisition_stop().unwrap();
    // After the stop flushed the queue, a bounded wait times out cleanly.
    assert!(session.wait_buffer(10).unwrap().is_none());
}

#[test]
fn unplug_disconnects_lazily_at_the_next_operation() {
    let (driver, runtime) = runtime();
    let mut session = CameraSession::new(runtime).unwrap();
    assert!(session.connect_by_index(0));

    driver.unplug(0);
    // The driver-thread callback only flips a flag; the session is still
    // formally connected until it next does something.
    assert!(matches!(
        session.feature("ExposureTime"),
        Err(AndorError::Connection(_))
    ));
    assert_eq!(session.state(), SessionState::Uninitialized);
}

#[test]
fn unknown_feature_names_are_rejected() {
    let (_driver, runtime) = runtime();
    let mut session = CameraSession::new(runtime).unwrap();
    assert!(session.connect_by_index(0));

    assert!(matches!(
        session.feature("NoSuchFeature"),
        Err(AndorError::NotImplemented { .. })
    ));
}

#[test]
fn arithmetic_access_to_a_string_feature_is_a_type_mismatch() {
    let (_driver, runtime) = runtime();
    let mut session = CameraSession::new(runtime).unwrap();
    assert!(session.connect_by_index(0));

    let err = session
        .feature("CameraModel")
        .unwrap()
        .read_as::<i64>()
        .unwrap_err();
    assert!(matches!(err, AndorError::TypeMismatch { .. }));
}

#[test]
fn enum_round_trip_through_the_session() {
    let (_driver, runtime) = runtime();
    let mut session = CameraSession::new(runtime).unwrap();
    assert!(session.connect_by_index(0));

    let accessor = session.feature("TriggerMode").unwrap();
    accessor.write_enum_by_string("Software").unwrap();
    let info = accessor.read_enum_info().unwrap();
    assert_eq!(info.values[info.current_index as usize], "Software");
}

#[test]
fn verbose_sink_receives_call_signatures() {
    let (_driver, runtime) = runtime();
    let mut session = CameraSession::new(runtime).unwrap();
    assert!(session.connect_by_index(0));

    let file = tempfile::NamedTempFile::new().unwrap();
    let mut reader = file.reopen().unwrap();
    session.set_log_sink(Box::new(file));
    session.set_log_level(LogLevel::Verbose);
    assert_eq!(session.log_level(), LogLevel::Verbose);

    let _: f64 = session.feature("ExposureTime").unwrap().read_as().unwrap();

    let mut text = String::new();
    reader.read_to_string(&mut text).unwrap();
    assert!(text.contains("AT_GetFloat("));
    assert!(text.contains("ExposureTime"));
}

#[test]
fn session_sink_receives_discovery_lines() {
    let (_driver, runtime) = runtime();
    let mut session = CameraSession::new(Arc::clone(&runtime)).unwrap();

    let file = tempfile::NamedTempFile::new().unwrap();
    let mut reader = file.reopen().unwrap();
    session.set_log_sink(Box::new(file));
    session.set_log_level(LogLevel::Verbose);

    runtime.rescan().unwrap();

    let mut text = String::new();
    reader.read_to_string(&mut text).unwrap();
    assert!(text.contains("discovery: 2 device(s) reported"));
}

#[test]
fn quiet_sink_receives_nothing() {
    let (_driver, runtime) = runtime();
    let mut session = CameraSession::new(runtime).unwrap();
    assert!(session.connect_by_index(0));

    let file = tempfile::NamedTempFile::new().unwrap();
    let mut reader = file.reopen().unwrap();
    session.set_log_sink(Box::new(file));
    session.set_log_level(LogLevel::Quiet);

    let _: f64 = session.feature("ExposureTime").unwrap().read_as().unwrap();

    let mut text = String::new();
    reader.read_to_string(&mut text).unwrap();
    assert!(text.is_empty());
}

#[test]
fn software_version_is_available_without_a_connection() {
    let (_driver, runtime) = runtime();
    let session = CameraSession::new(runtime).unwrap();
    assert_eq!(session.software_version().unwrap(), "3.15.30092.2");
}

#[test]
fn sessions_share_one_library_reference_count() {
    let (driver, runtime) = runtime();
    let first = CameraSession::new(runtime.clone()).unwrap();
    let second = CameraSession::new(runtime.clone()).unwrap();
    assert_eq!(driver.init_count(), 1);

    drop(first);
    assert!(driver.is_initialised());
    drop(second);
    assert!(!driver.is_initialised());
}

fn count_up(_feature: &str, context: *mut std::os::raw::c_void) -> i32 {
    let hits = unsafe { &*(context as *const std::sync::atomic::AtomicUsize) };
    hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    0
}

#[test]
fn disconnect_unregisters_user_callbacks() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let (_driver, runtime) = runtime();
    let mut session = CameraSession::new(runtime).unwrap();
    assert!(session.connect_by_index(0));

    let hits = AtomicUsize::new(0);
    let ctx = &hits as *const AtomicUsize as *mut std::os::raw::c_void;
    session
        .register_feature_callback("ExposureTime", count_up, ctx)
        .unwrap();

    session.feature("ExposureTime").unwrap().write_as(0.02_f64).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    session.disconnect();
    assert!(session.connect_by_index(0));
    session.feature("ExposureTime").unwrap().write_as(0.03_f64).unwrap();
    // The old registration died with the old connection.
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn camera_metadata_serializes_for_embedders() {
    let (_driver, runtime) = runtime();
    let session = CameraSession::new(runtime).unwrap();

    let json = serde_json::to_value(&session.cameras()[0]).unwrap();
    assert_eq!(json["serial_number"], "SN123");
    assert_eq!(json["device_index"], 0);
    assert_eq!(json["camera_family"], "Unknown");
}

#[test]
fn metadata_cache_reflects_family_differences() {
    let (_driver, runtime) = runtime();
    let session = CameraSession::new(runtime).unwrap();

    let cameras = session.cameras();
    assert_eq!(cameras.len(), 2);
    assert_eq!(cameras[0].serial_number, "SN123");
    assert_eq!(cameras[0].camera_family, "Unknown");
    assert_eq!(cameras[1].camera_family, "Andor sCMOS");
    assert_eq!(cameras[1].serial_number, "Unknown");
    assert_eq!(cameras[0].sensor_width, 2560);
    assert!((cameras[0].pixel_width - 6.5).abs() < f64::EPSILON);
}
