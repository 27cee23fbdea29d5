//! Camera discovery and library lifecycle.
//!
//! [`SdkRuntime`] is the explicit owner of the driver library's lifetime:
//! sessions call [`acquire`](SdkRuntime::acquire) before touching the
//! driver and [`release`](SdkRuntime::release) when done. The first
//! acquire initialises the library and runs the discovery scan; the last
//! release finalises it. The scan's result, a list of [`CameraInfo`]
//! descriptors, is cached on the runtime and shared by every session.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::driver::{DeviceHandle, Driver, SYSTEM_HANDLE};
use crate::error::{AndorError, CamResult};
use crate::log::CameraLog;

/// Static per-device descriptor built during discovery.
///
/// Identification strings default to `"Unknown"`; a device that does not
/// implement a given metadata feature keeps the default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraInfo {
    /// User-assigned camera name.
    pub camera_name: String,
    /// Model designation.
    pub camera_model: String,
    /// Serial number. Not implemented on every family.
    pub serial_number: String,
    /// Controller board identifier.
    pub controller_id: String,
    /// Camera family. Not implemented on every family.
    pub camera_family: String,
    /// Sensor model designation.
    pub sensor_model: String,
    /// Firmware revision.
    pub firmware_version: String,
    /// Driver revision.
    pub driver_version: String,
    /// Microcode revision.
    pub microcode_version: String,
    /// Physical interface, for example "USB3" or "CL 10 Tap".
    pub interface_type: String,
    /// Sensor width in pixels.
    pub sensor_width: i64,
    /// Sensor height in pixels.
    pub sensor_height: i64,
    /// Pixel pitch in micrometres, horizontal.
    pub pixel_width: f64,
    /// Pixel pitch in micrometres, vertical.
    pub pixel_height: f64,
    /// Index to pass to `open` for this device.
    pub device_index: i32,
}

impl Default for CameraInfo {
    fn default() -> Self {
        let unknown = || "Unknown".to_owned();
        Self {
            camera_name: unknown(),
            camera_model: unknown(),
            serial_number: unknown(),
            controller_id: unknown(),
            camera_family: unknown(),
            sensor_model: unknown(),
            firmware_version: unknown(),
            driver_version: unknown(),
            microcode_version: unknown(),
            interface_type: unknown(),
            sensor_width: 0,
            sensor_height: 0,
            pixel_width: 0.0,
            pixel_height: 0.0,
            device_index: -1,
        }
    }
}

/// Which identification string to match a camera by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraIdentifier {
    /// Match on `camera_name`.
    Name,
    /// Match on `camera_model`.
    Model,
    /// Match on `serial_number`.
    Serial,
    /// Match on `controller_id`.
    ControllerId,
    /// Match on `camera_family`.
    Family,
    /// Match on `sensor_model`.
    SensorModel,
}

impl CameraIdentifier {
    /// The field of `info` this identifier selects.
    pub fn field<'a>(&self, info: &'a CameraInfo) -> &'a str {
        match self {
            CameraIdentifier::Name => &info.camera_name,
            CameraIdentifier::Model => &info.camera_model,
            CameraIdentifier::Serial => &info.serial_number,
            CameraIdentifier::ControllerId => &info.controller_id,
            CameraIdentifier::Family => &info.camera_family,
            CameraIdentifier::SensorModel => &info.sensor_model,
        }
    }
}

/// Shared owner of the library handle and the discovery cache.
///
/// The live counter gates `initialise`/`finalise`; the init lock
/// serializes the 0-to-1 and 1-to-0 transitions against concurrent
/// session construction.
pub struct SdkRuntime {
    driver: Arc<dyn Driver>,
    log: CameraLog,
    live: AtomicUsize,
    init_lock: Mutex<()>,
    cameras: Mutex<Vec<CameraInfo>>,
}

impl SdkRuntime {
    /// Runtime over `driver`, not yet initialised.
    pub fn new(driver: Arc<dyn Driver>, log: CameraLog) -> Arc<Self> {
        Arc::new(Self {
            driver,
            log,
            live: AtomicUsize::new(0),
            init_lock: Mutex::new(()),
            cameras: Mutex::new(Vec::new()),
        })
    }

    /// The driver this runtime fronts.
    pub fn driver(&self) -> Arc<dyn Driver> {
        Arc::clone(&self.driver)
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        match self.init_lock.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Take a reference on the library. The 0-to-1 transition initialises
    /// the library and runs the discovery scan.
    pub fn acquire(&self) -> CamResult<()> {
        let _g = self.guard();
        if self.live.load(Ordering::SeqCst) == 0 {
            self.driver.initialise()?;
            self.log.info("SDK library initialised");
            match scan_connected_cameras(self.driver.as_ref(), &self.log) {
                Ok(found) => self.replace_cache(found),
                Err(err) => {
                    // Roll back so a later acquire retries init cleanly.
                    let _ = self.driver.finalise();
                    return Err(err);
                }
            }
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Drop a reference on the library. The 1-to-0 transition finalises
    /// it. Releasing when never acquired is a no-op.
    pub fn release(&self) -> CamResult<()> {
        let _g = self.guard();
        let live = self.live.load(Ordering::SeqCst);
        if live == 0 {
            return Ok(());
        }
        self.live.store(live - 1, Ordering::SeqCst);
        if live == 1 {
            self.driver.finalise()?;
            self.log.info("SDK library finalised");
        }
        Ok(())
    }

    /// Current reference count.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Handle on the runtime's log, for callers that share its sink.
    pub fn log(&self) -> CameraLog {
        self.log.clone()
    }

    /// Snapshot of the discovery cache.
    pub fn cameras(&self) -> Vec<CameraInfo> {
        self.cameras.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// First cached camera whose `identifier` field is non-empty and
    /// equals `value` exactly.
    pub fn find(&self, identifier: CameraIdentifier, value: &str) -> Option<CameraInfo> {
        let cameras = self.cameras.lock().ok()?;
        cameras
            .iter()
            .find(|info| {
                let field = identifier.field(info);
                !field.is_empty() && field == value
            })
            .cloned()
    }

    /// Re-run the scan and wholesale-replace the cache.
    pub fn rescan(&self) -> CamResult<usize> {
        let found = scan_connected_cameras(self.driver.as_ref(), &self.log)?;
        let count = found.len();
        self.replace_cache(found);
        Ok(count)
    }

    /// Number of devices the library currently reports, read through the
    /// system pseudo-device.
    pub fn device_count(&self) -> CamResult<i64> {
        self.driver.get_int(SYSTEM_HANDLE, "DeviceCount")
    }

    /// Version string of the SDK library itself, read through the system
    /// pseudo-device.
    pub fn software_version(&self) -> CamResult<String> {
        let len = self
            .driver
            .get_string_max_length(SYSTEM_HANDLE, "SoftwareVersion")?;
        if len == 0 {
            return Err(AndorError::EmptyLength {
                feature: "SoftwareVersion".into(),
            });
        }
        self.driver.get_string(SYSTEM_HANDLE, "SoftwareVersion", len)
    }

    fn replace_cache(&self, found: Vec<CameraInfo>) {
        if let Ok(mut cameras) = self.cameras.lock() {
            *cameras = found;
        }
    }
}

fn read_string_if_implemented(
    driver: &dyn Driver,
    handle: DeviceHandle,
    feature: &str,
) -> Option<String> {
    match driver.is_implemented(handle, feature) {
        Ok(true) => {}
        _ => return None,
    }
    let len = driver.get_string_max_length(handle, feature).ok()?;
    if len == 0 {
        return None;
    }
    driver.get_string(handle, feature, len).ok()
}

fn read_int_if_implemented(driver: &dyn Driver, handle: DeviceHandle, feature: &str) -> Option<i64> {
    match driver.is_implemented(handle, feature) {
        Ok(true) => driver.get_int(handle, feature).ok(),
        _ => None,
    }
}

fn read_float_if_implemented(
    driver: &dyn Driver,
    handle: DeviceHandle,
    feature: &str,
) -> Option<f64> {
    match driver.is_implemented(handle, feature) {
        Ok(true) => driver.get_float(handle, feature).ok(),
        _ => None,
    }
}

/// Open every reported device index transiently and read its metadata.
///
/// Devices that fail to open are skipped, not recorded as partial
/// entries. Features a device does not implement keep the descriptor's
/// defaults. The full `0..count` range is scanned.
pub fn scan_connected_cameras(driver: &dyn Driver, log: &CameraLog) -> CamResult<Vec<CameraInfo>> {
    let count = driver.get_int(SYSTEM_HANDLE, "DeviceCount")?;
    log.info(&format!("discovery: {count} device(s) reported"));

    let mut found = Vec::new();
    for index in 0..count {
        let handle = match driver.open(index as i32) {
            Ok(h) => h,
            Err(err) => {
                log.error(&format!("discovery: device {index} failed to open: {err}"));
                continue;
            }
        };

        let mut info = CameraInfo {
            device_index: index as i32,
            ..CameraInfo::default()
        };
        let strings: [(&str, &mut String); 10] = [
            ("CameraName", &mut info.camera_name),
            ("CameraModel", &mut info.camera_model),
            ("SerialNumber", &mut info.serial_number),
            ("ControllerID", &mut info.controller_id),
            ("CameraFamily", &mut info.camera_family),
            ("SensorModel", &mut info.sensor_model),
            ("FirmwareVersion", &mut info.firmware_version),
            ("DriverVersion", &mut info.driver_version),
            ("MicrocodeVersion", &mut info.microcode_version),
            ("InterfaceType", &mut info.interface_type),
        ];
        for (feature, slot) in strings {
            if let Some(value) = read_string_if_implemented(driver, handle, feature) {
                *slot = value;
            }
        }
        if let Some(v) = read_int_if_implemented(driver, handle, "SensorWidth") {
            info.sensor_width = v;
        }
        if let Some(v) = read_int_if_implemented(driver, handle, "SensorHeight") {
            info.sensor_height = v;
        }
        if let Some(v) = read_float_if_implemented(driver, handle, "PixelWidth") {
            info.pixel_width = v;
        }
        if let Some(v) = read_float_if_implemented(driver, handle, "PixelHeight") {
            info.pixel_height = v;
        }

        if let Err(err) = driver.close(handle) {
            log.error(&format!("discovery: device {index} failed to close: {err}"));
        }
        found.push(info);
    }
    Ok(found)
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::mock::MockDriver;

    fn runtime() -> (Arc<MockDriver>, Arc<SdkRuntime>) {
        let driver = Arc::new(MockDriver::new());
        let runtime = SdkRuntime::new(driver.clone(), CameraLog::new());
        (driver, runtime)
    }

    #[test]
    fn first_acquire_initialises_and_scans() {
        let (driver, runtime) = runtime();
        runtime.acquire().unwrap();
        assert!(driver.is_initialised());

        let cameras = runtime.cameras();
        assert_eq!(cameras.len(), 2);
        assert_eq!(cameras[0].serial_number, "SN123");
        // Family metadata only exists on the second simulated device.
        assert_eq!(cameras[0].camera_family, "Unknown");
        assert_eq!(cameras[1].camera_family, "Andor sCMOS");
        assert_eq!(cameras[1].serial_number, "Unknown");
        assert_eq!(cameras[1].device_index, 1);
    }

    #[test]
    fn refcount_gates_init_and_finalise() {
        let (driver, runtime) = runtime();
        runtime.acquire().unwrap();
        runtime.acquire().unwrap();
        assert_eq!(runtime.live_count(), 2);
        assert_eq!(driver.init_count(), 1);

        runtime.release().unwrap();
        assert!(driver.is_initialised());
        runtime.release().unwrap();
        assert!(!driver.is_initialised());

        // Releasing past zero stays a no-op.
        runtime.release().unwrap();
        assert_eq!(runtime.live_count(), 0);
    }

    #[test]
    fn scan_skips_devices_that_fail_to_open() {
        let (driver, runtime) = runtime();
        runtime.acquire().unwrap();
        driver.fail_next_open(crate::driver::codes::AT_ERR_DEVICEINUSE);
        let count = runtime.rescan().unwrap();
        assert_eq!(count, 1);
        assert_eq!(runtime.cameras()[0].device_index, 1);
    }

    #[test]
    fn scan_covers_the_full_device_range() {
        let (_driver, runtime) = runtime();
        runtime.acquire().unwrap();
        let indices: Vec<i32> = runtime.cameras().iter().map(|c| c.device_index).collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn find_matches_exact_non_empty_fields() {
        let (_driver, runtime) = runtime();
        runtime.acquire().unwrap();
        let hit = runtime.find(CameraIdentifier::Serial, "SN123").unwrap();
        assert_eq!(hit.device_index, 0);
        assert!(runtime.find(CameraIdentifier::Serial, "SN999").is_none());
        assert!(runtime.find(CameraIdentifier::Family, "Unknown").is_some());
    }

    #[test]
    fn system_pseudo_device_reports_count_and_version() {
        let (_driver, runtime) = runtime();
        runtime.acquire().unwrap();
        assert_eq!(runtime.device_count().unwrap(), 2);
        assert!(!runtime.software_version().unwrap().is_empty());
    }
}
