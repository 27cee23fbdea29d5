//! Simulated driver for development and tests.
//!
//! `MockDriver` implements the full [`Driver`] contract over two in-memory
//! devices with realistic sCMOS feature tables. The two devices expose
//! different metadata subsets, the way real camera families do: the first
//! implements `SerialNumber` but not `CameraFamily`, the second the other
//! way around.
//!
//! Behavioural notes:
//! - Feature callbacks fire synchronously on the writing thread; the
//!   trampoline contract is exercised, the thread ownership is not.
//! - `wait_buffer` fills one queued buffer per call while an acquisition
//!   is running, with a deterministic per-frame byte pattern, and blocks
//!   on a condvar otherwise until the timeout expires.
//! - Error injection: [`fail_next_open`](MockDriver::fail_next_open),
//!   [`set_device_count`](MockDriver::set_device_count),
//!   [`unplug`](MockDriver::unplug).

use std::collections::{HashMap, VecDeque};
use std::ffi::CString;
use std::os::raw::c_void;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::driver::{codes, DeviceHandle, Driver, Trampoline, WaitOutcome, SYSTEM_HANDLE};
use crate::error::{AndorError, CamResult};

const SOFTWARE_VERSION: &str = "3.15.30092.2";

struct EnumEntry {
    value: &'static str,
    available: bool,
}

enum MockValue {
    Int { value: i64, min: i64, max: i64 },
    Float { value: f64, min: f64, max: f64 },
    Bool(bool),
    Str(String),
    Enum { index: i32, entries: Vec<EnumEntry> },
    Command,
}

struct MockFeature {
    value: MockValue,
    read_only: bool,
}

impl MockFeature {
    fn int(value: i64, min: i64, max: i64) -> Self {
        Self {
            value: MockValue::Int { value, min, max },
            read_only: false,
        }
    }

    fn int_ro(value: i64) -> Self {
        Self {
            value: MockValue::Int {
                value,
                min: value,
                max: value,
            },
            read_only: true,
        }
    }

    fn float(value: f64, min: f64, max: f64) -> Self {
        Self {
            value: MockValue::Float { value, min, max },
            read_only: false,
        }
    }

    fn float_ro(value: f64) -> Self {
        Self {
            value: MockValue::Float {
                value,
                min: value,
                max: value,
            },
            read_only: true,
        }
    }

    fn boolean(value: bool) -> Self {
        Self {
            value: MockValue::Bool(value),
            read_only: false,
        }
    }

    fn string(value: &str, read_only: bool) -> Self {
        Self {
            value: MockValue::Str(value.to_owned()),
            read_only,
        }
    }

    fn enumeration(entries: &[(&'static str, bool)]) -> Self {
        Self {
            value: MockValue::Enum {
                index: 0,
                entries: entries
                    .iter()
                    .map(|&(value, available)| EnumEntry { value, available })
                    .collect(),
            },
            read_only: false,
        }
    }

    fn command() -> Self {
        Self {
            value: MockValue::Command,
            read_only: false,
        }
    }
}

struct MockDevice {
    present: bool,
    acquiring: bool,
    // Addresses only; the memory belongs to the caller's pool.
    queue: VecDeque<(usize, usize)>,
    frame_counter: u8,
    features: HashMap<&'static str, MockFeature>,
}

impl MockDevice {
    fn with_features(features: HashMap<&'static str, MockFeature>) -> Self {
        Self {
            present: true,
            acquiring: false,
            queue: VecDeque::new(),
            frame_counter: 0,
            features,
        }
    }
}

fn acquisition_features(f: &mut HashMap<&'static str, MockFeature>) {
    f.insert("ExposureTime", MockFeature::float(0.01, 0.000_009, 30.0));
    f.insert("FrameRate", MockFeature::float(100.0, 0.001, 1000.0));
    f.insert("FrameCount", MockFeature::int(1, 1, 1_000_000));
    f.insert("AccumulateCount", MockFeature::int(1, 1, 1000));
    f.insert("ImageSizeBytes", MockFeature::int_ro(1024));
    f.insert("AOIWidth", MockFeature::int(2560, 1, 2560));
    f.insert("AOIHeight", MockFeature::int(2160, 1, 2160));
    f.insert("AOILeft", MockFeature::int(1, 1, 2560));
    f.insert("AOITop", MockFeature::int(1, 1, 2160));
    f.insert("SensorCooling", MockFeature::boolean(false));
    f.insert("SensorTemperature", MockFeature::float_ro(0.0));
    f.insert(
        "TargetSensorTemperature",
        MockFeature::float(0.0, -45.0, 30.0),
    );
    f.insert(
        "TriggerMode",
        MockFeature::enumeration(&[
            ("Internal", true),
            ("Software", true),
            ("External", true),
            ("External Start", true),
            ("External Exposure", false),
        ]),
    );
    f.insert(
        "CycleMode",
        MockFeature::enumeration(&[("Fixed", true), ("Continuous", true)]),
    );
    f.insert(
        "PixelEncoding",
        MockFeature::enumeration(&[
            ("Mono12", true),
            ("Mono12Packed", true),
            ("Mono16", true),
            ("Mono32", false),
        ]),
    );
    f.insert(
        "PixelReadoutRate",
        MockFeature::enumeration(&[("100 MHz", true), ("280 MHz", true)]),
    );
    f.insert(
        "ElectronicShutteringMode",
        MockFeature::enumeration(&[("Rolling", true), ("Global", true)]),
    );
    f.insert(
        "AOIBinning",
        MockFeature::enumeration(&[("1x1", true), ("2x2", true), ("4x4", true), ("8x8", true)]),
    );
    f.insert(
        "FanSpeed",
        MockFeature::enumeration(&[("Off", true), ("Low", true), ("On", true)]),
    );
    f.insert(
        "BitDepth",
        MockFeature::enumeration(&[("11 Bit", true), ("16 Bit", true)]),
    );
    f.insert("AcquisitionStart", MockFeature::command());
    f.insert("AcquisitionStop", MockFeature::command());
    f.insert("SoftwareTrigger", MockFeature::command());
    f.insert("TimestampClockReset", MockFeature::command());
    f.insert("CameraDump", MockFeature::command());
    f.insert("SensorWidth", MockFeature::int_ro(2560));
    f.insert("SensorHeight", MockFeature::int_ro(2160));
    f.insert("PixelWidth", MockFeature::float_ro(6.5));
    f.insert("PixelHeight", MockFeature::float_ro(6.5));
}

fn sim_zyla() -> MockDevice {
    let mut f = HashMap::new();
    acquisition_features(&mut f);
    f.insert("CameraName", MockFeature::string("Zyla", false));
    f.insert("CameraModel", MockFeature::string("ZYLA-5.5-CL3", true));
    f.insert("SerialNumber", MockFeature::string("SN123", true));
    f.insert("ControllerID", MockFeature::string("CL-1", true));
    f.insert("FirmwareVersion", MockFeature::string("V1.9.16.0", true));
    f.insert("DriverVersion", MockFeature::string(SOFTWARE_VERSION, true));
    f.insert("InterfaceType", MockFeature::string("CL 10 Tap", true));
    MockDevice::with_features(f)
}

fn sim_neo() -> MockDevice {
    let mut f = HashMap::new();
    acquisition_features(&mut f);
    f.insert("CameraName", MockFeature::string("Neo", false));
    f.insert("CameraModel", MockFeature::string("NEO-5.5-CL3", true));
    f.insert("CameraFamily", MockFeature::string("Andor sCMOS", true));
    f.insert("SensorModel", MockFeature::string("CIS2051", true));
    f.insert("ControllerID", MockFeature::string("CL-2", true));
    f.insert("FirmwareVersion", MockFeature::string("V1.22.3.0", true));
    f.insert("DriverVersion", MockFeature::string(SOFTWARE_VERSION, true));
    f.insert("InterfaceType", MockFeature::string("USB3", true));
    MockDevice::with_features(f)
}

struct Registration {
    handle: i32,
    feature: String,
    trampoline: Trampoline,
    context: usize,
}

struct MockInner {
    initialised: bool,
    init_count: usize,
    device_count: usize,
    devices: Vec<MockDevice>,
    handles: HashMap<i32, usize>,
    next_handle: i32,
    fail_next_open: Option<i32>,
    zero_length_strings: Vec<String>,
    registrations: Vec<Registration>,
}

/// In-memory stand-in for the vendor driver.
pub struct MockDriver {
    inner: Mutex<MockInner>,
    cond: Condvar,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// Driver simulating two devices of different families.
    pub fn new() -> Self {
        let devices = vec![sim_zyla(), sim_neo()];
        Self {
            inner: Mutex::new(MockInner {
                initialised: false,
                init_count: 0,
                device_count: devices.len(),
                devices,
                handles: HashMap::new(),
                next_handle: 100,
                fail_next_open: None,
                zero_length_strings: Vec::new(),
                registrations: Vec::new(),
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockInner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Whether `initialise` was called more recently than `finalise`.
    pub fn is_initialised(&self) -> bool {
        self.lock().initialised
    }

    /// Number of library initialisations performed so far.
    pub fn init_count(&self) -> usize {
        self.lock().init_count
    }

    /// Make the next `open` fail with `code`.
    pub fn fail_next_open(&self, code: i32) {
        self.lock().fail_next_open = Some(code);
    }

    /// Override the device count the system pseudo-device reports.
    pub fn set_device_count(&self, count: usize) {
        self.lock().device_count = count;
    }

    /// Make `get_string_max_length` report zero for `feature`, as a
    /// misbehaving driver build would.
    pub fn report_zero_string_length(&self, feature: &str) {
        self.lock().zero_length_strings.push(feature.to_owned());
    }

    /// Simulate the device at `index` being unplugged: presence drops and
    /// every `CameraPresent` callback registered on it fires.
    pub fn unplug(&self, index: usize) {
        let to_fire;
        {
            let mut inner = self.lock();
            let Some(device) = inner.devices.get_mut(index) else {
                return;
            };
            device.present = false;
            to_fire = Self::matching_callbacks(&inner, index, "CameraPresent");
        }
        self.cond.notify_all();
        Self::fire(&to_fire, "CameraPresent");
    }

    fn resolve(inner: &MockInner, handle: DeviceHandle, call: &str) -> CamResult<usize> {
        inner
            .handles
            .get(&handle.0)
            .copied()
            .ok_or_else(|| AndorError::sdk(codes::AT_ERR_INVALIDHANDLE, call.to_owned()))
    }

    fn matching_callbacks(
        inner: &MockInner,
        device: usize,
        feature: &str,
    ) -> Vec<(Trampoline, usize)> {
        inner
            .registrations
            .iter()
            .filter(|r| {
                r.feature == feature && inner.handles.get(&r.handle).copied() == Some(device)
            })
            .map(|r| (r.trampoline, r.context))
            .collect()
    }

    fn fire(callbacks: &[(Trampoline, usize)], feature: &str) {
        if callbacks.is_empty() {
            return;
        }
        let Ok(name) = CString::new(feature) else {
            return;
        };
        for &(trampoline, context) in callbacks {
            unsafe {
                trampoline(name.as_ptr(), context as *mut c_void);
            }
        }
    }

    fn read_feature<T>(
        &self,
        handle: DeviceHandle,
        feature: &str,
        call: &str,
        f: impl FnOnce(&MockFeature) -> CamResult<T>,
    ) -> CamResult<T> {
        let inner = self.lock();
        let idx = Self::resolve(&inner, handle, call)?;
        let device = &inner.devices[idx];
        if feature == "CameraPresent" {
            return Err(AndorError::sdk(codes::AT_ERR_NOTIMPLEMENTED, call.to_owned()));
        }
        if !device.present {
            return Err(AndorError::sdk(codes::AT_ERR_CONNECTION, call.to_owned()));
        }
        let feat = device
            .features
            .get(feature)
            .ok_or_else(|| AndorError::sdk(codes::AT_ERR_NOTIMPLEMENTED, call.to_owned()))?;
        f(feat)
    }

    fn write_feature(
        &self,
        handle: DeviceHandle,
        feature: &str,
        call: &str,
        f: impl FnOnce(&mut MockFeature) -> CamResult<()>,
    ) -> CamResult<()> {
        let to_fire;
        {
            let mut inner = self.lock();
            let idx = Self::resolve(&inner, handle, call)?;
            let device = &mut inner.devices[idx];
            if !device.present {
                return Err(AndorError::sdk(codes::AT_ERR_CONNECTION, call.to_owned()));
            }
            let feat = device
                .features
                .get_mut(feature)
                .ok_or_else(|| AndorError::sdk(codes::AT_ERR_NOTIMPLEMENTED, call.to_owned()))?;
            if feat.read_only {
                return Err(AndorError::sdk(codes::AT_ERR_READONLY, call.to_owned()));
            }
            f(feat)?;
            to_fire = Self::matching_callbacks(&inner, idx, feature);
        }
        self.cond.notify_all();
        Self::fire(&to_fire, feature);
        Ok(())
    }
}

impl Driver for MockDriver {
    fn initialise(&self) -> CamResult<()> {
        let mut inner = self.lock();
        if !inner.initialised {
            inner.initialised = true;
            inner.init_count += 1;
        }
        Ok(())
    }

    fn finalise(&self) -> CamResult<()> {
        self.lock().initialised = false;
        Ok(())
    }

    fn open(&self, index: i32) -> CamResult<DeviceHandle> {
        let mut inner = self.lock();
        if let Some(code) = inner.fail_next_open.take() {
            return Err(AndorError::sdk(code, format!("AT_Open({index})")));
        }
        let in_range = index >= 0
            && (index as usize) < inner.device_count
            && (index as usize) < inner.devices.len();
        if !in_range {
            return Err(AndorError::sdk(
                codes::AT_ERR_DEVICENOTFOUND,
                format!("AT_Open({index})"),
            ));
        }
        let handle = inner.next_handle;
        inner.next_handle += 1;
        inner.handles.insert(handle, index as usize);
        Ok(DeviceHandle(handle))
    }

    fn close(&self, handle: DeviceHandle) -> CamResult<()> {
        let mut inner = self.lock();
        let idx = Self::resolve(&inner, handle, "AT_Close")?;
        inner.devices[idx].acquiring = false;
        inner.devices[idx].queue.clear();
        inner.handles.remove(&handle.0);
        inner.registrations.retain(|r| r.handle != handle.0);
        Ok(())
    }

    fn get_int(&self, handle: DeviceHandle, feature: &str) -> CamResult<i64> {
        if handle == SYSTEM_HANDLE {
            if feature == "DeviceCount" {
                return Ok(self.lock().device_count as i64);
            }
            return Err(AndorError::sdk(codes::AT_ERR_NOTIMPLEMENTED, "AT_GetInt"));
        }
        self.read_feature(handle, feature, "AT_GetInt", |feat| match feat.value {
            MockValue::Int { value, .. } => Ok(value),
            _ => Err(AndorError::sdk(codes::AT_ERR_NOTIMPLEMENTED, "AT_GetInt")),
        })
    }

    fn set_int(&self, handle: DeviceHandle, feature: &str, new: i64) -> CamResult<()> {
        self.write_feature(handle, feature, "AT_SetInt", |feat| match &mut feat.value {
            MockValue::Int { value, min, max } => {
                if new < *min || new > *max {
                    return Err(AndorError::sdk(codes::AT_ERR_OUTOFRANGE, "AT_SetInt"));
                }
                *value = new;
                Ok(())
            }
            _ => Err(AndorError::sdk(codes::AT_ERR_NOTIMPLEMENTED, "AT_SetInt")),
        })
    }

    fn get_int_min(&self, handle: DeviceHandle, feature: &str) -> CamResult<i64> {
        self.read_feature(handle, feature, "AT_GetIntMin", |feat| match feat.value {
            MockValue::Int { min, .. } => Ok(min),
            _ => Err(AndorError::sdk(codes::AT_ERR_NOTIMPLEMENTED, "AT_GetIntMin")),
        })
    }

    fn get_int_max(&self, handle: DeviceHandle, feature: &str) -> CamResult<i64> {
        self.read_feature(handle, feature, "AT_GetIntMax", |feat| match feat.value {
            MockValue::Int { max, .. } => Ok(max),
            _ => Err(AndorError::sdk(codes::AT_ERR_NOTIMPLEMENTED, "AT_GetIntMax")),
        })
    }

    fn get_float(&self, handle: DeviceHandle, feature: &str) -> CamResult<f64> {
        self.read_feature(handle, feature, "AT_GetFloat", |feat| match feat.value {
            MockValue::Float { value, .. } => Ok(value),
            _ => Err(AndorError::sdk(codes::AT_ERR_NOTIMPLEMENTED, "AT_GetFloat")),
        })
    }

    fn set_float(&self, handle: DeviceHandle, feature: &str, new: f64) -> CamResult<()> {
        self.write_feature(handle, feature, "AT_SetFloat", |feat| match &mut feat.value {
            MockValue::Float { value, min, max } => {
                if new < *min || new > *max {
                    return Err(AndorError::sdk(codes::AT_ERR_OUTOFRANGE, "AT_SetFloat"));
                }
                *value = new;
                Ok(())
            }
            _ => Err(AndorError::sdk(codes::AT_ERR_NOTIMPLEMENTED, "AT_SetFloat")),
        })
    }

    fn get_float_min(&self, handle: DeviceHandle, feature: &str) -> CamResult<f64> {
        self.read_feature(handle, feature, "AT_GetFloatMin", |feat| match feat.value {
            MockValue::Float { min, .. } => Ok(min),
            _ => Err(AndorError::sdk(
                codes::AT_ERR_NOTIMPLEMENTED,
                "AT_GetFloatMin",
            )),
        })
    }

    fn get_float_max(&self, handle: DeviceHandle, feature: &str) -> CamResult<f64> {
        self.read_feature(handle, feature, "AT_GetFloatMax", |feat| match feat.value {
            MockValue::Float { max, .. } => Ok(max),
            _ => Err(AndorError::sdk(
                codes::AT_ERR_NOTIMPLEMENTED,
                "AT_GetFloatMax",
            )),
        })
    }

    fn get_bool(&self, handle: DeviceHandle, feature: &str) -> CamResult<bool> {
        // Presence and acquisition state are live, not stored features.
        if feature == "CameraPresent" || feature == "CameraAcquiring" {
            let inner = self.lock();
            let idx = Self::resolve(&inner, handle, "AT_GetBool")?;
            let device = &inner.devices[idx];
            return Ok(if feature == "CameraPresent" {
                device.present
            } else {
                device.acquiring
            });
        }
        self.read_feature(handle, feature, "AT_GetBool", |feat| match feat.value {
            MockValue::Bool(value) => Ok(value),
            _ => Err(AndorError::sdk(codes::AT_ERR_NOTIMPLEMENTED, "AT_GetBool")),
        })
    }

    fn set_bool(&self, handle: DeviceHandle, feature: &str, new: bool) -> CamResult<()> {
        self.write_feature(handle, feature, "AT_SetBool", |feat| match &mut feat.value {
            MockValue::Bool(value) => {
                *value = new;
                Ok(())
            }
            _ => Err(AndorError::sdk(codes::AT_ERR_NOTIMPLEMENTED, "AT_SetBool")),
        })
    }

    fn get_string_max_length(&self, handle: DeviceHandle, feature: &str) -> CamResult<usize> {
        if self.lock().zero_length_strings.iter().any(|f| f == feature) {
            return Ok(0);
        }
        if handle == SYSTEM_HANDLE && feature == "SoftwareVersion" {
            return Ok(SOFTWARE_VERSION.len() + 1);
        }
        self.read_feature(handle, feature, "AT_GetStringMaxLength", |feat| {
            match &feat.value {
                // Terminator included, as the real driver reports it.
                MockValue::Str(value) => Ok(value.len() + 1),
                _ => Err(AndorError::sdk(
                    codes::AT_ERR_NOTIMPLEMENTED,
                    "AT_GetStringMaxLength",
                )),
            }
        })
    }

    fn get_string(
        &self,
        handle: DeviceHandle,
        feature: &str,
        max_length: usize,
    ) -> CamResult<String> {
        if max_length == 0 {
            return Err(AndorError::sdk(
                codes::AT_ERR_NULL_MAXSTRINGLENGTH,
                "AT_GetString",
            ));
        }
        if handle == SYSTEM_HANDLE && feature == "SoftwareVersion" {
            return Ok(SOFTWARE_VERSION.to_owned());
        }
        self.read_feature(handle, feature, "AT_GetString", |feat| match &feat.value {
            MockValue::Str(value) => {
                if value.len() + 1 > max_length {
                    return Err(AndorError::sdk(
                        codes::AT_ERR_EXCEEDEDMAXSTRINGLENGTH,
                        "AT_GetString",
                    ));
                }
                Ok(value.clone())
            }
            _ => Err(AndorError::sdk(codes::AT_ERR_NOTIMPLEMENTED, "AT_GetString")),
        })
    }

    fn set_string(&self, handle: DeviceHandle, feature: &str, new: &str) -> CamResult<()> {
        self.write_feature(handle, feature, "AT_SetString", |feat| match &mut feat.value {
            MockValue::Str(value) => {
                *value = new.to_owned();
                Ok(())
            }
            _ => Err(AndorError::sdk(codes::AT_ERR_NOTIMPLEMENTED, "AT_SetString")),
        })
    }

    fn get_enum_index(&self, handle: DeviceHandle, feature: &str) -> CamResult<i32> {
        self.read_feature(handle, feature, "AT_GetEnumIndex", |feat| match &feat.value {
            MockValue::Enum { index, .. } => Ok(*index),
            _ => Err(AndorError::sdk(
                codes::AT_ERR_NOTIMPLEMENTED,
                "AT_GetEnumIndex",
            )),
        })
    }

    fn set_enum_index(&self, handle: DeviceHandle, feature: &str, new: i32) -> CamResult<()> {
        self.write_feature(handle, feature, "AT_SetEnumIndex", |feat| {
            match &mut feat.value {
                MockValue::Enum { index, entries } => {
                    let entry = entries.get(new as usize).ok_or_else(|| {
                        AndorError::sdk(codes::AT_ERR_INDEXNOTIMPLEMENTED, "AT_SetEnumIndex")
                    })?;
                    if !entry.available {
                        return Err(AndorError::sdk(
                            codes::AT_ERR_INDEXNOTAVAILABLE,
                            "AT_SetEnumIndex",
                        ));
                    }
                    *index = new;
                    Ok(())
                }
                _ => Err(AndorError::sdk(
                    codes::AT_ERR_NOTIMPLEMENTED,
                    "AT_SetEnumIndex",
                )),
            }
        })
    }

    fn set_enum_string(&self, handle: DeviceHandle, feature: &str, new: &str) -> CamResult<()> {
        self.write_feature(handle, feature, "AT_SetEnumString", |feat| {
            match &mut feat.value {
                MockValue::Enum { index, entries } => {
                    let pos = entries.iter().position(|e| e.value == new).ok_or_else(|| {
                        AndorError::sdk(codes::AT_ERR_INDEXNOTAVAILABLE, "AT_SetEnumString")
                    })?;
                    if !entries[pos].available {
                        return Err(AndorError::sdk(
                            codes::AT_ERR_INDEXNOTAVAILABLE,
                            "AT_SetEnumString",
                        ));
                    }
                    *index = pos as i32;
                    Ok(())
                }
                _ => Err(AndorError::sdk(
                    codes::AT_ERR_NOTIMPLEMENTED,
                    "AT_SetEnumString",
                )),
            }
        })
    }

    fn get_enum_count(&self, handle: DeviceHandle, feature: &str) -> CamResult<i32> {
        self.read_feature(handle, feature, "AT_GetEnumCount", |feat| match &feat.value {
            MockValue::Enum { entries, .. } => Ok(entries.len() as i32),
            _ => Err(AndorError::sdk(
                codes::AT_ERR_NOTIMPLEMENTED,
                "AT_GetEnumCount",
            )),
        })
    }

    fn get_enum_string_by_index(
        &self,
        handle: DeviceHandle,
        feature: &str,
        index: i32,
    ) -> CamResult<String> {
        self.read_feature(handle, feature, "AT_GetEnumStringByIndex", |feat| {
            match &feat.value {
                MockValue::Enum { entries, .. } => entries
                    .get(index as usize)
                    .map(|e| e.value.to_owned())
                    .ok_or_else(|| {
                        AndorError::sdk(codes::AT_ERR_OUTOFRANGE, "AT_GetEnumStringByIndex")
                    }),
                _ => Err(AndorError::sdk(
                    codes::AT_ERR_NOTIMPLEMENTED,
                    "AT_GetEnumStringByIndex",
                )),
            }
        })
    }

    fn is_enum_index_implemented(
        &self,
        handle: DeviceHandle,
        feature: &str,
        index: i32,
    ) -> CamResult<bool> {
        self.read_feature(handle, feature, "AT_IsEnumIndexImplemented", |feat| {
            match &feat.value {
                MockValue::Enum { entries, .. } => Ok((index as usize) < entries.len()),
                _ => Err(AndorError::sdk(
                    codes::AT_ERR_NOTIMPLEMENTED,
                    "AT_IsEnumIndexImplemented",
                )),
            }
        })
    }

    fn is_enum_index_available(
        &self,
        handle: DeviceHandle,
        feature: &str,
        index: i32,
    ) -> CamResult<bool> {
        self.read_feature(handle, feature, "AT_IsEnumIndexAvailable", |feat| {
            match &feat.value {
                MockValue::Enum { entries, .. } => Ok(entries
                    .get(index as usize)
                    .map(|e| e.available)
                    .unwrap_or(false)),
                _ => Err(AndorError::sdk(
                    codes::AT_ERR_NOTIMPLEMENTED,
                    "AT_IsEnumIndexAvailable",
                )),
            }
        })
    }

    fn is_implemented(&self, handle: DeviceHandle, feature: &str) -> CamResult<bool> {
        let inner = self.lock();
        let idx = Self::resolve(&inner, handle, "AT_IsImplemented")?;
        let device = &inner.devices[idx];
        if feature == "CameraPresent" || feature == "CameraAcquiring" {
            return Ok(true);
        }
        Ok(device.features.contains_key(feature))
    }

    fn is_readable(&self, handle: DeviceHandle, feature: &str) -> CamResult<bool> {
        let inner = self.lock();
        let idx = Self::resolve(&inner, handle, "AT_IsReadable")?;
        let device = &inner.devices[idx];
        if feature == "CameraPresent" || feature == "CameraAcquiring" {
            return Ok(true);
        }
        Ok(device
            .features
            .get(feature)
            .map(|f| !matches!(f.value, MockValue::Command))
            .unwrap_or(false))
    }

    fn is_read_only(&self, handle: DeviceHandle, feature: &str) -> CamResult<bool> {
        let inner = self.lock();
        let idx = Self::resolve(&inner, handle, "AT_IsReadOnly")?;
        let device = &inner.devices[idx];
        if feature == "CameraPresent" || feature == "CameraAcquiring" {
            return Ok(true);
        }
        Ok(device
            .features
            .get(feature)
            .map(|f| f.read_only)
            .unwrap_or(false))
    }

    fn is_writable(&self, handle: DeviceHandle, feature: &str) -> CamResult<bool> {
        let inner = self.lock();
        let idx = Self::resolve(&inner, handle, "AT_IsWritable")?;
        let device = &inner.devices[idx];
        if feature == "CameraPresent" || feature == "CameraAcquiring" {
            return Ok(false);
        }
        Ok(device
            .features
            .get(feature)
            .map(|f| !f.read_only && device.present)
            .unwrap_or(false))
    }

    fn issue_command(&self, handle: DeviceHandle, feature: &str) -> CamResult<()> {
        {
            let mut inner = self.lock();
            let idx = Self::resolve(&inner, handle, "AT_Command")?;
            let device = &mut inner.devices[idx];
            if !device.present {
                return Err(AndorError::sdk(codes::AT_ERR_CONNECTION, "AT_Command"));
            }
            match device.features.get(feature).map(|f| &f.value) {
                Some(MockValue::Command) => {}
                Some(_) | None => {
                    return Err(AndorError::sdk(codes::AT_ERR_NOTIMPLEMENTED, "AT_Command"));
                }
            }
            match feature {
                "AcquisitionStart" => device.acquiring = true,
                "AcquisitionStop" => device.acquiring = false,
                _ => {}
            }
        }
        self.cond.notify_all();
        Ok(())
    }

    fn queue_buffer(&self, handle: DeviceHandle, ptr: *mut u8, size: usize) -> CamResult<()> {
        if ptr.is_null() {
            return Err(AndorError::sdk(codes::AT_ERR_NULL_QUEUE_PTR, "AT_QueueBuffer"));
        }
        if ptr as usize % 8 != 0 {
            return Err(AndorError::sdk(
                codes::AT_ERR_INVALIDALIGNMENT,
                "AT_QueueBuffer",
            ));
        }
        let mut inner = self.lock();
        let idx = Self::resolve(&inner, handle, "AT_QueueBuffer")?;
        inner.devices[idx].queue.push_back((ptr as usize, size));
        drop(inner);
        self.cond.notify_all();
        Ok(())
    }

    fn wait_buffer(&self, handle: DeviceHandle, timeout_ms: u32) -> CamResult<WaitOutcome> {
        let timeout = if timeout_ms == codes::AT_INFINITE {
            Duration::from_secs(3600)
        } else {
            Duration::from_millis(u64::from(timeout_ms))
        };
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            let idx = Self::resolve(&inner, handle, "AT_WaitBuffer")?;
            let device = &mut inner.devices[idx];
            if !device.present {
                return Err(AndorError::sdk(codes::AT_ERR_CONNECTION, "AT_WaitBuffer"));
            }
            if device.acquiring {
                if let Some((addr, size)) = device.queue.pop_front() {
                    device.frame_counter = device.frame_counter.wrapping_add(1);
                    let fill = device.frame_counter;
                    unsafe {
                        std::ptr::write_bytes(addr as *mut u8, fill, size);
                    }
                    return Ok(WaitOutcome::Filled {
                        ptr: addr as *mut u8,
                        len: size,
                    });
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(WaitOutcome::TimedOut);
            }
            let (guard, _timed_out) = self
                .cond
                .wait_timeout(inner, deadline - now)
                .map_err(|_| AndorError::sdk(codes::AT_ERR_COMM, "AT_WaitBuffer"))?;
            inner = guard;
        }
    }

    fn flush(&self, handle: DeviceHandle) -> CamResult<()> {
        let mut inner = self.lock();
        let idx = Self::resolve(&inner, handle, "AT_Flush")?;
        inner.devices[idx].queue.clear();
        Ok(())
    }

    fn register_feature_callback(
        &self,
        handle: DeviceHandle,
        feature: &str,
        trampoline: Trampoline,
        context: *mut c_void,
    ) -> CamResult<()> {
        let mut inner = self.lock();
        Self::resolve(&inner, handle, "AT_RegisterFeatureCallback")?;
        inner.registrations.push(Registration {
            handle: handle.0,
            feature: feature.to_owned(),
            trampoline,
            context: context as usize,
        });
        Ok(())
    }

    fn unregister_feature_callback(
        &self,
        handle: DeviceHandle,
        feature: &str,
        trampoline: Trampoline,
        context: *mut c_void,
    ) -> CamResult<()> {
        let mut inner = self.lock();
        let pos = inner.registrations.iter().position(|r| {
            r.handle == handle.0
                && r.feature == feature
                && r.trampoline == trampoline
                && r.context == context as usize
        });
        if let Some(pos) = pos {
            inner.registrations.remove(pos);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_respects_the_reported_device_count() {
        let driver = MockDriver::new();
        assert!(driver.open(0).is_ok());
        driver.set_device_count(0);
        assert_eq!(driver.get_int(SYSTEM_HANDLE, "DeviceCount").unwrap(), 0);
        let err = driver.open(0).unwrap_err();
        assert_eq!(err.sdk_code(), codes::AT_ERR_DEVICENOTFOUND);
    }

    #[test]
    fn out_of_range_writes_are_rejected() {
        let driver = MockDriver::new();
        let handle = driver.open(0).unwrap();
        let err = driver.set_float(handle, "ExposureTime", 1e9).unwrap_err();
        assert_eq!(err.sdk_code(), codes::AT_ERR_OUTOFRANGE);
        let err = driver.set_int(handle, "AOIWidth", 0).unwrap_err();
        assert_eq!(err.sdk_code(), codes::AT_ERR_OUTOFRANGE);
    }

    #[test]
    fn unplug_drops_presence_and_fails_later_calls() {
        let driver = MockDriver::new();
        let handle = driver.open(0).unwrap();
        assert!(driver.get_bool(handle, "CameraPresent").unwrap());

        driver.unplug(0);
        assert!(!driver.get_bool(handle, "CameraPresent").unwrap());
        let err = driver.get_float(handle, "ExposureTime").unwrap_err();
        assert_eq!(err.sdk_code(), codes::AT_ERR_CONNECTION);
    }

    #[test]
    fn camera_acquiring_tracks_the_commands() {
        let driver = MockDriver::new();
        let handle = driver.open(0).unwrap();
        assert!(!driver.get_bool(handle, "CameraAcquiring").unwrap());
        driver.issue_command(handle, "AcquisitionStart").unwrap();
        assert!(driver.get_bool(handle, "CameraAcquiring").unwrap());
        driver.issue_command(handle, "AcquisitionStop").unwrap();
        assert!(!driver.get_bool(handle, "CameraAcquiring").unwrap());
    }

    #[repr(align(8))]
    struct Aligned([u8; 64]);

    #[test]
    fn wait_buffer_fills_one_queued_buffer_per_call() {
        let driver = MockDriver::new();
        let handle = driver.open(0).unwrap();
        let mut a = Aligned([0u8; 64]);
        let mut b = Aligned([0u8; 64]);
        driver.queue_buffer(handle, a.0.as_mut_ptr(), 64).unwrap();
        driver.queue_buffer(handle, b.0.as_mut_ptr(), 64).unwrap();
        driver.issue_command(handle, "AcquisitionStart").unwrap();

        match driver.wait_buffer(handle, 100).unwrap() {
            WaitOutcome::Filled { ptr, len } => {
                assert_eq!(ptr, a.0.as_mut_ptr());
                assert_eq!(len, 64);
                assert_eq!(a.0[0], 1);
            }
            WaitOutcome::TimedOut => panic!("expected a frame"),
        }
        match driver.wait_buffer(handle, 100).unwrap() {
            WaitOutcome::Filled { ptr, .. } => {
                assert_eq!(ptr, b.0.as_mut_ptr());
                assert_eq!(b.0[0], 2);
            }
            WaitOutcome::TimedOut => panic!("expected a second frame"),
        }
        assert!(matches!(
            driver.wait_buffer(handle, 10).unwrap(),
            WaitOutcome::TimedOut
        ));
    }

    #[test]
    fn misaligned_buffers_are_rejected() {
        let driver = MockDriver::new();
        let handle = driver.open(0).unwrap();
        let mut buf = Aligned([0u8; 64]);
        let err = driver
            .queue_buffer(handle, unsafe { buf.0.as_mut_ptr().add(1) }, 32)
            .unwrap_err();
        assert_eq!(err.sdk_code(), codes::AT_ERR_INVALIDALIGNMENT);
    }
}
