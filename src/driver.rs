//! The vendor driver boundary.
//!
//! This module defines the contract the rest of the crate consumes: one
//! trait method per SDK primitive, an owned device-handle newtype, and the
//! SDK's numeric error codes. The real SDK is an opaque external
//! collaborator; [`crate::mock::MockDriver`] implements the same contract
//! for development and tests.
//!
//! All methods take `&self` so the trait stays object-safe behind
//! `Arc<dyn Driver>`; implementations use internal mutability.

use std::os::raw::{c_char, c_void};

use crate::error::CamResult;

/// Handle to an opened device, as issued by the driver.
///
/// Wraps the raw handle for type safety; the handle is owned by the
/// session that opened it, never by an accessor bound to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub i32);

/// The distinguished handle addressing library-level features
/// (`DeviceCount`, `SoftwareVersion`) without an open camera.
pub const SYSTEM_HANDLE: DeviceHandle = DeviceHandle(1);

impl std::fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a bounded wait for a filled acquisition buffer.
///
/// A timeout is an expected condition, not an error; callers distinguish
/// it from hard failures themselves.
#[derive(Debug)]
pub enum WaitOutcome {
    /// The driver returned one filled buffer.
    Filled {
        /// Start of the buffer previously queued by the caller.
        ptr: *mut u8,
        /// Number of valid bytes the driver wrote.
        len: usize,
    },
    /// The timeout expired before a buffer was filled.
    TimedOut,
}

/// The single fixed entry point the driver invokes on feature events.
///
/// The driver calls it on a thread it owns, passing the feature name and
/// the opaque context registered alongside it. The integer result is
/// propagated back to the driver.
pub type Trampoline = unsafe extern "C" fn(feature: *const c_char, context: *mut c_void) -> i32;

/// Contract of the vendor SDK, one method per primitive consumed.
pub trait Driver: Send + Sync {
    /// Library-level initialisation. Must precede every other call.
    fn initialise(&self) -> CamResult<()>;
    /// Library-level teardown.
    fn finalise(&self) -> CamResult<()>;

    /// Open the device at `index`, yielding an owning handle.
    fn open(&self, index: i32) -> CamResult<DeviceHandle>;
    /// Close a previously opened handle.
    fn close(&self, handle: DeviceHandle) -> CamResult<()>;

    /// Read a 64-bit integer feature.
    fn get_int(&self, handle: DeviceHandle, feature: &str) -> CamResult<i64>;
    /// Write a 64-bit integer feature.
    fn set_int(&self, handle: DeviceHandle, feature: &str, value: i64) -> CamResult<()>;
    /// Lower bound of an integer feature.
    fn get_int_min(&self, handle: DeviceHandle, feature: &str) -> CamResult<i64>;
    /// Upper bound of an integer feature.
    fn get_int_max(&self, handle: DeviceHandle, feature: &str) -> CamResult<i64>;

    /// Read a floating-point feature.
    fn get_float(&self, handle: DeviceHandle, feature: &str) -> CamResult<f64>;
    /// Write a floating-point feature.
    fn set_float(&self, handle: DeviceHandle, feature: &str, value: f64) -> CamResult<()>;
    /// Lower bound of a floating-point feature.
    fn get_float_min(&self, handle: DeviceHandle, feature: &str) -> CamResult<f64>;
    /// Upper bound of a floating-point feature.
    fn get_float_max(&self, handle: DeviceHandle, feature: &str) -> CamResult<f64>;

    /// Read a boolean feature.
    fn get_bool(&self, handle: DeviceHandle, feature: &str) -> CamResult<bool>;
    /// Write a boolean feature.
    fn set_bool(&self, handle: DeviceHandle, feature: &str, value: bool) -> CamResult<()>;

    /// Maximum length the driver will ever report for a string feature,
    /// terminator included.
    fn get_string_max_length(&self, handle: DeviceHandle, feature: &str) -> CamResult<usize>;
    /// Fetch a string feature into a caller-sized buffer of `max_length`.
    fn get_string(
        &self,
        handle: DeviceHandle,
        feature: &str,
        max_length: usize,
    ) -> CamResult<String>;
    /// Write a string feature.
    fn set_string(&self, handle: DeviceHandle, feature: &str, value: &str) -> CamResult<()>;

    /// Currently selected index of an enumerated feature.
    fn get_enum_index(&self, handle: DeviceHandle, feature: &str) -> CamResult<i32>;
    /// Select an enumerated feature by index.
    fn set_enum_index(&self, handle: DeviceHandle, feature: &str, index: i32) -> CamResult<()>;
    /// Select an enumerated feature by value string. The name-to-index
    /// resolution happens inside the driver, not locally.
    fn set_enum_string(&self, handle: DeviceHandle, feature: &str, value: &str) -> CamResult<()>;
    /// Number of values the enumeration declares.
    fn get_enum_count(&self, handle: DeviceHandle, feature: &str) -> CamResult<i32>;
    /// Value string at `index`.
    fn get_enum_string_by_index(
        &self,
        handle: DeviceHandle,
        feature: &str,
        index: i32,
    ) -> CamResult<String>;
    /// Whether the enumeration value at `index` is implemented on this device.
    fn is_enum_index_implemented(
        &self,
        handle: DeviceHandle,
        feature: &str,
        index: i32,
    ) -> CamResult<bool>;
    /// Whether the enumeration value at `index` is currently selectable.
    fn is_enum_index_available(
        &self,
        handle: DeviceHandle,
        feature: &str,
        index: i32,
    ) -> CamResult<bool>;

    /// Whether the device implements `feature` at all.
    fn is_implemented(&self, handle: DeviceHandle, feature: &str) -> CamResult<bool>;
    /// Whether `feature` is currently readable.
    fn is_readable(&self, handle: DeviceHandle, feature: &str) -> CamResult<bool>;
    /// Whether `feature` is permanently read-only.
    fn is_read_only(&self, handle: DeviceHandle, feature: &str) -> CamResult<bool>;
    /// Whether `feature` is currently writable.
    fn is_writable(&self, handle: DeviceHandle, feature: &str) -> CamResult<bool>;

    /// Execute a command feature such as `AcquisitionStart`.
    fn issue_command(&self, handle: DeviceHandle, feature: &str) -> CamResult<()>;

    /// Lend an aligned buffer to the driver for it to fill.
    fn queue_buffer(&self, handle: DeviceHandle, ptr: *mut u8, size: usize) -> CamResult<()>;
    /// Block up to `timeout_ms` for the driver to return one filled buffer.
    fn wait_buffer(&self, handle: DeviceHandle, timeout_ms: u32) -> CamResult<WaitOutcome>;
    /// Ask the driver to return all outstanding buffers unfilled.
    fn flush(&self, handle: DeviceHandle) -> CamResult<()>;

    /// Register the fixed trampoline for events on `feature`, with `context`
    /// passed back verbatim on every invocation.
    fn register_feature_callback(
        &self,
        handle: DeviceHandle,
        feature: &str,
        trampoline: Trampoline,
        context: *mut c_void,
    ) -> CamResult<()>;
    /// Remove a registration made with the same arguments.
    fn unregister_feature_callback(
        &self,
        handle: DeviceHandle,
        feature: &str,
        trampoline: Trampoline,
        context: *mut c_void,
    ) -> CamResult<()>;
}

/// Numeric error codes of the driver, as found in `atcore.h`.
#[allow(missing_docs)]
pub mod codes {
    pub const AT_SUCCESS: i32 = 0;
    pub const AT_ERR_NOTINITIALISED: i32 = 1;
    pub const AT_ERR_NOTIMPLEMENTED: i32 = 2;
    pub const AT_ERR_READONLY: i32 = 3;
    pub const AT_ERR_NOTREADABLE: i32 = 4;
    pub const AT_ERR_NOTWRITABLE: i32 = 5;
    pub const AT_ERR_OUTOFRANGE: i32 = 6;
    pub const AT_ERR_INDEXNOTAVAILABLE: i32 = 7;
    pub const AT_ERR_INDEXNOTIMPLEMENTED: i32 = 8;
    pub const AT_ERR_EXCEEDEDMAXSTRINGLENGTH: i32 = 9;
    pub const AT_ERR_CONNECTION: i32 = 10;
    pub const AT_ERR_NODATA: i32 = 11;
    pub const AT_ERR_INVALIDHANDLE: i32 = 12;
    pub const AT_ERR_TIMEDOUT: i32 = 13;
    pub const AT_ERR_BUFFERFULL: i32 = 14;
    pub const AT_ERR_INVALIDSIZE: i32 = 15;
    pub const AT_ERR_INVALIDALIGNMENT: i32 = 16;
    pub const AT_ERR_COMM: i32 = 17;
    pub const AT_ERR_STRINGNOTAVAILABLE: i32 = 18;
    pub const AT_ERR_STRINGNOTIMPLEMENTED: i32 = 19;
    pub const AT_ERR_NULL_FEATURE: i32 = 20;
    pub const AT_ERR_NULL_HANDLE: i32 = 21;
    pub const AT_ERR_NULL_IMPLEMENTED_VAR: i32 = 22;
    pub const AT_ERR_NULL_READABLE_VAR: i32 = 23;
    pub const AT_ERR_NULL_READONLY_VAR: i32 = 24;
    pub const AT_ERR_NULL_WRITABLE_VAR: i32 = 25;
    pub const AT_ERR_NULL_MINVALUE: i32 = 26;
    pub const AT_ERR_NULL_MAXVALUE: i32 = 27;
    pub const AT_ERR_NULL_VALUE: i32 = 28;
    pub const AT_ERR_NULL_STRING: i32 = 29;
    pub const AT_ERR_NULL_COUNT_VAR: i32 = 30;
    pub const AT_ERR_NULL_ISAVAILABLE_VAR: i32 = 31;
    pub const AT_ERR_NULL_MAXSTRINGLENGTH: i32 = 32;
    pub const AT_ERR_NULL_EVCALLBACK: i32 = 33;
    pub const AT_ERR_NULL_QUEUE_PTR: i32 = 34;
    pub const AT_ERR_NULL_WAIT_PTR: i32 = 35;
    pub const AT_ERR_NULL_PTRSIZE: i32 = 36;
    pub const AT_ERR_NOMEMORY: i32 = 37;
    pub const AT_ERR_DEVICEINUSE: i32 = 38;
    pub const AT_ERR_DEVICENOTFOUND: i32 = 39;
    pub const AT_ERR_HARDWARE_OVERFLOW: i32 = 100;

    /// Infinite wait sentinel for `wait_buffer`.
    pub const AT_INFINITE: u32 = u32::MAX;
}
