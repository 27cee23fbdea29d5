//! Feature-change callback plumbing.
//!
//! The driver invokes callbacks on a thread it owns, through exactly one
//! fixed `extern "C"` entry point. That entry point does nothing but
//! validate its context pointer and forward; whatever work the registered
//! callback performs happens inside the callback itself, and registered
//! callbacks are expected to do little more than flip a flag or post a
//! message.
//!
//! Each registration owns one heap-allocated [`CallbackContext`] whose
//! address is handed to the driver as opaque state. Re-registering an
//! identical (feature, callback, context) tuple creates an independent
//! second registration rather than deduplicating.

use std::ffi::CStr;
use std::os::raw::{c_char, c_void};
use std::sync::Arc;

use crate::driver::{codes, DeviceHandle, Driver};
use crate::error::{AndorError, CamResult};
use crate::log::CameraLog;

/// User callback invoked on feature events.
///
/// A plain function pointer, so two registrations can be compared for
/// unregistration. The return value is propagated back to the driver.
pub type FeatureCallback = fn(feature: &str, context: *mut c_void) -> i32;

/// Per-registration state the driver carries as an opaque pointer.
pub struct CallbackContext {
    callback: FeatureCallback,
    user_context: *mut c_void,
}

// The context crosses into the driver's thread by address only; the
// callback is a fn pointer and the user context's thread-safety is the
// registrant's contract.
unsafe impl Send for CallbackContext {}

/// The single fixed entry point handed to the driver for every
/// registration.
///
/// # Safety
/// `context` must be null or a pointer previously produced by
/// [`CallbackDispatcher::register`] and not yet unregistered; `feature`
/// must be null or a valid NUL-terminated string.
pub unsafe extern "C" fn feature_trampoline(feature: *const c_char, context: *mut c_void) -> i32 {
    if context.is_null() {
        return codes::AT_ERR_NULL_EVCALLBACK;
    }
    if feature.is_null() {
        return codes::AT_ERR_NULL_FEATURE;
    }
    let ctx = &*(context as *const CallbackContext);
    let name = match CStr::from_ptr(feature).to_str() {
        Ok(s) => s,
        Err(_) => return codes::AT_ERR_NULL_FEATURE,
    };
    (ctx.callback)(name, ctx.user_context)
}

struct Registration {
    feature: String,
    callback: FeatureCallback,
    user_context: *mut c_void,
    context: *mut CallbackContext,
}

/// Owner of all callback registrations of one session.
pub struct CallbackDispatcher {
    driver: Arc<dyn Driver>,
    log: CameraLog,
    registrations: Vec<Registration>,
}

unsafe impl Send for CallbackDispatcher {}

impl CallbackDispatcher {
    /// Dispatcher with no registrations.
    pub fn new(driver: Arc<dyn Driver>, log: CameraLog) -> Self {
        Self {
            driver,
            log,
            registrations: Vec::new(),
        }
    }

    /// Register `callback` for events on `feature`, with `user_context`
    /// passed through verbatim. Fails when no device is connected.
    pub fn register(
        &mut self,
        handle: Option<DeviceHandle>,
        feature: &str,
        callback: FeatureCallback,
        user_context: *mut c_void,
    ) -> CamResult<()> {
        let Some(handle) = handle else {
            return Err(AndorError::Connection(format!(
                "cannot register callback for '{feature}': no device connected"
            )));
        };
        let context = Box::into_raw(Box::new(CallbackContext {
            callback,
            user_context,
        }));
        let outcome = self.driver.register_feature_callback(
            handle,
            feature,
            feature_trampoline,
            context as *mut c_void,
        );
        if let Err(err) = outcome {
            // Reclaim the context we just leaked to the driver call.
            drop(unsafe { Box::from_raw(context) });
            self.log.error(&format!(
                "AT_RegisterFeatureCallback({handle}, '{feature}') failed: {err}"
            ));
            return Err(err);
        }
        self.log
            .call(&format!("AT_RegisterFeatureCallback({handle}, '{feature}', cb, ctx)"));
        self.registrations.push(Registration {
            feature: feature.to_owned(),
            callback,
            user_context,
            context,
        });
        Ok(())
    }

    /// Remove the first registration matching the tuple. A silent no-op
    /// when no device is connected or nothing matches.
    pub fn unregister(
        &mut self,
        handle: Option<DeviceHandle>,
        feature: &str,
        callback: FeatureCallback,
        user_context: *mut c_void,
    ) -> CamResult<()> {
        let Some(handle) = handle else {
            return Ok(());
        };
        let Some(pos) = self.registrations.iter().position(|r| {
            r.feature == feature && r.callback == callback && r.user_context == user_context
        }) else {
            return Ok(());
        };
        let reg = self.registrations.remove(pos);
        let outcome = self.driver.unregister_feature_callback(
            handle,
            feature,
            feature_trampoline,
            reg.context as *mut c_void,
        );
        drop(unsafe { Box::from_raw(reg.context) });
        if let Err(err) = &outcome {
            self.log.error(&format!(
                "AT_UnregisterFeatureCallback({handle}, '{feature}') failed: {err}"
            ));
        }
        outcome
    }

    /// Best-effort removal of every registration, used on disconnect.
    /// Driver-side failures are logged, not surfaced.
    pub fn unregister_all(&mut self, handle: Option<DeviceHandle>) {
        for reg in self.registrations.drain(..) {
            if let Some(handle) = handle {
                if let Err(err) = self.driver.unregister_feature_callback(
                    handle,
                    &reg.feature,
                    feature_trampoline,
                    reg.context as *mut c_void,
                ) {
                    self.log.error(&format!(
                        "AT_UnregisterFeatureCallback({handle}, '{}') failed: {err}",
                        reg.feature
                    ));
                }
            }
            drop(unsafe { Box::from_raw(reg.context) });
        }
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

impl Drop for CallbackDispatcher {
    fn drop(&mut self) {
        // Contexts outlive any driver that could still invoke them only if
        // unregister_all was skipped; free them without driver calls.
        for reg in self.registrations.drain(..) {
            drop(unsafe { Box::from_raw(reg.context) });
        }
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::mock::MockDriver;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn count_up(_feature: &str, context: *mut c_void) -> i32 {
        let hits = unsafe { &*(context as *const AtomicUsize) };
        hits.fetch_add(1, Ordering::SeqCst);
        codes::AT_SUCCESS
    }

    #[test]
    fn trampoline_rejects_null_context() {
        let name = std::ffi::CString::new("ExposureTime").unwrap();
        let rc = unsafe { feature_trampoline(name.as_ptr(), std::ptr::null_mut()) };
        assert_eq!(rc, codes::AT_ERR_NULL_EVCALLBACK);
    }

    #[test]
    fn register_without_device_is_a_connection_error() {
        let driver = Arc::new(MockDriver::new());
        let mut dispatcher = CallbackDispatcher::new(driver, CameraLog::new());
        let hits = AtomicUsize::new(0);
        let err = dispatcher
            .register(
                None,
                "ExposureTime",
                count_up,
                &hits as *const _ as *mut c_void,
            )
            .unwrap_err();
        assert!(matches!(err, AndorError::Connection(_)));
    }

    #[test]
    fn callback_fires_on_feature_write() {
        let driver = Arc::new(MockDriver::new());
        let handle = driver.open(0).unwrap();
        let mut dispatcher = CallbackDispatcher::new(driver.clone(), CameraLog::new());
        let hits = AtomicUsize::new(0);
        let ctx = &hits as *const _ as *mut c_void;

        dispatcher
            .register(Some(handle), "ExposureTime", count_up, ctx)
            .unwrap();
        driver.set_float(handle, "ExposureTime", 0.02).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        dispatcher
            .unregister(Some(handle), "ExposureTime", count_up, ctx)
            .unwrap();
        driver.set_float(handle, "ExposureTime", 0.03).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_tuple_creates_independent_registrations() {
        let driver = Arc::new(MockDriver::new());
        let handle = driver.open(0).unwrap();
        let mut dispatcher = CallbackDispatcher::new(driver.clone(), CameraLog::new());
        let hits = AtomicUsize::new(0);
        let ctx = &hits as *const _ as *mut c_void;

        dispatcher
            .register(Some(handle), "ExposureTime", count_up, ctx)
            .unwrap();
        dispatcher
            .register(Some(handle), "ExposureTime", count_up, ctx)
            .unwrap();
        assert_eq!(dispatcher.len(), 2);

        driver.set_float(handle, "ExposureTime", 0.04).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        dispatcher
            .unregister(Some(handle), "ExposureTime", count_up, ctx)
            .unwrap();
        driver.set_float(handle, "ExposureTime", 0.05).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn unregister_without_device_is_silent() {
        let driver = Arc::new(MockDriver::new());
        let mut dispatcher = CallbackDispatcher::new(driver, CameraLog::new());
        let hits = AtomicUsize::new(0);
        dispatcher
            .unregister(
                None,
                "ExposureTime",
                count_up,
                &hits as *const _ as *mut c_void,
            )
            .unwrap();
    }
}
