//! Camera session façade.
//!
//! One [`CameraSession`] owns one device handle plus the accessor, buffer
//! pool and callback registrations bound to it, and walks the
//! `Uninitialized -> Connected -> Acquiring` state machine. Sessions share
//! an [`SdkRuntime`]; constructing a session takes a library reference,
//! dropping it gives the reference back.
//!
//! Connect reports failure as a boolean with the cause retrievable from
//! [`last_error`](CameraSession::last_error); acquisition start and stop
//! re-raise their errors so the caller can react directly.
//!
//! Presence loss is handled lazily: the callback registered on
//! `CameraPresent` only flips a shared flag from the driver's thread, and
//! the session disconnects at its next operation boundary.

use std::os::raw::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::buffer::{BufferPool, FilledBuffer};
use crate::callback::{CallbackDispatcher, FeatureCallback};
use crate::driver::{codes, DeviceHandle, Driver};
use crate::error::{AndorError, CamResult};
use crate::feature::FeatureAccessor;
use crate::info::{CameraIdentifier, CameraInfo, SdkRuntime};
use crate::log::{CameraLog, LogLevel};
use crate::registry::{FeatureRegistry, FeatureType};

/// Where a session stands in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No device handle.
    Uninitialized,
    /// Handle open, features and callbacks usable.
    Connected,
    /// Connected with an acquisition running.
    Acquiring,
}

/// Runs on the driver's thread; only flips the shared flag.
fn presence_flag_callback(_feature: &str, context: *mut c_void) -> i32 {
    if context.is_null() {
        return codes::AT_ERR_NULL_VALUE;
    }
    let flag = unsafe { &*(context as *const AtomicBool) };
    flag.store(true, Ordering::SeqCst);
    codes::AT_SUCCESS
}

/// Top-level handle to one camera.
pub struct CameraSession {
    runtime: Arc<SdkRuntime>,
    driver: Arc<dyn Driver>,
    log: CameraLog,
    registry: FeatureRegistry,
    accessor: FeatureAccessor,
    dispatcher: CallbackDispatcher,
    pool: BufferPool,
    state: SessionState,
    handle: Option<DeviceHandle>,
    device_index: i32,
    device_lost: Arc<AtomicBool>,
    last_error: Option<AndorError>,
}

impl CameraSession {
    /// New session sharing `runtime`. Takes a library reference; the
    /// first session to exist initialises the library and triggers the
    /// discovery scan. The session shares the runtime's log, so a sink
    /// attached here also receives discovery lines.
    pub fn new(runtime: Arc<SdkRuntime>) -> CamResult<Self> {
        runtime.acquire()?;
        let driver = runtime.driver();
        let log = runtime.log();
        Ok(Self {
            driver: Arc::clone(&driver),
            log: log.clone(),
            registry: FeatureRegistry::new(),
            accessor: FeatureAccessor::new(Arc::clone(&driver), log.clone()),
            dispatcher: CallbackDispatcher::new(Arc::clone(&driver), log.clone()),
            pool: BufferPool::new(driver, log),
            runtime,
            state: SessionState::Uninitialized,
            handle: None,
            device_index: -1,
            device_lost: Arc::new(AtomicBool::new(false)),
            last_error: None,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True once a handle is open.
    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    /// Index of the connected device, or -1.
    pub fn device_index(&self) -> i32 {
        self.device_index
    }

    /// Cause of the most recent failed connect, if any.
    pub fn last_error(&self) -> Option<&AndorError> {
        self.last_error.as_ref()
    }

    /// Snapshot of the shared discovery cache.
    pub fn cameras(&self) -> Vec<CameraInfo> {
        self.runtime.cameras()
    }

    /// Registry the session resolves feature names against; extend it for
    /// device-specific features.
    pub fn registry_mut(&mut self) -> &mut FeatureRegistry {
        &mut self.registry
    }

    fn check_presence(&mut self) {
        if self.handle.is_some() && self.device_lost.load(Ordering::SeqCst) {
            self.log.error("device presence lost, disconnecting");
            self.disconnect();
        }
    }

    fn connected_handle(&self) -> CamResult<DeviceHandle> {
        self.handle
            .ok_or_else(|| AndorError::Connection("no device connected".into()))
    }

    /// Connect to the device at `index`. An existing connection is torn
    /// down first. Returns false on failure with the cause recorded.
    pub fn connect_by_index(&mut self, index: i32) -> bool {
        match self.try_connect(index) {
            Ok(()) => {
                self.last_error = None;
                true
            }
            Err(err) => {
                self.log
                    .error(&format!("connect to device {index} failed: {err}"));
                self.last_error = Some(err);
                false
            }
        }
    }

    fn try_connect(&mut self, index: i32) -> CamResult<()> {
        self.check_presence();
        if self.handle.is_some() {
            self.disconnect();
        }
        let count = self.runtime.device_count()?;
        if count == 0 {
            return Err(AndorError::Connection("no devices present".into()));
        }
        let handle = self.driver.open(index)?;
        self.handle = Some(handle);
        self.device_index = index;
        self.state = SessionState::Connected;
        self.device_lost.store(false, Ordering::SeqCst);

        // Presence loss is advisory; a device without the feature still
        // connects.
        let flag_ptr = Arc::as_ptr(&self.device_lost) as *mut c_void;
        if let Err(err) =
            self.dispatcher
                .register(Some(handle), "CameraPresent", presence_flag_callback, flag_ptr)
        {
            self.log
                .error(&format!("presence callback registration failed: {err}"));
        }
        self.log.info(&format!("connected to device {index}"));
        Ok(())
    }

    /// Connect to the first cached camera whose `identifier` field equals
    /// `value`. No match returns false without side effects.
    pub fn connect_by_identifier(&mut self, identifier: CameraIdentifier, value: &str) -> bool {
        let Some(info) = self.runtime.find(identifier, value) else {
            let err = AndorError::Connection(format!(
                "no camera with {identifier:?} = '{value}' in the discovery cache"
            ));
            self.log.error(&err.to_string());
            self.last_error = Some(err);
            return false;
        };
        self.connect_by_index(info.device_index)
    }

    /// Tear the connection down: stop any acquisition, release buffers,
    /// unregister callbacks, close the handle. Safe when already
    /// disconnected; every step is best-effort.
    pub fn disconnect(&mut self) {
        let Some(handle) = self.handle else {
            self.log.info("disconnect: no device connected");
            return;
        };
        if self.state == SessionState::Acquiring {
            if let Err(err) = self.driver.issue_command(handle, "AcquisitionStop") {
                self.log
                    .error(&format!("AT_Command({handle}, 'AcquisitionStop'): {err}"));
            }
        }
        self.pool.flush_and_release(Some(handle));
        self.dispatcher.unregister_all(Some(handle));
        if let Err(err) = self.driver.close(handle) {
            self.log.error(&format!("AT_Close({handle}): {err}"));
        }
        self.handle = None;
        self.device_index = -1;
        self.state = SessionState::Uninitialized;
        self.log.info("disconnected");
    }

    /// Typed accessor for `name`, resolved against the registry and bound
    /// to the connected device.
    pub fn feature(&mut self, name: &str) -> CamResult<&mut FeatureAccessor> {
        self.check_presence();
        let handle = self.connected_handle()?;
        let ty = self.registry.lookup(name)?;
        self.accessor.bind_to(handle, name, ty)?;
        Ok(&mut self.accessor)
    }

    /// Start an acquisition: size the pool from the configured frame and
    /// accumulate counts, queue every buffer, issue the start command.
    ///
    /// Calling while already acquiring is a no-op. An allocation failure
    /// leaves the state at Connected; a start-command failure is logged
    /// and re-raised.
    pub fn acquisition_start(&mut self) -> CamResult<()> {
        self.check_presence();
        let handle = self.connected_handle()?;
        if self.state == SessionState::Acquiring {
            self.log.info("acquisition already running");
            return Ok(());
        }

        self.accessor.bind_to(handle, "FrameCount", FeatureType::Int)?;
        let frames: i64 = self.accessor.read_as()?;
        self.accessor
            .bind_to(handle, "AccumulateCount", FeatureType::Int)?;
        let accumulate: i64 = self.accessor.read_as()?;
        self.accessor
            .bind_to(handle, "ImageSizeBytes", FeatureType::Int)?;
        let image_size: i64 = self.accessor.read_as()?;

        if image_size <= 0 {
            return Err(AndorError::Allocation(format!(
                "ImageSizeBytes reported {image_size}"
            )));
        }
        let frames_to_buffer = if accumulate > 0 {
            (frames / accumulate).max(1)
        } else {
            frames.max(1)
        } as usize;

        self.pool.allocate(frames_to_buffer, image_size as usize)?;
        self.pool.queue_all(handle)?;

        self.accessor
            .bind_to(handle, "AcquisitionStart", FeatureType::Command)?;
        self.accessor.issue_command()?;
        self.state = SessionState::Acquiring;
        self.log.info(&format!(
            "acquisition started, {frames_to_buffer} buffer(s) of {image_size} byte(s)"
        ));
        Ok(())
    }

    /// Issue the stop command. The state returns to Connected even when
    /// the command fails; staying in Acquiring would be unrecoverable for
    /// the caller. The failure is still logged and re-raised.
    pub fn acquisition_stop(&mut self) -> CamResult<()> {
        self.check_presence();
        let handle = self.connected_handle()?;
        if self.state != SessionState::Acquiring {
            self.log.info("acquisition not running");
            return Ok(());
        }
        self.accessor
            .bind_to(handle, "AcquisitionStop", FeatureType::Command)?;
        let outcome = self.accessor.issue_command();
        self.state = SessionState::Connected;
        if let Err(err) = self.pool.flush(handle) {
            self.log.error(&format!("AT_Flush({handle}) after stop: {err}"));
        }
        outcome
    }

    /// Block up to `timeout_ms` for one filled buffer. `None` means the
    /// timeout expired.
    pub fn wait_buffer(&self, timeout_ms: u32) -> CamResult<Option<FilledBuffer<'_>>> {
        if self.device_lost.load(Ordering::SeqCst) {
            return Err(AndorError::Connection("device presence lost".into()));
        }
        let handle = self.connected_handle()?;
        self.pool.wait_filled(handle, timeout_ms)
    }

    /// Hand a filled buffer back to the driver's queue.
    pub fn requeue(&self, filled: FilledBuffer<'_>) -> CamResult<()> {
        let handle = self.connected_handle()?;
        self.pool.requeue(handle, filled)
    }

    /// Queue every unqueued pool slot to the driver.
    pub fn queue_buffers(&self) -> CamResult<()> {
        let handle = self.connected_handle()?;
        self.pool.queue_all(handle)
    }

    /// Ask the driver to return all outstanding buffers unfilled.
    pub fn flush(&self) -> CamResult<()> {
        let handle = self.connected_handle()?;
        self.pool.flush(handle)
    }

    /// Ceiling on the number of acquisition buffers.
    pub fn set_max_buffers_number(&mut self, max: usize) {
        self.pool.set_max_buffers(max);
    }

    /// Number of buffers the pool currently holds.
    pub fn buffer_count(&self) -> usize {
        self.pool.len()
    }

    /// Per-buffer size of the current allocation, zero when empty.
    pub fn buffer_bytes(&self) -> usize {
        self.pool.per_buffer_bytes()
    }

    /// Register `callback` for events on `feature`.
    pub fn register_feature_callback(
        &mut self,
        feature: &str,
        callback: FeatureCallback,
        context: *mut c_void,
    ) -> CamResult<()> {
        self.check_presence();
        self.dispatcher
            .register(self.handle, feature, callback, context)
    }

    /// Remove a registration made with the same tuple. Silent no-op when
    /// disconnected.
    pub fn unregister_feature_callback(
        &mut self,
        feature: &str,
        callback: FeatureCallback,
        context: *mut c_void,
    ) -> CamResult<()> {
        self.check_presence();
        self.dispatcher
            .unregister(self.handle, feature, callback, context)
    }

    /// Attach a byte-stream destination for the diagnostic trail.
    pub fn set_log_sink(&self, sink: Box<dyn std::io::Write + Send>) {
        self.log.set_sink(sink);
    }

    /// Set the diagnostic verbosity.
    pub fn set_log_level(&self, level: LogLevel) {
        self.log.set_level(level);
    }

    /// Current diagnostic verbosity.
    pub fn log_level(&self) -> LogLevel {
        self.log.level()
    }

    /// Version string of the SDK library itself.
    pub fn software_version(&self) -> CamResult<String> {
        self.runtime.software_version()
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        self.disconnect();
        if let Err(err) = self.runtime.release() {
            self.log.error(&format!("library release failed: {err}"));
        }
    }
}
