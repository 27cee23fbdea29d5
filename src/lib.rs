//! Safe accessor layer over the Andor SDK3 camera driver.
//!
//! The SDK exposes every camera setting as a named "feature" of one of
//! six types behind an untyped C API. This crate wraps that surface in a
//! typed accessor with runtime dispatch, plus the lifecycle built on top
//! of it: discovery, connect/disconnect, acquisition buffering, and
//! feature-change callbacks.
//!
//! Module map:
//! - [`driver`]: the vendor boundary as a trait, one method per SDK call
//! - [`mock`]: simulated driver (default `mock` feature)
//! - [`registry`]: feature name to declared type
//! - [`feature`]: the typed accessor and its snapshots
//! - [`buffer`]: aligned acquisition buffer pool
//! - [`callback`]: C trampoline and registration bookkeeping
//! - [`info`]: discovery, camera metadata, library refcounting
//! - [`session`]: the [`CameraSession`] façade
//!
//! ```no_run
//! use std::sync::Arc;
//! use andor3::{CameraSession, CameraIdentifier, SdkRuntime, CameraLog};
//! # use andor3::mock::MockDriver;
//!
//! # fn main() -> andor3::CamResult<()> {
//! let driver = Arc::new(MockDriver::new());
//! let runtime = SdkRuntime::new(driver, CameraLog::new());
//! let mut session = CameraSession::new(runtime)?;
//!
//! if session.connect_by_identifier(CameraIdentifier::Serial, "SN123") {
//!     session.feature("ExposureTime")?.write_as(0.01_f64)?;
//!     session.acquisition_start()?;
//!     while let Some(frame) = session.wait_buffer(1000)? {
//!         let _bytes = frame.as_slice();
//!         session.requeue(frame)?;
//!         break;
//!     }
//!     session.acquisition_stop()?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod callback;
pub mod driver;
pub mod error;
pub mod feature;
pub mod info;
pub mod log;
#[cfg(feature = "mock")]
pub mod mock;
pub mod registry;
pub mod session;

pub use buffer::{BufferPool, FilledBuffer, DEFAULT_MAX_BUFFERS};
pub use callback::{CallbackDispatcher, FeatureCallback};
pub use driver::{DeviceHandle, Driver, WaitOutcome, SYSTEM_HANDLE};
pub use error::{AndorError, CamResult};
pub use feature::{
    Arithmetic, EnumFeature, EnumInfo, FeatureAccessor, FeatureInfo, FeatureValue, StringFeature,
};
pub use info::{CameraIdentifier, CameraInfo, SdkRuntime};
pub use log::{CameraLog, LogLevel};
pub use registry::{FeatureRegistry, FeatureType};
pub use session::{CameraSession, SessionState};
