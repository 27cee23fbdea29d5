//! Error types for the accessor layer.
//!
//! Every failure that crosses a public boundary is an [`AndorError`]. Driver
//! calls that come back with a non-success status are wrapped in
//! [`AndorError::Sdk`], which carries both the numeric SDK code and the
//! formatted signature of the call that was attempted, so a log line or an
//! operator-facing message needs no further context.

use thiserror::Error;

use crate::registry::FeatureType;

/// Convenience alias for results using the crate error type.
pub type CamResult<T> = std::result::Result<T, AndorError>;

/// Failure taxonomy of the accessor layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AndorError {
    /// An accessor was used against a feature whose declared type differs
    /// from the requested operation's type. Never coerced silently.
    #[error("type mismatch for feature '{feature}': declared {declared}, requested {requested}")]
    TypeMismatch {
        /// Feature name the accessor was bound to.
        feature: String,
        /// Type the registry declares for the feature.
        declared: FeatureType,
        /// Type family the caller asked for.
        requested: &'static str,
    },

    /// Feature name absent from the registry, or the driver reported a
    /// feature unimplemented where implementation was required.
    #[error("feature '{feature}' is not implemented")]
    NotImplemented {
        /// The offending feature name.
        feature: String,
    },

    /// A string feature reported a maximum length of zero.
    #[error("string feature '{feature}' reports zero length")]
    EmptyLength {
        /// The offending feature name.
        feature: String,
    },

    /// An operation required a connected device and none exists, or the
    /// device count is zero.
    #[error("connection error: {0}")]
    Connection(String),

    /// Buffer request of zero, or a memory allocation failure.
    #[error("allocation error: {0}")]
    Allocation(String),

    /// A driver call returned a non-success code.
    #[error("SDK error {code} in {call}")]
    Sdk {
        /// The driver's numeric error code.
        code: i32,
        /// Formatted signature of the attempted call.
        call: String,
    },
}

impl AndorError {
    /// Numeric code of this error in the driver's code space.
    ///
    /// Locally-detected failures map onto the closest SDK code so callers
    /// that only retain a code (for example through
    /// [`CameraSession::last_error`](crate::session::CameraSession::last_error))
    /// still get something meaningful.
    pub fn sdk_code(&self) -> i32 {
        use crate::driver::codes;
        match self {
            AndorError::TypeMismatch { .. } => codes::AT_ERR_NOTIMPLEMENTED,
            AndorError::NotImplemented { .. } => codes::AT_ERR_NOTIMPLEMENTED,
            AndorError::EmptyLength { .. } => codes::AT_ERR_NULL_MAXSTRINGLENGTH,
            AndorError::Connection(_) => codes::AT_ERR_CONNECTION,
            AndorError::Allocation(_) => codes::AT_ERR_INVALIDSIZE,
            AndorError::Sdk { code, .. } => *code,
        }
    }

    /// Shorthand for building an [`AndorError::Sdk`].
    pub(crate) fn sdk(code: i32, call: impl Into<String>) -> Self {
        AndorError::Sdk {
            code,
            call: call.into(),
        }
    }
}
