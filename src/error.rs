//! Unified error handling for devmux
//!
//! Every fallible operation in the crate returns [`DevmuxResult`]. Errors are
//! categorized so that the dispatcher can decide between retrying on another
//! device, retrying later, and failing the operation for good:
//! - Recoverable errors (resource exhaustion, retry budget)
//! - Device errors (lookup failures, placement conflicts)
//! - User errors (configuration)
//! - Internal errors (invariant violations, poisoned locks)

use std::fmt;

pub use thiserror;

/// Unified error type for devmux
#[derive(Debug, thiserror::Error)]
pub enum DevmuxError {
    // ========== Admission Errors ==========
    /// Not enough free capacity to admit the operation on this device
    #[error("Resource exhausted on {device}: {detail}")]
    ResourceExhausted { device: String, detail: String },

    /// The operation hit its memory-failure bound
    #[error("Operation {node} exceeded max failures: {failures} > {max}")]
    MaxFailuresExceeded { node: String, failures: u32, max: u32 },

    // ========== Device Errors ==========
    /// Device lookup failed in the registry
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The operation cannot run on the requested device type
    #[error("Operation {node} does not support device type {device_type}")]
    UnsupportedDevice { node: String, device_type: String },

    /// A stateful kernel was already created on another device
    #[error("Stateful kernel for {node} can not be moved from {bound} to {requested}")]
    KernelDeviceMismatch {
        node: String,
        bound: String,
        requested: String,
    },

    // ========== Execution Errors ==========
    /// Kernel execution reported a non-memory failure
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// Memory failure on an operation holding reference-typed inputs
    #[error("Memory failure on {0}, which has reference-typed inputs and can not be retried")]
    RefInputRetry(String),

    /// Task operation called from the wrong lifecycle state
    #[error("Invalid task state: expected {expected}, found {actual}")]
    InvalidState { expected: String, actual: String },

    // ========== Configuration Errors ==========
    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// File I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    // ========== Internal Errors ==========
    /// Internal error (indicates a bug)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Lock poisoned (a thread panicked while holding it)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl DevmuxError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            DevmuxError::ResourceExhausted { .. } | DevmuxError::MaxFailuresExceeded { .. } => {
                ErrorCategory::Recoverable
            }

            DevmuxError::DeviceUnavailable(_)
            | DevmuxError::UnsupportedDevice { .. }
            | DevmuxError::KernelDeviceMismatch { .. }
            | DevmuxError::ExecutionFailed(_) => ErrorCategory::Device,

            DevmuxError::InvalidConfiguration(_)
            | DevmuxError::ConfigParse(_)
            | DevmuxError::IoError(_) => ErrorCategory::User,

            DevmuxError::RefInputRetry(_)
            | DevmuxError::InvalidState { .. }
            | DevmuxError::InternalError(_)
            | DevmuxError::LockPoisoned(_) => ErrorCategory::Internal,
        }
    }

    /// Whether another admission attempt may succeed.
    ///
    /// Only plain exhaustion qualifies. Running out of the failure budget is
    /// terminal even though it shares the recoverable category.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DevmuxError::ResourceExhausted { .. })
    }

    /// Check if this is a user-facing error
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Check if this is an internal error (indicates a bug)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }

    pub(crate) fn exhausted(device: impl fmt::Display, detail: impl Into<String>) -> Self {
        DevmuxError::ResourceExhausted {
            device: device.to_string(),
            detail: detail.into(),
        }
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary condition, may succeed later or with a smaller estimate
    Recoverable,
    /// Device lookup or placement problem
    Device,
    /// Invalid input or configuration
    User,
    /// Indicates a bug
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Recoverable => write!(f, "Recoverable"),
            ErrorCategory::Device => write!(f, "Device"),
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for DevmuxError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DevmuxError::LockPoisoned(err.to_string())
    }
}

/// Result alias used across the crate
pub type DevmuxResult<T> = std::result::Result<T, DevmuxError>;

/// Create an internal error with context
///
/// # Examples
/// ```ignore
/// return Err(internal_error!("ticket {} missing from staging", ticket));
/// ```
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::DevmuxError::InternalError($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::DevmuxError::InternalError(format!($fmt, $($arg)*))
    };
}

/// Create a configuration error with context
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::DevmuxError::InvalidConfiguration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::DevmuxError::InvalidConfiguration(format!($fmt, $($arg)*))
    };
}
