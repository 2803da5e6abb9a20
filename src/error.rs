//! Error type shared by the jailer, its stores and the address set gateway.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, JailError>;

/// Error from the jail, an infraction store or the address set.
#[derive(Debug, Error)]
pub enum JailError {
    /// Malformed address, or malformed data read back from a store.
    #[error("invalid {what}: {value:?}")]
    Validation { what: &'static str, value: String },

    /// The external address set is full.
    #[error("address set {set} is at maximum capacity ({capacity} entries)")]
    CapacityExceeded { set: String, capacity: usize },

    /// Version conflicts exhausted every attempt.
    #[error("lock contention attempting to {op} {addr} after {attempts} attempts")]
    LockContention {
        op: &'static str,
        addr: String,
        attempts: u32,
    },

    /// Network failure or timeout against the store or the address set.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Startup could not resolve a required collaborator.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl JailError {
    pub(crate) fn validation(what: &'static str, value: impl Into<String>) -> Self {
        JailError::Validation {
            what,
            value: value.into(),
        }
    }

    pub(crate) fn timeout(what: &str) -> Self {
        JailError::Transient(format!("{} timed out", what))
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, JailError::Transient(_))
    }

    /// Whether the error means the ban could not be applied right now.
    ///
    /// The reporting layer maps these to a service-unavailable response.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            JailError::CapacityExceeded { .. }
                | JailError::LockContention { .. }
                | JailError::Transient(_)
        )
    }
}

impl From<redis::RedisError> for JailError {
    fn from(e: redis::RedisError) -> Self {
        JailError::Transient(format!("redis: {}", e))
    }
}

impl From<std::io::Error> for JailError {
    fn from(e: std::io::Error) -> Self {
        JailError::Transient(format!("io: {}", e))
    }
}
