//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

/// Customized error type for taskmill.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TaskmillError(pub String);

impl TaskmillError {
    /// Creates an error from any displayable payload.
    pub fn msg(m: impl fmt::Display) -> Self {
        TaskmillError(m.to_string())
    }
}

impl fmt::Display for TaskmillError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl std::error::Error for TaskmillError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `TaskmillError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for TaskmillError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                TaskmillError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(std::string::FromUtf8Error);
impl_from_error!(std::num::TryFromIntError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for TaskmillError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        TaskmillError(e.to_string())
    }
}
