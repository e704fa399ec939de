//! Engine status values.
//!
//! Engines report failures as a status code plus a native message. The
//! rendered form (`"Not found: ..."`) is what reaches the host diagnostics,
//! unmodified.

use num_derive::{FromPrimitive, ToPrimitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
pub enum StatusCode {
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
}

impl StatusCode {
    pub fn label(self) -> &'static str {
        match self {
            StatusCode::Cancelled => "Cancelled",
            StatusCode::Unknown => "Unknown",
            StatusCode::InvalidArgument => "Invalid argument",
            StatusCode::DeadlineExceeded => "Deadline exceeded",
            StatusCode::NotFound => "Not found",
            StatusCode::AlreadyExists => "Already exists",
            StatusCode::PermissionDenied => "Permission denied",
            StatusCode::ResourceExhausted => "Resource exhausted",
            StatusCode::FailedPrecondition => "Failed precondition",
            StatusCode::Aborted => "Aborted",
            StatusCode::OutOfRange => "Out of range",
            StatusCode::Unimplemented => "Unimplemented",
            StatusCode::Internal => "Internal",
            StatusCode::Unavailable => "Unavailable",
            StatusCode::DataLoss => "Data loss",
        }
    }
}

/// A non-OK engine status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}: {message}", .code.label())]
pub struct EngineStatus {
    pub code: StatusCode,
    pub message: String,
}

macro_rules! status_ctor {
    ($($fn_name:ident => $code:ident),* $(,)?) => {
        impl EngineStatus {
            pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
                Self { code, message: message.into() }
            }

            $(
                pub fn $fn_name(message: impl Into<String>) -> Self {
                    Self::new(StatusCode::$code, message)
                }
            )*
        }
    };
}

status_ctor! {
    invalid_argument => InvalidArgument,
    not_found => NotFound,
    already_exists => AlreadyExists,
    failed_precondition => FailedPrecondition,
    internal => Internal,
    data_loss => DataLoss,
}

impl From<gpu_interop::InteropError> for EngineStatus {
    fn from(err: gpu_interop::InteropError) -> Self {
        EngineStatus::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::{FromPrimitive, ToPrimitive};

    #[test]
    fn renders_like_native_status_strings() {
        let status = EngineStatus::not_found("FetchOutputs node ao: not found");
        assert_eq!(status.to_string(), "Not found: FetchOutputs node ao: not found");
        assert_eq!(
            EngineStatus::invalid_argument("x").to_string(),
            "Invalid argument: x"
        );
    }

    #[test]
    fn codes_map_to_and_from_wire_values() {
        assert_eq!(StatusCode::from_i32(5), Some(StatusCode::NotFound));
        assert_eq!(StatusCode::DataLoss.to_i32(), Some(15));
        assert_eq!(StatusCode::from_i32(0), None);
    }
}
