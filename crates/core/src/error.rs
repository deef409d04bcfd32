//! Error types for open-g13-core.

use crate::buttons::ButtonId;
use thiserror::Error;

/// Core library error type.
#[derive(Debug, Error)]
pub enum Error {
    /// HID device communication failure that is not a disconnect.
    #[error("HID error: {0}")]
    Hid(String),

    /// Device not found during enumeration or reopen.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The open device handle is gone (unplugged, reset, or revoked).
    #[error("device lost: {0}")]
    DeviceLost(String),

    /// Input report does not match the device's report schema.
    #[error("malformed report: id 0x{report_id:02X}, {actual} bytes (expected {expected})")]
    MalformedReport {
        report_id: u8,
        expected: usize,
        actual: usize,
    },

    /// Output report refused before or during the write.
    #[error("write rejected: {0}")]
    WriteRejected(String),

    /// No profile with this name.
    #[error("profile not found: {0}")]
    ProfileNotFound(String),

    /// No macro with this id.
    #[error("macro not found: {0}")]
    MacroNotFound(String),

    /// A macro recording is already running.
    #[error("recording already in progress on {0}")]
    RecordingInProgress(ButtonId),

    /// `stop_recording` without a matching `start_recording`.
    #[error("no recording in progress")]
    NotRecording,

    /// Key name not present in the key table.
    #[error("unknown key: {0}")]
    UnknownKey(String),

    /// Value out of safe range.
    #[error("value out of range: {field} = {value} (allowed {min}..={max})")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    /// Profile/macro serialization or validation error.
    #[error("profile error: {0}")]
    Profile(String),

    /// Permission denied opening the hidraw node or uinput.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Operation timed out.
    #[error("timeout: {0}")]
    Timeout(String),

    /// An engine worker thread has exited.
    #[error("engine stopped")]
    EngineStopped,

    /// Filesystem or thread-spawn failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<hidapi::HidError> for Error {
    fn from(e: hidapi::HidError) -> Self {
        let msg = e.to_string();
        if msg.contains("Permission denied") || msg.contains("EPERM") {
            Error::PermissionDenied(msg)
        } else {
            Error::Hid(msg)
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Profile(e.to_string())
    }
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, Error>;
