//! Device communication policy: error classification, write retry, and
//! reconnect backoff.
//!
//! Every failure coming back from the transport is classified once, and the
//! class alone decides what happens next: retry the write, drop it, or tear
//! the link down and start reconnecting.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::report::OutputReport;
use crate::transport::ReportWriter;

/// Extra attempts for a rejected or transient output write.
pub const WRITE_RETRIES: u32 = 1;

/// Consecutive non-disconnect read failures tolerated before the link is
/// treated as lost.
pub const MAX_CONSECUTIVE_READ_ERRORS: u32 = 5;

/// Classification of communication errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// May succeed on retry (timeout, busy endpoint).
    Transient,
    /// Handle is gone; only reopening helps.
    Disconnected,
    /// hidraw or uinput node not accessible.
    PermissionDenied,
    /// Device or whitelist refused the output report.
    Rejected,
    /// Input did not match the report schema.
    Malformed,
    /// Caller error: bad profile, unknown macro, out-of-range value.
    Config,
}

impl ErrorClass {
    /// Classify an error for retry and reconnect decisions.
    pub fn classify(err: &Error) -> Self {
        match err {
            Error::Timeout(_) => Self::Transient,
            Error::PermissionDenied(_) => Self::PermissionDenied,
            Error::DeviceNotFound(_) | Error::DeviceLost(_) => Self::Disconnected,
            Error::WriteRejected(_) => Self::Rejected,
            Error::MalformedReport { .. } => Self::Malformed,
            Error::Hid(msg) => {
                let lower = msg.to_lowercase();
                if lower.contains("disconnect")
                    || lower.contains("no such device")
                    || lower.contains("input/output error")
                    || lower.contains("broken pipe")
                {
                    Self::Disconnected
                } else if lower.contains("permission") || lower.contains("access denied") {
                    Self::PermissionDenied
                } else {
                    Self::Transient
                }
            }
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
                std::io::ErrorKind::NotFound | std::io::ErrorKind::BrokenPipe => {
                    Self::Disconnected
                }
                _ => Self::Transient,
            },
            Error::EngineStopped => Self::Disconnected,
            Error::ProfileNotFound(_)
            | Error::MacroNotFound(_)
            | Error::RecordingInProgress(_)
            | Error::NotRecording
            | Error::UnknownKey(_)
            | Error::OutOfRange { .. }
            | Error::Profile(_) => Self::Config,
        }
    }

    /// Whether a write failing with this class is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::Rejected)
    }
}

/// Normalize a raw transport failure: anything classified as a disconnect
/// becomes [`Error::DeviceLost`].
pub fn into_device_lost(err: Error) -> Error {
    match err {
        Error::DeviceLost(_) => err,
        other if ErrorClass::classify(&other) == ErrorClass::Disconnected => {
            Error::DeviceLost(other.to_string())
        }
        other => other,
    }
}

/// Write one output report, retrying rejected or transient failures
/// [`WRITE_RETRIES`] times.
pub fn write_with_retry(writer: &mut dyn ReportWriter, report: &OutputReport) -> Result<()> {
    let mut attempt = 0;
    loop {
        match writer.write_report(report) {
            Ok(()) => {
                if attempt > 0 {
                    debug!(attempt = attempt + 1, "Output write succeeded after retry");
                }
                return Ok(());
            }
            Err(e) => {
                let class = ErrorClass::classify(&e);
                if !class.is_retryable() || attempt >= WRITE_RETRIES {
                    warn!(
                        ?class,
                        attempt = attempt + 1,
                        report_id = format_args!("0x{:02X}", report.report_id()),
                        error = %e,
                        "Output write failed"
                    );
                    return Err(e);
                }
                debug!(?class, error = %e, "Output write failed, retrying");
                attempt += 1;
            }
        }
    }
}

/// Bounded exponential backoff for reopening a lost device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: u32,
    /// After this long without success the outage is reported as
    /// [`DeviceStatus::Unavailable`]; retrying continues.
    pub give_up_after_secs: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_ms: 100,
            max_ms: 3000,
            multiplier: 2,
            give_up_after_secs: 30,
        }
    }
}

impl ReconnectPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            next: Duration::from_millis(self.initial_ms),
            started: Instant::now(),
            reported: false,
        }
    }
}

/// State of one reconnect attempt sequence.
#[derive(Debug)]
pub struct Backoff {
    policy: ReconnectPolicy,
    next: Duration,
    started: Instant,
    reported: bool,
}

impl Backoff {
    /// Delay before the next attempt; grows up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        let grown = self.next.saturating_mul(self.policy.multiplier.max(1));
        self.next = grown.min(Duration::from_millis(self.policy.max_ms));
        delay
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// True exactly once, when the outage first exceeds the give-up window.
    pub fn take_give_up(&mut self) -> bool {
        if self.reported {
            return false;
        }
        if self.elapsed() >= Duration::from_secs(self.policy.give_up_after_secs) {
            self.reported = true;
            return true;
        }
        false
    }
}

/// Device connection status as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Link open and dispatching.
    Connected,
    /// Link lost; reopening with backoff.
    Reconnecting,
    /// Reopen has failed for longer than the give-up window.
    Unavailable,
    /// Engine shut down.
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockWriter;

    #[test]
    fn classify_timeout_as_transient() {
        let err = Error::Timeout("1s elapsed".into());
        assert_eq!(ErrorClass::classify(&err), ErrorClass::Transient);
        assert!(ErrorClass::classify(&err).is_retryable());
    }

    #[test]
    fn classify_permission_denied() {
        let err = Error::PermissionDenied("/dev/hidraw3".into());
        assert_eq!(ErrorClass::classify(&err), ErrorClass::PermissionDenied);
        assert!(!ErrorClass::classify(&err).is_retryable());
    }

    #[test]
    fn classify_hid_disconnect_messages() {
        for msg in [
            "hidapi error: No such device",
            "device disconnected",
            "Input/output error (os error 5)",
        ] {
            let err = Error::Hid(msg.into());
            assert_eq!(ErrorClass::classify(&err), ErrorClass::Disconnected, "{msg}");
        }
    }

    #[test]
    fn classify_rejected_write_is_retryable() {
        let err = Error::WriteRejected("short write".into());
        assert_eq!(ErrorClass::classify(&err), ErrorClass::Rejected);
        assert!(ErrorClass::classify(&err).is_retryable());
    }

    #[test]
    fn classify_config_errors() {
        assert_eq!(
            ErrorClass::classify(&Error::MacroNotFound("x".into())),
            ErrorClass::Config
        );
        assert_eq!(ErrorClass::classify(&Error::NotRecording), ErrorClass::Config);
    }

    #[test]
    fn into_device_lost_maps_disconnects_only() {
        let lost = into_device_lost(Error::Hid("No such device".into()));
        assert!(matches!(lost, Error::DeviceLost(_)));
        let other = into_device_lost(Error::Hid("busy".into()));
        assert!(matches!(other, Error::Hid(_)));
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut b = ReconnectPolicy::default().backoff();
        let delays: Vec<u64> = (0..8).map(|_| b.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600, 3000, 3000, 3000]);
    }

    #[test]
    fn give_up_reported_once() {
        let policy = ReconnectPolicy {
            give_up_after_secs: 0,
            ..ReconnectPolicy::default()
        };
        let mut b = policy.backoff();
        assert!(b.take_give_up());
        assert!(!b.take_give_up());
    }

    #[test]
    fn write_with_retry_succeeds_first_time() {
        let mut w = MockWriter::new();
        let log = w.log();
        let report = OutputReport::feature(vec![0x07, 1, 2, 3, 0]);
        write_with_retry(&mut w, &report).unwrap();
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn write_with_retry_gives_up_after_one_retry() {
        let mut w = MockWriter::rejecting();
        let attempts = w.attempts();
        let report = OutputReport::feature(vec![0x07, 1, 2, 3, 0]);
        assert!(matches!(
            write_with_retry(&mut w, &report),
            Err(Error::WriteRejected(_))
        ));
        assert_eq!(*attempts.lock(), 2);
    }

    #[test]
    fn write_with_retry_does_not_retry_lost_device() {
        let mut w = MockWriter::new();
        let attempts = w.attempts();
        w.lose();
        let report = OutputReport::feature(vec![0x07, 1, 2, 3, 0]);
        assert!(matches!(
            write_with_retry(&mut w, &report),
            Err(Error::DeviceLost(_))
        ));
        assert_eq!(*attempts.lock(), 1);
    }
}
