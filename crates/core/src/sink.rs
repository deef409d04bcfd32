//! Synthesized keyboard output.

use crate::error::Result;
use crate::keys::KeyCode;

/// Receiver of synthesized key events (a uinput keyboard in the daemon).
///
/// Implementations serialize calls internally: press and release for the same
/// key arrive at the OS in the order they were issued, whichever thread
/// issues them.
pub trait InputSink: Send + Sync {
    fn press(&self, key: KeyCode) -> Result<()>;
    fn release(&self, key: KeyCode) -> Result<()>;
}

/// Sink that only logs; used by diagnostic commands.
#[derive(Debug, Default)]
pub struct NullSink;

impl InputSink for NullSink {
    fn press(&self, key: KeyCode) -> Result<()> {
        tracing::debug!(%key, "press (discarded)");
        Ok(())
    }

    fn release(&self, key: KeyCode) -> Result<()> {
        tracing::debug!(%key, "release (discarded)");
        Ok(())
    }
}
