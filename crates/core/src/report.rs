//! Raw HID report types crossing the transport boundary.

use std::time::Instant;

/// Input report ID carrying buttons and joystick.
pub const INPUT_REPORT_ID: u8 = 0x01;
/// LCD framebuffer output report ID.
pub const LCD_REPORT_ID: u8 = 0x03;
/// Mode-key LED feature report ID.
pub const MODE_LEDS_REPORT_ID: u8 = 0x05;
/// Backlight color feature report ID.
pub const BACKLIGHT_REPORT_ID: u8 = 0x07;

/// Backlight feature report length: `[0x07, r, g, b, 0]`.
pub const BACKLIGHT_REPORT_LEN: usize = 5;
/// Mode LED feature report length: `[0x05, mask, 0, 0, 0]`.
pub const MODE_LEDS_REPORT_LEN: usize = 5;
/// Bytes in front of the framebuffer in an LCD report.
pub const LCD_HEADER_LEN: usize = 32;
/// Full LCD report length (header + 160x43 packed framebuffer).
pub const LCD_REPORT_LEN: usize = LCD_HEADER_LEN + crate::lcd::FRAMEBUFFER_LEN;

/// What a captured input report claims to be, from its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Input,
    Unknown(u8),
}

impl ReportKind {
    pub fn from_id(id: u8) -> Self {
        match id {
            INPUT_REPORT_ID => Self::Input,
            other => Self::Unknown(other),
        }
    }
}

/// One input report exactly as read from the device.
#[derive(Debug, Clone)]
pub struct RawReport {
    pub kind: ReportKind,
    pub data: Vec<u8>,
    pub received: Instant,
}

impl RawReport {
    /// Copy a freshly read buffer and stamp it with the current time.
    pub fn capture(bytes: &[u8]) -> Self {
        let kind = bytes
            .first()
            .map(|id| ReportKind::from_id(*id))
            .unwrap_or(ReportKind::Unknown(0));
        Self {
            kind,
            data: bytes.to_vec(),
            received: Instant::now(),
        }
    }

    pub fn report_id(&self) -> Option<u8> {
        self.data.first().copied()
    }
}

/// How an output report is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// HID SET_REPORT(Feature) on the control endpoint.
    Feature,
    /// Interrupt OUT endpoint.
    Interrupt,
}

/// An encoded output report, report ID in byte 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputReport {
    pub kind: OutputKind,
    pub data: Vec<u8>,
}

impl OutputReport {
    pub fn feature(data: Vec<u8>) -> Self {
        Self {
            kind: OutputKind::Feature,
            data,
        }
    }

    pub fn interrupt(data: Vec<u8>) -> Self {
        Self {
            kind: OutputKind::Interrupt,
            data,
        }
    }

    pub fn report_id(&self) -> u8 {
        self.data.first().copied().unwrap_or(0)
    }
}
