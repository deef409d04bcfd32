//! Safety layer: validates everything before it reaches the device or the
//! live binding state.
//!
//! # Output reports
//!
//! Only three output reports are ever sent to the G13:
//!
//! | Report | ID | Kind | Length |
//! |---|---|---|---|
//! | Backlight color | 0x07 | feature | 5 |
//! | M-key LEDs | 0x05 | feature | 5 |
//! | LCD framebuffer | 0x03 | interrupt | 992 |
//!
//! Anything else is refused with [`Error::WriteRejected`] before it touches
//! the handle. Feature report 0x07 is also what older firmware uses for
//! other settings, so the length check is what keeps a malformed buffer from
//! being interpreted as something else.
//!
//! # Macros
//!
//! - at most [`MAX_MACRO_STEPS`] steps
//! - each step delay at most [`MAX_STEP_DELAY_MS`]
//! - `speed_multiplier` in [`MIN_SPEED`]..=[`MAX_SPEED`]
//! - `repeat_count` in 1..=[`MAX_REPEAT_COUNT`]
//!
//! # Invariants
//! 1. Validation happens before any state change; a rejected request leaves
//!    the engine exactly as it was.
//! 2. Profile and macro names double as file names and are restricted to
//!    ASCII alphanumerics, `-` and `_`.

use crate::buttons::Mode;
use crate::error::{Error, Result};
use crate::lcd::TEXT_LINES;
use crate::macros::Macro;
use crate::output::{LedEffect, OutputCommand, FULL_BRIGHTNESS};
use crate::profile::{Action, JoystickBinding, KeyCombo, Profile};
use crate::report::{
    OutputKind, OutputReport, BACKLIGHT_REPORT_ID, BACKLIGHT_REPORT_LEN, LCD_REPORT_ID,
    LCD_REPORT_LEN, MODE_LEDS_REPORT_ID, MODE_LEDS_REPORT_LEN,
};

/// (report ID, delivery, exact length) of every report we may send.
const ALLOWED_OUTPUT_REPORTS: &[(u8, OutputKind, usize)] = &[
    (BACKLIGHT_REPORT_ID, OutputKind::Feature, BACKLIGHT_REPORT_LEN),
    (MODE_LEDS_REPORT_ID, OutputKind::Feature, MODE_LEDS_REPORT_LEN),
    (LCD_REPORT_ID, OutputKind::Interrupt, LCD_REPORT_LEN),
];

pub const MAX_MACRO_STEPS: usize = 4096;
pub const MAX_STEP_DELAY_MS: u64 = 60_000;
pub const MIN_SPEED: f32 = 0.1;
pub const MAX_SPEED: f32 = 10.0;
pub const MAX_REPEAT_COUNT: u32 = 1000;
pub const MAX_COMBO_KEYS: usize = 8;
pub const MAX_KEY_LEN: usize = 64;
pub const MIN_PULSE_PERIOD_MS: u64 = 100;
pub const MAX_PULSE_PERIOD_MS: u64 = 10_000;
pub const MAX_ALERT_FLASHES: u8 = 20;
pub const MIN_STICK_DEADZONE: f32 = 0.05;
pub const MAX_STICK_DEADZONE: f32 = 0.95;

/// Check an output report against the whitelist.
pub fn validate_output_report(report: &OutputReport) -> Result<()> {
    let id = report.report_id();
    let allowed = ALLOWED_OUTPUT_REPORTS
        .iter()
        .any(|(aid, kind, len)| *aid == id && *kind == report.kind && *len == report.data.len());
    if allowed {
        Ok(())
    } else {
        Err(Error::WriteRejected(format!(
            "report 0x{:02X} ({:?}, {} bytes) is not in the output whitelist",
            id,
            report.kind,
            report.data.len()
        )))
    }
}

/// LCD text must fit the display's line count.
pub fn validate_lcd_text<S: AsRef<str>>(lines: &[S]) -> Result<()> {
    if lines.len() > TEXT_LINES {
        return Err(Error::OutOfRange {
            field: "lcd lines",
            value: lines.len() as u64,
            min: 0,
            max: TEXT_LINES as u64,
        });
    }
    Ok(())
}

pub fn validate_output_command(cmd: &OutputCommand) -> Result<()> {
    match cmd {
        OutputCommand::SetLcdText(lines) => validate_lcd_text(lines),
        OutputCommand::SetBrightness(b) => validate_brightness(*b),
        OutputCommand::PlayLedEffect(effect) => validate_led_effect(effect),
        _ => Ok(()),
    }
}

pub fn validate_brightness(percent: u8) -> Result<()> {
    if percent > FULL_BRIGHTNESS {
        return Err(Error::OutOfRange {
            field: "brightness",
            value: u64::from(percent),
            min: 0,
            max: u64::from(FULL_BRIGHTNESS),
        });
    }
    Ok(())
}

pub fn validate_led_effect(effect: &LedEffect) -> Result<()> {
    match *effect {
        LedEffect::Pulse { period_ms, .. } => {
            if !(MIN_PULSE_PERIOD_MS..=MAX_PULSE_PERIOD_MS).contains(&period_ms) {
                return Err(Error::OutOfRange {
                    field: "pulse period_ms",
                    value: period_ms,
                    min: MIN_PULSE_PERIOD_MS,
                    max: MAX_PULSE_PERIOD_MS,
                });
            }
        }
        LedEffect::Alert { count, .. } => {
            if !(1..=MAX_ALERT_FLASHES).contains(&count) {
                return Err(Error::OutOfRange {
                    field: "alert count",
                    value: u64::from(count),
                    min: 1,
                    max: u64::from(MAX_ALERT_FLASHES),
                });
            }
        }
    }
    Ok(())
}

/// Stick direction thresholds must leave room on both sides.
pub fn validate_joystick(stick: &JoystickBinding) -> Result<()> {
    if !(MIN_STICK_DEADZONE..=MAX_STICK_DEADZONE).contains(&stick.deadzone) {
        return Err(Error::OutOfRange {
            field: "joystick deadzone x100",
            value: (stick.deadzone.max(0.0) * 100.0).round() as u64,
            min: (MIN_STICK_DEADZONE * 100.0).round() as u64,
            max: (MAX_STICK_DEADZONE * 100.0).round() as u64,
        });
    }
    for (_, combo) in stick.directions() {
        validate_combo(combo)?;
    }
    Ok(())
}

/// Name usable as a profile/macro id and file stem.
pub fn validate_store_key(key: &str) -> Result<()> {
    let ok = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(Error::Profile(format!(
            "invalid name '{key}': use 1-{MAX_KEY_LEN} ASCII letters, digits, '-' or '_'"
        )))
    }
}

/// Check macro limits.
pub fn validate_macro(m: &Macro) -> Result<()> {
    validate_store_key(&m.id)?;
    if m.steps.len() > MAX_MACRO_STEPS {
        return Err(Error::OutOfRange {
            field: "macro steps",
            value: m.steps.len() as u64,
            min: 0,
            max: MAX_MACRO_STEPS as u64,
        });
    }
    if let Some(step) = m.steps.iter().find(|s| s.delay_ms > MAX_STEP_DELAY_MS) {
        return Err(Error::OutOfRange {
            field: "step delay_ms",
            value: step.delay_ms,
            min: 0,
            max: MAX_STEP_DELAY_MS,
        });
    }
    if m.repeat_delay_ms > MAX_STEP_DELAY_MS {
        return Err(Error::OutOfRange {
            field: "repeat_delay_ms",
            value: m.repeat_delay_ms,
            min: 0,
            max: MAX_STEP_DELAY_MS,
        });
    }
    if !(MIN_SPEED..=MAX_SPEED).contains(&m.speed_multiplier) {
        // Reported in tenths so the integer range stays meaningful.
        return Err(Error::OutOfRange {
            field: "speed_multiplier x10",
            value: (m.speed_multiplier.max(0.0) * 10.0).round() as u64,
            min: (MIN_SPEED * 10.0).round() as u64,
            max: (MAX_SPEED * 10.0).round() as u64,
        });
    }
    if !(1..=MAX_REPEAT_COUNT).contains(&m.repeat_count) {
        return Err(Error::OutOfRange {
            field: "repeat_count",
            value: m.repeat_count as u64,
            min: 1,
            max: MAX_REPEAT_COUNT as u64,
        });
    }
    Ok(())
}

fn validate_combo(keys: &KeyCombo) -> Result<()> {
    let n = keys.keys().len();
    if n == 0 || n > MAX_COMBO_KEYS {
        return Err(Error::OutOfRange {
            field: "combo keys",
            value: n as u64,
            min: 1,
            max: MAX_COMBO_KEYS as u64,
        });
    }
    Ok(())
}

/// Check one binding.
pub fn validate_action(action: &Action) -> Result<()> {
    match action {
        Action::EmitKeyCombo { keys } => validate_combo(keys),
        Action::RunMacro { macro_id } => validate_store_key(macro_id),
        Action::SwitchMode { .. } => Ok(()),
        Action::SetOutput { command } => validate_output_command(command),
    }
}

/// Check a whole profile before it becomes active or is saved.
pub fn validate_profile(profile: &Profile) -> Result<()> {
    validate_store_key(&profile.name)?;
    if let Some(backlight) = &profile.backlight {
        validate_brightness(backlight.brightness)?;
    }
    validate_lcd_text(&profile.status_lines(Mode::M1))?;
    validate_joystick(&profile.joystick)?;
    for buttons in profile.modes.values() {
        for action in buttons.values() {
            validate_action(action)?;
        }
    }
    Ok(())
}
