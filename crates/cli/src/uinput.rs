//! Virtual keyboard backed by uinput.

use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{AttributeSet, EventType, InputEvent, Key};
use open_g13_core::error::{Error, Result};
use open_g13_core::keys::KeyCode;
use open_g13_core::sink::InputSink;
use parking_lot::Mutex;
use tracing::{info, trace};

pub const DEVICE_NAME: &str = "open-g13 virtual keyboard";

/// A uinput keyboard that can emit every key in the key name table.
pub struct UinputKeyboard {
    device: Mutex<VirtualDevice>,
}

impl UinputKeyboard {
    pub fn new() -> Result<Self> {
        let mut keys = AttributeSet::<Key>::new();
        for code in KeyCode::all() {
            keys.insert(Key::new(code.code()));
        }
        let device = VirtualDeviceBuilder::new()
            .map_err(uinput_error)?
            .name(DEVICE_NAME)
            .with_keys(&keys)
            .map_err(uinput_error)?
            .build()
            .map_err(uinput_error)?;
        info!(name = DEVICE_NAME, "Virtual keyboard created");
        Ok(Self {
            device: Mutex::new(device),
        })
    }

    fn emit(&self, key: KeyCode, value: i32) -> Result<()> {
        let event = InputEvent::new(EventType::KEY, key.code(), value);
        trace!(%key, value, "uinput");
        // emit() terminates the batch with SYN_REPORT.
        self.device.lock().emit(&[event]).map_err(Error::from)
    }
}

impl InputSink for UinputKeyboard {
    fn press(&self, key: KeyCode) -> Result<()> {
        self.emit(key, 1)
    }

    fn release(&self, key: KeyCode) -> Result<()> {
        self.emit(key, 0)
    }
}

fn uinput_error(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        Error::PermissionDenied(format!("/dev/uinput: {e}"))
    } else {
        Error::Io(e)
    }
}
