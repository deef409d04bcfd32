//! Device model and discovery.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::buttons::{DecodeTable, G13_TABLE};
use crate::error::Result;
use crate::{pids, LOGITECH_VID};

/// Supported Logitech gameboards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceModel {
    #[default]
    G13,
}

impl DeviceModel {
    pub const ALL: &'static [DeviceModel] = &[DeviceModel::G13];

    /// Look up model from USB product ID.
    pub fn from_pid(pid: u16) -> Option<Self> {
        match pid {
            pids::G13 => Some(Self::G13),
            _ => None,
        }
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::G13 => "Logitech G13",
        }
    }

    /// USB Product ID.
    pub fn pid(&self) -> u16 {
        match self {
            Self::G13 => pids::G13,
        }
    }

    /// Input report layout.
    pub fn decode_table(&self) -> &'static DecodeTable {
        match self {
            Self::G13 => &G13_TABLE,
        }
    }
}

/// Information about a discovered device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub model: DeviceModel,
    pub vid: u16,
    pub pid: u16,
    pub path: String,
    pub serial: Option<String>,
}

/// Enumerate connected devices of every supported model.
pub fn discover_devices() -> Result<Vec<DeviceInfo>> {
    debug!("Starting HID device enumeration");
    let api = hidapi::HidApi::new()?;

    let mut devices = Vec::new();
    for info in api.device_list() {
        if info.vendor_id() != LOGITECH_VID {
            continue;
        }

        if let Some(model) = DeviceModel::from_pid(info.product_id()) {
            info!(
                model = model.name(),
                vid = format_args!("0x{:04X}", info.vendor_id()),
                pid = format_args!("0x{:04X}", info.product_id()),
                path = %info.path().to_string_lossy(),
                "Found Logitech device"
            );
            devices.push(DeviceInfo {
                model,
                vid: info.vendor_id(),
                pid: info.product_id(),
                path: info.path().to_string_lossy().into_owned(),
                serial: info.serial_number().map(|s| s.to_string()),
            });
        }
    }

    debug!(count = devices.len(), "Device enumeration complete");
    Ok(devices)
}
