//! HID transport abstraction for device communication.
//!
//! The device link is split in two halves. The read half is owned by the
//! dispatch loop, the write half by the output serializer, so reads and
//! writes never contend for one handle. Real devices go through `hidapi`;
//! tests drive the same traits with the scripted devices in [`mock`].

use std::ffi::CString;
use std::time::Duration;

use hidapi::{HidApi, HidDevice};
use tracing::{debug, info, trace};

use crate::comm::into_device_lost;
use crate::device::DeviceModel;
use crate::error::{Error, Result};
use crate::report::{OutputKind, OutputReport, RawReport};
use crate::safety;
use crate::LOGITECH_VID;

/// Largest input report we expect from any supported device.
const READ_BUF_LEN: usize = 64;

/// Read half of a device link.
pub trait ReportReader: Send {
    /// Block up to `timeout` for one input report. `Ok(None)` means nothing
    /// arrived in time. A vanished device fails with [`Error::DeviceLost`].
    fn read_report(&mut self, timeout: Duration) -> Result<Option<RawReport>>;
}

/// Write half of a device link.
pub trait ReportWriter: Send {
    /// Perform exactly one synchronous output write.
    fn write_report(&mut self, report: &OutputReport) -> Result<()>;
}

/// Both halves of an open device.
pub struct DeviceLink {
    pub reader: Box<dyn ReportReader>,
    pub writer: Box<dyn ReportWriter>,
}

/// Opens (and reopens) the device.
pub trait DeviceConnector: Send + Sync {
    fn open(&self) -> Result<DeviceLink>;
}

/// Connector backed by `hidapi`.
#[derive(Debug, Clone)]
pub struct HidapiConnector {
    model: DeviceModel,
    path: Option<String>,
}

impl HidapiConnector {
    /// Open the first device of `model`, or the hidraw node at `path`.
    pub fn new(model: DeviceModel, path: Option<String>) -> Self {
        Self { model, path }
    }

    fn resolve_path(&self, api: &HidApi) -> Result<CString> {
        if let Some(path) = &self.path {
            return CString::new(path.as_str())
                .map_err(|_| Error::DeviceNotFound(format!("invalid device path '{path}'")));
        }
        api.device_list()
            .find(|d| d.vendor_id() == LOGITECH_VID && d.product_id() == self.model.pid())
            .map(|d| d.path().to_owned())
            .ok_or_else(|| Error::DeviceNotFound(self.model.name().to_string()))
    }
}

impl DeviceConnector for HidapiConnector {
    fn open(&self) -> Result<DeviceLink> {
        let api = HidApi::new()?;
        let path = self.resolve_path(&api)?;
        let reader = api.open_path(&path).map_err(open_error)?;
        let writer = api.open_path(&path).map_err(open_error)?;
        info!(
            model = self.model.name(),
            path = %path.to_string_lossy(),
            "Opened device"
        );
        Ok(DeviceLink {
            reader: Box::new(HidapiReader { device: reader }),
            writer: Box::new(HidapiWriter { device: writer }),
        })
    }
}

fn open_error(e: hidapi::HidError) -> Error {
    match Error::from(e) {
        Error::Hid(msg) => Error::DeviceNotFound(msg),
        other => other,
    }
}

struct HidapiReader {
    device: HidDevice,
}

impl ReportReader for HidapiReader {
    fn read_report(&mut self, timeout: Duration) -> Result<Option<RawReport>> {
        let mut buf = [0u8; READ_BUF_LEN];
        let ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let n = self
            .device
            .read_timeout(&mut buf, ms)
            .map_err(|e| into_device_lost(Error::from(e)))?;
        if n == 0 {
            return Ok(None);
        }
        trace!(report_hex = format_args!("{:02X?}", &buf[..n]), "HID RX");
        Ok(Some(RawReport::capture(&buf[..n])))
    }
}

struct HidapiWriter {
    device: HidDevice,
}

impl ReportWriter for HidapiWriter {
    fn write_report(&mut self, report: &OutputReport) -> Result<()> {
        safety::validate_output_report(report)?;
        trace!(
            kind = ?report.kind,
            report_id = format_args!("0x{:02X}", report.report_id()),
            len = report.data.len(),
            "HID TX"
        );
        match report.kind {
            OutputKind::Feature => self
                .device
                .send_feature_report(&report.data)
                .map_err(|e| into_device_lost(Error::from(e))),
            OutputKind::Interrupt => {
                let n = self
                    .device
                    .write(&report.data)
                    .map_err(|e| into_device_lost(Error::from(e)))?;
                if n < report.data.len() {
                    debug!(written = n, expected = report.data.len(), "Short HID write");
                    return Err(Error::WriteRejected(format!(
                        "short write: {n} of {} bytes",
                        report.data.len()
                    )));
                }
                Ok(())
            }
        }
    }
}
