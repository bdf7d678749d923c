/* hidapi backend: uses the hidraw node of the keyboard's vendor interface,
 * leaving the kernel HID driver bound. */
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::time::Duration;

use hidapi::{HidApi, HidDevice};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::device::DeviceDescriptor;
use crate::error::TransportError;
use crate::transport::{ReadStatus, Transport, TransportHandle};

pub struct HidapiTransport {
    api: Mutex<HidApi>,
}

impl HidapiTransport {
    pub fn new() -> Result<Self, TransportError> {
        let api = HidApi::new()?;
        info!("hidapi transport initialised");
        Ok(Self {
            api: Mutex::new(api),
        })
    }
}

impl Transport for HidapiTransport {
    fn name(&self) -> &'static str {
        "hidapi"
    }

    fn open(
        &self,
        descriptor: &DeviceDescriptor,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        let mut api = self.api.lock();

        let device = match &descriptor.hidraw {
            Some(node) => {
                let path = CString::new(node.as_os_str().as_bytes()).map_err(|_| {
                    TransportError::DeviceNotFound(node.display().to_string())
                })?;
                api.open_path(&path)?
            }
            None => {
                api.refresh_devices()?;
                let info = api
                    .device_list()
                    .find(|d| {
                        d.vendor_id() == descriptor.vendor_id
                            && d.product_id() == descriptor.product_id
                            && d.interface_number() == i32::from(descriptor.interface)
                    })
                    .ok_or_else(|| TransportError::DeviceNotFound(descriptor.id.to_string()))?;
                info.open_device(&api)?
            }
        };
        device.set_blocking_mode(true)?;

        info!(
            "Opened hidraw interface {} of {} ({:04x}:{:04x})",
            descriptor.interface, descriptor.id, descriptor.vendor_id, descriptor.product_id
        );
        Ok(Box::new(HidapiHandle { device }))
    }
}

pub struct HidapiHandle {
    device: HidDevice,
}

impl TransportHandle for HidapiHandle {
    fn send_feature_report(&mut self, report: &[u8]) -> Result<(), TransportError> {
        self.device.send_feature_report(report)?;
        debug!("TX feature {} bytes: {:02x?}", report.len(), report);
        Ok(())
    }

    fn read_keys_interrupt(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<ReadStatus, TransportError> {
        let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        match self.device.read_timeout(buf, millis)? {
            0 => Ok(ReadStatus::Timeout),
            n => Ok(ReadStatus::Data(n)),
        }
    }

    /* hidraw has no write timeout; output reports complete or fail. */
    fn write_lcd_interrupt(
        &mut self,
        frame: &[u8],
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        let written = self.device.write(frame)?;
        if written != frame.len() {
            return Err(TransportError::ShortWrite {
                written,
                expected: frame.len(),
            });
        }
        Ok(())
    }

    fn close(self: Box<Self>, skip_io: bool) {
        debug!("Closing hidraw handle (skip_io: {skip_io})");
    }
}
