/* libusb backend: detaches the kernel driver from the keyboard's vendor
 * interface, claims it and talks to its interrupt endpoints directly.
 *
 * The interface is claimed and released through the raw libusb calls, so
 * rusb never tracks it: dropping the `DeviceHandle` then only closes the
 * file descriptor and never sends a release request to the device. */
use std::os::raw::c_int;
use std::time::Duration;

use rusb::ffi::{self, constants};
use rusb::{Context, DeviceHandle, Direction, Recipient, RequestType, TransferType, UsbContext};
use tracing::{debug, info, warn};

use crate::device::DeviceDescriptor;
use crate::error::TransportError;
use crate::transport::{ReadStatus, Transport, TransportHandle};

/* HID class request SET_REPORT, feature report type in the high byte. */
const HID_SET_REPORT: u8 = 0x09;
const HID_REPORT_TYPE_FEATURE: u16 = 0x03 << 8;
const CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);

/* Map a raw libusb return code. */
fn usb_result(rc: c_int) -> Result<(), rusb::Error> {
    match rc {
        0 => Ok(()),
        constants::LIBUSB_ERROR_IO => Err(rusb::Error::Io),
        constants::LIBUSB_ERROR_ACCESS => Err(rusb::Error::Access),
        constants::LIBUSB_ERROR_NO_DEVICE => Err(rusb::Error::NoDevice),
        constants::LIBUSB_ERROR_NOT_FOUND => Err(rusb::Error::NotFound),
        constants::LIBUSB_ERROR_BUSY => Err(rusb::Error::Busy),
        _ => Err(rusb::Error::Other),
    }
}

/* Requests closing still owes the device. */
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Teardown {
    release: bool,
    reattach: bool,
}

impl Teardown {
    /* The requests to send now. Nothing stays pending afterwards, so a
     * skipped teardown is never replayed on drop. */
    fn take(&mut self, skip_io: bool) -> Teardown {
        let pending = std::mem::take(self);
        if skip_io {
            Teardown::default()
        } else {
            pending
        }
    }
}

pub struct LibusbTransport {
    context: Context,
}

impl LibusbTransport {
    pub fn new() -> Result<Self, TransportError> {
        let context = Context::new()?;
        info!("libusb transport initialised");
        Ok(Self { context })
    }
}

/* Interrupt endpoints of the claimed interface. */
#[derive(Debug, Clone, Copy)]
struct Endpoints {
    keys_in: u8,
    lcd_out: Option<u8>,
}

fn find_endpoints(
    device: &rusb::Device<Context>,
    descriptor: &DeviceDescriptor,
) -> Result<Endpoints, TransportError> {
    let device_desc = device.device_descriptor()?;
    let mut keys_in = None;
    let mut lcd_out = None;

    for index in 0..device_desc.num_configurations() {
        let config = device.config_descriptor(index)?;
        if config.number() != descriptor.configuration {
            continue;
        }
        for interface in config.interfaces() {
            for alt in interface.descriptors() {
                if alt.interface_number() != descriptor.interface
                    || alt.setting_number() != descriptor.alt_setting
                {
                    continue;
                }
                for endpoint in alt.endpoint_descriptors() {
                    if endpoint.transfer_type() != TransferType::Interrupt {
                        continue;
                    }
                    match endpoint.direction() {
                        Direction::In if keys_in.is_none() => keys_in = Some(endpoint.address()),
                        Direction::Out if lcd_out.is_none() => lcd_out = Some(endpoint.address()),
                        _ => {}
                    }
                }
            }
        }
    }

    let keys_in = keys_in.ok_or(TransportError::MissingEndpoint {
        kind: "interrupt IN",
        interface: descriptor.interface,
    })?;
    debug!("Endpoints: keys 0x{:02x}, LCD {:02x?}", keys_in, lcd_out);
    Ok(Endpoints { keys_in, lcd_out })
}

impl Transport for LibusbTransport {
    fn name(&self) -> &'static str {
        "libusb"
    }

    fn open(
        &self,
        descriptor: &DeviceDescriptor,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        let device = self
            .context
            .devices()?
            .iter()
            .find(|d| d.bus_number() == descriptor.bus && d.address() == descriptor.address)
            .ok_or_else(|| TransportError::DeviceNotFound(descriptor.id.to_string()))?;

        let device_desc = device.device_descriptor()?;
        if device_desc.vendor_id() != descriptor.vendor_id
            || device_desc.product_id() != descriptor.product_id
        {
            return Err(TransportError::DeviceNotFound(descriptor.id.to_string()));
        }

        let endpoints = find_endpoints(&device, descriptor)?;
        let handle = device.open()?;
        let interface = descriptor.interface;

        let reattach = match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {interface}");
                handle.detach_kernel_driver(interface)?;
                true
            }
            Ok(false) => false,
            Err(rusb::Error::NotSupported) => false,
            Err(e) => return Err(e.into()),
        };

        let mut opened = LibusbHandle {
            handle,
            interface,
            endpoints,
            teardown: Teardown {
                release: false,
                reattach,
            },
        };

        if opened.handle.active_configuration()? != descriptor.configuration {
            opened
                .handle
                .set_active_configuration(descriptor.configuration)?;
        }
        /* SAFETY: the raw handle stays valid for as long as `opened`. */
        usb_result(unsafe {
            ffi::libusb_claim_interface(opened.handle.as_raw(), c_int::from(interface))
        })?;
        opened.teardown.release = true;
        if descriptor.alt_setting != 0 {
            opened
                .handle
                .set_alternate_setting(interface, descriptor.alt_setting)?;
        }

        info!(
            "Claimed interface {} of {} ({:04x}:{:04x})",
            interface, descriptor.id, descriptor.vendor_id, descriptor.product_id
        );
        Ok(Box::new(opened))
    }
}

pub struct LibusbHandle {
    handle: DeviceHandle<Context>,
    interface: u8,
    endpoints: Endpoints,
    teardown: Teardown,
}

impl LibusbHandle {
    /* Give the interface back to the kernel, or just forget it with
     * `skip_io`. */
    fn release(&mut self, skip_io: bool) {
        let Teardown { release, reattach } = self.teardown.take(skip_io);
        if release {
            /* SAFETY: the raw handle is still open, `self.handle` owns it. */
            let rc = unsafe {
                ffi::libusb_release_interface(self.handle.as_raw(), c_int::from(self.interface))
            };
            if let Err(e) = usb_result(rc) {
                warn!("Failed to release interface {}: {e}", self.interface);
            }
        }
        if reattach {
            if let Err(e) = self.handle.attach_kernel_driver(self.interface) {
                warn!("Failed to reattach kernel driver: {e}");
            }
        }
    }
}

impl TransportHandle for LibusbHandle {
    fn send_feature_report(&mut self, report: &[u8]) -> Result<(), TransportError> {
        let report_id = u16::from(report.first().copied().unwrap_or(0));
        let request_type =
            rusb::request_type(Direction::Out, RequestType::Class, Recipient::Interface);
        let written = self.handle.write_control(
            request_type,
            HID_SET_REPORT,
            HID_REPORT_TYPE_FEATURE | report_id,
            u16::from(self.interface),
            report,
            CONTROL_TIMEOUT,
        )?;
        if written != report.len() {
            return Err(TransportError::ShortWrite {
                written,
                expected: report.len(),
            });
        }
        debug!("TX feature {} bytes: {:02x?}", report.len(), report);
        Ok(())
    }

    fn read_keys_interrupt(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<ReadStatus, TransportError> {
        match self
            .handle
            .read_interrupt(self.endpoints.keys_in, buf, timeout)
        {
            Ok(n) => Ok(ReadStatus::Data(n)),
            Err(rusb::Error::Timeout) => Ok(ReadStatus::Timeout),
            Err(e) => Err(e.into()),
        }
    }

    fn write_lcd_interrupt(
        &mut self,
        frame: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let endpoint = self.endpoints.lcd_out.ok_or(TransportError::MissingEndpoint {
            kind: "interrupt OUT",
            interface: self.interface,
        })?;
        let written = self.handle.write_interrupt(endpoint, frame, timeout)?;
        if written != frame.len() {
            return Err(TransportError::ShortWrite {
                written,
                expected: frame.len(),
            });
        }
        Ok(())
    }

    fn close(mut self: Box<Self>, skip_io: bool) {
        if skip_io {
            debug!("Dropping handle of interface {} without I/O", self.interface);
        }
        self.release(skip_io);
    }
}

impl Drop for LibusbHandle {
    fn drop(&mut self) {
        self.release(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skipped_teardown_sends_nothing_later() {
        let mut teardown = Teardown {
            release: true,
            reattach: true,
        };
        assert_eq!(teardown.take(true), Teardown::default());
        /* What the drop that follows a skipped close would send. */
        assert_eq!(teardown.take(false), Teardown::default());
    }

    #[test]
    fn test_teardown_runs_once() {
        let mut teardown = Teardown {
            release: true,
            reattach: false,
        };
        assert_eq!(
            teardown.take(false),
            Teardown {
                release: true,
                reattach: false,
            }
        );
        assert_eq!(teardown.take(false), Teardown::default());
    }

    #[test]
    fn test_usb_result_codes() {
        assert!(usb_result(0).is_ok());
        assert_eq!(usb_result(constants::LIBUSB_ERROR_NO_DEVICE), Err(rusb::Error::NoDevice));
        assert_eq!(usb_result(constants::LIBUSB_ERROR_BUSY), Err(rusb::Error::Busy));
        assert_eq!(usb_result(-99), Err(rusb::Error::Other));
    }
}
