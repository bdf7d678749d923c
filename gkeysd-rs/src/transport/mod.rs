/* Transport capability: how the engine reaches the physical keyboard.
 *
 * A `Transport` is the backend context, built once at startup and owned by
 * the registry. Opening a device yields a `TransportHandle`, exclusively
 * owned by that device's runtime for as long as it is started. Exactly one
 * backend is selected, either libusb (claims the interface) or hidapi
 * (talks to the hidraw node). */
#[cfg(feature = "hidapi")]
pub mod hidraw;
#[cfg(feature = "libusb")]
pub mod libusb;
#[cfg(test)]
pub mod mock;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::device::DeviceDescriptor;
use crate::error::TransportError;

/* Outcome of a bounded interrupt read. A timeout is the steady state of an
 * idle keyboard, not an error. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Data(usize),
    Timeout,
}

/* Backend context, shared by every device. */
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /* Claim the device so that subsequent reads return its raw proprietary
     * report layout. */
    fn open(
        &self,
        descriptor: &DeviceDescriptor,
    ) -> Result<Box<dyn TransportHandle>, TransportError>;
}

/* An opened device. */
pub trait TransportHandle: Send {
    fn send_feature_report(&mut self, report: &[u8]) -> Result<(), TransportError>;

    /* Block up to `timeout` for one key report. */
    fn read_keys_interrupt(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<ReadStatus, TransportError>;

    fn write_lcd_interrupt(
        &mut self,
        frame: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /* Release the device. With `skip_io` the handle is dropped without any
     * request reaching the device, which may already be unplugged. */
    fn close(self: Box<Self>, skip_io: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Libusb,
    Hidapi,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "libusb" => Ok(Backend::Libusb),
            "hidapi" => Ok(Backend::Hidapi),
            other => Err(format!("Unknown transport backend '{other}'")),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Backend::Libusb => "libusb",
            Backend::Hidapi => "hidapi",
        })
    }
}

impl Default for Backend {
    fn default() -> Self {
        if cfg!(feature = "libusb") {
            Backend::Libusb
        } else {
            Backend::Hidapi
        }
    }
}

/* Build the transport context for `backend`. Fails when the backend was not
 * compiled in or its library cannot be initialised. */
pub fn create_transport(backend: Backend) -> anyhow::Result<Arc<dyn Transport>> {
    match backend {
        #[cfg(feature = "libusb")]
        Backend::Libusb => Ok(Arc::new(libusb::LibusbTransport::new()?)),
        #[cfg(feature = "hidapi")]
        Backend::Hidapi => Ok(Arc::new(hidraw::HidapiTransport::new()?)),
        #[allow(unreachable_patterns)]
        other => anyhow::bail!("Transport backend {other} is not compiled in"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_backend() {
        assert_eq!("libusb".parse::<Backend>().unwrap(), Backend::Libusb);
        assert_eq!(" HIDAPI ".parse::<Backend>().unwrap(), Backend::Hidapi);
        assert!("serial".parse::<Backend>().is_err());
        assert_eq!(Backend::Hidapi.to_string(), "hidapi");
    }
}
