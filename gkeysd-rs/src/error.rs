/* Error taxonomy shared by the transport backends, the keyboard engine and the
 * device registry. Timeouts are not errors (see `transport::ReadStatus`), and
 * macro size limits are enforced by truncation, never by raising. */
use thiserror::Error;

use crate::device::DeviceId;

/* Failure talking to the physical device. Recoverable: the listening loop
 * counts these and self-stops once the fatal threshold is exceeded. */
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("device {0} not found on the bus")]
    DeviceNotFound(String),

    #[error("no {kind} endpoint on interface {interface}")]
    MissingEndpoint { kind: &'static str, interface: u8 },

    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[cfg(feature = "libusb")]
    #[error("libusb: {0}")]
    Usb(#[from] rusb::Error),

    #[cfg(feature = "hidapi")]
    #[error("hidapi: {0}")]
    Hid(#[from] hidapi::HidError),

    /* Scripted failures from the in-memory test transport. */
    #[cfg(test)]
    #[error("simulated transport failure")]
    Simulated,
}

/* Failure at the registry / driver level. */
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no driver loaded for driver id '{0}'")]
    UnknownDriver(String),

    #[error("driver '{driver}' does not support {vendor_id:04x}:{product_id:04x}")]
    UnsupportedModel {
        driver: String,
        vendor_id: u16,
        product_id: u16,
    },

    #[error("malformed descriptor for {id}: {reason}")]
    MalformedDescriptor { id: DeviceId, reason: String },

    #[error("unknown device {0}")]
    NotFound(DeviceId),

    #[error("device {id} is {state}")]
    InvalidState { id: DeviceId, state: &'static str },

    #[error("device {id} has no {capability}")]
    Unsupported {
        id: DeviceId,
        capability: &'static str,
    },

    #[error("failed to spawn device thread: {0}")]
    Thread(#[source] std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/* A report that doesn't fit any expected shape. Logged and discarded; the
 * listening loop carries on. */
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolAnomaly {
    #[error("no report shape of {len} bytes")]
    UnknownShape { len: usize },

    #[error("{len}-byte report with unexpected tag 0x{tag:02x}")]
    UnexpectedTag { len: usize, tag: u8 },

    #[error("slot {slot} changed from 0x{previous:02x} to 0x{current:02x} between polls")]
    SlotConflict {
        slot: usize,
        previous: u8,
        current: u8,
    },
}
