/* Keyboard discovery through udev.
 *
 * Watches `usb/usb_device` nodes. Devices already plugged in at startup are
 * reported first, then hotplug events as they come. Only devices with a
 * device database entry are announced on add; every removal is announced,
 * the registry ignores IDs it never saw. */
use std::ffi::OsStr;
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::device::{DeviceDescriptor, DeviceId};
use crate::device_database::{BusLocation, DeviceDb};

const SUBSYSTEM: &str = "usb";
const DEVTYPE: &str = "usb_device";

/* How often the monitor thread checks whether anybody still listens. */
const POLL_TIMEOUT_MS: u16 = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceAction {
    Add { descriptor: DeviceDescriptor },
    Remove { id: DeviceId },
}

/* Start discovery on a dedicated thread. The thread exits once `tx` has no
 * receiver left. */
pub fn spawn(db: DeviceDb, tx: mpsc::Sender<DeviceAction>) -> Result<JoinHandle<()>> {
    /* Listen before enumerating so nothing plugged in between is missed. */
    let socket = udev::MonitorBuilder::new()
        .and_then(|b| b.match_subsystem_devtype(SUBSYSTEM, DEVTYPE))
        .and_then(|b| b.listen())
        .context("Creating the udev monitor")?;

    let present = enumerate(&db).context("Enumerating USB devices")?;

    thread::Builder::new()
        .name("udev-monitor".into())
        .spawn(move || {
            for descriptor in present {
                if tx.blocking_send(DeviceAction::Add { descriptor }).is_err() {
                    return;
                }
            }
            monitor(socket, &db, &tx);
            debug!("udev monitor exiting");
        })
        .context("Spawning the udev monitor thread")
}

fn enumerate(db: &DeviceDb) -> std::io::Result<Vec<DeviceDescriptor>> {
    let mut enumerator = udev::Enumerator::new()?;
    enumerator.match_subsystem(SUBSYSTEM)?;
    enumerator.match_property("DEVTYPE", DEVTYPE)?;

    let found: Vec<_> = enumerator
        .scan_devices()?
        .filter_map(|device| describe(db, &device))
        .collect();
    info!("Found {} supported keyboard(s) at startup", found.len());
    Ok(found)
}

fn monitor(socket: udev::MonitorSocket, db: &DeviceDb, tx: &mpsc::Sender<DeviceAction>) {
    loop {
        if tx.is_closed() {
            return;
        }

        let mut fds = [PollFd::new(socket.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                warn!("udev monitor poll failed: {e}");
                return;
            }
        }

        for event in socket.iter() {
            let action = match event.event_type() {
                udev::EventType::Add => match describe(db, &event.device()) {
                    Some(descriptor) => DeviceAction::Add { descriptor },
                    None => continue,
                },
                udev::EventType::Remove => match device_id(&event.device()) {
                    Some(id) => DeviceAction::Remove { id },
                    None => continue,
                },
                _ => continue,
            };
            debug!("udev: {action:?}");
            if tx.blocking_send(action).is_err() {
                return;
            }
        }
    }
}

/* Build a descriptor for `device` if the database knows it. */
fn describe(db: &DeviceDb, device: &udev::Device) -> Option<DeviceDescriptor> {
    let vid = device.attribute_value("idVendor").and_then(parse_hex_u16)?;
    let pid = device.attribute_value("idProduct").and_then(parse_hex_u16)?;
    let entry = db.get(&(SUBSYSTEM.to_string(), vid, pid))?;
    let (bus, address) = bus_location(device)?;

    let location = BusLocation {
        bus,
        address,
        hidraw: hidraw_node(device, entry.driver_config.interface),
    };
    match entry.descriptor(vid, pid, location) {
        Ok(descriptor) => {
            info!(
                "Matched {} -> {} (driver: {})",
                descriptor.id, entry.name, entry.driver
            );
            Some(descriptor)
        }
        Err(e) => {
            warn!("Ignoring {vid:04x}:{pid:04x}: {e}");
            None
        }
    }
}

/* Bus number and device address. Sysfs attributes are gone by the time a
 * remove event arrives, so the uevent properties are used. */
fn bus_location(device: &udev::Device) -> Option<(u8, u8)> {
    let bus = device.property_value("BUSNUM").and_then(parse_dec_u8)?;
    let address = device.property_value("DEVNUM").and_then(parse_dec_u8)?;
    Some((bus, address))
}

fn device_id(device: &udev::Device) -> Option<DeviceId> {
    bus_location(device).map(|(bus, address)| DeviceId::from_bus(bus, address))
}

/* The `/dev/hidrawN` node belonging to `interface` of a USB device. */
fn hidraw_node(device: &udev::Device, interface: u8) -> Option<PathBuf> {
    let mut enumerator = udev::Enumerator::new().ok()?;
    enumerator.match_subsystem("hidraw").ok()?;
    enumerator.match_parent(device).ok()?;

    enumerator.scan_devices().ok()?.find_map(|hidraw| {
        let parent = hidraw
            .parent_with_subsystem_devtype(SUBSYSTEM, "usb_interface")
            .ok()??;
        let number = parent.attribute_value("bInterfaceNumber").and_then(parse_hex_u8)?;
        if number == interface {
            hidraw.devnode().map(PathBuf::from)
        } else {
            None
        }
    })
}

fn parse_hex_u16(value: &OsStr) -> Option<u16> {
    u16::from_str_radix(value.to_str()?.trim(), 16).ok()
}

fn parse_hex_u8(value: &OsStr) -> Option<u8> {
    u8::from_str_radix(value.to_str()?.trim(), 16).ok()
}

/* BUSNUM/DEVNUM are zero-padded decimals, e.g. "003". */
fn parse_dec_u8(value: &OsStr) -> Option<u8> {
    value.to_str()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sysfs_values() {
        assert_eq!(parse_hex_u16(OsStr::new("046d")), Some(0x046d));
        assert_eq!(parse_hex_u16(OsStr::new("c22e\n")), Some(0xc22e));
        assert_eq!(parse_hex_u16(OsStr::new("zz")), None);
        assert_eq!(parse_hex_u8(OsStr::new("01")), Some(1));
        assert_eq!(parse_dec_u8(OsStr::new("003")), Some(3));
        assert_eq!(parse_dec_u8(OsStr::new("300")), None);
    }
}
