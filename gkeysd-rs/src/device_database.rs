use std::collections::HashMap;
use std::path::{Path, PathBuf};

use configparser::ini::Ini;
use tracing::{debug, warn};

use crate::device::{Capabilities, DeviceDescriptor, DeviceId};
use crate::error::DeviceError;

/* A parsed `.device` file entry describing a supported keyboard. */
#[derive(Debug, Clone)]
pub struct DeviceEntry {
    pub name: String,
    pub driver: String,
    pub matches: Vec<DeviceMatch>,
    pub driver_config: DriverConfig,
}

/* A single bus:vid:pid match pattern from the `DeviceMatch=` field. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMatch {
    pub bustype: String,
    pub vid: u16,
    pub pid: u16,
}

/* USB layout and report lengths from the `[Driver/xxx]` section. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    pub interface: u8,
    pub configuration: u8,
    pub alt_setting: u8,
    pub macro_keys_len: usize,
    pub media_keys_len: usize,
    pub lcd_keys_len: usize,
    pub capabilities: Capabilities,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            interface: 0,
            configuration: 1,
            alt_setting: 0,
            macro_keys_len: 0,
            media_keys_len: 0,
            lcd_keys_len: 0,
            capabilities: Capabilities::empty(),
        }
    }
}

/* Where discovery found the device. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusLocation {
    pub bus: u8,
    pub address: u8,
    pub hidraw: Option<PathBuf>,
}

impl DeviceEntry {
    /* Combine this entry with a discovered device into a descriptor. */
    pub fn descriptor(
        &self,
        vid: u16,
        pid: u16,
        location: BusLocation,
    ) -> Result<DeviceDescriptor, DeviceError> {
        let config = &self.driver_config;
        let descriptor = DeviceDescriptor {
            id: DeviceId::from_bus(location.bus, location.address),
            name: self.name.clone(),
            driver: self.driver.clone(),
            vendor_id: vid,
            product_id: pid,
            bus: location.bus,
            address: location.address,
            interface: config.interface,
            configuration: config.configuration,
            alt_setting: config.alt_setting,
            macro_keys_len: config.macro_keys_len,
            media_keys_len: config.media_keys_len,
            lcd_keys_len: config.lcd_keys_len,
            capabilities: config.capabilities,
            hidraw: location.hidraw,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

/* Device database: maps `(bustype, vid, pid)` to a `DeviceEntry`. */
pub type DeviceDb = HashMap<(String, u16, u16), DeviceEntry>;

/* Load all `.device` files from the given directory into a lookup table. */
/*  */
/* Each `DeviceMatch` pattern (semicolon-separated in the file) becomes */
/* a separate key in the returned map, all pointing to the same `DeviceEntry`. */
pub fn load_device_database(data_dir: &Path) -> DeviceDb {
    let mut db = HashMap::new();

    let entries = match std::fs::read_dir(data_dir) {
        Ok(e) => e,
        Err(err) => {
            warn!("Failed to read device data directory {:?}: {}", data_dir, err);
            return db;
        }
    };

    for dir_entry in entries.flatten() {
        let path = dir_entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("device") {
            continue;
        }

        match parse_device_file(&path) {
            Ok(entry) => {
                for m in &entry.matches {
                    db.insert((m.bustype.clone(), m.vid, m.pid), entry.clone());
                }
                debug!(
                    "Loaded device: {} ({} match patterns)",
                    entry.name,
                    entry.matches.len()
                );
            }
            Err(err) => {
                warn!("Failed to parse {:?}: {}", path, err);
            }
        }
    }

    debug!("Device database loaded: {} entries", db.len());
    db
}

/* `;` separates list items in `.device` files, so only `#` starts a comment. */
fn device_ini() -> Ini {
    let mut ini = Ini::new();
    ini.set_comment_symbols(&['#']);
    ini
}

fn parse_device_file(path: &Path) -> Result<DeviceEntry, String> {
    let mut ini = device_ini();
    ini.load(path).map_err(|e| format!("INI parse error: {}", e))?;
    parse_device_ini(&ini)
}

/* Parse one `.device` INI document into a `DeviceEntry`. */
fn parse_device_ini(ini: &Ini) -> Result<DeviceEntry, String> {
    /* [Device] section: required fields */
    let name = ini.get("device", "name").ok_or("Missing [Device] Name")?;
    let driver = ini.get("device", "driver").ok_or("Missing [Device] Driver")?;
    let match_str = ini
        .get("device", "devicematch")
        .ok_or("Missing [Device] DeviceMatch")?;

    /* Parse semicolon-separated match patterns: "usb:046d:c22d;usb:046d:c22e" */
    let matches = parse_device_matches(&match_str)?;

    /* [Driver/xxx] section: required for keyboards, it carries the USB layout */
    let driver_section = format!("driver/{}", driver);
    if ini.get(&driver_section, "interface").is_none() {
        return Err(format!("Missing [Driver/{}] Interface", driver));
    }
    let driver_config = parse_driver_config(ini, &driver_section)?;

    Ok(DeviceEntry {
        name,
        driver,
        matches,
        driver_config,
    })
}

/* Parse a `DeviceMatch` string like `"usb:046d:c22d;usb:046d:c22e"`. */
fn parse_device_matches(s: &str) -> Result<Vec<DeviceMatch>, String> {
    let mut matches = Vec::new();

    for part in s.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        let segments: Vec<&str> = part.split(':').collect();
        if segments.len() != 3 {
            return Err(format!("Invalid DeviceMatch pattern: {}", part));
        }

        let bustype = segments[0].to_string();
        let vid = u16::from_str_radix(segments[1], 16)
            .map_err(|e| format!("Invalid VID in '{}': {}", part, e))?;
        let pid = u16::from_str_radix(segments[2], 16)
            .map_err(|e| format!("Invalid PID in '{}': {}", part, e))?;

        matches.push(DeviceMatch { bustype, vid, pid });
    }

    if matches.is_empty() {
        return Err("DeviceMatch is empty".to_string());
    }

    Ok(matches)
}

/* A numeric key of the `[Driver/xxx]` section, `default` when absent. */
fn parse_number<T: std::str::FromStr>(
    ini: &Ini,
    section: &str,
    key: &str,
    default: T,
) -> Result<T, String> {
    match ini.get(section, key) {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| format!("Invalid value '{}' for {}", v, key)),
        None => Ok(default),
    }
}

/* Parse the `[Driver/xxx]` section. */
fn parse_driver_config(ini: &Ini, section: &str) -> Result<DriverConfig, String> {
    let defaults = DriverConfig::default();
    let capabilities = match ini.get(section, "capabilities") {
        Some(caps) => Capabilities::parse(&caps)?,
        None => defaults.capabilities,
    };

    Ok(DriverConfig {
        interface: parse_number(ini, section, "interface", defaults.interface)?,
        configuration: parse_number(ini, section, "configuration", defaults.configuration)?,
        alt_setting: parse_number(ini, section, "altsetting", defaults.alt_setting)?,
        macro_keys_len: parse_number(ini, section, "macrokeyslength", defaults.macro_keys_len)?,
        media_keys_len: parse_number(ini, section, "mediakeyslength", defaults.media_keys_len)?,
        lcd_keys_len: parse_number(ini, section, "lcdkeyslength", defaults.lcd_keys_len)?,
        capabilities,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const G510_DEVICE: &str = "\
[Device]
Name=Logitech G510 Gaming Keyboard
Driver=logitech_g510
DeviceMatch=usb:046d:c22d

[Driver/logitech_g510]
Interface=1
Configuration=1
AltSetting=0
MacroKeysLength=5
MediaKeysLength=2
LcdKeysLength=5
Capabilities=backlight;macro-keys;media-keys;lcd-screen
";

    fn parse_str(contents: &str) -> Result<DeviceEntry, String> {
        let mut ini = device_ini();
        ini.read(contents.to_string())?;
        parse_device_ini(&ini)
    }

    #[test]
    fn test_parse_device_matches_single() {
        let matches = parse_device_matches("usb:046d:c22d").unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].bustype, "usb");
        assert_eq!(matches[0].vid, 0x046d);
        assert_eq!(matches[0].pid, 0xc22d);
    }

    #[test]
    fn test_parse_device_matches_multiple() {
        let matches = parse_device_matches("usb:046d:c22d;usb:046d:c22e").unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].pid, 0xc22d);
        assert_eq!(matches[1].pid, 0xc22e);
    }

    #[test]
    fn test_parse_device_matches_invalid() {
        assert!(parse_device_matches("usb:046d").is_err());
        assert!(parse_device_matches("").is_err());
    }

    #[test]
    fn test_parse_g510_entry() {
        let entry = parse_str(G510_DEVICE).unwrap();
        assert_eq!(entry.driver, "logitech_g510");
        assert_eq!(entry.driver_config.interface, 1);
        assert_eq!(entry.driver_config.macro_keys_len, 5);
        assert_eq!(entry.driver_config.media_keys_len, 2);
        assert!(entry.driver_config.capabilities.contains(Capabilities::LCD_SCREEN));

        let descriptor = entry
            .descriptor(
                0x046d,
                0xc22d,
                BusLocation {
                    bus: 3,
                    address: 7,
                    hidraw: None,
                },
            )
            .unwrap();
        assert_eq!(descriptor.id.as_str(), "b003d007");
        assert_eq!(descriptor.lcd_keys_len, 5);
    }

    #[test]
    fn test_missing_driver_section_is_rejected() {
        let contents = "[Device]\nName=X\nDriver=logitech_g510\nDeviceMatch=usb:046d:c22d\n";
        assert!(parse_str(contents).is_err());
    }

    #[test]
    fn test_bad_values_are_rejected() {
        let bad_caps = G510_DEVICE.replace("lcd-screen", "touchpad");
        assert!(parse_str(&bad_caps).is_err());

        let bad_len = G510_DEVICE.replace("MacroKeysLength=5", "MacroKeysLength=five");
        assert!(parse_str(&bad_len).is_err());
    }

    #[test]
    fn test_descriptor_validation_applies() {
        let oversized = G510_DEVICE.replace("MacroKeysLength=5", "MacroKeysLength=64");
        let entry = parse_str(&oversized).unwrap();
        let location = BusLocation {
            bus: 1,
            address: 2,
            hidraw: None,
        };
        assert!(matches!(
            entry.descriptor(0x046d, 0xc22d, location),
            Err(DeviceError::MalformedDescriptor { .. })
        ));
    }

    #[test]
    fn test_shipped_device_files_parse() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("data/devices");
        let db = load_device_database(&dir);
        assert!(db.contains_key(&("usb".to_string(), 0x046d, 0xc22d)));
        assert!(db.contains_key(&("usb".to_string(), 0x046d, 0xc22e)));
    }
}
