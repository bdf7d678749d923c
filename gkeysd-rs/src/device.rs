use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

/* Size of the per-device key report buffers. Every report shape a supported
 * model sends fits in it. */
pub const KEYS_BUFFER_MAX: usize = 16;

/* Stable device identifier derived from the USB bus number and address,
 * e.g. `b001d004`. */
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn from_bus(bus: u8, address: u8) -> Self {
        Self(format!("b{bus:03}d{address:03}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/* Capability bitset advertised by a device model. */
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const BACKLIGHT: Self = Self(1 << 0);
    pub const MACRO_KEYS: Self = Self(1 << 1);
    pub const MEDIA_KEYS: Self = Self(1 << 2);
    pub const LCD_SCREEN: Self = Self(1 << 3);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /* Parse a `;`-separated list such as `backlight;macro-keys;lcd-screen`. */
    pub fn parse(s: &str) -> Result<Self, String> {
        let mut caps = Self::empty();
        for name in s.split(';').map(str::trim).filter(|n| !n.is_empty()) {
            caps = caps.union(match name {
                "backlight" => Self::BACKLIGHT,
                "macro-keys" => Self::MACRO_KEYS,
                "media-keys" => Self::MEDIA_KEYS,
                "lcd-screen" => Self::LCD_SCREEN,
                other => return Err(format!("Unknown capability '{other}'")),
            });
        }
        Ok(caps)
    }
}

/* Backlight color as an RGB triplet. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl Color {
    pub const WHITE: Self = Self {
        red: 0xff,
        green: 0xff,
        blue: 0xff,
    };
}

/* M-key bank selector. `None` is the virtual bank active when no M-key LED
 * is lit. */
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Bank {
    #[default]
    None = 0,
    M1 = 1,
    M2 = 2,
    M3 = 3,
}

impl fmt::Display for Bank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Bank::None => "none",
            Bank::M1 => "M1",
            Bank::M2 => "M2",
            Bank::M3 => "M3",
        };
        f.write_str(s)
    }
}

/* Static description of a detected keyboard. Built from a device database
 * entry and the bus location reported by discovery; never mutated. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub name: String,
    pub driver: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus: u8,
    pub address: u8,
    pub interface: u8,
    pub configuration: u8,
    pub alt_setting: u8,
    /* Expected interrupt transfer lengths; 0 when the shape doesn't exist. */
    pub macro_keys_len: usize,
    pub media_keys_len: usize,
    pub lcd_keys_len: usize,
    pub capabilities: Capabilities,
    /* hidraw node of `interface`, needed by the hidapi backend only. */
    pub hidraw: Option<PathBuf>,
}

impl DeviceDescriptor {
    pub fn has(&self, cap: Capabilities) -> bool {
        self.capabilities.contains(cap)
    }

    /* Reject descriptors that would leave the engine half-working. */
    pub fn validate(&self) -> Result<(), DeviceError> {
        let malformed = |reason: String| DeviceError::MalformedDescriptor {
            id: self.id.clone(),
            reason,
        };

        for (what, len) in [
            ("macro keys", self.macro_keys_len),
            ("media keys", self.media_keys_len),
            ("LCD keys", self.lcd_keys_len),
        ] {
            if len > KEYS_BUFFER_MAX {
                return Err(malformed(format!(
                    "{what} report length {len} exceeds {KEYS_BUFFER_MAX}"
                )));
            }
        }

        if self.has(Capabilities::MACRO_KEYS) && self.macro_keys_len == 0 {
            return Err(malformed("macro keys without a report length".into()));
        }
        if self.has(Capabilities::MEDIA_KEYS) && self.media_keys_len == 0 {
            return Err(malformed("media keys without a report length".into()));
        }
        if self.has(Capabilities::LCD_SCREEN) && self.lcd_keys_len == 0 {
            return Err(malformed("LCD screen without an LCD keys report length".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_descriptor(bus: u8, address: u8) -> DeviceDescriptor {
    DeviceDescriptor {
        id: DeviceId::from_bus(bus, address),
        name: "Logitech G510 Gaming Keyboard".to_string(),
        driver: "logitech_g510".to_string(),
        vendor_id: 0x046d,
        product_id: 0xc22d,
        bus,
        address,
        interface: 1,
        configuration: 1,
        alt_setting: 0,
        macro_keys_len: 5,
        media_keys_len: 2,
        lcd_keys_len: 5,
        capabilities: Capabilities::BACKLIGHT
            .union(Capabilities::MACRO_KEYS)
            .union(Capabilities::MEDIA_KEYS)
            .union(Capabilities::LCD_SCREEN),
        hidraw: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_from_bus() {
        assert_eq!(DeviceId::from_bus(1, 4).as_str(), "b001d004");
        assert_eq!(DeviceId::from_bus(3, 112).to_string(), "b003d112");
    }

    #[test]
    fn test_parse_capabilities() {
        let caps = Capabilities::parse("backlight; lcd-screen").unwrap();
        assert!(caps.contains(Capabilities::BACKLIGHT));
        assert!(caps.contains(Capabilities::LCD_SCREEN));
        assert!(!caps.contains(Capabilities::MEDIA_KEYS));
        assert!(Capabilities::parse("backlight;rumble").is_err());
        assert_eq!(Capabilities::parse("").unwrap(), Capabilities::empty());
    }

    #[test]
    fn test_validate_descriptor() {
        let mut descriptor = test_descriptor(1, 2);
        assert!(descriptor.validate().is_ok());

        descriptor.lcd_keys_len = 0;
        assert!(matches!(
            descriptor.validate(),
            Err(DeviceError::MalformedDescriptor { .. })
        ));

        descriptor.lcd_keys_len = KEYS_BUFFER_MAX + 1;
        assert!(descriptor.validate().is_err());
    }
}
