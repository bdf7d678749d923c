pub mod logitech_g510;

use tracing::warn;

use crate::device::{Color, DeviceDescriptor};
use crate::error::DeviceError;
use crate::keys::ReportMap;

/* Logical M-key LED mask, translated to hardware bits per model. */
pub type LedsMask = u8;

pub const LED_M1: LedsMask = 1 << 0;
pub const LED_M2: LedsMask = 1 << 1;
pub const LED_M3: LedsMask = 1 << 2;
pub const LED_MR: LedsMask = 1 << 3;
pub const LEDS_MKEYS: LedsMask = LED_M1 | LED_M2 | LED_M3;

/* Static, model-specific knowledge: decode tables, device requests and
 * defaults. The engine dispatches on these values rather than on
 * per-model code. */
#[derive(Debug)]
pub struct KeyboardModel {
    pub name: &'static str,
    pub products: &'static [(u16, u16)],
    pub macro_keys: Option<&'static ReportMap>,
    pub media_keys: Option<&'static ReportMap>,
    pub lcd_keys: Option<&'static ReportMap>,
    /* Feature reports sent once right after opening. */
    pub init_reports: &'static [&'static [u8]],
    pub leds_report_id: u8,
    pub led_bits: [(LedsMask, u8); 4],
    pub color_report_id: u8,
    pub default_color: Color,
}

impl KeyboardModel {
    pub fn supports(&self, vendor_id: u16, product_id: u16) -> bool {
        self.products.contains(&(vendor_id, product_id))
    }

    /* Report maps applicable to `descriptor`, gated by its capabilities and
     * its declared report lengths. */
    pub fn report_maps(&self, descriptor: &DeviceDescriptor) -> Vec<&'static ReportMap> {
        [
            (self.macro_keys, descriptor.macro_keys_len),
            (self.media_keys, descriptor.media_keys_len),
            (self.lcd_keys, descriptor.lcd_keys_len),
        ]
        .into_iter()
        .filter_map(|(map, len)| map.filter(|m| len != 0 && m.len == len))
        .collect()
    }

    pub fn leds_report(&self, leds: LedsMask) -> Vec<u8> {
        let hw = self
            .led_bits
            .iter()
            .filter(|(logical, _)| leds & logical != 0)
            .fold(0u8, |acc, (_, bit)| acc | bit);
        vec![self.leds_report_id, hw]
    }

    pub fn color_report(&self, color: Color) -> Vec<u8> {
        vec![self.color_report_id, color.red, color.green, color.blue]
    }
}

/* One loaded driver: a model family advertised under a driver id. */
#[derive(Debug, Clone, Copy)]
pub struct KeyboardDriver {
    pub id: &'static str,
    pub models: &'static [&'static KeyboardModel],
}

impl KeyboardDriver {
    /* The model handling `descriptor`, if this driver supports it. */
    pub fn model_for(
        &self,
        descriptor: &DeviceDescriptor,
    ) -> Result<&'static KeyboardModel, DeviceError> {
        self.models
            .iter()
            .copied()
            .find(|m| m.supports(descriptor.vendor_id, descriptor.product_id))
            .ok_or_else(|| DeviceError::UnsupportedModel {
                driver: self.id.to_string(),
                vendor_id: descriptor.vendor_id,
                product_id: descriptor.product_id,
            })
    }
}

static LOGITECH_G510_MODELS: [&KeyboardModel; 1] = [&logitech_g510::G510];

/* All drivers compiled into the daemon. */
pub fn loaded_drivers() -> Vec<KeyboardDriver> {
    vec![KeyboardDriver {
        id: "logitech_g510",
        models: &LOGITECH_G510_MODELS,
    }]
}

/* Find the driver for the driver id of a `.device` entry. */
pub fn find_driver<'a>(
    drivers: &'a [KeyboardDriver],
    driver_id: &str,
) -> Option<&'a KeyboardDriver> {
    let driver = drivers.iter().find(|d| d.id == driver_id);
    if driver.is_none() {
        warn!("Unknown driver: {driver_id}");
    }
    driver
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_descriptor;

    #[test]
    fn test_find_driver() {
        let drivers = loaded_drivers();
        assert!(find_driver(&drivers, "logitech_g510").is_some());
        assert!(find_driver(&drivers, "roccat").is_none());
    }

    #[test]
    fn test_model_for_descriptor() {
        let drivers = loaded_drivers();
        let driver = find_driver(&drivers, "logitech_g510").unwrap();
        let mut descriptor = test_descriptor(1, 2);
        assert_eq!(driver.model_for(&descriptor).unwrap().name, "Logitech G510/G510s");

        descriptor.product_id = 0xc24a;
        assert!(matches!(
            driver.model_for(&descriptor),
            Err(DeviceError::UnsupportedModel {
                product_id: 0xc24a,
                ..
            })
        ));
    }

    #[test]
    fn test_report_maps_follow_descriptor_lengths() {
        let descriptor = test_descriptor(1, 2);
        assert_eq!(logitech_g510::G510.report_maps(&descriptor).len(), 3);

        let mut no_media = test_descriptor(1, 2);
        no_media.media_keys_len = 0;
        let maps = logitech_g510::G510.report_maps(&no_media);
        assert_eq!(maps.len(), 2);
        assert!(maps.iter().all(|m| m.len == 5));
    }
}
