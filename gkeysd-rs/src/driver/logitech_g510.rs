/* Logitech G510 / G510s gaming keyboard.
 *
 * 18 G-keys in three M-key banks plus a macro-record key, seven media keys,
 * five LCD keys under a 160x43 monochrome screen, and an RGB backlight.
 * The vendor interface multiplexes three report shapes on one interrupt
 * endpoint, told apart by length and leading tag byte. */
use crate::device::Color;
use crate::driver::{KeyboardModel, LED_M1, LED_M2, LED_M3, LED_MR};
use crate::keys::{Key, KeyBit, ReportMap};

/* ------------------------------------------------------------------ */
/* Protocol constants                                                   */
/* ------------------------------------------------------------------ */

pub const VENDOR_LOGITECH: u16 = 0x046d;
pub const PRODUCT_G510: u16 = 0xc22d;
pub const PRODUCT_G510S: u16 = 0xc22e;

const REPORT_TAG_MEDIA_KEYS: u8 = 0x02;
const REPORT_TAG_MACRO_KEYS: u8 = 0x03;

const REPORT_ID_MKEYS_LEDS: u8 = 0x04;
const REPORT_ID_BACKLIGHT: u8 = 0x05;

/* Hardware bits of the M-key LED report. */
const HW_LED_M1: u8 = 0x80;
const HW_LED_M2: u8 = 0x40;
const HW_LED_M3: u8 = 0x20;
const HW_LED_MR: u8 = 0x10;

/* Sent once after claiming: hands the G/M/L keys over to the host. */
const INIT_REPORTS: &[&[u8]] = &[
    &[0x01, 0x00, 0x00, 0x00],
    &[0x09, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
];

/* ------------------------------------------------------------------ */
/* Key tables                                                           */
/* ------------------------------------------------------------------ */

/* 5-byte report, tag 0x03: G-keys, M-keys and MR. */
static MACRO_KEYS_BITS: [KeyBit; 22] = [
    KeyBit::new(1, 0x01, Key::G1),
    KeyBit::new(1, 0x02, Key::G2),
    KeyBit::new(1, 0x04, Key::G3),
    KeyBit::new(1, 0x08, Key::G4),
    KeyBit::new(1, 0x10, Key::G5),
    KeyBit::new(1, 0x20, Key::G6),
    KeyBit::new(1, 0x40, Key::G7),
    KeyBit::new(1, 0x80, Key::G8),
    KeyBit::new(2, 0x01, Key::G9),
    KeyBit::new(2, 0x02, Key::G10),
    KeyBit::new(2, 0x04, Key::G11),
    KeyBit::new(2, 0x08, Key::G12),
    KeyBit::new(2, 0x10, Key::G13),
    KeyBit::new(2, 0x20, Key::G14),
    KeyBit::new(2, 0x40, Key::G15),
    KeyBit::new(2, 0x80, Key::G16),
    KeyBit::new(3, 0x01, Key::G17),
    KeyBit::new(3, 0x02, Key::G18),
    KeyBit::new(3, 0x10, Key::M1),
    KeyBit::new(3, 0x20, Key::M2),
    KeyBit::new(3, 0x40, Key::M3),
    KeyBit::new(3, 0x80, Key::MR),
];

/* Same 5-byte report, byte 4: the keys under the LCD. */
static LCD_KEYS_BITS: [KeyBit; 5] = [
    KeyBit::new(4, 0x01, Key::L1),
    KeyBit::new(4, 0x02, Key::L2),
    KeyBit::new(4, 0x04, Key::L3),
    KeyBit::new(4, 0x08, Key::L4),
    KeyBit::new(4, 0x10, Key::L5),
];

/* 2-byte report, tag 0x02. */
static MEDIA_KEYS_BITS: [KeyBit; 7] = [
    KeyBit::new(1, 0x01, Key::NextTrack),
    KeyBit::new(1, 0x02, Key::PrevTrack),
    KeyBit::new(1, 0x04, Key::Stop),
    KeyBit::new(1, 0x08, Key::PlayPause),
    KeyBit::new(1, 0x10, Key::Mute),
    KeyBit::new(1, 0x20, Key::VolumeUp),
    KeyBit::new(1, 0x40, Key::VolumeDown),
];

static MACRO_KEYS: ReportMap = ReportMap {
    len: 5,
    tag: REPORT_TAG_MACRO_KEYS,
    bits: &MACRO_KEYS_BITS,
};

static LCD_KEYS: ReportMap = ReportMap {
    len: 5,
    tag: REPORT_TAG_MACRO_KEYS,
    bits: &LCD_KEYS_BITS,
};

static MEDIA_KEYS: ReportMap = ReportMap {
    len: 2,
    tag: REPORT_TAG_MEDIA_KEYS,
    bits: &MEDIA_KEYS_BITS,
};

/* ------------------------------------------------------------------ */
/* Model                                                                */
/* ------------------------------------------------------------------ */

pub static G510: KeyboardModel = KeyboardModel {
    name: "Logitech G510/G510s",
    products: &[
        (VENDOR_LOGITECH, PRODUCT_G510),
        (VENDOR_LOGITECH, PRODUCT_G510S),
    ],
    macro_keys: Some(&MACRO_KEYS),
    media_keys: Some(&MEDIA_KEYS),
    lcd_keys: Some(&LCD_KEYS),
    init_reports: INIT_REPORTS,
    leds_report_id: REPORT_ID_MKEYS_LEDS,
    led_bits: [
        (LED_M1, HW_LED_M1),
        (LED_M2, HW_LED_M2),
        (LED_M3, HW_LED_M3),
        (LED_MR, HW_LED_MR),
    ],
    color_report_id: REPORT_ID_BACKLIGHT,
    default_color: Color::WHITE,
};
