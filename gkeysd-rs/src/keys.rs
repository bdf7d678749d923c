/* Logical keys and raw report decoding.
 *
 * Two decode paths exist:
 * - Proprietary reports (G-keys, M-keys, LCD keys, media keys) are decoded
 *   through per-model `{byte, mask, key}` tables into a `KeysMask`.
 * - The standard 8-byte boot keyboard report is diffed slot-by-slot against
 *   the previous poll to produce press/release changes (used while recording
 *   macros). */
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolAnomaly;

/* Bitmask of recognized logical keys, one bit per `Key`. */
pub type KeysMask = u64;

/* Logical keys. The discriminant is the bit index in a `KeysMask`. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Key {
    G1 = 0,
    G2,
    G3,
    G4,
    G5,
    G6,
    G7,
    G8,
    G9,
    G10,
    G11,
    G12,
    G13,
    G14,
    G15,
    G16,
    G17,
    G18,
    M1,
    M2,
    M3,
    MR,
    L1,
    L2,
    L3,
    L4,
    L5,
    NextTrack,
    PrevTrack,
    Stop,
    PlayPause,
    Mute,
    VolumeUp,
    VolumeDown,
}

impl Key {
    pub const ALL: [Key; 34] = [
        Key::G1,
        Key::G2,
        Key::G3,
        Key::G4,
        Key::G5,
        Key::G6,
        Key::G7,
        Key::G8,
        Key::G9,
        Key::G10,
        Key::G11,
        Key::G12,
        Key::G13,
        Key::G14,
        Key::G15,
        Key::G16,
        Key::G17,
        Key::G18,
        Key::M1,
        Key::M2,
        Key::M3,
        Key::MR,
        Key::L1,
        Key::L2,
        Key::L3,
        Key::L4,
        Key::L5,
        Key::NextTrack,
        Key::PrevTrack,
        Key::Stop,
        Key::PlayPause,
        Key::Mute,
        Key::VolumeUp,
        Key::VolumeDown,
    ];

    pub const fn bit(self) -> KeysMask {
        1 << self as u8
    }

    pub fn is_gkey(self) -> bool {
        self <= Key::G18
    }

    pub fn is_mkey(self) -> bool {
        matches!(self, Key::M1 | Key::M2 | Key::M3)
    }

    pub fn is_lcd_key(self) -> bool {
        (Key::L1..=Key::L5).contains(&self)
    }

    pub fn is_media_key(self) -> bool {
        self >= Key::NextTrack
    }

    /* Symbolic name announced for media keys. */
    pub fn media_name(self) -> Option<&'static str> {
        Some(match self {
            Key::NextTrack => "XF86AudioNext",
            Key::PrevTrack => "XF86AudioPrev",
            Key::Stop => "XF86AudioStop",
            Key::PlayPause => "XF86AudioPlay",
            Key::Mute => "XF86AudioMute",
            Key::VolumeUp => "XF86AudioRaiseVolume",
            Key::VolumeDown => "XF86AudioLowerVolume",
            _ => return None,
        })
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub const GKEYS_MASK: KeysMask = (1 << 18) - 1;
pub const MKEYS_MASK: KeysMask = Key::M1.bit() | Key::M2.bit() | Key::M3.bit();

/* Keys set in `mask`, lowest bit first. */
pub fn keys_in(mask: KeysMask) -> impl Iterator<Item = Key> {
    Key::ALL.into_iter().filter(move |k| mask & k.bit() != 0)
}

/* One bit of a proprietary report: `raw[byte] & mask` means `key` is down. */
#[derive(Debug, Clone, Copy)]
pub struct KeyBit {
    pub byte: usize,
    pub mask: u8,
    pub key: Key,
}

impl KeyBit {
    pub const fn new(byte: usize, mask: u8, key: Key) -> Self {
        Self { byte, mask, key }
    }
}

/* Layout of one proprietary report shape. */
#[derive(Debug)]
pub struct ReportMap {
    pub len: usize,
    pub tag: u8,
    pub bits: &'static [KeyBit],
}

/* Decode a proprietary report against every map matching its length.
 *
 * Returns an anomaly when no map has this length or when the leading tag
 * byte is not the one the map expects. */
pub fn decode(raw: &[u8], maps: &[&ReportMap]) -> Result<KeysMask, ProtocolAnomaly> {
    let mut matched = false;
    let mut keys: KeysMask = 0;

    for map in maps.iter().filter(|m| m.len == raw.len()) {
        if raw.first() != Some(&map.tag) {
            return Err(ProtocolAnomaly::UnexpectedTag {
                len: raw.len(),
                tag: raw.first().copied().unwrap_or(0),
            });
        }
        matched = true;
        for bit in map.bits {
            if raw.get(bit.byte).is_some_and(|b| b & bit.mask != 0) {
                keys |= bit.key.bit();
            }
        }
    }

    if !matched {
        return Err(ProtocolAnomaly::UnknownShape { len: raw.len() });
    }
    Ok(keys)
}

/* ------------------------------------------------------------------ */
/* Standard keyboard report                                             */
/* ------------------------------------------------------------------ */

/* Boot keyboard report: modifiers, reserved byte, six key slots. */
pub const STANDARD_REPORT_LEN: usize = 8;
const STANDARD_MODIFIERS_BYTE: usize = 0;
const STANDARD_FIRST_SLOT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Press,
    Release,
}

/* A key going down or up between two polls, as a Linux input keycode. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyChange {
    pub code: u8,
    pub kind: EventKind,
}

/* Diff the modifier byte. Bits are walked left-ctrl first, so simultaneous
 * changes come out in a stable order.
 *
 * A press of one modifier and release of another within the same report
 * cannot be told apart from two separate polls; both changes are reported
 * in bit order. */
pub fn modifier_changes(current: u8, previous: u8) -> Vec<KeyChange> {
    let mut changes = Vec::new();
    for bit in 0..8u8 {
        let mask = 1 << bit;
        let code = HID_USAGE_TO_KEYCODE[0xe0 + usize::from(bit)];
        match (previous & mask != 0, current & mask != 0) {
            (false, true) => changes.push(KeyChange {
                code,
                kind: EventKind::Press,
            }),
            (true, false) => changes.push(KeyChange {
                code,
                kind: EventKind::Release,
            }),
            _ => {}
        }
    }
    changes
}

/* Diff two standard reports: modifier changes first, then key slots from
 * left to right. Two different non-zero values in the same slot means a
 * poll was missed; that slot is reported as an anomaly and skipped. */
pub fn standard_changes(
    current: &[u8],
    previous: &[u8],
) -> (Vec<KeyChange>, Vec<ProtocolAnomaly>) {
    let mut anomalies = Vec::new();
    if current.len() < STANDARD_REPORT_LEN || previous.len() < STANDARD_REPORT_LEN {
        anomalies.push(ProtocolAnomaly::UnknownShape { len: current.len() });
        return (Vec::new(), anomalies);
    }

    let mut changes = modifier_changes(
        current[STANDARD_MODIFIERS_BYTE],
        previous[STANDARD_MODIFIERS_BYTE],
    );

    for slot in STANDARD_FIRST_SLOT..STANDARD_REPORT_LEN {
        let (now, before) = (current[slot], previous[slot]);
        match (before, now) {
            (b, n) if b == n => {}
            (0, n) => changes.push(KeyChange {
                code: HID_USAGE_TO_KEYCODE[usize::from(n)],
                kind: EventKind::Press,
            }),
            (b, 0) => changes.push(KeyChange {
                code: HID_USAGE_TO_KEYCODE[usize::from(b)],
                kind: EventKind::Release,
            }),
            (b, n) => anomalies.push(ProtocolAnomaly::SlotConflict {
                slot,
                previous: b,
                current: n,
            }),
        }
    }

    (changes, anomalies)
}

/* Linux KEY_UNKNOWN, used for HID usages with no keycode. */
const UNK: u8 = 240;

/* HID keyboard usage page -> Linux input keycode. */
#[rustfmt::skip]
pub const HID_USAGE_TO_KEYCODE: [u8; 256] = [
      0,   0,   0,   0,  30,  48,  46,  32,  18,  33,  34,  35,  23,  36,  37,  38,
     50,  49,  24,  25,  16,  19,  31,  20,  22,  47,  17,  45,  21,  44,   2,   3,
      4,   5,   6,   7,   8,   9,  10,  11,  28,   1,  14,  15,  57,  12,  13,  26,
     27,  43,  43,  39,  40,  41,  51,  52,  53,  58,  59,  60,  61,  62,  63,  64,
     65,  66,  67,  68,  87,  88,  99,  70, 119, 110, 102, 104, 111, 107, 109, 106,
    105, 108, 103,  69,  98,  55,  74,  78,  96,  79,  80,  81,  75,  76,  77,  71,
     72,  73,  82,  83,  86, 127, 116, 117, 183, 184, 185, 186, 187, 188, 189, 190,
    191, 192, 193, 194, 134, 138, 130, 132, 128, 129, 131, 137, 133, 135, 136, 113,
    115, 114, UNK, UNK, UNK, 121, UNK,  89,  93, 124,  92,  94,  95, UNK, UNK, UNK,
    122, 123,  90,  91,  85, UNK, UNK, UNK, UNK, UNK, UNK, UNK, 111, UNK, UNK, UNK,
    UNK, UNK, UNK, UNK, UNK, UNK, UNK, UNK, UNK, UNK, UNK, UNK, UNK, UNK, UNK, UNK,
    UNK, UNK, UNK, UNK, UNK, UNK, 179, 180, UNK, UNK, UNK, UNK, UNK, UNK, UNK, UNK,
    UNK, UNK, UNK, UNK, UNK, UNK, UNK, UNK, UNK, UNK, UNK, UNK, UNK, UNK, UNK, UNK,
    UNK, UNK, UNK, UNK, UNK, UNK, UNK, UNK, 111, UNK, UNK, UNK, UNK, UNK, UNK, UNK,
     29,  42,  56, 125,  97,  54, 100, 126, 164, 166, 165, 163, 161, 115, 114, 113,
    150, 158, 159, 128, 136, 177, 178, 176, 142, 152, 173, 140, UNK, UNK, UNK, UNK,
];
