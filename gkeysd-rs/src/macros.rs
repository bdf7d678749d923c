/* Macro recording, repair and replay, plus the per-device G-key banks. */
use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::device::Bank;
use crate::keys::{EventKind, Key};

/* Hard cap on the number of events in a macro. */
pub const MACRO_MAX_SIZE: usize = 50;
/* Cap on press events, so every recorded press still has room for its release. */
pub const MACRO_MAX_PRESSES: usize = MACRO_MAX_SIZE / 2;
/* Intervals are clamped to this many milliseconds. */
pub const MACRO_MAX_INTERVAL_MS: u16 = 1000;

/* One recorded key event. `interval` is the delay in ms since the previous
 * event of the macro. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEvent {
    pub code: u8,
    pub event: EventKind,
    pub interval: u16,
}

impl KeyEvent {
    pub fn press(code: u8, interval: u16) -> Self {
        Self {
            code,
            event: EventKind::Press,
            interval,
        }
    }

    pub fn release(code: u8, interval: u16) -> Self {
        Self {
            code,
            event: EventKind::Release,
            interval,
        }
    }

    fn is_press(&self) -> bool {
        self.event == EventKind::Press
    }
}

pub type Macro = Vec<KeyEvent>;

/* Clamp an elapsed duration to a macro interval. */
pub fn interval_ms(elapsed: Duration) -> u16 {
    elapsed
        .as_millis()
        .min(u128::from(MACRO_MAX_INTERVAL_MS)) as u16
}

/* Accumulates events while the keyboard is in macro-record mode. */
#[derive(Debug, Default)]
pub struct MacroRecorder {
    events: Macro,
    presses: usize,
}

impl MacroRecorder {
    /* Append `event` unless a cap is reached. Releases are still accepted once
     * the press cap is hit, so nothing stays stuck down. Returns whether the
     * event was kept. */
    pub fn record_append(&mut self, event: KeyEvent) -> bool {
        if self.events.len() >= MACRO_MAX_SIZE {
            debug!("Macro full, dropping {:?}", event);
            return false;
        }
        if event.is_press() {
            if self.presses >= MACRO_MAX_PRESSES {
                debug!("Macro press limit reached, dropping {:?}", event);
                return false;
            }
            self.presses += 1;
        }
        self.events.push(event);
        true
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.presses = 0;
    }

    /* Hand over the recorded events, leaving the recorder empty. */
    pub fn take(&mut self) -> Macro {
        self.presses = 0;
        std::mem::take(&mut self.events)
    }
}

/* For each press, the index of the first later unconsumed release of the
 * same keycode. Unmatched presses map to `None`. Also returns which
 * releases were consumed. */
fn match_presses(events: &[KeyEvent]) -> (Vec<(usize, Option<usize>)>, Vec<bool>) {
    let mut consumed = vec![false; events.len()];
    let mut pairs = Vec::new();

    for (pi, press) in events.iter().enumerate().filter(|(_, e)| e.is_press()) {
        let release = events
            .iter()
            .enumerate()
            .skip(pi + 1)
            .find(|(ri, e)| !e.is_press() && e.code == press.code && !consumed[*ri])
            .map(|(ri, _)| ri);
        if let Some(ri) = release {
            consumed[ri] = true;
        }
        pairs.push((pi, release));
    }

    (pairs, consumed)
}

/* Repair a recorded macro:
 * - every press without a later release gets a synthetic 1 ms release
 *   appended at the end;
 * - releases not matching an earlier press are removed;
 * - if still too large, trailing press/release pairs are dropped, then the
 *   macro is truncated. */
pub fn check_macro(mut events: Macro) -> Macro {
    let (pairs, consumed) = match_presses(&events);

    let mut synthetic = Vec::new();
    for (pi, release) in &pairs {
        if release.is_none() {
            debug!("Adding missing release for keycode {}", events[*pi].code);
            synthetic.push(KeyEvent::release(events[*pi].code, 1));
        }
    }

    /* Redundant releases, removed back to front so earlier indices hold. */
    let redundant: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(i, e)| !e.is_press() && !consumed[*i])
        .map(|(i, _)| i)
        .collect();
    for i in redundant.into_iter().rev() {
        debug!("Removing redundant release at {}: {:?}", i, events[i]);
        events.remove(i);
    }

    events.extend(synthetic);

    while events.len() > MACRO_MAX_SIZE {
        let (pairs, _) = match_presses(&events);
        let Some((pi, Some(ri))) = pairs.into_iter().filter(|(_, r)| r.is_some()).last() else {
            break;
        };
        events.remove(ri);
        events.remove(pi);
    }

    if events.len() > MACRO_MAX_SIZE {
        warn!("Macro still too large after repair, truncating");
        events.truncate(MACRO_MAX_SIZE);
    }

    events
}

/* Performs synthetic key injection. */
pub trait KeyInjector: Send + Sync {
    fn inject(&self, event: &KeyEvent) -> anyhow::Result<()>;
}

/* Replay `events` in order, honouring the recorded intervals. */
pub fn run(events: &[KeyEvent], injector: &dyn KeyInjector) -> anyhow::Result<()> {
    for event in events {
        if event.interval > 0 {
            std::thread::sleep(Duration::from_millis(u64::from(event.interval)));
        }
        injector.inject(event)?;
    }
    Ok(())
}

/* What a G-key does in a given bank. */
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum GKeyEvent {
    #[default]
    Inactive,
    Macro(Macro),
    Command(String),
}

/* G-key assignments for every bank of a device. */
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroBanks {
    #[serde(default)]
    banks: HashMap<Bank, HashMap<Key, GKeyEvent>>,
}

impl MacroBanks {
    /* Parse a JSON snapshot, repairing every macro it carries. */
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let mut banks: MacroBanks = serde_json::from_str(json)?;
        for keys in banks.banks.values_mut() {
            keys.retain(|k, _| k.is_gkey());
            for event in keys.values_mut() {
                if let GKeyEvent::Macro(m) = event {
                    *m = check_macro(std::mem::take(m));
                }
            }
        }
        Ok(banks)
    }

    pub fn get(&self, bank: Bank, gkey: Key) -> &GKeyEvent {
        static INACTIVE: GKeyEvent = GKeyEvent::Inactive;
        self.banks
            .get(&bank)
            .and_then(|keys| keys.get(&gkey))
            .unwrap_or(&INACTIVE)
    }

    /* Store a recorded macro; an empty one clears the assignment. */
    pub fn set_macro(&mut self, bank: Bank, gkey: Key, events: Macro) {
        let keys = self.banks.entry(bank).or_default();
        if events.is_empty() {
            keys.remove(&gkey);
        } else {
            keys.insert(gkey, GKeyEvent::Macro(events));
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::*;

    /* Injector that just remembers what it was asked to type. */
    #[derive(Default)]
    pub(crate) struct RecordingInjector {
        pub events: Mutex<Vec<KeyEvent>>,
    }

    impl KeyInjector for RecordingInjector {
        fn inject(&self, event: &KeyEvent) -> anyhow::Result<()> {
            self.events.lock().push(*event);
            Ok(())
        }
    }

    fn press(code: u8) -> KeyEvent {
        KeyEvent::press(code, 10)
    }

    fn release(code: u8) -> KeyEvent {
        KeyEvent::release(code, 10)
    }

    /* Every press has a later release of the same code, counts balance. */
    fn assert_balanced(events: &[KeyEvent]) {
        let mut down: HashMap<u8, i32> = HashMap::new();
        for e in events {
            let count = down.entry(e.code).or_default();
            match e.event {
                EventKind::Press => *count += 1,
                EventKind::Release => {
                    *count -= 1;
                    assert!(*count >= 0, "release of {} before its press", e.code);
                }
            }
        }
        assert!(down.values().all(|c| *c == 0), "unbalanced macro: {events:?}");
    }

    #[test]
    fn test_interval_is_clamped() {
        assert_eq!(interval_ms(Duration::from_millis(250)), 250);
        assert_eq!(interval_ms(Duration::from_secs(5)), MACRO_MAX_INTERVAL_MS);
    }

    #[test]
    fn test_press_cap_keeps_releases() {
        let mut recorder = MacroRecorder::default();
        for code in 0..MACRO_MAX_PRESSES as u8 {
            assert!(recorder.record_append(press(code)));
        }
        assert!(!recorder.record_append(press(200)));
        assert_eq!(recorder.len(), MACRO_MAX_PRESSES);
        assert!(recorder.record_append(release(0)));
        assert_eq!(recorder.len(), MACRO_MAX_PRESSES + 1);
    }

    #[test]
    fn test_full_macro_accepts_nothing() {
        let mut recorder = MacroRecorder::default();
        for code in 0..MACRO_MAX_PRESSES as u8 {
            recorder.record_append(press(code));
        }
        for code in 0..(MACRO_MAX_SIZE - MACRO_MAX_PRESSES) as u8 {
            assert!(recorder.record_append(release(code)));
        }
        assert_eq!(recorder.len(), MACRO_MAX_SIZE);
        assert!(!recorder.record_append(release(1)));
        assert!(!recorder.record_append(press(1)));
    }

    #[test]
    fn test_take_resets_recorder() {
        let mut recorder = MacroRecorder::default();
        recorder.record_append(press(30));
        let events = recorder.take();
        assert_eq!(events.len(), 1);
        assert!(recorder.is_empty());
    }

    #[test]
    fn test_check_macro_appends_missing_release() {
        let repaired = check_macro(vec![press(30), press(48), release(30)]);
        assert_eq!(
            repaired,
            vec![press(30), press(48), release(30), KeyEvent::release(48, 1)]
        );
        assert_balanced(&repaired);
    }

    #[test]
    fn test_check_macro_removes_redundant_releases() {
        let repaired = check_macro(vec![
            release(42),
            press(30),
            release(30),
            release(30),
            release(57),
        ]);
        assert_eq!(repaired, vec![press(30), release(30)]);
    }

    #[test]
    fn test_check_macro_release_before_press_is_redundant() {
        let repaired = check_macro(vec![release(30), press(30)]);
        assert_eq!(repaired, vec![press(30), KeyEvent::release(30, 1)]);
    }

    #[test]
    fn test_check_macro_is_idempotent() {
        let input = vec![
            press(29),
            press(30),
            release(48),
            release(29),
            press(30),
            release(30),
        ];
        let once = check_macro(input);
        assert_balanced(&once);
        let twice = check_macro(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_check_macro_trims_oversized_macro() {
        let mut input = Vec::new();
        for code in 0..30u8 {
            input.push(press(code));
            input.push(release(code));
        }
        let repaired = check_macro(input);
        assert_eq!(repaired.len(), MACRO_MAX_SIZE);
        assert_balanced(&repaired);
        /* the tail pairs went first */
        assert_eq!(repaired.last().unwrap().code, 24);
    }

    #[test]
    fn test_check_macro_empty() {
        assert!(check_macro(Vec::new()).is_empty());
    }

    #[test]
    fn test_run_replays_in_order() {
        let injector = RecordingInjector::default();
        let events = vec![KeyEvent::press(30, 0), KeyEvent::release(30, 1)];
        run(&events, &injector).unwrap();
        assert_eq!(*injector.events.lock(), events);

        let injector = RecordingInjector::default();
        run(&[], &injector).unwrap();
        assert!(injector.events.lock().is_empty());
    }

    #[test]
    fn test_banks_set_and_clear_macro() {
        let mut banks = MacroBanks::default();
        assert_eq!(banks.get(Bank::M1, Key::G1), &GKeyEvent::Inactive);

        banks.set_macro(Bank::M1, Key::G1, vec![press(30), release(30)]);
        assert!(matches!(banks.get(Bank::M1, Key::G1), GKeyEvent::Macro(m) if m.len() == 2));
        assert_eq!(banks.get(Bank::M2, Key::G1), &GKeyEvent::Inactive);

        banks.set_macro(Bank::M1, Key::G1, Vec::new());
        assert_eq!(banks.get(Bank::M1, Key::G1), &GKeyEvent::Inactive);
    }

    #[test]
    fn test_banks_from_json() {
        let json = r#"{
            "banks": {
                "M2": {
                    "G3": { "type": "macro", "value": [
                        { "code": 30, "event": "Press", "interval": 0 }
                    ] },
                    "G4": { "type": "command", "value": "xterm" },
                    "M1": { "type": "command", "value": "ignored" }
                }
            }
        }"#;
        let banks = MacroBanks::from_json(json).unwrap();
        assert_eq!(
            banks.get(Bank::M2, Key::G3),
            &GKeyEvent::Macro(vec![KeyEvent::press(30, 0), KeyEvent::release(30, 1)])
        );
        assert_eq!(banks.get(Bank::M2, Key::G4), &GKeyEvent::Command("xterm".into()));
        assert_eq!(banks.get(Bank::M2, Key::M1), &GKeyEvent::Inactive);
        assert!(MacroBanks::from_json("{ not json").is_err());
    }
}
