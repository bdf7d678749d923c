/* The listening thread: reads key reports, keeps the M-key LEDs and bank in
 * sync, records macros and turns G/media/LCD key presses into events. */
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::device::{Capabilities, DeviceId, KEYS_BUFFER_MAX};
use crate::driver::{LedsMask, LED_M1, LED_M2, LED_M3, LED_MR, LEDS_MKEYS};
use crate::engine::EngineContext;
use crate::events::DaemonEvent;
use crate::keys::{self, Key, KeysMask, ReportMap, GKEYS_MASK, MKEYS_MASK, STANDARD_REPORT_LEN};
use crate::macros::{check_macro, interval_ms, GKeyEvent, KeyEvent};
use crate::runtime::{bank_from_leds, DeviceRuntime};
use crate::transport::ReadStatus;

/* Upper bound on how long a stop request waits for the listening thread. */
pub const KEYS_READ_TIMEOUT: Duration = Duration::from_millis(10);

/* Linux KEY_RESERVED, what HID error usages translate to. */
const KEY_RESERVED: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Listening,
    Recording,
}

/* M-key presses applied to an LED mask. Pressing an unlit M-key lights it
 * alone, pressing the lit one turns every bank LED off. MR toggles on its
 * own. */
pub fn toggle_leds(leds: LedsMask, pressed: KeysMask) -> LedsMask {
    let mut leds = leds;
    for (key, led) in [(Key::M1, LED_M1), (Key::M2, LED_M2), (Key::M3, LED_M3)] {
        if pressed & key.bit() != 0 {
            leds = if leds & led != 0 {
                leds & !LEDS_MKEYS
            } else {
                (leds & !LEDS_MKEYS) | led
            };
        }
    }
    if pressed & Key::MR.bit() != 0 {
        leds ^= LED_MR;
    }
    leds
}

pub struct Listener {
    id: DeviceId,
    maps: Vec<&'static ReportMap>,
    mode: Mode,
}

/* Thread body. The runtime is looked up again on every iteration; the
 * thread ends once it is gone or asked to stop. */
pub(crate) fn listen(ctx: EngineContext, id: DeviceId, mut listener: Listener) {
    debug!("{id}: listening thread running");
    loop {
        let Some(runtime) = ctx.arena.get(&id) else {
            debug!("{id}: device evicted");
            break;
        };
        if !runtime.threads_running() {
            break;
        }
        listener.step(&ctx, &runtime);
    }
    debug!("{id}: listening thread exiting");
}

impl Listener {
    pub fn new(id: DeviceId, maps: Vec<&'static ReportMap>) -> Self {
        Self {
            id,
            maps,
            mode: Mode::Listening,
        }
    }

    #[cfg(test)]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /* One bounded read and everything that follows from it. */
    pub fn step(&mut self, ctx: &EngineContext, runtime: &DeviceRuntime) {
        if runtime.take_macro_record_exit() && self.mode == Mode::Recording {
            info!("{}: macro record mode cancelled", self.id);
            self.leave_recording(runtime);
            return;
        }

        let mut buf = [0u8; KEYS_BUFFER_MAX];
        let read = runtime.with_transport(|h| h.read_keys_interrupt(&mut buf, KEYS_READ_TIMEOUT));
        let len = match read {
            None => {
                thread::sleep(KEYS_READ_TIMEOUT);
                return;
            }
            Some(Ok(ReadStatus::Timeout)) | Some(Ok(ReadStatus::Data(0))) => return,
            Some(Ok(ReadStatus::Data(n))) => n.min(KEYS_BUFFER_MAX),
            Some(Err(e)) => {
                runtime.record_fatal_error(&e);
                return;
            }
        };
        let report = &buf[..len];
        debug!("{}: RX {} bytes: {:02x?}", self.id, len, report);

        if len == STANDARD_REPORT_LEN {
            self.handle_standard_keys(runtime, report);
            return;
        }

        let mask = match keys::decode(report, &self.maps) {
            Ok(mask) => mask,
            Err(anomaly) => {
                warn!("{}: discarding report: {anomaly}", self.id);
                return;
            }
        };
        let newly = self.update_pressed(runtime, len, mask);

        let descriptor = &runtime.descriptor;
        if len == descriptor.macro_keys_len {
            self.handle_macro_keys(ctx, runtime, newly);
        }
        if len == descriptor.media_keys_len {
            self.handle_media_keys(ctx, newly);
        }
        if len == descriptor.lcd_keys_len && descriptor.has(Capabilities::LCD_SCREEN) {
            if let Some(key) = keys::keys_in(newly).find(|k| k.is_lcd_key()) {
                runtime.lcd.lock().pending_key = Some(key);
            }
        }
    }

    /* Replace the recognized keys of this report shape and return the ones
     * that just went down. */
    fn update_pressed(&self, runtime: &DeviceRuntime, len: usize, mask: KeysMask) -> KeysMask {
        let shape = self
            .maps
            .iter()
            .filter(|m| m.len == len)
            .flat_map(|m| m.bits.iter())
            .fold(0, |acc, bit| acc | bit.key.bit());
        let mut keys = runtime.keys.lock();
        let before = keys.pressed_mask & shape;
        keys.pressed_mask = (keys.pressed_mask & !shape) | mask;
        mask & !before
    }

    fn handle_standard_keys(&self, runtime: &DeviceRuntime, report: &[u8]) {
        let mut keys = runtime.keys.lock();
        if self.mode == Mode::Recording {
            let (changes, anomalies) =
                keys::standard_changes(report, &keys.previous[..STANDARD_REPORT_LEN]);
            for anomaly in anomalies {
                warn!("{}: {anomaly}", self.id);
            }

            let now = Instant::now();
            let mut first = true;
            for change in changes.into_iter().filter(|c| c.code != KEY_RESERVED) {
                /* Changes seen in one poll are replayed as a tight burst. */
                let interval = if first {
                    interval_ms(now.duration_since(keys.last_event))
                } else {
                    1
                };
                first = false;
                keys.recorder.record_append(KeyEvent {
                    code: change.code,
                    event: change.kind,
                    interval,
                });
            }
            if !first {
                keys.last_event = now;
            }
        }
        keys.previous[..STANDARD_REPORT_LEN].copy_from_slice(report);
    }

    fn handle_macro_keys(&mut self, ctx: &EngineContext, runtime: &DeviceRuntime, newly: KeysMask) {
        let mkeys = newly & (MKEYS_MASK | Key::MR.bit());
        if mkeys != 0 {
            let recording = self.mode == Mode::Recording;
            let (leds, changed, switched) = {
                let mut keys = runtime.keys.lock();
                let mut leds = toggle_leds(keys.leds, mkeys);
                if recording {
                    leds &= !LED_MR;
                }
                let changed = leds != keys.leds;
                keys.leds = leds;
                let bank = bank_from_leds(leds);
                let switched = (bank != keys.bank).then_some(bank);
                keys.bank = bank;
                (leds, changed, switched)
            };

            if changed {
                if let Err(e) = runtime.write_leds(leds) {
                    runtime.record_fatal_error(&e);
                }
            }
            if let Some(bank) = switched {
                info!("{}: switched to bank {bank}", self.id);
                ctx.sink.emit(DaemonEvent::BankSwitched {
                    id: self.id.clone(),
                    bank,
                });
            }

            if recording {
                info!("{}: leaving macro record mode without assignment", self.id);
                self.mode = Mode::Listening;
                runtime.keys.lock().recorder.clear();
                return;
            }
            if leds & LED_MR != 0 {
                self.enter_recording(runtime);
                return;
            }
        }

        let gkeys = newly & GKEYS_MASK;
        if gkeys == 0 {
            return;
        }
        match self.mode {
            Mode::Recording => {
                let target = keys::keys_in(gkeys).next();
                if let Some(gkey) = target {
                    self.finish_recording(ctx, runtime, gkey);
                }
            }
            Mode::Listening => {
                for gkey in keys::keys_in(gkeys) {
                    self.gkey_pressed(ctx, runtime, gkey);
                }
            }
        }
    }

    fn handle_media_keys(&self, ctx: &EngineContext, newly: KeysMask) {
        for name in keys::keys_in(newly).filter_map(Key::media_name) {
            debug!("{}: media key {name}", self.id);
            ctx.sink.emit(DaemonEvent::MediaKeyPressed {
                id: self.id.clone(),
                key: name,
            });
        }
    }

    fn enter_recording(&mut self, runtime: &DeviceRuntime) {
        let mut keys = runtime.keys.lock();
        keys.recorder.clear();
        keys.last_event = Instant::now();
        self.mode = Mode::Recording;
        info!("{}: entering macro record mode (bank {})", self.id, keys.bank);
    }

    /* Drop out of record mode without assigning anything and turn the MR
     * LED off. */
    fn leave_recording(&mut self, runtime: &DeviceRuntime) {
        let leds = {
            let mut keys = runtime.keys.lock();
            keys.recorder.clear();
            keys.leds &= !LED_MR;
            keys.leds
        };
        self.mode = Mode::Listening;
        if let Err(e) = runtime.write_leds(leds) {
            runtime.record_fatal_error(&e);
        }
    }

    /* The target G-key was pressed: repair the recording, store it in the
     * active bank and announce it. An empty recording clears the key. */
    fn finish_recording(&mut self, ctx: &EngineContext, runtime: &DeviceRuntime, gkey: Key) {
        let (recorded, bank, leds) = {
            let mut keys = runtime.keys.lock();
            keys.leds &= !LED_MR;
            (keys.recorder.take(), keys.bank, keys.leds)
        };
        self.mode = Mode::Listening;

        let events = check_macro(recorded);
        runtime.banks.write().set_macro(bank, gkey, events.clone());

        if let Err(e) = runtime.write_leds(leds) {
            runtime.record_fatal_error(&e);
        }

        let id = self.id.clone();
        if events.is_empty() {
            info!("{id}: cleared macro on {gkey} (bank {bank})");
            ctx.sink.emit(DaemonEvent::MacroCleared { id, bank, gkey });
        } else {
            info!("{id}: recorded {} events on {gkey} (bank {bank})", events.len());
            ctx.sink.emit(DaemonEvent::MacroRecorded {
                id,
                bank,
                gkey,
                events,
            });
        }
    }

    fn gkey_pressed(&self, ctx: &EngineContext, runtime: &DeviceRuntime, gkey: Key) {
        let bank = runtime.keys.lock().bank;
        debug!("{}: {gkey} pressed (bank {bank})", self.id);
        ctx.sink.emit(DaemonEvent::GKeyPressed {
            id: self.id.clone(),
            bank,
            gkey,
        });

        let GKeyEvent::Macro(events) = runtime.banks.read().get(bank, gkey).clone() else {
            return;
        };
        /* Replays sleep between events; the worker keeps them off the
         * polling thread. */
        if !runtime.queue_macro(events) {
            debug!("{}: no key injector, {gkey} macro not replayed", self.id);
        }
    }
}
