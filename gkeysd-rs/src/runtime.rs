/* Mutable state of an opened keyboard, shared between its listening thread,
 * its LCD thread and the registry.
 *
 * Runtimes live in the registry's `DeviceArena`. Device threads only hold
 * a `DeviceId` and look the runtime up on every iteration, so evicting a
 * device can never leave a thread holding on to stale state. */
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::device::{Bank, Capabilities, Color, DeviceDescriptor, DeviceId, KEYS_BUFFER_MAX};
use crate::driver::{KeyboardModel, LedsMask, LED_M1, LED_M2, LED_M3, LEDS_MKEYS};
use crate::error::TransportError;
use crate::keys::{Key, KeysMask};
use crate::lcd::DEFAULT_LCD_PLUGINS_MASK;
use crate::macros::{self, KeyInjector, Macro, MacroBanks, MacroRecorder};
use crate::transport::TransportHandle;

/* Transport errors tolerated before a device stops itself. */
pub const FATAL_ERRORS_THRESHOLD: u32 = 3;

/* Key state, only touched by the listening thread and by resets. */
#[derive(Debug)]
pub struct KeysState {
    /* Last standard keyboard report, the baseline for the next diff. */
    pub previous: [u8; KEYS_BUFFER_MAX],
    /* Recognized keys currently held down. */
    pub pressed_mask: KeysMask,
    pub leds: LedsMask,
    pub bank: Bank,
    pub last_event: Instant,
    pub recorder: MacroRecorder,
}

impl Default for KeysState {
    fn default() -> Self {
        Self {
            previous: [0; KEYS_BUFFER_MAX],
            pressed_mask: 0,
            leds: 0,
            bank: Bank::None,
            last_event: Instant::now(),
            recorder: MacroRecorder::default(),
        }
    }
}

/* Bank selected by the M-key LEDs. */
pub fn bank_from_leds(leds: LedsMask) -> Bank {
    match leds & LEDS_MKEYS {
        LED_M1 => Bank::M1,
        LED_M2 => Bank::M2,
        LED_M3 => Bank::M3,
        _ => Bank::None,
    }
}

/* Guarded by the LCD lock. */
#[derive(Debug, Clone, Copy)]
pub struct LcdState {
    pub pending_key: Option<Key>,
    pub plugins_mask: u64,
}

impl Default for LcdState {
    fn default() -> Self {
        Self {
            pending_key: None,
            plugins_mask: DEFAULT_LCD_PLUGINS_MASK,
        }
    }
}

#[derive(Default)]
struct Threads {
    listener: Option<JoinHandle<()>>,
    lcd: Option<JoinHandle<()>>,
    replay: Option<JoinHandle<()>>,
}

pub struct DeviceRuntime {
    pub descriptor: DeviceDescriptor,
    pub model: &'static KeyboardModel,
    /* The per-device I/O lock. `None` once the handle has been released. */
    handle: Mutex<Option<Box<dyn TransportHandle>>>,
    io_enabled: AtomicBool,
    threads_running: AtomicBool,
    exit_macro_record: AtomicBool,
    fatal_errors: AtomicU32,
    pub keys: Mutex<KeysState>,
    pub lcd: Mutex<LcdState>,
    pub banks: Arc<RwLock<MacroBanks>>,
    color: Mutex<Color>,
    threads: Mutex<Threads>,
    /* Feeds the replay worker. `None` without an injector, or once the
     * worker has been told to finish. */
    replay: Mutex<Option<mpsc::Sender<Macro>>>,
}

impl DeviceRuntime {
    pub fn new(
        descriptor: DeviceDescriptor,
        model: &'static KeyboardModel,
        handle: Box<dyn TransportHandle>,
        banks: Arc<RwLock<MacroBanks>>,
    ) -> Self {
        Self {
            descriptor,
            model,
            handle: Mutex::new(Some(handle)),
            io_enabled: AtomicBool::new(true),
            threads_running: AtomicBool::new(true),
            exit_macro_record: AtomicBool::new(false),
            fatal_errors: AtomicU32::new(0),
            keys: Mutex::new(KeysState::default()),
            lcd: Mutex::new(LcdState::default()),
            banks,
            color: Mutex::new(model.default_color),
            threads: Mutex::new(Threads::default()),
            replay: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.descriptor.id
    }

    /* Run `f` on the transport handle under the I/O lock. Returns `None`
     * without touching the device once I/O has been stopped or the handle
     * released. */
    pub fn with_transport<T>(
        &self,
        f: impl FnOnce(&mut dyn TransportHandle) -> Result<T, TransportError>,
    ) -> Option<Result<T, TransportError>> {
        if !self.io_enabled() {
            return None;
        }
        let mut guard = self.handle.lock();
        let handle = guard.as_mut()?;
        Some(f(handle.as_mut()))
    }

    /* Send a feature report, treating stopped I/O as success. */
    pub fn send_feature_report(&self, report: &[u8]) -> Result<(), TransportError> {
        debug!("{}: feature report {:02x?}", self.id(), report);
        self.with_transport(|h| h.send_feature_report(report))
            .unwrap_or(Ok(()))
    }

    pub fn take_handle(&self) -> Option<Box<dyn TransportHandle>> {
        self.handle.lock().take()
    }

    #[cfg(test)]
    pub fn has_handle(&self) -> bool {
        self.handle.lock().is_some()
    }

    pub fn io_enabled(&self) -> bool {
        self.io_enabled.load(Ordering::Acquire)
    }

    /* The device may already be gone: never touch the handle again. */
    pub fn stop_io(&self) {
        self.io_enabled.store(false, Ordering::Release);
    }

    pub fn threads_running(&self) -> bool {
        self.threads_running.load(Ordering::Acquire)
    }

    pub fn stop_threads(&self) {
        self.threads_running.store(false, Ordering::Release);
    }

    pub fn request_macro_record_exit(&self) {
        self.exit_macro_record.store(true, Ordering::Release);
    }

    /* Consume a pending record-mode exit request. */
    pub fn take_macro_record_exit(&self) -> bool {
        self.exit_macro_record.swap(false, Ordering::AcqRel)
    }

    pub fn fatal_errors(&self) -> u32 {
        self.fatal_errors.load(Ordering::Acquire)
    }

    /* Count a transport failure. Past the threshold the device stops its
     * own threads; the registry's health check then closes it. */
    pub fn record_fatal_error(&self, err: &TransportError) {
        let count = self.fatal_errors.fetch_add(1, Ordering::AcqRel) + 1;
        warn!("{}: transport error ({count}): {err}", self.id());
        if count > FATAL_ERRORS_THRESHOLD && self.threads_running() {
            error!(
                "{}: {count} transport errors, stopping device threads",
                self.id()
            );
            self.stop_threads();
        }
    }

    pub fn color(&self) -> Color {
        *self.color.lock()
    }

    /* Record and push the backlight color. */
    pub fn set_color(&self, color: Color) -> Result<(), TransportError> {
        *self.color.lock() = color;
        if self.descriptor.has(Capabilities::BACKLIGHT) {
            self.send_feature_report(&self.model.color_report(color))?;
        }
        Ok(())
    }

    /* Push the LED mask currently held in the key state. */
    pub fn write_leds(&self, leds: LedsMask) -> Result<(), TransportError> {
        self.send_feature_report(&self.model.leds_report(leds))
    }

    /* Turn the M-key LEDs off and fall back to the `None` bank. Returns the
     * bank that was active. */
    pub fn clear_bank(&self) -> Bank {
        let mut keys = self.keys.lock();
        keys.leds = 0;
        std::mem::replace(&mut keys.bank, Bank::None)
    }

    /* Back to power-on state: M-key LEDs off, default backlight, default
     * LCD plugins. */
    pub fn reset_defaults(&self) -> Result<(), TransportError> {
        self.clear_bank();
        self.write_leds(0)?;
        self.set_color(self.model.default_color)?;
        if self.descriptor.has(Capabilities::LCD_SCREEN) {
            self.lcd.lock().plugins_mask = DEFAULT_LCD_PLUGINS_MASK;
        }
        Ok(())
    }

    pub fn set_threads(&self, listener: JoinHandle<()>, lcd: Option<JoinHandle<()>>) {
        let mut threads = self.threads.lock();
        threads.listener = Some(listener);
        threads.lcd = lcd;
    }

    /* Start the worker replaying assigned macros. Macros queued on one
     * device run one after the other, in press order. */
    pub fn start_replay(&self, injector: Arc<dyn KeyInjector>) -> std::io::Result<()> {
        let (tx, rx) = mpsc::channel::<Macro>();
        let id = self.id().clone();
        let worker = thread::Builder::new()
            .name(format!("{id}-replay"))
            .spawn(move || {
                for events in rx {
                    if let Err(e) = macros::run(&events, injector.as_ref()) {
                        warn!("{id}: macro replay failed: {e:#}");
                    }
                }
                debug!("{id}: replay worker exiting");
            })?;
        *self.replay.lock() = Some(tx);
        self.threads.lock().replay = Some(worker);
        Ok(())
    }

    /* Hand a macro to the replay worker. False when there is none. */
    pub fn queue_macro(&self, events: Macro) -> bool {
        match self.replay.lock().as_ref() {
            Some(tx) => tx.send(events).is_ok(),
            None => false,
        }
    }

    /* Wait for the device threads, listener first, replay worker last. The
     * stop flag must have been raised already. The replay worker finishes
     * the macros already queued. A thread never joins itself. */
    pub fn join_threads(&self) {
        let (listener, lcd) = {
            let mut threads = self.threads.lock();
            (threads.listener.take(), threads.lcd.take())
        };
        self.join_each([("listening", listener), ("LCD", lcd)]);

        /* Closing the queue ends the worker's loop. */
        self.replay.lock().take();
        let replay = self.threads.lock().replay.take();
        self.join_each([("replay", replay)]);
    }

    fn join_each<const N: usize>(&self, handles: [(&str, Option<JoinHandle<()>>); N]) {
        for (name, handle) in handles {
            let Some(handle) = handle else { continue };
            if handle.thread().id() == thread::current().id() {
                warn!("{}: not joining {name} thread from itself", self.id());
                continue;
            }
            if handle.join().is_err() {
                error!("{}: {name} thread panicked", self.id());
            } else {
                debug!("{}: {name} thread joined", self.id());
            }
        }
    }
}

/* Every opened device, keyed by ID. Owned by the registry. */
#[derive(Default)]
pub struct DeviceArena {
    devices: RwLock<HashMap<DeviceId, Arc<DeviceRuntime>>>,
}

impl DeviceArena {
    pub fn insert(&self, runtime: Arc<DeviceRuntime>) {
        self.devices
            .write()
            .insert(runtime.id().clone(), runtime);
    }

    pub fn get(&self, id: &DeviceId) -> Option<Arc<DeviceRuntime>> {
        self.devices.read().get(id).cloned()
    }

    pub fn remove(&self, id: &DeviceId) -> Option<Arc<DeviceRuntime>> {
        self.devices.write().remove(id)
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.devices.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_descriptor;
    use crate::driver::logitech_g510::G510;
    use crate::driver::LED_MR;
    use crate::macros::KeyEvent;
    use crate::macros::tests::RecordingInjector;
    use crate::transport::Transport;
    use crate::transport::mock::MockTransport;

    fn runtime(transport: &MockTransport) -> DeviceRuntime {
        let descriptor = test_descriptor(1, 4);
        let handle = transport.open(&descriptor).unwrap();
        DeviceRuntime::new(descriptor, &G510, handle, Arc::default())
    }

    #[test]
    fn test_bank_from_leds() {
        assert_eq!(bank_from_leds(0), Bank::None);
        assert_eq!(bank_from_leds(LED_M2 | LED_MR), Bank::M2);
        assert_eq!(bank_from_leds(LED_MR), Bank::None);
    }

    #[test]
    fn test_stopped_io_skips_transport() {
        let transport = MockTransport::default();
        let runtime = runtime(&transport);
        runtime.stop_io();
        assert!(runtime.with_transport(|h| h.send_feature_report(&[1])).is_none());
        runtime.send_feature_report(&[0x04, 0]).unwrap();
        assert!(transport.state.lock().feature_reports.is_empty());
    }

    #[test]
    fn test_fatal_errors_stop_threads_past_threshold() {
        let transport = MockTransport::default();
        let runtime = runtime(&transport);
        for _ in 0..FATAL_ERRORS_THRESHOLD {
            runtime.record_fatal_error(&TransportError::Simulated);
        }
        assert!(runtime.threads_running());
        runtime.record_fatal_error(&TransportError::Simulated);
        assert!(!runtime.threads_running());
        assert_eq!(runtime.fatal_errors(), FATAL_ERRORS_THRESHOLD + 1);
    }

    #[test]
    fn test_reset_defaults_writes_leds_and_color() {
        let transport = MockTransport::default();
        let runtime = runtime(&transport);
        runtime.keys.lock().leds = LED_M1;
        runtime.lcd.lock().plugins_mask = 0;

        runtime.reset_defaults().unwrap();

        assert_eq!(runtime.keys.lock().leds, 0);
        assert_eq!(runtime.lcd.lock().plugins_mask, DEFAULT_LCD_PLUGINS_MASK);
        assert_eq!(
            transport.state.lock().feature_reports,
            vec![vec![0x04, 0x00], vec![0x05, 0xff, 0xff, 0xff]]
        );
    }

    #[test]
    fn test_clear_bank_returns_previous_bank() {
        let transport = MockTransport::default();
        let runtime = runtime(&transport);
        {
            let mut keys = runtime.keys.lock();
            keys.leds = LED_M3 | LED_MR;
            keys.bank = Bank::M3;
        }
        assert_eq!(runtime.clear_bank(), Bank::M3);
        assert_eq!(runtime.clear_bank(), Bank::None);
        assert_eq!(runtime.keys.lock().leds, 0);
    }

    #[test]
    fn test_replay_worker_runs_macros_in_queue_order() {
        let transport = MockTransport::default();
        let runtime = runtime(&transport);
        let injector = Arc::new(RecordingInjector::default());
        assert!(!runtime.queue_macro(vec![KeyEvent::press(30, 0)]));

        runtime.start_replay(injector.clone()).unwrap();
        assert!(runtime.queue_macro(vec![KeyEvent::press(30, 0), KeyEvent::release(30, 30)]));
        assert!(runtime.queue_macro(vec![KeyEvent::press(48, 0), KeyEvent::release(48, 0)]));
        runtime.join_threads();

        let codes: Vec<u8> = injector.events.lock().iter().map(|e| e.code).collect();
        assert_eq!(codes, vec![30, 30, 48, 48]);
        assert!(!runtime.queue_macro(vec![KeyEvent::press(30, 0)]));
    }

    #[test]
    fn test_arena_lookup() {
        let transport = MockTransport::default();
        let arena = DeviceArena::default();
        arena.insert(Arc::new(runtime(&transport)));
        let id = DeviceId::from_bus(1, 4);
        assert!(arena.get(&id).is_some());
        assert_eq!(arena.ids(), vec![id.clone()]);
        assert!(arena.remove(&id).is_some());
        assert!(arena.get(&id).is_none());
    }

    #[test]
    fn test_macro_record_exit_flag_is_consumed() {
        let transport = MockTransport::default();
        let runtime = runtime(&transport);
        assert!(!runtime.take_macro_record_exit());
        runtime.request_macro_record_exit();
        assert!(runtime.take_macro_record_exit());
        assert!(!runtime.take_macro_record_exit());
    }
}
