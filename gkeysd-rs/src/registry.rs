/* Device registry: which keyboards are known and in which state, and the
 * operations moving them between states.
 *
 * A detected device is either started or stopped. Unplugged devices are
 * remembered until they come back. The runtimes of started devices live in
 * the shared `DeviceArena`; everything else is owned here. */
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::device::{Bank, Capabilities, Color, DeviceDescriptor, DeviceId};
use crate::driver::{self, KeyboardDriver, KeyboardModel};
use crate::engine::{self, EngineContext};
use crate::error::DeviceError;
use crate::events::{DaemonEvent, EventSink};
use crate::macros::{KeyInjector, MacroBanks};
use crate::runtime::{DeviceArena, DeviceRuntime};
use crate::transport::Transport;

/* Released exactly once, when the device is evicted. */
pub type WatchRelease = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Started,
    Stopped,
    Unplugged,
}

/* Snapshot returned to control clients. */
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub id: DeviceId,
    pub name: String,
    pub state: DeviceState,
    pub bank: Option<Bank>,
    pub backlight: Option<Color>,
    pub lcd_plugins_mask: Option<u64>,
    pub fatal_errors: u32,
}

struct Detected {
    descriptor: DeviceDescriptor,
    model: &'static KeyboardModel,
}

#[derive(Default)]
struct Collections {
    detected: BTreeMap<DeviceId, Detected>,
    started: BTreeSet<DeviceId>,
    stopped: BTreeSet<DeviceId>,
    unplugged: BTreeMap<DeviceId, DeviceDescriptor>,
    banks: HashMap<DeviceId, Arc<RwLock<MacroBanks>>>,
    watches: HashMap<DeviceId, WatchRelease>,
    /* Being opened or closed right now. */
    transitioning: BTreeSet<DeviceId>,
}

pub struct DeviceRegistry {
    drivers: Vec<KeyboardDriver>,
    engine: EngineContext,
    devices: Mutex<Collections>,
}

impl DeviceRegistry {
    pub fn new(
        drivers: Vec<KeyboardDriver>,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn EventSink>,
        injector: Option<Arc<dyn KeyInjector>>,
    ) -> Self {
        info!(
            "Device registry using the {} transport, {} driver(s) loaded",
            transport.name(),
            drivers.len()
        );
        Self {
            drivers,
            engine: EngineContext {
                arena: Arc::new(DeviceArena::default()),
                transport,
                sink,
                injector,
            },
            devices: Mutex::new(Collections::default()),
        }
    }

    pub fn arena(&self) -> &Arc<DeviceArena> {
        &self.engine.arena
    }

    fn emit(&self, event: DaemonEvent) {
        self.engine.sink.emit(event);
    }

    /* Accept a discovered device into the stopped set. Descriptors with no
     * matching driver or model, or that don't validate, are refused. */
    pub fn detect(&self, descriptor: DeviceDescriptor) -> Result<DeviceId, DeviceError> {
        descriptor.validate()?;
        let driver = driver::find_driver(&self.drivers, &descriptor.driver)
            .ok_or_else(|| DeviceError::UnknownDriver(descriptor.driver.clone()))?;
        let model = driver.model_for(&descriptor)?;

        let id = descriptor.id.clone();
        let mut devices = self.devices.lock();
        if devices.detected.contains_key(&id) {
            debug!("{id}: already detected");
            return Ok(id);
        }
        devices.unplugged.remove(&id);
        devices.banks.entry(id.clone()).or_default();
        devices.stopped.insert(id.clone());
        info!("{id}: detected {} ({})", descriptor.name, model.name);
        devices.detected.insert(id.clone(), Detected { descriptor, model });
        Ok(id)
    }

    /* Tie a resource to the device's lifetime in the registry. */
    #[cfg(test)]
    pub fn attach_watch(&self, id: &DeviceId, release: WatchRelease) -> Result<(), DeviceError> {
        let mut devices = self.devices.lock();
        if !devices.detected.contains_key(id) {
            return Err(DeviceError::NotFound(id.clone()));
        }
        if let Some(previous) = devices.watches.insert(id.clone(), release) {
            previous();
        }
        Ok(())
    }

    /* Device I/O runs without the collections lock. The device is marked
     * as transitioning meanwhile, so no other open or close can start on
     * it. */
    fn begin_transition(devices: &mut Collections, id: &DeviceId) -> Result<(), DeviceError> {
        if !devices.transitioning.insert(id.clone()) {
            return Err(DeviceError::InvalidState {
                id: id.clone(),
                state: "busy",
            });
        }
        Ok(())
    }

    pub fn start_device(&self, id: &DeviceId) -> Result<(), DeviceError> {
        let (descriptor, model, banks) = {
            let mut devices = self.devices.lock();
            let detected = devices
                .detected
                .get(id)
                .ok_or_else(|| DeviceError::NotFound(id.clone()))?;
            let descriptor = detected.descriptor.clone();
            let model = detected.model;
            if devices.started.contains(id) {
                return Err(DeviceError::InvalidState {
                    id: id.clone(),
                    state: "already started",
                });
            }
            Self::begin_transition(&mut devices, id)?;
            let banks = Arc::clone(devices.banks.entry(id.clone()).or_default());
            (descriptor, model, banks)
        };

        let opened = engine::open(&self.engine, descriptor, model, banks);

        let mut devices = self.devices.lock();
        if opened.is_ok() && !devices.detected.contains_key(id) {
            drop(devices);
            warn!("{id}: unplugged while starting");
            if let Err(e) = engine::close(&self.engine.arena, id, true) {
                warn!("{id}: {e}");
            }
            self.devices.lock().transitioning.remove(id);
            return Err(DeviceError::NotFound(id.clone()));
        }
        devices.transitioning.remove(id);
        opened?;
        devices.stopped.remove(id);
        devices.started.insert(id.clone());
        drop(devices);

        self.emit(DaemonEvent::DevicesStarted(vec![id.clone()]));
        Ok(())
    }

    /* Close a started device. `forced` treats the device as unreliable: no
     * further request reaches it. */
    pub fn stop_device(&self, id: &DeviceId, forced: bool) -> Result<(), DeviceError> {
        self.close_started(id, forced)?;
        self.emit(DaemonEvent::DevicesStopped(vec![id.clone()]));
        Ok(())
    }

    fn close_started(&self, id: &DeviceId, forced: bool) -> Result<(), DeviceError> {
        {
            let mut devices = self.devices.lock();
            if !devices.started.contains(id) {
                return Err(DeviceError::InvalidState {
                    id: id.clone(),
                    state: "not started",
                });
            }
            Self::begin_transition(&mut devices, id)?;
        }

        if let Err(e) = engine::close(&self.engine.arena, id, forced) {
            warn!("{id}: {e}");
        }

        let mut devices = self.devices.lock();
        devices.transitioning.remove(id);
        devices.started.remove(id);
        /* Unless it was unplugged in the meantime. */
        if devices.detected.contains_key(id) {
            devices.stopped.insert(id.clone());
        }
        Ok(())
    }

    pub fn restart_device(&self, id: &DeviceId) -> Result<(), DeviceError> {
        info!("{id}: restarting");
        self.stop_device(id, false)?;
        self.start_device(id)
    }

    /* The device left the bus. A started device is closed without any I/O,
     * since its handle may already be invalid. A device busy starting or
     * stopping only gets its I/O cut; the operation in flight finishes the
     * close. */
    pub fn evict_unplugged(&self, id: &DeviceId) -> Result<(), DeviceError> {
        let (close_now, watch) = {
            let mut devices = self.devices.lock();
            let Some(detected) = devices.detected.remove(id) else {
                return Err(DeviceError::NotFound(id.clone()));
            };
            let busy = devices.transitioning.contains(id);
            let close_now = devices.started.remove(id) && !busy;
            if close_now {
                devices.transitioning.insert(id.clone());
            }
            devices.stopped.remove(id);
            devices.unplugged.insert(id.clone(), detected.descriptor);
            (close_now, devices.watches.remove(id))
        };

        if close_now {
            if let Err(e) = engine::close(&self.engine.arena, id, true) {
                warn!("{id}: {e}");
            }
            self.devices.lock().transitioning.remove(id);
        } else if let Some(runtime) = self.engine.arena.get(id) {
            runtime.stop_io();
        }

        if let Some(release) = watch {
            debug!("{id}: releasing watch");
            release();
        }
        info!("{id}: unplugged");
        self.emit(DaemonEvent::DevicesUnplugged(vec![id.clone()]));
        Ok(())
    }

    /* Back to defaults: leave record mode, M-key LEDs off, default
     * backlight and LCD plugins. Macro banks are kept. */
    pub fn reset_device_state(&self, id: &DeviceId) -> Result<(), DeviceError> {
        let runtime = self.started_runtime(id)?;
        runtime.request_macro_record_exit();
        if runtime.clear_bank() != Bank::None {
            info!("{id}: switched to bank {}", Bank::None);
            self.emit(DaemonEvent::BankSwitched {
                id: id.clone(),
                bank: Bank::None,
            });
        }
        runtime.reset_defaults()?;
        debug!("{id}: state reset");
        Ok(())
    }

    pub fn reset_all_states(&self) {
        for id in self.started_devices() {
            if let Err(e) = self.reset_device_state(&id) {
                warn!("{id}: reset failed: {e}");
            }
        }
    }

    /* Close every started device whose threads stopped on their own, and
     * report them in a single notification. */
    pub fn health_check(&self) -> Vec<DeviceId> {
        let unhealthy: Vec<DeviceId> = {
            let devices = self.devices.lock();
            devices
                .started
                .iter()
                .filter(|id| !devices.transitioning.contains(*id))
                .filter(|id| {
                    self.engine
                        .arena
                        .get(id)
                        .is_none_or(|runtime| !runtime.threads_running())
                })
                .cloned()
                .collect()
        };

        let closed: Vec<DeviceId> = unhealthy
            .into_iter()
            .filter(|id| {
                warn!("{id}: device threads stopped, closing device");
                match self.close_started(id, true) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("{id}: {e}");
                        false
                    }
                }
            })
            .collect();

        if !closed.is_empty() {
            self.emit(DaemonEvent::DevicesStopped(closed.clone()));
        }
        closed
    }

    /* Cleanly stop everything, for daemon shutdown. */
    pub fn stop_all(&self) {
        let stopped: Vec<DeviceId> = self
            .started_devices()
            .into_iter()
            .filter(|id| match self.close_started(id, false) {
                Ok(()) => true,
                Err(e) => {
                    warn!("{id}: {e}");
                    false
                }
            })
            .collect();
        if !stopped.is_empty() {
            self.emit(DaemonEvent::DevicesStopped(stopped));
        }
    }

    pub fn set_backlight_color(&self, id: &DeviceId, color: Color) -> Result<(), DeviceError> {
        let runtime = self.started_runtime(id)?;
        if !runtime.descriptor.has(Capabilities::BACKLIGHT) {
            return Err(DeviceError::Unsupported {
                id: id.clone(),
                capability: "backlight",
            });
        }
        runtime.set_color(color)?;
        Ok(())
    }

    pub fn set_lcd_plugins_mask(&self, id: &DeviceId, mask: u64) -> Result<(), DeviceError> {
        let runtime = self.started_runtime(id)?;
        if !runtime.descriptor.has(Capabilities::LCD_SCREEN) {
            return Err(DeviceError::Unsupported {
                id: id.clone(),
                capability: "LCD screen",
            });
        }
        runtime.lcd.lock().plugins_mask = mask;
        Ok(())
    }

    /* Replace every G-key assignment of a detected device. */
    pub fn set_macros_banks(&self, id: &DeviceId, banks: MacroBanks) -> Result<(), DeviceError> {
        let devices = self.devices.lock();
        if !devices.detected.contains_key(id) {
            return Err(DeviceError::NotFound(id.clone()));
        }
        if let Some(shared) = devices.banks.get(id) {
            *shared.write() = banks;
        }
        Ok(())
    }

    pub fn started_devices(&self) -> Vec<DeviceId> {
        self.devices.lock().started.iter().cloned().collect()
    }

    pub fn stopped_devices(&self) -> Vec<DeviceId> {
        self.devices.lock().stopped.iter().cloned().collect()
    }

    pub fn unplugged_devices(&self) -> Vec<DeviceId> {
        self.devices.lock().unplugged.keys().cloned().collect()
    }

    pub fn device_status(&self, id: &DeviceId) -> Result<DeviceStatus, DeviceError> {
        let devices = self.devices.lock();
        if let Some(descriptor) = devices.unplugged.get(id) {
            return Ok(DeviceStatus {
                id: id.clone(),
                name: descriptor.name.clone(),
                state: DeviceState::Unplugged,
                bank: None,
                backlight: None,
                lcd_plugins_mask: None,
                fatal_errors: 0,
            });
        }
        let detected = devices
            .detected
            .get(id)
            .ok_or_else(|| DeviceError::NotFound(id.clone()))?;

        let runtime = devices
            .started
            .contains(id)
            .then(|| self.engine.arena.get(id))
            .flatten();
        let status = match runtime {
            Some(runtime) => DeviceStatus {
                id: id.clone(),
                name: detected.descriptor.name.clone(),
                state: DeviceState::Started,
                bank: Some(runtime.keys.lock().bank),
                backlight: runtime
                    .descriptor
                    .has(Capabilities::BACKLIGHT)
                    .then(|| runtime.color()),
                lcd_plugins_mask: runtime
                    .descriptor
                    .has(Capabilities::LCD_SCREEN)
                    .then(|| runtime.lcd.lock().plugins_mask),
                fatal_errors: runtime.fatal_errors(),
            },
            None => DeviceStatus {
                id: id.clone(),
                name: detected.descriptor.name.clone(),
                state: DeviceState::Stopped,
                bank: None,
                backlight: None,
                lcd_plugins_mask: None,
                fatal_errors: 0,
            },
        };
        Ok(status)
    }

    fn started_runtime(&self, id: &DeviceId) -> Result<Arc<DeviceRuntime>, DeviceError> {
        if !self.devices.lock().started.contains(id) {
            return Err(DeviceError::InvalidState {
                id: id.clone(),
                state: "not started",
            });
        }
        self.engine
            .arena
            .get(id)
            .ok_or_else(|| DeviceError::NotFound(id.clone()))
    }
}
