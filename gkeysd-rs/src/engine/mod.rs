/* Keyboard driver engine: opening and closing a device, and the two
 * threads running while it is started.
 *
 *   Closed -> Opening -> Listening <-> MacroRecording -> Closing -> Closed
 *
 * plus the LCD loop, running alongside for devices with a screen. */
pub mod lcd;
pub mod listener;

use std::sync::Arc;
use std::thread;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::device::{Capabilities, DeviceDescriptor, DeviceId};
use crate::driver::KeyboardModel;
use crate::error::DeviceError;
use crate::events::EventSink;
use crate::lcd::LcdPluginManager;
use crate::lcd::plugins::LcdPluginsManager;
use crate::macros::{KeyInjector, MacroBanks};
use crate::runtime::{DeviceArena, DeviceRuntime};
use crate::transport::Transport;

use listener::Listener;

/* What device threads need besides their device ID. Cheap to clone; the
 * threads never capture a runtime directly. */
#[derive(Clone)]
pub struct EngineContext {
    pub arena: Arc<DeviceArena>,
    pub transport: Arc<dyn Transport>,
    pub sink: Arc<dyn EventSink>,
    pub injector: Option<Arc<dyn KeyInjector>>,
}

/* Open the device, initialise it and spawn its threads. On failure nothing
 * is left running and the transport handle is released. */
pub fn open(
    ctx: &EngineContext,
    descriptor: DeviceDescriptor,
    model: &'static KeyboardModel,
    banks: Arc<RwLock<MacroBanks>>,
) -> Result<Arc<DeviceRuntime>, DeviceError> {
    let id = descriptor.id.clone();
    let mut handle = ctx.transport.open(&descriptor)?;

    for report in model.init_reports {
        if let Err(e) = handle.send_feature_report(report) {
            warn!("{id}: initialisation failed: {e}");
            handle.close(false);
            return Err(e.into());
        }
    }

    let lcd_manager: Option<Box<dyn LcdPluginManager>> = descriptor
        .has(Capabilities::LCD_SCREEN)
        .then(|| Box::new(LcdPluginsManager::new()) as Box<dyn LcdPluginManager>);
    let keys_listener = Listener::new(id.clone(), model.report_maps(&descriptor));

    let runtime = Arc::new(DeviceRuntime::new(descriptor, model, handle, banks));
    if let Err(e) = runtime.reset_defaults() {
        warn!("{id}: failed to apply defaults: {e}");
        release(&runtime);
        return Err(e.into());
    }
    if let Some(injector) = &ctx.injector {
        if let Err(e) = runtime.start_replay(Arc::clone(injector)) {
            release(&runtime);
            return Err(DeviceError::Thread(e));
        }
    }

    ctx.arena.insert(Arc::clone(&runtime));

    let listener_thread = {
        let ctx = ctx.clone();
        let id = id.clone();
        thread::Builder::new()
            .name(format!("{id}-keys"))
            .spawn(move || listener::listen(ctx, id, keys_listener))
    };
    let listener_thread = match listener_thread {
        Ok(handle) => handle,
        Err(e) => {
            abort_open(ctx, &runtime);
            return Err(DeviceError::Thread(e));
        }
    };

    let lcd_thread = match lcd_manager {
        Some(manager) => {
            let ctx_lcd = ctx.clone();
            let id_lcd = id.clone();
            let spawned = thread::Builder::new()
                .name(format!("{id}-lcd"))
                .spawn(move || lcd::refresh(ctx_lcd, id_lcd, manager));
            match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    runtime.set_threads(listener_thread, None);
                    abort_open(ctx, &runtime);
                    return Err(DeviceError::Thread(e));
                }
            }
        }
        None => None,
    };

    runtime.set_threads(listener_thread, lcd_thread);
    info!(
        "{id}: {} started ({:04x}:{:04x})",
        model.name, runtime.descriptor.vendor_id, runtime.descriptor.product_id
    );
    Ok(runtime)
}

fn abort_open(ctx: &EngineContext, runtime: &DeviceRuntime) {
    runtime.stop_threads();
    runtime.join_threads();
    ctx.arena.remove(runtime.id());
    release(runtime);
}

/* Hand the transport handle back, skipping any I/O once it was stopped. */
fn release(runtime: &DeviceRuntime) {
    if let Some(handle) = runtime.take_handle() {
        let skip_io = !runtime.io_enabled();
        debug!("{}: closing transport (skip_io: {skip_io})", runtime.id());
        handle.close(skip_io);
    }
}

/* Stop the device threads and release the device. With `stop_io` the
 * device is treated as possibly gone: nothing more is sent to it, not even
 * the interface release. */
pub fn close(arena: &DeviceArena, id: &DeviceId, stop_io: bool) -> Result<(), DeviceError> {
    let runtime = arena.get(id).ok_or_else(|| DeviceError::NotFound(id.clone()))?;

    if stop_io {
        runtime.stop_io();
    }
    runtime.stop_threads();
    runtime.join_threads();

    if runtime.io_enabled() {
        if let Err(e) = runtime.reset_defaults() {
            warn!("{id}: failed to restore defaults: {e}");
        }
    }
    release(&runtime);
    arena.remove(id);

    info!("{id}: closed");
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::device::test_descriptor;
    use crate::driver::logitech_g510::G510;
    use crate::events::tests::RecordingSink;
    use crate::lcd::LCD_FRAME_LEN;
    use crate::macros::KeyEvent;
    use crate::macros::tests::RecordingInjector;
    use crate::transport::mock::MockTransport;

    pub(crate) fn context(
        transport: &MockTransport,
    ) -> (EngineContext, Arc<RecordingSink>, Arc<RecordingInjector>) {
        let sink = Arc::new(RecordingSink::default());
        let injector = Arc::new(RecordingInjector::default());
        let ctx = EngineContext {
            arena: Arc::default(),
            transport: Arc::new(transport.clone()),
            sink: sink.clone(),
            injector: Some(injector.clone()),
        };
        (ctx, sink, injector)
    }

    /* Poll `cond` for up to a second. */
    pub(crate) fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(1);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_open_initialises_and_close_restores() {
        let transport = MockTransport::default();
        let (ctx, _, _) = context(&transport);
        let descriptor = test_descriptor(1, 4);
        let id = descriptor.id.clone();

        let runtime = open(&ctx, descriptor, &G510, Arc::default()).unwrap();
        assert!(runtime.has_handle());
        assert!(ctx.arena.get(&id).is_some());
        {
            let state = transport.state.lock();
            assert_eq!(state.feature_reports[0], vec![0x01, 0, 0, 0]);
            assert_eq!(state.feature_reports[1], vec![0x09, 0x02, 0, 0, 0, 0, 0, 0]);
            assert_eq!(state.feature_reports[2], vec![0x04, 0x00]);
            assert_eq!(state.feature_reports[3], vec![0x05, 0xff, 0xff, 0xff]);
        }
        assert!(wait_for(|| !transport.state.lock().lcd_frames.is_empty()));

        close(&ctx.arena, &id, false).unwrap();
        assert!(ctx.arena.get(&id).is_none());
        assert!(!runtime.has_handle());

        let state = transport.state.lock();
        assert_eq!(state.closes, vec![false]);
        assert!(state.lcd_frames.iter().all(|f| f.len() == LCD_FRAME_LEN));
        /* Defaults pushed once more on the way out. */
        assert_eq!(state.feature_reports.len(), 6);
    }

    #[test]
    fn test_open_failure_spawns_nothing() {
        let transport = MockTransport::default();
        transport.state.lock().fail_open = true;
        let (ctx, _, _) = context(&transport);

        let result = open(&ctx, test_descriptor(1, 4), &G510, Arc::default());
        assert!(matches!(result, Err(DeviceError::Transport(_))));
        assert!(ctx.arena.ids().is_empty());
    }

    #[test]
    fn test_close_with_stopped_io_skips_device() {
        let transport = MockTransport::default();
        let (ctx, _, _) = context(&transport);
        let descriptor = test_descriptor(1, 4);
        let id = descriptor.id.clone();
        open(&ctx, descriptor, &G510, Arc::default()).unwrap();
        let reports_before = transport.state.lock().feature_reports.len();

        close(&ctx.arena, &id, true).unwrap();

        let state = transport.state.lock();
        assert_eq!(state.closes, vec![true]);
        assert_eq!(state.feature_reports.len(), reports_before);
    }

    #[test]
    fn test_close_waits_for_queued_replays() {
        let transport = MockTransport::default();
        let (ctx, _, injector) = context(&transport);
        let descriptor = test_descriptor(1, 4);
        let id = descriptor.id.clone();
        let runtime = open(&ctx, descriptor, &G510, Arc::default()).unwrap();

        let events = vec![KeyEvent::press(30, 0), KeyEvent::release(30, 20)];
        assert!(runtime.queue_macro(events.clone()));
        assert!(runtime.queue_macro(events.clone()));
        close(&ctx.arena, &id, false).unwrap();

        assert_eq!(injector.events.lock().len(), 4);
        assert!(!runtime.queue_macro(events));
    }

    #[test]
    fn test_close_unknown_device() {
        let arena = DeviceArena::default();
        assert!(matches!(
            close(&arena, &DeviceId::from("b009d009"), false),
            Err(DeviceError::NotFound(_))
        ));
    }
}
