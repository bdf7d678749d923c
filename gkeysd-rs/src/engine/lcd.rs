/* The LCD thread: one frame per plugin tempo, and a last end-of-session
 * frame when the device stops. */
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::device::DeviceId;
use crate::engine::EngineContext;
use crate::engine::listener::KEYS_READ_TIMEOUT;
use crate::lcd::{LcdPluginManager, PLUGIN_ENDSCREEN};
use crate::runtime::DeviceRuntime;

const LCD_WRITE_TIMEOUT: Duration = Duration::from_millis(1000);

pub(crate) fn refresh(ctx: EngineContext, id: DeviceId, mut manager: Box<dyn LcdPluginManager>) {
    debug!("{id}: LCD thread running");
    loop {
        let Some(runtime) = ctx.arena.get(&id) else {
            debug!("{id}: device evicted");
            break;
        };
        if !runtime.threads_running() {
            end_session(&runtime, manager.as_mut());
            break;
        }

        let started = Instant::now();
        draw_next_frame(&runtime, manager.as_mut());
        drop(runtime);

        let remaining = manager.plugin_tempo().saturating_sub(started.elapsed());
        wait(&ctx, &id, remaining);
    }
    debug!("{id}: LCD thread exiting");
}

fn draw_next_frame(runtime: &DeviceRuntime, manager: &mut dyn LcdPluginManager) {
    let frame = {
        let mut lcd = runtime.lcd.lock();
        let key = lcd.pending_key.take();
        manager.next_frame(key, lcd.plugins_mask)
    };
    write_frame(runtime, &frame);
}

fn write_frame(runtime: &DeviceRuntime, frame: &[u8]) {
    let written = runtime.with_transport(|h| h.write_lcd_interrupt(frame, LCD_WRITE_TIMEOUT));
    if let Some(Err(e)) = written {
        warn!("{}: LCD write failed: {e}", runtime.id());
    }
}

fn end_session(runtime: &DeviceRuntime, manager: &mut dyn LcdPluginManager) {
    manager.unlock_current_plugin();
    if manager.is_plugin_loaded(PLUGIN_ENDSCREEN) {
        let frame = manager.next_frame(None, PLUGIN_ENDSCREEN);
        write_frame(runtime, &frame);
    }
}

/* Sleep out the rest of the tempo in short slices so a stop request is
 * honoured quickly. */
fn wait(ctx: &EngineContext, id: &DeviceId, remaining: Duration) {
    let deadline = Instant::now() + remaining;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        match ctx.arena.get(id) {
            Some(runtime) if runtime.threads_running() => {}
            _ => return,
        }
        thread::sleep((deadline - now).min(KEYS_READ_TIMEOUT));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::device::test_descriptor;
    use crate::driver::logitech_g510::G510;
    use crate::engine::tests::context;
    use crate::keys::Key;
    use crate::transport::Transport;
    use crate::transport::mock::MockTransport;

    /* Plugin manager logging its calls. */
    #[derive(Default, Clone)]
    struct ScriptedManager {
        calls: Arc<Mutex<Vec<(Option<Key>, u64)>>>,
        unlocked: Arc<Mutex<bool>>,
    }

    impl LcdPluginManager for ScriptedManager {
        fn next_frame(&mut self, key: Option<Key>, plugins_mask: u64) -> Vec<u8> {
            self.calls.lock().push((key, plugins_mask));
            vec![0x03, self.calls.lock().len() as u8]
        }
        fn plugin_tempo(&self) -> Duration {
            Duration::from_millis(5)
        }
        fn unlock_current_plugin(&mut self) {
            *self.unlocked.lock() = true;
        }
        fn jump_to_next_plugin(&mut self) {}
        fn is_plugin_loaded(&self, plugin_id: u64) -> bool {
            plugin_id == PLUGIN_ENDSCREEN
        }
    }

    fn runtime(transport: &MockTransport) -> Arc<DeviceRuntime> {
        let descriptor = test_descriptor(1, 4);
        let handle = transport.open(&descriptor).unwrap();
        Arc::new(DeviceRuntime::new(descriptor, &G510, handle, Arc::default()))
    }

    #[test]
    fn test_frame_consumes_pending_key() {
        let transport = MockTransport::default();
        let runtime = runtime(&transport);
        let mut manager = ScriptedManager::default();
        runtime.lcd.lock().pending_key = Some(Key::L1);
        runtime.lcd.lock().plugins_mask = 0x2;

        draw_next_frame(&runtime, &mut manager);
        draw_next_frame(&runtime, &mut manager);

        assert_eq!(*manager.calls.lock(), vec![(Some(Key::L1), 0x2), (None, 0x2)]);
        assert_eq!(transport.state.lock().lcd_frames.len(), 2);
    }

    #[test]
    fn test_thread_renders_end_frame_on_stop() {
        let transport = MockTransport::default();
        let (ctx, _, _) = context(&transport);
        let runtime = runtime(&transport);
        let id = runtime.id().clone();
        ctx.arena.insert(Arc::clone(&runtime));
        let manager = ScriptedManager::default();

        let handle = {
            let ctx = ctx.clone();
            let manager = Box::new(manager.clone());
            thread::spawn(move || refresh(ctx, id, manager))
        };
        thread::sleep(Duration::from_millis(20));
        runtime.stop_threads();
        handle.join().unwrap();

        assert!(*manager.unlocked.lock());
        assert_eq!(manager.calls.lock().last(), Some(&(None, PLUGIN_ENDSCREEN)));
        assert_eq!(
            transport.state.lock().lcd_frames.len(),
            manager.calls.lock().len()
        );
    }

    #[test]
    fn test_stopped_io_writes_nothing() {
        let transport = MockTransport::default();
        let runtime = runtime(&transport);
        runtime.stop_io();
        let mut manager = ScriptedManager::default();

        draw_next_frame(&runtime, &mut manager);
        end_session(&runtime, &mut manager);

        assert!(transport.state.lock().lcd_frames.is_empty());
    }
}
