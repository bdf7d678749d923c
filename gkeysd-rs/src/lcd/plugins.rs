/* Built-in LCD plugins and the manager cycling through them.
 *
 * Each plugin shows `max_frames` frames at its own tempo, then the manager
 * moves on to the next plugin enabled in the mask, unless the current one
 * is locked. L1 toggles the lock, L2 jumps to the next plugin. */
use std::time::Duration;

use tracing::debug;

use crate::keys::Key;
use crate::lcd::{
    FrameBuffer, LcdPluginManager, LCD_HEIGHT, LCD_WIDTH, PLUGIN_ENDSCREEN, PLUGIN_IDLE,
    PLUGIN_SPLASHSCREEN,
};

const IDLE_TEMPO: Duration = Duration::from_millis(1000);

pub trait LcdPlugin: Send {
    fn id(&self) -> u64;
    fn name(&self) -> &'static str;
    fn tempo(&self) -> Duration;
    fn max_frames(&self) -> u16;
    fn draw(&mut self, frame: &mut FrameBuffer, index: u16);
}

/* Border with a progress bar filling up over the plugin's frames. */
struct Splashscreen;

impl LcdPlugin for Splashscreen {
    fn id(&self) -> u64 {
        PLUGIN_SPLASHSCREEN
    }
    fn name(&self) -> &'static str {
        "splashscreen"
    }
    fn tempo(&self) -> Duration {
        Duration::from_millis(100)
    }
    fn max_frames(&self) -> u16 {
        30
    }
    fn draw(&mut self, frame: &mut FrameBuffer, index: u16) {
        frame.draw_rect(0, 0, LCD_WIDTH, LCD_HEIGHT);
        frame.draw_rect(20, 30, LCD_WIDTH - 40, 7);
        let width = (LCD_WIDTH - 44) * usize::from(index + 1) / usize::from(self.max_frames());
        frame.fill_rect(22, 32, width, 3);
    }
}

/* A dot sweeping across the screen. */
struct Idle;

impl LcdPlugin for Idle {
    fn id(&self) -> u64 {
        PLUGIN_IDLE
    }
    fn name(&self) -> &'static str {
        "idle"
    }
    fn tempo(&self) -> Duration {
        Duration::from_millis(500)
    }
    fn max_frames(&self) -> u16 {
        40
    }
    fn draw(&mut self, frame: &mut FrameBuffer, index: u16) {
        let x = usize::from(index) * 4 % LCD_WIDTH;
        frame.fill_rect(x, LCD_HEIGHT / 2 - 1, 3, 3);
    }
}

/* Shown once when the daemon lets go of the keyboard. */
struct Endscreen;

impl LcdPlugin for Endscreen {
    fn id(&self) -> u64 {
        PLUGIN_ENDSCREEN
    }
    fn name(&self) -> &'static str {
        "endscreen"
    }
    fn tempo(&self) -> Duration {
        Duration::from_millis(1000)
    }
    fn max_frames(&self) -> u16 {
        1
    }
    fn draw(&mut self, frame: &mut FrameBuffer, _index: u16) {
        frame.draw_rect(LCD_WIDTH / 2 - 10, LCD_HEIGHT / 2 - 5, 20, 10);
    }
}

pub struct LcdPluginsManager {
    plugins: Vec<Box<dyn LcdPlugin>>,
    current: usize,
    frame_index: u16,
    locked: bool,
    frame: FrameBuffer,
}

impl LcdPluginsManager {
    pub fn new() -> Self {
        let plugins: Vec<Box<dyn LcdPlugin>> =
            vec![Box::new(Splashscreen), Box::new(Idle), Box::new(Endscreen)];
        Self {
            plugins,
            current: 0,
            frame_index: 0,
            locked: false,
            frame: FrameBuffer::default(),
        }
    }

    fn enabled(&self, index: usize, mask: u64) -> bool {
        self.plugins[index].id() & mask != 0
    }

    /* Move to the first enabled plugin at or after `current`. */
    fn select_enabled(&mut self, mask: u64) -> bool {
        for step in 0..self.plugins.len() {
            let index = (self.current + step) % self.plugins.len();
            if self.enabled(index, mask) {
                if index != self.current {
                    self.current = index;
                    self.frame_index = 0;
                    self.locked = false;
                }
                return true;
            }
        }
        false
    }

    #[cfg(test)]
    pub fn current_plugin(&self) -> Option<&'static str> {
        self.plugins.get(self.current).map(|p| p.name())
    }

    #[cfg(test)]
    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl Default for LcdPluginsManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LcdPluginManager for LcdPluginsManager {
    fn next_frame(&mut self, key: Option<Key>, plugins_mask: u64) -> Vec<u8> {
        match key {
            Some(Key::L1) => {
                self.locked = !self.locked;
                debug!("LCD plugin lock: {}", self.locked);
            }
            Some(Key::L2) => self.jump_to_next_plugin(),
            _ => {}
        }

        self.frame.clear();
        if self.plugins.is_empty() || !self.select_enabled(plugins_mask) {
            return self.frame.to_bytes();
        }

        let plugin = &mut self.plugins[self.current];
        plugin.draw(&mut self.frame, self.frame_index);
        let max_frames = plugin.max_frames();

        self.frame_index += 1;
        if self.frame_index >= max_frames {
            self.frame_index = 0;
            if !self.locked {
                self.current = (self.current + 1) % self.plugins.len();
            }
        }

        self.frame.to_bytes()
    }

    fn plugin_tempo(&self) -> Duration {
        self.plugins
            .get(self.current)
            .map(|p| p.tempo())
            .unwrap_or(IDLE_TEMPO)
    }

    fn unlock_current_plugin(&mut self) {
        self.locked = false;
    }

    fn jump_to_next_plugin(&mut self) {
        if self.plugins.is_empty() {
            return;
        }
        self.current = (self.current + 1) % self.plugins.len();
        self.frame_index = 0;
        self.locked = false;
    }

    fn is_plugin_loaded(&self, plugin_id: u64) -> bool {
        self.plugins.iter().any(|p| p.id() == plugin_id)
    }
}
