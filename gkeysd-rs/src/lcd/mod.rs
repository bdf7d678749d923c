/* LCD screen support: the plugin-manager seam consumed by the LCD loop and
 * the monochrome frame buffer plugins draw into. */
pub mod plugins;

use std::time::Duration;

use crate::keys::Key;

pub const LCD_WIDTH: usize = 160;
pub const LCD_HEIGHT: usize = 43;
/* Pixels are packed in 8-row pages, one byte per column per page. */
const LCD_PAGES: usize = LCD_HEIGHT.div_ceil(8);
const LCD_HEADER_LEN: usize = 32;
const LCD_HEADER_TAG: u8 = 0x03;
pub const LCD_FRAME_LEN: usize = LCD_HEADER_LEN + LCD_PAGES * LCD_WIDTH;

/* Plugin identifiers, one bit each in the plugins mask. */
pub const PLUGIN_SPLASHSCREEN: u64 = 1 << 0;
pub const PLUGIN_IDLE: u64 = 1 << 1;
pub const PLUGIN_ENDSCREEN: u64 = 1 << 63;
pub const DEFAULT_LCD_PLUGINS_MASK: u64 = PLUGIN_SPLASHSCREEN | PLUGIN_IDLE;

/* What the LCD loop needs from the plugins: the next frame to show and how
 * long to show it. */
pub trait LcdPluginManager: Send {
    /* Render the next frame. `key` is an LCD key pressed since the last
     * frame, `plugins_mask` the enabled plugins. */
    fn next_frame(&mut self, key: Option<Key>, plugins_mask: u64) -> Vec<u8>;

    fn plugin_tempo(&self) -> Duration;

    fn unlock_current_plugin(&mut self);

    fn jump_to_next_plugin(&mut self);

    fn is_plugin_loaded(&self, plugin_id: u64) -> bool;
}

/* 160x43 monochrome frame. */
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    pixels: [u8; LCD_PAGES * LCD_WIDTH],
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self {
            pixels: [0u8; LCD_PAGES * LCD_WIDTH],
        }
    }
}

impl FrameBuffer {
    pub fn clear(&mut self) {
        self.pixels.fill(0);
    }

    /* Out-of-range coordinates are ignored. */
    pub fn set_pixel(&mut self, x: usize, y: usize, on: bool) {
        if x >= LCD_WIDTH || y >= LCD_HEIGHT {
            return;
        }
        let index = (y / 8) * LCD_WIDTH + x;
        let bit = 1u8 << (y % 8);
        if on {
            self.pixels[index] |= bit;
        } else {
            self.pixels[index] &= !bit;
        }
    }

    #[cfg(test)]
    pub fn pixel(&self, x: usize, y: usize) -> bool {
        if x >= LCD_WIDTH || y >= LCD_HEIGHT {
            return false;
        }
        self.pixels[(y / 8) * LCD_WIDTH + x] & (1u8 << (y % 8)) != 0
    }

    pub fn fill_rect(&mut self, x: usize, y: usize, width: usize, height: usize) {
        for py in y..(y + height).min(LCD_HEIGHT) {
            for px in x..(x + width).min(LCD_WIDTH) {
                self.set_pixel(px, py, true);
            }
        }
    }

    pub fn draw_rect(&mut self, x: usize, y: usize, width: usize, height: usize) {
        if width == 0 || height == 0 {
            return;
        }
        for px in x..x + width {
            self.set_pixel(px, y, true);
            self.set_pixel(px, y + height - 1, true);
        }
        for py in y..y + height {
            self.set_pixel(x, py, true);
            self.set_pixel(x + width - 1, py, true);
        }
    }

    /* The frame as sent on the LCD endpoint: header, then pixel pages. */
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; LCD_HEADER_LEN];
        out[0] = LCD_HEADER_TAG;
        out.extend_from_slice(&self.pixels);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let mut frame = FrameBuffer::default();
        frame.set_pixel(0, 0, true);
        frame.set_pixel(1, 9, true);
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), LCD_FRAME_LEN);
        assert_eq!(bytes.len(), 992);
        assert_eq!(bytes[0], LCD_HEADER_TAG);
        assert_eq!(bytes[LCD_HEADER_LEN], 0x01);
        assert_eq!(bytes[LCD_HEADER_LEN + LCD_WIDTH + 1], 0x02);
    }

    #[test]
    fn test_pixels_out_of_range_are_ignored() {
        let mut frame = FrameBuffer::default();
        frame.set_pixel(LCD_WIDTH, 0, true);
        frame.set_pixel(0, LCD_HEIGHT, true);
        assert!(frame.to_bytes()[LCD_HEADER_LEN..].iter().all(|b| *b == 0));
        assert!(!frame.pixel(LCD_WIDTH, 0));
    }

    #[test]
    fn test_draw_rect_outline() {
        let mut frame = FrameBuffer::default();
        frame.draw_rect(0, 0, LCD_WIDTH, LCD_HEIGHT);
        assert!(frame.pixel(0, 0));
        assert!(frame.pixel(LCD_WIDTH - 1, LCD_HEIGHT - 1));
        assert!(!frame.pixel(1, 1));
        frame.clear();
        assert!(!frame.pixel(0, 0));
    }
}
