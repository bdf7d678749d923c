/* Macro replay through a `/dev/uinput` virtual keyboard.
 *
 * The device is set up once at startup with every keycode a recorded macro
 * can carry (they are 8-bit Linux keycodes), and destroyed when dropped. */
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use nix::libc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::keys::EventKind;
use crate::macros::{KeyEvent, KeyInjector};

pub const UINPUT_PATH: &str = "/dev/uinput";
const DEVICE_NAME: &[u8] = b"gkeysd virtual keyboard";

const UINPUT_MAX_NAME_SIZE: usize = 80;
const BUS_VIRTUAL: u16 = 0x06;

const EV_SYN: u16 = 0x00;
const EV_KEY: u16 = 0x01;
const SYN_REPORT: u16 = 0;

/* `struct input_id` */
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct InputId {
    bustype: u16,
    vendor: u16,
    product: u16,
    version: u16,
}

/* `struct uinput_setup` */
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct UinputSetup {
    id: InputId,
    name: [u8; UINPUT_MAX_NAME_SIZE],
    ff_effects_max: u32,
}

nix::ioctl_none!(ui_dev_create, b'U', 1);
nix::ioctl_none!(ui_dev_destroy, b'U', 2);
nix::ioctl_write_ptr!(ui_dev_setup, b'U', 3, UinputSetup);
nix::ioctl_write_int!(ui_set_evbit, b'U', 100);
nix::ioctl_write_int!(ui_set_keybit, b'U', 101);

/* `struct input_event`: a timeval (left zeroed, the kernel stamps it) then
 * type, code and value in native byte order. */
const TIMEVAL_LEN: usize = std::mem::size_of::<libc::timeval>();
const INPUT_EVENT_LEN: usize = TIMEVAL_LEN + 8;

fn encode_event(kind: u16, code: u16, value: i32) -> [u8; INPUT_EVENT_LEN] {
    let mut raw = [0u8; INPUT_EVENT_LEN];
    raw[TIMEVAL_LEN..TIMEVAL_LEN + 2].copy_from_slice(&kind.to_ne_bytes());
    raw[TIMEVAL_LEN + 2..TIMEVAL_LEN + 4].copy_from_slice(&code.to_ne_bytes());
    raw[TIMEVAL_LEN + 4..].copy_from_slice(&value.to_ne_bytes());
    raw
}

/* A key event followed by its SYN_REPORT, written in one go. */
fn encode_key(event: &KeyEvent) -> Vec<u8> {
    let value = match event.event {
        EventKind::Press => 1,
        EventKind::Release => 0,
    };
    let mut raw = Vec::with_capacity(2 * INPUT_EVENT_LEN);
    raw.extend_from_slice(&encode_event(EV_KEY, u16::from(event.code), value));
    raw.extend_from_slice(&encode_event(EV_SYN, SYN_REPORT, 0));
    raw
}

fn setup_for(name: &[u8]) -> UinputSetup {
    let mut setup = UinputSetup {
        id: InputId {
            bustype: BUS_VIRTUAL,
            ..InputId::default()
        },
        name: [0; UINPUT_MAX_NAME_SIZE],
        ff_effects_max: 0,
    };
    /* Keep the trailing NUL. */
    let len = name.len().min(UINPUT_MAX_NAME_SIZE - 1);
    setup.name[..len].copy_from_slice(&name[..len]);
    setup
}

pub struct VirtualKeyboard {
    file: Mutex<File>,
}

impl VirtualKeyboard {
    pub fn create() -> Result<Self> {
        Self::create_at(Path::new(UINPUT_PATH))
    }

    pub fn create_at(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .with_context(|| format!("Opening {}", path.display()))?;
        let fd = file.as_raw_fd();
        let setup = setup_for(DEVICE_NAME);

        /* SAFETY: `fd` is an open uinput node for the duration of these
         * calls and `setup` outlives the setup ioctl. */
        unsafe {
            ui_set_evbit(fd, EV_KEY.into()).context("UI_SET_EVBIT")?;
            for code in 1..=u8::MAX {
                ui_set_keybit(fd, code.into()).context("UI_SET_KEYBIT")?;
            }
            ui_dev_setup(fd, &setup).context("UI_DEV_SETUP")?;
            ui_dev_create(fd).context("UI_DEV_CREATE")?;
        }

        info!("Virtual keyboard created on {}", path.display());
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl KeyInjector for VirtualKeyboard {
    fn inject(&self, event: &KeyEvent) -> Result<()> {
        debug!("Injecting {:?} {}", event.event, event.code);
        self.file
            .lock()
            .write_all(&encode_key(event))
            .context("Writing to the virtual keyboard")
    }
}

impl Drop for VirtualKeyboard {
    fn drop(&mut self) {
        let fd = self.file.get_mut().as_raw_fd();
        /* SAFETY: the file is still open, it is closed right after. */
        if let Err(e) = unsafe { ui_dev_destroy(fd) } {
            warn!("UI_DEV_DESTROY failed: {e}");
        }
    }
}
