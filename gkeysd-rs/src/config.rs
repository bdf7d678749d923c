/* Daemon configuration, read from an INI file:
 *
 *   [daemon]
 *   backend=libusb
 *   data_dir=/usr/share/gkeysd/devices
 *   health_check_interval=5
 *   virtual_keyboard=true
 *
 * A missing file means defaults. Bad values are warned about and replaced
 * by their default. */
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use configparser::ini::Ini;
use tracing::{info, warn};

use crate::transport::Backend;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/gkeysd/gkeysd.conf";
pub const DEFAULT_DATA_DIR: &str = "/usr/share/gkeysd/devices";
const DEFAULT_HEALTH_CHECK_SECS: u64 = 5;

const SECTION: &str = "daemon";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub backend: Backend,
    pub data_dir: PathBuf,
    pub health_check_interval: Duration,
    pub virtual_keyboard: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            health_check_interval: Duration::from_secs(DEFAULT_HEALTH_CHECK_SECS),
            virtual_keyboard: true,
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No configuration at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let mut ini = Ini::new();
        ini.load(path)
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("Reading {}", path.display()))?;
        Ok(Self::from_ini(&ini))
    }

    fn from_ini(ini: &Ini) -> Self {
        let mut config = Self::default();

        if let Some(backend) = ini.get(SECTION, "backend") {
            match backend.parse() {
                Ok(b) => config.backend = b,
                Err(e) => warn!("{e}, using {}", config.backend),
            }
        }

        if let Some(dir) = ini.get(SECTION, "data_dir") {
            config.data_dir = PathBuf::from(dir);
        }

        match ini.getuint(SECTION, "health_check_interval") {
            Ok(Some(0)) => warn!("health_check_interval must be positive, using default"),
            Ok(Some(secs)) => config.health_check_interval = Duration::from_secs(secs),
            Ok(None) => {}
            Err(e) => warn!("health_check_interval: {e}, using default"),
        }

        match ini.getbool(SECTION, "virtual_keyboard") {
            Ok(Some(enabled)) => config.virtual_keyboard = enabled,
            Ok(None) => {}
            Err(e) => warn!("virtual_keyboard: {e}, using default"),
        }

        config
    }
}
