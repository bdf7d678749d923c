use std::sync::Arc;

use tracing::debug;
use zbus::interface;
use zbus::object_server::SignalEmitter;

use crate::device::{Color, DeviceId};
use crate::error::DeviceError;
use crate::macros::MacroBanks;
use crate::registry::DeviceRegistry;

/* Errors returned to D-Bus callers, named `org.gkeys.Daemon1.Error.*`. */
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.gkeys.Daemon1.Error")]
pub enum DaemonError {
    #[zbus(error)]
    ZBus(zbus::Error),
    NotFound(String),
    InvalidState(String),
    Unsupported(String),
    InvalidArgs(String),
    Failed(String),
}

impl From<DeviceError> for DaemonError {
    fn from(e: DeviceError) -> Self {
        let message = e.to_string();
        match e {
            DeviceError::NotFound(_) => DaemonError::NotFound(message),
            DeviceError::InvalidState { .. } => DaemonError::InvalidState(message),
            DeviceError::Unsupported { .. } => DaemonError::Unsupported(message),
            _ => DaemonError::Failed(message),
        }
    }
}

/* The org.gkeys.Daemon1.Devices interface.
 *
 * Registry operations may join device threads, so every call runs on the
 * blocking pool. */
pub struct DevicesManager {
    registry: Arc<DeviceRegistry>,
}

impl DevicesManager {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { registry }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, DaemonError>
    where
        T: Send + 'static,
        F: FnOnce(&DeviceRegistry) -> Result<T, DeviceError> + Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        tokio::task::spawn_blocking(move || f(&registry))
            .await
            .map_err(|e| DaemonError::Failed(e.to_string()))?
            .map_err(DaemonError::from)
    }
}

#[interface(name = "org.gkeys.Daemon1.Devices")]
impl DevicesManager {
    async fn start_device(&self, id: String) -> Result<(), DaemonError> {
        debug!("D-Bus: StartDevice {id}");
        self.blocking(move |r| r.start_device(&DeviceId::from(id)))
            .await
    }

    async fn stop_device(&self, id: String) -> Result<(), DaemonError> {
        debug!("D-Bus: StopDevice {id}");
        self.blocking(move |r| r.stop_device(&DeviceId::from(id), false))
            .await
    }

    async fn restart_device(&self, id: String) -> Result<(), DaemonError> {
        debug!("D-Bus: RestartDevice {id}");
        self.blocking(move |r| r.restart_device(&DeviceId::from(id)))
            .await
    }

    async fn reset_device_state(&self, id: String) -> Result<(), DaemonError> {
        self.blocking(move |r| r.reset_device_state(&DeviceId::from(id)))
            .await
    }

    async fn reset_all_devices_state(&self) -> Result<(), DaemonError> {
        self.blocking(|r| {
            r.reset_all_states();
            Ok(())
        })
        .await
    }

    async fn set_backlight_color(
        &self,
        id: String,
        red: u8,
        green: u8,
        blue: u8,
    ) -> Result<(), DaemonError> {
        let color = Color { red, green, blue };
        self.blocking(move |r| r.set_backlight_color(&DeviceId::from(id), color))
            .await
    }

    async fn set_lcd_plugins_mask(&self, id: String, mask: u64) -> Result<(), DaemonError> {
        self.blocking(move |r| r.set_lcd_plugins_mask(&DeviceId::from(id), mask))
            .await
    }

    /* `banks` is the JSON form of `MacroBanks`. */
    async fn set_macros_banks(&self, id: String, banks: String) -> Result<(), DaemonError> {
        let banks = MacroBanks::from_json(&banks)
            .map_err(|e| DaemonError::InvalidArgs(format!("invalid macro banks: {e}")))?;
        self.blocking(move |r| r.set_macros_banks(&DeviceId::from(id), banks))
            .await
    }

    async fn get_started_devices(&self) -> Result<Vec<String>, DaemonError> {
        self.blocking(|r| Ok(to_strings(r.started_devices())))
            .await
    }

    async fn get_stopped_devices(&self) -> Result<Vec<String>, DaemonError> {
        self.blocking(|r| Ok(to_strings(r.stopped_devices())))
            .await
    }

    /* Devices that left the bus, remembered until they come back. */
    async fn get_unplugged_devices(&self) -> Result<Vec<String>, DaemonError> {
        self.blocking(|r| Ok(to_strings(r.unplugged_devices())))
            .await
    }

    /* JSON snapshot of one device. */
    async fn get_device_status(&self, id: String) -> Result<String, DaemonError> {
        let status = self
            .blocking(move |r| r.device_status(&DeviceId::from(id)))
            .await?;
        serde_json::to_string(&status).map_err(|e| DaemonError::Failed(e.to_string()))
    }

    #[zbus(signal)]
    pub async fn devices_started(
        emitter: &SignalEmitter<'_>,
        ids: Vec<String>,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn devices_stopped(
        emitter: &SignalEmitter<'_>,
        ids: Vec<String>,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn devices_unplugged(
        emitter: &SignalEmitter<'_>,
        ids: Vec<String>,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn bank_switched(
        emitter: &SignalEmitter<'_>,
        id: &str,
        bank: &str,
    ) -> zbus::Result<()>;

    /* `events` is the recorded macro as JSON. */
    #[zbus(signal)]
    pub async fn macro_recorded(
        emitter: &SignalEmitter<'_>,
        id: &str,
        bank: &str,
        gkey: &str,
        events: &str,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn macro_cleared(
        emitter: &SignalEmitter<'_>,
        id: &str,
        bank: &str,
        gkey: &str,
    ) -> zbus::Result<()>;

    #[zbus(signal, name = "GKeyPressed")]
    pub async fn gkey_pressed(
        emitter: &SignalEmitter<'_>,
        id: &str,
        bank: &str,
        gkey: &str,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn media_key_pressed(
        emitter: &SignalEmitter<'_>,
        id: &str,
        key: &str,
    ) -> zbus::Result<()>;
}

pub(crate) fn to_strings(ids: Vec<DeviceId>) -> Vec<String> {
    ids.into_iter().map(|id| id.as_str().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_errors_map_to_named_errors() {
        let id = DeviceId::from("b001d002");
        assert!(matches!(
            DaemonError::from(DeviceError::NotFound(id.clone())),
            DaemonError::NotFound(m) if m.contains("b001d002")
        ));
        assert!(matches!(
            DaemonError::from(DeviceError::InvalidState {
                id: id.clone(),
                state: "not started",
            }),
            DaemonError::InvalidState(_)
        ));
        assert!(matches!(
            DaemonError::from(DeviceError::UnknownDriver("x".into())),
            DaemonError::Failed(_)
        ));
    }
}
