/* gkeysctl DBus client: thin wrapper over the org.gkeys.Daemon1.Devices
 * methods. */
//! Low-level DBus client for `org.gkeys.Daemon1`.
//!
//! All communication with the daemon goes through this module.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use zbus::zvariant::{DynamicType, Type};
use zbus::{Connection, Message};

const BUS_NAME: &str = "org.gkeys.Daemon1";
const OBJECT_PATH: &str = "/org/gkeys/Daemon1";
const DEVICES_IFACE: &str = "org.gkeys.Daemon1.Devices";

/// A client that talks to the `gkeysd` daemon over the system DBus.
pub struct GkeysClient {
    conn: Connection,
}

impl GkeysClient {
    /// Connect to the system bus.
    pub async fn connect() -> Result<Self> {
        let conn = Connection::system()
            .await
            .context("Cannot connect to the system DBus")?;
        Ok(Self { conn })
    }

    pub async fn started_devices(&self) -> Result<Vec<String>> {
        self.call("GetStartedDevices", &()).await
    }

    pub async fn stopped_devices(&self) -> Result<Vec<String>> {
        self.call("GetStoppedDevices", &()).await
    }

    pub async fn unplugged_devices(&self) -> Result<Vec<String>> {
        self.call("GetUnpluggedDevices", &()).await
    }

    /// The daemon's JSON status snapshot of one device.
    pub async fn device_status(&self, id: &str) -> Result<serde_json::Value> {
        let json: String = self.call("GetDeviceStatus", &(id,)).await?;
        serde_json::from_str(&json).context("Malformed device status")
    }

    pub async fn start_device(&self, id: &str) -> Result<()> {
        self.invoke("StartDevice", &(id,)).await.map(drop)
    }

    pub async fn stop_device(&self, id: &str) -> Result<()> {
        self.invoke("StopDevice", &(id,)).await.map(drop)
    }

    pub async fn restart_device(&self, id: &str) -> Result<()> {
        self.invoke("RestartDevice", &(id,)).await.map(drop)
    }

    pub async fn reset_device_state(&self, id: &str) -> Result<()> {
        self.invoke("ResetDeviceState", &(id,)).await.map(drop)
    }

    pub async fn reset_all_devices_state(&self) -> Result<()> {
        self.invoke("ResetAllDevicesState", &()).await.map(drop)
    }

    pub async fn set_backlight_color(&self, id: &str, r: u8, g: u8, b: u8) -> Result<()> {
        self.invoke("SetBacklightColor", &(id, r, g, b)).await.map(drop)
    }

    pub async fn set_lcd_plugins_mask(&self, id: &str, mask: u64) -> Result<()> {
        self.invoke("SetLcdPluginsMask", &(id, mask)).await.map(drop)
    }

    /// Replace every macro bank of a device with a JSON document.
    pub async fn set_macros_banks(&self, id: &str, json: &str) -> Result<()> {
        self.invoke("SetMacrosBanks", &(id, json)).await.map(drop)
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    async fn invoke<B>(&self, method: &str, body: &B) -> Result<Message>
    where
        B: serde::Serialize + DynamicType,
    {
        self.conn
            .call_method(Some(BUS_NAME), OBJECT_PATH, Some(DEVICES_IFACE), method, body)
            .await
            .with_context(|| format!("{method} call failed"))
    }

    async fn call<B, R>(&self, method: &str, body: &B) -> Result<R>
    where
        B: serde::Serialize + DynamicType,
        R: DeserializeOwned + Type,
    {
        self.invoke(method, body)
            .await?
            .body()
            .deserialize()
            .with_context(|| format!("Unexpected {method} reply"))
    }
}
