pub mod manager;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use zbus::connection::Builder;
use zbus::object_server::SignalEmitter;

use crate::events::DaemonEvent;
use crate::registry::DeviceRegistry;
use manager::{DevicesManager, to_strings};

pub const BUS_NAME: &str = "org.gkeys.Daemon1";
pub const OBJECT_PATH: &str = "/org/gkeys/Daemon1";

/* Claim the bus name and export the Devices interface. */
pub async fn serve(registry: Arc<DeviceRegistry>) -> Result<zbus::Connection> {
    let conn = Builder::system()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, DevicesManager::new(registry))?
        .build()
        .await
        .context("Connecting to the system bus")?;

    info!("DBus server ready on {BUS_NAME}");
    Ok(conn)
}

/* Turn every daemon notification into a D-Bus signal. Runs until the
 * sending side is gone. */
pub async fn emit_signals(
    conn: zbus::Connection,
    mut events: mpsc::UnboundedReceiver<DaemonEvent>,
) {
    let emitter = match SignalEmitter::new(&conn, OBJECT_PATH) {
        Ok(emitter) => emitter,
        Err(e) => {
            warn!("Cannot emit signals on {OBJECT_PATH}: {e}");
            return;
        }
    };

    while let Some(event) = events.recv().await {
        debug!("Signal: {event:?}");
        if let Err(e) = emit(&emitter, event).await {
            warn!("Failed to emit signal: {e}");
        }
    }
    debug!("Event channel closed, signal task exiting");
}

async fn emit(emitter: &SignalEmitter<'_>, event: DaemonEvent) -> zbus::Result<()> {
    match event {
        DaemonEvent::DevicesStarted(ids) => {
            DevicesManager::devices_started(emitter, to_strings(ids)).await
        }
        DaemonEvent::DevicesStopped(ids) => {
            DevicesManager::devices_stopped(emitter, to_strings(ids)).await
        }
        DaemonEvent::DevicesUnplugged(ids) => {
            DevicesManager::devices_unplugged(emitter, to_strings(ids)).await
        }
        DaemonEvent::BankSwitched { id, bank } => {
            DevicesManager::bank_switched(emitter, id.as_str(), &bank.to_string()).await
        }
        DaemonEvent::MacroRecorded {
            id,
            bank,
            gkey,
            events,
        } => {
            let json = serde_json::to_string(&events)
                .map_err(|e| zbus::Error::Failure(e.to_string()))?;
            DevicesManager::macro_recorded(
                emitter,
                id.as_str(),
                &bank.to_string(),
                &gkey.to_string(),
                &json,
            )
            .await
        }
        DaemonEvent::MacroCleared { id, bank, gkey } => {
            let (bank, gkey) = (bank.to_string(), gkey.to_string());
            DevicesManager::macro_cleared(emitter, id.as_str(), &bank, &gkey).await
        }
        DaemonEvent::GKeyPressed { id, bank, gkey } => {
            let (bank, gkey) = (bank.to_string(), gkey.to_string());
            DevicesManager::gkey_pressed(emitter, id.as_str(), &bank, &gkey).await
        }
        DaemonEvent::MediaKeyPressed { id, key } => {
            DevicesManager::media_key_pressed(emitter, id.as_str(), key).await
        }
    }
}
