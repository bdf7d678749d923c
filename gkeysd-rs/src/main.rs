/* gkeysd: drives the G-keys, M-key banks, backlight and LCD of Logitech
 * gaming keyboards, and exposes them on the system bus. */
mod config;
mod dbus;
mod device;
mod device_database;
mod driver;
mod engine;
mod error;
mod events;
mod keys;
mod lcd;
mod macros;
mod registry;
mod runtime;
mod transport;
mod udev_monitor;
mod virtual_keyboard;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use config::{DEFAULT_CONFIG_PATH, DaemonConfig};
use error::DeviceError;
use events::ChannelSink;
use macros::KeyInjector;
use registry::DeviceRegistry;
use transport::Backend;
use udev_monitor::DeviceAction;
use virtual_keyboard::VirtualKeyboard;

/* Upper bound on flushing pending signals at shutdown. */
const SIGNAL_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// gkeysd: G-keys, M-keys and LCD daemon for Logitech gaming keyboards.
#[derive(Parser)]
#[command(name = "gkeysd", version, about)]
struct Cli {
    /// Configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Directory holding the `.device` files (overrides the configuration).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Transport backend: libusb or hidapi (overrides the configuration).
    #[arg(long)]
    backend: Option<Backend>,

    /// Log at debug level.
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = DaemonConfig::load(&cli.config)?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    debug!("Configuration: {config:?}");

    let transport = transport::create_transport(config.backend)
        .with_context(|| format!("Initialising the {} transport", config.backend))?;
    let device_db = device_database::load_device_database(&config.data_dir);
    if device_db.is_empty() {
        warn!("No device files found in {}", config.data_dir.display());
    }

    let injector: Option<Arc<dyn KeyInjector>> = if config.virtual_keyboard {
        match VirtualKeyboard::create() {
            Ok(keyboard) => Some(Arc::new(keyboard) as Arc<dyn KeyInjector>),
            Err(e) => {
                warn!("{e:#}, assigned macros will not be replayed");
                None
            }
        }
    } else {
        None
    };

    let (sink, events_rx) = ChannelSink::new();
    let registry = Arc::new(DeviceRegistry::new(
        driver::loaded_drivers(),
        transport,
        Arc::new(sink),
        injector,
    ));

    let conn = dbus::serve(Arc::clone(&registry)).await?;
    let signals = tokio::spawn(dbus::emit_signals(conn.clone(), events_rx));

    let (device_tx, mut device_rx) = mpsc::channel(32);
    let _monitor = udev_monitor::spawn(device_db, device_tx)?;

    let mut health = tokio::time::interval(config.health_check_interval);
    health.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sigint = signal(SignalKind::interrupt()).context("Installing the SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("Installing the SIGTERM handler")?;

    info!("gkeysd running");
    loop {
        tokio::select! {
            Some(action) = device_rx.recv() => handle_action(&registry, action).await,
            _ = health.tick() => {
                let registry = Arc::clone(&registry);
                if let Err(e) = tokio::task::spawn_blocking(move || registry.health_check()).await {
                    warn!("Health check panicked: {e}");
                }
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                break;
            }
        }
    }

    let stopping = Arc::clone(&registry);
    tokio::task::spawn_blocking(move || stopping.stop_all())
        .await
        .context("Stopping devices")?;

    /* The interface holds the last other reference to the registry, and with
     * it the event sender. Once both are gone the signal task drains and
     * exits. */
    conn.object_server()
        .remove::<dbus::manager::DevicesManager, _>(dbus::OBJECT_PATH)
        .await?;
    drop(registry);
    if tokio::time::timeout(SIGNAL_FLUSH_TIMEOUT, signals).await.is_err() {
        warn!("Pending signals dropped at shutdown");
    }

    info!("gkeysd stopped");
    Ok(())
}

async fn handle_action(registry: &Arc<DeviceRegistry>, action: DeviceAction) {
    let registry = Arc::clone(registry);
    let outcome = tokio::task::spawn_blocking(move || match action {
        DeviceAction::Add { descriptor } => {
            let id = registry.detect(descriptor)?;
            registry.start_device(&id)
        }
        DeviceAction::Remove { id } => match registry.evict_unplugged(&id) {
            Err(DeviceError::NotFound(_)) => {
                debug!("{id}: removal of an untracked device");
                Ok(())
            }
            other => other,
        },
    })
    .await;

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("{e}"),
        Err(e) => warn!("Device action panicked: {e}"),
    }
}
