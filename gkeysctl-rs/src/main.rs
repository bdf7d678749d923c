/* gkeysctl CLI: clap-driven client that talks to gkeysd over DBus to list keyboards, start and
 * stop them, and change their backlight, LCD plugins and macro banks. */
mod dbus_client;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use dbus_client::GkeysClient;

/// gkeysctl: control Logitech gaming keyboards through the gkeysd DBus daemon.
#[derive(Parser)]
#[command(name = "gkeysctl", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List started, stopped and unplugged keyboards.
    List,

    /// Show the state of a keyboard.
    Status {
        /// Device id, e.g. b001d004 (from `gkeysctl list`).
        device: String,
    },

    /// Start a stopped keyboard.
    Start {
        /// Device id.
        device: String,
    },

    /// Stop a started keyboard.
    Stop {
        /// Device id.
        device: String,
    },

    /// Stop then start a keyboard.
    Restart {
        /// Device id.
        device: String,
    },

    /// Reset a keyboard to its defaults (LEDs, backlight, LCD). Macros are kept.
    Reset {
        /// Device id.
        device: String,
    },

    /// Reset every started keyboard to its defaults.
    #[command(name = "reset-all")]
    ResetAll,

    /// Set the backlight color.
    Color {
        /// Device id.
        device: String,
        /// Red component (0-255).
        red: u8,
        /// Green component (0-255).
        green: u8,
        /// Blue component (0-255).
        blue: u8,
    },

    /// Select the LCD plugins to cycle through.
    #[command(name = "lcd-mask")]
    LcdMask {
        /// Device id.
        device: String,
        /// Plugins bit mask, decimal or 0x-prefixed hexadecimal.
        #[arg(value_parser = parse_mask)]
        mask: u64,
    },

    /// Replace every macro bank of a keyboard.
    Macros {
        /// Device id.
        device: String,
        /// Path to a JSON file with the macro banks.
        json_file: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = GkeysClient::connect()
        .await
        .context("Failed to connect to gkeysd on org.gkeys.Daemon1")?;

    match cli.command {
        Commands::List => cmd_list(&client).await,
        Commands::Status { device } => cmd_status(&client, &device).await,
        Commands::Start { device } => {
            client.start_device(&device).await?;
            println!("{device} started.");
            Ok(())
        }
        Commands::Stop { device } => {
            client.stop_device(&device).await?;
            println!("{device} stopped.");
            Ok(())
        }
        Commands::Restart { device } => {
            client.restart_device(&device).await?;
            println!("{device} restarted.");
            Ok(())
        }
        Commands::Reset { device } => client.reset_device_state(&device).await,
        Commands::ResetAll => client.reset_all_devices_state().await,
        Commands::Color {
            device,
            red,
            green,
            blue,
        } => client.set_backlight_color(&device, red, green, blue).await,
        Commands::LcdMask { device, mask } => client.set_lcd_plugins_mask(&device, mask).await,
        Commands::Macros { device, json_file } => cmd_macros(&client, &device, &json_file).await,
    }
}

// ---------------------------------------------------------------------------
// Command implementations
// ---------------------------------------------------------------------------

async fn cmd_list(client: &GkeysClient) -> Result<()> {
    let groups = [
        (client.started_devices().await?, "started"),
        (client.stopped_devices().await?, "stopped"),
        (client.unplugged_devices().await?, "unplugged"),
    ];
    if groups.iter().all(|(ids, _)| ids.is_empty()) {
        println!("No keyboards found.");
        return Ok(());
    }
    for (ids, state) in &groups {
        for id in ids {
            let name = client
                .device_status(id)
                .await
                .ok()
                .and_then(|status| status["name"].as_str().map(str::to_string))
                .unwrap_or_default();
            println!("{id}: {name} [{state}]");
        }
    }
    Ok(())
}

async fn cmd_status(client: &GkeysClient, device: &str) -> Result<()> {
    let status = client.device_status(device).await?;
    for line in status_lines(&status) {
        println!("{line}");
    }
    Ok(())
}

async fn cmd_macros(client: &GkeysClient, device: &str, json_file: &str) -> Result<()> {
    let json = std::fs::read_to_string(json_file)
        .with_context(|| format!("Cannot read {json_file}"))?;
    /* Catch syntax errors locally, the daemon validates the content. */
    serde_json::from_str::<serde_json::Value>(&json)
        .with_context(|| format!("{json_file} is not valid JSON"))?;
    client.set_macros_banks(device, &json).await?;
    println!("Macro banks of {device} replaced.");
    Ok(())
}

/* Human-readable rendering of a status snapshot; absent fields are skipped. */
fn status_lines(status: &serde_json::Value) -> Vec<String> {
    let text = |key: &str| status[key].as_str().unwrap_or("?").to_string();
    let mut lines = vec![
        format!("Device:   {}", text("id")),
        format!("Name:     {}", text("name")),
        format!("State:    {}", text("state")),
    ];
    if let Some(bank) = status["bank"].as_str() {
        lines.push(format!("Bank:     {bank}"));
    }
    if let Some(color) = status["backlight"].as_object() {
        let channel = |c: &str| color.get(c).and_then(|v| v.as_u64()).unwrap_or(0);
        lines.push(format!(
            "Color:    #{:02x}{:02x}{:02x}",
            channel("red"),
            channel("green"),
            channel("blue")
        ));
    }
    if let Some(mask) = status["lcd_plugins_mask"].as_u64() {
        lines.push(format!("LCD mask: {mask:#x}"));
    }
    if let Some(errors) = status["fatal_errors"].as_u64().filter(|&e| e > 0) {
        lines.push(format!("Errors:   {errors}"));
    }
    lines
}

fn parse_mask(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("Invalid plugins mask '{s}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mask() {
        assert_eq!(parse_mask("6"), Ok(6));
        assert_eq!(parse_mask("0x8000000000000000"), Ok(1 << 63));
        assert!(parse_mask("0xZZ").is_err());
        assert!(parse_mask("-1").is_err());
    }

    #[test]
    fn test_status_lines_for_started_device() {
        let status = serde_json::json!({
            "id": "b001d004",
            "name": "Logitech G510 Gaming Keyboard",
            "state": "started",
            "bank": "M2",
            "backlight": {"red": 255, "green": 0, "blue": 16},
            "lcd_plugins_mask": 6,
            "fatal_errors": 0
        });
        let lines = status_lines(&status);
        assert_eq!(lines[2], "State:    started");
        assert!(lines.contains(&"Bank:     M2".to_string()));
        assert!(lines.contains(&"Color:    #ff0010".to_string()));
        assert!(lines.contains(&"LCD mask: 0x6".to_string()));
        assert!(!lines.iter().any(|l| l.starts_with("Errors")));
    }

    #[test]
    fn test_status_lines_for_stopped_device() {
        let status = serde_json::json!({
            "id": "b001d004",
            "name": "G510",
            "state": "stopped",
            "bank": null,
            "backlight": null,
            "lcd_plugins_mask": null,
            "fatal_errors": 0
        });
        assert_eq!(status_lines(&status).len(), 3);
    }
}
