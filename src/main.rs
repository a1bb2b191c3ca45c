//! Process entry point: CLI parsing, logging init, and signal handling.
//!
//! `SIGINT`/`SIGTERM` trigger a graceful shutdown; `SIGHUP` triggers a
//! reload: a new `Engine` is built from a freshly loaded `Config` and the
//! old one is fully stopped before the new one starts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};

use arduino_mqtt_bridge::broker::RumqttcBroker;
use arduino_mqtt_bridge::transactor::SerialTransactor;
use arduino_mqtt_bridge::{AppConfig, Engine, SerialWatchdogTicker};

#[derive(Parser, Debug)]
#[command(
    name = "arduino-mqtt-bridge",
    version,
    about = "Bridges an Arduino-style I/O board to an MQTT broker with home-automation discovery"
)]
struct Cli {
    /// Path to the TOML config file; defaults to ~/.arduino_bridge/config.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the bridge (the default when no subcommand is given).
    Run,
    /// Print the loaded config as JSON and exit.
    Config,
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

type RunningEngine = Arc<Engine<SerialTransactor, RumqttcBroker, SerialWatchdogTicker>>;

async fn build_and_start(config: AppConfig) -> Result<RunningEngine> {
    let transactor = Arc::new(SerialTransactor::new(
        config.serial.arduino_port.clone(),
        config.serial.arduino_baud,
    ));
    let broker = Arc::new(RumqttcBroker::new(
        config.device.name.clone(),
        config.mqtt.host.clone(),
        config.mqtt.port,
        config.mqtt.username.clone(),
        config.mqtt.password.clone(),
        format!("{}/availability", config.mqtt.base_topic),
    ));
    let watchdog = Arc::new(SerialWatchdogTicker::new(
        config.serial.watchdog_port.clone(),
        config.serial.watchdog_baud,
        Duration::from_secs(3),
    ));

    let engine = Arc::new(Engine::new(config, transactor, broker, watchdog));
    engine.start().await.context("engine failed to start")?;
    Ok(engine)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(p) => p,
        None => AppConfig::default_path()?,
    };

    if let Some(Commands::Config) = cli.command {
        let config = AppConfig::load(&config_path)?;
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let mut engine = build_and_start(AppConfig::load(&config_path)?).await?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("SIGINT received, shutting down.");
                break;
            }
            _ = sigterm.recv() => {
                log::info!("SIGTERM received, shutting down.");
                break;
            }
            _ = sighup.recv() => {
                log::info!("SIGHUP received, reloading configuration.");
                engine.stop().await;
                let cfg = match AppConfig::load(&config_path) {
                    Ok(cfg) => cfg,
                    Err(e) => {
                        log::error!("Failed to reload config, keeping bridge stopped: {}", e);
                        return Err(e);
                    }
                };
                match build_and_start(cfg).await {
                    Ok(new_engine) => engine = new_engine,
                    Err(e) => {
                        log::error!("Failed to restart engine after reload: {}", e);
                        return Err(e);
                    }
                }
            }
        }
    }

    engine.stop().await;
    Ok(())
}
