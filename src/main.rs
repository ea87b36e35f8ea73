pub mod call;
pub mod config;
pub mod debounce;
pub mod dial;
pub mod hardware;
pub mod media;
pub mod phone;

use std::{fs::File, path::Path, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter, warn};

use crate::config::{Cli, Config};
use crate::hardware::{Hardware, PhoneHardware};
use crate::media::process::CommandLauncher;
use crate::phone::PhoneEngine;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let cli = Cli::parse();

    let config_found = Path::new(&cli.conf).exists();
    let config = if config_found {
        Config::load(&cli.conf)?
    } else {
        Config::default()
    };

    let mut log_fmt = tracing_subscriber::fmt();
    let level = std::env::var("GUESTBOOK_LOG").ok().or(config.log_level.clone());
    if let Some(level) = level {
        if let Ok(lv) = level.parse::<LevelFilter>() {
            log_fmt = log_fmt.with_max_level(lv);
        }
    }

    let _log_guard = if let Some(ref log_file) = config.log_file {
        let file = File::create(log_file)
            .with_context(|| format!("Failed to create log file {log_file}"))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        log_fmt.with_writer(non_blocking).try_init().ok();
        Some(guard)
    } else {
        log_fmt.try_init().ok();
        None
    };

    if !config_found {
        warn!("{} not found, using defaults", cli.conf);
    }

    std::fs::create_dir_all(&config.audio.recordings_dir).with_context(|| {
        format!(
            "Failed to create recordings directory {}",
            config.audio.recordings_dir.display()
        )
    })?;

    let launcher = Arc::new(CommandLauncher::new(&config.audio));
    let (engine, events) = PhoneEngine::new(&config, launcher)?;

    let hardware = Hardware::create(&config.gpio)?;

    let shutdown = CancellationToken::new();

    let poller = hardware::spawn_poller(hardware, events, shutdown.clone());
    let engine_task = tokio::spawn(engine.run(shutdown.clone()));

    info!(
        "Monitoring handset and dial, recordings go to {}",
        config.audio.recordings_dir.display()
    );

    tokio::signal::ctrl_c().await?;
    info!("Received CTRL+C, shutting down");

    shutdown.cancel();
    engine_task.await?;
    let _ = tokio::task::spawn_blocking(move || poller.join()).await;

    Ok(())
}
