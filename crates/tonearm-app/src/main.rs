//! # Tonearm
//!
//! A small terminal audio player.

mod services;
mod settings;
mod state;

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use services::player::{Command, PlayerService};
use settings::Settings;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "tonearm", version, about = "Play an audio file from the terminal")]
struct Args {
    /// File to load on startup
    path: Option<PathBuf>,

    /// Settings file (defaults to the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the available output devices and exit
    #[arg(long)]
    list_devices: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tonearm=info,tonearm_app=info,tonearm_audio=info".into()),
        )
        .init();

    info!("Starting Tonearm v{}", env!("CARGO_PKG_VERSION"));

    if args.list_devices {
        let default = tonearm_audio::output::default_device_name();
        for name in tonearm_audio::output::list_output_devices()? {
            let marker = if default.as_ref() == Some(&name) { "*" } else { " " };
            println!("{marker} {name}");
        }
        return Ok(());
    }

    let settings = Settings::load(args.config.as_deref())?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(settings, args.path))
}

async fn run(settings: Settings, path: Option<PathBuf>) -> Result<()> {
    let frame = Duration::from_millis(settings.frame_interval_ms.max(1));
    let player = PlayerService::new(settings);

    if let Some(path) = path {
        if player.open(&path) && !player.engine().play() {
            warn!("Playback could not start");
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(frame);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    // stdin closed
                    player.execute(Command::Quit).await;
                    break;
                };
                match Command::parse(&line) {
                    Ok(command) => {
                        if !player.execute(command).await {
                            break;
                        }
                    }
                    Err(e) => println!("{e}"),
                }
            }
            _ = ticker.tick() => {
                player.sync_events();
                if player.engine().state().is_playing() {
                    print!("\r{}", player.status_line());
                    std::io::stdout().flush()?;
                }
            }
        }
    }

    player.engine().close();
    info!("Goodbye");
    Ok(())
}
