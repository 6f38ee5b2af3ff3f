//! Log Tail Application
//!
//! Headless viewer: connects to a log server and prints every flushed entry
//! and auto-pause notification.
//!
//! Usage: `log-tail [URL] [--room ROOM] [--token TOKEN] [--stream CHANNEL]... [--config PATH]`

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use live_log_viewer::{
    client::{ViewerEvent, ViewerSession},
    config::AppConfig,
    protocol::LogEntry,
};

struct Args {
    url: Option<String>,
    room: Option<String>,
    token: Option<String>,
    streams: Vec<String>,
    config: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut parsed = Args {
        url: None,
        room: None,
        token: None,
        streams: Vec::new(),
        config: None,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--room" | "-r" => parsed.room = Some(args.next().context("--room needs a value")?),
            "--token" | "-t" => parsed.token = Some(args.next().context("--token needs a value")?),
            "--stream" | "-s" => parsed.streams.push(args.next().context("--stream needs a value")?),
            "--config" | "-c" => {
                parsed.config = Some(args.next().context("--config needs a path")?.into())
            }
            other if other.starts_with('-') => anyhow::bail!("Unknown argument '{}'", other),
            url => parsed.url = Some(url.to_string()),
        }
    }
    Ok(parsed)
}

fn print_entry(entry: &LogEntry) {
    let level = format!("{:?}", entry.level).to_uppercase();
    let source = if entry.app_name.is_empty() {
        String::new()
    } else {
        format!(" [{}]", entry.app_name)
    };
    println!(
        "{} {:>5} #{}{} {}",
        entry.timestamp.format("%H:%M:%S%.3f"),
        level,
        entry.id,
        source,
        entry.message
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = parse_args()?;
    let mut config = AppConfig::load(args.config.as_deref()).context("Failed to load config")?;
    if let Some(url) = args.url {
        config.client.server_url = url;
    }
    if let Some(room) = args.room {
        config.client.room = room;
    }
    if args.token.is_some() {
        config.client.token = args.token;
    }

    let (session, handle, mut events) = ViewerSession::new(&config)?;
    for channel in &args.streams {
        handle.subscribe(channel);
    }

    let session_task = tokio::spawn(session.run());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ViewerEvent::Flushed(report)) => {
                    report.entries.iter().for_each(print_entry);
                    for watch in &report.watches {
                        println!("watch {} = {}", watch.name, watch.value);
                    }
                }
                Some(ViewerEvent::AutoPaused(event)) => {
                    println!(
                        "channel '{}' auto-paused at {:.0} samples/s",
                        event.channel, event.rate
                    );
                }
                Some(ViewerEvent::Connection(status)) => {
                    if status.auth_required {
                        tracing::error!("Server rejected the token; pass --token");
                        break;
                    }
                    if let Some(seconds) = status.reconnect_countdown {
                        tracing::info!("Reconnecting in {}s", seconds);
                    }
                }
                Some(ViewerEvent::Producers(count)) => tracing::info!("{} producer(s) connected", count),
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.shutdown();
    session_task.await??;
    Ok(())
}
