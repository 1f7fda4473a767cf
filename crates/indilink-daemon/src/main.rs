//! indilink - INDI client entry point
//!
//! Connects to an INDI server, mirrors its devices and properties, logs every
//! change, and optionally sends one-shot commands once their target
//! properties are defined.

mod command;
mod config;
mod events;

use anyhow::Result;
use clap::Parser;
use command::PendingCommand;
use indilink_client::{Client, ReadStatus};
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "indilink")]
#[command(about = "INDI client that mirrors a server's devices and properties")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "indilink.toml")]
    config: PathBuf,

    /// Server host, overrides the configuration
    #[arg(long)]
    host: Option<String>,

    /// Server port, overrides the configuration
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Print the registry as JSON when the session ends
    #[arg(long)]
    snapshot: bool,

    /// Set a text element
    #[arg(long, value_name = "DEVICE/PROPERTY/ELEMENT=TEXT", value_parser = PendingCommand::text)]
    set_text: Vec<PendingCommand>,

    /// Set a number element; sexagesimal values are accepted
    #[arg(long, value_name = "DEVICE/PROPERTY/ELEMENT=NUMBER", value_parser = PendingCommand::number)]
    set_number: Vec<PendingCommand>,

    /// Set one switch to On or Off
    #[arg(long, value_name = "DEVICE/PROPERTY/ELEMENT=On|Off", value_parser = PendingCommand::switch)]
    set_switch: Vec<PendingCommand>,

    /// Upload a file to a BLOB element
    #[arg(long, value_name = "DEVICE/PROPERTY/ELEMENT=FILE", value_parser = PendingCommand::upload)]
    upload: Vec<PendingCommand>,

    /// Write a default configuration file and exit
    #[arg(long)]
    write_config: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("indilink v{}", env!("CARGO_PKG_VERSION"));

    if args.write_config {
        config::save_default_config(&args.config)?;
        info!(path = %args.config.display(), "Wrote default configuration");
        return Ok(());
    }

    let mut config = config::load_config(&args.config)?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    info!(
        host = %config.server.host,
        port = config.server.port,
        blob_mode = config.protocol.blob_mode.as_str(),
        "Configuration loaded"
    );

    let mut pending: Vec<PendingCommand> = args
        .set_text
        .into_iter()
        .chain(args.set_number)
        .chain(args.set_switch)
        .chain(args.upload)
        .collect();

    let mut client = Client::new(config.to_client_config());
    let logger = events::spawn_logger(client.subscribe());
    client
        .connect(&config.server.host, config.server.port)
        .await?;

    loop {
        let status = tokio::select! {
            status = client.poll() => Some(status?),
            _ = tokio::signal::ctrl_c() => None,
        };
        match status {
            Some(ReadStatus::Open) => send_ready(&mut client, &mut pending).await,
            Some(ReadStatus::Closed) => break,
            None => {
                info!("Interrupted");
                client.disconnect();
                break;
            }
        }
    }

    for command in &pending {
        warn!(
            device = %command.target.device,
            property = %command.target.property,
            "Command not sent, property never defined"
        );
    }

    if args.snapshot {
        println!("{}", serde_json::to_string_pretty(&client.registry().snapshot())?);
    }

    // dropping the client closes the event channel and ends the logger
    drop(client);
    logger.await?;
    Ok(())
}

/// Send every pending command whose target property now exists
async fn send_ready(client: &mut Client, pending: &mut Vec<PendingCommand>) {
    let mut index = 0;
    while index < pending.len() {
        if !pending[index].is_ready(client.registry()) {
            index += 1;
            continue;
        }
        let command = pending.remove(index);
        if let Err(e) = command.execute(client).await {
            warn!(
                device = %command.target.device,
                property = %command.target.property,
                error = %e,
                "Command failed"
            );
        }
    }
}
