//! relay-io daemon
//!
//! Starts a relay server, feeds it numbered records from the counter source
//! and logs records sent back by clients. Runs until Ctrl-C.

use crossbeam_channel::{RecvTimeoutError, bounded};
use relay_io::source::CounterSource;
use relay_io::{AppConfig, Error, Rejected, RelayServer, Result};
use std::env;
use std::path::Path;

/// Parse config path from command line arguments.
///
/// Supports:
/// - `relay-io <path>` (positional)
/// - `relay-io --config <path>` (flag-based)
/// - `relay-io -c <path>` (short flag)
///
/// Defaults to `relay.toml` if not specified.
fn parse_config_path() -> String {
    let args: Vec<String> = env::args().collect();

    for i in 1..args.len() {
        if (args[i] == "--config" || args[i] == "-c") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }

    if args.len() > 1 && !args[1].starts_with('-') {
        return args[1].clone();
    }

    "relay.toml".to_string()
}

fn load_config(path: &str) -> Result<AppConfig> {
    if Path::new(path).exists() {
        log::info!("Using config: {}", path);
        AppConfig::from_file(path)
    } else {
        log::warn!("Config {} not found, using defaults", path);
        Ok(AppConfig::default())
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("relay-io v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = load_config(&parse_config_path())?;

    let on_record = |record: &[u8]| -> std::result::Result<(), Rejected> {
        log::debug!("Client record: {:02X?}", record);
        Ok(())
    };
    let server = RelayServer::start(config.server.clone(), on_record)?;

    // Explicit shutdown token instead of a process-wide flag
    let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        let _ = shutdown_tx.try_send(());
    })
    .map_err(|e| Error::Resource(format!("Error setting Ctrl-C handler: {}", e)))?;

    let mut source = CounterSource::new(server.record_size(), &config.source);
    log::info!(
        "Emitting a record every {:?} ({})",
        source.interval(),
        match config.source.limit {
            0 => "no limit".to_string(),
            n => format!("limit {}", n),
        }
    );

    loop {
        match shutdown_rx.recv_timeout(source.interval()) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        match source.next() {
            Some(record) => {
                if let Err(e) = server.send(&record) {
                    log::error!("Broadcast failed: {}", e);
                    break;
                }
            }
            None => {
                log::info!("Frame source exhausted after {} records", source.produced());
                let _ = shutdown_rx.recv();
                break;
            }
        }
    }

    let stats = server.stats();
    server.stop()?;
    log::info!(
        "Shutdown complete: {} sent, {} received, {} lost",
        stats.sent,
        stats.received,
        stats.lost
    );
    Ok(())
}
