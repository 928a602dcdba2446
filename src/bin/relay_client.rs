//! Command-line client for a relay server
//!
//! Usage:
//!   relay-client send --count 100 --interval-ms 10
//!   relay-client recv --timeout-ms 1000
//!   relay-client --server 192.168.1.10:60000 recv --count 50
//!
//! Enable debug logging to see every record:
//!   RUST_LOG=debug relay-client recv

use clap::{Parser, Subcommand};
use relay_io::source::CounterSource;
use relay_io::{Error, RecvTimeout, RelayClient, Result, SourceConfig, WAIT_FOREVER};
use std::thread;
use std::time::Instant;

/// Relay client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address as host:port
    #[arg(short, long, default_value = "localhost:60000")]
    server: String,

    /// Record size agreed with the server
    #[arg(short = 'n', long, default_value = "16")]
    record_size: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send numbered records to the server
    Send {
        /// Number of records to send (0 = until interrupted)
        #[arg(short, long, default_value = "1")]
        count: u64,

        /// Pause between records
        #[arg(long, default_value = "0")]
        interval_ms: u64,
    },
    /// Print records broadcast by the server
    Recv {
        /// Stop after this many records (0 = unlimited)
        #[arg(short, long, default_value = "0")]
        count: u64,

        /// Receive timeout (0 = poll, 65535 = wait forever)
        #[arg(short, long, default_value_t = WAIT_FOREVER)]
        timeout_ms: u16,
    },
}

fn send(client: &mut RelayClient, record_size: usize, count: u64, interval_ms: u64) -> Result<()> {
    let config = SourceConfig {
        interval_ms,
        limit: count,
    };
    let source = CounterSource::new(record_size, &config);
    let interval = source.interval();

    let started = Instant::now();
    let mut sent = 0u64;
    for record in source {
        client.send(&record)?;
        sent += 1;
        log::debug!("Sent {:02X?}", record);
        if !interval.is_zero() {
            thread::sleep(interval);
        }
    }
    log::info!(
        "{} record(s) sent in {:.3} sec",
        sent,
        started.elapsed().as_secs_f64()
    );
    Ok(())
}

fn recv(client: &mut RelayClient, record_size: usize, count: u64, timeout_ms: u16) -> Result<()> {
    let timeout = RecvTimeout::from_millis(timeout_ms);
    let mut record = vec![0u8; record_size];
    let mut received = 0u64;

    while count == 0 || received < count {
        match client.recv(&mut record, timeout) {
            Ok(_) => {
                received += 1;
                println!("{:>8}: {:02X?}", received, record);
            }
            Err(Error::NoData) => {
                log::info!("No data within {} ms", timeout_ms);
                break;
            }
            Err(Error::Disconnected) => {
                log::info!("Server closed the connection");
                break;
            }
            Err(e) => return Err(e),
        }
    }
    log::info!("{} record(s) received", received);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut client = RelayClient::connect(&args.server)?;
    let result = match args.command {
        Command::Send { count, interval_ms } => {
            send(&mut client, args.record_size, count, interval_ms)
        }
        Command::Recv { count, timeout_ms } => {
            recv(&mut client, args.record_size, count, timeout_ms)
        }
    };
    client.close()?;
    result
}

