//! Relay server: broadcast records to every connected client and hand records
//! sent by clients to the host through a [`RecordHandler`].
//!
//! # Threads
//!
//! ```text
//!   producer thread(s)                 multiplexing thread
//!   ──────────────────                 ───────────────────
//!   RelayServer::send()                poll(listener, clients, waker)
//!     │ lock registry → snapshot         │ accept  → lock → insert
//!     │ unlock                           │ read    → RecordHandler::on_record
//!     └ write record to each client      └ hang-up → lock → remove
//! ```
//!
//! The registry lock is only held to copy or mutate the descriptor set, never
//! across socket I/O. [`RelayServer::stop`] wakes the poll through a
//! `mio::Waker`, joins the thread, closes every client and finally the
//! listener.
//!
//! # Example
//!
//! ```no_run
//! use relay_io::{Rejected, RelayServer, ServerConfig};
//!
//! let on_record = |record: &[u8]| -> Result<(), Rejected> {
//!     println!("client sent {:02X?}", record);
//!     Ok(())
//! };
//! let server = RelayServer::start(ServerConfig::new("60000", 16), on_record)?;
//!
//! server.send(&[0xAA; 16])?;
//! server.stop()?;
//! # Ok::<(), relay_io::Error>(())
//! ```

mod broadcast;
mod listener;
mod multiplexer;
pub mod registry;
pub mod session_log;
pub mod stats;

pub use listener::SocketKind;
pub use session_log::LogLevel;
pub use stats::ServerStats;

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::handler::RecordHandler;
use listener::bind_listener;
use mio::{Poll, Waker};
use multiplexer::{Multiplexer, WAKE_TOKEN};
use parking_lot::Mutex;
use registry::ConnectionRegistry;
use session_log::{Direction, SessionLog};
use stats::Counters;
use std::fmt;
use std::net::{Shutdown, SocketAddr, TcpListener};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Class of a reported event, mapped onto the session log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    /// Connects, hang-ups, start and stop
    Connection,
    /// Per-record summaries
    Data,
}

impl Event {
    /// Lowest session log level that records this event
    pub(crate) fn level(self) -> LogLevel {
        match self {
            Event::Connection => LogLevel::Connections,
            Event::Data => LogLevel::Data,
        }
    }
}

/// State shared between the multiplexing thread and broadcast callers
pub(crate) struct Shared {
    pub(crate) registry: Mutex<ConnectionRegistry>,
    pub(crate) counters: Counters,
    pub(crate) session_log: Option<SessionLog>,
    pub(crate) record_size: usize,
    pub(crate) running: AtomicBool,
}

impl Shared {
    /// Report an event to the `log` facade and, if enabled, the session log
    pub(crate) fn note(&self, event: Event, args: fmt::Arguments<'_>) {
        match event {
            Event::Connection => log::info!("{}", args),
            Event::Data => log::debug!("{}", args),
        }
        if let Some(session_log) = &self.session_log {
            session_log.event(event.level(), args);
        }
    }

    /// Report a contained failure (logged, never propagated)
    pub(crate) fn fail(&self, args: fmt::Arguments<'_>) {
        log::warn!("{}", args);
        if let Some(session_log) = &self.session_log {
            session_log.error(args);
        }
    }

    pub(crate) fn dump(&self, direction: Direction, data: &[u8]) {
        if let Some(session_log) = &self.session_log {
            session_log.dump(direction, data);
        }
    }
}

/// Handle to a running relay server
///
/// Only `start`, `send` and `stop` make up the contract; the accessors exist
/// for monitoring and tests. Dropping a running server stops it.
pub struct RelayServer {
    shared: Arc<Shared>,
    waker: Waker,
    thread: Option<JoinHandle<TcpListener>>,
    /// Serialises broadcasts so records never interleave on a client
    broadcast: Mutex<()>,
    service: String,
    local_addr: SocketAddr,
    kind: SocketKind,
    send_stall_timeout: Duration,
}

impl RelayServer {
    /// Bind the service, spawn the multiplexing thread and return the handle
    ///
    /// Fails with `InvalidArgument` for a bad configuration, `Address` when
    /// the service does not resolve, `Bind` when no candidate address can be
    /// bound, and `Resource` when the poll, the waker, the log file or the
    /// thread cannot be created. Everything created before a failure is
    /// released on the way out.
    pub fn start<H: RecordHandler>(config: ServerConfig, handler: H) -> Result<Self> {
        config.validate()?;
        let level = LogLevel::try_from(config.log_level)?;
        let session_log =
            SessionLog::open(&config.log_dir, &config.service, config.record_size, level)?;

        let report = |e: Error| {
            if let Some(session_log) = &session_log {
                session_log.error(format_args!("{}", e));
            }
            e
        };

        let bound = bind_listener(&config.service, config.backlog).map_err(report)?;
        let poll = Poll::new()
            .map_err(|e| Error::Resource(format!("cannot create poll: {}", e)))
            .map_err(report)?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)
            .map_err(|e| Error::Resource(format!("cannot create waker: {}", e)))
            .map_err(report)?;

        let listener_fd = bound.listener.as_raw_fd();
        let shared = Arc::new(Shared {
            registry: Mutex::new(ConnectionRegistry::new(listener_fd)),
            counters: Counters::default(),
            session_log,
            record_size: config.record_size,
            running: AtomicBool::new(true),
        });

        let multiplexer = Multiplexer::new(poll, bound.listener, Arc::clone(&shared), handler)
            .map_err(|e| Error::Resource(format!("cannot register listener: {}", e)));
        let multiplexer = match multiplexer {
            Ok(m) => m,
            Err(e) => {
                shared.fail(format_args!("{}", e));
                return Err(e);
            }
        };

        let thread = thread::Builder::new()
            .name("relay-mux".to_string())
            .spawn(move || multiplexer.run());
        let thread = match thread {
            Ok(t) => t,
            Err(e) => {
                let e = Error::Resource(format!("cannot spawn multiplexing thread: {}", e));
                shared.fail(format_args!("{}", e));
                return Err(e);
            }
        };

        log::info!(
            "Relay server listening on {} (service {}, record size {})",
            bound.local_addr,
            config.service,
            config.record_size
        );

        Ok(Self {
            shared,
            waker,
            thread: Some(thread),
            broadcast: Mutex::new(()),
            service: config.service.clone(),
            local_addr: bound.local_addr,
            kind: bound.kind,
            send_stall_timeout: config.send_stall_timeout(),
        })
    }

    /// Write one record to every connected client
    ///
    /// A failed write to one client is logged and skipped. With no client
    /// connected the record is counted as lost. The sent counter goes up once
    /// per call that reached at least one client.
    pub fn send(&self, record: &[u8]) -> Result<()> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        if record.is_empty() {
            return Err(Error::InvalidArgument("record is empty".to_string()));
        }
        if record.len() != self.shared.record_size {
            return Err(Error::InvalidArgument(format!(
                "record is {} bytes, server record size is {}",
                record.len(),
                self.shared.record_size
            )));
        }

        let _serial = self.broadcast.lock();
        let snapshot = self.shared.registry.lock().snapshot();

        self.shared.dump(Direction::Sending, record);

        let mut delivered = 0usize;
        for (fd, entry) in &snapshot.clients {
            match broadcast::write_record(&entry.stream, record, self.send_stall_timeout) {
                Ok(()) => delivered += 1,
                Err(e) => self
                    .shared
                    .fail(format_args!("Send failed on socket {} ({}): {}", fd, entry.peer, e)),
            }
        }

        if delivered > 0 {
            self.shared.counters.record_sent();
            self.shared.note(
                Event::Data,
                format_args!("Sent {} bytes to {} client(s)", record.len(), delivered),
            );
        } else {
            self.shared.counters.record_lost();
            let reason = if snapshot.clients.is_empty() {
                "no client connected"
            } else {
                "no client reachable"
            };
            self.shared.note(
                Event::Data,
                format_args!("Lost {} bytes ({})", record.len(), reason),
            );
        }
        Ok(())
    }

    /// Stop the multiplexing thread and release every socket
    ///
    /// Teardown is best-effort: a failure is reported, but all resources
    /// that can be released are released and the handle is consumed.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Err(Error::NotRunning);
        };

        let mut result = Ok(());
        let listener = match self.waker.wake() {
            Ok(()) => match thread.join() {
                Ok(listener) => Some(listener),
                Err(_) => {
                    result = Err(Error::Resource(
                        "multiplexing thread panicked".to_string(),
                    ));
                    None
                }
            },
            Err(e) => {
                // The thread cannot be reached; leave it detached
                self.shared
                    .fail(format_args!("Server could not be stopped: {}", e));
                result = Err(Error::Io(e));
                None
            }
        };
        self.shared.running.store(false, Ordering::SeqCst);

        let clients = self.shared.registry.lock().drain();
        for (_, entry) in &clients {
            let _ = entry.stream.shutdown(Shutdown::Both);
        }
        drop(clients);
        // Listener goes last
        drop(listener);

        let stats = self.shared.counters.snapshot();
        log::info!(
            "Relay server on service {} stopped ({} sent, {} received, {} lost)",
            self.service,
            stats.sent,
            stats.received,
            stats.lost
        );
        if let Some(session_log) = &self.shared.session_log {
            session_log.summary(&stats);
        }
        result
    }

    /// Whether the multiplexing thread is still serving
    pub fn is_running(&self) -> bool {
        self.thread.is_some() && self.shared.running.load(Ordering::SeqCst)
    }

    /// Address the listener is bound to (resolves port "0")
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Family, type and protocol of the listening socket
    pub fn socket_kind(&self) -> SocketKind {
        self.kind
    }

    /// Fixed record size of this server
    pub fn record_size(&self) -> usize {
        self.shared.record_size
    }

    /// Current record counters
    pub fn stats(&self) -> ServerStats {
        self.shared.counters.snapshot()
    }

    /// Number of connected clients
    pub fn client_count(&self) -> usize {
        self.shared.registry.lock().client_count()
    }

    /// Remote addresses of connected clients
    pub fn connected_peers(&self) -> Vec<SocketAddr> {
        self.shared.registry.lock().peers()
    }

    /// Session log file, if logging is enabled
    pub fn session_log_path(&self) -> Option<&Path> {
        self.shared.session_log.as_ref().map(SessionLog::path)
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        if self.thread.is_some()
            && let Err(e) = self.shutdown()
        {
            log::error!("Relay server shutdown failed: {}", e);
        }
    }
}
