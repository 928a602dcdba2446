//! Multiplexing loop
//!
//! A single background thread waits for readability on the listening socket
//! and on every client socket, accepts new connections and relays inbound
//! records to the [`RecordHandler`].
//!
//! # Cancellation
//!
//! The wait is a `mio::Poll` with a `mio::Waker` registered under
//! [`WAKE_TOKEN`]. Stopping the server wakes the poll; the loop sees the wake
//! token, returns, and hands the listener back to the caller. No lock is held
//! while waiting, so the thread can never be stopped with the registry locked.
//!
//! # Readiness
//!
//! Descriptors are registered under a token equal to their value when they
//! enter the registry and deregistered when they leave it. mio reports edges,
//! so every event is drained: accept until `WouldBlock`, read until
//! `WouldBlock`. An accept that fails for another reason (descriptor table
//! full) leaves connections queued with no new edge to come, so the loop
//! then polls with [`ACCEPT_RETRY_INTERVAL`] and retries the accept on every
//! pass until the queue is empty.
//!
//! # Failures
//!
//! A panic in the handler is caught and counted like a rejected record. If
//! the loop exits for any reason, the running flag is cleared so broadcasts
//! report `NotRunning` instead of writing into a dead server.

use crate::handler::RecordHandler;
use crate::server::registry::ClientEntry;
use crate::server::session_log::Direction;
use crate::server::{Event, Shared};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::io::{ErrorKind, Read};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

/// Token of the shutdown waker; never a valid descriptor
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

/// Capacity of the readiness event buffer
const EVENTS_CAPACITY: usize = 64;

/// Poll timeout while accepted connections are still queued after a failure
pub(crate) const ACCEPT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Pause after a failed poll
const POLL_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Consecutive poll failures after which the loop gives up
const MAX_POLL_ERRORS: u32 = 100;

/// Clears the running flag when the loop exits, including by unwinding
struct RunningGuard(Arc<Shared>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::SeqCst);
    }
}

/// Consecutive poll failure count
#[derive(Debug, Default)]
pub(crate) struct PollErrors {
    consecutive: u32,
}

impl PollErrors {
    /// Count one failure; true once the loop should give up
    pub(crate) fn record(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive >= MAX_POLL_ERRORS
    }

    pub(crate) fn reset(&mut self) {
        self.consecutive = 0;
    }
}

/// Background task owning all socket reads and accepts of one server
pub(crate) struct Multiplexer<H: RecordHandler> {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    shared: Arc<Shared>,
    handler: H,
    buffer: Vec<u8>,
    /// Connections may still be queued on the listener
    accept_backlog: bool,
}

impl<H: RecordHandler> Multiplexer<H> {
    /// Wrap a poll (with the waker already registered) and a bound listener
    pub(crate) fn new(
        poll: Poll,
        listener: TcpListener,
        shared: Arc<Shared>,
        handler: H,
    ) -> std::io::Result<Self> {
        let fd = listener.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&fd), token_for(fd), Interest::READABLE)?;

        let buffer = vec![0u8; shared.record_size];
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener,
            shared,
            handler,
            buffer,
            accept_backlog: false,
        })
    }

    /// Run until the waker fires, then return the listener for closing
    pub(crate) fn run(mut self) -> TcpListener {
        let _running = RunningGuard(Arc::clone(&self.shared));
        let listener_fd = self.listener.as_raw_fd();
        self.shared.note(
            Event::Connection,
            format_args!("Server started on socket {}", listener_fd),
        );

        let mut poll_errors = PollErrors::default();
        loop {
            let timeout = self.accept_backlog.then_some(ACCEPT_RETRY_INTERVAL);
            // Sole suspension point of the loop
            if let Err(e) = self.poll.poll(&mut self.events, timeout) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                self.shared.fail(format_args!("Poll failed: {}", e));
                if poll_errors.record() {
                    self.shared.fail(format_args!(
                        "Server on socket {} gave up after {} poll failures",
                        listener_fd, MAX_POLL_ERRORS
                    ));
                    let _ = self.poll.registry().deregister(&mut SourceFd(&listener_fd));
                    return self.listener;
                }
                thread::sleep(POLL_ERROR_BACKOFF);
                continue;
            }
            poll_errors.reset();

            if self.accept_backlog {
                self.accept_pending();
            }

            let tokens: Vec<Token> = self.events.iter().map(|event| event.token()).collect();
            for token in tokens {
                if token == WAKE_TOKEN {
                    self.shared.running.store(false, Ordering::SeqCst);
                    self.shared.note(
                        Event::Connection,
                        format_args!("Server stopped on socket {}", listener_fd),
                    );
                    let _ = self.poll.registry().deregister(&mut SourceFd(&listener_fd));
                    return self.listener;
                } else if token == token_for(listener_fd) {
                    self.accept_pending();
                } else {
                    self.service_client(token.0 as RawFd);
                }
            }
        }
    }

    /// Accept every pending connection
    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.accept_backlog = false;
                    return;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Typically EMFILE/ENFILE; the pending connection stays queued
                    if !self.accept_backlog {
                        self.shared.fail(format_args!("Accept failed: {}", e));
                    }
                    self.accept_backlog = true;
                    return;
                }
            }
        }
    }

    /// Configure an accepted socket and add it to the registry
    fn admit(&mut self, stream: TcpStream, peer: std::net::SocketAddr) {
        let fd = stream.as_raw_fd();

        if let Err(e) = stream.set_nodelay(true) {
            self.shared.fail(format_args!(
                "Set TCP_NODELAY failed on socket {}: {}",
                fd, e
            ));
            return;
        }
        if let Err(e) = stream.set_nonblocking(true) {
            self.shared
                .fail(format_args!("Set non-blocking failed on socket {}: {}", fd, e));
            return;
        }
        if let Err(e) =
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), token_for(fd), Interest::READABLE)
        {
            self.shared
                .fail(format_args!("Register failed on socket {}: {}", fd, e));
            return;
        }

        self.shared.registry.lock().insert(
            fd,
            ClientEntry {
                stream: Arc::new(stream),
                peer,
            },
        );
        self.shared.note(
            Event::Connection,
            format_args!("New connection from {} on socket {}", peer.ip(), fd),
        );
    }

    /// Read every record currently buffered on one client
    fn service_client(&mut self, fd: RawFd) {
        let Some(stream) = self
            .shared
            .registry
            .lock()
            .get(fd)
            .map(|entry| Arc::clone(&entry.stream))
        else {
            return;
        };

        loop {
            match (&*stream).read(&mut self.buffer) {
                Ok(0) => {
                    self.shared
                        .note(Event::Connection, format_args!("Socket {} hung up", fd));
                    self.drop_client(fd, &stream);
                    return;
                }
                Ok(n) => self.deliver(fd, n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                    self.shared.note(
                        Event::Connection,
                        format_args!("Connection reset by peer on socket {}", fd),
                    );
                    self.drop_client(fd, &stream);
                    return;
                }
                Err(e) => {
                    self.shared
                        .fail(format_args!("Receive failed on socket {}: {}", fd, e));
                    self.drop_client(fd, &stream);
                    return;
                }
            }
        }
    }

    /// Hand one record to the handler and account for the outcome
    fn deliver(&mut self, fd: RawFd, n: usize) {
        let record = &self.buffer[..n];
        self.shared.counters.record_received();
        self.shared.note(
            Event::Data,
            format_args!("Received {} bytes from socket {}", n, fd),
        );
        self.shared.dump(Direction::Received, record);

        let handler = &mut self.handler;
        match panic::catch_unwind(AssertUnwindSafe(|| handler.on_record(record))) {
            Ok(Ok(())) => {}
            Ok(Err(rejected)) => {
                self.shared.counters.record_lost();
                self.shared.fail(format_args!(
                    "Receive callback failed for socket {} ({})",
                    fd, rejected
                ));
            }
            Err(_) => {
                self.shared.counters.record_lost();
                self.shared.fail(format_args!(
                    "Receive callback panicked for socket {}",
                    fd
                ));
            }
        }
    }

    /// Remove a client from the registry and close it
    fn drop_client(&mut self, fd: RawFd, stream: &TcpStream) {
        let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        self.shared.registry.lock().remove(fd);
        let _ = stream.shutdown(Shutdown::Both);
    }
}

/// Poll token for a descriptor
pub(crate) fn token_for(fd: RawFd) -> Token {
    Token(fd as usize)
}
