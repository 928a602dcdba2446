//! Connection registry
//!
//! The set of open descriptors of one server: the listening socket plus every
//! accepted client, and the highest descriptor value among them. The registry
//! lives behind the server's lock; callers take a [`Snapshot`] and do their
//! socket I/O after releasing it.

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::RawFd;
use std::sync::Arc;

/// One accepted client connection
#[derive(Debug, Clone)]
pub struct ClientEntry {
    /// Shared so a broadcast snapshot keeps the descriptor open while writing
    pub stream: Arc<TcpStream>,
    /// Remote address reported by accept()
    pub peer: SocketAddr,
}

/// Copy of the registry taken under the lock
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub clients: Vec<(RawFd, ClientEntry)>,
    pub max_fd: RawFd,
}

/// Listening socket plus all accepted clients
#[derive(Debug)]
pub struct ConnectionRegistry {
    listener: RawFd,
    clients: BTreeMap<RawFd, ClientEntry>,
    max_fd: RawFd,
}

impl ConnectionRegistry {
    /// Registry holding only the listening socket
    pub fn new(listener: RawFd) -> Self {
        Self {
            listener,
            clients: BTreeMap::new(),
            max_fd: listener,
        }
    }

    /// Descriptor of the listening socket
    pub fn listener_fd(&self) -> RawFd {
        self.listener
    }

    /// Highest descriptor currently in the registry
    pub fn max_fd(&self) -> RawFd {
        self.max_fd
    }

    /// Add an accepted client under its descriptor
    pub fn insert(&mut self, fd: RawFd, entry: ClientEntry) {
        self.clients.insert(fd, entry);
        self.max_fd = self.max_fd.max(fd);
    }

    /// Remove a client; the descriptor closes once the last snapshot drops it
    pub fn remove(&mut self, fd: RawFd) -> Option<ClientEntry> {
        let entry = self.clients.remove(&fd)?;
        if fd == self.max_fd {
            self.max_fd = self
                .clients
                .keys()
                .next_back()
                .copied()
                .unwrap_or(self.listener)
                .max(self.listener);
        }
        Some(entry)
    }

    /// Look up a client by descriptor
    pub fn get(&self, fd: RawFd) -> Option<&ClientEntry> {
        self.clients.get(&fd)
    }

    /// Whether `fd` is the listener or a registered client
    pub fn contains(&self, fd: RawFd) -> bool {
        fd == self.listener || self.clients.contains_key(&fd)
    }

    /// Number of connected clients (the listener is not counted)
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Remote addresses of all connected clients, in descriptor order
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.clients.values().map(|entry| entry.peer).collect()
    }

    /// Clients and max descriptor, for use outside the lock
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            clients: self
                .clients
                .iter()
                .map(|(fd, entry)| (*fd, entry.clone()))
                .collect(),
            max_fd: self.max_fd,
        }
    }

    /// Remove every client, leaving only the listener
    pub fn drain(&mut self) -> Vec<(RawFd, ClientEntry)> {
        self.max_fd = self.listener;
        std::mem::take(&mut self.clients).into_iter().collect()
    }
}
