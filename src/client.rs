//! Client connector for relay servers
//!
//! A [`RelayClient`] is one TCP connection to a relay server. Records have no
//! framing on the wire, so both sides must agree on the record size out of
//! band; `recv` treats a short read as a framing error.
//!
//! # Example
//!
//! ```no_run
//! use relay_io::client::{RecvTimeout, RelayClient};
//! use std::time::Duration;
//!
//! let mut client = RelayClient::connect("localhost:60000")?;
//! client.send(&[0u8; 16])?;
//!
//! let mut record = [0u8; 16];
//! client.recv(&mut record, RecvTimeout::Bounded(Duration::from_millis(100)))?;
//! client.close()?;
//! # Ok::<(), relay_io::Error>(())
//! ```

use crate::error::{Error, Result};
use crate::net::resolve_remote;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

/// Millisecond timeout value that means "wait forever"
pub const WAIT_FOREVER: u16 = u16::MAX;

/// How long `recv` waits for a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvTimeout {
    /// Return `NoData` at once if nothing is pending
    Immediate,
    /// Wait up to this long
    Bounded(Duration),
    /// Block until data or end of stream
    Forever,
}

impl RecvTimeout {
    /// Map a millisecond value: 0 is immediate, [`WAIT_FOREVER`] blocks
    pub fn from_millis(ms: u16) -> Self {
        match ms {
            0 => RecvTimeout::Immediate,
            WAIT_FOREVER => RecvTimeout::Forever,
            ms => RecvTimeout::Bounded(Duration::from_millis(u64::from(ms))),
        }
    }
}

/// Connection to a relay server
#[derive(Debug)]
pub struct RelayClient {
    stream: TcpStream,
}

impl RelayClient {
    /// Connect to `host:port`, trying each resolved address in order
    pub fn connect(address: &str) -> Result<Self> {
        let candidates = resolve_remote(address)?;

        let mut last_err = None;
        for addr in candidates {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    log::info!("Connected to relay server at {}", addr);
                    return Ok(Self { stream });
                }
                Err(e) => {
                    log::debug!("Connect to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }

        Err(Error::Connect {
            address: address.to_string(),
            source: last_err.unwrap_or_else(|| std::io::Error::other("no candidate address")),
        })
    }

    /// Send the whole buffer, returning the number of bytes written
    pub fn send(&mut self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Err(Error::InvalidArgument("nothing to send".to_string()));
        }
        self.stream.write_all(data)?;
        Ok(data.len())
    }

    /// Receive one record of `buffer.len()` bytes
    ///
    /// Errors: `NoData` if nothing arrived in time, `MalformedMessage` if a
    /// read returned fewer bytes than the buffer holds, `Disconnected` if the
    /// server closed the connection.
    pub fn recv(&mut self, buffer: &mut [u8], timeout: RecvTimeout) -> Result<usize> {
        if buffer.is_empty() {
            return Err(Error::InvalidArgument("receive buffer is empty".to_string()));
        }

        let result = match timeout {
            RecvTimeout::Immediate => {
                self.stream.set_nonblocking(true)?;
                let result = self.stream.read(buffer);
                self.stream.set_nonblocking(false)?;
                result
            }
            RecvTimeout::Bounded(wait) => {
                // A zero read timeout would mean "block forever"
                self.stream
                    .set_read_timeout(Some(wait.max(Duration::from_millis(1))))?;
                self.stream.read(buffer)
            }
            RecvTimeout::Forever => {
                self.stream.set_read_timeout(None)?;
                self.stream.read(buffer)
            }
        };

        match result {
            Ok(0) => Err(Error::Disconnected),
            Ok(n) if n < buffer.len() => Err(Error::MalformedMessage {
                expected: buffer.len(),
                actual: n,
            }),
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(Error::NoData)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Local address of the connection
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    /// Server address of the connection
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// Shut the connection down and release the socket
    pub fn close(self) -> Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // Already reset by the server
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}
