//! relay-io: fixed-size record relay over TCP
//!
//! A [`RelayServer`] listens on a service, broadcasts records written by the
//! host to every connected client and hands records sent by clients to a
//! [`RecordHandler`]. [`RelayClient`] is the matching connector for remote
//! processes.
//!
//! Records are opaque byte blocks of a size fixed per server. There is no
//! length prefix on the wire; server and clients agree on the size out of
//! band.

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod net;
pub mod server;
pub mod source;

pub use client::{RecvTimeout, RelayClient, WAIT_FOREVER};
pub use config::{AppConfig, ServerConfig, SourceConfig};
pub use error::{Error, Result};
pub use handler::{RecordHandler, Rejected};
pub use server::{LogLevel, RelayServer, ServerStats, SocketKind};
