//! Listening socket setup

use crate::error::{Error, Result};
use crate::net::{passive_candidates, resolve_service};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener};

/// Socket parameters recorded when the listener was bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketKind {
    pub domain: Domain,
    pub ty: Type,
    pub protocol: Protocol,
}

/// A bound, listening, non-blocking socket
#[derive(Debug)]
pub(crate) struct BoundListener {
    pub listener: TcpListener,
    pub local_addr: SocketAddr,
    pub kind: SocketKind,
}

/// Bind the first wildcard address that works for `service` and start listening
///
/// Candidates are tried in order (IPv4, then IPv6). Each candidate gets
/// address reuse and no-delay before bind; the first one that binds and
/// listens wins.
pub(crate) fn bind_listener(service: &str, backlog: i32) -> Result<BoundListener> {
    let port = resolve_service(service)?;
    let candidates = passive_candidates(port);
    if candidates.is_empty() {
        return Err(Error::Address(format!("no local address for {}", service)));
    }

    let mut last_err = None;
    for addr in candidates {
        match bind_candidate(addr, backlog) {
            Ok(bound) => {
                log::debug!("Listener bound to {}", bound.local_addr);
                return Ok(bound);
            }
            Err(e) => {
                log::debug!("Bind to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }

    Err(Error::Bind {
        service: service.to_string(),
        source: last_err.unwrap_or_else(|| io::Error::other("no candidate address")),
    })
}

fn bind_candidate(addr: SocketAddr, backlog: i32) -> io::Result<BoundListener> {
    let kind = SocketKind {
        domain: Domain::for_address(addr),
        ty: Type::STREAM,
        protocol: Protocol::TCP,
    };

    let socket = Socket::new(kind.domain, kind.ty, Some(kind.protocol))?;
    socket.set_reuse_address(true)?;
    socket.set_tcp_nodelay(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;

    let listener: TcpListener = socket.into();
    let local_addr = listener.local_addr()?;
    Ok(BoundListener {
        listener,
        local_addr,
        kind,
    })
}
