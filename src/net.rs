//! Address resolution shared by the server and the client connector
//!
//! Services are given as decimal port numbers or as names from the system
//! services database. Remote addresses use `host:port`, with IPv6 hosts in
//! brackets (`[::1]:60000`).

use crate::config::MAX_SERVICE_LEN;
use crate::error::{Error, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

/// System services database
const SERVICES_DB: &str = "/etc/services";

/// Resolve a service (port number or name) to a TCP port
pub fn resolve_service(service: &str) -> Result<u16> {
    if service.is_empty() || service.len() >= MAX_SERVICE_LEN {
        return Err(Error::InvalidArgument(format!(
            "invalid service {:?}",
            service
        )));
    }
    if service.bytes().all(|b| b.is_ascii_digit()) {
        return service
            .parse::<u16>()
            .map_err(|_| Error::Address(format!("port out of range: {}", service)));
    }

    let db = std::fs::read_to_string(SERVICES_DB).unwrap_or_default();
    lookup_service(&db, service)
        .ok_or_else(|| Error::Address(format!("unknown service: {}", service)))
}

/// Find a tcp entry for `name` (or one of its aliases) in services(5) text
pub fn lookup_service(db: &str, name: &str) -> Option<u16> {
    db.lines()
        .map(|line| line.split('#').next().unwrap_or(""))
        .find_map(|line| {
            let mut fields = line.split_whitespace();
            let official = fields.next()?;
            let (port, proto) = fields.next()?.split_once('/')?;
            if proto != "tcp" {
                return None;
            }
            let matches = official == name || fields.any(|alias| alias == name);
            if matches { port.parse().ok() } else { None }
        })
}

/// Local wildcard addresses to try when binding, in order (IPv4 first)
pub fn passive_candidates(port: u16) -> Vec<SocketAddr> {
    vec![
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
    ]
}

/// Split `host:port` (or `[v6-host]:port`) into its parts
pub fn split_host_port(address: &str) -> Result<(&str, &str)> {
    let invalid = || Error::InvalidArgument(format!("expected <host>:<port>, got {:?}", address));

    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, rest) = rest.split_once(']').ok_or_else(invalid)?;
        (host, rest.strip_prefix(':').ok_or_else(invalid)?)
    } else {
        address.rsplit_once(':').ok_or_else(invalid)?
    };

    if host.is_empty() || port.is_empty() {
        return Err(invalid());
    }
    Ok((host, port))
}

/// Resolve a remote `host:port` to candidate socket addresses, in order
pub fn resolve_remote(address: &str) -> Result<Vec<SocketAddr>> {
    let (host, service) = split_host_port(address)?;
    let port = resolve_service(service)?;

    let candidates: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::Address(format!("{}: {}", address, e)))?
        .collect();

    if candidates.is_empty() {
        return Err(Error::Address(format!("{} resolved to no address", address)));
    }
    Ok(candidates)
}
