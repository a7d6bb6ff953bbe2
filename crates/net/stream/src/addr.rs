//! Multiaddr ⇄ socket address conversion for the TCP dial path.

use std::net::{IpAddr, SocketAddr};

use multiaddr::{Multiaddr, Protocol};

use crate::error::DialError;

/// Resolve a `/ip4/../tcp/..` multiaddr to a socket address.
///
/// Exactly that form is accepted; anything else is an
/// [`DialError::InvalidAddress`].
pub fn socket_addr(addr: &Multiaddr) -> Result<SocketAddr, DialError> {
    let mut protocols = addr.iter();
    let ip = match protocols.next() {
        Some(Protocol::Ip4(ip)) => IpAddr::V4(ip),
        other => {
            return Err(DialError::InvalidAddress(format!(
                "expected /ip4, got {other:?} in {addr}"
            )))
        }
    };
    let port = match protocols.next() {
        Some(Protocol::Tcp(port)) => port,
        other => {
            return Err(DialError::InvalidAddress(format!(
                "expected /tcp, got {other:?} in {addr}"
            )))
        }
    };
    if let Some(extra) = protocols.next() {
        return Err(DialError::InvalidAddress(format!(
            "trailing {extra:?} in {addr}"
        )));
    }
    Ok(SocketAddr::new(ip, port))
}

/// Render a connected socket's address as a multiaddr.
pub fn to_multiaddr(addr: SocketAddr) -> Multiaddr {
    let mut out = Multiaddr::empty();
    match addr.ip() {
        IpAddr::V4(ip) => out.push(Protocol::Ip4(ip)),
        IpAddr::V6(ip) => out.push(Protocol::Ip6(ip)),
    }
    out.push(Protocol::Tcp(addr.port()));
    out
}
