//! LAN server discovery.
//!
//! A probe is a single magic byte sent by datagram to the server's UDP port;
//! servers answer with an application-supplied opaque payload. Nothing here
//! touches the serialization registry, so discovery works before any types
//! are registered.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr, UdpSocket},
    time::{Duration, Instant},
};

use tracing::{debug, trace};

/// One responder found by [`discover_hosts`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredHost {
    pub addr: SocketAddr,
    /// The server's discovery response payload, possibly empty.
    pub response: Vec<u8>,
}

/// Broadcasts one probe and returns the first responder's address, or `None`
/// when nobody answered within `timeout`.
pub fn discover_host(
    udp_port: u16,
    magic: u8,
    timeout: Duration,
) -> io::Result<Option<SocketAddr>> {
    let socket = probe(udp_port, magic)?;
    Ok(collect(&socket, timeout, true)?.into_iter().next().map(|h| h.addr))
}

/// Broadcasts one probe and collects every responder seen within `timeout`.
pub fn discover_hosts(
    udp_port: u16,
    magic: u8,
    timeout: Duration,
) -> io::Result<Vec<DiscoveredHost>> {
    let socket = probe(udp_port, magic)?;
    collect(&socket, timeout, false)
}

fn probe(udp_port: u16, magic: u8) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
    socket.set_broadcast(true)?;
    // the loopback interface carries no broadcast address, probe it directly
    for target in [Ipv4Addr::BROADCAST, Ipv4Addr::LOCALHOST] {
        if let Err(err) = socket.send_to(&[magic], SocketAddr::from((target, udp_port))) {
            trace!(?err, %target, "discovery probe not sent");
        }
    }
    Ok(socket)
}

fn collect(socket: &UdpSocket, timeout: Duration, first_only: bool) -> io::Result<Vec<DiscoveredHost>> {
    let deadline = Instant::now() + timeout;
    let mut hosts: Vec<DiscoveredHost> = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Ok(hosts);
        }
        socket.set_read_timeout(Some(deadline - now))?;
        match socket.recv_from(&mut buf) {
            Ok((n, addr)) => {
                if hosts.iter().any(|h| h.addr == addr) {
                    continue;
                }
                debug!(?addr, "discovered host");
                hosts.push(DiscoveredHost { addr, response: buf[..n].to_vec() });
                if first_only {
                    return Ok(hosts);
                }
            }
            Err(ref err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                return Ok(hosts);
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
}
