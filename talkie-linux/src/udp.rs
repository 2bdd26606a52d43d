//! UDP broadcast transport. Every talker binds the same port and broadcasts
//! to it; datagrams from any other source port are ignored.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};
use talkie_core::transport::{Transport, TransportError};
use talkie_core::MAX_MESSAGE_LEN;

pub struct UdpTransport {
    port: u16,
    socket: Option<UdpSocket>,
    buf: Vec<u8>,
}

impl UdpTransport {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            socket: None,
            buf: vec![0u8; MAX_MESSAGE_LEN],
        }
    }

    fn broadcast_address(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, self.port))
    }
}

/// Non-blocking, broadcast-enabled socket on 0.0.0.0:port that other talkers
/// on the same host can share.
fn bind_broadcast(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

impl Transport for UdpTransport {
    type Address = SocketAddr;

    fn open(&mut self) -> Result<(), TransportError> {
        if self.socket.is_none() {
            self.socket = Some(bind_broadcast(self.port)?);
            log::debug!("udp bound on port {}", self.port);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.socket = None;
    }

    fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    fn send(&mut self, bytes: &[u8], to: Option<&SocketAddr>) -> Result<(), TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::Closed)?;
        let to = to.copied().unwrap_or_else(|| self.broadcast_address());
        socket.send_to(bytes, to)?;
        Ok(())
    }

    fn receive(&mut self) -> Option<(Vec<u8>, Option<SocketAddr>)> {
        let socket = self.socket.as_ref()?;
        loop {
            match socket.recv_from(&mut self.buf) {
                Ok((n, from)) if from.port() == self.port => {
                    return Some((self.buf[..n].to_vec(), Some(from)));
                }
                Ok((_, from)) => log::trace!("ignored datagram from {}", from),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return None,
                Err(e) => {
                    log::warn!("udp receive failed: {}", e);
                    return None;
                }
            }
        }
    }

    fn port(&self) -> String {
        self.port.to_string()
    }

    /// Binds the new port before releasing the old one; on failure the
    /// transport stays where it was.
    fn set_port(&mut self, port: &str) -> Result<(), TransportError> {
        let new_port = port
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| TransportError::InvalidPort(port.to_string()))?;
        if self.socket.is_some() {
            self.socket = Some(bind_broadcast(new_port)?);
        }
        log::info!("udp port {} -> {}", self.port, new_port);
        self.port = new_port;
        Ok(())
    }

    fn describe(&self) -> String {
        let state = if self.is_open() { "open" } else { "closed" };
        format!("UDP(port={}, {})", self.port, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_ports() {
        let mut udp = UdpTransport::new(5005);
        assert!(matches!(udp.set_port("0"), Err(TransportError::InvalidPort(_))));
        assert!(matches!(udp.set_port("70000"), Err(TransportError::InvalidPort(_))));
        udp.set_port("5006").unwrap();
        assert_eq!(udp.port(), "5006");
        assert!(!udp.is_open());
    }

    #[test]
    fn closed_transport_cannot_send() {
        let mut udp = UdpTransport::new(5005);
        assert!(matches!(udp.send(b"{}", None), Err(TransportError::Closed)));
        assert!(udp.receive().is_none());
    }
}
