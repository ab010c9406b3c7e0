//! Production relay sockets over tokio's non-blocking UDP API.
//!
//! The forwarder pump is tick-driven, so the socket wrapper only uses the
//! runtime's `try_recv_from`/`try_send_to` fast paths; "would block" simply
//! ends the current drain. Sockets are bound synchronously through std and
//! then registered with the runtime, so `bind` can run inside a message
//! callback without awaiting.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::forwarder::{RelaySocket, RelaySocketProvider, SocketFamily};

/// Relay socket backed by a tokio [`UdpSocket`](tokio::net::UdpSocket).
pub struct UdpRelaySocket {
    socket: tokio::net::UdpSocket,
    port: u16,
}

impl RelaySocket for UdpRelaySocket {
    fn local_port(&self) -> u16 {
        self.port
    }

    fn try_recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.try_recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn try_send_to(&mut self, buf: &[u8], to: SocketAddr) -> io::Result<()> {
        match self.socket.try_send_to(buf, to) {
            Ok(_) => Ok(()),
            // A full send buffer drops the datagram; UDP relaying is best-effort.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Binds ephemeral-port [`UdpRelaySocket`]s.
///
/// Must be used from within a tokio runtime: the freshly bound socket is
/// registered with the runtime's I/O driver.
#[derive(Debug, Default)]
pub struct UdpRelayProvider;

impl RelaySocketProvider for UdpRelayProvider {
    fn bind(&mut self, family: SocketFamily) -> io::Result<Box<dyn RelaySocket>> {
        let bind_addr = match family {
            SocketFamily::Ipv4 => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketFamily::Ipv6 => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let std_socket = std::net::UdpSocket::bind(bind_addr)?;
        std_socket.set_nonblocking(true)?;
        let port = std_socket.local_addr()?.port();
        let socket = tokio::net::UdpSocket::from_std(std_socket)?;
        Ok(Box::new(UdpRelaySocket { socket, port }))
    }
}
