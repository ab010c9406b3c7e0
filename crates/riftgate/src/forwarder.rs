//! The relay worker a proxy server hosts.
//!
//! Each active session owns one UDP relay endpoint: datagrams arriving from
//! either of the session's two fixed peers are pumped to the other, and every
//! relayed datagram refreshes an inactivity clock. Endpoints past their
//! timeout are closed; a configurable cap bounds concurrent relays.
//!
//! The raw socket is a collaborator behind [`RelaySocket`] so the pump stays
//! non-blocking and tick-driven; [`crate::udp::UdpRelayProvider`] is the
//! production implementation.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::ForwardOutcome;
use crate::MAX_RELAY_DATAGRAM_SIZE;

/// Address family for the relay socket a directive allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketFamily {
    /// Bind an IPv4 socket
    #[default]
    Ipv4,
    /// Bind an IPv6 socket
    Ipv6,
}

/// Non-blocking datagram socket used by one relay endpoint.
pub trait RelaySocket {
    /// Port the socket is bound to.
    fn local_port(&self) -> u16;

    /// Receive one queued datagram; `Ok(None)` when nothing is pending.
    ///
    /// # Errors
    ///
    /// Returns any socket error other than "would block".
    fn try_recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    /// Send one datagram without blocking; a full send buffer drops it.
    ///
    /// # Errors
    ///
    /// Returns any socket error other than "would block".
    fn try_send_to(&mut self, buf: &[u8], to: SocketAddr) -> io::Result<()>;
}

/// Binds relay sockets on demand.
pub trait RelaySocketProvider {
    /// Bind an ephemeral-port socket for the requested family.
    ///
    /// # Errors
    ///
    /// Returns the bind error; the caller reports it as
    /// [`ForwardOutcome::BindFailed`].
    fn bind(&mut self, family: SocketFamily) -> io::Result<Box<dyn RelaySocket>>;
}

/// Forwarder tuning.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Maximum concurrent relay endpoints
    pub max_relays: usize,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self { max_relays: 256 }
    }
}

struct RelayEndpoint {
    socket: Box<dyn RelaySocket>,
    peer_a: SocketAddr,
    peer_b: SocketAddr,
    timeout_ms: u64,
    last_activity_ms: u64,
}

impl RelayEndpoint {
    fn serves(&self, peer_a: SocketAddr, peer_b: SocketAddr) -> bool {
        (self.peer_a == peer_a && self.peer_b == peer_b)
            || (self.peer_a == peer_b && self.peer_b == peer_a)
    }

    fn expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_activity_ms) >= self.timeout_ms
    }

    /// Drain the socket, pumping each datagram to the opposite peer.
    fn pump(&mut self, buf: &mut [u8], now_ms: u64) {
        loop {
            let (len, from) = match self.socket.try_recv_from(buf) {
                Ok(Some(received)) => received,
                Ok(None) => return,
                Err(e) => {
                    tracing::debug!("relay recv error on port {}: {e}", self.socket.local_port());
                    return;
                }
            };
            let to = if from == self.peer_a {
                self.peer_b
            } else if from == self.peer_b {
                self.peer_a
            } else {
                tracing::trace!("dropping relay datagram from unknown source {from}");
                continue;
            };
            self.last_activity_ms = now_ms;
            if let Err(e) = self.socket.try_send_to(&buf[..len], to) {
                tracing::debug!("relay send to {to} failed: {e}");
            }
        }
    }
}

/// Pumps datagrams between fixed peer pairs through per-session UDP relays.
pub struct Forwarder {
    config: ForwarderConfig,
    provider: Box<dyn RelaySocketProvider>,
    relays: Vec<RelayEndpoint>,
    buf: Vec<u8>,
}

impl Forwarder {
    /// Create a forwarder that binds relay sockets through `provider`.
    #[must_use]
    pub fn new(config: ForwarderConfig, provider: Box<dyn RelaySocketProvider>) -> Self {
        Self {
            config,
            provider,
            relays: Vec::new(),
            buf: vec![0u8; MAX_RELAY_DATAGRAM_SIZE],
        }
    }

    /// Start relaying between `peer_a` and `peer_b`.
    ///
    /// Returns the outcome code and the allocated relay port (the existing
    /// port when a relay for this unordered pair is already active, 0 on
    /// failure). The inactivity clock starts at `now_ms`.
    pub fn start_forwarding(
        &mut self,
        peer_a: SocketAddr,
        peer_b: SocketAddr,
        timeout: Duration,
        family: SocketFamily,
        now_ms: u64,
    ) -> (ForwardOutcome, u16) {
        if let Some(existing) = self.relays.iter().find(|r| r.serves(peer_a, peer_b)) {
            return (ForwardOutcome::AlreadyForwarding, existing.socket.local_port());
        }
        if self.relays.len() >= self.config.max_relays {
            tracing::debug!(
                "relay capacity reached ({}), refusing {peer_a} <-> {peer_b}",
                self.config.max_relays
            );
            return (ForwardOutcome::NoFreeRelays, 0);
        }
        let socket = match self.provider.bind(family) {
            Ok(socket) => socket,
            Err(e) => {
                tracing::debug!("relay socket bind failed: {e}");
                return (ForwardOutcome::BindFailed, 0);
            }
        };
        let port = socket.local_port();
        tracing::debug!("relaying {peer_a} <-> {peer_b} on port {port}");
        self.relays.push(RelayEndpoint {
            socket,
            peer_a,
            peer_b,
            timeout_ms: timeout.as_millis() as u64,
            last_activity_ms: now_ms,
        });
        (ForwardOutcome::Started, port)
    }

    /// Drain every relay socket and expire idle endpoints. Never blocks.
    pub fn update(&mut self, now_ms: u64) {
        for relay in &mut self.relays {
            relay.pump(&mut self.buf, now_ms);
        }
        self.relays.retain(|relay| {
            let keep = !relay.expired(now_ms);
            if !keep {
                tracing::debug!(
                    "relay {} <-> {} idle past {}ms, closing port {}",
                    relay.peer_a,
                    relay.peer_b,
                    relay.timeout_ms,
                    relay.socket.local_port()
                );
            }
            keep
        });
    }

    /// Close every relay endpoint immediately.
    pub fn shutdown(&mut self) {
        if !self.relays.is_empty() {
            tracing::debug!("closing {} active relays", self.relays.len());
        }
        self.relays.clear();
    }

    /// Number of active relay endpoints.
    #[must_use]
    pub fn active_relays(&self) -> usize {
        self.relays.len()
    }
}
