//! The host-provided message transport collaborator.
//!
//! The proxy roles never own a socket. The host hands a [`Transport`] into
//! every callback and tick, and the components issue fire-and-forget sends
//! through it. Reliability, ordering, and connection management are the
//! transport's business; this crate only assumes that messages from a single
//! peer arrive in order.

use std::net::SocketAddr;

use crate::protocol::{Guid, ProxyMessage};

/// Messaging services the host must supply.
///
/// Sends are fire-and-forget: a transport that cannot deliver logs and drops,
/// it does not report back. The GUID directory reflects the transport's
/// current connections and is consulted by the coordinator when a request
/// addresses its target by GUID.
pub trait Transport {
    /// Send a protocol message to a connected peer.
    fn send(&mut self, to: SocketAddr, message: &ProxyMessage);

    /// Whether a connection to `peer` is currently established.
    fn is_connected(&self, peer: SocketAddr) -> bool;

    /// Fire one unconnected, timestamped ping datagram at `peer`.
    ///
    /// The pong (if any) must echo `now_ms` back so the caller can compute a
    /// round-trip time. Also used as a NAT-priming datagram: delivery is not
    /// required to succeed.
    fn ping(&mut self, peer: SocketAddr, now_ms: u64);

    /// Resolve a persistent GUID to the address it is connected from, if any.
    fn address_of(&self, guid: Guid) -> Option<SocketAddr>;

    /// Look up the GUID of a connected peer, if the transport knows one.
    fn guid_of(&self, peer: SocketAddr) -> Option<Guid>;
}
