//! # riftgate
//!
//! UDP NAT-traversal relay coordination for game networking.
//!
//! When two peers behind restrictive routers cannot connect directly, a
//! trusted coordinator directs a pool of publicly reachable proxy servers to
//! relay datagrams between them. Three roles cooperate over a host-provided
//! message transport, and each server hosts a [`Forwarder`] that does the
//! actual datagram pumping:
//!
//! ```text
//!      ┌──────────────┐   forwarding request    ┌─────────────────┐
//!      │  ProxyClient ├────────────────────────►│ ProxyCoordinator│
//!      │   (NAT'd)    │◄────────────────────────┤  (rendezvous)   │
//!      └──────┬───────┘   ping candidates /     └────────┬────────┘
//!             │            final outcome                 │ directive
//!             │ latency probes                           ▼
//!             │                                 ┌─────────────────┐
//!             └────────────────────────────────►│   ProxyServer   │
//!                                               │   + Forwarder   │
//!                         relayed datagrams     │   (public IP)   │
//!          peer A ◄────────────────────────────►│                 │◄───► peer B
//!                                               └─────────────────┘
//! ```
//!
//! The coordinator authenticates servers with a shared password, asks the two
//! affected clients to ping every candidate server, picks the server with the
//! lowest summed round-trip time, and relays the server's allocated relay
//! endpoint back to the clients.
//!
//! ## Concurrency model
//!
//! The protocol core is sans-IO and tick-driven. Components never block and
//! never own a socket or a clock: the host calls `on_message` for every
//! arriving protocol message and `update` once per event-loop iteration,
//! passing a monotonic `now_ms` and the [`Transport`] collaborator. "Waiting"
//! is retained state (pending logins, ping groups, forwarding sessions)
//! checked against elapsed time on each tick. The one I/O leaf is the
//! forwarder's relay socket, drained non-blockingly from its own `update`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use riftgate::{Forwarder, ForwarderConfig, ProxyServer, Transport, UdpRelayProvider};
//!
//! # fn example(transport: &mut dyn Transport, now_ms: u64) {
//! let forwarder = Forwarder::new(ForwarderConfig::default(), Box::new(UdpRelayProvider));
//! let mut server = ProxyServer::new(forwarder);
//! server.set_public_ip("203.0.113.7");
//! server.login_to_coordinator(transport, "hunter2", "198.51.100.1:6000".parse().unwrap());
//! // then, per event-loop iteration:
//! server.update(now_ms);
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod coordinator;
pub mod error;
pub mod forwarder;
pub mod protocol;
pub mod selection;
pub mod server;
pub mod transport;
pub mod udp;

pub use client::{ClientConfig, ForwardingContext, ProxyClient, ProxyClientHandler};
pub use coordinator::{CoordinatorConfig, ProxyCoordinator};
pub use error::{RequestError, WireError};
pub use forwarder::{
    Forwarder, ForwarderConfig, RelaySocket, RelaySocketProvider, SocketFamily,
};
pub use protocol::{ForwardOutcome, ForwardingTarget, Guid, MessageId, ProxyMessage};
pub use selection::{AcceptAll, CandidateRanking, ServerPool, ServerSelectionFilter};
pub use server::{ProxyServer, ProxyServerHandler};
pub use transport::Transport;
pub use udp::UdpRelayProvider;

/// Ping value reported for a candidate server that never answered within the
/// group deadline. Treated as maximally distant during server selection.
pub const UNRESPONSIVE_PING_MS: u16 = u16::MAX;

/// Upper bound on the per-relay inactivity timeout a coordinator may request.
pub const MAX_RELAY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(600);

/// Largest datagram a relay endpoint will carry (64 KB).
pub const MAX_RELAY_DATAGRAM_SIZE: usize = 65536;
