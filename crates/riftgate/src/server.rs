//! The proxy server role: a publicly reachable relay host.
//!
//! A server logs in to one or more coordinators with the shared pool
//! password and then acts on their forwarding directives, starting a relay
//! through its [`Forwarder`] and reporting the allocated endpoint back.
//! Directives from addresses that never completed a login are dropped.

use std::net::SocketAddr;
use std::time::Duration;

use crate::forwarder::{Forwarder, SocketFamily};
use crate::protocol::{ForwardOutcome, ProxyMessage};
use crate::transport::Transport;
use crate::MAX_RELAY_TIMEOUT;

/// Login outcomes delivered to the hosting application.
///
/// Each callback carries the password the login attempt carried and the
/// coordinator that answered. Exactly one callback fires per completed
/// login attempt.
pub trait ProxyServerHandler {
    /// The coordinator admitted this server to its relay pool.
    fn on_login_success(&mut self, password: &str, coordinator: SocketAddr);

    /// The coordinator rejected the password.
    fn on_wrong_password(&mut self, password: &str, coordinator: SocketAddr);

    /// The coordinator has no password configured and admits no servers.
    fn on_no_password_set(&mut self, password: &str, coordinator: SocketAddr);

    /// This server address is already logged in at the coordinator.
    fn on_already_logged_in(&mut self, password: &str, coordinator: SocketAddr);
}

/// Relay host that registers with coordinators and services their
/// forwarding directives.
pub struct ProxyServer {
    forwarder: Forwarder,
    /// Coordinators with a login request in flight. Disjoint from
    /// `logged_in` by construction.
    pending_logins: Vec<SocketAddr>,
    logged_in: Vec<SocketAddr>,
    socket_family: SocketFamily,
    /// Externally visible IP echoed in forwarding replies; empty means the
    /// coordinator should fall back to this server's transport address.
    public_ip: String,
    handler: Option<Box<dyn ProxyServerHandler>>,
}

impl ProxyServer {
    /// Create a server that starts relays through `forwarder`.
    #[must_use]
    pub fn new(forwarder: Forwarder) -> Self {
        Self {
            forwarder,
            pending_logins: Vec::new(),
            logged_in: Vec::new(),
            socket_family: SocketFamily::default(),
            public_ip: String::new(),
            handler: None,
        }
    }

    /// Set the handler that receives login outcomes.
    pub fn set_result_handler(&mut self, handler: Box<dyn ProxyServerHandler>) {
        self.handler = Some(handler);
    }

    /// Address family for relay sockets started on this server's behalf.
    pub fn set_socket_family(&mut self, family: SocketFamily) {
        self.socket_family = family;
    }

    /// The IP this server is reachable at from outside its own NAT.
    ///
    /// Clients behind the same NAT as the server would otherwise be handed
    /// an internal address they cannot reach.
    pub fn set_public_ip(&mut self, ip: impl Into<String>) {
        self.public_ip = ip.into();
    }

    /// Request admission to `coordinator`'s relay pool.
    ///
    /// Returns false, sending nothing, while a login to that coordinator is
    /// already pending or established.
    pub fn login_to_coordinator(
        &mut self,
        transport: &mut dyn Transport,
        password: &str,
        coordinator: SocketAddr,
    ) -> bool {
        if self.pending_logins.contains(&coordinator) || self.logged_in.contains(&coordinator) {
            return false;
        }
        transport.send(
            coordinator,
            &ProxyMessage::LoginRequest {
                password: password.to_string(),
            },
        );
        self.pending_logins.push(coordinator);
        true
    }

    /// Whether `coordinator` has admitted this server.
    #[must_use]
    pub fn is_logged_in(&self, coordinator: SocketAddr) -> bool {
        self.logged_in.contains(&coordinator)
    }

    /// Access the hosted forwarder.
    #[must_use]
    pub fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    /// Handle a protocol message arriving from `from`.
    pub fn on_message(
        &mut self,
        transport: &mut dyn Transport,
        from: SocketAddr,
        message: &ProxyMessage,
        now_ms: u64,
    ) {
        match message {
            ProxyMessage::ForwardingDirective {
                source,
                target,
                timeout_ms,
            } => {
                if !self.logged_in.contains(&from) {
                    tracing::debug!("dropping forwarding directive from unauthenticated {from}");
                    return;
                }
                self.on_directive(transport, from, *source, *target, *timeout_ms, now_ms);
            }
            ProxyMessage::LoginSuccess { password }
            | ProxyMessage::LoginWrongPassword { password }
            | ProxyMessage::LoginNoPasswordSet { password }
            | ProxyMessage::LoginAlreadyLoggedIn { password } => {
                self.on_login_outcome(from, message, password);
            }
            other => {
                tracing::trace!("proxy server ignoring {:?} from {from}", other.id());
            }
        }
    }

    fn on_login_outcome(&mut self, from: SocketAddr, message: &ProxyMessage, password: &str) {
        // Only honor outcomes we actually asked for; anything else is a
        // spoofed or long-stale reply.
        let Some(idx) = self.pending_logins.iter().position(|c| *c == from) else {
            tracing::debug!("dropping login outcome from {from} with no pending login");
            return;
        };
        self.pending_logins.remove(idx);

        if matches!(message, ProxyMessage::LoginSuccess { .. })
            && !self.logged_in.contains(&from)
        {
            self.logged_in.push(from);
            tracing::info!("logged in to coordinator {from}");
        }

        let Some(handler) = self.handler.as_mut() else {
            tracing::debug!("login outcome from {from} with no result handler set");
            return;
        };
        match message {
            ProxyMessage::LoginSuccess { .. } => handler.on_login_success(password, from),
            ProxyMessage::LoginWrongPassword { .. } => handler.on_wrong_password(password, from),
            ProxyMessage::LoginNoPasswordSet { .. } => handler.on_no_password_set(password, from),
            ProxyMessage::LoginAlreadyLoggedIn { .. } => {
                handler.on_already_logged_in(password, from);
            }
            _ => {}
        }
    }

    fn on_directive(
        &mut self,
        transport: &mut dyn Transport,
        coordinator: SocketAddr,
        source: SocketAddr,
        target: SocketAddr,
        timeout_ms: u32,
        now_ms: u64,
    ) {
        let (outcome, port) =
            if timeout_ms == 0 || u64::from(timeout_ms) > MAX_RELAY_TIMEOUT.as_millis() as u64 {
                tracing::debug!("directive timeout {timeout_ms}ms out of range");
                (ForwardOutcome::InvalidTimeout, 0)
            } else {
                self.forwarder.start_forwarding(
                    source,
                    target,
                    Duration::from_millis(u64::from(timeout_ms)),
                    self.socket_family,
                    now_ms,
                )
            };
        transport.send(
            coordinator,
            &ProxyMessage::ForwardingReply {
                source,
                target,
                server_public_ip: self.public_ip.clone(),
                outcome,
                port,
            },
        );
    }

    /// Per-tick maintenance: pumps the hosted forwarder.
    pub fn update(&mut self, now_ms: u64) {
        self.forwarder.update(now_ms);
    }

    /// A transport connection dropped: forget any login state for it.
    pub fn on_peer_disconnected(&mut self, peer: SocketAddr) {
        self.pending_logins.retain(|c| *c != peer);
        if self.logged_in.contains(&peer) {
            tracing::info!("coordinator {peer} disconnected");
        }
        self.logged_in.retain(|c| *c != peer);
    }

    /// Full shutdown: stop all relays and clear every registration.
    pub fn shutdown(&mut self) {
        self.forwarder.shutdown();
        self.pending_logins.clear();
        self.logged_in.clear();
    }
}
