//! The rendezvous role: authenticates servers and brokers relay sessions.
//!
//! The coordinator owns the server pool and every in-flight
//! `ForwardingSession`. A session moves
//! `Requested → SelectingServer → AwaitingServerReply` and is removed the
//! moment a terminal outcome goes out to the requesting client; any reply
//! arriving after that finds no session and is inert. All bookkeeping is
//! mutated only from this instance's callbacks and tick, so a single
//! coordinator needs no locking; separate instances share nothing.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::protocol::{ForwardOutcome, ForwardingTarget, Guid, ProxyMessage};
use crate::selection::{AcceptAll, CandidateRanking, ServerPool, ServerSelectionFilter};
use crate::transport::Transport;

/// Coordinator tuning.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Shared password servers must present; `None` rejects every login
    /// with `LoginNoPasswordSet`.
    pub password: Option<String>,
    /// How long to wait for client ping reports before selecting anyway.
    pub ping_reply_timeout: Duration,
    /// How long a dispatched directive may go unanswered before the server
    /// is treated as failed. Bounds every session's lifetime.
    pub directive_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            password: None,
            ping_reply_timeout: Duration::from_secs(2),
            directive_timeout: Duration::from_secs(3),
        }
    }
}

type SessionKey = (SocketAddr, SocketAddr);

enum SessionState {
    /// Waiting for ping reports from the listed parties.
    SelectingServer {
        awaiting: Vec<SocketAddr>,
        deadline_ms: u64,
    },
    /// Directive dispatched; waiting for the chosen server's reply.
    AwaitingServerReply {
        server: SocketAddr,
        deadline_ms: u64,
    },
}

struct ForwardingSession {
    /// Connection the request arrived on; terminal outcomes go here.
    requester: SocketAddr,
    source: SocketAddr,
    target: SocketAddr,
    target_guid: Option<Guid>,
    timeout_ms: u32,
    /// Candidates not yet attempted, with accumulated ping totals.
    ranking: CandidateRanking,
    state: SessionState,
}

/// Matches clients needing a relay to the best available proxy server.
pub struct ProxyCoordinator {
    config: CoordinatorConfig,
    pool: ServerPool,
    sessions: HashMap<SessionKey, ForwardingSession>,
    filter: Box<dyn ServerSelectionFilter>,
}

impl ProxyCoordinator {
    /// Create a coordinator with the default pass-through selection filter.
    #[must_use]
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            pool: ServerPool::new(),
            sessions: HashMap::new(),
            filter: Box::new(AcceptAll),
        }
    }

    /// Replace the filter that interprets client selection criteria.
    pub fn set_selection_filter(&mut self, filter: Box<dyn ServerSelectionFilter>) {
        self.filter = filter;
    }

    /// Number of logged-in servers.
    #[must_use]
    pub fn server_count(&self) -> usize {
        self.pool.len()
    }

    /// Number of in-flight forwarding sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
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
            ProxyMessage::LoginRequest { password } => {
                self.on_login(transport, from, password);
            }
            ProxyMessage::ForwardingRequest {
                source,
                target,
                timeout_ms,
                criteria,
            } => {
                self.on_request(
                    transport,
                    from,
                    *source,
                    *target,
                    *timeout_ms,
                    criteria.as_deref(),
                    now_ms,
                );
            }
            ProxyMessage::PingCandidatesReply {
                source,
                target,
                results,
            } => {
                self.on_ping_reply(transport, from, *source, *target, results, now_ms);
            }
            ProxyMessage::ForwardingReply {
                source,
                target,
                server_public_ip,
                outcome,
                port,
            } => {
                self.on_server_reply(
                    transport,
                    from,
                    *source,
                    *target,
                    server_public_ip,
                    *outcome,
                    *port,
                    now_ms,
                );
            }
            other => {
                tracing::trace!("coordinator ignoring {:?} from {from}", other.id());
            }
        }
    }

    /// Polling tick: enforce ping and directive deadlines.
    pub fn update(&mut self, transport: &mut dyn Transport, now_ms: u64) {
        let due: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|(_, session)| {
                let deadline = match &session.state {
                    SessionState::SelectingServer { deadline_ms, .. }
                    | SessionState::AwaitingServerReply { deadline_ms, .. } => *deadline_ms,
                };
                now_ms >= deadline
            })
            .map(|(key, _)| *key)
            .collect();

        for key in due {
            let Some(mut session) = self.sessions.remove(&key) else {
                continue;
            };
            match &session.state {
                SessionState::SelectingServer { .. } => {
                    tracing::debug!(
                        "ping phase for {} -> {} timed out, selecting from partial data",
                        session.source,
                        session.target
                    );
                }
                SessionState::AwaitingServerReply { server, .. } => {
                    tracing::debug!(
                        "server {server} never answered the directive for {} -> {}",
                        session.source,
                        session.target
                    );
                }
            }
            if self.dispatch_next(transport, &mut session, now_ms) {
                self.sessions.insert(key, session);
            }
        }
    }

    /// A transport connection dropped.
    ///
    /// Unregisters a server and abandons every session that references the
    /// address as requester, source, target, or chosen server. Abandoned
    /// sessions send nothing; any later reply for them is inert.
    pub fn on_peer_disconnected(&mut self, peer: SocketAddr) {
        if self.pool.unregister(peer) {
            tracing::info!("proxy server {peer} disconnected, {} remain", self.pool.len());
        }
        self.sessions.retain(|_, session| {
            let references = session.requester == peer
                || session.source == peer
                || session.target == peer
                || matches!(
                    session.state,
                    SessionState::AwaitingServerReply { server, .. } if server == peer
                );
            if references {
                tracing::debug!(
                    "abandoning session {} -> {} after {peer} disconnected",
                    session.source,
                    session.target
                );
            }
            !references
        });
        // the address can no longer serve surviving sessions either
        for session in self.sessions.values_mut() {
            session.ranking.exclude(peer);
        }
    }

    fn on_login(&mut self, transport: &mut dyn Transport, from: SocketAddr, attempt: &str) {
        let password = attempt.to_string();
        let reply = match &self.config.password {
            None => {
                tracing::debug!("login from {from} refused: no password configured");
                ProxyMessage::LoginNoPasswordSet { password }
            }
            Some(expected) if expected != attempt => {
                tracing::debug!("login from {from} refused: wrong password");
                ProxyMessage::LoginWrongPassword { password }
            }
            Some(_) if self.pool.contains(from) => {
                ProxyMessage::LoginAlreadyLoggedIn { password }
            }
            Some(_) => {
                self.pool.register(from);
                tracing::info!("proxy server {from} logged in, pool size {}", self.pool.len());
                ProxyMessage::LoginSuccess { password }
            }
        };
        transport.send(from, &reply);
    }

    #[allow(clippy::too_many_arguments)]
    fn on_request(
        &mut self,
        transport: &mut dyn Transport,
        requester: SocketAddr,
        source: SocketAddr,
        target: ForwardingTarget,
        timeout_ms: u32,
        criteria: Option<&[u8]>,
        now_ms: u64,
    ) {
        // An unassigned source means "me, as you see me".
        let source = if source.ip().is_unspecified() {
            requester
        } else {
            source
        };

        let (target_addr, target_guid) = match target {
            ForwardingTarget::Address(addr) => (addr, transport.guid_of(addr)),
            ForwardingTarget::Guid(guid) => match transport.address_of(guid) {
                Some(addr) => (addr, Some(guid)),
                None => {
                    tracing::debug!("forwarding request for unconnected guid {guid}");
                    transport.send(
                        requester,
                        &ProxyMessage::RecipientNotConnected {
                            source,
                            target: unspecified_addr(),
                            target_guid: Some(guid),
                        },
                    );
                    return;
                }
            },
        };

        let key = (source, target_addr);
        if self.sessions.contains_key(&key) {
            tracing::debug!("duplicate forwarding request for {source} -> {target_addr}, dropped");
            return;
        }

        let mut candidates = self.pool.to_vec();
        if let Some(criteria) = criteria {
            candidates = self.filter.filter(criteria, candidates);
        }
        if candidates.is_empty() {
            tracing::debug!("no eligible servers for {source} -> {target_addr}");
            transport.send(
                requester,
                &ProxyMessage::NoServersOnline {
                    source,
                    target: target_addr,
                    target_guid,
                },
            );
            return;
        }

        let mut session = ForwardingSession {
            requester,
            source,
            target: target_addr,
            target_guid,
            timeout_ms,
            ranking: CandidateRanking::new(candidates.clone()),
            state: SessionState::SelectingServer {
                awaiting: Vec::new(),
                deadline_ms: now_ms,
            },
        };

        if candidates.len() == 1 {
            // Sole candidate: latency cannot change the choice.
            if self.dispatch_next(transport, &mut session, now_ms) {
                self.sessions.insert(key, session);
            }
            return;
        }

        let mut awaiting = vec![requester];
        if target_addr != requester && transport.is_connected(target_addr) {
            awaiting.push(target_addr);
        }
        let ping_request = ProxyMessage::PingCandidatesRequest {
            source,
            target: target_addr,
            candidates,
        };
        for party in &awaiting {
            transport.send(*party, &ping_request);
        }
        session.state = SessionState::SelectingServer {
            awaiting,
            deadline_ms: now_ms + self.config.ping_reply_timeout.as_millis() as u64,
        };
        self.sessions.insert(key, session);
    }

    fn on_ping_reply(
        &mut self,
        transport: &mut dyn Transport,
        from: SocketAddr,
        source: SocketAddr,
        target: SocketAddr,
        results: &[(SocketAddr, u16)],
        now_ms: u64,
    ) {
        let key = (source, target);
        let Some(session) = self.sessions.get_mut(&key) else {
            tracing::debug!("ping reply from {from} for unknown session {source} -> {target}");
            return;
        };
        let SessionState::SelectingServer { awaiting, .. } = &mut session.state else {
            tracing::debug!("late ping reply from {from}, server already chosen");
            return;
        };
        let Some(idx) = awaiting.iter().position(|party| *party == from) else {
            tracing::debug!("ping reply from unexpected reporter {from}, dropped");
            return;
        };
        awaiting.remove(idx);
        session.ranking.record_reply(results);

        if awaiting.is_empty() {
            if let Some(mut session) = self.sessions.remove(&key) {
                if self.dispatch_next(transport, &mut session, now_ms) {
                    self.sessions.insert(key, session);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_server_reply(
        &mut self,
        transport: &mut dyn Transport,
        from: SocketAddr,
        source: SocketAddr,
        target: SocketAddr,
        server_public_ip: &str,
        outcome: ForwardOutcome,
        port: u16,
        now_ms: u64,
    ) {
        let key = (source, target);
        let expected = self.sessions.get(&key).is_some_and(|session| {
            matches!(
                session.state,
                SessionState::AwaitingServerReply { server, .. } if server == from
            )
        });
        if !expected {
            tracing::debug!("stale or unexpected forwarding reply from {from}, dropped");
            return;
        }
        let Some(mut session) = self.sessions.remove(&key) else {
            return;
        };

        match outcome {
            ForwardOutcome::Started | ForwardOutcome::AlreadyForwarding => {
                // An unset public IP falls back to the address we see the
                // server at.
                let server_ip = if server_public_ip.is_empty() {
                    from.ip().to_string()
                } else {
                    server_public_ip.to_string()
                };
                self.resolve_established(transport, &session, outcome, server_ip, port);
            }
            ForwardOutcome::NoFreeRelays
            | ForwardOutcome::BindFailed
            | ForwardOutcome::InvalidTimeout => {
                tracing::debug!(
                    "server {from} failed directive for {source} -> {target}: {outcome:?}"
                );
                if self.dispatch_next(transport, &mut session, now_ms) {
                    self.sessions.insert(key, session);
                }
            }
        }
    }

    fn resolve_established(
        &self,
        transport: &mut dyn Transport,
        session: &ForwardingSession,
        outcome: ForwardOutcome,
        server_ip: String,
        port: u16,
    ) {
        tracing::info!(
            "relay for {} -> {} established at {server_ip}:{port}",
            session.source,
            session.target
        );
        if outcome == ForwardOutcome::AlreadyForwarding {
            transport.send(
                session.requester,
                &ProxyMessage::ForwardingInProgress {
                    source: session.source,
                    target: session.target,
                    target_guid: session.target_guid,
                    server_ip,
                    port,
                },
            );
            return;
        }
        transport.send(
            session.requester,
            &ProxyMessage::ForwardingSucceeded {
                source: session.source,
                target: session.target,
                target_guid: session.target_guid,
                server_ip: server_ip.clone(),
                port,
            },
        );
        // Tell the other party so it can prime its own NAT mapping.
        if session.target != session.requester && transport.is_connected(session.target) {
            transport.send(
                session.target,
                &ProxyMessage::ForwardingNotification {
                    source: session.source,
                    target: session.target,
                    target_guid: session.target_guid,
                    server_ip,
                    port,
                },
            );
        }
    }

    /// Direct the best remaining candidate; `AllServersBusy` on exhaustion.
    ///
    /// Returns true when the session stays alive awaiting a server reply.
    fn dispatch_next(
        &self,
        transport: &mut dyn Transport,
        session: &mut ForwardingSession,
        now_ms: u64,
    ) -> bool {
        match session.ranking.best() {
            Some(server) => {
                session.ranking.exclude(server);
                transport.send(
                    server,
                    &ProxyMessage::ForwardingDirective {
                        source: session.source,
                        target: session.target,
                        timeout_ms: session.timeout_ms,
                    },
                );
                session.state = SessionState::AwaitingServerReply {
                    server,
                    deadline_ms: now_ms + self.config.directive_timeout.as_millis() as u64,
                };
                true
            }
            None => {
                tracing::info!(
                    "no candidates left for {} -> {}, reporting all busy",
                    session.source,
                    session.target
                );
                transport.send(
                    session.requester,
                    &ProxyMessage::AllServersBusy {
                        source: session.source,
                        target: session.target,
                        target_guid: session.target_guid,
                    },
                );
                false
            }
        }
    }
}

fn unspecified_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}
