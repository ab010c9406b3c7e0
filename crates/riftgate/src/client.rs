//! The proxy client role: requests relays and measures candidate latency.
//!
//! A client asks a coordinator to set up relaying toward a target peer, and
//! helps the coordinator choose a server by pinging nominated candidates.
//! Every terminal or interim outcome arrives asynchronously through the
//! [`ProxyClientHandler`] the application installs.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::RequestError;
use crate::protocol::{ForwardingTarget, Guid, ProxyMessage};
use crate::transport::Transport;
use crate::UNRESPONSIVE_PING_MS;

/// Identifies the forwarding attempt an outcome belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingContext {
    /// Coordinator that resolved the attempt
    pub coordinator: SocketAddr,
    /// Source (sender) address of the pair
    pub source: SocketAddr,
    /// Target address of the pair
    pub target: SocketAddr,
    /// Target GUID when the request addressed one
    pub target_guid: Option<Guid>,
}

/// Asynchronous forwarding outcomes delivered to the application.
pub trait ProxyClientHandler {
    /// A relay is up; datagrams for the peer go to `server_ip:port`.
    fn on_forwarding_success(&mut self, server_ip: &str, port: u16, ctx: &ForwardingContext);

    /// A relay for this pair was already active at `server_ip:port`.
    fn on_forwarding_in_progress(&mut self, server_ip: &str, port: u16, ctx: &ForwardingContext);

    /// The other party requested a relay to us at `server_ip:port`.
    fn on_forwarding_notification(&mut self, server_ip: &str, port: u16, ctx: &ForwardingContext);

    /// Every candidate server failed or timed out.
    fn on_all_servers_busy(&mut self, ctx: &ForwardingContext);

    /// The coordinator has no servers in its pool.
    fn on_no_servers_online(&mut self, ctx: &ForwardingContext);

    /// The target GUID is not connected to the coordinator.
    fn on_recipient_not_connected(&mut self, ctx: &ForwardingContext);
}

/// Client tuning.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long a ping group waits before unreported candidates are written
    /// off as unresponsive.
    pub ping_group_deadline: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ping_group_deadline: Duration::from_millis(1000),
        }
    }
}

struct PingCandidate {
    server: SocketAddr,
    ping_ms: u16,
    pinged: bool,
}

/// One batch of latency probes on a coordinator's behalf.
struct PingGroup {
    source: SocketAddr,
    target: SocketAddr,
    coordinator: SocketAddr,
    started_at_ms: u64,
    candidates: Vec<PingCandidate>,
}

impl PingGroup {
    fn all_pinged(&self) -> bool {
        self.candidates.iter().all(|c| c.pinged)
    }

    fn reply(&self) -> ProxyMessage {
        ProxyMessage::PingCandidatesReply {
            source: self.source,
            target: self.target,
            results: self
                .candidates
                .iter()
                .map(|c| (c.server, c.ping_ms))
                .collect(),
        }
    }
}

/// Requests relays from coordinators and probes candidate servers for them.
#[derive(Default)]
pub struct ProxyClient {
    config: ClientConfig,
    handler: Option<Box<dyn ProxyClientHandler>>,
    ping_groups: Vec<PingGroup>,
}

impl ProxyClient {
    /// Create a client with the given tuning.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            handler: None,
            ping_groups: Vec::new(),
        }
    }

    /// Install the handler that receives forwarding outcomes.
    ///
    /// Required before [`request_forwarding`](Self::request_forwarding): a
    /// terminal result with nowhere to go is itself a defect.
    pub fn set_result_handler(&mut self, handler: Box<dyn ProxyClientHandler>) {
        self.handler = Some(handler);
    }

    /// Ask `coordinator` to set up relaying from `source` to `target`.
    ///
    /// Returns immediately; the outcome arrives through the result handler.
    /// `timeout` is the relay's inactivity timeout. `criteria` is an opaque
    /// server-selection hint interpreted by the coordinator's filter.
    ///
    /// # Errors
    ///
    /// [`RequestError::NotConnected`] when no connection to `coordinator`
    /// exists, [`RequestError::NoHandlerSet`] when no result handler is
    /// installed.
    pub fn request_forwarding(
        &mut self,
        transport: &mut dyn Transport,
        coordinator: SocketAddr,
        source: SocketAddr,
        target: ForwardingTarget,
        timeout: Duration,
        criteria: Option<Vec<u8>>,
    ) -> Result<(), RequestError> {
        if !transport.is_connected(coordinator) {
            return Err(RequestError::NotConnected(coordinator));
        }
        if self.handler.is_none() {
            tracing::error!("request_forwarding called with no result handler set");
            return Err(RequestError::NoHandlerSet);
        }
        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        transport.send(
            coordinator,
            &ProxyMessage::ForwardingRequest {
                source,
                target,
                timeout_ms,
                criteria,
            },
        );
        Ok(())
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
            ProxyMessage::PingCandidatesRequest {
                source,
                target,
                candidates,
            } => {
                self.on_ping_candidates(transport, from, *source, *target, candidates, now_ms);
            }
            ProxyMessage::ForwardingSucceeded {
                source,
                target,
                target_guid,
                server_ip,
                port,
            } => {
                let ctx = context(from, *source, *target, *target_guid);
                if let Some(handler) = self.handler.as_mut() {
                    handler.on_forwarding_success(server_ip, *port, &ctx);
                } else {
                    tracing::debug!("forwarding outcome from {from} with no result handler");
                }
            }
            ProxyMessage::ForwardingInProgress {
                source,
                target,
                target_guid,
                server_ip,
                port,
            } => {
                // Fire one datagram at the relay so our own router opens a
                // mapping for it; delivery does not need to succeed.
                prime_nat(transport, server_ip, *port, now_ms);
                let ctx = context(from, *source, *target, *target_guid);
                if let Some(handler) = self.handler.as_mut() {
                    handler.on_forwarding_in_progress(server_ip, *port, &ctx);
                } else {
                    tracing::debug!("forwarding outcome from {from} with no result handler");
                }
            }
            ProxyMessage::ForwardingNotification {
                source,
                target,
                target_guid,
                server_ip,
                port,
            } => {
                let ctx = context(from, *source, *target, *target_guid);
                if let Some(handler) = self.handler.as_mut() {
                    handler.on_forwarding_notification(server_ip, *port, &ctx);
                } else {
                    tracing::debug!("forwarding outcome from {from} with no result handler");
                }
            }
            ProxyMessage::AllServersBusy {
                source,
                target,
                target_guid,
            } => {
                let ctx = context(from, *source, *target, *target_guid);
                if let Some(handler) = self.handler.as_mut() {
                    handler.on_all_servers_busy(&ctx);
                }
            }
            ProxyMessage::NoServersOnline {
                source,
                target,
                target_guid,
            } => {
                let ctx = context(from, *source, *target, *target_guid);
                if let Some(handler) = self.handler.as_mut() {
                    handler.on_no_servers_online(&ctx);
                }
            }
            ProxyMessage::RecipientNotConnected {
                source,
                target,
                target_guid,
            } => {
                let ctx = context(from, *source, *target, *target_guid);
                if let Some(handler) = self.handler.as_mut() {
                    handler.on_recipient_not_connected(&ctx);
                }
            }
            other => {
                tracing::trace!("proxy client ignoring {:?} from {from}", other.id());
            }
        }
    }

    /// Handle a pong from `from` echoing our ping's send time.
    ///
    /// Returns true when the pong matched a ping group candidate (and was
    /// consumed), false when it belongs to someone else.
    pub fn on_pong(
        &mut self,
        transport: &mut dyn Transport,
        from: SocketAddr,
        sent_ms: u64,
        now_ms: u64,
    ) -> bool {
        let mut matched = None;
        for (group_idx, group) in self.ping_groups.iter_mut().enumerate() {
            if let Some(candidate) = group.candidates.iter_mut().find(|c| c.server == from) {
                // Clamp against clock skew; a pong can't arrive before its ping.
                let rtt = now_ms
                    .saturating_sub(sent_ms)
                    .min(u64::from(UNRESPONSIVE_PING_MS - 1)) as u16;
                candidate.ping_ms = rtt;
                candidate.pinged = true;
                matched = Some(group_idx);
                break;
            }
        }
        let Some(group_idx) = matched else {
            return false;
        };
        if self.ping_groups[group_idx].all_pinged() {
            let group = self.ping_groups.remove(group_idx);
            transport.send(group.coordinator, &group.reply());
        }
        true
    }

    /// Polling tick: finalize ping groups whose deadline elapsed.
    ///
    /// Performs no blocking I/O; unreported candidates keep the
    /// [`UNRESPONSIVE_PING_MS`] sentinel in the reply.
    pub fn update(&mut self, transport: &mut dyn Transport, now_ms: u64) {
        let deadline = self.config.ping_group_deadline.as_millis() as u64;
        let mut idx = 0;
        while idx < self.ping_groups.len() {
            if now_ms.saturating_sub(self.ping_groups[idx].started_at_ms) >= deadline {
                let group = self.ping_groups.remove(idx);
                tracing::debug!(
                    "ping group for {} -> {} timed out, reporting with sentinels",
                    group.source,
                    group.target
                );
                transport.send(group.coordinator, &group.reply());
            } else {
                idx += 1;
            }
        }
    }

    /// A transport connection dropped: discard probes owned by that peer.
    pub fn on_peer_disconnected(&mut self, peer: SocketAddr) {
        self.ping_groups.retain(|g| g.coordinator != peer);
    }

    /// Discard all in-flight ping groups.
    pub fn shutdown(&mut self) {
        self.ping_groups.clear();
    }

    fn on_ping_candidates(
        &mut self,
        transport: &mut dyn Transport,
        coordinator: SocketAddr,
        source: SocketAddr,
        target: SocketAddr,
        candidates: &[SocketAddr],
        now_ms: u64,
    ) {
        let group = PingGroup {
            source,
            target,
            coordinator,
            started_at_ms: now_ms,
            candidates: candidates
                .iter()
                .map(|server| PingCandidate {
                    server: *server,
                    ping_ms: UNRESPONSIVE_PING_MS,
                    pinged: false,
                })
                .collect(),
        };
        if group.candidates.is_empty() {
            transport.send(coordinator, &group.reply());
            return;
        }
        for candidate in &group.candidates {
            transport.ping(candidate.server, now_ms);
        }
        self.ping_groups.push(group);
    }
}

fn context(
    coordinator: SocketAddr,
    source: SocketAddr,
    target: SocketAddr,
    target_guid: Option<Guid>,
) -> ForwardingContext {
    ForwardingContext {
        coordinator,
        source,
        target,
        target_guid,
    }
}

/// Best-effort datagram toward the relay endpoint to open our router's
/// NAT mapping before the peer's datagrams arrive.
fn prime_nat(transport: &mut dyn Transport, server_ip: &str, port: u16, now_ms: u64) {
    match server_ip.parse() {
        Ok(ip) => transport.ping(SocketAddr::new(ip, port), now_ms),
        Err(_) => tracing::debug!("unparseable relay ip {server_ip:?}, skipping NAT priming"),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::transport::test_support::RecordingTransport;

    #[derive(Default)]
    struct Events {
        successes: Vec<(String, u16, ForwardingContext)>,
        in_progress: Vec<(String, u16, ForwardingContext)>,
        notifications: Vec<(String, u16, ForwardingContext)>,
        busy: Vec<ForwardingContext>,
        offline: Vec<ForwardingContext>,
        not_connected: Vec<ForwardingContext>,
    }

    struct SharedHandler(Rc<RefCell<Events>>);

    impl ProxyClientHandler for SharedHandler {
        fn on_forwarding_success(&mut self, ip: &str, port: u16, ctx: &ForwardingContext) {
            self.0
                .borrow_mut()
                .successes
                .push((ip.to_string(), port, ctx.clone()));
        }
        fn on_forwarding_in_progress(&mut self, ip: &str, port: u16, ctx: &ForwardingContext) {
            self.0
                .borrow_mut()
                .in_progress
                .push((ip.to_string(), port, ctx.clone()));
        }
        fn on_forwarding_notification(&mut self, ip: &str, port: u16, ctx: &ForwardingContext) {
            self.0
                .borrow_mut()
                .notifications
                .push((ip.to_string(), port, ctx.clone()));
        }
        fn on_all_servers_busy(&mut self, ctx: &ForwardingContext) {
            self.0.borrow_mut().busy.push(ctx.clone());
        }
        fn on_no_servers_online(&mut self, ctx: &ForwardingContext) {
            self.0.borrow_mut().offline.push(ctx.clone());
        }
        fn on_recipient_not_connected(&mut self, ctx: &ForwardingContext) {
            self.0.borrow_mut().not_connected.push(ctx.clone());
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([198, 51, 100, 1], port))
    }

    fn client() -> (ProxyClient, Rc<RefCell<Events>>) {
        let mut client = ProxyClient::new(ClientConfig::default());
        let events = Rc::new(RefCell::new(Events::default()));
        client.set_result_handler(Box::new(SharedHandler(Rc::clone(&events))));
        (client, events)
    }

    #[test]
    fn request_requires_a_handler() {
        let mut client = ProxyClient::new(ClientConfig::default());
        let mut transport = RecordingTransport::default();
        transport.connect(addr(6000));

        let result = client.request_forwarding(
            &mut transport,
            addr(6000),
            addr(1),
            ForwardingTarget::Address(addr(2)),
            Duration::from_secs(5),
            None,
        );
        assert_eq!(result, Err(RequestError::NoHandlerSet));
        assert!(transport.sent.is_empty());
    }

    #[test]
    fn request_requires_a_connection() {
        let (mut client, _) = client();
        let mut transport = RecordingTransport::default();

        let result = client.request_forwarding(
            &mut transport,
            addr(6000),
            addr(1),
            ForwardingTarget::Address(addr(2)),
            Duration::from_secs(5),
            None,
        );
        assert_eq!(result, Err(RequestError::NotConnected(addr(6000))));
        assert!(transport.sent.is_empty());
    }

    #[test]
    fn request_sends_to_the_coordinator() {
        let (mut client, _) = client();
        let mut transport = RecordingTransport::default();
        transport.connect(addr(6000));

        client
            .request_forwarding(
                &mut transport,
                addr(6000),
                addr(1),
                ForwardingTarget::Guid(Guid(7)),
                Duration::from_secs(5),
                Some(vec![0xAB]),
            )
            .unwrap();

        match &transport.sent[0] {
            (to, ProxyMessage::ForwardingRequest {
                source,
                target,
                timeout_ms,
                criteria,
            }) => {
                assert_eq!(*to, addr(6000));
                assert_eq!(*source, addr(1));
                assert_eq!(*target, ForwardingTarget::Guid(Guid(7)));
                assert_eq!(*timeout_ms, 5000);
                assert_eq!(criteria.as_deref(), Some(&[0xAB][..]));
            }
            other => panic!("unexpected send {other:?}"),
        }
    }

    #[test]
    fn candidates_request_pings_every_candidate() {
        let (mut client, _) = client();
        let mut transport = RecordingTransport::default();

        client.on_message(
            &mut transport,
            addr(6000),
            &ProxyMessage::PingCandidatesRequest {
                source: addr(1),
                target: addr(2),
                candidates: vec![addr(101), addr(102)],
            },
            100,
        );

        assert_eq!(transport.pings, vec![(addr(101), 100), (addr(102), 100)]);
        assert!(transport.sent.is_empty());
    }

    #[test]
    fn all_pongs_finalize_the_group_early() {
        let (mut client, _) = client();
        let mut transport = RecordingTransport::default();
        client.on_message(
            &mut transport,
            addr(6000),
            &ProxyMessage::PingCandidatesRequest {
                source: addr(1),
                target: addr(2),
                candidates: vec![addr(101), addr(102)],
            },
            100,
        );

        assert!(client.on_pong(&mut transport, addr(101), 100, 140));
        assert!(transport.sent.is_empty());
        assert!(client.on_pong(&mut transport, addr(102), 100, 115));

        match &transport.sent[0] {
            (to, ProxyMessage::PingCandidatesReply {
                source,
                target,
                results,
            }) => {
                assert_eq!(*to, addr(6000));
                assert_eq!(*source, addr(1));
                assert_eq!(*target, addr(2));
                assert_eq!(*results, vec![(addr(101), 40), (addr(102), 15)]);
            }
            other => panic!("unexpected send {other:?}"),
        }

        // group is gone; further pongs belong to nobody
        assert!(!client.on_pong(&mut transport, addr(101), 100, 150));
    }

    #[test]
    fn deadline_reports_sentinels_for_silent_candidates() {
        let (mut client, _) = client();
        let mut transport = RecordingTransport::default();
        client.on_message(
            &mut transport,
            addr(6000),
            &ProxyMessage::PingCandidatesRequest {
                source: addr(1),
                target: addr(2),
                candidates: vec![addr(101), addr(102)],
            },
            100,
        );
        client.on_pong(&mut transport, addr(101), 100, 130);

        client.update(&mut transport, 1099);
        assert!(transport.sent.is_empty());

        client.update(&mut transport, 1100);
        match &transport.sent[0] {
            (_, ProxyMessage::PingCandidatesReply { results, .. }) => {
                assert_eq!(
                    *results,
                    vec![(addr(101), 30), (addr(102), UNRESPONSIVE_PING_MS)]
                );
            }
            other => panic!("unexpected send {other:?}"),
        }
    }

    #[test]
    fn clock_skew_clamps_to_zero() {
        let (mut client, _) = client();
        let mut transport = RecordingTransport::default();
        client.on_message(
            &mut transport,
            addr(6000),
            &ProxyMessage::PingCandidatesRequest {
                source: addr(1),
                target: addr(2),
                candidates: vec![addr(101)],
            },
            100,
        );

        // echoed send time claims to be in our future
        client.on_pong(&mut transport, addr(101), 500, 200);
        match &transport.sent[0] {
            (_, ProxyMessage::PingCandidatesReply { results, .. }) => {
                assert_eq!(*results, vec![(addr(101), 0)]);
            }
            other => panic!("unexpected send {other:?}"),
        }
    }

    #[test]
    fn empty_candidate_list_replies_immediately() {
        let (mut client, _) = client();
        let mut transport = RecordingTransport::default();
        client.on_message(
            &mut transport,
            addr(6000),
            &ProxyMessage::PingCandidatesRequest {
                source: addr(1),
                target: addr(2),
                candidates: Vec::new(),
            },
            100,
        );
        assert!(matches!(
            transport.sent[0].1,
            ProxyMessage::PingCandidatesReply { ref results, .. } if results.is_empty()
        ));
    }

    #[test]
    fn success_outcome_reaches_the_handler() {
        let (mut client, events) = client();
        let mut transport = RecordingTransport::default();

        client.on_message(
            &mut transport,
            addr(6000),
            &ProxyMessage::ForwardingSucceeded {
                source: addr(1),
                target: addr(2),
                target_guid: Some(Guid(9)),
                server_ip: "203.0.113.7".to_string(),
                port: 4242,
            },
            0,
        );

        let events = events.borrow();
        assert_eq!(events.successes.len(), 1);
        let (ip, port, ctx) = &events.successes[0];
        assert_eq!(ip, "203.0.113.7");
        assert_eq!(*port, 4242);
        assert_eq!(ctx.coordinator, addr(6000));
        assert_eq!(ctx.target_guid, Some(Guid(9)));
    }

    #[test]
    fn in_progress_primes_the_nat_mapping() {
        let (mut client, events) = client();
        let mut transport = RecordingTransport::default();

        client.on_message(
            &mut transport,
            addr(6000),
            &ProxyMessage::ForwardingInProgress {
                source: addr(1),
                target: addr(2),
                target_guid: None,
                server_ip: "203.0.113.7".to_string(),
                port: 4242,
            },
            77,
        );

        assert_eq!(
            transport.pings,
            vec![("203.0.113.7:4242".parse().unwrap(), 77)]
        );
        assert_eq!(events.borrow().in_progress.len(), 1);
    }

    #[test]
    fn failure_outcomes_reach_the_handler() {
        let (mut client, events) = client();
        let mut transport = RecordingTransport::default();
        let coordinator = addr(6000);

        for message in [
            ProxyMessage::AllServersBusy {
                source: addr(1),
                target: addr(2),
                target_guid: None,
            },
            ProxyMessage::NoServersOnline {
                source: addr(1),
                target: addr(2),
                target_guid: None,
            },
            ProxyMessage::RecipientNotConnected {
                source: addr(1),
                target: addr(2),
                target_guid: Some(Guid(3)),
            },
        ] {
            client.on_message(&mut transport, coordinator, &message, 0);
        }

        let events = events.borrow();
        assert_eq!(events.busy.len(), 1);
        assert_eq!(events.offline.len(), 1);
        assert_eq!(events.not_connected.len(), 1);
    }

    #[test]
    fn disconnected_coordinator_loses_its_groups() {
        let (mut client, _) = client();
        let mut transport = RecordingTransport::default();
        client.on_message(
            &mut transport,
            addr(6000),
            &ProxyMessage::PingCandidatesRequest {
                source: addr(1),
                target: addr(2),
                candidates: vec![addr(101)],
            },
            100,
        );

        client.on_peer_disconnected(addr(6000));

        // finalization sends nothing because the group is gone
        transport.sent.clear();
        client.update(&mut transport, 5000);
        assert!(transport.sent.is_empty());
    }
}
