//! Server-pool bookkeeping and latency-based candidate selection.
//!
//! The coordinator keeps its logged-in servers in registration order; that
//! order is the deterministic tie-break when two candidates report the same
//! round-trip time. Candidates that never answered a ping carry the
//! [`UNRESPONSIVE_PING_MS`](crate::UNRESPONSIVE_PING_MS) sentinel and are
//! chosen only when nothing responsive remains.

use std::net::SocketAddr;

use crate::UNRESPONSIVE_PING_MS;

/// The coordinator's logged-in server pool, in registration order.
#[derive(Debug, Default)]
pub struct ServerPool {
    servers: Vec<SocketAddr>,
}

impl ServerPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a server; returns false if the address was already registered.
    pub fn register(&mut self, server: SocketAddr) -> bool {
        if self.contains(server) {
            return false;
        }
        self.servers.push(server);
        true
    }

    /// Remove a server; returns true if it was registered.
    pub fn unregister(&mut self, server: SocketAddr) -> bool {
        let before = self.servers.len();
        self.servers.retain(|s| *s != server);
        self.servers.len() != before
    }

    /// Whether `server` is registered.
    #[must_use]
    pub fn contains(&self, server: SocketAddr) -> bool {
        self.servers.contains(&server)
    }

    /// Number of registered servers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// True when no servers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Registered servers in registration order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<SocketAddr> {
        self.servers.clone()
    }

    /// Drop every registration.
    pub fn clear(&mut self) {
        self.servers.clear();
    }
}

/// Reduces a candidate list according to opaque, client-supplied criteria.
///
/// The criteria bytes travel uninterpreted through the protocol; their
/// meaning is an agreement between the requesting application and the
/// coordinator deployment. Must preserve the input (registration) order of
/// the candidates it keeps.
pub trait ServerSelectionFilter {
    /// Return the candidates that satisfy `criteria`.
    fn filter(&self, criteria: &[u8], candidates: Vec<SocketAddr>) -> Vec<SocketAddr>;
}

/// Default filter: criteria are ignored and every candidate passes.
#[derive(Debug, Default)]
pub struct AcceptAll;

impl ServerSelectionFilter for AcceptAll {
    fn filter(&self, _criteria: &[u8], candidates: Vec<SocketAddr>) -> Vec<SocketAddr> {
        candidates
    }
}

/// Accumulated client-reported round-trip times for one session's candidates.
///
/// Each reporting party contributes one value per candidate; candidates a
/// reply omits are charged the sentinel. Totals are compared with
/// strictly-less, so the earliest-registered candidate wins ties.
#[derive(Debug)]
pub struct CandidateRanking {
    candidates: Vec<SocketAddr>,
    totals: Vec<u32>,
}

impl CandidateRanking {
    /// Start a ranking over `candidates` (registration order).
    #[must_use]
    pub fn new(candidates: Vec<SocketAddr>) -> Self {
        let totals = vec![0; candidates.len()];
        Self { candidates, totals }
    }

    /// Fold one party's ping report into the totals.
    ///
    /// Entries for unknown addresses are ignored; candidates the report
    /// omits are charged [`UNRESPONSIVE_PING_MS`](crate::UNRESPONSIVE_PING_MS).
    pub fn record_reply(&mut self, results: &[(SocketAddr, u16)]) {
        for (idx, candidate) in self.candidates.iter().enumerate() {
            let reported = results
                .iter()
                .find(|(addr, _)| addr == candidate)
                .map_or(UNRESPONSIVE_PING_MS, |(_, ping)| *ping);
            self.totals[idx] += u32::from(reported);
        }
    }

    /// Remove a candidate (chosen, failed, or disconnected) from the running.
    pub fn exclude(&mut self, candidate: SocketAddr) {
        if let Some(idx) = self.candidates.iter().position(|c| *c == candidate) {
            self.candidates.remove(idx);
            self.totals.remove(idx);
        }
    }

    /// The best remaining candidate: lowest total, first-registered on ties.
    #[must_use]
    pub fn best(&self) -> Option<SocketAddr> {
        let mut best: Option<(SocketAddr, u32)> = None;
        for (candidate, total) in self.candidates.iter().zip(&self.totals) {
            match best {
                Some((_, best_total)) if *total >= best_total => {}
                _ => best = Some((*candidate, *total)),
            }
        }
        best.map(|(candidate, _)| candidate)
    }

    /// Remaining candidates, in registration order.
    #[must_use]
    pub fn candidates(&self) -> &[SocketAddr] {
        &self.candidates
    }

    /// True when no candidates remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}
