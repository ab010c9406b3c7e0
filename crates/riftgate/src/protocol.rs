//! Wire messages exchanged between the proxy roles.
//!
//! Every message is a message-ID byte followed by its fields in catalogue
//! order. All multi-byte integers are big-endian (network byte order).
//! Strings and opaque criteria blobs carry a `u16` length prefix. Socket
//! addresses are a family tag byte (`4` or `6`), the raw IP octets, then the
//! `u16` port. This layout is fixed for interoperability; decoding ignores
//! trailing bytes so the format can grow.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::WireError;

/// Persistent peer identity assigned by the host transport.
///
/// Unlike a socket address, a GUID survives address changes and identifies
/// the same peer across reconnects. The all-ones value is reserved as the
/// on-wire "unset" marker and never names a real peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid(pub u64);

const GUID_UNSET: u64 = u64::MAX;

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Message-ID bytes for the coordination protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageId {
    /// Server asks a coordinator to admit it to the relay pool
    LoginRequest = 0x01,
    /// Login rejected: the coordinator has no password configured
    LoginNoPasswordSet = 0x02,
    /// Login rejected: password mismatch
    LoginWrongPassword = 0x03,
    /// Login rejected: this server is already in the pool
    LoginAlreadyLoggedIn = 0x04,
    /// Login accepted
    LoginSuccess = 0x05,
    /// Client asks the coordinator to set up relaying for a peer pair
    ForwardingRequest = 0x06,
    /// Coordinator asks a client to ping candidate servers
    PingCandidatesRequest = 0x07,
    /// Client reports measured candidate pings
    PingCandidatesReply = 0x08,
    /// Coordinator directs a server to start relaying
    ForwardingDirective = 0x09,
    /// Server reports the outcome of a directive
    ForwardingReply = 0x0A,
    /// Relay established; sent to the requesting client
    ForwardingSucceeded = 0x0B,
    /// Relay already active for this pair
    ForwardingInProgress = 0x0C,
    /// Relay established; sent to the non-requesting party
    ForwardingNotification = 0x0D,
    /// Every candidate server failed or timed out
    AllServersBusy = 0x0E,
    /// No servers are logged in to the coordinator
    NoServersOnline = 0x0F,
    /// Target GUID is not connected to the coordinator
    RecipientNotConnected = 0x10,
}

impl TryFrom<u8> for MessageId {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::LoginRequest),
            0x02 => Ok(Self::LoginNoPasswordSet),
            0x03 => Ok(Self::LoginWrongPassword),
            0x04 => Ok(Self::LoginAlreadyLoggedIn),
            0x05 => Ok(Self::LoginSuccess),
            0x06 => Ok(Self::ForwardingRequest),
            0x07 => Ok(Self::PingCandidatesRequest),
            0x08 => Ok(Self::PingCandidatesReply),
            0x09 => Ok(Self::ForwardingDirective),
            0x0A => Ok(Self::ForwardingReply),
            0x0B => Ok(Self::ForwardingSucceeded),
            0x0C => Ok(Self::ForwardingInProgress),
            0x0D => Ok(Self::ForwardingNotification),
            0x0E => Ok(Self::AllServersBusy),
            0x0F => Ok(Self::NoServersOnline),
            0x10 => Ok(Self::RecipientNotConnected),
            other => Err(WireError::UnknownMessageId(other)),
        }
    }
}

/// Outcome code a server reports in [`ProxyMessage::ForwardingReply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ForwardOutcome {
    /// A relay endpoint was allocated and is pumping
    Started = 0,
    /// A relay for this peer pair already exists; its port is echoed
    AlreadyForwarding = 1,
    /// The forwarder is at its concurrent-relay capacity
    NoFreeRelays = 2,
    /// The relay socket could not be bound
    BindFailed = 3,
    /// The directive's inactivity timeout was out of range
    InvalidTimeout = 4,
}

impl TryFrom<u8> for ForwardOutcome {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Started),
            1 => Ok(Self::AlreadyForwarding),
            2 => Ok(Self::NoFreeRelays),
            3 => Ok(Self::BindFailed),
            4 => Ok(Self::InvalidTimeout),
            other => Err(WireError::UnknownOutcome(other)),
        }
    }
}

/// How a forwarding request names the peer to be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardingTarget {
    /// Target named by its address as seen from the coordinator
    Address(SocketAddr),
    /// Target named by its persistent GUID; the coordinator resolves it
    Guid(Guid),
}

/// Protocol messages.
///
/// Field order in each variant is the on-wire field order.
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyMessage {
    /// Server → coordinator: admit me to the relay pool
    LoginRequest {
        /// Shared pool password
        password: String,
    },

    /// Coordinator → server: no password is configured on the coordinator
    LoginNoPasswordSet {
        /// The password the server attempted
        password: String,
    },

    /// Coordinator → server: wrong password
    LoginWrongPassword {
        /// The password the server attempted
        password: String,
    },

    /// Coordinator → server: this address is already logged in
    LoginAlreadyLoggedIn {
        /// The password the server attempted
        password: String,
    },

    /// Coordinator → server: admitted to the pool
    LoginSuccess {
        /// The password the server attempted
        password: String,
    },

    /// Client → coordinator: set up relaying between `source` and `target`
    ForwardingRequest {
        /// Source peer address; the unspecified address means "use the
        /// sender's transport address"
        source: SocketAddr,
        /// The peer to reach
        target: ForwardingTarget,
        /// Relay inactivity timeout requested, in milliseconds
        timeout_ms: u32,
        /// Opaque server-selection criteria, interpreted by the
        /// coordinator's filter
        criteria: Option<Vec<u8>>,
    },

    /// Coordinator → client: measure these candidate servers
    PingCandidatesRequest {
        /// Source address of the session being set up
        source: SocketAddr,
        /// Target address of the session being set up
        target: SocketAddr,
        /// Candidate server addresses to ping
        candidates: Vec<SocketAddr>,
    },

    /// Client → coordinator: measured (or sentinel) ping per candidate
    PingCandidatesReply {
        /// Source address echoed from the request
        source: SocketAddr,
        /// Target address echoed from the request
        target: SocketAddr,
        /// One entry per candidate; unresponsive candidates carry
        /// [`crate::UNRESPONSIVE_PING_MS`]
        results: Vec<(SocketAddr, u16)>,
    },

    /// Coordinator → server: start relaying for this peer pair
    ForwardingDirective {
        /// Source peer the relay will serve
        source: SocketAddr,
        /// Target peer the relay will serve
        target: SocketAddr,
        /// Relay inactivity timeout, in milliseconds
        timeout_ms: u32,
    },

    /// Server → coordinator: directive outcome
    ForwardingReply {
        /// Source peer echoed from the directive
        source: SocketAddr,
        /// Target peer echoed from the directive
        target: SocketAddr,
        /// The server's externally visible IP; empty means "use my
        /// transport address"
        server_public_ip: String,
        /// What happened
        outcome: ForwardOutcome,
        /// Allocated relay port (0 unless started or already forwarding)
        port: u16,
    },

    /// Coordinator → requesting client: relay is up
    ForwardingSucceeded {
        /// Source (sender) address of the forwarded pair
        source: SocketAddr,
        /// Target address of the forwarded pair
        target: SocketAddr,
        /// Target GUID when the request addressed one
        target_guid: Option<Guid>,
        /// Relay server IP
        server_ip: String,
        /// Relay port
        port: u16,
    },

    /// Coordinator → requesting client: relay was already active
    ForwardingInProgress {
        /// Source (sender) address of the forwarded pair
        source: SocketAddr,
        /// Target address of the forwarded pair
        target: SocketAddr,
        /// Target GUID when the request addressed one
        target_guid: Option<Guid>,
        /// Relay server IP
        server_ip: String,
        /// Relay port
        port: u16,
    },

    /// Coordinator → non-requesting party: a relay to you is up
    ForwardingNotification {
        /// Source (sender) address of the forwarded pair
        source: SocketAddr,
        /// Target address of the forwarded pair
        target: SocketAddr,
        /// Target GUID when the request addressed one
        target_guid: Option<Guid>,
        /// Relay server IP
        server_ip: String,
        /// Relay port
        port: u16,
    },

    /// Coordinator → requesting client: every candidate failed or timed out
    AllServersBusy {
        /// Source (sender) address of the requested pair
        source: SocketAddr,
        /// Target address of the requested pair
        target: SocketAddr,
        /// Target GUID when the request addressed one
        target_guid: Option<Guid>,
    },

    /// Coordinator → requesting client: the relay pool is empty
    NoServersOnline {
        /// Source (sender) address of the requested pair
        source: SocketAddr,
        /// Target address of the requested pair
        target: SocketAddr,
        /// Target GUID when the request addressed one
        target_guid: Option<Guid>,
    },

    /// Coordinator → requesting client: target GUID is not connected
    RecipientNotConnected {
        /// Source (sender) address of the requested pair
        source: SocketAddr,
        /// Target address of the requested pair (unspecified when unknown)
        target: SocketAddr,
        /// The GUID that failed to resolve
        target_guid: Option<Guid>,
    },
}

impl ProxyMessage {
    /// The message-ID byte this message encodes as.
    #[must_use]
    pub fn id(&self) -> MessageId {
        match self {
            Self::LoginRequest { .. } => MessageId::LoginRequest,
            Self::LoginNoPasswordSet { .. } => MessageId::LoginNoPasswordSet,
            Self::LoginWrongPassword { .. } => MessageId::LoginWrongPassword,
            Self::LoginAlreadyLoggedIn { .. } => MessageId::LoginAlreadyLoggedIn,
            Self::LoginSuccess { .. } => MessageId::LoginSuccess,
            Self::ForwardingRequest { .. } => MessageId::ForwardingRequest,
            Self::PingCandidatesRequest { .. } => MessageId::PingCandidatesRequest,
            Self::PingCandidatesReply { .. } => MessageId::PingCandidatesReply,
            Self::ForwardingDirective { .. } => MessageId::ForwardingDirective,
            Self::ForwardingReply { .. } => MessageId::ForwardingReply,
            Self::ForwardingSucceeded { .. } => MessageId::ForwardingSucceeded,
            Self::ForwardingInProgress { .. } => MessageId::ForwardingInProgress,
            Self::ForwardingNotification { .. } => MessageId::ForwardingNotification,
            Self::AllServersBusy { .. } => MessageId::AllServersBusy,
            Self::NoServersOnline { .. } => MessageId::NoServersOnline,
            Self::RecipientNotConnected { .. } => MessageId::RecipientNotConnected,
        }
    }

    /// Serialize to wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::FieldTooLong`] when a string, criteria blob, or
    /// candidate list exceeds its 16-bit length prefix.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::with_capacity(64);
        buf.push(self.id() as u8);
        match self {
            Self::LoginRequest { password }
            | Self::LoginNoPasswordSet { password }
            | Self::LoginWrongPassword { password }
            | Self::LoginAlreadyLoggedIn { password }
            | Self::LoginSuccess { password } => {
                put_string(&mut buf, password)?;
            }
            Self::ForwardingRequest {
                source,
                target,
                timeout_ms,
                criteria,
            } => {
                put_addr(&mut buf, *source);
                match target {
                    ForwardingTarget::Address(addr) => {
                        buf.push(1);
                        put_addr(&mut buf, *addr);
                    }
                    ForwardingTarget::Guid(guid) => {
                        buf.push(0);
                        buf.extend_from_slice(&guid.0.to_be_bytes());
                    }
                }
                buf.extend_from_slice(&timeout_ms.to_be_bytes());
                match criteria {
                    Some(bytes) => {
                        buf.push(1);
                        put_bytes(&mut buf, bytes)?;
                    }
                    None => buf.push(0),
                }
            }
            Self::PingCandidatesRequest {
                source,
                target,
                candidates,
            } => {
                put_addr(&mut buf, *source);
                put_addr(&mut buf, *target);
                put_count(&mut buf, candidates.len())?;
                for candidate in candidates {
                    put_addr(&mut buf, *candidate);
                }
            }
            Self::PingCandidatesReply {
                source,
                target,
                results,
            } => {
                put_addr(&mut buf, *source);
                put_addr(&mut buf, *target);
                put_count(&mut buf, results.len())?;
                for (candidate, ping) in results {
                    put_addr(&mut buf, *candidate);
                    buf.extend_from_slice(&ping.to_be_bytes());
                }
            }
            Self::ForwardingDirective {
                source,
                target,
                timeout_ms,
            } => {
                put_addr(&mut buf, *source);
                put_addr(&mut buf, *target);
                buf.extend_from_slice(&timeout_ms.to_be_bytes());
            }
            Self::ForwardingReply {
                source,
                target,
                server_public_ip,
                outcome,
                port,
            } => {
                put_addr(&mut buf, *source);
                put_addr(&mut buf, *target);
                put_string(&mut buf, server_public_ip)?;
                buf.push(*outcome as u8);
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Self::ForwardingSucceeded {
                source,
                target,
                target_guid,
                server_ip,
                port,
            }
            | Self::ForwardingInProgress {
                source,
                target,
                target_guid,
                server_ip,
                port,
            }
            | Self::ForwardingNotification {
                source,
                target,
                target_guid,
                server_ip,
                port,
            } => {
                put_addr(&mut buf, *source);
                put_addr(&mut buf, *target);
                put_guid(&mut buf, *target_guid);
                put_string(&mut buf, server_ip)?;
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Self::AllServersBusy {
                source,
                target,
                target_guid,
            }
            | Self::NoServersOnline {
                source,
                target,
                target_guid,
            }
            | Self::RecipientNotConnected {
                source,
                target,
                target_guid,
            } => {
                put_addr(&mut buf, *source);
                put_addr(&mut buf, *target);
                put_guid(&mut buf, *target_guid);
            }
        }
        Ok(buf)
    }

    /// Parse a message from wire bytes. Trailing bytes are ignored.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] for unknown IDs, truncated fields, bad address
    /// family tags, or invalid UTF-8 in string fields.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(bytes);
        let id = MessageId::try_from(r.u8()?)?;
        match id {
            MessageId::LoginRequest => Ok(Self::LoginRequest {
                password: r.string()?,
            }),
            MessageId::LoginNoPasswordSet => Ok(Self::LoginNoPasswordSet {
                password: r.string()?,
            }),
            MessageId::LoginWrongPassword => Ok(Self::LoginWrongPassword {
                password: r.string()?,
            }),
            MessageId::LoginAlreadyLoggedIn => Ok(Self::LoginAlreadyLoggedIn {
                password: r.string()?,
            }),
            MessageId::LoginSuccess => Ok(Self::LoginSuccess {
                password: r.string()?,
            }),
            MessageId::ForwardingRequest => {
                let source = r.addr()?;
                let target = if r.u8()? != 0 {
                    ForwardingTarget::Address(r.addr()?)
                } else {
                    ForwardingTarget::Guid(Guid(r.u64()?))
                };
                let timeout_ms = r.u32()?;
                let criteria = if r.u8()? != 0 { Some(r.bytes()?) } else { None };
                Ok(Self::ForwardingRequest {
                    source,
                    target,
                    timeout_ms,
                    criteria,
                })
            }
            MessageId::PingCandidatesRequest => {
                let source = r.addr()?;
                let target = r.addr()?;
                let count = r.u16()? as usize;
                let mut candidates = Vec::with_capacity(count);
                for _ in 0..count {
                    candidates.push(r.addr()?);
                }
                Ok(Self::PingCandidatesRequest {
                    source,
                    target,
                    candidates,
                })
            }
            MessageId::PingCandidatesReply => {
                let source = r.addr()?;
                let target = r.addr()?;
                let count = r.u16()? as usize;
                let mut results = Vec::with_capacity(count);
                for _ in 0..count {
                    let candidate = r.addr()?;
                    let ping = r.u16()?;
                    results.push((candidate, ping));
                }
                Ok(Self::PingCandidatesReply {
                    source,
                    target,
                    results,
                })
            }
            MessageId::ForwardingDirective => Ok(Self::ForwardingDirective {
                source: r.addr()?,
                target: r.addr()?,
                timeout_ms: r.u32()?,
            }),
            MessageId::ForwardingReply => Ok(Self::ForwardingReply {
                source: r.addr()?,
                target: r.addr()?,
                server_public_ip: r.string()?,
                outcome: ForwardOutcome::try_from(r.u8()?)?,
                port: r.u16()?,
            }),
            MessageId::ForwardingSucceeded
            | MessageId::ForwardingInProgress
            | MessageId::ForwardingNotification => {
                let source = r.addr()?;
                let target = r.addr()?;
                let target_guid = r.guid()?;
                let server_ip = r.string()?;
                let port = r.u16()?;
                Ok(match id {
                    MessageId::ForwardingSucceeded => Self::ForwardingSucceeded {
                        source,
                        target,
                        target_guid,
                        server_ip,
                        port,
                    },
                    MessageId::ForwardingInProgress => Self::ForwardingInProgress {
                        source,
                        target,
                        target_guid,
                        server_ip,
                        port,
                    },
                    _ => Self::ForwardingNotification {
                        source,
                        target,
                        target_guid,
                        server_ip,
                        port,
                    },
                })
            }
            MessageId::AllServersBusy | MessageId::NoServersOnline
            | MessageId::RecipientNotConnected => {
                let source = r.addr()?;
                let target = r.addr()?;
                let target_guid = r.guid()?;
                Ok(match id {
                    MessageId::AllServersBusy => Self::AllServersBusy {
                        source,
                        target,
                        target_guid,
                    },
                    MessageId::NoServersOnline => Self::NoServersOnline {
                        source,
                        target,
                        target_guid,
                    },
                    _ => Self::RecipientNotConnected {
                        source,
                        target,
                        target_guid,
                    },
                })
            }
        }
    }
}

fn put_count(buf: &mut Vec<u8>, count: usize) -> Result<(), WireError> {
    let count = u16::try_from(count).map_err(|_| WireError::FieldTooLong(count))?;
    buf.extend_from_slice(&count.to_be_bytes());
    Ok(())
}

fn put_string(buf: &mut Vec<u8>, s: &str) -> Result<(), WireError> {
    put_count(buf, s.len())?;
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<(), WireError> {
    put_count(buf, bytes.len())?;
    buf.extend_from_slice(bytes);
    Ok(())
}

fn put_addr(buf: &mut Vec<u8>, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.push(4);
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.push(6);
            buf.extend_from_slice(&ip.octets());
        }
    }
    buf.extend_from_slice(&addr.port().to_be_bytes());
}

fn put_guid(buf: &mut Vec<u8>, guid: Option<Guid>) {
    let raw = guid.map_or(GUID_UNSET, |g| g.0);
    buf.extend_from_slice(&raw.to_be_bytes());
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() < n {
            return Err(WireError::TooShort {
                expected: n,
                actual: self.buf.len(),
            });
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn string(&mut self) -> Result<String, WireError> {
        let len = self.u16()? as usize;
        let b = self.take(len)?;
        String::from_utf8(b.to_vec()).map_err(|_| WireError::InvalidString)
    }

    fn bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.u16()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn addr(&mut self) -> Result<SocketAddr, WireError> {
        let ip = match self.u8()? {
            4 => {
                let b = self.take(4)?;
                IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
            }
            6 => {
                let b = self.take(16)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(b);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            other => return Err(WireError::UnknownAddressFamily(other)),
        };
        let port = self.u16()?;
        Ok(SocketAddr::new(ip, port))
    }

    fn guid(&mut self) -> Result<Option<Guid>, WireError> {
        let raw = self.u64()?;
        Ok((raw != GUID_UNSET).then_some(Guid(raw)))
    }
}
