//! Protocol detection by prefix sniffing.
//!
//! # Responsibilities
//! - Recognize a connection's protocol from its first bytes
//! - Evaluate signatures in a fixed priority order (first match wins)
//! - Bound every decision by a peek window and a timeout
//!
//! # Design Decisions
//! - Signatures are pure functions of the prefix: same bytes, same verdict
//! - A higher-priority signature that still needs bytes holds back lower ones
//! - Bytes read while sniffing are returned for replay, never discarded

use std::fmt;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::ListenerConfig;

/// HTTP/1.x request methods recognized at the start of a connection.
const HTTP1_METHODS: &[&[u8]] = &[
    b"GET ",
    b"HEAD ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"CONNECT ",
    b"OPTIONS ",
    b"TRACE ",
    b"PATCH ",
];

/// HTTP/2 client connection preface.
const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// TLS record type for handshake messages.
const TLS_HANDSHAKE: u8 = 0x16;

/// A category of connection recognized by its initial bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolClass {
    /// HTTP/1.x request line.
    Http1,
    /// HTTP/2 with prior knowledge (client preface).
    Http2,
    /// TLS client hello.
    Tls,
}

impl ProtocolClass {
    /// Bytes needed to decide this class with certainty.
    pub fn default_peek_bytes(self) -> usize {
        match self {
            ProtocolClass::Http1 => 8,
            ProtocolClass::Http2 => HTTP2_PREFACE.len(),
            ProtocolClass::Tls => 3,
        }
    }

    /// Label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolClass::Http1 => "http1",
            ProtocolClass::Http2 => "http2",
            ProtocolClass::Tls => "tls",
        }
    }

    /// Test this class's signature against `prefix`.
    pub fn probe(self, prefix: &[u8]) -> Probe {
        match self {
            ProtocolClass::Http1 => probe_http1(prefix),
            ProtocolClass::Http2 => probe_literal(prefix, HTTP2_PREFACE),
            ProtocolClass::Tls => probe_tls(prefix),
        }
    }
}

impl fmt::Display for ProtocolClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of testing one signature against a prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Match,
    NoMatch,
    /// Consistent so far, but more bytes are needed to decide.
    NeedMore,
}

fn probe_literal(prefix: &[u8], expected: &[u8]) -> Probe {
    if prefix.len() >= expected.len() {
        if prefix.starts_with(expected) {
            Probe::Match
        } else {
            Probe::NoMatch
        }
    } else if expected.starts_with(prefix) {
        Probe::NeedMore
    } else {
        Probe::NoMatch
    }
}

fn probe_http1(prefix: &[u8]) -> Probe {
    let mut need_more = false;
    for method in HTTP1_METHODS {
        match probe_literal(prefix, method) {
            Probe::Match => return Probe::Match,
            Probe::NeedMore => need_more = true,
            Probe::NoMatch => {}
        }
    }
    if need_more {
        Probe::NeedMore
    } else {
        Probe::NoMatch
    }
}

fn probe_tls(prefix: &[u8]) -> Probe {
    match prefix {
        [] => Probe::NeedMore,
        [TLS_HANDSHAKE] => Probe::NeedMore,
        [TLS_HANDSHAKE, 0x03] => Probe::NeedMore,
        [TLS_HANDSHAKE, 0x03, minor, ..] if *minor <= 0x04 => Probe::Match,
        _ => Probe::NoMatch,
    }
}

/// One enabled class with its sniffing bounds.
#[derive(Debug, Clone)]
pub struct Signature {
    pub class: ProtocolClass,
    pub peek_bytes: usize,
    pub timeout: Duration,
}

impl Signature {
    pub fn new(class: ProtocolClass, peek_bytes: usize, timeout: Duration) -> Self {
        Self {
            class,
            peek_bytes,
            timeout,
        }
    }
}

/// Outcome of classifying a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Matched(ProtocolClass),
    Unmatched,
    /// A higher-priority signature is still waiting for bytes.
    Pending,
}

/// Classifies connection prefixes against an ordered set of signatures.
#[derive(Debug, Clone)]
pub struct ProtocolMatcher {
    signatures: Vec<Signature>,
}

impl ProtocolMatcher {
    /// Create a matcher; `signatures` are tried in the given order.
    pub fn new(signatures: Vec<Signature>) -> Self {
        Self { signatures }
    }

    /// Build the matcher for a listener's enabled protocols.
    pub fn from_config(config: &ListenerConfig) -> Self {
        Self::new(
            config
                .protocols
                .iter()
                .map(|p| {
                    Signature::new(
                        p.class,
                        p.peek_bytes(),
                        Duration::from_millis(p.classify_timeout_ms),
                    )
                })
                .collect(),
        )
    }

    /// Enabled classes in priority order.
    pub fn classes(&self) -> impl Iterator<Item = ProtocolClass> + '_ {
        self.signatures.iter().map(|s| s.class)
    }

    /// Largest number of bytes any signature inspects.
    pub fn peek_window(&self) -> usize {
        self.signatures
            .iter()
            .map(|s| s.peek_bytes)
            .max()
            .unwrap_or(0)
    }

    /// Final classification of `prefix` with no further bytes to come.
    pub fn classify(&self, prefix: &[u8]) -> Option<ProtocolClass> {
        match self.decide(prefix, |_| true) {
            Verdict::Matched(class) => Some(class),
            _ => None,
        }
    }

    /// Incremental classification after `elapsed` time spent reading.
    ///
    /// Returns [`Verdict::Pending`] only while some signature ahead of any
    /// match still lacks bytes and has neither a full window nor an expired
    /// timeout.
    pub fn evaluate(&self, prefix: &[u8], elapsed: Duration) -> Verdict {
        self.decide(prefix, |sig| elapsed >= sig.timeout)
    }

    fn decide(&self, prefix: &[u8], expired: impl Fn(&Signature) -> bool) -> Verdict {
        for sig in &self.signatures {
            let window = &prefix[..prefix.len().min(sig.peek_bytes)];
            match sig.class.probe(window) {
                Probe::Match => return Verdict::Matched(sig.class),
                Probe::NoMatch => continue,
                Probe::NeedMore => {
                    if window.len() >= sig.peek_bytes || expired(sig) {
                        continue;
                    }
                    return Verdict::Pending;
                }
            }
        }
        Verdict::Unmatched
    }

    /// Time until the next pending signature's timeout, measured from the
    /// start of classification.
    fn next_deadline(&self, elapsed: Duration) -> Option<Duration> {
        self.signatures
            .iter()
            .map(|s| s.timeout)
            .filter(|t| *t > elapsed)
            .min()
            .map(|t| t - elapsed)
    }
}

/// Read from `stream` until the matcher reaches a verdict.
///
/// Never reads past the matcher's peek window. On EOF the bytes seen so far
/// are classified as final. Returns the verdict (never `Pending`) along with
/// every byte consumed so the caller can replay them.
pub async fn read_prefix<S>(
    stream: &mut S,
    matcher: &ProtocolMatcher,
) -> std::io::Result<(Verdict, Bytes)>
where
    S: AsyncRead + Unpin,
{
    let window = matcher.peek_window();
    let mut buf = BytesMut::with_capacity(window);
    let mut chunk = vec![0u8; window];
    let started = Instant::now();

    loop {
        let elapsed = started.elapsed();
        let verdict = matcher.evaluate(&buf, elapsed);
        if verdict != Verdict::Pending {
            return Ok((verdict, buf.freeze()));
        }

        let wait = matcher
            .next_deadline(elapsed)
            .unwrap_or(Duration::ZERO);
        let want = window - buf.len();

        match tokio::time::timeout(wait, stream.read(&mut chunk[..want])).await {
            // Deadline passed for at least one signature; re-evaluate.
            Err(_) => continue,
            Ok(Ok(0)) => {
                let verdict = match matcher.classify(&buf) {
                    Some(class) => Verdict::Matched(class),
                    None => Verdict::Unmatched,
                };
                return Ok((verdict, buf.freeze()));
            }
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => return Err(e),
        }
    }
}
