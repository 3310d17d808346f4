//! W3C trace-context propagation.
//!
//! The user agent's `traceparent` header travels with the relayed request;
//! backend calls carry a child context so the backend can stitch its spans
//! onto the originating trace.

use http::{HeaderMap, HeaderValue};
use rand::RngCore;

pub const TRACEPARENT_HEADER: &str = "traceparent";

const SUPPORTED_VERSION: &str = "00";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: [u8; 16],
    pub span_id: [u8; 8],
    pub sampled: bool,
}

impl TraceContext {
    /// Starts a fresh trace with random non-zero identifiers.
    pub fn new_root() -> Self {
        let mut rng = rand::thread_rng();
        let mut trace_id = [0u8; 16];
        let mut span_id = [0u8; 8];
        while trace_id == [0u8; 16] {
            rng.fill_bytes(&mut trace_id);
        }
        while span_id == [0u8; 8] {
            rng.fill_bytes(&mut span_id);
        }
        Self {
            trace_id,
            span_id,
            sampled: true,
        }
    }

    /// A child context: same trace, new span.
    pub fn child(&self) -> Self {
        let mut rng = rand::thread_rng();
        let mut span_id = [0u8; 8];
        while span_id == [0u8; 8] {
            rng.fill_bytes(&mut span_id);
        }
        Self {
            trace_id: self.trace_id,
            span_id,
            sampled: self.sampled,
        }
    }

    /// Parses a `traceparent` value: `00-<32 hex>-<16 hex>-<2 hex>`.
    /// All-zero trace or span ids are invalid.
    pub fn parse_traceparent(value: &str) -> Option<Self> {
        let mut parts = value.trim().split('-');
        let version = parts.next()?;
        if version != SUPPORTED_VERSION {
            return None;
        }
        let trace_id: [u8; 16] = decode_hex(parts.next()?)?;
        let span_id: [u8; 8] = decode_hex(parts.next()?)?;
        let flags: [u8; 1] = decode_hex(parts.next()?)?;
        if parts.next().is_some() || trace_id == [0u8; 16] || span_id == [0u8; 8] {
            return None;
        }
        Some(Self {
            trace_id,
            span_id,
            sampled: flags[0] & 0x01 != 0,
        })
    }

    pub fn to_traceparent(&self) -> String {
        format!(
            "{SUPPORTED_VERSION}-{}-{}-{:02x}",
            encode_hex(&self.trace_id),
            encode_hex(&self.span_id),
            u8::from(self.sampled),
        )
    }

    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        headers
            .get(TRACEPARENT_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(Self::parse_traceparent)
    }

    pub fn inject(&self, headers: &mut HeaderMap) {
        if let Ok(value) = HeaderValue::from_str(&self.to_traceparent()) {
            headers.insert(TRACEPARENT_HEADER, value);
        }
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn decode_hex<const N: usize>(value: &str) -> Option<[u8; N]> {
    if value.len() != N * 2 || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let mut out = [0u8; N];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = u8::from_str_radix(&value[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}
