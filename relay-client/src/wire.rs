//! Wire messages exchanged with the relay server.
//!
//! Mirrors the relay server's `cloudrobotics.http_relay.v1alpha1` schema.
//! Hand-maintained in generated style; field numbers must stay stable.

/// A single HTTP header pair. Multiple entries with the same name may be
/// present; their relative order is significant.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HttpHeader {
    #[prost(string, optional, tag = "1")]
    pub name: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "2")]
    pub value: ::core::option::Option<::prost::alloc::string::String>,
}

/// A request pulled from the relay server's queue. The URL's host part is a
/// placeholder; only path and query are meaningful.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HttpRequest {
    /// Opaque identifier, echoed on every response chunk.
    #[prost(string, optional, tag = "1")]
    pub id: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "2")]
    pub method: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "3")]
    pub url: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(message, repeated, tag = "4")]
    pub header: ::prost::alloc::vec::Vec<HttpHeader>,
    #[prost(bytes = "vec", tag = "5")]
    pub body: ::prost::alloc::vec::Vec<u8>,
    /// Original Host header of the user agent's request, if any.
    #[prost(string, optional, tag = "6")]
    pub host: ::core::option::Option<::prost::alloc::string::String>,
}

/// One chunk of a backend response, posted to the relay server. A response
/// is a stream of chunks with the same `id`; the terminal chunk carries
/// `eof = true`.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HttpResponse {
    #[prost(string, optional, tag = "1")]
    pub id: ::core::option::Option<::prost::alloc::string::String>,
    /// Set only on the first chunk of the stream.
    #[prost(int32, optional, tag = "2")]
    pub status_code: ::core::option::Option<i32>,
    #[prost(message, repeated, tag = "3")]
    pub header: ::prost::alloc::vec::Vec<HttpHeader>,
    #[prost(bytes = "vec", tag = "4")]
    pub body: ::prost::alloc::vec::Vec<u8>,
    /// True on the terminal chunk.
    #[prost(bool, optional, tag = "5")]
    pub eof: ::core::option::Option<bool>,
    /// Populated on the terminal chunk once the backend body has been read.
    #[prost(message, repeated, tag = "6")]
    pub trailer: ::prost::alloc::vec::Vec<HttpHeader>,
    /// Total backend processing time, set only on the terminal chunk.
    #[prost(int64, optional, tag = "7")]
    pub backend_duration_ms: ::core::option::Option<i64>,
}

impl HttpResponse {
    pub fn is_eof(&self) -> bool {
        self.eof.unwrap_or(false)
    }
}

/// Snapshots an `http::HeaderMap` into wire headers, one entry per value so
/// multi-valued headers keep their per-name order.
pub fn headers_from_map(map: &http::HeaderMap) -> Vec<HttpHeader> {
    map.iter()
        .map(|(name, value)| HttpHeader {
            name: Some(name.as_str().to_string()),
            value: Some(String::from_utf8_lossy(value.as_bytes()).into_owned()),
        })
        .collect()
}
