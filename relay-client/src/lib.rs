//! Client half of a reverse HTTP relay.
//!
//! A relay server sits at a public address and queues requests from user
//! agents. This client runs next to a private backend, continuously pulls
//! queued requests from the relay, replays them against the backend, and
//! posts the responses back in chunks. Because the client initiates every
//! connection, the backend needs no inbound port.

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod relay;
pub mod trace;
pub mod transport;
pub mod wire;

mod backend;
mod chunker;
mod streamer;

pub use client::Client;
pub use config::ClientConfig;
pub use error::{BuildError, FatalError, PostError, RelayError};
pub use relay::RelayChannel;
pub use transport::{FileTokenSource, HttpClient, TokenSource};
