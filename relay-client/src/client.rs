//! The relay client proper: a pool of polling workers, each of which
//! spawns a handler task per pulled request.

use std::sync::Arc;
use std::time::{Duration, Instant};

use http::StatusCode;
use hyper_util::rt::TokioIo;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::backend;
use crate::chunker::{self, Trailers};
use crate::config::ClientConfig;
use crate::error::{FatalError, PostError, RelayError};
use crate::relay::RelayChannel;
use crate::streamer;
use crate::trace::TraceContext;
use crate::transport::{self, HttpClient, TokenSource};
use crate::wire;

/// Delay before re-polling after a transient poll error.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// The relay client. Cheap to clone; all clones share the two HTTP
/// clients and the immutable configuration.
#[derive(Clone)]
pub struct Client {
    config: Arc<ClientConfig>,
    relay: RelayChannel,
    local: HttpClient,
}

impl Client {
    /// Builds a client without relay authentication. Fails unless
    /// `disable_auth_for_remote` is set: running against an authenticated
    /// relay without credentials would poll 403s forever.
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        if !config.disable_auth_for_remote {
            anyhow::bail!(
                "relay authentication is enabled but no token source was provided \
                 (set DISABLE_AUTH_FOR_REMOTE to opt out)"
            );
        }
        Self::build(config, None)
    }

    /// Builds a client whose relay calls carry bearer tokens from the
    /// given source.
    pub fn with_token_source(
        config: ClientConfig,
        token_source: Arc<dyn TokenSource>,
    ) -> anyhow::Result<Self> {
        Self::build(config, Some(token_source))
    }

    fn build(
        config: ClientConfig,
        token_source: Option<Arc<dyn TokenSource>>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let token_source = if config.disable_auth_for_remote {
            None
        } else {
            token_source
        };
        let remote = transport::build_remote_client(&config)?;
        let local = transport::build_local_client(&config)?;
        let config = Arc::new(config);
        let relay = RelayChannel::new(Arc::clone(&config), remote, token_source)?;
        Ok(Self {
            config,
            relay,
            local,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Runs the worker pool. Only returns on a fatal condition
    /// (authentication or connectivity failure at the relay); the caller
    /// is expected to exit so the process supervisor restarts it.
    pub async fn start(&self) -> FatalError {
        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.num_pending_requests {
            let client = self.clone();
            workers.spawn(async move { client.run_worker(worker_id).await });
        }

        // The first fatal worker wins; dropping the set aborts the rest.
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(fatal) => return fatal,
                Err(err) => error!(error = %err, "Relay worker crashed"),
            }
        }
        FatalError::WorkersExited
    }

    async fn run_worker(self, worker_id: usize) -> FatalError {
        info!(
            worker_id,
            server_name = %self.config.server_name,
            "Starting relay request loop"
        );
        loop {
            match self.relay.get_request().await {
                Ok(request) => {
                    let client = self.clone();
                    tokio::spawn(async move { client.handle_request(request).await });
                }
                Err(RelayError::Timeout) => continue,
                Err(err @ RelayError::Forbidden) => return FatalError::Forbidden(err),
                Err(err @ RelayError::ConnectionRefused) => {
                    return FatalError::ConnectionRefused(err)
                }
                Err(err) => {
                    warn!(worker_id, error = %err, "Failed to get request from relay");
                    tokio::time::sleep(POLL_RETRY_DELAY).await;
                }
            }
        }
    }

    async fn handle_request(&self, pulled: wire::HttpRequest) {
        let start = Instant::now();
        let id = pulled.id().to_string();
        // The pulled URL's origin is a placeholder; only path and query
        // matter for logging.
        let request_path = pulled
            .url()
            .strip_prefix("http://invalid")
            .unwrap_or(pulled.url())
            .to_string();

        let request = match backend::build_backend_request(&self.config, &pulled) {
            Ok(request) => request,
            Err(err) => {
                warn!(id = %id, error = %err, "Failed to create request for backend");
                self.relay
                    .post_error_response(
                        &id,
                        &format!("Failed to create request for backend: {err}"),
                    )
                    .await;
                return;
            }
        };

        // Continue the user agent's trace if it sent one.
        let span = TraceContext::from_headers(request.headers())
            .map(|parent| parent.child())
            .unwrap_or_else(TraceContext::new_root);

        let (seed, mut response) =
            match backend::invoke_backend(&self.local, request, &span, &id).await {
                Ok(pair) => pair,
                Err(err) => {
                    let message = format!("Backend request failed with error: {err}");
                    warn!(id = %id, error = %err, "Backend request failed");
                    self.relay.post_error_response(&id, &message).await;
                    return;
                }
            };

        let (blocks_tx, blocks_rx) = mpsc::unbounded_channel();
        let trailers = Trailers::default();

        if seed.status_code == Some(i32::from(StatusCode::SWITCHING_PROTOCOLS.as_u16())) {
            // The connection becomes a bidirectional byte stream: pump the
            // relay's request stream into the backend alongside the
            // response path.
            match hyper::upgrade::on(&mut response).await {
                Ok(upgraded) => {
                    let (read_half, write_half) = tokio::io::split(TokioIo::new(upgraded));
                    tokio::spawn(streamer::stream_to_backend(
                        self.relay.clone(),
                        id.clone(),
                        write_half,
                    ));
                    tokio::spawn(chunker::stream_upgraded_blocks(
                        id.clone(),
                        read_half,
                        self.config.block_size,
                        blocks_tx,
                    ));
                }
                Err(err) => {
                    warn!(
                        id = %id,
                        error = %err,
                        "101 Switching Protocols response without an upgradable connection"
                    );
                    self.relay
                        .post_error_response(
                            &id,
                            "Backend returned 101 Switching Protocols, which is not supported.",
                        )
                        .await;
                    return;
                }
            }
        } else {
            tokio::spawn(chunker::stream_body_blocks(
                id.clone(),
                response.into_body(),
                self.config.block_size,
                blocks_tx,
                trailers.clone(),
            ));
        }

        let (chunks_tx, mut chunks_rx) = mpsc::unbounded_channel();
        tokio::spawn(chunker::collate_responses(
            self.config.backend_response_timeout,
            self.config.max_chunk_size,
            blocks_rx,
            seed,
            chunks_tx,
        ));

        while let Some(mut chunk) = chunks_rx.recv().await {
            if chunk.is_eof() {
                chunk.trailer = trailers.snapshot();
                let elapsed = start.elapsed();
                chunk.backend_duration_ms = Some(elapsed.as_millis() as i64);
                info!(
                    id = %id,
                    duration_ms = elapsed.as_millis() as u64,
                    path = %request_path,
                    "Backend request finished"
                );
            }
            match self.relay.post_with_retry(&chunk).await {
                Ok(()) => {}
                Err(PostError::Permanent(err)) => {
                    warn!(id = %id, error = %err, "Aborting response stream after permanent post failure");
                    break;
                }
                Err(err) => {
                    warn!(id = %id, error = %err, "Dropping remaining response chunks after retries were exhausted");
                    break;
                }
            }
        }
    }
}
