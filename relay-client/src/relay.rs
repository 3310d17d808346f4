//! Calls against the relay server: the request long-poll, the response
//! post, and the per-request upstream stream pull.

use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use http::{header, HeaderValue, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use prost::Message;
use tokio::time::timeout;
use tracing::{debug, warn};
use url::Url;

use crate::backoff::ExponentialBackoff;
use crate::config::ClientConfig;
use crate::error::{is_connection_refused, PostError, RelayError};
use crate::transport::{HttpClient, TokenSource};
use crate::wire;

const RESPONSE_CONTENT_TYPE: &str =
    "application/vnd.google.protobuf;proto=cloudrobotics.http_relay.v1alpha1.HttpResponse";

/// Attempt budget per chunk; afterwards the remaining chunks of the
/// request are dropped.
pub(crate) const MAX_POST_ATTEMPTS: u32 = 10;

/// Shared handle for all relay-server endpoints, cheap to clone.
#[derive(Clone)]
pub struct RelayChannel {
    config: Arc<ClientConfig>,
    remote: HttpClient,
    token_source: Option<Arc<dyn TokenSource>>,
    base: Url,
}

impl RelayChannel {
    pub fn new(
        config: Arc<ClientConfig>,
        remote: HttpClient,
        token_source: Option<Arc<dyn TokenSource>>,
    ) -> anyhow::Result<Self> {
        let base = Url::parse(&format!(
            "{}://{}/",
            config.relay_scheme, config.relay_address
        ))
        .with_context(|| {
            format!(
                "invalid relay address {}://{}",
                config.relay_scheme, config.relay_address
            )
        })?;
        Ok(Self {
            config,
            remote,
            token_source,
            base,
        })
    }

    /// Long-polls the relay for the next request queued for this client's
    /// server name. Blocks until the relay has one or reports 408.
    pub async fn get_request(&self) -> Result<wire::HttpRequest, RelayError> {
        debug!(
            server_name = %self.config.server_name,
            "Connecting to relay server to get next request"
        );

        let url = self.request_url();
        let mut builder = Request::get(url.as_str());
        if let Some(value) = self
            .bearer()
            .map_err(|err| RelayError::Transport(err.into()))?
        {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        let request = builder
            .body(Full::new(Bytes::new()))
            .map_err(|err| RelayError::Transport(Box::new(err)))?;

        let (status, body) = self.send(request).await?;
        if status == StatusCode::REQUEST_TIMEOUT {
            return Err(RelayError::Timeout);
        }
        if status == StatusCode::FORBIDDEN {
            return Err(RelayError::Forbidden);
        }
        if status != StatusCode::OK {
            return Err(RelayError::Status {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(wire::HttpRequest::decode(body.as_ref())?)
    }

    /// Posts one response chunk. Any 2xx is success (the relay answers with
    /// a bare `ok`); 400 means the relay lost this request's context and the
    /// chunk must not be retried.
    pub async fn post_response(&self, chunk: &wire::HttpResponse) -> Result<(), PostError> {
        let payload = chunk.encode_to_vec();
        let mut builder = Request::post(self.response_url().as_str())
            .header(header::CONTENT_TYPE, RESPONSE_CONTENT_TYPE);
        if let Some(value) = self
            .bearer()
            .map_err(|err| PostError::Transient(err.to_string()))?
        {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        let request = builder
            .body(Full::from(payload))
            .map_err(|err| PostError::Transient(err.to_string()))?;

        let (status, body) = self
            .send(request)
            .await
            .map_err(|err| PostError::Transient(err.to_string()))?;
        if status.is_success() {
            return Ok(());
        }

        let message = format!(
            "relay server responded {status}: {}",
            String::from_utf8_lossy(&body)
        );
        if status == StatusCode::BAD_REQUEST {
            // The relay server may have restarted during the request.
            return Err(PostError::Permanent(message));
        }
        Err(PostError::Transient(message))
    }

    /// Posts a chunk with bounded exponential backoff.
    pub async fn post_with_retry(&self, chunk: &wire::HttpResponse) -> Result<(), PostError> {
        let mut backoff = ExponentialBackoff::for_response_posts();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let err = match self.post_response(chunk).await {
                Ok(()) => return Ok(()),
                Err(err @ PostError::Permanent(_)) => return Err(err),
                Err(err) => err,
            };
            warn!(id = chunk.id(), attempts, error = %err, "Failed to post response to relay");
            if attempts >= MAX_POST_ATTEMPTS {
                return Err(err);
            }
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }

    /// Resolves the user agent's request with a synthesized 500 so it does
    /// not hang on an internal error. Best-effort; failures are logged.
    pub async fn post_error_response(&self, id: &str, message: &str) {
        let chunk = error_chunk(id, message);
        if let Err(err) = self.post_response(&chunk).await {
            warn!(id, error = %err, "Failed to post error response to relay");
        }
    }

    /// Pulls the next slice of the per-request upstream stream. `Ok(None)`
    /// means the relay reported 410 Gone: the stream has ended.
    pub(crate) async fn pull_request_stream(&self, id: &str) -> Result<Option<Bytes>, RelayError> {
        let url = self.request_stream_url(id);
        // POST with an empty body to defeat caches along the path.
        let mut builder = Request::post(url.as_str()).header(header::CONTENT_TYPE, "text/plain");
        if let Some(value) = self
            .bearer()
            .map_err(|err| RelayError::Transport(err.into()))?
        {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        let request = builder
            .body(Full::new(Bytes::new()))
            .map_err(|err| RelayError::Transport(Box::new(err)))?;

        let (status, body) = self.send(request).await?;
        if status == StatusCode::GONE {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(RelayError::Status {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(Some(body))
    }

    /// Issues a relay call and reads the full response body, all bounded by
    /// `remote_request_timeout`.
    async fn send(&self, request: Request<Full<Bytes>>) -> Result<(StatusCode, Bytes), RelayError> {
        let call = async {
            let response = self
                .remote
                .request(request)
                .await
                .map_err(classify_transport)?;
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|err| RelayError::Transport(Box::new(err)))?
                .to_bytes();
            Ok((status, body))
        };
        match timeout(self.config.remote_request_timeout, call).await {
            Ok(result) => result,
            Err(elapsed) => Err(RelayError::Transport(Box::new(elapsed))),
        }
    }

    fn bearer(&self) -> anyhow::Result<Option<HeaderValue>> {
        let Some(source) = &self.token_source else {
            return Ok(None);
        };
        let token = source.token()?;
        HeaderValue::from_str(&format!("Bearer {token}"))
            .context("token is not a valid header value")
            .map(Some)
    }

    fn request_url(&self) -> Url {
        let mut url = self.base.clone();
        url.set_path(&format!("{}/server/request", self.config.relay_prefix));
        url.query_pairs_mut()
            .append_pair("server", &self.config.server_name);
        url
    }

    fn response_url(&self) -> Url {
        let mut url = self.base.clone();
        url.set_path(&format!("{}/server/response", self.config.relay_prefix));
        url
    }

    fn request_stream_url(&self, id: &str) -> Url {
        let mut url = self.base.clone();
        url.set_path(&format!("{}/server/requeststream", self.config.relay_prefix));
        url.query_pairs_mut().append_pair("id", id);
        url
    }
}

fn classify_transport(err: hyper_util::client::legacy::Error) -> RelayError {
    if is_connection_refused(&err) {
        RelayError::ConnectionRefused
    } else {
        RelayError::Transport(Box::new(err))
    }
}

/// The synthesized terminal chunk posted when a request cannot be served.
pub(crate) fn error_chunk(id: &str, message: &str) -> wire::HttpResponse {
    wire::HttpResponse {
        id: Some(id.to_string()),
        status_code: Some(StatusCode::INTERNAL_SERVER_ERROR.as_u16() as i32),
        header: vec![wire::HttpHeader {
            name: Some("Content-Type".to_string()),
            value: Some("text/plain".to_string()),
        }],
        body: message.as_bytes().to_vec(),
        eof: Some(true),
        trailer: vec![],
        backend_duration_ms: None,
    }
}
