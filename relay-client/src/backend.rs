//! Turns a pulled relay request into a backend call.

use std::fs;

use bytes::Bytes;
use http::{header, HeaderName, HeaderValue, Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use tracing::{debug, info};
use url::Url;

use crate::config::ClientConfig;
use crate::error::BuildError;
use crate::trace::TraceContext;
use crate::transport::HttpClient;
use crate::wire;

/// Rewrites a pulled request to point at the local backend. The pulled
/// URL's host is a placeholder; scheme and host are replaced, the path is
/// prefixed with `backend_path`, and query and fragment pass through.
pub(crate) fn build_backend_request(
    config: &ClientConfig,
    breq: &wire::HttpRequest,
) -> Result<Request<Full<Bytes>>, BuildError> {
    let target = Url::parse(breq.url()).map_err(|source| BuildError::Url {
        url: breq.url().to_string(),
        source,
    })?;

    let base = format!("{}://{}/", config.backend_scheme, config.backend_address);
    let mut backend = Url::parse(&base).map_err(|source| BuildError::Url { url: base, source })?;
    backend.set_path(&format!("{}{}", config.backend_path, target.path()));
    backend.set_query(target.query());
    backend.set_fragment(target.fragment());

    info!(id = breq.id(), method = breq.method(), url = %backend, "Sending request to backend");

    let mut builder = Request::builder()
        .method(breq.method().as_bytes())
        .uri(backend.as_str());
    for header in &breq.header {
        let (Some(name), Some(value)) = (header.name.as_deref(), header.value.as_deref()) else {
            continue;
        };
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            debug!(id = breq.id(), name, "Skipping invalid header name");
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            debug!(id = breq.id(), name = %name, "Skipping invalid header value");
            continue;
        };
        builder = builder.header(name, value);
    }

    let mut request = builder.body(Full::from(Bytes::from(breq.body.clone())))?;

    if config.preserve_host {
        if let Some(host) = breq.host.as_deref() {
            match HeaderValue::from_str(host) {
                Ok(value) => {
                    request.headers_mut().insert(header::HOST, value);
                }
                Err(_) => debug!(id = breq.id(), host, "Skipping invalid host header"),
            }
        }
    }

    if let Some(path) = &config.authentication_token_file {
        let token = fs::read_to_string(path).map_err(|source| BuildError::TokenFile {
            path: path.display().to_string(),
            source,
        })?;
        let value = HeaderValue::from_str(&format!("Bearer {}", token.trim_end()))
            .map_err(http::Error::from)?;
        request.headers_mut().insert(header::AUTHORIZATION, value);
    }

    Ok(request)
}

/// Executes the backend request, injecting the span context as W3C trace
/// headers. Returns the seed response chunk (id, status, header snapshot,
/// no body) together with the raw response so the caller can stream the
/// body and pick up trailers once it hits EOF.
pub(crate) async fn invoke_backend(
    local: &HttpClient,
    mut request: Request<Full<Bytes>>,
    span: &TraceContext,
    id: &str,
) -> Result<(wire::HttpResponse, Response<Incoming>), hyper_util::client::legacy::Error> {
    span.inject(request.headers_mut());

    let response = local.request(request).await?;
    debug!(id, status = response.status().as_u16(), "Backend responded");

    let seed = wire::HttpResponse {
        id: Some(id.to_string()),
        status_code: Some(response.status().as_u16() as i32),
        header: wire::headers_from_map(response.headers()),
        ..Default::default()
    };
    Ok((seed, response))
}
