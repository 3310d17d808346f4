use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use anyhow::Context;
use bytes::Bytes;
use http_body_util::Full;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tracing::warn;
use webpki_roots::TLS_SERVER_ROOTS;

use crate::config::ClientConfig;

/// HTTP client shared by all workers; the internal pool makes it safe for
/// concurrent use.
pub type HttpClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

/// OAuth scope the external identity provider is expected to request for
/// relay authentication.
pub const RELAY_AUTH_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform.read-only";

/// Bearer-token provider for relay authentication. Token acquisition and
/// refresh (for example from a cloud identity provider) live outside this
/// crate; the client only stamps `Authorization: Bearer <token>`.
pub trait TokenSource: Send + Sync {
    fn token(&self) -> anyhow::Result<String>;
}

/// Token source backed by a file that an external agent keeps fresh, such
/// as a mounted service-account token.
pub struct FileTokenSource {
    path: PathBuf,
}

impl FileTokenSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TokenSource for FileTokenSource {
    fn token(&self) -> anyhow::Result<String> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read token from {}", self.path.display()))?;
        Ok(contents.trim_end().to_string())
    }
}

fn ensure_crypto_provider() {
    static INSTALL: OnceLock<()> = OnceLock::new();
    INSTALL.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Builds the client used for all relay-server calls: default roots,
/// HTTP/1.1, idle pool sized for `num_pending_requests` parallel long polls.
pub fn build_remote_client(config: &ClientConfig) -> anyhow::Result<HttpClient> {
    ensure_crypto_provider();

    let https = HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .build();

    let mut builder = Client::builder(TokioExecutor::new());
    builder.pool_max_idle_per_host(config.max_idle_conns_per_host);
    Ok(builder.build(https))
}

/// Builds the client used for backend calls.
///
/// HTTP version selection mirrors the configuration flags: ALPN h1+h2 by
/// default, HTTP/1.1 only with `disable_http2`, and HTTP/2 only with
/// `force_http2` (prior-knowledge cleartext HTTP/2 when the backend scheme
/// is `http`, for gRPC backends). Redirects are never followed; 3xx
/// responses pass through the relay untouched.
pub fn build_local_client(config: &ClientConfig) -> anyhow::Result<HttpClient> {
    ensure_crypto_provider();

    let tls = local_tls_config(config)?;
    let builder = HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http();

    let https = if config.force_http2 {
        builder.enable_http2().build()
    } else if config.disable_http2 {
        builder.enable_http1().build()
    } else {
        builder.enable_all_versions().build()
    };

    let mut builder = Client::builder(TokioExecutor::new());
    builder.pool_max_idle_per_host(config.max_idle_conns_per_host);
    if config.force_http2 {
        builder.http2_only(true);
    }
    Ok(builder.build(https))
}

fn local_tls_config(config: &ClientConfig) -> anyhow::Result<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    match &config.root_ca_file {
        Some(path) => {
            let pem = fs::read(path)
                .with_context(|| format!("failed to read CA file {}", path.display()))?;
            let certs = rustls_pemfile::certs(&mut pem.as_slice())
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("failed to parse CA file {}", path.display()))?;
            let (added, _) = roots.add_parsable_certificates(certs);
            if added == 0 {
                anyhow::bail!("no certs found in {}", path.display());
            }
        }
        None => roots.extend(TLS_SERVER_ROOTS.iter().cloned()),
    }

    let mut tls = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    if let Ok(keylog_file) = std::env::var("SSLKEYLOGFILE") {
        prepare_keylog_file(&keylog_file);
        tls.key_log = Arc::new(rustls::KeyLogFile::new());
    }

    Ok(tls)
}

// rustls appends to SSLKEYLOGFILE; truncate it once per process start so
// stale keys from earlier runs don't accumulate.
fn prepare_keylog_file(path: &str) {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    if let Err(err) = options.open(path) {
        warn!(path, error = %err, "Cannot open keylog file (check SSLKEYLOGFILE)");
    }
}
