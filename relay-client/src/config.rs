use anyhow::Context;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Client configuration, immutable after construction.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upper bound on any single call to the relay server.
    pub remote_request_timeout: Duration,
    /// Trickle interval: how long the response collator accumulates data
    /// before flushing a chunk.
    pub backend_response_timeout: Duration,

    /// Skip bearer authentication on relay calls.
    pub disable_auth_for_remote: bool,
    /// PEM bundle that replaces the default root CA pool for the backend.
    pub root_ca_file: Option<PathBuf>,
    /// File whose contents are sent as `Authorization: Bearer <contents>`
    /// on every backend request.
    pub authentication_token_file: Option<PathBuf>,

    pub backend_scheme: String,
    pub backend_address: String,
    /// Prefix prepended to the path of every pulled request.
    pub backend_path: String,
    /// Forward the original Host header to the backend.
    pub preserve_host: bool,

    pub relay_scheme: String,
    pub relay_address: String,
    pub relay_prefix: String,

    /// Which relay queue to poll.
    pub server_name: String,

    /// Number of concurrent pollers.
    pub num_pending_requests: usize,
    pub max_idle_conns_per_host: usize,

    /// Upper bound on a single response chunk's body.
    pub max_chunk_size: usize,
    /// Read granularity from the backend body.
    pub block_size: usize,

    pub disable_http2: bool,
    pub force_http2: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            remote_request_timeout: Duration::from_secs(60),
            backend_response_timeout: Duration::from_millis(100),

            disable_auth_for_remote: false,
            root_ca_file: None,
            authentication_token_file: None,

            backend_scheme: "https".to_string(),
            backend_address: "localhost:8080".to_string(),
            backend_path: String::new(),
            preserve_host: true,

            relay_scheme: "https".to_string(),
            relay_address: "localhost:8081".to_string(),
            relay_prefix: String::new(),

            server_name: "server_name".to_string(),

            num_pending_requests: 1,
            max_idle_conns_per_host: 100,

            max_chunk_size: 50 * 1024,
            block_size: 10 * 1024,

            disable_http2: false,
            force_http2: false,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let config = Self {
            remote_request_timeout: env_optional_duration_ms("REMOTE_REQUEST_TIMEOUT_MS")?
                .unwrap_or(defaults.remote_request_timeout),
            backend_response_timeout: env_optional_duration_ms("BACKEND_RESPONSE_TIMEOUT_MS")?
                .unwrap_or(defaults.backend_response_timeout),

            disable_auth_for_remote: env_bool("DISABLE_AUTH_FOR_REMOTE", false),
            root_ca_file: env_optional_path("ROOT_CA_FILE"),
            authentication_token_file: env_optional_path("AUTHENTICATION_TOKEN_FILE"),

            backend_scheme: env_string("BACKEND_SCHEME", &defaults.backend_scheme),
            backend_address: env_string("BACKEND_ADDRESS", &defaults.backend_address),
            backend_path: env_string("BACKEND_PATH", ""),
            preserve_host: env_bool("PRESERVE_HOST", true),

            relay_scheme: env_string("RELAY_SCHEME", &defaults.relay_scheme),
            relay_address: env_string("RELAY_ADDRESS", &defaults.relay_address),
            relay_prefix: env_string("RELAY_PREFIX", ""),

            server_name: env_string("SERVER_NAME", &defaults.server_name),

            num_pending_requests: env_optional_usize("NUM_PENDING_REQUESTS")?
                .unwrap_or(defaults.num_pending_requests),
            max_idle_conns_per_host: env_optional_usize("MAX_IDLE_CONNS_PER_HOST")?
                .unwrap_or(defaults.max_idle_conns_per_host),

            max_chunk_size: env_optional_usize("MAX_CHUNK_SIZE")?
                .unwrap_or(defaults.max_chunk_size),
            block_size: env_optional_usize("BLOCK_SIZE")?.unwrap_or(defaults.block_size),

            disable_http2: env_bool("DISABLE_HTTP2", false),
            force_http2: env_bool("FORCE_HTTP2", false),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.force_http2 && self.disable_http2 {
            anyhow::bail!("cannot use FORCE_HTTP2 together with DISABLE_HTTP2");
        }
        if self.num_pending_requests < 1 {
            anyhow::bail!("NUM_PENDING_REQUESTS must be at least 1");
        }
        if self.max_chunk_size == 0 || self.block_size == 0 {
            anyhow::bail!("MAX_CHUNK_SIZE and BLOCK_SIZE must be non-zero");
        }
        Ok(())
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes"
        ),
        Err(_) => default,
    }
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_optional_path(name: &str) -> Option<PathBuf> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

fn env_optional_usize(name: &str) -> anyhow::Result<Option<usize>> {
    match env::var(name) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            let parsed = trimmed
                .parse::<usize>()
                .with_context(|| format!("{name} must be a non-negative integer"))?;
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}

fn env_optional_duration_ms(name: &str) -> anyhow::Result<Option<Duration>> {
    Ok(env_optional_usize(name)?.map(|ms| Duration::from_millis(ms as u64)))
}
