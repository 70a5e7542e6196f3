use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the signaling/HTTP listener binds on.
    pub port: u16,
    /// WebSocket URL of the upstream media server.
    pub media_server_url: String,
    /// Bound applied to every upstream media-server call.
    pub upstream_timeout_ms: u64,
    /// Per-(session, stream) cap on buffered pre-attach candidates.
    pub candidate_queue_depth: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("CAUSEWAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8443),
            media_server_url: env::var("MEDIA_SERVER_URL")
                .unwrap_or_else(|_| "ws://127.0.0.1:8888/kurento".to_string()),
            upstream_timeout_ms: env::var("UPSTREAM_TIMEOUT_MS")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(10_000),
            candidate_queue_depth: env::var("CANDIDATE_QUEUE_DEPTH")
                .ok()
                .and_then(|d| d.parse().ok())
                .unwrap_or(64),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8443,
            media_server_url: "ws://127.0.0.1:8888/kurento".to_string(),
            upstream_timeout_ms: 10_000,
            candidate_queue_depth: 64,
        }
    }
}
