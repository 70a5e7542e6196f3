use std::time::Duration;

use thiserror::Error;

/// Everything that can go wrong while serving one signaling request.
///
/// Each variant names the specific step that failed; the whole error is
/// reported back to the requesting connection as a single `error` message
/// and never affects other sessions.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("cannot use an empty session id")]
    MissingSession,

    #[error("unknown stream index {0}")]
    UnknownStream(u32),

    #[error("stream {0} is already attached for this session")]
    AlreadyAttached(u32),

    #[error("media server unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("failed to allocate relay sink: {0}")]
    AllocationFailed(String),

    #[error("failed to connect source to relay sink: {0}")]
    ConnectFailed(String),

    #[error("offer negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("candidate gathering failed: {0}")]
    GatherFailed(String),

    #[error("media server call timed out after {0:?}")]
    UpstreamTimeout(Duration),

    #[error("candidate queue full for stream {0}")]
    CandidateOverflow(u32),

    #[error("session was closed while negotiation was in flight")]
    SessionClosed,
}
