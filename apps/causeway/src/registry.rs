use std::collections::VecDeque;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SignalError;
use crate::protocol::{IceCandidate, ServerMessage};
use crate::upstream::{ElementRef, MediaServer};

/// Per-connection signaling state. One entry per correlation id, created when
/// the connection's first attach begins.
struct Session {
    /// Channel used to push asynchronous events back to the client.
    tx: mpsc::UnboundedSender<ServerMessage>,
}

/// State for one (session, stream) pair: the relay sink once negotiation has
/// registered it, and candidates that arrived before it existed.
#[derive(Default)]
struct Attachment {
    sink: Option<ElementRef>,
    queued: VecDeque<IceCandidate>,
    forwarder: Option<JoinHandle<()>>,
}

/// Where a routed candidate ended up.
#[derive(Debug)]
pub enum RouteOutcome {
    /// A sink exists; the caller should deliver the candidate to it.
    Deliver(ElementRef),
    Queued,
    Overflow,
}

/// Owns every session's attachments and the pre-attach candidate queues.
///
/// Sink existence and candidate queueing live under the same map entry, so a
/// candidate can never fall between "sink allocated" and "sink discoverable".
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
    attachments: DashMap<(String, u32), Attachment>,
    queue_depth: usize,
}

impl SessionRegistry {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            attachments: DashMap::new(),
            queue_depth,
        }
    }

    /// Bind the session's outbound channel, creating the entry if this is the
    /// connection's first negotiation.
    pub fn ensure_session(&self, session_id: &str, tx: mpsc::UnboundedSender<ServerMessage>) {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session { tx });
    }

    pub fn session_sender(
        &self,
        session_id: &str,
    ) -> Option<mpsc::UnboundedSender<ServerMessage>> {
        self.sessions.get(session_id).map(|entry| entry.tx.clone())
    }

    /// Drop the session entry again if it owns no sinks. Used to unwind a
    /// failed first attach so an idle connection has no session state.
    pub fn release_if_idle(&self, session_id: &str) {
        let owns_sink = self
            .attachments
            .iter()
            .any(|entry| entry.key().0 == session_id && entry.value().sink.is_some());
        if !owns_sink {
            self.sessions.remove(session_id);
        }
    }

    pub fn is_attached(&self, session_id: &str, stream_index: u32) -> bool {
        self.attachments
            .get(&(session_id.to_string(), stream_index))
            .map(|entry| entry.sink.is_some())
            .unwrap_or(false)
    }

    /// Record the sink under (session, stream). Fails if the session was torn
    /// down while negotiation was in flight, in which case the caller still
    /// owns the sink and must release it.
    pub fn register_sink(
        &self,
        session_id: &str,
        stream_index: u32,
        sink: ElementRef,
        forwarder: JoinHandle<()>,
    ) -> Result<(), SignalError> {
        let mut entry = self
            .attachments
            .entry((session_id.to_string(), stream_index))
            .or_default();
        // Checked while holding the attachment entry: a concurrent stop either
        // already removed the session (we fail here) or will scan the
        // attachments after us and find the sink we are about to store.
        if !self.sessions.contains_key(session_id) {
            return Err(SignalError::SessionClosed);
        }
        if entry.sink.is_some() {
            return Err(SignalError::AlreadyAttached(stream_index));
        }
        entry.sink = Some(sink);
        entry.forwarder = Some(forwarder);
        Ok(())
    }

    /// Route a candidate: deliverable right away if the sink exists, queued
    /// (bounded, FIFO) otherwise.
    pub fn route_candidate(
        &self,
        session_id: &str,
        stream_index: u32,
        candidate: IceCandidate,
    ) -> RouteOutcome {
        let mut entry = self
            .attachments
            .entry((session_id.to_string(), stream_index))
            .or_default();
        if let Some(sink) = &entry.sink {
            return RouteOutcome::Deliver(sink.clone());
        }
        if entry.queued.len() >= self.queue_depth {
            warn!(
                session = %session_id,
                stream = stream_index,
                depth = self.queue_depth,
                "candidate queue full, dropping candidate"
            );
            return RouteOutcome::Overflow;
        }
        entry.queued.push_back(candidate);
        RouteOutcome::Queued
    }

    /// Take every queued candidate for (session, stream) in arrival order.
    pub fn take_queued(&self, session_id: &str, stream_index: u32) -> Vec<IceCandidate> {
        self.attachments
            .get_mut(&(session_id.to_string(), stream_index))
            .map(|mut entry| entry.queued.drain(..).collect())
            .unwrap_or_default()
    }

    /// Tear down everything the session owns. Idempotent; unknown sessions
    /// are a no-op. Per-sink release failures are logged and swallowed so the
    /// session entry is always cleared.
    pub async fn stop(&self, session_id: &str, media: &dyn MediaServer) {
        let existed = self.sessions.remove(session_id).is_some();

        let keys: Vec<(String, u32)> = self
            .attachments
            .iter()
            .filter(|entry| entry.key().0 == session_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut sinks = Vec::new();
        for key in keys {
            if let Some((_, attachment)) = self.attachments.remove(&key) {
                if let Some(forwarder) = attachment.forwarder {
                    forwarder.abort();
                }
                if !attachment.queued.is_empty() {
                    debug!(
                        session = %session_id,
                        stream = key.1,
                        discarded = attachment.queued.len(),
                        "discarding queued candidates"
                    );
                }
                if let Some(sink) = attachment.sink {
                    sinks.push((key.1, sink));
                }
            }
        }

        for (stream_index, sink) in sinks {
            info!(session = %session_id, stream = stream_index, sink = %sink.id, "releasing relay sink");
            if let Err(err) = media.release(&sink).await {
                warn!(
                    session = %session_id,
                    stream = stream_index,
                    error = %err,
                    "failed to release relay sink during teardown"
                );
            }
        }

        if existed {
            info!(session = %session_id, "session torn down");
        }
    }

    #[cfg(test)]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
