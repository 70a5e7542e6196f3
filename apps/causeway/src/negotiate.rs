use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::directory::StreamDirectory;
use crate::error::SignalError;
use crate::protocol::{IceCandidate, ServerMessage};
use crate::registry::{RouteOutcome, SessionRegistry};
use crate::upstream::{ElementRef, EndpointEvent, MediaServer, UpstreamError};

/// Drives the offer/answer/candidate exchange for one viewer-to-stream
/// attachment. Each upstream call is a suspension point and is bounded by
/// `upstream_timeout`; any failure short-circuits the remaining steps and
/// reports the step that failed.
pub struct Negotiator {
    media: Arc<dyn MediaServer>,
    registry: Arc<SessionRegistry>,
    directory: Arc<StreamDirectory>,
    upstream_timeout: Duration,
}

impl Negotiator {
    pub fn new(
        media: Arc<dyn MediaServer>,
        registry: Arc<SessionRegistry>,
        directory: Arc<StreamDirectory>,
        upstream_timeout: Duration,
    ) -> Self {
        Self {
            media,
            registry,
            directory,
            upstream_timeout,
        }
    }

    /// Negotiate one viewer's connection to one stream and return the SDP
    /// answer. On success the relay sink is owned by the session and released
    /// exactly once by teardown.
    pub async fn attach(
        &self,
        session_id: &str,
        stream_index: u32,
        sdp_offer: &str,
        tx: &mpsc::UnboundedSender<ServerMessage>,
    ) -> Result<String, SignalError> {
        if session_id.is_empty() {
            return Err(SignalError::MissingSession);
        }
        let stream = self.directory.stream(stream_index).await?;
        if self.registry.is_attached(session_id, stream_index) {
            return Err(SignalError::AlreadyAttached(stream_index));
        }

        self.registry.ensure_session(session_id, tx.clone());
        let result = self.run(session_id, stream_index, &stream, sdp_offer).await;
        if result.is_err() {
            // A failed first attach must not leave an empty session behind.
            self.registry.release_if_idle(session_id);
        }
        result
    }

    async fn run(
        &self,
        session_id: &str,
        stream_index: u32,
        stream: &crate::directory::StreamEntry,
        sdp_offer: &str,
    ) -> Result<String, SignalError> {
        // Allocating
        let sink = self
            .bounded(self.media.create_sink(&stream.group))
            .await
            .map_err(|e| e.into_signal(SignalError::AllocationFailed))?;
        debug!(session = %session_id, stream = stream_index, sink = %sink.id, "allocated relay sink");

        // Connecting
        if let Err(e) = self.bounded(self.media.connect(&stream.source, &sink)).await {
            self.release_quietly(&sink).await;
            return Err(e.into_signal(SignalError::ConnectFailed));
        }

        // Event handlers must be in place before the SDP exchange so no
        // locally gathered candidate is lost.
        let events = match self.bounded(self.media.subscribe(&sink)).await {
            Ok(events) => events,
            Err(e) => {
                self.release_quietly(&sink).await;
                return Err(e.into_signal(SignalError::NegotiationFailed));
            }
        };
        let Some(client) = self.registry.session_sender(session_id) else {
            self.release_quietly(&sink).await;
            return Err(SignalError::SessionClosed);
        };
        let forwarder = spawn_event_forwarder(events, client, stream_index);

        // Registering: the sink must be discoverable before candidate
        // draining begins, and before any further suspension point.
        if let Err(err) =
            self.registry
                .register_sink(session_id, stream_index, sink.clone(), forwarder)
        {
            self.release_quietly(&sink).await;
            return Err(err);
        }

        // Negotiating
        let sdp_answer = self
            .bounded(self.media.process_offer(&sink, sdp_offer))
            .await
            .map_err(|e| e.into_signal(SignalError::NegotiationFailed))?;

        // Gathering
        self.bounded(self.media.gather_candidates(&sink))
            .await
            .map_err(|e| e.into_signal(SignalError::GatherFailed))?;

        // Draining: queued candidates flow to the sink in arrival order,
        // exactly once. Per-candidate failures are logged, not fatal.
        for candidate in self.registry.take_queued(session_id, stream_index) {
            debug!(session = %session_id, stream = stream_index, "unqueuing candidate");
            if let Err(err) = self.bounded(self.media.add_candidate(&sink, &candidate)).await {
                warn!(
                    session = %session_id,
                    stream = stream_index,
                    error = %err,
                    "failed to deliver queued candidate"
                );
            }
        }

        info!(session = %session_id, stream = stream_index, sink = %sink.id, "attach complete");
        Ok(sdp_answer)
    }

    /// Route one remote candidate: delivered immediately when the sink
    /// exists, queued otherwise.
    pub async fn add_candidate(
        &self,
        session_id: &str,
        stream_index: u32,
        candidate: IceCandidate,
    ) -> Result<(), SignalError> {
        match self
            .registry
            .route_candidate(session_id, stream_index, candidate.clone())
        {
            RouteOutcome::Deliver(sink) => {
                debug!(session = %session_id, stream = stream_index, "forwarding candidate");
                if let Err(err) = self.bounded(self.media.add_candidate(&sink, &candidate)).await {
                    warn!(
                        session = %session_id,
                        stream = stream_index,
                        error = %err,
                        "failed to forward candidate"
                    );
                }
                Ok(())
            }
            RouteOutcome::Queued => {
                debug!(session = %session_id, stream = stream_index, "queueing candidate");
                Ok(())
            }
            RouteOutcome::Overflow => Err(SignalError::CandidateOverflow(stream_index)),
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, UpstreamError>>,
    ) -> Result<T, BoundedError> {
        match timeout(self.upstream_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(BoundedError::Upstream(err)),
            Err(_) => Err(BoundedError::TimedOut(self.upstream_timeout)),
        }
    }

    async fn release_quietly(&self, sink: &ElementRef) {
        if let Err(err) = self.bounded(self.media.release(sink)).await {
            warn!(sink = %sink.id, error = %err, "failed to release sink after aborted attach");
        }
    }
}

#[derive(Debug, Error)]
enum BoundedError {
    #[error(transparent)]
    Upstream(UpstreamError),
    #[error("upstream call exceeded {0:?}")]
    TimedOut(Duration),
}

impl BoundedError {
    /// Map onto the taxonomy: connectivity loss is `UpstreamUnavailable`,
    /// a timeout is its own kind, anything else names the failed step.
    fn into_signal(self, step: fn(String) -> SignalError) -> SignalError {
        match self {
            BoundedError::Upstream(UpstreamError::Unavailable(m)) => {
                SignalError::UpstreamUnavailable(m)
            }
            BoundedError::Upstream(UpstreamError::ConnectionLost) => {
                SignalError::UpstreamUnavailable(UpstreamError::ConnectionLost.to_string())
            }
            BoundedError::Upstream(err) => step(err.to_string()),
            BoundedError::TimedOut(after) => SignalError::UpstreamTimeout(after),
        }
    }
}

fn spawn_event_forwarder(
    mut events: mpsc::UnboundedReceiver<EndpointEvent>,
    client: mpsc::UnboundedSender<ServerMessage>,
    stream_index: u32,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                EndpointEvent::CandidateFound(candidate) => {
                    let pushed = client.send(ServerMessage::IceCandidate {
                        candidate,
                        video_id: stream_index,
                    });
                    if pushed.is_err() {
                        break;
                    }
                }
                EndpointEvent::MediaFlowIn { state } => {
                    debug!(stream = stream_index, %state, "media flow in state change");
                }
                EndpointEvent::MediaFlowOut { state } => {
                    debug!(stream = stream_index, %state, "media flow out state change");
                }
            }
        }
    })
}
