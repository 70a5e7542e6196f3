use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::protocol::IceCandidate;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("media server unreachable: {0}")]
    Unavailable(String),
    #[error("media server connection lost")]
    ConnectionLost,
    #[error("media server rejected the call: {0}")]
    Rpc(String),
}

/// What a group child is, as reported by the media server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    /// Originates media (e.g. a player endpoint reading a file or RTSP feed).
    Source,
    /// Relay endpoint terminating media toward one viewer.
    RelaySink,
    Other,
}

/// A processing group on the media server, correlating one source with its
/// attached sinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRef {
    pub id: String,
}

/// A media element living inside a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementRef {
    pub id: String,
    pub kind: ElementKind,
}

/// Asynchronous notifications emitted by a relay sink.
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    CandidateFound(IceCandidate),
    MediaFlowIn { state: String },
    MediaFlowOut { state: String },
}

/// The interface boundary to the remote media-processing service. Everything
/// the core needs from upstream goes through this trait so the negotiation
/// and discovery logic can be exercised against a fake in tests.
#[async_trait]
pub trait MediaServer: Send + Sync {
    async fn groups(&self) -> Result<Vec<GroupRef>, UpstreamError>;
    async fn children(&self, group: &GroupRef) -> Result<Vec<ElementRef>, UpstreamError>;
    async fn element_name(&self, element: &ElementRef)
        -> Result<Option<String>, UpstreamError>;
    /// Turn on per-element latency accounting for a group so its stats carry
    /// end-to-end latency records.
    async fn enable_latency_stats(&self, group: &GroupRef) -> Result<(), UpstreamError>;
    async fn create_sink(&self, group: &GroupRef) -> Result<ElementRef, UpstreamError>;
    async fn connect(&self, source: &ElementRef, sink: &ElementRef)
        -> Result<(), UpstreamError>;
    async fn process_offer(&self, sink: &ElementRef, offer: &str)
        -> Result<String, UpstreamError>;
    async fn gather_candidates(&self, sink: &ElementRef) -> Result<(), UpstreamError>;
    async fn add_candidate(
        &self,
        sink: &ElementRef,
        candidate: &IceCandidate,
    ) -> Result<(), UpstreamError>;
    async fn release(&self, element: &ElementRef) -> Result<(), UpstreamError>;
    /// Subscribe to the element's event feed. The receiver closes when the
    /// element is released or the upstream connection drops.
    async fn subscribe(
        &self,
        element: &ElementRef,
    ) -> Result<mpsc::UnboundedReceiver<EndpointEvent>, UpstreamError>;
    async fn element_stats(
        &self,
        element: &ElementRef,
        media_type: &str,
    ) -> Result<Value, UpstreamError>;
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, UpstreamError>>>>>;
type SubscriberMap = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<EndpointEvent>>>>;

/// JSON-RPC 2.0 client for a Kurento-style media server, multiplexing calls
/// and event notifications over one WebSocket.
pub struct RpcMediaServer {
    outbound: mpsc::UnboundedSender<Message>,
    pending: PendingMap,
    subscribers: SubscriberMap,
    next_id: AtomicU64,
    manager_object: String,
}

impl RpcMediaServer {
    pub async fn connect(url: &str) -> Result<Self, UpstreamError> {
        Url::parse(url)
            .map_err(|e| UpstreamError::Unavailable(format!("invalid media server url {url}: {e}")))?;

        let (ws, _) = timeout(CONNECT_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| UpstreamError::Unavailable(format!("timed out connecting to {url}")))?
            .map_err(|e| {
                UpstreamError::Unavailable(format!("could not reach media server at {url}: {e}"))
            })?;

        let (mut sink, mut stream) = ws.split();

        let (outbound, mut rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let subscribers: SubscriberMap = Arc::new(Mutex::new(HashMap::new()));

        let reader_pending = pending.clone();
        let reader_subscribers = subscribers.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "media server connection error");
                        break;
                    }
                };
                match serde_json::from_str::<Value>(text.as_str()) {
                    Ok(value) => route_frame(value, &reader_pending, &reader_subscribers).await,
                    Err(e) => warn!(error = %e, "discarding unparseable media server frame"),
                }
            }
            // Fail every in-flight call and close every event feed so callers
            // observe the loss instead of hanging.
            for (_, completion) in reader_pending.lock().await.drain() {
                let _ = completion.send(Err(UpstreamError::ConnectionLost));
            }
            reader_subscribers.lock().await.clear();
            warn!("media server connection closed");
        });

        Ok(Self {
            outbound,
            pending,
            subscribers,
            next_id: AtomicU64::new(1),
            manager_object: "manager_ServerManager".to_string(),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, UpstreamError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let (completion, response) = oneshot::channel();
        self.pending.lock().await.insert(id, completion);

        if self
            .outbound
            .send(Message::Text(request.to_string().into()))
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(UpstreamError::ConnectionLost);
        }

        response.await.map_err(|_| UpstreamError::ConnectionLost)?
    }

    async fn invoke(
        &self,
        object: &str,
        operation: &str,
        params: Value,
    ) -> Result<Value, UpstreamError> {
        self.call(
            "invoke",
            json!({
                "object": object,
                "operation": operation,
                "operationParams": params,
            }),
        )
        .await
    }
}

async fn route_frame(frame: Value, pending: &PendingMap, subscribers: &SubscriberMap) {
    if let Some(id) = frame.get("id").and_then(Value::as_u64) {
        let completion = pending.lock().await.remove(&id);
        let Some(completion) = completion else {
            warn!(id, "media server response for unknown request id");
            return;
        };
        let result = match frame.get("error") {
            Some(error) => Err(UpstreamError::Rpc(
                error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            )),
            None => Ok(frame.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = completion.send(result);
        return;
    }

    if frame.get("method").and_then(Value::as_str) == Some("onEvent") {
        let Some(value) = frame.pointer("/params/value") else {
            return;
        };
        let Some(object) = value.get("object").and_then(Value::as_str) else {
            return;
        };
        let Some(event) = parse_event(value) else {
            debug!(object, "ignoring unhandled media server event");
            return;
        };
        if let Some(feed) = subscribers.lock().await.get(object) {
            let _ = feed.send(event);
        }
    }
}

fn parse_event(value: &Value) -> Option<EndpointEvent> {
    let state_of = |value: &Value| {
        value
            .pointer("/data/state")
            .and_then(Value::as_str)
            .unwrap_or("UNKNOWN")
            .to_string()
    };
    match value.get("type").and_then(Value::as_str)? {
        "OnIceCandidate" | "IceCandidateFound" => {
            let candidate =
                serde_json::from_value(value.pointer("/data/candidate")?.clone()).ok()?;
            Some(EndpointEvent::CandidateFound(candidate))
        }
        "MediaFlowInStateChange" => Some(EndpointEvent::MediaFlowIn {
            state: state_of(value),
        }),
        "MediaFlowOutStateChange" => Some(EndpointEvent::MediaFlowOut {
            state: state_of(value),
        }),
        _ => None,
    }
}

/// Element ids on the wire embed the element type (`<uuid>_kurento.<Type>`),
/// which is the explicit tag discovery classifies by.
fn kind_from_id(id: &str) -> ElementKind {
    if id.contains("PlayerEndpoint") {
        ElementKind::Source
    } else if id.contains("WebRtcEndpoint") {
        ElementKind::RelaySink
    } else {
        ElementKind::Other
    }
}

fn expect_str(value: Value, context: &str) -> Result<String, UpstreamError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| UpstreamError::Rpc(format!("{context} returned a non-string result")))
}

fn expect_id_array(value: &Value, context: &str) -> Result<Vec<String>, UpstreamError> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .ok_or_else(|| UpstreamError::Rpc(format!("{context} returned a non-array result")))
}

#[async_trait]
impl MediaServer for RpcMediaServer {
    async fn groups(&self) -> Result<Vec<GroupRef>, UpstreamError> {
        let result = self
            .invoke(&self.manager_object, "getPipelines", json!({}))
            .await?;
        Ok(expect_id_array(&result, "getPipelines")?
            .into_iter()
            .map(|id| GroupRef { id })
            .collect())
    }

    async fn children(&self, group: &GroupRef) -> Result<Vec<ElementRef>, UpstreamError> {
        let result = self.invoke(&group.id, "getChildren", json!({})).await?;
        Ok(expect_id_array(&result, "getChildren")?
            .into_iter()
            .map(|id| {
                let kind = kind_from_id(&id);
                ElementRef { id, kind }
            })
            .collect())
    }

    async fn element_name(
        &self,
        element: &ElementRef,
    ) -> Result<Option<String>, UpstreamError> {
        let result = self.invoke(&element.id, "getName", json!({})).await?;
        Ok(result.as_str().map(str::to_string))
    }

    async fn enable_latency_stats(&self, group: &GroupRef) -> Result<(), UpstreamError> {
        self.invoke(&group.id, "setLatencyStats", json!({ "latencyStats": true }))
            .await?;
        Ok(())
    }

    async fn create_sink(&self, group: &GroupRef) -> Result<ElementRef, UpstreamError> {
        let result = self
            .call(
                "create",
                json!({
                    "type": "WebRtcEndpoint",
                    "constructorParams": { "mediaPipeline": group.id },
                }),
            )
            .await?;
        let id = expect_str(
            result.get("value").cloned().unwrap_or(Value::Null),
            "create",
        )?;
        Ok(ElementRef {
            id,
            kind: ElementKind::RelaySink,
        })
    }

    async fn connect(
        &self,
        source: &ElementRef,
        sink: &ElementRef,
    ) -> Result<(), UpstreamError> {
        self.invoke(&source.id, "connect", json!({ "sink": sink.id }))
            .await?;
        Ok(())
    }

    async fn process_offer(
        &self,
        sink: &ElementRef,
        offer: &str,
    ) -> Result<String, UpstreamError> {
        let result = self
            .invoke(&sink.id, "processOffer", json!({ "offer": offer }))
            .await?;
        expect_str(result, "processOffer")
    }

    async fn gather_candidates(&self, sink: &ElementRef) -> Result<(), UpstreamError> {
        self.invoke(&sink.id, "gatherCandidates", json!({})).await?;
        Ok(())
    }

    async fn add_candidate(
        &self,
        sink: &ElementRef,
        candidate: &IceCandidate,
    ) -> Result<(), UpstreamError> {
        self.invoke(&sink.id, "addIceCandidate", json!({ "candidate": candidate }))
            .await?;
        Ok(())
    }

    async fn release(&self, element: &ElementRef) -> Result<(), UpstreamError> {
        self.subscribers.lock().await.remove(&element.id);
        self.call("release", json!({ "object": element.id })).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        element: &ElementRef,
    ) -> Result<mpsc::UnboundedReceiver<EndpointEvent>, UpstreamError> {
        let (feed, events) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .await
            .insert(element.id.clone(), feed);
        for event in [
            "OnIceCandidate",
            "MediaFlowInStateChange",
            "MediaFlowOutStateChange",
        ] {
            self.call(
                "subscribe",
                json!({ "object": element.id, "type": event }),
            )
            .await?;
        }
        Ok(events)
    }

    async fn element_stats(
        &self,
        element: &ElementRef,
        media_type: &str,
    ) -> Result<Value, UpstreamError> {
        self.invoke(&element.id, "getStats", json!({ "mediaType": media_type }))
            .await
    }
}
