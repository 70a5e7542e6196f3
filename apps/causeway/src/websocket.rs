use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::directory::StreamDirectory;
use crate::negotiate::Negotiator;
use crate::protocol::{ClientMessage, ServerMessage, StreamSummary};
use crate::registry::SessionRegistry;
use crate::upstream::MediaServer;

/// Shared state handed to every connection handler.
#[derive(Clone)]
pub struct SignalingState {
    pub registry: Arc<SessionRegistry>,
    pub directory: Arc<StreamDirectory>,
    pub negotiator: Arc<Negotiator>,
    pub media: Arc<dyn MediaServer>,
}

/// WebSocket upgrade handler for the signaling channel.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<SignalingState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Owns one client connection: pumps outbound messages, dispatches inbound
/// ones, and tears the session down when the transport errors or closes.
async fn handle_socket(socket: WebSocket, state: SignalingState) {
    // The correlation id for everything this connection negotiates.
    let session_id = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let pump_session = session_id.clone();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(session = %pump_session, error = %e, "dropping unserializable message"),
            }
        }
        debug!(session = %pump_session, "outbound pump ended");
    });

    info!(session = %session_id, "signaling connection established");

    while let Some(frame) = receiver.next().await {
        let msg = match frame {
            Ok(m) => m,
            Err(e) => {
                error!(session = %session_id, error = %e, "signaling connection error");
                break;
            }
        };

        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_msg) => dispatch(client_msg, &session_id, &state, &tx).await,
                Err(e) => {
                    // Not fatal for the connection; report and carry on.
                    warn!(session = %session_id, error = %e, "unrecognized signaling message");
                    let _ = tx.send(ServerMessage::Error {
                        message: format!("Invalid message {}", text),
                    });
                }
            },
            Message::Close(_) => {
                debug!(session = %session_id, "received close frame");
                break;
            }
            // Ping/pong handled by axum, binary frames have no meaning here.
            _ => {}
        }
    }

    state.registry.stop(&session_id, state.media.as_ref()).await;
    info!(session = %session_id, "signaling connection closed");
}

async fn dispatch(
    message: ClientMessage,
    session_id: &str,
    state: &SignalingState,
    tx: &mpsc::UnboundedSender<ServerMessage>,
) {
    match message {
        ClientMessage::GetPipelines => {
            let reply = match state.directory.discover().await {
                Ok(snapshot) => ServerMessage::GetPipelinesResponse {
                    info: snapshot.streams.iter().map(StreamSummary::from).collect(),
                },
                Err(err) => {
                    warn!(session = %session_id, error = %err, "stream discovery failed");
                    ServerMessage::Error {
                        message: err.to_string(),
                    }
                }
            };
            let _ = tx.send(reply);
        }

        ClientMessage::PlayVideo {
            video_id,
            sdp_offer,
        } => {
            let reply = match state
                .negotiator
                .attach(session_id, video_id, &sdp_offer, tx)
                .await
            {
                Ok(sdp_answer) => ServerMessage::PlayVideoResponse {
                    video_id,
                    sdp_answer,
                },
                Err(err) => {
                    warn!(session = %session_id, stream = video_id, error = %err, "attach failed");
                    ServerMessage::Error {
                        message: err.to_string(),
                    }
                }
            };
            let _ = tx.send(reply);
        }

        ClientMessage::Stop => {
            state.registry.stop(session_id, state.media.as_ref()).await;
        }

        ClientMessage::OnIceCandidate {
            candidate,
            video_id,
        } => {
            if let Err(err) = state
                .negotiator
                .add_candidate(session_id, video_id, candidate)
                .await
            {
                let _ = tx.send(ServerMessage::Error {
                    message: err.to_string(),
                });
            }
        }
    }
}
