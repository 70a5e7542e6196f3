use serde::{Deserialize, Serialize};

use crate::directory::StreamEntry;

/// An ICE candidate as exchanged with the browser. Field names follow the
/// `RTCIceCandidateInit` dictionary so the payload can be handed to
/// `addIceCandidate` on either side unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u32>,
}

/// One playable stream as advertised to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSummary {
    /// Positional index within the current discovery generation.
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub group: String,
    pub source: String,
}

impl From<&StreamEntry> for StreamSummary {
    fn from(entry: &StreamEntry) -> Self {
        Self {
            id: entry.index,
            name: entry.name.clone(),
            group: entry.group.id.clone(),
            source: entry.source.id.clone(),
        }
    }
}

/// Messages sent from browser to server over the signaling WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Request the list of playable streams.
    GetPipelines,
    /// Start playback of one stream: submit an SDP offer, expect an answer.
    #[serde(rename_all = "camelCase")]
    PlayVideo { video_id: u32, sdp_offer: String },
    /// Tear down everything this connection negotiated.
    Stop,
    /// A remote ICE candidate for one stream attachment.
    #[serde(rename_all = "camelCase")]
    OnIceCandidate {
        candidate: IceCandidate,
        video_id: u32,
    },
}

/// Messages sent from server to browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    GetPipelinesResponse { info: Vec<StreamSummary> },
    #[serde(rename_all = "camelCase")]
    PlayVideoResponse { video_id: u32, sdp_answer: String },
    /// Pushed asynchronously as local candidates are gathered upstream.
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        candidate: IceCandidate,
        video_id: u32,
    },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn play_video_wire_format() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"id":"playVideo","videoId":0,"sdpOffer":"O"}"#).unwrap();
        match msg {
            ClientMessage::PlayVideo {
                video_id,
                sdp_offer,
            } => {
                assert_eq!(video_id, 0);
                assert_eq!(sdp_offer, "O");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn candidate_uses_browser_field_names() {
        let json = r#"{"id":"onIceCandidate","videoId":2,"candidate":{"candidate":"candidate:1 1 UDP 1 127.0.0.1 9 typ host","sdpMid":"0","sdpMLineIndex":0}}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        let ClientMessage::OnIceCandidate {
            candidate,
            video_id,
        } = msg
        else {
            panic!("expected onIceCandidate");
        };
        assert_eq!(video_id, 2);
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_m_line_index, Some(0));

        let out = serde_json::to_value(ServerMessage::IceCandidate {
            candidate,
            video_id,
        })
        .unwrap();
        assert_eq!(out["id"], "iceCandidate");
        assert_eq!(out["candidate"]["sdpMLineIndex"], 0);
    }

    #[test]
    fn play_video_response_is_tagged_with_video_id() {
        let out = serde_json::to_value(ServerMessage::PlayVideoResponse {
            video_id: 3,
            sdp_answer: "A".into(),
        })
        .unwrap();
        assert_eq!(out["id"], "playVideoResponse");
        assert_eq!(out["videoId"], 3);
        assert_eq!(out["sdpAnswer"], "A");
    }

    #[test]
    fn unknown_kind_fails_to_parse() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"id":"teleport"}"#).is_err());
    }
}
