use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::protocol::StreamSummary;
use crate::websocket::SignalingState;

pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// HTTP view of the stream directory; runs a fresh discovery pass.
pub async fn list_streams(State(state): State<SignalingState>) -> impl IntoResponse {
    match state.directory.discover().await {
        Ok(snapshot) => {
            let streams: Vec<StreamSummary> =
                snapshot.streams.iter().map(StreamSummary::from).collect();
            (StatusCode::OK, Json(json!({ "streams": streams }))).into_response()
        }
        Err(err) => {
            warn!(error = %err, "stream discovery failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    /// Which stats record to pick out of the element's stats map.
    #[serde(rename = "type", default = "default_stats_type")]
    pub stats_type: String,
    /// Media type the stats are scoped to.
    #[serde(default = "default_media_type")]
    pub media: String,
}

fn default_stats_type() -> String {
    "endpoint".to_string()
}

fn default_media_type() -> String {
    "VIDEO".to_string()
}

/// Per-type statistics for one stream's source element.
pub async fn stream_stats(
    Path(id): Path<u32>,
    Query(query): Query<StatsQuery>,
    State(state): State<SignalingState>,
) -> impl IntoResponse {
    let stream = match state.directory.stream(id).await {
        Ok(stream) => stream,
        Err(err) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response();
        }
    };

    let stats = match state.media.element_stats(&stream.source, &query.media).await {
        Ok(stats) => stats,
        Err(err) => {
            warn!(stream = id, error = %err, "stats query failed");
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response();
        }
    };

    match find_stats_record(&stats, &query.stats_type) {
        Some(record) => (StatusCode::OK, Json(record.clone())).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": format!(
                    "could not find {}:{} stats in element {}",
                    query.stats_type, query.media, stream.source.id
                )
            })),
        )
            .into_response(),
    }
}

/// The upstream stats call returns a map of records; pick the first one of
/// the requested type.
fn find_stats_record<'a>(stats: &'a Value, stats_type: &str) -> Option<&'a Value> {
    stats.as_object().and_then(|map| {
        map.values()
            .find(|record| record.get("type").and_then(Value::as_str) == Some(stats_type))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_the_record_of_the_requested_type() {
        let stats = json!({
            "a": { "type": "inboundrtp", "jitter": 1 },
            "b": { "type": "endpoint", "videoE2ELatency": 42 },
        });
        let record = find_stats_record(&stats, "endpoint").unwrap();
        assert_eq!(record["videoE2ELatency"], 42);
        assert!(find_stats_record(&stats, "outboundrtp").is_none());
    }
}
