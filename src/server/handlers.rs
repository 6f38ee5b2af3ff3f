//! HTTP API handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::constants::{DEFAULT_BACKFILL_LIMIT, DEFAULT_ROOM};
use crate::protocol::{
    ControlCommand, LogEntry, NewLogEntry, NewStreamEntry, ProducerMessage, StreamEntry, WatchValue,
};
use crate::server::server::AppState;

/// API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Query parameters of the read endpoints
#[derive(Debug, Default, Deserialize)]
pub struct FeedQuery {
    pub room: Option<String>,
    pub limit: Option<usize>,
    pub token: Option<String>,
}

impl FeedQuery {
    fn room(&self) -> &str {
        self.room.as_deref().unwrap_or(DEFAULT_ROOM)
    }

    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_BACKFILL_LIMIT)
    }
}

/// Token for the write endpoints
#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

fn check_token(state: &AppState, token: Option<&str>) -> Result<(), StatusCode> {
    state
        .broadcaster
        .authorize(token)
        .map_err(|_| StatusCode::UNAUTHORIZED)
}

/// System status
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub rooms: usize,
    pub viewers: usize,
    pub producers: usize,
    pub dropped_frames: u64,
    pub uptime_seconds: u64,
}

/// Get server status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<ServerStatus>> {
    let status = ServerStatus {
        rooms: state.store.rooms().len(),
        viewers: state.broadcaster.viewer_count(),
        producers: state.broadcaster.producer_count(),
        dropped_frames: state.broadcaster.dropped_frames(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    };
    Json(ApiResponse::ok(status))
}

/// Room names
pub async fn get_rooms(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.store.rooms())
}

/// Newest entries of a room, oldest first
pub async fn get_entries(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FeedQuery>,
) -> Result<Json<Vec<LogEntry>>, StatusCode> {
    check_token(&state, query.token.as_deref())?;
    Ok(Json(state.store.recent_entries(query.room(), query.limit())))
}

/// Stream channel names of a room
pub async fn get_streams(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FeedQuery>,
) -> Result<Json<Vec<String>>, StatusCode> {
    check_token(&state, query.token.as_deref())?;
    Ok(Json(state.store.stream_channels(query.room())))
}

/// Newest samples of one channel
pub async fn get_stream(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    Query(query): Query<FeedQuery>,
) -> Result<Json<Vec<StreamEntry>>, StatusCode> {
    check_token(&state, query.token.as_deref())?;
    Ok(Json(state.store.recent_stream(query.room(), &channel, query.limit())))
}

fn ingest(
    state: &AppState,
    token: Option<&str>,
    room: &str,
    message: ProducerMessage,
) -> (StatusCode, Json<ApiResponse<usize>>) {
    if check_token(state, token).is_err() {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ApiResponse::error("invalid token")),
        );
    }
    let stored = state.ingest(room, message);
    (StatusCode::OK, Json(ApiResponse::ok(stored)))
}

/// Append entries to a room
pub async fn post_entries(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
    Query(query): Query<TokenQuery>,
    Json(entries): Json<Vec<NewLogEntry>>,
) -> (StatusCode, Json<ApiResponse<usize>>) {
    ingest(&state, query.token.as_deref(), &room, ProducerMessage::Entries { entries })
}

/// Set a watch value
pub async fn post_watch(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
    Query(query): Query<TokenQuery>,
    Json(watch): Json<WatchValue>,
) -> (StatusCode, Json<ApiResponse<usize>>) {
    ingest(&state, query.token.as_deref(), &room, ProducerMessage::Watch { watch })
}

/// Append samples to a stream channel
pub async fn post_stream(
    State(state): State<Arc<AppState>>,
    Path((room, channel)): Path<(String, String)>,
    Query(query): Query<TokenQuery>,
    Json(entries): Json<Vec<NewStreamEntry>>,
) -> (StatusCode, Json<ApiResponse<usize>>) {
    ingest(
        &state,
        query.token.as_deref(),
        &room,
        ProducerMessage::Stream { channel, entries },
    )
}

/// Broadcast a clear command
pub async fn post_control(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
    Query(query): Query<TokenQuery>,
    Json(command): Json<ControlCommand>,
) -> (StatusCode, Json<ApiResponse<usize>>) {
    ingest(&state, query.token.as_deref(), &room, ProducerMessage::Control { command })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::server::WebServer;
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use axum::Router;
    use serde::de::DeserializeOwned;
    use tower::ServiceExt;

    fn router(token: Option<&str>) -> Router {
        WebServer::new(ServerConfig {
            token: token.map(str::to_string),
            ..Default::default()
        })
        .router()
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<&str>) -> (StatusCode, Vec<u8>) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    fn parse<T: DeserializeOwned>(bytes: &[u8]) -> T {
        serde_json::from_slice(bytes).unwrap()
    }

    #[tokio::test]
    async fn test_post_then_backfill() {
        let app = router(None);
        let (status, body) = send(
            &app,
            Method::POST,
            "/api/rooms/ops/entries",
            Some(r#"[{"message":"one","level":"warn"},{"message":"two"},{"message":"three"}]"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(parse::<ApiResponse<usize>>(&body).data, Some(3));

        let (status, body) = send(&app, Method::GET, "/api/entries?room=ops&limit=2", None).await;
        assert_eq!(status, StatusCode::OK);
        let entries: Vec<LogEntry> = parse(&body);
        assert_eq!(entries.iter().map(|e| e.id).collect::<Vec<_>>(), vec![2, 3]);

        let (_, body) = send(&app, Method::GET, "/api/rooms", None).await;
        assert_eq!(parse::<Vec<String>>(&body), vec!["ops".to_string()]);
    }

    #[tokio::test]
    async fn test_stream_endpoints() {
        let app = router(None);
        send(
            &app,
            Method::POST,
            "/api/rooms/default/streams/cpu%20load",
            Some(r#"[{"data":0.5},{"data":0.7}]"#),
        )
        .await;

        let (_, body) = send(&app, Method::GET, "/api/streams", None).await;
        assert_eq!(parse::<Vec<String>>(&body), vec!["cpu load".to_string()]);

        let (_, body) = send(&app, Method::GET, "/api/streams/cpu%20load?limit=1", None).await;
        let samples: Vec<StreamEntry> = parse(&body);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].data, serde_json::json!(0.7));
    }

    #[tokio::test]
    async fn test_token_required() {
        let app = router(Some("secret"));
        let (status, _) = send(&app, Method::GET, "/api/entries", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = send(&app, Method::POST, "/api/rooms/default/control", Some(r#""clearAll""#)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(!parse::<ApiResponse<usize>>(&body).success);

        let (status, _) = send(&app, Method::GET, "/api/entries?token=secret", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status() {
        let app = router(None);
        let (status, body) = send(&app, Method::GET, "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        let response: ApiResponse<ServerStatus> = parse(&body);
        assert!(response.success);
        assert_eq!(response.data.unwrap().viewers, 0);
    }
}
