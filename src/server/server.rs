//! HTTP and WebSocket server

use axum::{
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::protocol::{ProducerMessage, ServerMessage};
use crate::server::broadcaster::ViewerBroadcaster;
use crate::server::handlers;
use crate::server::store::LogStore;
use crate::server::websocket;

/// Shared application state
pub struct AppState {
    pub config: ServerConfig,
    pub store: LogStore,
    pub broadcaster: ViewerBroadcaster,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        let store = LogStore::new(config.history_per_room, config.stream_history);
        let broadcaster =
            ViewerBroadcaster::new(config.token.clone(), config.viewer_queue_capacity);
        Self {
            config,
            store,
            broadcaster,
            started_at: Instant::now(),
        }
    }

    fn announce_room(&self, room: &str, created: bool) {
        if created {
            self.broadcaster.broadcast_all(&ServerMessage::RoomCreated {
                room: room.to_string(),
            });
        }
    }

    /// Make sure `room` exists, announcing it to all viewers when new
    pub fn open_room(&self, room: &str) {
        let created = self.store.ensure_room(room);
        self.announce_room(room, created);
    }

    /// Store a producer message and fan it out. Returns the number of
    /// items stored.
    pub fn ingest(&self, room: &str, message: ProducerMessage) -> usize {
        match message {
            ProducerMessage::Entries { entries } => {
                let appended = self.store.append_and_publish(room, entries, |stamped| {
                    self.broadcaster.broadcast_entries(room, stamped);
                });
                self.announce_room(room, appended.room_created);
                appended.items.len()
            }
            ProducerMessage::Watch { watch } => {
                let created = self.store.set_watch(room, watch.clone());
                self.announce_room(room, created);
                self.broadcaster.broadcast_watch(room, &watch);
                1
            }
            ProducerMessage::Stream { channel, entries } => {
                let appended = self.store.append_stream(room, &channel, entries);
                self.announce_room(room, appended.room_created);
                self.broadcaster
                    .broadcast_stream(room, &channel, &appended.items);
                appended.items.len()
            }
            ProducerMessage::Control { command } => {
                self.store.apply_control(room, command);
                self.broadcaster.broadcast_control(room, command);
                1
            }
        }
    }

    /// The `init` snapshot for `room`
    pub fn snapshot(&self, room: &str) -> ServerMessage {
        self.store.snapshot(
            room,
            self.broadcaster.room_viewer_count(room),
            self.broadcaster.producer_count(),
        )
    }
}

/// Web server
pub struct WebServer {
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            state: Arc::new(AppState::new(config)),
        }
    }

    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Build the router
    pub fn router(&self) -> Router {
        let config = &self.state.config;

        let mut app = Router::new()
            .route("/ws", get(websocket::viewer_ws))
            .route("/ws/producer", get(websocket::producer_ws))
            .route("/api/status", get(handlers::get_status))
            .route("/api/rooms", get(handlers::get_rooms))
            .route("/api/entries", get(handlers::get_entries))
            .route("/api/streams", get(handlers::get_streams))
            .route("/api/streams/:channel", get(handlers::get_stream))
            .route("/api/rooms/:room/entries", post(handlers::post_entries))
            .route("/api/rooms/:room/watches", post(handlers::post_watch))
            .route("/api/rooms/:room/streams/:channel", post(handlers::post_stream))
            .route("/api/rooms/:room/control", post(handlers::post_control))
            .with_state(self.state());

        if let Some(dir) = &config.static_dir {
            app = app.fallback_service(ServeDir::new(dir));
        }
        if config.cors {
            app = app.layer(CorsLayer::permissive());
        }
        app
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        let app = self.router();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let addr = format!("{}:{}", self.state.config.bind_address, self.state.config.http_port);
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!("Log server listening on http://{}", listener.local_addr()?);
        self.state.store.ensure_room(crate::constants::DEFAULT_ROOM);
        self.serve(listener, shutdown).await?;
        Ok(())
    }

    /// Start server in background
    pub fn start_background(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run(std::future::pending()).await {
                tracing::error!("Web server error: {}", e);
            }
        })
    }
}
