//! # Live Log Viewer
//!
//! Real-time fan-out of log entries, watch values and high-frequency stream
//! channels from producers to browser-style viewers, with a client pipeline
//! that batches bursts into a bounded buffer and auto-pauses noisy channels.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                              SERVER                                   │
//! │  ┌───────────┐  entries/watch/stream   ┌──────────────────────────┐  │
//! │  │ Producers │ ──────────────────────▶ │ LogStore (server::store) │  │
//! │  │ ws / REST │                         │ per-room bounded history │  │
//! │  └───────────┘                         └────────────┬─────────────┘  │
//! │                                                     │                │
//! │                                                     ▼                │
//! │  ┌────────────────────────────────────────────────────────────────┐  │
//! │  │          ViewerBroadcaster (server::broadcaster)               │  │
//! │  │  token gate · per-viewer session · pause gate · channel subs   │  │
//! │  └────────────────────────────────┬───────────────────────────────┘  │
//! └───────────────────────────────────┼──────────────────────────────────┘
//!                                     │ WebSocket (JSON, close 4001 = auth)
//!                                     ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         VIEWER (client::session)                      │
//! │  ┌─────────────────┐   ┌──────────────────┐   ┌───────────────────┐  │
//! │  │ TransportClient │──▶│ BatchScheduler   │──▶│ IngestionBuffer   │  │
//! │  │ reconnect/auth  │   │ min-interval     │   │ FIFO ring, index, │  │
//! │  │ backfill, dedup │   │ flush, watch LWW │   │ version counter   │  │
//! │  └────────▲────────┘   └──────────────────┘   └─────────┬─────────┘  │
//! │           │ pauseStream                                 │ totals     │
//! │  ┌────────┴────────────────┐                  ┌─────────▼─────────┐  │
//! │  │ SubscriptionRegistry    │◀─────────────────│ AutoPauseController│ │
//! │  │ persisted, replayed     │   mark paused    │ windowed rate     │  │
//! │  └─────────────────────────┘                  └───────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

#[cfg(feature = "client")]
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
#[cfg(feature = "server")]
pub mod server;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default HTTP/WebSocket port
    pub const DEFAULT_HTTP_PORT: u16 = 7070;

    /// Room used when none is given
    pub const DEFAULT_ROOM: &str = "default";

    /// Close code sent when a viewer token does not match
    pub const AUTH_REJECTED_CLOSE_CODE: u16 = 4001;

    /// Client-side log entry capacity
    pub const DEFAULT_MAX_BUFFER_ENTRIES: usize = 50_000;

    /// Client-side capacity of each stream channel
    pub const DEFAULT_STREAM_MAX_ENTRIES: usize = 10_000;

    /// Server-side history kept per room
    pub const DEFAULT_SERVER_HISTORY: usize = 100_000;

    /// Frames queued per viewer before writes are dropped
    pub const VIEWER_QUEUE_CAPACITY: usize = 1024;

    /// Fixed reconnect delay in milliseconds
    pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3000;

    /// Delay between replayed subscribe and pause commands
    pub const DEFAULT_PAUSE_SETTLE_MS: u64 = 100;

    /// Minimum interval between two flushes
    pub const DEFAULT_MIN_FLUSH_INTERVAL_MS: u64 = 50;

    /// Flush boundary grid (one display frame at 60 Hz)
    pub const DEFAULT_FRAME_INTERVAL_MS: u64 = 16;

    /// Auto-pause sampling period
    pub const DEFAULT_AUTO_PAUSE_TICK_MS: u64 = 500;

    /// Auto-pause sliding window length (4 x 500ms = 2s)
    pub const DEFAULT_AUTO_PAUSE_WINDOW: usize = 4;

    /// Number of entries requested by the backfill
    pub const DEFAULT_BACKFILL_LIMIT: usize = 5_000;

    /// Key under which stream subscriptions are persisted
    pub const SUBSCRIPTIONS_STORAGE_KEY: &str = "live-log-viewer.stream-subscriptions.v1";

    /// Schema version of the persisted subscription document
    pub const SUBSCRIPTIONS_STORAGE_VERSION: u32 = 1;
}
