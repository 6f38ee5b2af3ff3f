//! Viewer-side connection state machine
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──open──▶ Connected
//!      ▲                          │                   │
//!      │                          │ fail              │ close (code != 4001)
//!      └──── countdown (fixed delay, one attempt) ◀───┘
//!
//! close with 4001 ──▶ AuthRejected (no automatic reconnect)
//! ```
//!
//! The I/O lives in [`crate::client::connector`]; this type only tracks
//! state and decides what to send, so every transition can be driven with
//! synthetic instants.

use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use url::Url;

use crate::client::backpressure::CommandSink;
use crate::client::subscriptions::SubscriptionRegistry;
use crate::config::ClientConfig;
use crate::constants::AUTH_REJECTED_CLOSE_CODE;
use crate::error::TransportError;
use crate::protocol::{ClientMessage, EntryId, LogEntry, StreamEntry};

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Server refused the token; only an explicit `connect()` leaves this state
    AuthRejected,
}

/// A connection attempt the driver should perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub connection: u64,
    pub url: Url,
}

/// Snapshot of the transport for status displays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportStatus {
    pub state: ConnectionState,
    pub connected: bool,
    pub error: Option<String>,
    pub auth_required: bool,
    pub reconnect_countdown: Option<u64>,
    pub latency_ms: Option<i64>,
    pub room: String,
}

/// Result of the REST history fetch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackfillData {
    pub entries: Vec<LogEntry>,
    pub streams: Vec<(String, Vec<StreamEntry>)>,
}

struct BackfillTicket {
    room: String,
    abort: Option<AbortHandle>,
}

pub struct TransportClient {
    server_url: String,
    token: Option<String>,
    room: String,
    reconnect_delay: Duration,
    pause_settle: Duration,

    state: ConnectionState,
    error: Option<String>,
    auth_required: bool,
    outbound: Option<mpsc::UnboundedSender<ClientMessage>>,
    connection: u64,

    watermark: Option<EntryId>,
    /// Room requested with `switchRoom` whose ack has not arrived yet
    switching_to: Option<String>,
    reconnect_at: Option<Instant>,
    countdown: Option<u64>,
    pending_pauses: Vec<(Instant, String)>,

    backfill: Option<BackfillTicket>,
    backfill_wanted: bool,
    held_entries: Vec<LogEntry>,
    latency_ms: Option<i64>,
}

impl TransportClient {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            server_url: config.server_url.clone(),
            token: config.token.clone(),
            room: config.room.clone(),
            reconnect_delay: config.reconnect_delay(),
            pause_settle: config.pause_settle(),
            state: ConnectionState::Disconnected,
            error: None,
            auth_required: false,
            outbound: None,
            connection: 0,
            watermark: None,
            switching_to: None,
            reconnect_at: None,
            countdown: None,
            pending_pauses: Vec::new(),
            backfill: None,
            backfill_wanted: false,
            held_entries: Vec::new(),
            latency_ms: None,
        }
    }

    /// Start a connection attempt.
    ///
    /// Returns `None` when already connecting or connected.
    pub fn connect(&mut self) -> Result<Option<ConnectRequest>, TransportError> {
        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected) {
            return Ok(None);
        }

        let url = self.connection_url()?;
        self.connection += 1;
        self.state = ConnectionState::Connecting;
        self.reconnect_at = None;
        self.countdown = None;

        tracing::info!("Connecting to {} (room '{}')", self.server_url, self.room);
        Ok(Some(ConnectRequest {
            connection: self.connection,
            url,
        }))
    }

    /// WebSocket URL with the token and room as query parameters
    pub fn connection_url(&self) -> Result<Url, TransportError> {
        let mut url = Url::parse(&self.server_url)
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", self.server_url, e)))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(token) = &self.token {
                query.append_pair("token", token);
            }
            query.append_pair("room", &self.room);
        }
        Ok(url)
    }

    /// The socket is open: go live and replay subscriptions.
    ///
    /// Subscribes go out immediately; pauses follow after the settle delay
    /// because a pause for a channel the server has not subscribed yet is
    /// ignored there.
    pub fn on_open(
        &mut self,
        connection: u64,
        outbound: mpsc::UnboundedSender<ClientMessage>,
        registry: &SubscriptionRegistry,
        now: Instant,
    ) {
        if connection != self.connection {
            return;
        }

        self.state = ConnectionState::Connected;
        self.outbound = Some(outbound);
        self.switching_to = None;
        self.error = None;
        self.auth_required = false;
        tracing::info!("Connected to {}", self.server_url);

        let plan = registry.replay_plan();
        for channel in plan.subscribe {
            self.send(ClientMessage::SubscribeStream { channel });
        }
        let due = now + self.pause_settle;
        self.pending_pauses = plan.pause.into_iter().map(|channel| (due, channel)).collect();

        self.start_backfill();
    }

    /// The socket closed or could not be opened
    pub fn on_close(&mut self, connection: u64, code: Option<u16>, reason: &str, now: Instant) {
        if connection != self.connection {
            return;
        }

        self.outbound = None;
        self.switching_to = None;
        self.pending_pauses.clear();
        self.abort_backfill();
        self.held_entries.clear();
        self.latency_ms = None;

        if code == Some(AUTH_REJECTED_CLOSE_CODE) {
            tracing::warn!("Server rejected the viewer token");
            self.state = ConnectionState::AuthRejected;
            self.auth_required = true;
            self.error = Some(TransportError::AuthRejected.to_string());
            self.reconnect_at = None;
            self.countdown = None;
            return;
        }

        let reason = if reason.is_empty() { "Connection closed" } else { reason };
        tracing::info!(
            "Disconnected ({}), reconnecting in {:?}",
            reason,
            self.reconnect_delay
        );
        self.state = ConnectionState::Disconnected;
        self.error = Some(reason.to_string());
        self.reconnect_at = Some(now + self.reconnect_delay);
        self.countdown = Some(ceil_secs(self.reconnect_delay));
    }

    /// Advance timers. Returns true exactly once when the scheduled
    /// reconnect becomes due; the caller then invokes [`Self::connect`].
    pub fn poll(&mut self, now: Instant) -> bool {
        if !self.pending_pauses.is_empty() {
            let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_pauses)
                .into_iter()
                .partition(|(at, _)| *at <= now);
            self.pending_pauses = later;
            for (_, channel) in due {
                self.send(ClientMessage::PauseStream { channel });
            }
        }

        match self.reconnect_at {
            Some(at) if now >= at => {
                self.reconnect_at = None;
                self.countdown = Some(0);
                true
            }
            Some(at) => {
                self.countdown = Some(ceil_secs(at - now));
                false
            }
            None => false,
        }
    }

    /// Send while the connection is open; silently dropped otherwise
    pub fn send(&self, message: ClientMessage) -> bool {
        if self.state != ConnectionState::Connected {
            tracing::debug!("Dropping {:?} while disconnected", message);
            return false;
        }
        match &self.outbound {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Stop without scheduling a reconnect
    pub fn disconnect(&mut self) {
        self.connection += 1;
        self.outbound = None;
        self.switching_to = None;
        self.state = ConnectionState::Disconnected;
        self.reconnect_at = None;
        self.countdown = None;
        self.pending_pauses.clear();
        self.abort_backfill();
    }

    /// Filter live entries through the id watermark.
    ///
    /// Entries arriving between a room switch and its ack belong to the old
    /// room and are dropped. While a backfill is in flight entries are held
    /// back and released, after the history, by [`Self::complete_backfill`].
    pub fn accept_entries(&mut self, entries: Vec<LogEntry>) -> Vec<LogEntry> {
        if let Some(room) = &self.switching_to {
            tracing::debug!(
                "Dropping {} entries received before switch to '{}' was acked",
                entries.len(),
                room
            );
            return Vec::new();
        }
        if self.backfill.is_some() {
            self.held_entries.extend(entries);
            return Vec::new();
        }
        self.filter_new(entries)
    }

    fn filter_new(&mut self, entries: Vec<LogEntry>) -> Vec<LogEntry> {
        let mut fresh = Vec::with_capacity(entries.len());
        for entry in entries {
            if self.watermark.map_or(true, |highest| entry.id > highest) {
                self.watermark = Some(entry.id);
                fresh.push(entry);
            }
        }
        fresh
    }

    /// False between a room switch and the server's `roomSwitched` ack;
    /// room-scoped frames received then come from the previous room.
    pub fn room_feed_current(&self) -> bool {
        self.switching_to.is_none()
    }

    /// The server confirmed a room switch. Returns true when it matches the
    /// pending request.
    pub fn on_room_switched(&mut self, room: &str) -> bool {
        if self.switching_to.as_deref() != Some(room) {
            return false;
        }
        self.switching_to = None;
        true
    }

    /// Highest entry id forwarded so far
    pub fn watermark(&self) -> Option<EntryId> {
        self.watermark
    }

    fn start_backfill(&mut self) {
        self.abort_backfill();
        self.backfill = Some(BackfillTicket {
            room: self.room.clone(),
            abort: None,
        });
        self.backfill_wanted = true;
    }

    /// Room of a backfill the driver still has to launch
    pub fn take_backfill_request(&mut self) -> Option<String> {
        if !std::mem::take(&mut self.backfill_wanted) {
            return None;
        }
        self.backfill.as_ref().map(|ticket| ticket.room.clone())
    }

    /// Register the task performing the fetch so it can be aborted
    pub fn attach_backfill_task(&mut self, abort: AbortHandle) {
        match &mut self.backfill {
            Some(ticket) => ticket.abort = Some(abort),
            None => abort.abort(),
        }
    }

    pub fn backfill_in_flight(&self) -> bool {
        self.backfill.is_some()
    }

    fn abort_backfill(&mut self) {
        if let Some(ticket) = self.backfill.take() {
            if let Some(abort) = ticket.abort {
                abort.abort();
            }
        }
        self.backfill_wanted = false;
    }

    /// Apply a finished fetch. Results for a room that is no longer current
    /// (or for a fetch that was cancelled) are discarded.
    pub fn complete_backfill(
        &mut self,
        room: &str,
        result: Result<BackfillData, TransportError>,
    ) -> Option<BackfillData> {
        let current = matches!(&self.backfill, Some(ticket) if ticket.room == room && self.room == room);
        if !current {
            tracing::debug!("Discarding stale backfill for room '{}'", room);
            return None;
        }
        self.backfill = None;

        let mut history = match result {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("Backfill for room '{}' failed: {}", room, e);
                BackfillData::default()
            }
        };

        history.entries.sort_by_key(|entry| entry.id);
        let held = std::mem::take(&mut self.held_entries);
        let mut entries = self.filter_new(history.entries);
        entries.extend(self.filter_new(held));

        Some(BackfillData {
            entries,
            streams: history.streams,
        })
    }

    /// Change the active room; returns false when it is already current.
    ///
    /// Any in-flight backfill is cancelled and the id watermark restarts,
    /// since ids are only ordered within one room's feed.
    pub fn set_room(&mut self, room: &str) -> bool {
        if self.room == room {
            return false;
        }
        self.abort_backfill();
        self.room = room.to_string();
        self.watermark = None;
        self.held_entries.clear();
        self.switching_to = None;

        if self.state == ConnectionState::Connected {
            self.send(ClientMessage::SwitchRoom {
                room: room.to_string(),
            });
            self.switching_to = Some(room.to_string());
            self.start_backfill();
        }
        true
    }

    /// Replace the token; leaves `AuthRejected` so a manual connect can retry
    pub fn set_token(&mut self, token: Option<String>) {
        self.token = token;
        if self.state == ConnectionState::AuthRejected {
            self.state = ConnectionState::Disconnected;
            self.auth_required = false;
        }
    }

    pub fn ping(&self, now_ms: i64) -> bool {
        self.send(ClientMessage::Ping { timestamp: now_ms })
    }

    pub fn on_pong(&mut self, sent_ms: i64, now_ms: i64) -> i64 {
        let latency = (now_ms - sent_ms).max(0);
        self.latency_ms = Some(latency);
        latency
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn auth_required(&self) -> bool {
        self.auth_required
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn reconnect_countdown(&self) -> Option<u64> {
        self.countdown
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn status(&self) -> TransportStatus {
        TransportStatus {
            state: self.state,
            connected: self.is_connected(),
            error: self.error.clone(),
            auth_required: self.auth_required,
            reconnect_countdown: self.countdown,
            latency_ms: self.latency_ms,
            room: self.room.clone(),
        }
    }
}

impl CommandSink for TransportClient {
    fn send_command(&mut self, message: ClientMessage) -> bool {
        self.send(message)
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}
