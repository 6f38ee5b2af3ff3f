//! Viewer broadcaster
//!
//! Owns every viewer connection. Each viewer gets a session record and a
//! bounded outbound queue drained by its socket writer task; fan-out never
//! blocks on a slow viewer, a full queue just drops the frame.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::BroadcastError;
use crate::protocol::{ControlCommand, LogEntry, ServerMessage, StreamEntry, WatchValue};

/// Serialized frame shared by every recipient of one broadcast
pub type Frame = Arc<str>;

/// Server-side record of one viewer
#[derive(Debug)]
struct ViewerRecord {
    addr: SocketAddr,
    connected_at: DateTime<Utc>,
    authenticated: bool,
    paused: bool,
    room: String,
    /// Subscribed channels and their paused flag
    streams: BTreeMap<String, bool>,
    tx: mpsc::Sender<Frame>,
}

impl ViewerRecord {
    fn receives_feed(&self, room: &str) -> bool {
        self.authenticated && !self.paused && self.room == room
    }

    fn receives_stream(&self, room: &str, channel: &str) -> bool {
        self.receives_feed(room) && self.streams.get(channel) == Some(&false)
    }
}

/// Snapshot of a viewer for status output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerInfo {
    pub id: Uuid,
    pub addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub paused: bool,
    pub room: String,
    pub streams: BTreeMap<String, bool>,
}

pub struct ViewerBroadcaster {
    viewers: DashMap<Uuid, ViewerRecord>,
    token: Option<String>,
    queue_capacity: usize,
    producers: AtomicUsize,
    dropped_frames: AtomicU64,
}

impl ViewerBroadcaster {
    pub fn new(token: Option<String>, queue_capacity: usize) -> Self {
        Self {
            viewers: DashMap::new(),
            token: token.filter(|t| !t.is_empty()),
            queue_capacity: queue_capacity.max(1),
            producers: AtomicUsize::new(0),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Check a presented token against the configured one
    pub fn authorize(&self, token: Option<&str>) -> Result<(), BroadcastError> {
        match &self.token {
            Some(expected) if token != Some(expected.as_str()) => Err(BroadcastError::Unauthorized),
            _ => Ok(()),
        }
    }

    /// Register a viewer. Fails with `Unauthorized` when a token is
    /// configured and the presented one does not match; the caller closes
    /// the socket with code 4001.
    pub fn accept_connection(
        &self,
        addr: SocketAddr,
        token: Option<&str>,
        room: &str,
    ) -> Result<(Uuid, mpsc::Receiver<Frame>), BroadcastError> {
        if let Err(e) = self.authorize(token) {
            tracing::warn!("Rejected viewer {}: bad token", addr);
            return Err(e);
        }

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.viewers.insert(
            id,
            ViewerRecord {
                addr,
                connected_at: Utc::now(),
                authenticated: true,
                paused: false,
                room: room.to_string(),
                streams: BTreeMap::new(),
                tx,
            },
        );
        tracing::info!("Viewer {} connected from {} (room '{}')", id, addr, room);
        Ok((id, rx))
    }

    pub fn remove_viewer(&self, id: Uuid) -> bool {
        match self.viewers.remove(&id) {
            Some((_, record)) => {
                tracing::info!("Viewer {} ({}) disconnected", id, record.addr);
                true
            }
            None => false,
        }
    }

    fn encode(message: &ServerMessage) -> Option<Frame> {
        match message.to_json() {
            Ok(text) => Some(Arc::from(text)),
            Err(e) => {
                tracing::error!("Failed to encode broadcast: {}", e);
                None
            }
        }
    }

    /// Queue a frame without blocking; a full or closed queue drops it
    fn deliver(&self, id: &Uuid, record: &ViewerRecord, frame: &Frame) -> bool {
        match record.tx.try_send(Arc::clone(frame)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Viewer {} queue full, dropping frame", id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Viewer {} queue closed, dropping frame", id);
                false
            }
        }
    }

    fn fan_out(&self, message: &ServerMessage, wants: impl Fn(&ViewerRecord) -> bool) -> usize {
        let Some(frame) = Self::encode(message) else {
            return 0;
        };
        self.viewers
            .iter()
            .filter(|viewer| wants(viewer.value()))
            .filter(|viewer| self.deliver(viewer.key(), viewer.value(), &frame))
            .count()
    }

    /// Send to one viewer regardless of its pause state
    pub fn send_to(&self, id: Uuid, message: &ServerMessage) -> Result<bool, BroadcastError> {
        let record = self.viewers.get(&id).ok_or(BroadcastError::ViewerNotFound(id))?;
        Ok(Self::encode(message).is_some_and(|frame| self.deliver(&id, &record, &frame)))
    }

    /// Returns the number of viewers the batch was queued for
    pub fn broadcast_entries(&self, room: &str, entries: &[LogEntry]) -> usize {
        if entries.is_empty() {
            return 0;
        }
        let message = ServerMessage::Entries {
            entries: entries.to_vec(),
        };
        self.fan_out(&message, |viewer| viewer.receives_feed(room))
    }

    pub fn broadcast_watch(&self, room: &str, watch: &WatchValue) -> usize {
        let message = ServerMessage::Watch {
            watch: watch.clone(),
        };
        self.fan_out(&message, |viewer| viewer.receives_feed(room))
    }

    pub fn broadcast_control(&self, room: &str, command: ControlCommand) -> usize {
        self.fan_out(&ServerMessage::Control { command }, |viewer| {
            viewer.receives_feed(room)
        })
    }

    /// Only viewers subscribed to `channel` with it unpaused receive samples
    pub fn broadcast_stream(&self, room: &str, channel: &str, entries: &[StreamEntry]) -> usize {
        if entries.is_empty() {
            return 0;
        }
        let message = ServerMessage::Stream {
            channel: channel.to_string(),
            entries: entries.to_vec(),
        };
        self.fan_out(&message, |viewer| viewer.receives_stream(room, channel))
    }

    /// Every authenticated viewer, paused or not, in any room
    pub fn broadcast_all(&self, message: &ServerMessage) -> usize {
        self.fan_out(message, |viewer| viewer.authenticated)
    }

    pub fn set_viewer_paused(&self, id: Uuid, paused: bool) -> Result<(), BroadcastError> {
        let mut record = self
            .viewers
            .get_mut(&id)
            .ok_or(BroadcastError::ViewerNotFound(id))?;
        record.paused = paused;
        tracing::debug!("Viewer {} {}", id, if paused { "paused" } else { "resumed" });
        Ok(())
    }

    fn update_stream(
        &self,
        id: Uuid,
        ack: ServerMessage,
        update: impl FnOnce(&mut BTreeMap<String, bool>),
    ) -> Result<(), BroadcastError> {
        {
            let mut record = self
                .viewers
                .get_mut(&id)
                .ok_or(BroadcastError::ViewerNotFound(id))?;
            update(&mut record.streams);
        }
        self.send_to(id, &ack)?;
        Ok(())
    }

    pub fn subscribe_stream(&self, id: Uuid, channel: &str) -> Result<(), BroadcastError> {
        let ack = ServerMessage::StreamSubscribed {
            channel: channel.to_string(),
        };
        self.update_stream(id, ack, |streams| {
            streams.entry(channel.to_string()).or_insert(false);
        })
    }

    pub fn unsubscribe_stream(&self, id: Uuid, channel: &str) -> Result<(), BroadcastError> {
        let ack = ServerMessage::StreamUnsubscribed {
            channel: channel.to_string(),
        };
        self.update_stream(id, ack, |streams| {
            streams.remove(channel);
        })
    }

    /// Pausing a channel the viewer is not subscribed to is acknowledged but
    /// has no effect
    pub fn pause_stream(&self, id: Uuid, channel: &str) -> Result<(), BroadcastError> {
        let ack = ServerMessage::StreamPaused {
            channel: channel.to_string(),
        };
        self.update_stream(id, ack, |streams| {
            if let Some(paused) = streams.get_mut(channel) {
                *paused = true;
            }
        })
    }

    pub fn resume_stream(&self, id: Uuid, channel: &str) -> Result<(), BroadcastError> {
        let ack = ServerMessage::StreamResumed {
            channel: channel.to_string(),
        };
        self.update_stream(id, ack, |streams| {
            if let Some(paused) = streams.get_mut(channel) {
                *paused = false;
            }
        })
    }

    /// Move a viewer to another room. Stream subscriptions carry over.
    ///
    /// The `roomSwitched` ack is queued while the record is locked, so the
    /// viewer sees it after the last old-room frame and before the first
    /// new-room one.
    pub fn switch_room(&self, id: Uuid, room: &str) -> Result<(), BroadcastError> {
        let ack = Self::encode(&ServerMessage::RoomSwitched {
            room: room.to_string(),
        });
        let mut record = self
            .viewers
            .get_mut(&id)
            .ok_or(BroadcastError::ViewerNotFound(id))?;
        record.room = room.to_string();
        if let Some(frame) = ack {
            self.deliver(&id, &record, &frame);
        }
        tracing::info!("Viewer {} switched to room '{}'", id, room);
        Ok(())
    }

    pub fn producer_connected(&self) -> usize {
        self.producers.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn producer_disconnected(&self) -> usize {
        let previous = self
            .producers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn producer_count(&self) -> usize {
        self.producers.load(Ordering::SeqCst)
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    pub fn room_viewer_count(&self, room: &str) -> usize {
        self.viewers.iter().filter(|v| v.room == room).count()
    }

    /// Frames dropped because a viewer queue was full or closed
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn viewer(&self, id: Uuid) -> Option<ViewerInfo> {
        self.viewers.get(&id).map(|record| ViewerInfo {
            id,
            addr: record.addr,
            connected_at: record.connected_at,
            paused: record.paused,
            room: record.room.clone(),
            streams: record.streams.clone(),
        })
    }

    pub fn viewers(&self) -> Vec<ViewerInfo> {
        let ids: Vec<Uuid> = self.viewers.iter().map(|v| *v.key()).collect();
        ids.into_iter().filter_map(|id| self.viewer(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::NewLogEntry;

    fn addr() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn entries(ids: &[u64]) -> Vec<LogEntry> {
        ids.iter()
            .map(|id| NewLogEntry::default().into_entry(*id))
            .collect()
    }

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(ServerMessage::parse(&frame).unwrap());
        }
        out
    }

    #[test]
    fn test_token_mismatch_rejected() {
        let broadcaster = ViewerBroadcaster::new(Some("secret".into()), 8);
        assert_eq!(
            broadcaster.accept_connection(addr(), Some("wrong"), "default").unwrap_err(),
            BroadcastError::Unauthorized
        );
        assert_eq!(
            broadcaster.accept_connection(addr(), None, "default").unwrap_err(),
            BroadcastError::Unauthorized
        );
        assert!(broadcaster.accept_connection(addr(), Some("secret"), "default").is_ok());
        assert_eq!(broadcaster.viewer_count(), 1);
    }

    #[test]
    fn test_no_token_accepts_everyone() {
        let broadcaster = ViewerBroadcaster::new(Some(String::new()), 8);
        assert!(broadcaster.accept_connection(addr(), None, "default").is_ok());
    }

    #[test]
    fn test_paused_viewer_skipped() {
        let broadcaster = ViewerBroadcaster::new(None, 8);
        let (a, mut rx_a) = broadcaster.accept_connection(addr(), None, "default").unwrap();
        let (_b, mut rx_b) = broadcaster.accept_connection(addr(), None, "default").unwrap();

        broadcaster.set_viewer_paused(a, true).unwrap();
        assert_eq!(broadcaster.broadcast_entries("default", &entries(&[1])), 1);
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b).len(), 1);

        broadcaster.set_viewer_paused(a, false).unwrap();
        broadcaster.broadcast_control("default", ControlCommand::ClearLog);
        assert_eq!(
            drain(&mut rx_a),
            vec![ServerMessage::Control { command: ControlCommand::ClearLog }]
        );
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let broadcaster = ViewerBroadcaster::new(None, 8);
        let (_id, mut rx) = broadcaster.accept_connection(addr(), None, "default").unwrap();
        assert_eq!(broadcaster.broadcast_entries("default", &[]), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_room_scoping() {
        let broadcaster = ViewerBroadcaster::new(None, 8);
        let (id, mut rx) = broadcaster.accept_connection(addr(), None, "a").unwrap();
        assert_eq!(broadcaster.broadcast_entries("b", &entries(&[1])), 0);

        broadcaster.switch_room(id, "b").unwrap();
        assert_eq!(broadcaster.broadcast_entries("b", &entries(&[1])), 1);
        let frames = drain(&mut rx);
        assert_eq!(frames[0], ServerMessage::RoomSwitched { room: "b".into() });
        assert!(matches!(frames[1], ServerMessage::Entries { .. }));
    }

    #[test]
    fn test_stream_gating_and_acks() {
        let broadcaster = ViewerBroadcaster::new(None, 8);
        let (id, mut rx) = broadcaster.accept_connection(addr(), None, "default").unwrap();
        let sample = vec![StreamEntry {
            channel: "cpu".into(),
            timestamp: Utc::now(),
            data: serde_json::json!(1),
        }];

        assert_eq!(broadcaster.broadcast_stream("default", "cpu", &sample), 0);

        broadcaster.subscribe_stream(id, "cpu").unwrap();
        assert_eq!(broadcaster.broadcast_stream("default", "cpu", &sample), 1);
        broadcaster.pause_stream(id, "cpu").unwrap();
        assert_eq!(broadcaster.broadcast_stream("default", "cpu", &sample), 0);
        broadcaster.resume_stream(id, "cpu").unwrap();
        broadcaster.unsubscribe_stream(id, "cpu").unwrap();
        assert_eq!(broadcaster.broadcast_stream("default", "cpu", &sample), 0);

        let kinds: Vec<_> = drain(&mut rx)
            .into_iter()
            .map(|m| serde_json::to_value(&m).unwrap()["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            kinds,
            vec!["streamSubscribed", "stream", "streamPaused", "streamResumed", "streamUnsubscribed"]
        );
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let broadcaster = ViewerBroadcaster::new(None, 2);
        let (_id, mut rx) = broadcaster.accept_connection(addr(), None, "default").unwrap();

        for id in 1..=5 {
            broadcaster.broadcast_entries("default", &entries(&[id]));
        }
        assert_eq!(drain(&mut rx).len(), 2);
        assert_eq!(broadcaster.dropped_frames(), 3);
    }

    #[test]
    fn test_closed_queue_drops() {
        let broadcaster = ViewerBroadcaster::new(None, 2);
        let (id, rx) = broadcaster.accept_connection(addr(), None, "default").unwrap();
        drop(rx);
        assert_eq!(broadcaster.broadcast_entries("default", &entries(&[1])), 0);
        assert!(broadcaster.remove_viewer(id));
        assert!(!broadcaster.remove_viewer(id));
        assert_eq!(
            broadcaster.set_viewer_paused(id, true),
            Err(BroadcastError::ViewerNotFound(id))
        );
    }

    #[test]
    fn test_producer_count() {
        let broadcaster = ViewerBroadcaster::new(None, 2);
        assert_eq!(broadcaster.producer_connected(), 1);
        assert_eq!(broadcaster.producer_connected(), 2);
        assert_eq!(broadcaster.producer_disconnected(), 1);
        assert_eq!(broadcaster.producer_disconnected(), 0);
        assert_eq!(broadcaster.producer_disconnected(), 0);
    }
}
