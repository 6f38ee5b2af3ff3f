//! Per-room history of entries, watches and stream channels
//!
//! The store is the source of `init` snapshots and of the REST backfill. It
//! assigns entry ids, strictly increasing within each room.

use parking_lot::RwLock;
use std::collections::{BTreeMap, VecDeque};

use crate::protocol::{
    ControlCommand, EntryId, FeedStats, LogEntry, NewLogEntry, NewStreamEntry, ServerMessage,
    SessionSummary, StreamEntry, WatchValue,
};

/// Result of an append
#[derive(Debug, Default)]
pub struct Appended<T> {
    pub items: Vec<T>,
    /// The append created the room
    pub room_created: bool,
}

#[derive(Default)]
struct RoomLog {
    entries: VecDeque<LogEntry>,
    next_id: EntryId,
    total_entries: u64,
    watches: BTreeMap<String, WatchValue>,
    streams: BTreeMap<String, VecDeque<StreamEntry>>,
    sessions: BTreeMap<String, SessionSummary>,
}

impl RoomLog {
    fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, items: impl IntoIterator<Item = T>, capacity: usize) {
    queue.extend(items);
    let overflow = queue.len().saturating_sub(capacity);
    queue.drain(..overflow);
}

fn newest<T: Clone>(queue: &VecDeque<T>, limit: usize) -> Vec<T> {
    let skip = queue.len().saturating_sub(limit);
    queue.iter().skip(skip).cloned().collect()
}

fn feed_stats(log: Option<&RoomLog>, viewers: usize) -> FeedStats {
    match log {
        Some(log) => FeedStats {
            total_entries: log.total_entries,
            buffered_entries: log.entries.len(),
            stream_channels: log.streams.len(),
            viewers,
        },
        None => FeedStats {
            viewers,
            ..Default::default()
        },
    }
}

pub struct LogStore {
    rooms: RwLock<BTreeMap<String, RoomLog>>,
    history: usize,
    stream_history: usize,
}

impl LogStore {
    pub fn new(history: usize, stream_history: usize) -> Self {
        Self {
            rooms: RwLock::new(BTreeMap::new()),
            history: history.max(1),
            stream_history: stream_history.max(1),
        }
    }

    /// Create the room if needed; returns true when it was created
    pub fn ensure_room(&self, room: &str) -> bool {
        let mut rooms = self.rooms.write();
        if rooms.contains_key(room) {
            return false;
        }
        rooms.insert(room.to_string(), RoomLog::new());
        tracing::info!("Created room '{}'", room);
        true
    }

    fn with_room<R>(&self, room: &str, f: impl FnOnce(&mut RoomLog) -> R) -> (R, bool) {
        let mut rooms = self.rooms.write();
        let created = !rooms.contains_key(room);
        if created {
            tracing::info!("Created room '{}'", room);
        }
        let log = rooms.entry(room.to_string()).or_insert_with(RoomLog::new);
        (f(log), created)
    }

    /// Assign ids and append, evicting the oldest history beyond capacity
    pub fn append_entries(&self, room: &str, entries: Vec<NewLogEntry>) -> Appended<LogEntry> {
        self.append_and_publish(room, entries, |_| {})
    }

    /// Like [`Self::append_entries`], running `publish` on the stamped batch
    /// before the room lock is released. Batches therefore reach `publish`
    /// in id order even with several producers on one room. `publish` must
    /// not call back into the store.
    pub fn append_and_publish(
        &self,
        room: &str,
        entries: Vec<NewLogEntry>,
        publish: impl FnOnce(&[LogEntry]),
    ) -> Appended<LogEntry> {
        let history = self.history;
        let (items, room_created) = self.with_room(room, |log| {
            let stamped: Vec<LogEntry> = entries
                .into_iter()
                .map(|entry| {
                    let id = log.next_id;
                    log.next_id += 1;
                    entry.into_entry(id)
                })
                .collect();

            for entry in &stamped {
                if entry.session_id.is_empty() {
                    continue;
                }
                let summary = log
                    .sessions
                    .entry(entry.session_id.clone())
                    .or_insert_with(|| SessionSummary {
                        session_id: entry.session_id.clone(),
                        app_name: entry.app_name.clone(),
                        host_name: entry.host_name.clone(),
                        entry_count: 0,
                    });
                summary.entry_count += 1;
            }

            log.total_entries += stamped.len() as u64;
            push_bounded(&mut log.entries, stamped.iter().cloned(), history);
            publish(&stamped);
            stamped
        });
        Appended { items, room_created }
    }

    pub fn set_watch(&self, room: &str, watch: WatchValue) -> bool {
        let ((), created) = self.with_room(room, |log| {
            log.watches.insert(watch.name.clone(), watch);
        });
        created
    }

    pub fn append_stream(
        &self,
        room: &str,
        channel: &str,
        entries: Vec<NewStreamEntry>,
    ) -> Appended<StreamEntry> {
        let capacity = self.stream_history;
        let (items, room_created) = self.with_room(room, |log| {
            let stamped: Vec<StreamEntry> =
                entries.into_iter().map(|e| e.into_entry(channel)).collect();
            let queue = log.streams.entry(channel.to_string()).or_default();
            push_bounded(queue, stamped.iter().cloned(), capacity);
            stamped
        });
        Appended { items, room_created }
    }

    /// Apply a clear command to the stored history. Ids keep increasing.
    pub fn apply_control(&self, room: &str, command: ControlCommand) {
        let mut rooms = self.rooms.write();
        let Some(log) = rooms.get_mut(room) else {
            return;
        };
        match command {
            ControlCommand::ClearLog => log.entries.clear(),
            ControlCommand::ClearWatches => log.watches.clear(),
            ControlCommand::ClearAll => {
                log.entries.clear();
                log.watches.clear();
                log.streams.clear();
            }
        }
    }

    /// Newest `limit` entries, oldest first
    pub fn recent_entries(&self, room: &str, limit: usize) -> Vec<LogEntry> {
        self.rooms
            .read()
            .get(room)
            .map(|log| newest(&log.entries, limit))
            .unwrap_or_default()
    }

    pub fn stream_channels(&self, room: &str) -> Vec<String> {
        self.rooms
            .read()
            .get(room)
            .map(|log| log.streams.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn recent_stream(&self, room: &str, channel: &str, limit: usize) -> Vec<StreamEntry> {
        self.rooms
            .read()
            .get(room)
            .and_then(|log| log.streams.get(channel))
            .map(|queue| newest(queue, limit))
            .unwrap_or_default()
    }

    pub fn watches(&self, room: &str) -> Vec<WatchValue> {
        self.rooms
            .read()
            .get(room)
            .map(|log| log.watches.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn rooms(&self) -> Vec<String> {
        self.rooms.read().keys().cloned().collect()
    }

    pub fn stats(&self, room: &str, viewers: usize) -> FeedStats {
        feed_stats(self.rooms.read().get(room), viewers)
    }

    /// The `init` message for a viewer joining `room`
    pub fn snapshot(&self, room: &str, viewers: usize, producers: usize) -> ServerMessage {
        let rooms = self.rooms.read();
        let log = rooms.get(room);
        ServerMessage::Init {
            room: room.to_string(),
            stats: feed_stats(log, viewers),
            watches: log
                .map(|log| log.watches.values().cloned().collect())
                .unwrap_or_default(),
            sessions: log
                .map(|log| log.sessions.values().cloned().collect())
                .unwrap_or_default(),
            producers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn messages(texts: &[&str]) -> Vec<NewLogEntry> {
        texts
            .iter()
            .map(|text| NewLogEntry {
                message: text.to_string(),
                session_id: "s1".into(),
                app_name: "api".into(),
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn test_ids_increase_per_room() {
        let store = LogStore::new(100, 10);
        let first = store.append_entries("a", messages(&["x", "y"]));
        assert!(first.room_created);
        assert_eq!(first.items.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 2]);

        let second = store.append_entries("a", messages(&["z"]));
        assert!(!second.room_created);
        assert_eq!(second.items[0].id, 3);

        let other = store.append_entries("b", messages(&["w"]));
        assert_eq!(other.items[0].id, 1);
        assert_eq!(store.rooms(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_publish_sees_stamped_batch() {
        let store = LogStore::new(100, 10);
        store.append_entries("a", messages(&["x"]));

        let mut published = Vec::new();
        let appended = store.append_and_publish("a", messages(&["y", "z"]), |batch| {
            published.extend(batch.iter().map(|e| e.id));
        });
        assert_eq!(published, vec![2, 3]);
        assert_eq!(appended.items.len(), 2);
        assert_eq!(store.recent_entries("a", 10).len(), 3);
    }

    #[test]
    fn test_history_is_bounded() {
        let store = LogStore::new(3, 10);
        store.append_entries("a", messages(&["1", "2", "3", "4", "5"]));

        let recent = store.recent_entries("a", 10);
        assert_eq!(recent.iter().map(|e| e.id).collect::<Vec<_>>(), vec![3, 4, 5]);
        assert_eq!(store.recent_entries("a", 2).len(), 2);
        assert_eq!(store.stats("a", 0).total_entries, 5);
    }

    #[test]
    fn test_clear_keeps_id_sequence() {
        let store = LogStore::new(10, 10);
        store.append_entries("a", messages(&["1", "2"]));
        store.apply_control("a", ControlCommand::ClearLog);
        assert!(store.recent_entries("a", 10).is_empty());

        let next = store.append_entries("a", messages(&["3"]));
        assert_eq!(next.items[0].id, 3);
    }

    #[test]
    fn test_streams_and_watches() {
        let store = LogStore::new(10, 2);
        let samples = (0..3)
            .map(|n| NewStreamEntry {
                timestamp: None,
                data: json!(n),
            })
            .collect();
        store.append_stream("a", "cpu", samples);
        store.set_watch(
            "a",
            WatchValue {
                name: "fps".into(),
                value: json!(60),
                timestamp: Utc::now(),
            },
        );

        assert_eq!(store.stream_channels("a"), vec!["cpu".to_string()]);
        let cpu = store.recent_stream("a", "cpu", 10);
        assert_eq!(cpu.iter().map(|s| s.data.clone()).collect::<Vec<_>>(), vec![json!(1), json!(2)]);
        assert_eq!(store.watches("a").len(), 1);

        store.apply_control("a", ControlCommand::ClearAll);
        assert!(store.stream_channels("a").is_empty());
        assert!(store.watches("a").is_empty());
    }

    #[test]
    fn test_snapshot_counts_sessions() {
        let store = LogStore::new(10, 10);
        store.append_entries("a", messages(&["1", "2"]));

        match store.snapshot("a", 2, 1) {
            ServerMessage::Init {
                stats,
                sessions,
                producers,
                ..
            } => {
                assert_eq!(stats.viewers, 2);
                assert_eq!(stats.buffered_entries, 2);
                assert_eq!(producers, 1);
                assert_eq!(sessions[0].entry_count, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
