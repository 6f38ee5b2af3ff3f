//! Per-channel subscription state
//!
//! The `{subscribed, paused}` map is persisted as a small versioned JSON
//! document so a restarted viewer resubscribes to what it had. The
//! auto-pause and manual-override sets only live for the session.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::constants::{SUBSCRIPTIONS_STORAGE_KEY, SUBSCRIPTIONS_STORAGE_VERSION};
use crate::error::StorageError;
use crate::protocol::ServerMessage;

/// Stored state of one channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSubscription {
    pub subscribed: bool,
    pub paused: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredSubscriptions {
    version: u32,
    channels: BTreeMap<String, ChannelSubscription>,
}

/// Commands needed to restore server-side state after a reconnect
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayPlan {
    /// Sent immediately
    pub subscribe: Vec<String>,
    /// Sent after the settle delay, once the subscribes have landed
    pub pause: Vec<String>,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    channels: BTreeMap<String, ChannelSubscription>,
    auto_paused: HashSet<String>,
    manual_override: HashSet<String>,
    storage: Option<PathBuf>,
}

impl SubscriptionRegistry {
    /// In-memory registry, nothing persisted
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry backed by `<dir>/<storage key>.json`, restoring any saved state
    pub fn with_storage(dir: &Path) -> Result<Self, StorageError> {
        let path = dir.join(format!("{}.json", SUBSCRIPTIONS_STORAGE_KEY));
        let channels = if path.exists() {
            let stored: StoredSubscriptions = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
            if stored.version != SUBSCRIPTIONS_STORAGE_VERSION {
                return Err(StorageError::UnsupportedVersion(stored.version));
            }
            stored.channels
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            channels,
            storage: Some(path),
            ..Default::default()
        })
    }

    /// Path of the backing document, if any
    pub fn storage_path(&self) -> Option<&Path> {
        self.storage.as_deref()
    }

    pub fn subscribe(&mut self, channel: &str) {
        let record = self.channels.entry(channel.to_string()).or_default();
        if !record.subscribed {
            *record = ChannelSubscription { subscribed: true, paused: false };
            self.persist();
        }
    }

    /// Forget the channel, including its session flags
    pub fn unsubscribe(&mut self, channel: &str) {
        self.auto_paused.remove(channel);
        self.manual_override.remove(channel);
        if self.channels.remove(channel).is_some() {
            self.persist();
        }
    }

    /// User-initiated pause
    pub fn pause(&mut self, channel: &str) {
        self.set_paused(channel, true);
    }

    /// User-initiated resume: clears auto-pause and exempts the channel from
    /// further auto-pausing for the rest of the session.
    pub fn manual_resume(&mut self, channel: &str) {
        if !self.is_subscribed(channel) {
            return;
        }
        self.auto_paused.remove(channel);
        self.manual_override.insert(channel.to_string());
        self.set_paused(channel, false);
    }

    /// Record a pause issued by the auto-pause controller
    pub fn mark_auto_paused(&mut self, channel: &str) {
        if !self.is_subscribed(channel) {
            return;
        }
        self.auto_paused.insert(channel.to_string());
        self.set_paused(channel, true);
    }

    /// Apply a server acknowledgement to the stored state
    pub fn record_ack(&mut self, message: &ServerMessage) {
        match message {
            ServerMessage::StreamSubscribed { channel } => self.subscribe(channel),
            ServerMessage::StreamUnsubscribed { channel } => self.unsubscribe(channel),
            ServerMessage::StreamPaused { channel } => self.set_paused(channel, true),
            ServerMessage::StreamResumed { channel } => {
                self.auto_paused.remove(channel.as_str());
                self.set_paused(channel, false);
            }
            _ => {}
        }
    }

    fn set_paused(&mut self, channel: &str, paused: bool) {
        if let Some(record) = self.channels.get_mut(channel) {
            if record.subscribed && record.paused != paused {
                record.paused = paused;
                self.persist();
            }
        }
    }

    pub fn get(&self, channel: &str) -> Option<ChannelSubscription> {
        self.channels.get(channel).copied()
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.get(channel).is_some_and(|s| s.subscribed)
    }

    pub fn is_paused(&self, channel: &str) -> bool {
        self.get(channel).is_some_and(|s| s.paused)
    }

    pub fn is_auto_paused(&self, channel: &str) -> bool {
        self.auto_paused.contains(channel)
    }

    pub fn has_manual_override(&self, channel: &str) -> bool {
        self.manual_override.contains(channel)
    }

    /// Subscribed channels in name order
    pub fn channels(&self) -> impl Iterator<Item = (&str, ChannelSubscription)> {
        self.channels
            .iter()
            .filter(|(_, s)| s.subscribed)
            .map(|(name, s)| (name.as_str(), *s))
    }

    /// Channels that are subscribed and not paused
    pub fn active_count(&self) -> usize {
        self.channels().filter(|(_, s)| !s.paused).count()
    }

    pub fn replay_plan(&self) -> ReplayPlan {
        let mut plan = ReplayPlan::default();
        for (name, state) in self.channels() {
            plan.subscribe.push(name.to_string());
            if state.paused {
                plan.pause.push(name.to_string());
            }
        }
        plan
    }

    /// Write the current map to storage
    pub fn save(&self) -> Result<(), StorageError> {
        let Some(path) = &self.storage else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let doc = StoredSubscriptions {
            version: SUBSCRIPTIONS_STORAGE_VERSION,
            channels: self.channels.clone(),
        };
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&doc)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn persist(&self) {
        if let Err(e) = self.save() {
            tracing::warn!("Failed to persist stream subscriptions: {}", e);
        }
    }
}
