//! Rate-based auto-pause for stream channels
//!
//! Every tick the controller turns each channel's cumulative sample count
//! into a rate, smooths it over a short window and pauses the channel once
//! the smoothed rate has stayed above the threshold for the grace period.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use crate::client::buffer::IngestionBuffer;
use crate::client::subscriptions::SubscriptionRegistry;
use crate::config::AutoPauseConfig;
use crate::protocol::ClientMessage;

/// Outbound command path used to pause a channel
pub trait CommandSink {
    /// Returns false when the command could not be transmitted
    fn send_command(&mut self, message: ClientMessage) -> bool;
}

/// Notification raised when a channel is auto-paused
#[derive(Debug, Clone, PartialEq)]
pub struct AutoPauseEvent {
    pub channel: String,
    /// Smoothed rate in samples per second at the moment of pausing
    pub rate: f64,
}

#[derive(Debug)]
struct RateTracker {
    previous_total: u64,
    samples: VecDeque<f64>,
    breach_started: Option<Instant>,
}

impl RateTracker {
    fn new(total: u64) -> Self {
        Self {
            previous_total: total,
            samples: VecDeque::new(),
            breach_started: None,
        }
    }

    fn push(&mut self, rate: f64, window: usize) {
        if self.samples.len() == window {
            self.samples.pop_front();
        }
        self.samples.push_back(rate);
    }

    fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.samples.iter().sum::<f64>() / self.samples.len() as f64
        }
    }
}

pub struct AutoPauseController {
    config: AutoPauseConfig,
    trackers: HashMap<String, RateTracker>,
}

impl AutoPauseController {
    pub fn new(config: AutoPauseConfig) -> Self {
        Self {
            config,
            trackers: HashMap::new(),
        }
    }

    pub fn config(&self) -> &AutoPauseConfig {
        &self.config
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
        if !enabled {
            self.trackers.clear();
        }
    }

    /// Channels currently being measured
    pub fn tracked_channels(&self) -> impl Iterator<Item = &str> {
        self.trackers.keys().map(String::as_str)
    }

    /// Smoothed rate of a tracked channel
    pub fn smoothed_rate(&self, channel: &str) -> Option<f64> {
        self.trackers.get(channel).map(RateTracker::mean)
    }

    /// Run one sampling tick; returns the channels paused by it
    pub fn tick(
        &mut self,
        now: Instant,
        buffer: &IngestionBuffer,
        registry: &mut SubscriptionRegistry,
        sink: &mut impl CommandSink,
    ) -> Vec<AutoPauseEvent> {
        // Trackers only exist for subscribed, running channels
        self.trackers
            .retain(|channel, _| registry.is_subscribed(channel) && !registry.is_paused(channel));

        if !self.config.enabled || registry.active_count() < self.config.min_active_channels {
            self.trackers.clear();
            return Vec::new();
        }

        let tick_secs = self.config.tick().as_secs_f64();
        let window = self.config.window.max(1);
        let grace = self.config.grace_period();

        let candidates: Vec<String> = registry
            .channels()
            .filter(|(_, state)| !state.paused)
            .map(|(name, _)| name.to_string())
            .collect();

        let mut events = Vec::new();
        for channel in candidates {
            if registry.is_auto_paused(&channel) || registry.has_manual_override(&channel) {
                self.trackers.remove(&channel);
                continue;
            }

            let total = buffer.stream_total(&channel);
            let tracker = match self.trackers.entry(channel.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(RateTracker::new(total));
                    continue;
                }
                Entry::Occupied(slot) => slot.into_mut(),
            };

            let delta = total.saturating_sub(tracker.previous_total);
            tracker.previous_total = total;
            tracker.push(delta as f64 / tick_secs, window);
            let rate = tracker.mean();

            if rate <= self.config.threshold_per_sec {
                tracker.breach_started = None;
                continue;
            }

            let started = match tracker.breach_started {
                Some(started) => started,
                None => {
                    tracker.breach_started = Some(now);
                    continue;
                }
            };
            if now.duration_since(started) < grace {
                continue;
            }

            // The next observation after a resume starts from a fresh baseline
            self.trackers.remove(&channel);
            sink.send_command(ClientMessage::PauseStream {
                channel: channel.clone(),
            });
            registry.mark_auto_paused(&channel);
            tracing::warn!(
                "Auto-paused channel '{}' at {:.0} samples/s (limit {:.0}/s)",
                channel,
                rate,
                self.config.threshold_per_sec
            );
            events.push(AutoPauseEvent { channel, rate });
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::StreamEntry;
    use chrono::Utc;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        sent: Vec<ClientMessage>,
    }

    impl CommandSink for RecordingSink {
        fn send_command(&mut self, message: ClientMessage) -> bool {
            self.sent.push(message);
            true
        }
    }

    struct Harness {
        t0: Instant,
        ticks: u32,
        buffer: IngestionBuffer,
        registry: SubscriptionRegistry,
        controller: AutoPauseController,
        sink: RecordingSink,
    }

    impl Harness {
        fn new(config: AutoPauseConfig, channels: &[&str]) -> Self {
            let mut registry = SubscriptionRegistry::new();
            for channel in channels {
                registry.subscribe(channel);
            }
            Self {
                t0: Instant::now(),
                ticks: 0,
                buffer: IngestionBuffer::new(10, 1_000),
                registry,
                controller: AutoPauseController::new(config),
                sink: RecordingSink::default(),
            }
        }

        /// Deliver `samples` on `channel`, then run one tick
        fn tick_with(&mut self, channel: &str, samples: usize) -> Vec<AutoPauseEvent> {
            let batch = (0..samples)
                .map(|n| StreamEntry {
                    channel: channel.to_string(),
                    timestamp: Utc::now(),
                    data: serde_json::json!(n),
                })
                .collect();
            self.buffer.add_stream_batch(channel, batch);
            self.ticks += 1;
            let now = self.t0 + Duration::from_millis(500) * self.ticks;
            self.controller
                .tick(now, &self.buffer, &mut self.registry, &mut self.sink)
        }

        fn pauses_sent(&self) -> usize {
            self.sink
                .sent
                .iter()
                .filter(|m| matches!(m, ClientMessage::PauseStream { .. }))
                .count()
        }
    }

    fn config() -> AutoPauseConfig {
        AutoPauseConfig {
            enabled: true,
            threshold_per_sec: 100.0,
            grace_period_ms: 2_000,
            tick_ms: 500,
            window: 4,
            min_active_channels: 1,
        }
    }

    #[test]
    fn test_sustained_breach_fires_once_after_grace() {
        let mut h = Harness::new(config(), &["gps"]);
        assert!(h.tick_with("gps", 0).is_empty()); // baseline

        // 75 samples per 500ms tick = 150/s
        for _ in 0..4 {
            assert!(h.tick_with("gps", 75).is_empty());
        }
        let events = h.tick_with("gps", 75);

        assert_eq!(events, vec![AutoPauseEvent { channel: "gps".into(), rate: 150.0 }]);
        assert_eq!(h.sink.sent, vec![ClientMessage::PauseStream { channel: "gps".into() }]);
        assert!(h.registry.is_auto_paused("gps"));
        assert!(h.registry.is_paused("gps"));

        for _ in 0..10 {
            assert!(h.tick_with("gps", 75).is_empty());
        }
        assert_eq!(h.pauses_sent(), 1);
    }

    #[test]
    fn test_short_spike_never_pauses() {
        let mut h = Harness::new(config(), &["gps"]);
        h.tick_with("gps", 0);
        h.tick_with("gps", 75);
        for _ in 0..20 {
            h.tick_with("gps", 0);
        }
        assert_eq!(h.pauses_sent(), 0);
    }

    #[test]
    fn test_drop_below_threshold_resets_grace_clock() {
        let mut h = Harness::new(config(), &["gps"]);
        h.tick_with("gps", 0);
        for _ in 0..3 {
            h.tick_with("gps", 75);
        }
        // Three quiet ticks pull the window mean under the threshold
        for _ in 0..3 {
            h.tick_with("gps", 0);
        }
        assert_eq!(h.pauses_sent(), 0);
        assert!(h.controller.smoothed_rate("gps").unwrap() <= 100.0);
    }

    #[test]
    fn test_independent_breach_fires_again() {
        let mut h = Harness::new(config(), &["gps"]);
        h.tick_with("gps", 0);
        for _ in 0..5 {
            h.tick_with("gps", 75);
        }
        assert_eq!(h.pauses_sent(), 1);
        assert!(h.controller.smoothed_rate("gps").is_none());

        // Resumed from elsewhere, without a manual override
        h.registry
            .record_ack(&crate::protocol::ServerMessage::StreamResumed { channel: "gps".into() });
        assert!(!h.registry.is_auto_paused("gps"));

        h.tick_with("gps", 0);
        for _ in 0..5 {
            h.tick_with("gps", 75);
        }
        assert_eq!(h.pauses_sent(), 2);
    }

    #[test]
    fn test_manual_override_is_permanent() {
        let mut h = Harness::new(config(), &["gps"]);
        h.tick_with("gps", 0);
        for _ in 0..5 {
            h.tick_with("gps", 75);
        }
        assert_eq!(h.pauses_sent(), 1);

        h.registry.manual_resume("gps");
        for _ in 0..40 {
            h.tick_with("gps", 500);
        }
        assert_eq!(h.pauses_sent(), 1);
        assert!(!h.registry.is_paused("gps"));
    }

    #[test]
    fn test_inactive_below_min_active_channels() {
        let mut cfg = config();
        cfg.min_active_channels = 2;
        let mut h = Harness::new(cfg, &["gps"]);
        for _ in 0..20 {
            h.tick_with("gps", 500);
        }
        assert_eq!(h.pauses_sent(), 0);
        assert_eq!(h.controller.tracked_channels().count(), 0);
    }

    #[test]
    fn test_disabled_controller_does_nothing() {
        let mut cfg = config();
        cfg.enabled = false;
        let mut h = Harness::new(cfg, &["gps", "cpu"]);
        for _ in 0..20 {
            h.tick_with("gps", 500);
        }
        assert_eq!(h.pauses_sent(), 0);
    }

    #[test]
    fn test_trackers_dropped_for_unsubscribed_channels() {
        let mut h = Harness::new(config(), &["gps", "cpu"]);
        h.tick_with("gps", 10);
        h.tick_with("cpu", 10);
        assert_eq!(h.controller.tracked_channels().count(), 2);

        h.registry.unsubscribe("cpu");
        h.tick_with("gps", 10);
        let tracked: Vec<_> = h.controller.tracked_channels().collect();
        assert_eq!(tracked, vec!["gps"]);
    }
}
