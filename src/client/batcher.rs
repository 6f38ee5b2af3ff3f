//! Flush scheduling for inbound wire messages
//!
//! Messages are accumulated and applied to the buffer in one bulk step per
//! flush. Flushes land on a fixed tick grid and are spaced at least
//! `min_interval` apart, so a burst of a thousand frames costs one buffer
//! mutation instead of a thousand.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::client::buffer::IngestionBuffer;
use crate::client::watches::WatchTable;
use crate::config::BatchConfig;
use crate::protocol::{ControlCommand, LogEntry, StreamEntry, WatchValue};

/// Updates waiting for the next flush
#[derive(Debug, Default)]
pub struct PendingBatch {
    entries: Vec<LogEntry>,
    watches: BTreeMap<String, WatchValue>,
    commands: Vec<ControlCommand>,
    streams: BTreeMap<String, Vec<StreamEntry>>,
}

impl PendingBatch {
    /// Last-write-wins: a pending value for the same name is replaced
    pub fn merge_watch(&mut self, watch: WatchValue) {
        self.watches.insert(watch.name.clone(), watch);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
            && self.watches.is_empty()
            && self.commands.is_empty()
            && self.streams.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }
}

/// What one flush applied
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FlushReport {
    pub entries: Vec<LogEntry>,
    pub watches: Vec<WatchValue>,
    pub commands: Vec<ControlCommand>,
    pub stream_samples: usize,
    /// Buffer version after the flush
    pub version: u64,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
            && self.watches.is_empty()
            && self.commands.is_empty()
            && self.stream_samples == 0
    }
}

pub struct BatchScheduler {
    pending: PendingBatch,
    /// Deadline of the one scheduled flush; `Some` doubles as the guard flag
    scheduled_at: Option<Instant>,
    last_flush: Option<Instant>,
    last_watch_delivery: Option<Instant>,
    min_interval: Duration,
    frame_interval: Duration,
    watch_throttle: Option<Duration>,
    epoch: Instant,
}

impl BatchScheduler {
    pub fn new(config: &BatchConfig, epoch: Instant) -> Self {
        Self {
            pending: PendingBatch::default(),
            scheduled_at: None,
            last_flush: None,
            last_watch_delivery: None,
            min_interval: config.min_flush_interval(),
            frame_interval: config.frame_interval().max(Duration::from_millis(1)),
            watch_throttle: config.watch_throttle(),
            epoch,
        }
    }

    pub fn push_entries(&mut self, entries: Vec<LogEntry>, now: Instant) {
        if entries.is_empty() {
            return;
        }
        self.pending.entries.extend(entries);
        self.request_flush(now);
    }

    pub fn push_watch(&mut self, watch: WatchValue, now: Instant) {
        self.pending.merge_watch(watch);
        self.request_flush(now);
    }

    pub fn push_control(&mut self, command: ControlCommand, now: Instant) {
        self.pending.commands.push(command);
        self.request_flush(now);
    }

    pub fn push_stream(&mut self, channel: &str, entries: Vec<StreamEntry>, now: Instant) {
        if entries.is_empty() {
            return;
        }
        self.pending
            .streams
            .entry(channel.to_string())
            .or_default()
            .extend(entries);
        self.request_flush(now);
    }

    /// Schedule a flush unless one is already pending.
    /// Returns the new deadline when this call scheduled it.
    pub fn request_flush(&mut self, now: Instant) -> Option<Instant> {
        self.schedule_not_before(now, now)
    }

    fn schedule_not_before(&mut self, now: Instant, not_before: Instant) -> Option<Instant> {
        if self.scheduled_at.is_some() {
            return None;
        }

        let mut earliest = now.max(not_before);
        if let Some(last) = self.last_flush {
            earliest = earliest.max(last + self.min_interval);
        }

        let deadline = self.next_boundary(earliest);
        self.scheduled_at = Some(deadline);
        Some(deadline)
    }

    /// First tick boundary strictly after `at`
    fn next_boundary(&self, at: Instant) -> Instant {
        let frame = self.frame_interval.as_nanos();
        let since = at.saturating_duration_since(self.epoch).as_nanos();
        let ticks = since / frame + 1;
        self.epoch + Duration::from_nanos((ticks * frame) as u64)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduled_at
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.scheduled_at.is_some_and(|deadline| now >= deadline)
    }

    pub fn pending(&self) -> &PendingBatch {
        &self.pending
    }

    /// Throw away everything pending, e.g. after switching rooms
    pub fn discard_pending(&mut self) {
        self.pending = PendingBatch::default();
        self.scheduled_at = None;
    }

    /// Apply all pending updates.
    ///
    /// Control commands run first, in arrival order, then entries are added
    /// in one batch, then stream samples, then watches. A flush is a single
    /// atomic update; the interleaving of commands and entries that arrived
    /// within the same window is not preserved.
    pub fn flush(
        &mut self,
        now: Instant,
        buffer: &mut IngestionBuffer,
        watches: &mut WatchTable,
    ) -> FlushReport {
        self.scheduled_at = None;
        self.last_flush = Some(now);

        let mut report = FlushReport::default();

        for command in self.pending.commands.drain(..) {
            apply_command(command, buffer, watches);
            report.commands.push(command);
        }

        let entries = std::mem::take(&mut self.pending.entries);
        if !entries.is_empty() {
            report.entries = entries.clone();
            buffer.add_batch(entries);
        }

        for (channel, samples) in std::mem::take(&mut self.pending.streams) {
            report.stream_samples += samples.len();
            buffer.add_stream_batch(&channel, samples);
        }

        if !self.pending.watches.is_empty() {
            match self.watch_hold_until(now) {
                Some(allowed_at) => {
                    // Keep only the latest value per name until the throttle opens
                    self.schedule_not_before(now, allowed_at);
                }
                None => {
                    let delivered: Vec<WatchValue> =
                        std::mem::take(&mut self.pending.watches).into_values().collect();
                    watches.merge(delivered.iter().cloned());
                    report.watches = delivered;
                    self.last_watch_delivery = Some(now);
                }
            }
        }

        report.version = buffer.version();
        report
    }

    fn watch_hold_until(&self, now: Instant) -> Option<Instant> {
        let throttle = self.watch_throttle?;
        let last = self.last_watch_delivery?;
        let allowed_at = last + throttle;
        (now < allowed_at).then_some(allowed_at)
    }
}

/// Map a control command onto its buffer operation
pub fn apply_command(command: ControlCommand, buffer: &mut IngestionBuffer, watches: &mut WatchTable) {
    match command {
        ControlCommand::ClearLog => buffer.clear_entries(),
        ControlCommand::ClearWatches => watches.clear(),
        ControlCommand::ClearAll => {
            buffer.clear_entries();
            buffer.clear_streams();
            watches.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::NewLogEntry;
    use chrono::Utc;
    use serde_json::json;

    fn config(watch_throttle_ms: Option<u64>) -> BatchConfig {
        BatchConfig {
            min_flush_interval_ms: 50,
            frame_interval_ms: 16,
            watch_throttle_ms,
        }
    }

    fn entry(id: u64) -> LogEntry {
        NewLogEntry::default().into_entry(id)
    }

    fn watch(name: &str, value: i64) -> WatchValue {
        WatchValue {
            name: name.to_string(),
            value: json!(value),
            timestamp: Utc::now(),
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_only_one_flush_is_scheduled() {
        let t0 = Instant::now();
        let mut scheduler = BatchScheduler::new(&config(None), t0);

        assert_eq!(scheduler.request_flush(t0 + ms(1)), Some(t0 + ms(16)));
        scheduler.push_entries(vec![entry(1)], t0 + ms(2));
        assert_eq!(scheduler.request_flush(t0 + ms(3)), None);
        assert_eq!(scheduler.next_deadline(), Some(t0 + ms(16)));
        assert!(!scheduler.is_due(t0 + ms(15)));
        assert!(scheduler.is_due(t0 + ms(16)));
    }

    #[test]
    fn test_min_interval_delays_next_flush() {
        let t0 = Instant::now();
        let mut scheduler = BatchScheduler::new(&config(None), t0);
        let mut buffer = IngestionBuffer::new(100, 10);
        let mut watches = WatchTable::new();

        scheduler.push_entries(vec![entry(1)], t0);
        scheduler.flush(t0 + ms(16), &mut buffer, &mut watches);

        // 50ms after the last flush is t0+66, next boundary after that is t0+80
        scheduler.push_entries(vec![entry(2)], t0 + ms(20));
        assert_eq!(scheduler.next_deadline(), Some(t0 + ms(80)));
    }

    #[test]
    fn test_flush_applies_everything_in_bulk() {
        let t0 = Instant::now();
        let mut scheduler = BatchScheduler::new(&config(None), t0);
        let mut buffer = IngestionBuffer::new(100, 10);
        let mut watches = WatchTable::new();

        for id in 1..=100 {
            scheduler.push_entries(vec![entry(id)], t0);
        }
        scheduler.push_watch(watch("fps", 30), t0);
        scheduler.push_watch(watch("fps", 60), t0);

        let report = scheduler.flush(t0 + ms(16), &mut buffer, &mut watches);

        assert_eq!(buffer.len(), 100);
        assert_eq!(buffer.version(), 1);
        assert_eq!(report.entries.len(), 100);
        assert_eq!(report.watches.len(), 1);
        assert_eq!(watches.get("fps").unwrap().value, json!(60));
        assert!(scheduler.pending().is_empty());
        assert!(scheduler.next_deadline().is_none());
    }

    #[test]
    fn test_commands_run_in_order_before_entries() {
        let t0 = Instant::now();
        let mut scheduler = BatchScheduler::new(&config(None), t0);
        let mut buffer = IngestionBuffer::new(100, 10);
        let mut watches = WatchTable::new();
        buffer.add_batch(vec![entry(1)]);
        watches.merge(vec![watch("a", 1)]);

        scheduler.push_control(ControlCommand::ClearWatches, t0);
        scheduler.push_entries(vec![entry(2)], t0);
        scheduler.push_control(ControlCommand::ClearLog, t0);
        scheduler.push_control(ControlCommand::ClearLog, t0);

        let report = scheduler.flush(t0 + ms(16), &mut buffer, &mut watches);
        assert_eq!(
            report.commands,
            vec![ControlCommand::ClearWatches, ControlCommand::ClearLog, ControlCommand::ClearLog]
        );
        assert!(watches.is_empty());
        assert_eq!(buffer.entries().map(|e| e.id).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_watch_throttle_holds_latest_value() {
        let t0 = Instant::now();
        let mut scheduler = BatchScheduler::new(&config(Some(1000)), t0);
        let mut buffer = IngestionBuffer::new(100, 10);
        let mut watches = WatchTable::new();

        scheduler.push_watch(watch("temp", 1), t0);
        let first = scheduler.flush(t0 + ms(16), &mut buffer, &mut watches);
        assert_eq!(first.watches.len(), 1);

        scheduler.push_watch(watch("temp", 2), t0 + ms(100));
        scheduler.push_watch(watch("temp", 3), t0 + ms(200));
        scheduler.push_entries(vec![entry(1)], t0 + ms(200));
        let held = scheduler.flush(t0 + ms(208), &mut buffer, &mut watches);

        // entries are never throttled, watches wait
        assert_eq!(held.entries.len(), 1);
        assert!(held.watches.is_empty());
        assert_eq!(watches.get("temp").unwrap().value, json!(1));
        assert_eq!(scheduler.pending().watch_count(), 1);

        let deadline = scheduler.next_deadline().unwrap();
        assert!(deadline > t0 + ms(1016));

        let released = scheduler.flush(deadline, &mut buffer, &mut watches);
        assert_eq!(released.watches.len(), 1);
        assert_eq!(watches.get("temp").unwrap().value, json!(3));
    }

    #[test]
    fn test_clear_all_is_idempotent() {
        let mut buffer = IngestionBuffer::new(10, 10);
        let mut watches = WatchTable::new();
        buffer.add_batch(vec![entry(1)]);

        apply_command(ControlCommand::ClearAll, &mut buffer, &mut watches);
        apply_command(ControlCommand::ClearAll, &mut buffer, &mut watches);

        assert!(buffer.is_empty());
        assert!(watches.is_empty());
    }
}
