//! Bounded ingestion buffer for log entries and stream channels
//!
//! Every store here is a FIFO ring: when a batch would push the length past
//! capacity, the oldest elements are evicted first. Work done per batch is
//! proportional to the batch plus the overflow, never to the whole buffer.

use std::collections::{HashMap, VecDeque};

use crate::protocol::{LogEntry, StreamEntry};

/// Capacity-bounded FIFO list
#[derive(Debug, Clone)]
pub struct BoundedBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
    evicted: u64,
}

impl<T> BoundedBuffer<T> {
    /// Create a buffer holding at most `capacity` items
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Capacity must be non-zero");

        Self {
            items: VecDeque::new(),
            capacity,
            evicted: 0,
        }
    }

    /// Append a batch, evicting the oldest items on overflow.
    /// Returns the number of items dropped (existing or incoming).
    pub fn extend_batch(&mut self, incoming: Vec<T>) -> usize {
        let incoming_len = incoming.len();
        let existing_len = self.items.len();
        let capacity = self.capacity;

        let dropped = if existing_len + incoming_len <= capacity {
            self.items.extend(incoming);
            0
        } else if incoming_len >= capacity {
            // Only the tail of the batch survives
            let skip = incoming_len - capacity;
            self.items.clear();
            self.items.extend(incoming.into_iter().skip(skip));
            existing_len + skip
        } else {
            let keep = capacity - incoming_len;
            let drop = existing_len - keep;
            self.items.drain(..drop);
            self.items.extend(incoming);
            drop
        };

        self.evicted += dropped as u64;
        dropped
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total items evicted since creation
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Iterate oldest to newest
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    pub fn back(&self) -> Option<&T> {
        self.items.back()
    }

    /// Get fill level as a fraction of capacity
    pub fn fill_level(&self) -> f32 {
        self.len() as f32 / self.capacity as f32
    }
}

/// Buffer counters for status displays
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub entries: usize,
    pub capacity: usize,
    pub evicted: u64,
    pub stream_channels: usize,
    pub version: u64,
}

/// Client-side store of everything the renderer reads
#[derive(Debug)]
pub struct IngestionBuffer {
    entries: BoundedBuffer<LogEntry>,
    streams: HashMap<String, BoundedBuffer<StreamEntry>>,
    stream_totals: HashMap<String, u64>,
    stream_capacity: usize,
    app_names: HashMap<String, u64>,
    host_names: HashMap<String, u64>,
    version: u64,
}

impl IngestionBuffer {
    pub fn new(max_entries: usize, stream_max_entries: usize) -> Self {
        assert!(stream_max_entries > 0, "Stream capacity must be non-zero");

        Self {
            entries: BoundedBuffer::new(max_entries),
            streams: HashMap::new(),
            stream_totals: HashMap::new(),
            stream_capacity: stream_max_entries,
            app_names: HashMap::new(),
            host_names: HashMap::new(),
            version: 0,
        }
    }

    /// Append a batch of log entries in one bulk step
    pub fn add_batch(&mut self, entries: Vec<LogEntry>) {
        if entries.is_empty() {
            return;
        }

        for entry in &entries {
            if !entry.app_name.is_empty() {
                *self.app_names.entry(entry.app_name.clone()).or_insert(0) += 1;
            }
            if !entry.host_name.is_empty() {
                *self.host_names.entry(entry.host_name.clone()).or_insert(0) += 1;
            }
        }

        self.entries.extend_batch(entries);
        self.version += 1;
    }

    /// Append samples to one channel's independent ring
    pub fn add_stream_batch(&mut self, channel: &str, entries: Vec<StreamEntry>) {
        if entries.is_empty() {
            return;
        }

        *self.stream_totals.entry(channel.to_string()).or_insert(0) += entries.len() as u64;

        let capacity = self.stream_capacity;
        self.streams
            .entry(channel.to_string())
            .or_insert_with(|| BoundedBuffer::new(capacity))
            .extend_batch(entries);
        self.version += 1;
    }

    /// Drop all log entries; the name indices are kept
    pub fn clear_entries(&mut self) {
        self.entries.clear();
        self.version += 1;
    }

    /// Drop the samples of one channel; its received total is kept
    pub fn clear_stream(&mut self, channel: &str) {
        if let Some(stream) = self.streams.get_mut(channel) {
            stream.clear();
        }
        self.version += 1;
    }

    pub fn clear_streams(&mut self) {
        for stream in self.streams.values_mut() {
            stream.clear();
        }
        self.version += 1;
    }

    /// Forget a channel entirely, including its received total
    pub fn remove_stream(&mut self, channel: &str) {
        self.streams.remove(channel);
        self.stream_totals.remove(channel);
        self.version += 1;
    }

    /// Monotonic change counter; bumps on every mutation
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &LogEntry> + ExactSizeIterator {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    pub fn last_entry(&self) -> Option<&LogEntry> {
        self.entries.back()
    }

    pub fn stream(&self, channel: &str) -> Option<&BoundedBuffer<StreamEntry>> {
        self.streams.get(channel)
    }

    pub fn stream_channels(&self) -> impl Iterator<Item = &str> {
        self.streams.keys().map(String::as_str)
    }

    /// Cumulative number of samples ever received on `channel`.
    /// Never decreases on eviction; this is what throughput is measured from.
    pub fn stream_total(&self, channel: &str) -> u64 {
        self.stream_totals.get(channel).copied().unwrap_or(0)
    }

    /// App names with the number of entries ever seen for each.
    ///
    /// These counts cover the whole session ("ever seen"), not the current
    /// buffer contents: eviction and `clear_entries` leave them untouched, so
    /// filter pickers keep offering names whose entries have scrolled out.
    pub fn app_name_counts(&self) -> &HashMap<String, u64> {
        &self.app_names
    }

    /// Host names with session-cumulative counts, see [`Self::app_name_counts`]
    pub fn host_name_counts(&self) -> &HashMap<String, u64> {
        &self.host_names
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            entries: self.entries.len(),
            capacity: self.entries.capacity(),
            evicted: self.entries.evicted(),
            stream_channels: self.streams.len(),
            version: self.version,
        }
    }
}
