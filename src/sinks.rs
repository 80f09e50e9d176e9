//! Per-channel destinations for decoded samples.
//!
//! The acquisition thread resolves channel titles to sinks once per
//! session through a [`SinkDirectory`]. The directory holds an immutable
//! map that is replaced wholesale when a new configuration arrives, so a
//! reader always sees one consistent set of channels.

use crate::circular_buffer::{CircularBuffer, Consumer, Producer};
use crate::config_protocol::ChannelConfig;
use polars::prelude::*;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

pub const DEFAULT_TRACE_LEN: usize = 1000;

const SAMPLE_INDEX_COLUMN: &str = "sample";

/// Accepts decoded samples for one channel, one at a time
pub trait SampleSink: Send {
    fn push(&mut self, sample: f32);
}

impl SampleSink for CircularBuffer<f32> {
    /// Samples that do not fit are dropped; see [`CircularBuffer::rejected_writes`]
    fn push(&mut self, sample: f32) {
        let _ = self.write(&[sample]);
    }
}

impl SampleSink for Producer<f32> {
    fn push(&mut self, sample: f32) {
        let _ = self.write(&[sample]);
    }
}

pub type SharedSink<S> = Arc<Mutex<S>>;
pub type SinkMap<S> = BTreeMap<String, SharedSink<S>>;

/// Where a channel sits in the configuration it was announced in
#[derive(Debug, Clone, Copy)]
pub struct ChannelSlot<'a> {
    pub index: usize,
    pub count: usize,
    pub title: &'a str,
}

impl ChannelSlot<'_> {
    /// Evenly spaced position on the colour wheel
    pub fn hue_degrees(&self) -> f32 {
        if self.count == 0 {
            return 0.0;
        }
        self.index as f32 * 360.0 / self.count as f32
    }
}

/// Builds sinks for titles that have none yet
pub trait SinkFactory: Send + Sync + 'static {
    type Sink: SampleSink + 'static;

    fn create(&self, slot: &ChannelSlot<'_>) -> Self::Sink;

    /// Called when an existing sink is carried into a new configuration
    fn reassign(&self, _sink: &mut Self::Sink, _slot: &ChannelSlot<'_>) {}
}

/// Title to sink mapping shared between the acquisition thread and readers
pub struct SinkDirectory<S> {
    current: Arc<RwLock<Arc<SinkMap<S>>>>,
}

impl<S> SinkDirectory<S> {
    pub fn new() -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(BTreeMap::new()))),
        }
    }

    /// The currently published map. Later publishes do not affect it.
    pub fn snapshot(&self) -> Arc<SinkMap<S>> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn contains(&self, title: &str) -> bool {
        self.snapshot().contains_key(title)
    }

    pub fn get(&self, title: &str) -> Option<SharedSink<S>> {
        self.snapshot().get(title).cloned()
    }

    pub fn titles(&self) -> Vec<String> {
        self.snapshot().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Replace the whole map
    pub fn publish(&self, map: SinkMap<S>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(map);
    }

    pub fn clear(&self) {
        self.publish(BTreeMap::new());
    }
}

impl<S: SampleSink + 'static> SinkDirectory<S> {
    /// Build and publish the map for a new configuration.
    ///
    /// Titles already present keep their sink, titles that disappeared are
    /// dropped from the map. Returns the sinks in channel order.
    pub fn rebind<F>(&self, config: &ChannelConfig, factory: &F) -> Vec<SharedSink<S>>
    where
        F: SinkFactory<Sink = S> + ?Sized,
    {
        let previous = self.snapshot();
        let mut next: SinkMap<S> = BTreeMap::new();
        let mut ordered = Vec::with_capacity(config.len());

        for (index, title) in config.titles().enumerate() {
            let slot = ChannelSlot {
                index,
                count: config.len(),
                title,
            };
            let sink = if let Some(sink) = next.get(title) {
                // repeated title within one configuration
                Arc::clone(sink)
            } else if let Some(sink) = previous.get(title) {
                log::debug!("Reusing sink for '{}'", title);
                factory.reassign(&mut sink.lock().unwrap_or_else(PoisonError::into_inner), &slot);
                Arc::clone(sink)
            } else {
                log::debug!("Creating sink for '{}'", title);
                Arc::new(Mutex::new(factory.create(&slot)))
            };
            next.insert(title.to_string(), Arc::clone(&sink));
            ordered.push(sink);
        }

        self.publish(next);
        ordered
    }
}

impl<S> Clone for SinkDirectory<S> {
    fn clone(&self) -> Self {
        Self {
            current: Arc::clone(&self.current),
        }
    }
}

impl<S> Default for SinkDirectory<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Scrolling history of the most recent samples of one channel
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    values: Vec<f32>,
    hue: f32,
}

impl Trace {
    pub fn new(len: usize, hue: f32) -> Self {
        Self {
            values: vec![0.0; len],
            hue,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Oldest first
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn latest(&self) -> Option<f32> {
        self.values.last().copied()
    }

    pub fn hue(&self) -> f32 {
        self.hue
    }

    pub fn set_hue(&mut self, hue: f32) {
        self.hue = hue;
    }

    /// Resize, keeping the newest samples at the end
    pub fn set_len(&mut self, len: usize) {
        let old_len = self.values.len();
        if len <= old_len {
            self.values.drain(..old_len - len);
        } else {
            let mut resized = vec![0.0; len - old_len];
            resized.extend_from_slice(&self.values);
            self.values = resized;
        }
    }

    /// Shift the history left and append `samples`
    pub fn push_slice(&mut self, samples: &[f32]) {
        let len = self.values.len();
        if samples.len() >= len {
            self.values.copy_from_slice(&samples[samples.len() - len..]);
        } else {
            self.values.copy_within(samples.len().., 0);
            self.values[len - samples.len()..].copy_from_slice(samples);
        }
    }

    fn to_column(&self, title: &str) -> Column {
        Series::new(title.into(), self.values.as_slice()).into()
    }
}

impl SampleSink for Trace {
    fn push(&mut self, sample: f32) {
        self.push_slice(&[sample]);
    }
}

/// Creates [`Trace`]s of a fixed length coloured by channel position
#[derive(Debug, Clone, Copy)]
pub struct TraceFactory {
    pub len: usize,
}

impl Default for TraceFactory {
    fn default() -> Self {
        Self {
            len: DEFAULT_TRACE_LEN,
        }
    }
}

impl SinkFactory for TraceFactory {
    type Sink = Trace;

    fn create(&self, slot: &ChannelSlot<'_>) -> Trace {
        Trace::new(self.len, slot.hue_degrees())
    }

    fn reassign(&self, trace: &mut Trace, slot: &ChannelSlot<'_>) {
        // keep the history but avoid colour collisions with the new layout
        trace.set_hue(slot.hue_degrees());
    }
}

/// Writing end of one channel's ring buffer.
///
/// The reading end stays here until a consumer claims it with
/// [`take_consumer`](Self::take_consumer); from then on the consumer drains
/// the ring without going through the directory's lock.
#[derive(Debug)]
pub struct BufferSink {
    producer: Producer<f32>,
    consumer: Option<Consumer<f32>>,
}

impl BufferSink {
    pub fn new(capacity: NonZeroUsize) -> Self {
        let (producer, consumer) = CircularBuffer::new(capacity.get()).split();
        Self {
            producer,
            consumer: Some(consumer),
        }
    }

    /// The reading end, handed out once
    pub fn take_consumer(&mut self) -> Option<Consumer<f32>> {
        self.consumer.take()
    }

    pub fn producer(&self) -> &Producer<f32> {
        &self.producer
    }
}

impl SampleSink for BufferSink {
    fn push(&mut self, sample: f32) {
        self.producer.push(sample);
    }
}

/// Creates one ring buffer per channel for consumers that drain at their own pace
#[derive(Debug, Clone, Copy)]
pub struct BufferFactory {
    pub capacity: NonZeroUsize,
}

impl BufferFactory {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self { capacity }
    }
}

impl SinkFactory for BufferFactory {
    type Sink = BufferSink;

    fn create(&self, _slot: &ChannelSlot<'_>) -> BufferSink {
        BufferSink::new(self.capacity)
    }
}

/// One column per channel plus a sample index; all traces must share a length
pub fn traces_to_dataframe(traces: &SinkMap<Trace>) -> PolarsResult<DataFrame> {
    let height = traces
        .values()
        .next()
        .map_or(0, |trace| trace.lock().unwrap_or_else(PoisonError::into_inner).len());

    let index: Vec<u32> = (0..height as u32).collect();
    let mut columns: Vec<Column> = vec![Series::new(SAMPLE_INDEX_COLUMN.into(), index).into()];
    for (title, trace) in traces {
        let trace = trace.lock().unwrap_or_else(PoisonError::into_inner);
        columns.push(trace.to_column(title));
    }

    DataFrame::new(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_protocol::ChannelDescriptor;
    use crate::sample_decoder::SampleWidth;

    fn config(titles: &[&str]) -> ChannelConfig {
        ChannelConfig::new(
            titles
                .iter()
                .map(|title| ChannelDescriptor {
                    width: SampleWidth::One,
                    title: (*title).to_string(),
                })
                .collect(),
        )
    }

    #[test]
    fn test_trace_scrolls_left() {
        let mut trace = Trace::new(3, 0.0);
        trace.push(1.0);
        trace.push(2.0);
        assert_eq!(trace.values(), &[0.0, 1.0, 2.0]);

        trace.push_slice(&[3.0, 4.0, 5.0, 6.0]);
        assert_eq!(trace.values(), &[4.0, 5.0, 6.0]);
        assert_eq!(trace.latest(), Some(6.0));
    }

    #[test]
    fn test_trace_resize_keeps_newest() {
        let mut trace = Trace::new(4, 0.0);
        trace.push_slice(&[1.0, 2.0, 3.0, 4.0]);

        trace.set_len(2);
        assert_eq!(trace.values(), &[3.0, 4.0]);

        trace.set_len(3);
        assert_eq!(trace.values(), &[0.0, 3.0, 4.0]);
    }

    #[test]
    fn test_hue_spreads_around_wheel() {
        let slot = ChannelSlot {
            index: 1,
            count: 4,
            title: "x",
        };
        assert_eq!(slot.hue_degrees(), 90.0);
    }

    #[test]
    fn test_rebind_reuses_sinks_by_title() {
        let directory = SinkDirectory::new();
        let factory = TraceFactory { len: 4 };

        let first = directory.rebind(&config(&["A", "B"]), &factory);
        first[0].lock().unwrap().push(0.25);
        let before = directory.snapshot();

        assert!(directory.contains("A"));
        let second = directory.rebind(&config(&["C", "A"]), &factory);

        assert!(Arc::ptr_eq(&first[0], &second[1]));
        assert_eq!(second[1].lock().unwrap().latest(), Some(0.25));
        assert_eq!(second[1].lock().unwrap().hue(), 180.0);
        assert_eq!(directory.titles(), vec!["A".to_string(), "C".to_string()]);
        assert!(!directory.contains("B"));

        // earlier snapshots are unaffected by the new publish
        assert!(before.contains_key("B"));
    }

    #[test]
    fn test_repeated_title_shares_one_sink() {
        let directory = SinkDirectory::new();
        let sinks = directory.rebind(&config(&["A", "A"]), &TraceFactory::default());
        assert!(Arc::ptr_eq(&sinks[0], &sinks[1]));
        assert_eq!(directory.len(), 1);
    }

    fn capacity(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn test_buffer_sink_drops_when_full() {
        let directory = SinkDirectory::new();
        let sinks = directory.rebind(&config(&["A"]), &BufferFactory::new(capacity(3)));

        let mut buffer = sinks[0].lock().unwrap();
        for sample in [0.1, 0.2, 0.3] {
            buffer.push(sample);
        }
        assert_eq!(buffer.producer().readable(), 2);
        assert_eq!(buffer.producer().rejected_writes(), 1);
    }

    #[test]
    fn test_smallest_buffer_sink_rejects_without_panicking() {
        let directory = SinkDirectory::new();
        let sinks = directory.rebind(&config(&["A"]), &BufferFactory::new(NonZeroUsize::MIN));

        let mut buffer = sinks[0].lock().unwrap();
        buffer.push(0.1);
        assert_eq!(buffer.producer().readable(), 0);
        assert_eq!(buffer.producer().rejected_writes(), 1);
    }

    #[test]
    fn test_buffer_consumer_drains_on_another_thread() {
        let directory = SinkDirectory::new();
        let sinks = directory.rebind(&config(&["A"]), &BufferFactory::new(capacity(64)));
        let mut consumer = sinks[0].lock().unwrap().take_consumer().unwrap();
        assert!(sinks[0].lock().unwrap().take_consumer().is_none());

        let reader = std::thread::spawn(move || {
            let mut received = Vec::new();
            let mut out = [0.0f32; 1];
            while received.len() < 40 {
                if consumer.read(&mut out) {
                    received.push(out[0]);
                } else {
                    std::thread::yield_now();
                }
            }
            received
        });

        let mut pushed = 0;
        while pushed < 40 {
            let mut sink = sinks[0].lock().unwrap();
            if sink.producer().writable() > 1 {
                sink.push(pushed as f32);
                pushed += 1;
            }
        }

        let received = reader.join().unwrap();
        let expected: Vec<f32> = (0..40).map(|i| i as f32).collect();
        assert_eq!(received, expected);
    }

    #[test]
    fn test_traces_to_dataframe() {
        let directory = SinkDirectory::new();
        let sinks = directory.rebind(&config(&["A", "B"]), &TraceFactory { len: 5 });
        sinks[1].lock().unwrap().push(0.5);

        let df = traces_to_dataframe(&directory.snapshot()).unwrap();
        assert_eq!(df.height(), 5);
        assert_eq!(df.width(), 3);
        let b = df.column("B").unwrap().f32().unwrap();
        assert_eq!(b.get(4), Some(0.5));
    }
}
