use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Default progress notification interval.
const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// Unit of a progress counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressUnit {
    Bytes,
    Count,
}

/// Receiver of progress events.
///
/// `processed` is `0` at stage start, a running value on each update, and
/// may be `-1` together with `errored = true` to abandon the current value.
pub trait ProgressSink: Send + Sync {
    fn progress(&self, name: &str, processed: i64, total: i64, unit: ProgressUnit, errored: bool);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn progress(&self, _: &str, _: i64, _: i64, _: ProgressUnit, _: bool) {}
}

/// Latest known state of one named progress counter.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub name: String,
    pub processed: i64,
    pub total: i64,
    pub unit: ProgressUnit,
    pub done: bool,
    pub errored: bool,
    /// Sliding-window rate; always 0 for [`ProgressUnit::Count`].
    pub bytes_per_second: f64,
}

/// Callback invoked with a changed progress snapshot.
pub type ProgressCallback = Box<dyn Fn(&ProgressSnapshot) + Send + Sync>;

/// Collects progress events per name and notifies callbacks periodically.
pub struct ProgressTracker {
    inner: Arc<RwLock<TrackerInner>>,
    stop: Arc<Mutex<Option<tokio::sync::oneshot::Sender<()>>>>,
}

struct TrackerInner {
    callbacks: Vec<ProgressCallback>,
    entries: HashMap<String, TrackedEntry>,
    interval: Duration,
}

struct TrackedEntry {
    snapshot: ProgressSnapshot,
    rate: RateWindow,
    dirty: bool,
}

impl TrackerInner {
    fn flush_dirty(&mut self) {
        let Self {
            callbacks, entries, ..
        } = self;
        for entry in entries.values_mut().filter(|e| e.dirty) {
            entry.dirty = false;
            if entry.snapshot.unit == ProgressUnit::Bytes {
                entry.snapshot.bytes_per_second = entry.rate.bytes_per_second();
            }
            for cb in callbacks.iter() {
                cb(&entry.snapshot);
            }
        }
    }
}

impl ProgressTracker {
    /// Creates a new tracker with the given notification interval.
    ///
    /// If `interval` is `None`, defaults to 500 ms.
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(TrackerInner {
                callbacks: Vec::new(),
                entries: HashMap::new(),
                interval: interval.unwrap_or(DEFAULT_INTERVAL),
            })),
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Registers a progress callback.
    pub fn on_progress(&self, callback: ProgressCallback) {
        let mut inner = self.inner.write().unwrap();
        inner.callbacks.push(callback);
    }

    /// Returns the latest snapshot for `name`.
    pub fn snapshot(&self, name: &str) -> Option<ProgressSnapshot> {
        let inner = self.inner.read().unwrap();
        inner.entries.get(name).map(|e| {
            let mut snap = e.snapshot.clone();
            if snap.unit == ProgressUnit::Bytes {
                snap.bytes_per_second = e.rate.bytes_per_second();
            }
            snap
        })
    }

    /// Returns all snapshots sorted by name.
    pub fn snapshots(&self) -> Vec<ProgressSnapshot> {
        let inner = self.inner.read().unwrap();
        let mut all: Vec<_> = inner.entries.values().map(|e| e.snapshot.clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Sends pending notifications immediately.
    pub fn flush(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.flush_dirty();
    }

    /// Starts periodic progress notifications in a background tokio task.
    ///
    /// Call [`stop`](Self::stop) to cancel.
    pub fn start(&self) {
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        {
            let mut stop = self.stop.lock().unwrap();
            drop(stop.take());
            *stop = Some(tx);
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let interval = inner.read().unwrap().interval;
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        inner.write().unwrap().flush_dirty();
                    }
                    _ = &mut rx => {
                        inner.write().unwrap().flush_dirty();
                        break;
                    }
                }
            }
        });
    }

    /// Stops the periodic notification task after a final flush.
    pub fn stop(&self) {
        let mut stop = self.stop.lock().unwrap();
        if let Some(tx) = stop.take() {
            let _ = tx.send(());
        }
    }
}

impl ProgressSink for ProgressTracker {
    fn progress(&self, name: &str, processed: i64, total: i64, unit: ProgressUnit, errored: bool) {
        let mut inner = self.inner.write().unwrap();
        let entry = inner
            .entries
            .entry(name.to_string())
            .or_insert_with(|| TrackedEntry {
                snapshot: ProgressSnapshot {
                    name: name.to_string(),
                    processed: 0,
                    total,
                    unit,
                    done: false,
                    errored: false,
                    bytes_per_second: 0.0,
                },
                rate: RateWindow::new(),
                dirty: true,
            });

        let snap = &mut entry.snapshot;
        snap.total = total;
        snap.unit = unit;
        if processed >= 0 {
            let delta = processed - snap.processed;
            if unit == ProgressUnit::Bytes && delta > 0 {
                entry.rate.record(delta);
            }
            snap.processed = processed;
        }
        if errored {
            snap.errored = true;
        } else if processed >= 0 && processed >= total {
            snap.done = true;
        }
        entry.dirty = true;
    }
}

// ---------------------------------------------------------------------------
// RateWindow
// ---------------------------------------------------------------------------

const RATE_WINDOW: Duration = Duration::from_secs(5);
const RATE_SAMPLES: usize = 64;

/// Byte rate over the last few seconds of samples.
struct RateWindow {
    samples: VecDeque<(Instant, i64)>,
}

impl RateWindow {
    fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(RATE_SAMPLES),
        }
    }

    fn record(&mut self, bytes: i64) {
        self.record_at(Instant::now(), bytes);
    }

    fn record_at(&mut self, at: Instant, bytes: i64) {
        self.samples.push_back((at, bytes));
        while self.samples.len() > RATE_SAMPLES {
            self.samples.pop_front();
        }
        while let Some(&(first, _)) = self.samples.front()
            && at.duration_since(first) > RATE_WINDOW
        {
            self.samples.pop_front();
        }
    }

    /// 0.0 until two samples span a non-zero interval.
    fn bytes_per_second(&self) -> f64 {
        let (Some(&(first, _)), Some(&(last, _))) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let elapsed = last.duration_since(first).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        let bytes: i64 = self.samples.iter().map(|&(_, b)| b).sum();
        bytes as f64 / elapsed
    }
}
