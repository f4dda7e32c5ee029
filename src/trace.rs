//! Per-stream trace workers
//!
//! Every device stream that produces kernel or copy activity gets a
//! dedicated worker thread and a trace channel. The monitor pushes
//! `(start, end, node)` events; the worker drains them, applies the
//! sampling frequency, and appends surviving events to the trace sink in
//! nondecreasing start order.
//!
//! Backpressure: the worker sleeps on a condition variable and is signalled
//! once 100 events have accumulated, so a chatty stream cannot grow its
//! channel without bound while a quiet one costs nothing.
//!
//! Shutdown is cooperative: a global stop flag plus a broadcast, then a
//! wait for every worker to drain and decrement the live counter.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::channel::BiChannel;
use crate::concurrent_map::SplayMap;
use crate::config::TRACE_SIGNAL_THRESHOLD;
use crate::sink::{CctNodeId, TraceSink};

/// One interval attributed to a calling-context node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEvent {
    pub node: CctNodeId,
    pub start: u64,
    pub end: u64,
}

struct StreamWorker {
    channel: Arc<BiChannel<TraceEvent>>,
    /// events produced since the last signal
    pending: AtomicU64,
    wake: Mutex<bool>,
    cond: Condvar,
}

impl StreamWorker {
    fn signal(&self) {
        if let Ok(mut wake) = self.wake.lock() {
            *wake = true;
        }
        self.cond.notify_one();
    }
}

/// Decides which events of one stream are emitted.
///
/// The first event is always emitted and pins `stream_start` just before
/// its start. A later event `[start, end]` is emitted iff the next
/// frequency pivot after `stream_start` falls inside it, which yields at
/// most one emission per frequency interval while preserving interval
/// coverage.
struct FrequencyFilter {
    frequency: Option<u64>,
    stream_start: Option<u64>,
}

impl FrequencyFilter {
    fn new(frequency: Option<u64>) -> Self {
        FrequencyFilter {
            // zero would pivot on every nanosecond; treat as unsampled
            frequency: frequency.filter(|&f| f > 0),
            stream_start: None,
        }
    }

    fn emit(&mut self, start: u64, end: u64) -> bool {
        let Some(stream_start) = self.stream_start else {
            self.stream_start = Some(start.saturating_sub(1));
            return true;
        };
        let Some(frequency) = self.frequency else {
            return true;
        };
        let intervals = (start - stream_start - 1) / frequency + 1;
        let pivot = intervals * frequency + stream_start;
        pivot >= start && pivot <= end
    }
}

/// Owns one worker thread per stream.
pub struct TraceSubsystem {
    workers: SplayMap<u32, Arc<StreamWorker>>,
    /// serializes first-sight worker creation across monitor threads
    creation: Mutex<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
    live_workers: Arc<AtomicUsize>,
    frequency: Option<u64>,
    sink: Arc<dyn TraceSink>,
}

impl TraceSubsystem {
    pub fn new(frequency: Option<u64>, sink: Arc<dyn TraceSink>) -> Self {
        TraceSubsystem {
            workers: SplayMap::new(),
            creation: Mutex::new(()),
            handles: Mutex::new(Vec::new()),
            stop: Arc::new(AtomicBool::new(false)),
            live_workers: Arc::new(AtomicUsize::new(0)),
            frequency,
            sink,
        }
    }

    /// Push one event onto the stream's channel, creating the worker on
    /// first sight of the stream. Called from the monitor thread.
    pub fn append(&self, stream_id: u32, node: CctNodeId, start: u64, end: u64) {
        let worker = match self.workers.get(&stream_id) {
            Some(worker) => worker,
            None => self.spawn_worker(stream_id),
        };
        worker.channel.produce(TraceEvent { node, start, end });
        let pending = worker.pending.fetch_add(1, Ordering::Relaxed) + 1;
        if pending >= TRACE_SIGNAL_THRESHOLD {
            worker.pending.store(0, Ordering::Relaxed);
            worker.signal();
        }
    }

    fn spawn_worker(&self, stream_id: u32) -> Arc<StreamWorker> {
        let _creation = self.creation.lock().expect("trace creation lock");
        if let Some(worker) = self.workers.get(&stream_id) {
            return worker;
        }
        let worker = Arc::new(StreamWorker {
            channel: Arc::new(BiChannel::new()),
            pending: AtomicU64::new(0),
            wake: Mutex::new(false),
            cond: Condvar::new(),
        });
        self.workers.insert(stream_id, worker.clone());
        self.live_workers.fetch_add(1, Ordering::SeqCst);

        let stop = self.stop.clone();
        let live_workers = self.live_workers.clone();
        let sink = self.sink.clone();
        let frequency = self.frequency;
        let thread_worker = worker.clone();
        let handle = std::thread::Builder::new()
            .name(format!("gpu-trace-{stream_id}"))
            .spawn(move || {
                collect_stream(stream_id, &thread_worker, frequency, &*sink, &stop);
                live_workers.fetch_sub(1, Ordering::SeqCst);
            })
            .expect("spawn trace worker");
        self.handles.lock().expect("trace handles lock").push(handle);

        tracing::debug!(stream_id, "trace worker started");
        worker
    }

    pub fn stream_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop flag + broadcast; waits until every worker has drained.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        while self.live_workers.load(Ordering::SeqCst) != 0 {
            for worker in self.workers.values() {
                worker.signal();
            }
            std::thread::yield_now();
        }
        let handles = std::mem::take(&mut *self.handles.lock().expect("trace handles lock"));
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for TraceSubsystem {
    fn drop(&mut self) {
        // idempotent: after an explicit shutdown the worker count is zero
        // and the handle list is empty
        self.shutdown();
    }
}

/// Worker body: drain, filter, append; park between batches.
fn collect_stream(
    stream_id: u32,
    worker: &StreamWorker,
    frequency: Option<u64>,
    sink: &dyn TraceSink,
    stop: &AtomicBool,
) {
    let mut filter = FrequencyFilter::new(frequency);
    let mut batch: Vec<TraceEvent> = Vec::new();

    loop {
        let stopping = stop.load(Ordering::SeqCst);

        batch.clear();
        worker.channel.consume(|event| batch.push(event));
        // one steal delivers LIFO order; starts are nondecreasing at the
        // producer, so sorting a batch restores global emission order
        batch.sort_by_key(|event| event.start);
        for event in &batch {
            if filter.emit(event.start, event.end) {
                sink.append(stream_id, event.node, event.start, event.end);
            }
        }

        if stopping {
            break;
        }

        let guard = worker.wake.lock().expect("trace wake lock");
        let (mut guard, _) = worker
            .cond
            .wait_timeout_while(guard, std::time::Duration::from_millis(50), |wake| !*wake)
            .expect("trace wake wait");
        *guard = false;
    }

    tracing::debug!(stream_id, "trace worker drained");
}
