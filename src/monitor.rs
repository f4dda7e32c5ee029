//! Activity buffer protocol
//!
//! The vendor invokes two callbacks on its own monitor thread: a buffer
//! request, answered with a 16 MiB 8-byte-aligned scratch allocation, and a
//! buffer completion delivering the used prefix plus the originating
//! context/stream. Completion is where the pipeline's two halves meet:
//!
//! 1. sweep every registered correlation channel, so records published by
//!    app threads before the activities arrived are in the host-op map,
//! 2. cursor-scan the buffer, translating each record and pushing it onto
//!    the activity channel of the thread that issued the operation,
//! 3. account dropped records,
//! 4. free the buffer.
//!
//! The monitor exclusively owns in-flight buffers between request and
//! completion.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::activity::GpuActivity;
use crate::channel::ChannelSet;
use crate::config::{ACTIVITY_BUFFER_ALIGNMENT, ACTIVITY_BUFFER_SIZE};
use crate::correlation::{
    AttributedActivity, CorrelationIdMap, CorrelationRecord, HostOpMap,
};
use crate::errors::alloc_fatal;
use crate::sink::CctSink;
use crate::stats::ProfilingStats;
use crate::trace::TraceSubsystem;
use crate::translate::Translator;
use crate::vendor::{check, ActivityBuffer, TracingApi};

/// Heap allocation with explicit alignment, reused as vendor scratch.
struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer is plain bytes, owned by whoever holds the struct
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    fn new(size: usize, align: usize) -> Self {
        let layout = match Layout::from_size_align(size, align) {
            Ok(layout) => layout,
            Err(_) => alloc_fatal("activity buffer layout"),
        };
        // SAFETY: layout has non-zero size
        let raw = unsafe { alloc(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            alloc_fatal("activity buffer");
        };
        AlignedBuffer { ptr, layout }
    }

    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated with this layout in `new`
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Outstanding scratch buffer handed to the vendor.
pub struct BufferRequest {
    pub id: u64,
    pub ptr: *mut u8,
    pub size: usize,
}

/// Implements the vendor's buffer-request / buffer-complete callbacks.
pub struct Monitor {
    tracing: Arc<dyn TracingApi>,
    translator: Translator,
    correlation_map: Arc<CorrelationIdMap>,
    host_op_map: Arc<HostOpMap>,
    channel_set: Arc<ChannelSet<CorrelationRecord>>,
    cct: Arc<dyn CctSink>,
    trace: Arc<TraceSubsystem>,
    stats: Arc<ProfilingStats>,
    in_flight: crate::concurrent_map::SplayMap<u64, Arc<AlignedBuffer>>,
    next_buffer_id: AtomicU64,
}

impl Monitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tracing: Arc<dyn TracingApi>,
        translator: Translator,
        correlation_map: Arc<CorrelationIdMap>,
        host_op_map: Arc<HostOpMap>,
        channel_set: Arc<ChannelSet<CorrelationRecord>>,
        cct: Arc<dyn CctSink>,
        trace: Arc<TraceSubsystem>,
        stats: Arc<ProfilingStats>,
    ) -> Self {
        Monitor {
            tracing,
            translator,
            correlation_map,
            host_op_map,
            channel_set,
            cct,
            trace,
            stats,
            in_flight: crate::concurrent_map::SplayMap::new(),
            next_buffer_id: AtomicU64::new(1),
        }
    }

    /// Vendor buffer-request callback: allocate scratch.
    pub fn buffer_request(&self) -> BufferRequest {
        let id = self.next_buffer_id.fetch_add(1, Ordering::Relaxed);
        let buffer = Arc::new(AlignedBuffer::new(
            ACTIVITY_BUFFER_SIZE,
            ACTIVITY_BUFFER_ALIGNMENT,
        ));
        let ptr = buffer.as_ptr();
        self.in_flight.insert(id, buffer);
        BufferRequest {
            id,
            ptr,
            size: ACTIVITY_BUFFER_SIZE,
        }
    }

    /// Sweep correlation channels into the host-op map.
    pub fn sweep_correlations(&self) -> usize {
        let host_op_map = &self.host_op_map;
        self.channel_set
            .consume_all(|record| host_op_map.insert(record))
    }

    /// Vendor buffer-complete callback.
    pub fn buffer_complete(&self, buffer: &ActivityBuffer) {
        // correlation records published before these activities must be
        // visible before translation starts
        self.sweep_correlations();

        let mut processed: u64 = 0;
        if buffer.valid_size > 0 {
            let mut cursor = 0usize;
            while let Some(record) = self.tracing.next_record(buffer, &mut cursor) {
                let activity = self.translator.translate(&record, &*self.tracing);
                self.route(activity);
                processed += 1;
            }
        }
        self.stats.add_processed(processed);

        let dropped = check(
            self.tracing
                .dropped_records(buffer.context_id, buffer.stream_id),
        );
        if dropped != 0 {
            self.stats.add_dropped(dropped);
            tracing::warn!(
                dropped,
                context_id = buffer.context_id,
                "vendor dropped activity records"
            );
        }

        self.release_buffer(buffer.id);
    }

    fn release_buffer(&self, id: u64) {
        self.in_flight.remove(&id);
    }

    /// Deliver one translated activity to the thread that caused it.
    fn route(&self, activity: GpuActivity) {
        match &activity {
            GpuActivity::ExternalCorrelation {
                vendor_correlation_id,
                host_correlation_id,
            } => {
                self.correlation_map
                    .insert(*vendor_correlation_id, *host_correlation_id);
                return;
            }
            // function records only feed the function-id map
            GpuActivity::Function { .. } => return,
            // no correlation id to route by
            GpuActivity::Memory { .. } | GpuActivity::Unknown => return,
            _ => {}
        }

        let Some(correlation_id) = activity.correlation_id() else {
            return;
        };
        let Some(entry) = self.correlation_map.lookup(correlation_id) else {
            // missing binding: counted, not attributed
            tracing::debug!(correlation_id, "activity before correlation binding");
            return;
        };
        let Some(record) = self.host_op_map.lookup(entry.host_op_id) else {
            tracing::debug!(
                host_op_id = entry.host_op_id,
                "activity for unswept correlation record"
            );
            return;
        };

        let node = match activity.pc() {
            // instruction-level activity: leaf at the sampled pc
            Some(pc) if pc.is_resolved() => self
                .cct
                .insert_normalized_ip(record.placeholder_node, pc),
            _ => record.attribution_node(),
        };

        // kernel and copy spans feed the per-stream trace
        match &activity {
            GpuActivity::Kernel { ids, interval, .. }
            | GpuActivity::Memcpy { ids, interval, .. } => {
                self.trace
                    .append(ids.stream_id, node, interval.start, interval.end);
            }
            _ => {}
        }

        record
            .activity_channel
            .produce(AttributedActivity { node, activity });
    }

    /// Force out everything the vendor has buffered, then make swept
    /// correlation state consistent. Run at shutdown and at thread flush
    /// points.
    pub fn flush(&self) {
        check(self.tracing.flush_all());
        self.sweep_correlations();
    }

    /// Flush, then stop the trace workers.
    pub fn shutdown(&self) {
        self.flush();
        self.trace.shutdown();
    }

    pub fn in_flight_buffers(&self) -> usize {
        self.in_flight.len()
    }
}
