//! Process-wide profiling counters
//!
//! Cheap atomic counters incremented from vendor callback threads and read
//! at shutdown. The dropped-activity counter backs the drop metric the
//! monitor attributes to a global node; it is monotonically nondecreasing.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the monitor, dispatcher and sanitizer
#[derive(Debug, Default)]
pub struct ProfilingStats {
    /// Activity records successfully translated
    activities_processed: AtomicU64,
    /// Records the vendor reported as dropped before delivery
    activities_dropped: AtomicU64,
    /// Distinct cubin files emitted to the measurement directory
    cubins_written: AtomicU64,
    /// Sanitizer records drained from device buffers
    sanitizer_records: AtomicU64,
}

impl ProfilingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_processed(&self, n: u64) {
        self.activities_processed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_dropped(&self, n: u64) {
        self.activities_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_cubin_written(&self) {
        self.cubins_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_sanitizer_records(&self, n: u64) {
        self.sanitizer_records.fetch_add(n, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.activities_processed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.activities_dropped.load(Ordering::Relaxed)
    }

    pub fn cubins_written(&self) -> u64 {
        self.cubins_written.load(Ordering::Relaxed)
    }

    pub fn sanitizer_records(&self) -> u64 {
        self.sanitizer_records.load(Ordering::Relaxed)
    }
}
