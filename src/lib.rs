//! Centinela - NVIDIA GPU activity profiling subsystem
//!
//! This library implements the GPU half of a calling-context profiler: it
//! intercepts host-side CUDA driver/runtime calls, correlates the
//! asynchronous device activity the vendor tracing library delivers back
//! to the calling context that caused it, and attributes metrics, traces
//! and (optionally) sanitizer memory-access records to the embedding
//! tool's calling-context tree.

pub mod activity;
pub mod analysis;
pub mod channel; // lock-free bidirectional channels between pipeline threads
pub mod concurrent_map; // spinlock-guarded splay maps keyed by integer ids
pub mod config;
pub mod correlation;
pub mod cubin_store; // content-addressed cubin cache
pub mod cubin_symbols; // device-binary (ELF) symbol relocation
pub mod device_map;
pub mod dispatcher; // host-side vendor callback handling
pub mod errors;
pub mod ip;
pub mod monitor; // activity buffer protocol
pub mod profiler;
pub mod relocation;
pub mod sanitizer; // GPU-resident memory-access sanitization
pub mod sink;
pub mod stats;
pub mod trace; // per-stream trace workers
pub mod translate;
pub mod vendor;

pub use ip::NormalizedIp;
pub use profiler::{GpuProfiler, Sinks};

/// Install a default `tracing` subscriber honoring `RUST_LOG`.
///
/// Embedders that already own a subscriber skip this; the call is a no-op
/// when a global subscriber is installed.
pub fn init_diagnostics() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
