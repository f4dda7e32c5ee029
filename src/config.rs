//! Configuration for the GPU profiling subsystem
//!
//! The embedding tool owns argument/environment parsing; this crate only
//! consumes a populated [`Config`]. Defaults mirror the values the subsystem
//! has always run with in production: 16 MiB activity buffers, 1024-record
//! sanitizer buffers, unsampled tracing.

use std::path::PathBuf;

/// Activity buffer handed to the vendor on each buffer request (16 MiB)
pub const ACTIVITY_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Required alignment of activity buffers
pub const ACTIVITY_BUFFER_ALIGNMENT: usize = 8;

/// Trace events buffered per stream before the worker is signalled
pub const TRACE_SIGNAL_THRESHOLD: u64 = 100;

/// Subsystem configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Measurement output directory; cubins are emitted under
    /// `<output_dir>/cubins/`
    pub output_dir: PathBuf,

    /// PC sampling period exponent handed to the vendor, `None` disables
    /// PC sampling for new contexts
    pub pc_sampling_frequency: Option<i32>,

    /// Trace sampling frequency in nanoseconds; `None` emits every event
    pub trace_frequency_ns: Option<u64>,

    /// Capacity (records) of the device-resident sanitizer buffer
    pub sanitizer_record_count: usize,

    /// Capacity (records) of each address-diff analysis buffer
    pub sanitizer_addr_record_count: usize,

    /// Observe one block in every `block_sampling_frequency`; 0 observes all
    pub block_sampling_frequency: u32,

    /// Number of blocks for the on-device analysis kernel; 0 keeps the
    /// analysis on the host
    pub analysis_blocks: u32,

    /// Drain sanitizer buffers on a background thread instead of inline
    pub analysis_async: bool,

    /// Directory holding the sanitizer patch fatbins
    pub patch_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            output_dir: PathBuf::from("."),
            pc_sampling_frequency: None,
            trace_frequency_ns: None,
            sanitizer_record_count: 1024,
            sanitizer_addr_record_count: 1024,
            block_sampling_frequency: 0,
            analysis_blocks: 0,
            analysis_async: false,
            patch_dir: PathBuf::from("."),
        }
    }
}

impl Config {
    /// Directory cubins are emitted to
    pub fn cubin_dir(&self) -> PathBuf {
        self.output_dir.join("cubins")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sanitizer_record_count, 1024);
        assert_eq!(config.block_sampling_frequency, 0);
        assert!(config.trace_frequency_ns.is_none());
        assert!(!config.analysis_async);
    }

    #[test]
    fn test_cubin_dir() {
        let config = Config {
            output_dir: PathBuf::from("/tmp/measurements"),
            ..Config::default()
        };
        assert_eq!(config.cubin_dir(), PathBuf::from("/tmp/measurements/cubins"));
    }

    #[test]
    fn test_buffer_constants() {
        assert_eq!(ACTIVITY_BUFFER_SIZE, 16 * 1024 * 1024);
        assert_eq!(ACTIVITY_BUFFER_ALIGNMENT, 8);
    }
}
