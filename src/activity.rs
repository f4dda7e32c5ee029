//! Internal GPU activity schema
//!
//! The translation layer turns vendor records into these variants; sinks
//! downstream only ever see this schema. Translation is pure in its inputs
//! (modulo map lookups), so re-translating a vendor record yields an
//! identical value; tests rely on that.

use serde::{Deserialize, Serialize};

use crate::ip::NormalizedIp;

/// Time interval in nanoseconds, device clock domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
}

impl Interval {
    pub fn new(start: u64, end: u64) -> Self {
        Interval { start, end }
    }

    pub fn duration(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }
}

/// Identifiers tying an activity back to its origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActivityIds {
    pub correlation_id: u32,
    pub device_id: u32,
    pub context_id: u32,
    pub stream_id: u32,
}

/// Why a sampled warp was not issuing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StallReason {
    None,
    InstructionFetch,
    ExecDependency,
    MemoryDependency,
    Texture,
    Sync,
    ConstantMemory,
    PipeBusy,
    MemoryThrottle,
    NotSelected,
    Other,
    Sleeping,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemcpyKind {
    HostToDevice,
    DeviceToHost,
    HostToArray,
    ArrayToHost,
    ArrayToArray,
    ArrayToDevice,
    DeviceToArray,
    DeviceToDevice,
    HostToHost,
    PeerToPeer,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncKind {
    EventSynchronize,
    StreamWaitEvent,
    StreamSynchronize,
    ContextSynchronize,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GlobalAccessType {
    LoadCached,
    LoadUncached,
    Store,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SharedAccessType {
    Load,
    Store,
}

/// One translated activity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GpuActivity {
    PcSample {
        ids: ActivityIds,
        pc: NormalizedIp,
        stall_reason: StallReason,
        samples: u32,
        latency_samples: u32,
    },
    PcSampleInfo {
        correlation_id: u32,
        total_samples: u64,
        dropped_samples: u64,
        period_cycles: u64,
        full_sm_samples: u64,
    },
    Memcpy {
        ids: ActivityIds,
        kind: MemcpyKind,
        bytes: u64,
        interval: Interval,
    },
    Kernel {
        ids: ActivityIds,
        blocks: u32,
        block_threads: u32,
        thread_registers: u32,
        block_shared_memory: u32,
        dynamic_shared_memory: u32,
        static_shared_memory: u32,
        local_memory_total: u32,
        active_warps_per_sm: u32,
        max_active_warps_per_sm: u32,
        interval: Interval,
    },
    GlobalAccess {
        ids: ActivityIds,
        pc: NormalizedIp,
        access_type: GlobalAccessType,
        bytes: u64,
        l2_transactions: u64,
        theoretical_l2_transactions: u64,
    },
    SharedAccess {
        ids: ActivityIds,
        pc: NormalizedIp,
        access_type: SharedAccessType,
        bytes: u64,
        shared_transactions: u64,
        theoretical_shared_transactions: u64,
    },
    Branch {
        ids: ActivityIds,
        pc: NormalizedIp,
        diverged: u32,
        executed: u32,
    },
    Sync {
        ids: ActivityIds,
        kind: SyncKind,
        event_id: u32,
        interval: Interval,
    },
    Memory {
        memory_kind: u32,
        bytes: u64,
        interval: Interval,
    },
    Memset {
        ids: ActivityIds,
        memory_kind: u32,
        bytes: u64,
        interval: Interval,
    },
    Function {
        function_id: u32,
        pc: NormalizedIp,
    },
    ExternalCorrelation {
        vendor_correlation_id: u32,
        host_correlation_id: u64,
    },
    CdpKernel {
        ids: ActivityIds,
        interval: Interval,
    },
    Event {
        ids: ActivityIds,
        event_id: u32,
    },
    Unknown,
}

impl GpuActivity {
    /// The normalized pc carried by instruction-level variants.
    pub fn pc(&self) -> Option<NormalizedIp> {
        match self {
            GpuActivity::PcSample { pc, .. }
            | GpuActivity::GlobalAccess { pc, .. }
            | GpuActivity::SharedAccess { pc, .. }
            | GpuActivity::Branch { pc, .. }
            | GpuActivity::Function { pc, .. } => Some(*pc),
            _ => None,
        }
    }

    /// The vendor correlation id, where one exists.
    pub fn correlation_id(&self) -> Option<u32> {
        match self {
            GpuActivity::PcSample { ids, .. }
            | GpuActivity::Memcpy { ids, .. }
            | GpuActivity::Kernel { ids, .. }
            | GpuActivity::GlobalAccess { ids, .. }
            | GpuActivity::SharedAccess { ids, .. }
            | GpuActivity::Branch { ids, .. }
            | GpuActivity::Sync { ids, .. }
            | GpuActivity::Memset { ids, .. }
            | GpuActivity::CdpKernel { ids, .. }
            | GpuActivity::Event { ids, .. } => Some(ids.correlation_id),
            GpuActivity::PcSampleInfo { correlation_id, .. } => Some(*correlation_id),
            GpuActivity::ExternalCorrelation {
                vendor_correlation_id,
                ..
            } => Some(*vendor_correlation_id),
            GpuActivity::Memory { .. } | GpuActivity::Function { .. } | GpuActivity::Unknown => {
                None
            }
        }
    }

    /// The device interval for span-like variants.
    pub fn interval(&self) -> Option<Interval> {
        match self {
            GpuActivity::Memcpy { interval, .. }
            | GpuActivity::Kernel { interval, .. }
            | GpuActivity::Sync { interval, .. }
            | GpuActivity::Memory { interval, .. }
            | GpuActivity::Memset { interval, .. }
            | GpuActivity::CdpKernel { interval, .. } => Some(*interval),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_duration() {
        assert_eq!(Interval::new(1_000, 2_000).duration(), 1_000);
        // clamped rather than wrapped
        assert_eq!(Interval::new(2_000, 1_000).duration(), 0);
    }

    #[test]
    fn test_pc_accessor() {
        let sample = GpuActivity::PcSample {
            ids: ActivityIds::default(),
            pc: NormalizedIp::new(1, 0x40),
            stall_reason: StallReason::Sync,
            samples: 3,
            latency_samples: 1,
        };
        assert_eq!(sample.pc(), Some(NormalizedIp::new(1, 0x40)));
        assert!(GpuActivity::Unknown.pc().is_none());
    }

    #[test]
    fn test_correlation_accessor() {
        let memcpy = GpuActivity::Memcpy {
            ids: ActivityIds {
                correlation_id: 100,
                ..ActivityIds::default()
            },
            kind: MemcpyKind::HostToDevice,
            bytes: 4096,
            interval: Interval::new(10, 20),
        };
        assert_eq!(memcpy.correlation_id(), Some(100));
        assert!(GpuActivity::Unknown.correlation_id().is_none());
    }

    #[test]
    fn test_translation_is_value_comparable() {
        let a = GpuActivity::ExternalCorrelation {
            vendor_correlation_id: 100,
            host_correlation_id: 0x8000_0000_0000_0001,
        };
        let b = a.clone();
        assert_eq!(a, b);
    }
}
