//! Correlation bookkeeping between host API calls and device activities
//!
//! Three maps tie an asynchronous device record back to the API call that
//! caused it:
//!
//! * host-op map: host correlation id → the record the dispatcher
//!   published (calling-context nodes + the producing thread's activity
//!   channel)
//! * correlation-id map: vendor correlation id → host correlation id,
//!   bound when the vendor delivers an external-correlation record; later
//!   extended with the kernel's device id and interval so PC-sampling-info
//!   records can look them up
//! * function-id map: vendor function id → normalized function entry pc,
//!   filled from function activity records
//!
//! The record types flowing through the per-thread channels also live here.

use std::sync::Arc;

use crate::activity::GpuActivity;
use crate::channel::BiChannel;
use crate::concurrent_map::SplayMap;
use crate::ip::NormalizedIp;
use crate::sink::{CctNodeId, GpuOpKind};

/// A translated activity paired with the node it attributes to; consumed by
/// the producing thread at its own sample points.
#[derive(Debug, Clone)]
pub struct AttributedActivity {
    pub node: CctNodeId,
    pub activity: GpuActivity,
}

pub type ActivityChannel = BiChannel<AttributedActivity>;

/// Published on the issuing thread's correlation channel at API enter;
/// consumed by the monitor thread before it scans an activity buffer.
#[derive(Debug, Clone)]
pub struct CorrelationRecord {
    pub host_op_id: u64,
    pub op_kind: GpuOpKind,
    /// Node of the API call site
    pub api_node: CctNodeId,
    /// Synthetic child of the call site for the op class
    pub placeholder_node: CctNodeId,
    /// Leaf at the launched kernel's entry pc, when resolved
    pub kernel_ip_node: Option<CctNodeId>,
    /// The issuing thread's activity channel
    pub activity_channel: Arc<ActivityChannel>,
}

impl CorrelationRecord {
    /// Node that span-level activities attribute to.
    pub fn attribution_node(&self) -> CctNodeId {
        self.kernel_ip_node.unwrap_or(self.placeholder_node)
    }
}

pub type CorrelationChannel = BiChannel<CorrelationRecord>;

/// Entry of the vendor-correlation-id map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationEntry {
    pub host_op_id: u64,
    pub device_id: u32,
    pub start: u64,
    pub end: u64,
}

/// Vendor correlation id → host correlation id (plus kernel interval).
pub struct CorrelationIdMap {
    map: SplayMap<u32, CorrelationEntry>,
}

impl CorrelationIdMap {
    pub fn new() -> Self {
        CorrelationIdMap {
            map: SplayMap::new(),
        }
    }

    /// Bind a vendor id to a host id. The vendor reports each binding once;
    /// a repeated id is a replay of the same binding, so the first bound
    /// entry is kept even when two completion threads race it.
    pub fn insert(&self, correlation_id: u32, host_op_id: u64) {
        self.map.get_or_insert_with(correlation_id, || CorrelationEntry {
            host_op_id,
            device_id: 0,
            start: 0,
            end: 0,
        });
    }

    pub fn lookup(&self, correlation_id: u32) -> Option<CorrelationEntry> {
        self.map.get(&correlation_id)
    }

    /// Record the kernel's device and interval on its correlation entry.
    pub fn kernel_update(&self, correlation_id: u32, device_id: u32, start: u64, end: u64) {
        self.map.with(&correlation_id, |entry| {
            entry.device_id = device_id;
            entry.start = start;
            entry.end = end;
        });
    }

    pub fn remove(&self, correlation_id: u32) {
        self.map.remove(&correlation_id);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for CorrelationIdMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Host correlation id → correlation record.
pub struct HostOpMap {
    map: SplayMap<u64, Arc<CorrelationRecord>>,
}

impl HostOpMap {
    pub fn new() -> Self {
        HostOpMap {
            map: SplayMap::new(),
        }
    }

    /// Insert a swept correlation record. Host ids are unique by
    /// construction (atomic counter), so a duplicate means the same record
    /// was swept twice; the first copy is kept.
    pub fn insert(&self, record: CorrelationRecord) {
        let host_op_id = record.host_op_id;
        self.map
            .get_or_insert_with(host_op_id, || Arc::new(record));
    }

    pub fn lookup(&self, host_op_id: u64) -> Option<Arc<CorrelationRecord>> {
        self.map.get(&host_op_id)
    }

    pub fn remove(&self, host_op_id: u64) {
        self.map.remove(&host_op_id);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for HostOpMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Vendor function id → normalized function entry pc.
pub struct FunctionIdMap {
    map: SplayMap<u32, NormalizedIp>,
}

impl FunctionIdMap {
    pub fn new() -> Self {
        FunctionIdMap {
            map: SplayMap::new(),
        }
    }

    /// Record (or refresh) a function's entry pc.
    pub fn insert(&self, function_id: u32, pc: NormalizedIp) {
        self.map.upsert(function_id, pc);
    }

    pub fn lookup(&self, function_id: u32) -> Option<NormalizedIp> {
        self.map.get(&function_id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for FunctionIdMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_binding() {
        let map = CorrelationIdMap::new();
        map.insert(100, 0x8000_0000_0000_0001);
        let entry = map.lookup(100).unwrap();
        assert_eq!(entry.host_op_id, 0x8000_0000_0000_0001);
        assert_eq!(entry.device_id, 0);

        // replayed binding is ignored
        map.insert(100, 999);
        assert_eq!(map.lookup(100).unwrap().host_op_id, 0x8000_0000_0000_0001);
    }

    #[test]
    fn test_kernel_update() {
        let map = CorrelationIdMap::new();
        map.insert(100, 1);
        map.kernel_update(100, 2, 1_000, 2_000);
        let entry = map.lookup(100).unwrap();
        assert_eq!(entry.device_id, 2);
        assert_eq!(entry.start, 1_000);
        assert_eq!(entry.end, 2_000);

        // updating an unknown id is harmless
        map.kernel_update(999, 0, 0, 0);
    }

    #[test]
    fn test_function_map_refresh() {
        let map = FunctionIdMap::new();
        map.insert(5, NormalizedIp::new(1, 0x100));
        map.insert(5, NormalizedIp::new(1, 0x200));
        assert_eq!(map.lookup(5), Some(NormalizedIp::new(1, 0x200)));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_host_op_map_round_trip() {
        let map = HostOpMap::new();
        let channel = Arc::new(ActivityChannel::new());
        map.insert(CorrelationRecord {
            host_op_id: 42,
            op_kind: GpuOpKind::Kernel,
            api_node: 1,
            placeholder_node: 2,
            kernel_ip_node: Some(3),
            activity_channel: channel,
        });
        let record = map.lookup(42).unwrap();
        assert_eq!(record.attribution_node(), 3);
        assert!(map.lookup(41).is_none());

        map.remove(42);
        assert!(map.lookup(42).is_none());
    }

    #[test]
    fn test_attribution_node_falls_back_to_placeholder() {
        let record = CorrelationRecord {
            host_op_id: 1,
            op_kind: GpuOpKind::Copy,
            api_node: 1,
            placeholder_node: 2,
            kernel_ip_node: None,
            activity_channel: Arc::new(ActivityChannel::new()),
        };
        assert_eq!(record.attribution_node(), 2);
    }
}
