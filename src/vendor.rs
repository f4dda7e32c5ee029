//! Vendor tracing library and device API surfaces
//!
//! The subsystem consumes two vendor libraries: the tracing library
//! (callback subscription, activity buffers, external correlation, PC
//! sampling) and the device API (streams, module loading, memcpy). Both are
//! modeled as capability traits populated at startup by the embedding tool;
//! the dispatcher and monitor hold a handle and never resolve symbols
//! themselves. An embedder that cannot resolve a required vendor entry
//! point fails its own constructor, before any callback fires.
//!
//! Every vendor error is fatal to the process except the launched-function
//! probe, which degrades to "no kernel ip" (see
//! [`TracingApi::resolve_launched_function`]).

use serde::{Deserialize, Serialize};

use crate::device_map::DeviceProperties;
use crate::errors::vendor_fatal;

/// Opaque vendor handles. The subsystem never dereferences these; they are
/// tokens passed back into the capability traits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionHandle(pub u64);

/// Device memory pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(pub u64);

/// Error detail from a failed vendor call.
#[derive(Debug, Clone)]
pub struct VendorError {
    pub function: &'static str,
    pub detail: String,
}

pub type VendorResult<T> = Result<T, VendorError>;

/// Unwrap a vendor result or terminate the process with its diagnostic.
pub fn check<T>(result: VendorResult<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => vendor_fatal(err.function, &err.detail),
    }
}

/// Callback domains the dispatcher subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackDomain {
    Resource,
    DriverApi,
    RuntimeApi,
}

/// Which side of an API call a callback reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackSite {
    Enter,
    Exit,
}

/// Instrumented driver-level entry points, collapsed from the vendor's
/// per-function callback ids to the variants the dispatcher distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverApi {
    CtxSynchronize,
    EventSynchronize,
    StreamSynchronize,
    StreamWaitEvent,
    MemcpyHtoD,
    MemcpyDtoH,
    MemcpyDtoD,
    MemcpyOther,
    LaunchKernel,
    LaunchCooperativeKernel,
    /// Multi-device cooperative launch; its function pointer cannot be
    /// decoded, so no kernel ip is resolved
    LaunchCooperativeKernelMultiDevice,
    MemAlloc,
    MemFree,
}

/// Instrumented runtime-level entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeApi {
    DeviceSynchronize,
    EventSynchronize,
    StreamSynchronize,
    StreamWaitEvent,
    Memcpy,
    MemcpyHtoD,
    MemcpyDtoH,
    Launch,
    LaunchCooperativeKernel,
}

/// Payload of a resource-domain callback.
#[derive(Debug)]
pub enum ResourceEvent<'a> {
    ModuleLoaded {
        module_id: u32,
        cubin: &'a [u8],
    },
    ModuleUnloadStarting {
        module_id: u32,
        cubin: &'a [u8],
    },
    ContextCreated {
        context: ContextHandle,
    },
    ContextDestroyStarting {
        context: ContextHandle,
    },
}

/// Payload of a driver-domain callback.
#[derive(Debug, Clone, Copy)]
pub struct DriverCallback {
    pub api: DriverApi,
    pub site: CallbackSite,
    /// First launch parameter for kernel launches, when the vendor exposes
    /// the function pointer
    pub function: Option<FunctionHandle>,
}

/// Payload of a runtime-domain callback.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeCallback {
    pub api: RuntimeApi,
    pub site: CallbackSite,
}

/// PC sampling configuration; values are passed through to the vendor
/// unchanged (`period` stays zero, `period2` carries the frequency).
#[derive(Debug, Clone, Copy)]
pub struct PcSamplingConfig {
    pub period: i32,
    pub period2: i32,
}

/// Activity record kinds the monitor enables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    PcSampling,
    Memcpy,
    Kernel,
    Synchronization,
    Memory,
    Memset,
    GlobalAccess,
    SharedAccess,
    Branch,
    Function,
    ExternalCorrelation,
    CdpKernel,
    CudaEvent,
}

/// Activity records as delivered by the tracing library. Field names mirror
/// the vendor's wire layout; translation into [`crate::activity`] happens in
/// one place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VendorActivity {
    PcSampling(PcSamplingRecord),
    PcSamplingRecordInfo(PcSamplingInfoRecord),
    Memcpy(MemcpyRecord),
    Kernel(KernelRecord),
    GlobalAccess(GlobalAccessRecord),
    SharedAccess(SharedAccessRecord),
    Branch(BranchRecord),
    Synchronization(SyncRecord),
    Memory(MemoryRecord),
    Memset(MemsetRecord),
    Function(FunctionRecord),
    ExternalCorrelation(ExternalCorrelationRecord),
    CdpKernel(CdpKernelRecord),
    CudaEvent(CudaEventRecord),
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PcSamplingRecord {
    pub correlation_id: u32,
    pub function_id: u32,
    pub pc_offset: u32,
    pub samples: u32,
    pub latency_samples: u32,
    pub stall_reason: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PcSamplingInfoRecord {
    pub correlation_id: u32,
    pub total_samples: u64,
    pub dropped_samples: u64,
    pub sampling_period_in_cycles: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemcpyRecord {
    pub correlation_id: u32,
    pub context_id: u32,
    pub stream_id: u32,
    pub copy_kind: u32,
    pub bytes: u64,
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KernelRecord {
    pub correlation_id: u32,
    pub device_id: u32,
    pub context_id: u32,
    pub stream_id: u32,
    pub block_x: u32,
    pub block_y: u32,
    pub block_z: u32,
    pub registers_per_thread: u32,
    pub dynamic_shared_memory: u32,
    pub static_shared_memory: u32,
    pub local_memory_total: u32,
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlobalAccessRecord {
    pub correlation_id: u32,
    pub function_id: u32,
    pub pc_offset: u32,
    /// Low byte: access size; bit 8: load; bit 9: cached
    pub flags: u32,
    pub threads_executed: u32,
    pub l2_transactions: u64,
    pub theoretical_l2_transactions: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SharedAccessRecord {
    pub correlation_id: u32,
    pub function_id: u32,
    pub pc_offset: u32,
    /// Low byte: access size; bit 8: load
    pub flags: u32,
    pub threads_executed: u32,
    pub shared_transactions: u64,
    pub theoretical_shared_transactions: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BranchRecord {
    pub correlation_id: u32,
    pub function_id: u32,
    pub pc_offset: u32,
    pub diverged: u32,
    pub executed: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub correlation_id: u32,
    pub context_id: u32,
    pub stream_id: u32,
    pub cuda_event_id: u32,
    pub sync_type: u32,
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub memory_kind: u32,
    pub bytes: u64,
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemsetRecord {
    pub correlation_id: u32,
    pub context_id: u32,
    pub stream_id: u32,
    pub memory_kind: u32,
    pub bytes: u64,
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FunctionRecord {
    pub id: u32,
    pub module_id: u32,
    pub function_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExternalCorrelationRecord {
    pub correlation_id: u32,
    pub external_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CdpKernelRecord {
    pub correlation_id: u32,
    pub device_id: u32,
    pub context_id: u32,
    pub stream_id: u32,
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CudaEventRecord {
    pub correlation_id: u32,
    pub context_id: u32,
    pub stream_id: u32,
    pub event_id: u32,
}

/// A completed activity buffer delivered by the vendor.
#[derive(Debug)]
pub struct ActivityBuffer {
    /// Monitor-assigned identity of the scratch allocation
    pub id: u64,
    pub context_id: u32,
    pub stream_id: u32,
    pub valid_size: usize,
}

/// Capability surface of the vendor tracing library.
pub trait TracingApi: Send + Sync {
    fn enable_domain(&self, domain: CallbackDomain, enable: bool) -> VendorResult<()>;

    fn enable_activity_kind(
        &self,
        context: Option<ContextHandle>,
        kind: ActivityKind,
        enable: bool,
    ) -> VendorResult<()>;

    fn configure_pc_sampling(
        &self,
        context: ContextHandle,
        config: PcSamplingConfig,
    ) -> VendorResult<()>;

    /// Push a host correlation id onto the calling thread's external
    /// correlation stack.
    fn push_external_correlation(&self, id: u64) -> VendorResult<()>;

    /// Pop the calling thread's external correlation stack.
    fn pop_external_correlation(&self) -> VendorResult<u64>;

    /// Advance the cursor through a completed buffer, decoding one record.
    fn next_record(&self, buffer: &ActivityBuffer, cursor: &mut usize) -> Option<VendorActivity>;

    fn dropped_records(&self, context_id: u32, stream_id: u32) -> VendorResult<u64>;

    fn flush_all(&self) -> VendorResult<()>;

    fn device_timestamp(&self, context_id: u32) -> VendorResult<u64>;

    fn device_properties(&self, device_id: u32) -> VendorResult<DeviceProperties>;

    /// Probe the vendor's opaque function structure for the (cubin id,
    /// function index) pair of a launched kernel.
    ///
    /// The layout is reverse engineered and fragile; `None` means the probe
    /// failed and kernel-ip resolution is disabled for this launch. This is
    /// the only vendor failure that is not fatal.
    fn resolve_launched_function(&self, function: FunctionHandle) -> Option<(u32, u32)>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_passes_values_through() {
        assert_eq!(check::<u32>(Ok(7)), 7);
    }

    #[test]
    fn test_fake_correlation_stack_is_per_thread() {
        use super::testing::FakeTracing;

        let fake = FakeTracing::new();
        fake.push_external_correlation(1).unwrap();
        fake.push_external_correlation(2).unwrap();
        assert_eq!(fake.pop_external_correlation().unwrap(), 2);
        assert_eq!(fake.pop_external_correlation().unwrap(), 1);
        assert!(fake.pop_external_correlation().is_err());
    }

    #[test]
    fn test_fake_buffer_cursor() {
        use super::testing::FakeTracing;

        let fake = FakeTracing::new();
        fake.stage_buffer(
            1,
            vec![
                VendorActivity::Unknown,
                VendorActivity::ExternalCorrelation(ExternalCorrelationRecord {
                    correlation_id: 100,
                    external_id: 42,
                }),
            ],
        );
        let buffer = ActivityBuffer {
            id: 1,
            context_id: 0,
            stream_id: 0,
            valid_size: 2,
        };
        let mut cursor = 0;
        assert!(matches!(
            fake.next_record(&buffer, &mut cursor),
            Some(VendorActivity::Unknown)
        ));
        assert!(fake.next_record(&buffer, &mut cursor).is_some());
        assert!(fake.next_record(&buffer, &mut cursor).is_none());
    }
}
