//! Vendor activity translation
//!
//! Converts one vendor record into one internal [`GpuActivity`]. Apart from
//! lookups (and one lazy device-property query), translation is pure: the
//! same record translates to the same value every time.
//!
//! Instruction-level records (PC samples, global/shared accesses, branches)
//! carry a function id and a pc offset; the normalized pc is the function's
//! entry pc from the function-id map plus the offset. A record whose
//! function is unknown degrades to the null pc and is counted rather than
//! attributed.

use std::sync::Arc;

use crate::activity::{
    ActivityIds, GlobalAccessType, GpuActivity, Interval, MemcpyKind, SharedAccessType,
    StallReason, SyncKind,
};
use crate::analysis;
use crate::correlation::{CorrelationIdMap, FunctionIdMap};
use crate::device_map::DeviceMap;
use crate::ip::NormalizedIp;
use crate::relocation::RelocationMap;
use crate::vendor::{
    BranchRecord, GlobalAccessRecord, KernelRecord, MemcpyRecord, PcSamplingInfoRecord,
    PcSamplingRecord, SharedAccessRecord, TracingApi, VendorActivity,
};

// vendor stall reason encoding
const STALL_NONE: u32 = 1;
const STALL_IFETCH: u32 = 2;
const STALL_EXEC_DEP: u32 = 3;
const STALL_MEM_DEP: u32 = 4;
const STALL_TEXTURE: u32 = 5;
const STALL_SYNC: u32 = 6;
const STALL_CONST_MEM: u32 = 7;
const STALL_PIPE_BUSY: u32 = 8;
const STALL_MEM_THROTTLE: u32 = 9;
const STALL_NOT_SELECTED: u32 = 10;
const STALL_OTHER: u32 = 11;
const STALL_SLEEPING: u32 = 12;

fn convert_stall(reason: u32) -> StallReason {
    match reason {
        STALL_NONE => StallReason::None,
        STALL_IFETCH => StallReason::InstructionFetch,
        STALL_EXEC_DEP => StallReason::ExecDependency,
        STALL_MEM_DEP => StallReason::MemoryDependency,
        STALL_TEXTURE => StallReason::Texture,
        STALL_SYNC => StallReason::Sync,
        STALL_CONST_MEM => StallReason::ConstantMemory,
        STALL_PIPE_BUSY => StallReason::PipeBusy,
        STALL_MEM_THROTTLE => StallReason::MemoryThrottle,
        STALL_NOT_SELECTED => StallReason::NotSelected,
        STALL_OTHER => StallReason::Other,
        STALL_SLEEPING => StallReason::Sleeping,
        _ => StallReason::Invalid,
    }
}

fn convert_memcpy_kind(kind: u32) -> MemcpyKind {
    match kind {
        1 => MemcpyKind::HostToDevice,
        2 => MemcpyKind::DeviceToHost,
        3 => MemcpyKind::HostToArray,
        4 => MemcpyKind::ArrayToHost,
        5 => MemcpyKind::ArrayToArray,
        6 => MemcpyKind::ArrayToDevice,
        7 => MemcpyKind::DeviceToArray,
        8 => MemcpyKind::DeviceToDevice,
        9 => MemcpyKind::HostToHost,
        10 => MemcpyKind::PeerToPeer,
        _ => MemcpyKind::Unknown,
    }
}

fn convert_sync_kind(kind: u32) -> SyncKind {
    match kind {
        1 => SyncKind::EventSynchronize,
        2 => SyncKind::StreamWaitEvent,
        3 => SyncKind::StreamSynchronize,
        4 => SyncKind::ContextSynchronize,
        _ => SyncKind::Unknown,
    }
}

/// Translates vendor records against the pipeline's shared maps.
pub struct Translator {
    correlation_map: Arc<CorrelationIdMap>,
    function_map: Arc<FunctionIdMap>,
    device_map: Arc<DeviceMap>,
    relocation: Arc<RelocationMap>,
}

impl Translator {
    pub fn new(
        correlation_map: Arc<CorrelationIdMap>,
        function_map: Arc<FunctionIdMap>,
        device_map: Arc<DeviceMap>,
        relocation: Arc<RelocationMap>,
    ) -> Self {
        Translator {
            correlation_map,
            function_map,
            device_map,
            relocation,
        }
    }

    /// Translate one vendor record.
    pub fn translate(&self, record: &VendorActivity, tracing: &dyn TracingApi) -> GpuActivity {
        match record {
            VendorActivity::PcSampling(sample) => self.convert_pc_sampling(sample),
            VendorActivity::PcSamplingRecordInfo(info) => self.convert_pc_sampling_info(info),
            VendorActivity::Memcpy(memcpy) => convert_memcpy(memcpy),
            VendorActivity::Kernel(kernel) => self.convert_kernel(kernel, tracing),
            VendorActivity::GlobalAccess(access) => self.convert_global_access(access),
            VendorActivity::SharedAccess(access) => self.convert_shared_access(access),
            VendorActivity::Branch(branch) => self.convert_branch(branch),
            VendorActivity::Synchronization(sync) => GpuActivity::Sync {
                ids: ActivityIds {
                    correlation_id: sync.correlation_id,
                    device_id: 0,
                    context_id: sync.context_id,
                    stream_id: sync.stream_id,
                },
                kind: convert_sync_kind(sync.sync_type),
                event_id: sync.cuda_event_id,
                interval: Interval::new(sync.start, sync.end),
            },
            VendorActivity::Memory(memory) => GpuActivity::Memory {
                memory_kind: memory.memory_kind,
                bytes: memory.bytes,
                interval: Interval::new(memory.start, memory.end),
            },
            VendorActivity::Memset(memset) => GpuActivity::Memset {
                ids: ActivityIds {
                    correlation_id: memset.correlation_id,
                    device_id: 0,
                    context_id: memset.context_id,
                    stream_id: memset.stream_id,
                },
                memory_kind: memset.memory_kind,
                bytes: memset.bytes,
                interval: Interval::new(memset.start, memset.end),
            },
            VendorActivity::Function(function) => {
                // bind the vendor's function id to its entry pc so later
                // instruction records can compose absolute pcs
                let pc = self
                    .relocation
                    .transform(function.module_id, function.function_index, 0);
                self.function_map.insert(function.id, pc);
                GpuActivity::Function {
                    function_id: function.id,
                    pc,
                }
            }
            VendorActivity::ExternalCorrelation(correlation) => GpuActivity::ExternalCorrelation {
                vendor_correlation_id: correlation.correlation_id,
                host_correlation_id: correlation.external_id,
            },
            VendorActivity::CdpKernel(cdp) => GpuActivity::CdpKernel {
                ids: ActivityIds {
                    correlation_id: cdp.correlation_id,
                    device_id: cdp.device_id,
                    context_id: cdp.context_id,
                    stream_id: cdp.stream_id,
                },
                interval: Interval::new(cdp.start, cdp.end),
            },
            VendorActivity::CudaEvent(event) => GpuActivity::Event {
                ids: ActivityIds {
                    correlation_id: event.correlation_id,
                    device_id: 0,
                    context_id: event.context_id,
                    stream_id: event.stream_id,
                },
                event_id: event.event_id,
            },
            VendorActivity::Unknown => GpuActivity::Unknown,
        }
    }

    /// Compose the absolute pc of an instruction-level record.
    fn instruction_pc(&self, function_id: u32, pc_offset: u32) -> NormalizedIp {
        match self.function_map.lookup(function_id) {
            Some(pc) => pc.with_pc_offset(pc_offset as u64),
            None => {
                tracing::debug!(function_id, "instruction record for unknown function");
                NormalizedIp::null()
            }
        }
    }

    fn convert_pc_sampling(&self, sample: &PcSamplingRecord) -> GpuActivity {
        GpuActivity::PcSample {
            ids: ActivityIds {
                correlation_id: sample.correlation_id,
                ..ActivityIds::default()
            },
            pc: self.instruction_pc(sample.function_id, sample.pc_offset),
            stall_reason: convert_stall(sample.stall_reason),
            samples: sample.samples,
            latency_samples: sample.latency_samples,
        }
    }

    fn convert_pc_sampling_info(&self, info: &PcSamplingInfoRecord) -> GpuActivity {
        // the kernel activity for the same correlation id recorded the
        // device and interval; without it the full-SM estimate stays zero
        let full_sm_samples = self
            .correlation_map
            .lookup(info.correlation_id)
            .and_then(|entry| {
                let props = self.device_map.get(entry.device_id)?;
                Some(analysis::full_sm_samples(
                    info,
                    &props,
                    entry.end.saturating_sub(entry.start),
                ))
            })
            .unwrap_or(0);

        GpuActivity::PcSampleInfo {
            correlation_id: info.correlation_id,
            total_samples: info.total_samples,
            dropped_samples: info.dropped_samples,
            period_cycles: info.sampling_period_in_cycles,
            full_sm_samples,
        }
    }

    fn convert_kernel(&self, kernel: &KernelRecord, tracing_api: &dyn TracingApi) -> GpuActivity {
        let properties = self
            .device_map
            .get_or_query(kernel.device_id, || {
                tracing_api.device_properties(kernel.device_id)
            });

        let occupancy = properties
            .map(|props| analysis::occupancy(kernel, &props))
            .unwrap_or_default();

        self.correlation_map.kernel_update(
            kernel.correlation_id,
            kernel.device_id,
            kernel.start,
            kernel.end,
        );

        GpuActivity::Kernel {
            ids: ActivityIds {
                correlation_id: kernel.correlation_id,
                device_id: kernel.device_id,
                context_id: kernel.context_id,
                stream_id: kernel.stream_id,
            },
            blocks: kernel.block_x * kernel.block_y * kernel.block_z,
            block_threads: occupancy.block_threads,
            thread_registers: occupancy.thread_registers,
            block_shared_memory: occupancy.block_shared_memory,
            dynamic_shared_memory: kernel.dynamic_shared_memory,
            static_shared_memory: kernel.static_shared_memory,
            local_memory_total: kernel.local_memory_total,
            active_warps_per_sm: occupancy.active_warps_per_sm,
            max_active_warps_per_sm: occupancy.max_active_warps_per_sm,
            interval: Interval::new(kernel.start, kernel.end),
        }
    }

    fn convert_global_access(&self, access: &GlobalAccessRecord) -> GpuActivity {
        let access_type = if access.flags & (1 << 8) != 0 {
            if access.flags & (1 << 9) != 0 {
                GlobalAccessType::LoadCached
            } else {
                GlobalAccessType::LoadUncached
            }
        } else {
            GlobalAccessType::Store
        };

        GpuActivity::GlobalAccess {
            ids: ActivityIds {
                correlation_id: access.correlation_id,
                ..ActivityIds::default()
            },
            pc: self.instruction_pc(access.function_id, access.pc_offset),
            access_type,
            // low byte is the per-thread access width
            bytes: (access.flags & 0xff) as u64 * access.threads_executed as u64,
            l2_transactions: access.l2_transactions,
            theoretical_l2_transactions: access.theoretical_l2_transactions,
        }
    }

    fn convert_shared_access(&self, access: &SharedAccessRecord) -> GpuActivity {
        GpuActivity::SharedAccess {
            ids: ActivityIds {
                correlation_id: access.correlation_id,
                ..ActivityIds::default()
            },
            pc: self.instruction_pc(access.function_id, access.pc_offset),
            access_type: if access.flags & (1 << 8) != 0 {
                SharedAccessType::Load
            } else {
                SharedAccessType::Store
            },
            bytes: (access.flags & 0xff) as u64 * access.threads_executed as u64,
            shared_transactions: access.shared_transactions,
            theoretical_shared_transactions: access.theoretical_shared_transactions,
        }
    }

    fn convert_branch(&self, branch: &BranchRecord) -> GpuActivity {
        GpuActivity::Branch {
            ids: ActivityIds {
                correlation_id: branch.correlation_id,
                ..ActivityIds::default()
            },
            pc: self.instruction_pc(branch.function_id, branch.pc_offset),
            diverged: branch.diverged,
            executed: branch.executed,
        }
    }
}

fn convert_memcpy(memcpy: &MemcpyRecord) -> GpuActivity {
    GpuActivity::Memcpy {
        ids: ActivityIds {
            correlation_id: memcpy.correlation_id,
            device_id: 0,
            context_id: memcpy.context_id,
            stream_id: memcpy.stream_id,
        },
        kind: convert_memcpy_kind(memcpy.copy_kind),
        bytes: memcpy.bytes,
        interval: Interval::new(memcpy.start, memcpy.end),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_map::test_properties;
    use crate::relocation::test_symbols;
    use crate::vendor::testing::FakeTracing;
    use crate::vendor::FunctionRecord;

    fn translator() -> (Translator, Arc<FunctionIdMap>, Arc<CorrelationIdMap>) {
        let correlation_map = Arc::new(CorrelationIdMap::new());
        let function_map = Arc::new(FunctionIdMap::new());
        let device_map = Arc::new(DeviceMap::new());
        let relocation = Arc::new(RelocationMap::new());
        relocation.register(7, 2, test_symbols(&[0, 0x100, 0x400]));
        let translator = Translator::new(
            correlation_map.clone(),
            function_map.clone(),
            device_map,
            relocation,
        );
        (translator, function_map, correlation_map)
    }

    #[test]
    fn test_function_record_binds_pc() {
        let (translator, function_map, _) = translator();
        let fake = FakeTracing::new();

        let activity = translator.translate(
            &VendorActivity::Function(FunctionRecord {
                id: 9,
                module_id: 7,
                function_index: 2,
            }),
            &fake,
        );
        assert_eq!(
            activity,
            GpuActivity::Function {
                function_id: 9,
                pc: NormalizedIp::new(2, 0x400),
            }
        );
        assert_eq!(function_map.lookup(9), Some(NormalizedIp::new(2, 0x400)));
    }

    #[test]
    fn test_pc_sample_composes_offset() {
        let (translator, function_map, _) = translator();
        let fake = FakeTracing::new();
        function_map.insert(9, NormalizedIp::new(2, 0x400));

        let activity = translator.translate(
            &VendorActivity::PcSampling(PcSamplingRecord {
                correlation_id: 100,
                function_id: 9,
                pc_offset: 0x40,
                samples: 3,
                latency_samples: 1,
                stall_reason: STALL_SYNC,
            }),
            &fake,
        );
        match activity {
            GpuActivity::PcSample {
                pc,
                stall_reason,
                samples,
                ..
            } => {
                assert_eq!(pc, NormalizedIp::new(2, 0x440));
                assert_eq!(stall_reason, StallReason::Sync);
                assert_eq!(samples, 3);
            }
            other => panic!("unexpected activity {other:?}"),
        }
    }

    #[test]
    fn test_pc_sample_unknown_function_degrades() {
        let (translator, _, _) = translator();
        let fake = FakeTracing::new();

        let activity = translator.translate(
            &VendorActivity::PcSampling(PcSamplingRecord {
                correlation_id: 100,
                function_id: 12345,
                pc_offset: 0x40,
                samples: 1,
                latency_samples: 0,
                stall_reason: STALL_NONE,
            }),
            &fake,
        );
        assert_eq!(activity.pc(), Some(NormalizedIp::null()));
    }

    #[test]
    fn test_kernel_queries_device_once_and_updates_correlation() {
        let (translator, _, correlation_map) = translator();
        let fake = FakeTracing::new();
        fake.define_device(0, test_properties());
        correlation_map.insert(100, 1);

        let kernel = KernelRecord {
            correlation_id: 100,
            device_id: 0,
            context_id: 1,
            stream_id: 2,
            block_x: 256,
            block_y: 1,
            block_z: 1,
            registers_per_thread: 32,
            dynamic_shared_memory: 0,
            static_shared_memory: 0,
            local_memory_total: 0,
            start: 1_000,
            end: 2_000,
        };
        let activity = translator.translate(&VendorActivity::Kernel(kernel), &fake);
        match activity {
            GpuActivity::Kernel {
                blocks,
                active_warps_per_sm,
                max_active_warps_per_sm,
                interval,
                ..
            } => {
                assert_eq!(blocks, 256);
                assert!(active_warps_per_sm > 0);
                assert_eq!(max_active_warps_per_sm, 64);
                assert_eq!(interval, Interval::new(1_000, 2_000));
            }
            other => panic!("unexpected activity {other:?}"),
        }

        let entry = correlation_map.lookup(100).unwrap();
        assert_eq!((entry.start, entry.end), (1_000, 2_000));
    }

    #[test]
    fn test_pc_sampling_info_uses_kernel_interval() {
        let (translator, _, correlation_map) = translator();
        let fake = FakeTracing::new();
        fake.define_device(0, test_properties());
        correlation_map.insert(100, 1);

        // kernel first: registers device + interval
        let kernel = KernelRecord {
            correlation_id: 100,
            device_id: 0,
            context_id: 1,
            stream_id: 2,
            block_x: 1,
            block_y: 1,
            block_z: 1,
            registers_per_thread: 1,
            dynamic_shared_memory: 0,
            static_shared_memory: 0,
            local_memory_total: 0,
            start: 0,
            end: 1_000_000,
        };
        translator.translate(&VendorActivity::Kernel(kernel), &fake);

        let activity = translator.translate(
            &VendorActivity::PcSamplingRecordInfo(PcSamplingInfoRecord {
                correlation_id: 100,
                total_samples: 5_000,
                dropped_samples: 2,
                sampling_period_in_cycles: 1_000,
            }),
            &fake,
        );
        match activity {
            GpuActivity::PcSampleInfo {
                full_sm_samples,
                total_samples,
                dropped_samples,
                ..
            } => {
                assert_eq!(full_sm_samples, 1530 * 80);
                assert_eq!(total_samples, 5_000);
                assert_eq!(dropped_samples, 2);
            }
            other => panic!("unexpected activity {other:?}"),
        }
    }

    #[test]
    fn test_global_access_flag_decoding() {
        let (translator, function_map, _) = translator();
        let fake = FakeTracing::new();
        function_map.insert(9, NormalizedIp::new(2, 0x100));

        // 4-byte cached load executed by 32 threads
        let record = GlobalAccessRecord {
            correlation_id: 100,
            function_id: 9,
            pc_offset: 0,
            flags: (1 << 9) | (1 << 8) | 4,
            threads_executed: 32,
            l2_transactions: 8,
            theoretical_l2_transactions: 4,
        };
        match translator.translate(&VendorActivity::GlobalAccess(record), &fake) {
            GpuActivity::GlobalAccess {
                access_type, bytes, ..
            } => {
                assert_eq!(access_type, GlobalAccessType::LoadCached);
                assert_eq!(bytes, 128);
            }
            other => panic!("unexpected activity {other:?}"),
        }

        // store: bit 8 clear
        let store = GlobalAccessRecord {
            flags: 8,
            ..record
        };
        match translator.translate(&VendorActivity::GlobalAccess(store), &fake) {
            GpuActivity::GlobalAccess {
                access_type, bytes, ..
            } => {
                assert_eq!(access_type, GlobalAccessType::Store);
                assert_eq!(bytes, 256);
            }
            other => panic!("unexpected activity {other:?}"),
        }
    }

    #[test]
    fn test_translation_is_pure() {
        let (translator, function_map, _) = translator();
        let fake = FakeTracing::new();
        function_map.insert(9, NormalizedIp::new(2, 0x100));

        let record = VendorActivity::Branch(BranchRecord {
            correlation_id: 100,
            function_id: 9,
            pc_offset: 0x10,
            diverged: 2,
            executed: 32,
        });
        let a = translator.translate(&record, &fake);
        let b = translator.translate(&record, &fake);
        assert_eq!(a, b);
    }

    #[test]
    fn test_memcpy_kinds() {
        let record = MemcpyRecord {
            correlation_id: 1,
            context_id: 1,
            stream_id: 1,
            copy_kind: 1,
            bytes: 4096,
            start: 10,
            end: 20,
        };
        match convert_memcpy(&record) {
            GpuActivity::Memcpy { kind, bytes, .. } => {
                assert_eq!(kind, MemcpyKind::HostToDevice);
                assert_eq!(bytes, 4096);
            }
            other => panic!("unexpected activity {other:?}"),
        }
        assert!(matches!(
            convert_memcpy(&MemcpyRecord {
                copy_kind: 99,
                ..record
            }),
            GpuActivity::Memcpy {
                kind: MemcpyKind::Unknown,
                ..
            }
        ));
    }
}
