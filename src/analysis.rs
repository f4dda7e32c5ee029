//! Kernel occupancy and SM-efficiency analyses
//!
//! Both analyses are closed-form functions of a vendor record and the
//! device's hardware limits; neither touches shared state. Occupancy is the
//! theoretical active-warp count implied by a kernel's resource usage; SM
//! efficiency compares delivered PC samples against the count a fully
//! busy chip would have produced.

use crate::device_map::DeviceProperties;
use crate::vendor::{KernelRecord, PcSamplingInfoRecord};

/// Result of the occupancy analysis for one kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Occupancy {
    pub active_warps_per_sm: u32,
    pub max_active_warps_per_sm: u32,
    pub thread_registers: u32,
    pub block_threads: u32,
    pub block_shared_memory: u32,
}

fn ceil_div(a: u32, b: u32) -> u32 {
    if a == 0 {
        0
    } else {
        (a - 1) / b + 1
    }
}

/// Theoretical occupancy of a kernel on its device.
///
/// The active block count per SM is the tightest of four limits: threads,
/// registers, shared memory, and the hardware block cap. A block using none
/// of a resource does not limit on that resource.
pub fn occupancy(kernel: &KernelRecord, props: &DeviceProperties) -> Occupancy {
    let block_threads = kernel.block_x * kernel.block_y * kernel.block_z;
    let block_shared_memory = kernel.dynamic_shared_memory + kernel.static_shared_memory;
    if block_threads == 0 {
        return Occupancy::default();
    }

    let block_registers = kernel.registers_per_thread * block_threads;
    let max_blocks_by_threads = props.sm_threads / block_threads;
    let max_blocks_by_registers = if block_registers == 0 {
        u32::MAX
    } else {
        props.sm_registers / block_registers
    };
    let max_blocks_by_shared_memory = if block_shared_memory == 0 {
        u32::MAX
    } else {
        props.sm_shared_memory / block_shared_memory
    };

    let active_blocks = max_blocks_by_threads
        .min(max_blocks_by_registers)
        .min(max_blocks_by_shared_memory)
        .min(props.sm_blocks);

    let occupancy = Occupancy {
        active_warps_per_sm: active_blocks * ceil_div(block_threads, props.num_threads_per_warp),
        max_active_warps_per_sm: props.sm_threads / props.num_threads_per_warp,
        thread_registers: kernel.registers_per_thread,
        block_threads,
        block_shared_memory,
    };

    tracing::trace!(
        active_blocks,
        active_warps = occupancy.active_warps_per_sm,
        max_warps = occupancy.max_active_warps_per_sm,
        "occupancy"
    );

    occupancy
}

/// Samples a fully busy chip would have produced over `kernel_time_ns`.
///
/// `core_clock × duration / sampling_period` samples per SM, times the SM
/// count. Returns 0 when the record carries no sampling period.
pub fn full_sm_samples(
    info: &PcSamplingInfoRecord,
    props: &DeviceProperties,
    kernel_time_ns: u64,
) -> u64 {
    if info.sampling_period_in_cycles == 0 {
        return 0;
    }
    let cycles = (props.clock_per_ns() * kernel_time_ns as f64) as u64;
    (cycles / info.sampling_period_in_cycles) * props.sm_count as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_map::test_properties;

    fn kernel(block: (u32, u32, u32), registers: u32, shared: u32) -> KernelRecord {
        KernelRecord {
            correlation_id: 1,
            device_id: 0,
            context_id: 1,
            stream_id: 1,
            block_x: block.0,
            block_y: block.1,
            block_z: block.2,
            registers_per_thread: registers,
            dynamic_shared_memory: shared,
            static_shared_memory: 0,
            local_memory_total: 0,
            start: 0,
            end: 0,
        }
    }

    #[test]
    fn test_occupancy_thread_limited() {
        let props = test_properties();
        // 1024-thread blocks, tiny register/shared usage: 2 blocks fit by
        // threads (2048/1024), well under the other limits
        let occ = occupancy(&kernel((1024, 1, 1), 16, 0), &props);
        assert_eq!(occ.block_threads, 1024);
        assert_eq!(occ.max_active_warps_per_sm, 64);
        // 2 blocks × 32 warps each
        assert_eq!(occ.active_warps_per_sm, 64);
    }

    #[test]
    fn test_occupancy_register_limited() {
        let props = test_properties();
        // 256 threads × 128 registers = 32768 per block → 2 blocks by
        // registers, though 8 would fit by threads
        let occ = occupancy(&kernel((256, 1, 1), 128, 0), &props);
        assert_eq!(occ.active_warps_per_sm, 2 * 8);
    }

    #[test]
    fn test_occupancy_shared_memory_limited() {
        let props = test_properties();
        // 48 KiB per block → 2 blocks by shared memory
        let occ = occupancy(&kernel((128, 1, 1), 16, 48 * 1024), &props);
        assert_eq!(occ.block_shared_memory, 48 * 1024);
        assert_eq!(occ.active_warps_per_sm, 2 * 4);
    }

    #[test]
    fn test_occupancy_block_cap_limited() {
        let props = test_properties();
        // 32-thread blocks: 64 fit by threads but the hardware caps at 32
        let occ = occupancy(&kernel((32, 1, 1), 8, 0), &props);
        assert_eq!(occ.active_warps_per_sm, 32);
    }

    #[test]
    fn test_occupancy_partial_warp_rounds_up() {
        let props = test_properties();
        // 48-thread blocks occupy 2 warps each
        let occ = occupancy(&kernel((48, 1, 1), 0, 0), &props);
        assert_eq!(occ.active_warps_per_sm, props.sm_blocks * 2);
    }

    #[test]
    fn test_occupancy_zero_threads() {
        let occ = occupancy(&kernel((0, 0, 0), 32, 0), &test_properties());
        assert_eq!(occ, Occupancy::default());
    }

    #[test]
    fn test_full_sm_samples() {
        let props = test_properties(); // 1.53 cycles/ns, 80 SMs
        let info = PcSamplingInfoRecord {
            correlation_id: 1,
            total_samples: 1000,
            dropped_samples: 0,
            sampling_period_in_cycles: 1000,
        };
        // 1e6 ns × 1.53 cycles/ns = 1.53e6 cycles → 1530 periods × 80 SMs
        assert_eq!(full_sm_samples(&info, &props, 1_000_000), 1530 * 80);
    }

    #[test]
    fn test_full_sm_samples_zero_period() {
        let info = PcSamplingInfoRecord {
            correlation_id: 1,
            total_samples: 0,
            dropped_samples: 0,
            sampling_period_in_cycles: 0,
        };
        assert_eq!(full_sm_samples(&info, &test_properties(), 1_000_000), 0);
    }
}
