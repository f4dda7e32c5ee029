//! GPU-resident memory-access sanitization
//!
//! A patch library instruments loaded modules with callbacks that append
//! memory-access records to a fixed-capacity ring buffer in device memory.
//! The host coordinates with the patch code through two header words:
//! `full` (device fills, host drains, host clears) and `analysis` (the
//! on-device analysis kernel completes a generation). After a drain the
//! host writes back *only* the `full` word, so the indices the device keeps
//! advancing are never clobbered.
//!
//! Per kernel launch the host resets the header, then polls from a
//! dedicated priority stream until every observed thread has exited
//! (`num_threads` reaches the expected non-sampled count), draining the
//! buffer each time the device marks it full. Drained buffers travel over
//! the per-thread sanitizer channel to the analysis sink, either inline
//! (synchronous mode) or on a background thread.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam::queue::ArrayQueue;
use regex::Regex;

use crate::channel::{BiChannel, ChannelSet};
use crate::concurrent_map::SplayMap;
use crate::config::Config;
use crate::errors::ProfilingError;
use crate::sink::CctNodeId;
use crate::stats::ProfilingStats;
use crate::vendor::{check, ContextHandle, DevicePtr, ModuleHandle, StreamHandle, VendorResult};

/// Lanes per warp; each record carries one address slot per lane.
pub const WARP_SIZE: usize = 32;

/// Threads per block of the on-device analysis kernel.
const ANALYSIS_KERNEL_THREADS: u32 = 1024;

/// Host-side buffer pool depth per process.
const BUFFER_POOL_DEPTH: usize = 16;

// header flag bits
pub const PATCH_FLAG_NONE: u32 = 0;
pub const PATCH_FLAG_READ: u32 = 1 << 0;
pub const PATCH_FLAG_WRITE: u32 = 1 << 1;
pub const PATCH_FLAG_ANALYSIS: u32 = 1 << 2;

/// Operating mode baked into the device buffer header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchBufferKind {
    Default,
    /// Address-only patching; shared/local/block-boundary patches are not
    /// installed in this mode
    AddressPatch,
    AddressAnalysis,
}

impl PatchBufferKind {
    fn as_u32(self) -> u32 {
        match self {
            PatchBufferKind::Default => 0,
            PatchBufferKind::AddressPatch => 1,
            PatchBufferKind::AddressAnalysis => 2,
        }
    }
}

/// Device-resident ring buffer header, mirrored on the host.
///
/// Field order is the wire layout; `full` must stay first so the host can
/// write back that word alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PatchBufferHeader {
    pub full: u32,
    pub analysis: u32,
    pub head_index: u32,
    pub tail_index: u32,
    pub size: u32,
    pub num_threads: u32,
    pub block_sampling_frequency: u32,
    pub block_sampling_offset: u32,
    pub kind: u32,
    pub flags: u32,
    /// Device pointer to the record array
    pub records: u64,
}

impl PatchBufferHeader {
    pub const SIZE: usize = 48;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        let words = [
            self.full,
            self.analysis,
            self.head_index,
            self.tail_index,
            self.size,
            self.num_threads,
            self.block_sampling_frequency,
            self.block_sampling_offset,
            self.kind,
            self.flags,
        ];
        for (i, word) in words.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        bytes[40..48].copy_from_slice(&self.records.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let word = |i: usize| {
            let mut w = [0u8; 4];
            w.copy_from_slice(&bytes[i * 4..i * 4 + 4]);
            u32::from_le_bytes(w)
        };
        let mut records = [0u8; 8];
        records.copy_from_slice(&bytes[40..48]);
        PatchBufferHeader {
            full: word(0),
            analysis: word(1),
            head_index: word(2),
            tail_index: word(3),
            size: word(4),
            num_threads: word(5),
            block_sampling_frequency: word(6),
            block_sampling_offset: word(7),
            kind: word(8),
            flags: word(9),
            records: u64::from_le_bytes(records),
        }
    }
}

/// One memory access observed by the patch code. The host never interprets
/// warp-level details; it forwards raw records to the analysis sink. The
/// layout is defined here for that sink's benefit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryAccessRecord {
    pub flat_thread_id: u32,
    pub warp_id: u32,
    pub active_mask: u32,
    pub flags: u32,
    pub pc: u64,
    pub addresses: [u64; WARP_SIZE],
    pub access_size: u32,
}

impl MemoryAccessRecord {
    pub const SIZE: usize = 16 + 8 + WARP_SIZE * 8 + 8;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::SIZE);
        for word in [self.flat_thread_id, self.warp_id, self.active_mask, self.flags] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes.extend_from_slice(&self.pc.to_le_bytes());
        for address in &self.addresses {
            bytes.extend_from_slice(&address.to_le_bytes());
        }
        bytes.extend_from_slice(&self.access_size.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 4]); // pad to 8
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let word = |offset: usize| {
            let mut w = [0u8; 4];
            w.copy_from_slice(&bytes[offset..offset + 4]);
            u32::from_le_bytes(w)
        };
        let quad = |offset: usize| {
            let mut q = [0u8; 8];
            q.copy_from_slice(&bytes[offset..offset + 8]);
            u64::from_le_bytes(q)
        };
        let mut addresses = [0u64; WARP_SIZE];
        for (i, slot) in addresses.iter_mut().enumerate() {
            *slot = quad(24 + i * 8);
        }
        Some(MemoryAccessRecord {
            flat_thread_id: word(0),
            warp_id: word(4),
            active_mask: word(8),
            flags: word(12),
            pc: quad(16),
            addresses,
            access_size: word(24 + WARP_SIZE * 8),
        })
    }
}

/// Address-diff record produced by the on-device analysis kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressDiffRecord {
    pub address: u64,
    pub count: u32,
    pub flags: u32,
}

impl AddressDiffRecord {
    pub const SIZE: usize = 16;
}

/// Instrumentation sites the patch library can hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchSite {
    MemoryAccess,
    SharedAccess,
    LocalAccess,
    BlockEnter,
    BlockExit,
}

/// Capability surface of the sanitizer/patching vendor library.
pub trait PatchApi: Send + Sync {
    fn alloc(&self, context: ContextHandle, size: usize) -> VendorResult<DevicePtr>;
    fn memset(
        &self,
        ptr: DevicePtr,
        value: u8,
        size: usize,
        stream: StreamHandle,
    ) -> VendorResult<()>;
    fn memcpy_host_to_device(
        &self,
        dst: DevicePtr,
        src: &[u8],
        stream: StreamHandle,
    ) -> VendorResult<()>;
    fn memcpy_device_to_host(
        &self,
        dst: &mut [u8],
        src: DevicePtr,
        stream: StreamHandle,
    ) -> VendorResult<()>;
    fn create_priority_stream(&self, context: ContextHandle) -> VendorResult<StreamHandle>;
    fn stream_synchronize(&self, stream: StreamHandle) -> VendorResult<()>;
    /// Missing patch image is recoverable: sanitization is disabled for
    /// the affected context.
    fn add_patches_from_file(
        &self,
        path: &std::path::Path,
        context: ContextHandle,
    ) -> Result<(), ProfilingError>;
    fn patch_instructions(
        &self,
        site: PatchSite,
        module: ModuleHandle,
        callback: &str,
    ) -> VendorResult<()>;
    fn patch_module(&self, module: ModuleHandle) -> VendorResult<()>;
    fn set_callback_data(&self, stream: StreamHandle, data: DevicePtr) -> VendorResult<()>;
    fn load_analysis_module(
        &self,
        context: ContextHandle,
        path: &std::path::Path,
    ) -> Result<ModuleHandle, ProfilingError>;
    fn launch_analysis_kernel(
        &self,
        module: ModuleHandle,
        blocks: u32,
        threads: u32,
        stream: StreamHandle,
        args: &[DevicePtr],
    ) -> VendorResult<()>;
}

/// A drained device buffer on its way to the analysis sink. Records stay
/// raw; only the analysis sink decodes them.
#[derive(Debug)]
pub struct SanitizerBuffer {
    pub cubin_id: u32,
    pub mod_id: u32,
    pub kernel_node: CctNodeId,
    pub host_op_id: u64,
    pub header: PatchBufferHeader,
    pub records: Vec<u8>,
    pub record_count: usize,
}

impl SanitizerBuffer {
    fn empty() -> Self {
        SanitizerBuffer {
            cubin_id: 0,
            mod_id: 0,
            kernel_node: 0,
            host_op_id: 0,
            header: PatchBufferHeader::default(),
            records: Vec::new(),
            record_count: 0,
        }
    }
}

/// Consumer of drained sanitizer buffers.
pub trait AnalysisSink: Send + Sync {
    fn process(&self, buffer: &SanitizerBuffer);
}

/// Fixed-depth pool of host-side buffers shared by all draining threads.
/// Exhaustion in synchronous mode forces an inline drain of the caller's
/// channel before retrying.
struct BufferPool {
    queue: ArrayQueue<SanitizerBuffer>,
}

impl BufferPool {
    fn new(depth: usize) -> Self {
        let queue = ArrayQueue::new(depth);
        for _ in 0..depth {
            let _ = queue.push(SanitizerBuffer::empty());
        }
        BufferPool { queue }
    }

    fn acquire(&self) -> Option<SanitizerBuffer> {
        self.queue.pop()
    }

    fn release(&self, mut buffer: SanitizerBuffer) {
        buffer.records.clear();
        buffer.record_count = 0;
        // beyond capacity the buffer is dropped, bounding retained memory
        let _ = self.queue.push(buffer);
    }

    fn available(&self) -> usize {
        self.queue.len()
    }
}

/// White/black list over kernel names. An empty whitelist admits every
/// kernel; the blacklist then removes matches.
pub struct KernelFilter {
    whitelist: Vec<Regex>,
    blacklist: Vec<Regex>,
}

impl KernelFilter {
    pub fn new(whitelist: Vec<Regex>, blacklist: Vec<Regex>) -> Self {
        KernelFilter {
            whitelist,
            blacklist,
        }
    }

    pub fn allow_all() -> Self {
        KernelFilter {
            whitelist: Vec::new(),
            blacklist: Vec::new(),
        }
    }

    pub fn instrument(&self, kernel_name: &str) -> bool {
        if !self.whitelist.is_empty()
            && !self.whitelist.iter().any(|re| re.is_match(kernel_name))
        {
            return false;
        }
        !self.blacklist.iter().any(|re| re.is_match(kernel_name))
    }
}

/// Per-context device state.
pub struct ContextState {
    pub context: ContextHandle,
    priority_stream: StreamHandle,
    kernel_stream: StreamHandle,
    buffer_device: DevicePtr,
    records_device: DevicePtr,
    analysis_read: Option<AnalysisBuffers>,
    analysis_write: Option<AnalysisBuffers>,
    analysis_module: Option<ModuleHandle>,
    enabled: AtomicBool,
}

struct AnalysisBuffers {
    header_device: DevicePtr,
    #[allow(dead_code)]
    records_device: DevicePtr,
}

impl ContextState {
    pub fn enabled(&self) -> bool {
        self.enabled.load(AtomicOrdering::Relaxed)
    }
}

/// Per-thread sanitizer state: the thread's channel plus launch scratch.
pub struct SanitizerThread {
    channel: Arc<BiChannel<SanitizerBuffer>>,
}

/// Launch-scoped parameters computed at launch begin and consumed by the
/// drain loop at launch end.
#[derive(Debug, Clone, Copy)]
pub struct LaunchInfo {
    pub num_threads: u64,
    pub num_left_threads: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Dim3 { x, y, z }
    }

    pub fn total(&self) -> u32 {
        self.x * self.y * self.z
    }
}

/// Threads guaranteed to never sample under uniform block sampling.
fn num_left_threads(grid_dim: u32, block_dim: u32, frequency: u32, offset: u32) -> u64 {
    if frequency == 0 {
        return 0;
    }
    let num_threads = grid_dim as u64 * block_dim as u64;
    let mod_blocks = grid_dim % frequency;
    let sampling_blocks = if mod_blocks == 0 {
        (grid_dim - 1) / frequency + 1
    } else {
        (grid_dim - 1) / frequency + u32::from(offset < mod_blocks)
    };
    num_threads - sampling_blocks as u64 * block_dim as u64
}

/// Host side of the sanitizer protocol.
pub struct Sanitizer {
    api: Arc<dyn PatchApi>,
    analysis: Arc<dyn AnalysisSink>,
    stats: Arc<ProfilingStats>,
    filter: KernelFilter,

    record_count: usize,
    addr_record_count: usize,
    block_sampling_frequency: u32,
    analysis_blocks: u32,
    analysis_async: bool,
    patch_dir: PathBuf,
    kind: PatchBufferKind,

    contexts: SplayMap<u64, Arc<ContextState>>,
    creation: Mutex<()>,
    channels: Arc<ChannelSet<SanitizerBuffer>>,
    pool: Arc<BufferPool>,

    worker_signal: Arc<(Mutex<bool>, Condvar)>,
    worker_stop: Arc<AtomicBool>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Sanitizer {
    pub fn new(
        api: Arc<dyn PatchApi>,
        analysis: Arc<dyn AnalysisSink>,
        stats: Arc<ProfilingStats>,
        filter: KernelFilter,
        kind: PatchBufferKind,
        config: &Config,
    ) -> Self {
        let sanitizer = Sanitizer {
            api,
            analysis,
            stats,
            filter,
            record_count: config.sanitizer_record_count,
            addr_record_count: config.sanitizer_addr_record_count,
            block_sampling_frequency: config.block_sampling_frequency,
            analysis_blocks: config.analysis_blocks,
            analysis_async: config.analysis_async,
            patch_dir: config.patch_dir.clone(),
            kind,
            contexts: SplayMap::new(),
            creation: Mutex::new(()),
            channels: Arc::new(ChannelSet::new()),
            pool: Arc::new(BufferPool::new(BUFFER_POOL_DEPTH)),
            worker_signal: Arc::new((Mutex::new(false), Condvar::new())),
            worker_stop: Arc::new(AtomicBool::new(false)),
            worker_handle: Mutex::new(None),
        };
        if sanitizer.analysis_async {
            sanitizer.spawn_analysis_worker();
        }
        sanitizer
    }

    pub fn filter(&self) -> &KernelFilter {
        &self.filter
    }

    /// Register the calling thread's sanitizer channel.
    pub fn create_thread(&self) -> SanitizerThread {
        let channel = Arc::new(BiChannel::new());
        self.channels.register(channel.clone());
        SanitizerThread { channel }
    }

    /// Allocate and initialize the per-context device buffers on a fresh
    /// priority stream. Device allocation failure is fatal.
    pub fn context_init(&self, context: ContextHandle) -> Arc<ContextState> {
        let _creation = self.creation.lock().expect("sanitizer creation lock");
        if let Some(state) = self.contexts.get(&context.0) {
            return state;
        }

        let priority_stream = check(self.api.create_priority_stream(context));
        let kernel_stream = check(self.api.create_priority_stream(context));

        let buffer_device = check(self.api.alloc(context, PatchBufferHeader::SIZE));
        check(self.api.memset(
            buffer_device,
            0,
            PatchBufferHeader::SIZE,
            priority_stream,
        ));

        let records_size = self.record_count * MemoryAccessRecord::SIZE;
        let records_device = check(self.api.alloc(context, records_size));
        check(self.api.memset(records_device, 0, records_size, priority_stream));

        let header = PatchBufferHeader {
            size: self.record_count as u32,
            kind: self.kind.as_u32(),
            flags: PATCH_FLAG_NONE,
            records: records_device.0,
            ..PatchBufferHeader::default()
        };
        check(self.api.memcpy_host_to_device(
            buffer_device,
            &header.to_bytes(),
            priority_stream,
        ));

        let (analysis_read, analysis_write, analysis_module) = if self.analysis_blocks != 0 {
            let read = self.alloc_analysis_buffers(context, priority_stream, PATCH_FLAG_READ);
            let write = self.alloc_analysis_buffers(context, priority_stream, PATCH_FLAG_WRITE);
            let module = self
                .api
                .load_analysis_module(context, &self.patch_dir.join("gpu-analysis.fatbin"))
                .map_err(|err| {
                    tracing::warn!(%err, "analysis module unavailable");
                    err
                })
                .ok();
            (Some(read), Some(write), module)
        } else {
            (None, None, None)
        };

        let state = Arc::new(ContextState {
            context,
            priority_stream,
            kernel_stream,
            buffer_device,
            records_device,
            analysis_read,
            analysis_write,
            analysis_module,
            enabled: AtomicBool::new(true),
        });
        self.contexts.insert(context.0, state.clone());
        tracing::debug!(context = context.0, "sanitizer context initialized");
        state
    }

    fn alloc_analysis_buffers(
        &self,
        context: ContextHandle,
        stream: StreamHandle,
        direction_flag: u32,
    ) -> AnalysisBuffers {
        let header_device = check(self.api.alloc(context, PatchBufferHeader::SIZE));
        check(self.api.memset(header_device, 0, PatchBufferHeader::SIZE, stream));

        let records_size = self.addr_record_count * AddressDiffRecord::SIZE;
        let records_device = check(self.api.alloc(context, records_size));
        check(self.api.memset(records_device, 0, records_size, stream));

        let header = PatchBufferHeader {
            size: self.addr_record_count as u32,
            kind: PatchBufferKind::AddressAnalysis.as_u32(),
            flags: direction_flag | PATCH_FLAG_ANALYSIS,
            records: records_device.0,
            ..PatchBufferHeader::default()
        };
        check(self.api.memcpy_host_to_device(header_device, &header.to_bytes(), stream));

        AnalysisBuffers {
            header_device,
            records_device,
        }
    }

    /// Install the instrumentation patches into a loaded module. A missing
    /// patch image disables sanitization for the context.
    pub fn module_load(&self, state: &ContextState, module: ModuleHandle) {
        let image = if self.kind == PatchBufferKind::AddressPatch {
            self.patch_dir.join("gpu-patch-address.fatbin")
        } else {
            self.patch_dir.join("gpu-patch.fatbin")
        };
        if let Err(err) = self.api.add_patches_from_file(&image, state.context) {
            tracing::warn!(%err, context = state.context.0, "sanitization disabled");
            state.enabled.store(false, AtomicOrdering::Relaxed);
            return;
        }

        check(
            self.api
                .patch_instructions(PatchSite::MemoryAccess, module, "sanitizer_memory_access"),
        );
        // address-patch mode installs the memory-access hook only
        if self.kind != PatchBufferKind::AddressPatch {
            check(self.api.patch_instructions(
                PatchSite::SharedAccess,
                module,
                "sanitizer_shared_access",
            ));
            check(self.api.patch_instructions(
                PatchSite::LocalAccess,
                module,
                "sanitizer_local_access",
            ));
            check(
                self.api
                    .patch_instructions(PatchSite::BlockEnter, module, "sanitizer_block_enter"),
            );
            check(
                self.api
                    .patch_instructions(PatchSite::BlockExit, module, "sanitizer_block_exit"),
            );
        }
        check(self.api.patch_module(module));
    }

    /// Reset the device header for a new launch and arm the callback data.
    pub fn kernel_launch_begin(
        &self,
        state: &ContextState,
        handle_stream: StreamHandle,
        grid: Dim3,
        block: Dim3,
        kernel_sampling: bool,
    ) -> LaunchInfo {
        let grid_dim = grid.total();
        let block_dim = block.total();
        let frequency = if kernel_sampling {
            self.block_sampling_frequency
        } else {
            0
        };
        let offset = if frequency != 0 {
            rand::random::<u32>() % grid_dim % frequency
        } else {
            0
        };

        let header = PatchBufferHeader {
            full: 0,
            analysis: 0,
            head_index: 0,
            tail_index: 0,
            size: self.record_count as u32,
            num_threads: grid_dim * block_dim,
            block_sampling_frequency: frequency,
            block_sampling_offset: offset,
            kind: self.kind.as_u32(),
            flags: PATCH_FLAG_NONE,
            records: state.records_device.0,
        };
        check(self.api.memcpy_host_to_device(
            state.buffer_device,
            &header.to_bytes(),
            handle_stream,
        ));
        check(self.api.set_callback_data(handle_stream, state.buffer_device));

        if self.analysis_blocks != 0 {
            if let (Some(module), Some(read), Some(write)) = (
                state.analysis_module,
                state.analysis_read.as_ref(),
                state.analysis_write.as_ref(),
            ) {
                check(self.api.launch_analysis_kernel(
                    module,
                    self.analysis_blocks,
                    ANALYSIS_KERNEL_THREADS,
                    state.kernel_stream,
                    &[state.buffer_device, read.header_device, write.header_device],
                ));
            }
        }

        LaunchInfo {
            num_threads: grid_dim as u64 * block_dim as u64,
            num_left_threads: num_left_threads(grid_dim, block_dim, frequency, offset),
        }
    }

    /// Drain loop run on the launching thread after the kernel was
    /// submitted; returns when every observed thread has exited and the
    /// last records are consumed.
    #[allow(clippy::too_many_arguments)]
    pub fn kernel_launch_end(
        &self,
        thread: &SanitizerThread,
        state: &ContextState,
        info: LaunchInfo,
        handle_stream: StreamHandle,
        cubin_id: u32,
        mod_id: u32,
        kernel_node: CctNodeId,
        host_op_id: u64,
    ) {
        let mut header_bytes = [0u8; PatchBufferHeader::SIZE];
        loop {
            check(self.api.memcpy_device_to_host(
                &mut header_bytes,
                state.buffer_device,
                state.priority_stream,
            ));
            let header = PatchBufferHeader::from_bytes(&header_bytes);
            let num_records = header.head_index as usize;

            if self.analysis_blocks != 0 {
                self.analyze_pass(state, cubin_id, mod_id, kernel_node, host_op_id, false);
            }

            // wait until the device filled the ring or every thread exited
            let kernel_done = header.num_threads as u64 == info.num_left_threads;
            if !(kernel_done || header.full != 0) || num_records == 0 {
                if kernel_done {
                    break;
                }
                continue;
            }

            if self.analysis_blocks == 0 {
                self.drain_records(
                    thread, state, &header, num_records, cubin_id, mod_id, kernel_node, host_op_id,
                );
            }

            if self.analysis_async {
                // a signal may be missed under concurrent launches; the
                // final consume below still sees every record
                self.signal_analysis_worker();
            }

            if kernel_done {
                break;
            }
        }

        if self.analysis_blocks != 0 {
            self.analyze_pass(state, cubin_id, mod_id, kernel_node, host_op_id, true);
        }

        check(self.api.stream_synchronize(handle_stream));
        check(self.api.stream_synchronize(state.priority_stream));
        if self.analysis_blocks != 0 {
            check(self.api.stream_synchronize(state.kernel_stream));
        }

        if !self.analysis_async {
            self.consume_thread(thread);
        }
    }

    /// Copy the device records into a pooled host buffer, clear `full`
    /// (and only `full`), and stage the buffer on the thread's channel.
    #[allow(clippy::too_many_arguments)]
    fn drain_records(
        &self,
        thread: &SanitizerThread,
        state: &ContextState,
        header: &PatchBufferHeader,
        num_records: usize,
        cubin_id: u32,
        mod_id: u32,
        kernel_node: CctNodeId,
        host_op_id: u64,
    ) {
        let mut host = self.pool.acquire();
        if host.is_none() && !self.analysis_async {
            // pool exhausted in synchronous mode: drain our own channel
            // inline, then retry
            self.consume_thread(thread);
            host = self.pool.acquire();
        }
        let mut host = host.unwrap_or_else(SanitizerBuffer::empty);

        host.cubin_id = cubin_id;
        host.mod_id = mod_id;
        host.kernel_node = kernel_node;
        host.host_op_id = host_op_id;
        host.header = *header;
        host.record_count = num_records;
        host.records.resize(num_records * MemoryAccessRecord::SIZE, 0);
        check(self.api.memcpy_device_to_host(
            &mut host.records,
            DevicePtr(header.records),
            state.priority_stream,
        ));

        // write back the leading word only; the device keeps indexing
        check(self.api.memcpy_host_to_device(
            state.buffer_device,
            &0u32.to_le_bytes(),
            state.priority_stream,
        ));

        self.stats.add_sanitizer_records(num_records as u64);
        thread.channel.produce(host);
    }

    /// One pass over the analysis-mode address buffers. With `end` set the
    /// kernel is done: copy what remains and clear both `full` and
    /// `analysis` so the on-device analysis kernel terminates.
    fn analyze_pass(
        &self,
        state: &ContextState,
        cubin_id: u32,
        mod_id: u32,
        kernel_node: CctNodeId,
        host_op_id: u64,
        end: bool,
    ) {
        let buffers = [state.analysis_write.as_ref(), state.analysis_read.as_ref()];
        for analysis in buffers.into_iter().flatten() {
            let mut header_bytes = [0u8; PatchBufferHeader::SIZE];
            check(self.api.memcpy_device_to_host(
                &mut header_bytes,
                analysis.header_device,
                state.priority_stream,
            ));
            let mut header = PatchBufferHeader::from_bytes(&header_bytes);
            let num_records = header.head_index as usize;

            if !end && header.full == 0 {
                continue;
            }

            let mut records = vec![0u8; num_records * AddressDiffRecord::SIZE];
            if num_records > 0 {
                check(self.api.memcpy_device_to_host(
                    &mut records,
                    DevicePtr(header.records),
                    state.priority_stream,
                ));
            }

            header.full = 0;
            if end {
                // producer done: the analysis kernel sees both words clear
                header.analysis = 0;
                check(self.api.memcpy_host_to_device(
                    analysis.header_device,
                    &header.to_bytes()[..8],
                    state.priority_stream,
                ));
            } else {
                check(self.api.memcpy_host_to_device(
                    analysis.header_device,
                    &0u32.to_le_bytes(),
                    state.priority_stream,
                ));
            }

            self.analysis.process(&SanitizerBuffer {
                cubin_id,
                mod_id,
                kernel_node,
                host_op_id,
                header,
                record_count: num_records,
                records,
            });
        }
    }

    /// Drain the calling thread's channel into the analysis sink.
    pub fn consume_thread(&self, thread: &SanitizerThread) -> usize {
        let analysis = &self.analysis;
        let pool = &self.pool;
        thread.channel.consume(|buffer| {
            analysis.process(&buffer);
            pool.release(buffer);
        })
    }

    fn spawn_analysis_worker(&self) {
        let channels = self.channels.clone();
        let analysis = self.analysis.clone();
        let pool = self.pool.clone();
        let signal = self.worker_signal.clone();
        let stop = self.worker_stop.clone();

        let handle = std::thread::Builder::new()
            .name("gpu-sanitizer".into())
            .spawn(move || loop {
                let stopping = stop.load(AtomicOrdering::SeqCst);
                channels.consume_all(|buffer| {
                    analysis.process(&buffer);
                    pool.release(buffer);
                });
                if stopping {
                    break;
                }
                let (lock, cond) = &*signal;
                let guard = lock.lock().expect("sanitizer signal lock");
                let (mut guard, _) = cond
                    .wait_timeout_while(guard, std::time::Duration::from_millis(50), |wake| {
                        !*wake
                    })
                    .expect("sanitizer signal wait");
                *guard = false;
            })
            .expect("spawn sanitizer worker");
        *self.worker_handle.lock().expect("sanitizer handle lock") = Some(handle);
    }

    fn signal_analysis_worker(&self) {
        let (lock, cond) = &*self.worker_signal;
        if let Ok(mut wake) = lock.lock() {
            *wake = true;
        }
        cond.notify_one();
    }

    /// Stop the background worker after a final drain of every channel.
    pub fn shutdown(&self) {
        self.worker_stop.store(true, AtomicOrdering::SeqCst);
        self.signal_analysis_worker();
        if let Some(handle) = self
            .worker_handle
            .lock()
            .expect("sanitizer handle lock")
            .take()
        {
            let _ = handle.join();
        }
        // synchronous mode or records staged after the worker exited
        let analysis = &self.analysis;
        let pool = &self.pool;
        self.channels.consume_all(|buffer| {
            analysis.process(&buffer);
            pool.release(buffer);
        });
    }
}
