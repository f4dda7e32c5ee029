//! Seams to the embedding tool
//!
//! The profiling core never sees calling-context-tree internals, metric
//! storage, trace files or the load-module table; it drives them through
//! the traits here. In-memory implementations are provided for embedding
//! tests and for the crate's own test suite.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::activity::GpuActivity;
use crate::ip::{LoadModuleId, NormalizedIp};

/// Opaque handle to a calling-context-tree node, issued by the embedder.
pub type CctNodeId = u64;

/// Classes of GPU operation inserted as synthetic children of an API call
/// site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuOpKind {
    Sync,
    Copy,
    CopyIn,
    CopyOut,
    Kernel,
    Trace,
    Alloc,
    Delete,
}

/// Calling-context sink.
///
/// `current_context` captures the calling thread's CPU call path (the
/// embedder owns unwinding); the two insert operations extend the tree
/// below it.
pub trait CctSink: Send + Sync {
    /// Unwind the calling thread and return the node for its call path.
    fn current_context(&self) -> CctNodeId;

    /// Insert (or find) the placeholder child of `parent` for `kind`.
    fn insert_placeholder(&self, parent: CctNodeId, kind: GpuOpKind) -> CctNodeId;

    /// Insert (or find) the child of `node` at a normalized ip.
    fn insert_normalized_ip(&self, node: CctNodeId, ip: NormalizedIp) -> CctNodeId;
}

/// Metric sink: one callback delivering a translated activity plus the node
/// it attributes to.
pub trait MetricSink: Send + Sync {
    fn attribute(&self, node: CctNodeId, activity: &GpuActivity);
}

/// Per-stream trace sink.
pub trait TraceSink: Send + Sync {
    fn append(&self, stream_id: u32, node: CctNodeId, start: u64, end: u64);
}

/// Load-module table: path → stable small integer id.
pub trait LoadMap: Send + Sync {
    fn load_module_id(&self, path: &Path) -> LoadModuleId;
}

/// Arena-backed calling-context tree for tests and simple embeddings.
#[derive(Default)]
pub struct InMemoryCct {
    inner: Mutex<CctArena>,
}

#[derive(Default)]
struct CctArena {
    /// parent and edge label of each node; node 0 is the root
    nodes: Vec<(CctNodeId, CctEdge)>,
    children: HashMap<(CctNodeId, CctEdge), CctNodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CctEdge {
    Root,
    Placeholder(GpuOpKind),
    Ip(NormalizedIp),
}

impl InMemoryCct {
    pub fn new() -> Self {
        let cct = InMemoryCct::default();
        cct.inner
            .lock()
            .expect("cct lock")
            .nodes
            .push((0, CctEdge::Root));
        cct
    }

    fn insert_child(&self, parent: CctNodeId, edge: CctEdge) -> CctNodeId {
        let mut arena = self.inner.lock().expect("cct lock");
        if let Some(&existing) = arena.children.get(&(parent, edge)) {
            return existing;
        }
        let id = arena.nodes.len() as CctNodeId;
        arena.nodes.push((parent, edge));
        arena.children.insert((parent, edge), id);
        id
    }

    /// Parent of `node`, or `None` for the root.
    pub fn parent(&self, node: CctNodeId) -> Option<CctNodeId> {
        let arena = self.inner.lock().expect("cct lock");
        match arena.nodes.get(node as usize) {
            Some((parent, edge)) if !matches!(edge, CctEdge::Root) => Some(*parent),
            _ => None,
        }
    }

    /// The normalized ip labeling `node`, when it is an ip leaf.
    pub fn node_ip(&self, node: CctNodeId) -> Option<NormalizedIp> {
        let arena = self.inner.lock().expect("cct lock");
        match arena.nodes.get(node as usize) {
            Some((_, CctEdge::Ip(ip))) => Some(*ip),
            _ => None,
        }
    }

    pub fn node_count(&self) -> usize {
        self.inner.lock().expect("cct lock").nodes.len()
    }
}

impl CctSink for InMemoryCct {
    fn current_context(&self) -> CctNodeId {
        // no CPU unwinder here; every call path hangs off the root
        0
    }

    fn insert_placeholder(&self, parent: CctNodeId, kind: GpuOpKind) -> CctNodeId {
        self.insert_child(parent, CctEdge::Placeholder(kind))
    }

    fn insert_normalized_ip(&self, node: CctNodeId, ip: NormalizedIp) -> CctNodeId {
        self.insert_child(node, CctEdge::Ip(ip))
    }
}

/// Metric sink that records every attribution.
#[derive(Default)]
pub struct CollectingMetricSink {
    attributed: Mutex<Vec<(CctNodeId, GpuActivity)>>,
}

impl CollectingMetricSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<(CctNodeId, GpuActivity)> {
        std::mem::take(&mut self.attributed.lock().expect("metric lock"))
    }

    pub fn len(&self) -> usize {
        self.attributed.lock().expect("metric lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetricSink for CollectingMetricSink {
    fn attribute(&self, node: CctNodeId, activity: &GpuActivity) {
        self.attributed
            .lock()
            .expect("metric lock")
            .push((node, activity.clone()));
    }
}

/// Trace sink that buffers events per stream, in arrival order.
#[derive(Default)]
pub struct BufferingTraceSink {
    streams: Mutex<HashMap<u32, Vec<(CctNodeId, u64, u64)>>>,
}

impl BufferingTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self, stream_id: u32) -> Vec<(CctNodeId, u64, u64)> {
        self.streams
            .lock()
            .expect("trace lock")
            .get(&stream_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl TraceSink for BufferingTraceSink {
    fn append(&self, stream_id: u32, node: CctNodeId, start: u64, end: u64) {
        self.streams
            .lock()
            .expect("trace lock")
            .entry(stream_id)
            .or_default()
            .push((node, start, end));
    }
}

/// Trace sink writing one JSON-lines file per stream under a directory.
///
/// Files are created lazily on a stream's first event and named
/// `trace-<stream_id>.jsonl`; a write failure drops the event with a
/// logged warning rather than stalling the worker.
pub struct JsonlTraceSink {
    dir: PathBuf,
    files: Mutex<HashMap<u32, std::fs::File>>,
}

#[derive(serde::Serialize)]
struct TraceLine {
    node: CctNodeId,
    start: u64,
    end: u64,
}

impl JsonlTraceSink {
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(JsonlTraceSink {
            dir,
            files: Mutex::new(HashMap::new()),
        })
    }
}

impl TraceSink for JsonlTraceSink {
    fn append(&self, stream_id: u32, node: CctNodeId, start: u64, end: u64) {
        use std::io::Write;

        let mut files = self.files.lock().expect("trace file lock");
        if !files.contains_key(&stream_id) {
            let path = self.dir.join(format!("trace-{stream_id}.jsonl"));
            match std::fs::File::create(&path) {
                Ok(file) => {
                    files.insert(stream_id, file);
                }
                Err(err) => {
                    tracing::warn!(stream_id, %err, "cannot create trace file");
                    return;
                }
            }
        }
        let Some(file) = files.get_mut(&stream_id) else {
            return;
        };
        let line = TraceLine { node, start, end };
        match serde_json::to_string(&line) {
            Ok(json) => {
                if let Err(err) = writeln!(file, "{json}") {
                    tracing::warn!(stream_id, %err, "trace write failed");
                }
            }
            Err(err) => tracing::warn!(stream_id, %err, "trace encode failed"),
        }
    }
}

/// Path-keyed load-module table; ids start at 1 so 0 stays the "unknown"
/// module of the null ip.
#[derive(Default)]
pub struct InMemoryLoadMap {
    inner: Mutex<HashMap<PathBuf, LoadModuleId>>,
}

impl InMemoryLoadMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("loadmap lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LoadMap for InMemoryLoadMap {
    fn load_module_id(&self, path: &Path) -> LoadModuleId {
        let mut map = self.inner.lock().expect("loadmap lock");
        let next = (map.len() + 1) as LoadModuleId;
        *map.entry(path.to_path_buf()).or_insert(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cct_placeholder_dedup() {
        let cct = InMemoryCct::new();
        let parent = cct.current_context();
        let a = cct.insert_placeholder(parent, GpuOpKind::Kernel);
        let b = cct.insert_placeholder(parent, GpuOpKind::Kernel);
        let c = cct.insert_placeholder(parent, GpuOpKind::Copy);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(cct.parent(a), Some(parent));
    }

    #[test]
    fn test_cct_ip_leaf() {
        let cct = InMemoryCct::new();
        let ph = cct.insert_placeholder(0, GpuOpKind::Kernel);
        let ip = NormalizedIp::new(2, 0x440);
        let leaf = cct.insert_normalized_ip(ph, ip);
        assert_eq!(cct.node_ip(leaf), Some(ip));
        assert_eq!(cct.parent(leaf), Some(ph));
        // same ip dedups
        assert_eq!(cct.insert_normalized_ip(ph, ip), leaf);
    }

    #[test]
    fn test_load_map_is_stable() {
        let map = InMemoryLoadMap::new();
        let a = map.load_module_id(Path::new("/out/cubins/aa.cubin"));
        let b = map.load_module_id(Path::new("/out/cubins/bb.cubin"));
        assert_ne!(a, b);
        assert_eq!(map.load_module_id(Path::new("/out/cubins/aa.cubin")), a);
        assert!(a >= 1);
    }

    #[test]
    fn test_jsonl_trace_sink_writes_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = JsonlTraceSink::new(dir.path().join("traces")).unwrap();
        sink.append(4, 11, 100, 200);
        sink.append(4, 12, 300, 400);
        sink.append(5, 13, 50, 60);

        let body = std::fs::read_to_string(dir.path().join("traces/trace-4.jsonl")).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["node"], 11);
        assert_eq!(first["start"], 100);
        assert!(dir.path().join("traces/trace-5.jsonl").exists());
    }

    #[test]
    fn test_buffering_trace_sink_order() {
        let sink = BufferingTraceSink::new();
        sink.append(7, 1, 100, 200);
        sink.append(7, 2, 300, 400);
        sink.append(8, 3, 50, 60);
        assert_eq!(sink.events(7), vec![(1, 100, 200), (2, 300, 400)]);
        assert_eq!(sink.events(8).len(), 1);
        assert!(sink.events(9).is_empty());
    }
}
