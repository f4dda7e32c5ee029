//! Pipeline assembly
//!
//! Wires the dispatcher, translator, monitor and trace subsystem around
//! their shared maps and channels. The embedding tool constructs one
//! [`GpuProfiler`] per process, forwards vendor callbacks into it, and
//! drives shutdown; everything in between is internal plumbing.

use std::sync::Arc;

use crate::channel::ChannelSet;
use crate::config::Config;
use crate::correlation::{CorrelationIdMap, FunctionIdMap, HostOpMap};
use crate::cubin_store::CubinStore;
use crate::device_map::DeviceMap;
use crate::dispatcher::Dispatcher;
use crate::monitor::Monitor;
use crate::relocation::RelocationMap;
use crate::sink::{CctSink, LoadMap, MetricSink, TraceSink};
use crate::stats::ProfilingStats;
use crate::trace::TraceSubsystem;
use crate::translate::Translator;
use crate::vendor::TracingApi;

/// Sinks the embedding tool provides.
pub struct Sinks {
    pub cct: Arc<dyn CctSink>,
    pub metric: Arc<dyn MetricSink>,
    pub trace: Arc<dyn TraceSink>,
    pub load_map: Arc<dyn LoadMap>,
}

/// The assembled GPU profiling pipeline.
pub struct GpuProfiler {
    dispatcher: Dispatcher,
    monitor: Monitor,
    stats: Arc<ProfilingStats>,
}

impl GpuProfiler {
    pub fn new(config: &Config, tracing: Arc<dyn TracingApi>, sinks: Sinks) -> Self {
        let stats = Arc::new(ProfilingStats::new());
        let relocation = Arc::new(RelocationMap::new());
        let channel_set = Arc::new(ChannelSet::new());
        let correlation_map = Arc::new(CorrelationIdMap::new());
        let function_map = Arc::new(FunctionIdMap::new());
        let device_map = Arc::new(DeviceMap::new());
        let host_op_map = Arc::new(HostOpMap::new());

        let cubin_store = Arc::new(CubinStore::new(
            config.output_dir.clone(),
            sinks.load_map,
            stats.clone(),
        ));

        let dispatcher = Dispatcher::new(
            tracing.clone(),
            sinks.cct.clone(),
            sinks.metric,
            cubin_store,
            relocation.clone(),
            channel_set.clone(),
            config,
        );

        let translator = Translator::new(
            correlation_map.clone(),
            function_map,
            device_map,
            relocation,
        );

        let trace = Arc::new(TraceSubsystem::new(config.trace_frequency_ns, sinks.trace));

        let monitor = Monitor::new(
            tracing,
            translator,
            correlation_map,
            host_op_map,
            channel_set,
            sinks.cct,
            trace,
            stats.clone(),
        );

        GpuProfiler {
            dispatcher,
            monitor,
            stats,
        }
    }

    /// Subscribe to vendor callback domains; call once at startup.
    pub fn start(&self) {
        self.dispatcher.subscribe();
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub fn stats(&self) -> &ProfilingStats {
        &self.stats
    }

    /// Flush buffered vendor activity, drain the trace workers, and
    /// unsubscribe. Call once at process exit.
    pub fn shutdown(&self) {
        self.monitor.shutdown();
        self.dispatcher.unsubscribe();
    }
}
