//! Host-side callback dispatch
//!
//! The embedding tool registers thin extern callbacks with the vendor and
//! forwards every invocation here, together with the calling thread's
//! [`ThreadContext`]. The dispatcher implements the correlation protocol:
//!
//! 1. generate a host correlation id (monotone atomic counter),
//! 2. push it on the vendor's external-correlation stack,
//! 3. record the calling context and insert a placeholder child for the
//!    operation class,
//! 4. for kernel launches, resolve the launched function to a normalized ip
//!    and hang it under the placeholder,
//! 5. publish a correlation record on the thread's correlation channel.
//!
//! API exit pops the external-correlation stack. Runtime-level APIs wrap
//! driver APIs: while a runtime interval is open on a thread, nested driver
//! callbacks record nothing (the per-thread flag), and the correlation
//! record is published once, at runtime exit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::channel::ChannelSet;
use crate::config::Config;
use crate::correlation::{
    ActivityChannel, AttributedActivity, CorrelationChannel, CorrelationRecord,
};
use crate::cubin_store::CubinStore;
use crate::cubin_symbols;
use crate::ip::NormalizedIp;
use crate::relocation::RelocationMap;
use crate::sink::{CctSink, GpuOpKind, MetricSink};
use crate::vendor::{
    check, ActivityKind, CallbackDomain, CallbackSite, DriverApi, DriverCallback,
    PcSamplingConfig, ResourceEvent, RuntimeApi, RuntimeCallback, TracingApi,
};

/// Host correlation ids start above any plausible vendor id so the two
/// spaces can never collide.
const HOST_CORRELATION_SEED: u64 = 0x8000_0000_0000_0001;

/// Per-thread channels, lazily created on the thread's first instrumented
/// call and registered with the monitor's sweep set.
pub struct ThreadChannels {
    pub correlation: Arc<CorrelationChannel>,
    pub activity: Arc<ActivityChannel>,
}

/// Per-thread dispatcher state. The embedder owns one per application
/// thread (thread-local in practice) and passes it into every callback.
#[derive(Default)]
pub struct ThreadContext {
    channels: Option<Arc<ThreadChannels>>,
    /// A runtime-level API is open on this thread; nested driver callbacks
    /// are suppressed
    runtime_api_active: bool,
    /// Kernel ip resolved by the most recent launch enter, consumed when
    /// the correlation record is published
    pending_kernel_ip: Option<NormalizedIp>,
    /// The thread touched an instrumented API since the last flush
    stop_active: bool,
}

impl ThreadContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runtime_api_active(&self) -> bool {
        self.runtime_api_active
    }
}

/// Classification of an instrumented API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OpClass {
    kind: GpuOpKind,
    is_kernel: bool,
}

fn classify_driver(api: DriverApi) -> OpClass {
    use DriverApi as D;
    match api {
        D::CtxSynchronize | D::EventSynchronize | D::StreamSynchronize | D::StreamWaitEvent => {
            OpClass {
                kind: GpuOpKind::Sync,
                is_kernel: false,
            }
        }
        D::MemcpyHtoD => OpClass {
            kind: GpuOpKind::CopyIn,
            is_kernel: false,
        },
        D::MemcpyDtoH => OpClass {
            kind: GpuOpKind::CopyOut,
            is_kernel: false,
        },
        D::MemcpyDtoD | D::MemcpyOther => OpClass {
            kind: GpuOpKind::Copy,
            is_kernel: false,
        },
        D::LaunchKernel | D::LaunchCooperativeKernel | D::LaunchCooperativeKernelMultiDevice => {
            OpClass {
                kind: GpuOpKind::Kernel,
                is_kernel: true,
            }
        }
        D::MemAlloc => OpClass {
            kind: GpuOpKind::Alloc,
            is_kernel: false,
        },
        D::MemFree => OpClass {
            kind: GpuOpKind::Delete,
            is_kernel: false,
        },
    }
}

fn classify_runtime(api: RuntimeApi) -> OpClass {
    use RuntimeApi as R;
    match api {
        R::DeviceSynchronize | R::EventSynchronize | R::StreamSynchronize | R::StreamWaitEvent => {
            OpClass {
                kind: GpuOpKind::Sync,
                is_kernel: false,
            }
        }
        R::MemcpyHtoD => OpClass {
            kind: GpuOpKind::CopyIn,
            is_kernel: false,
        },
        R::MemcpyDtoH => OpClass {
            kind: GpuOpKind::CopyOut,
            is_kernel: false,
        },
        R::Memcpy => OpClass {
            kind: GpuOpKind::Copy,
            is_kernel: false,
        },
        R::Launch | R::LaunchCooperativeKernel => OpClass {
            kind: GpuOpKind::Kernel,
            is_kernel: true,
        },
    }
}

/// Dispatches vendor callbacks into the correlation pipeline.
pub struct Dispatcher {
    tracing: Arc<dyn TracingApi>,
    cct: Arc<dyn CctSink>,
    metric: Arc<dyn MetricSink>,
    cubin_store: Arc<CubinStore>,
    relocation: Arc<RelocationMap>,
    channel_set: Arc<ChannelSet<CorrelationRecord>>,
    correlation_id: AtomicU64,
    pc_sampling_frequency: Option<i32>,
}

impl Dispatcher {
    pub fn new(
        tracing: Arc<dyn TracingApi>,
        cct: Arc<dyn CctSink>,
        metric: Arc<dyn MetricSink>,
        cubin_store: Arc<CubinStore>,
        relocation: Arc<RelocationMap>,
        channel_set: Arc<ChannelSet<CorrelationRecord>>,
        config: &Config,
    ) -> Self {
        Dispatcher {
            tracing,
            cct,
            metric,
            cubin_store,
            relocation,
            channel_set,
            correlation_id: AtomicU64::new(HOST_CORRELATION_SEED),
            pc_sampling_frequency: config.pc_sampling_frequency,
        }
    }

    /// Enable the three callback domains and external-correlation records.
    pub fn subscribe(&self) {
        for domain in [
            CallbackDomain::DriverApi,
            CallbackDomain::RuntimeApi,
            CallbackDomain::Resource,
        ] {
            check(self.tracing.enable_domain(domain, true));
        }
        check(
            self.tracing
                .enable_activity_kind(None, ActivityKind::ExternalCorrelation, true),
        );
    }

    pub fn unsubscribe(&self) {
        for domain in [
            CallbackDomain::DriverApi,
            CallbackDomain::RuntimeApi,
            CallbackDomain::Resource,
        ] {
            check(self.tracing.enable_domain(domain, false));
        }
    }

    fn next_correlation_id(&self) -> u64 {
        self.correlation_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Lazily create and register this thread's channels.
    pub fn thread_channels(&self, context: &mut ThreadContext) -> Arc<ThreadChannels> {
        if let Some(channels) = &context.channels {
            return channels.clone();
        }
        let channels = Arc::new(ThreadChannels {
            correlation: Arc::new(CorrelationChannel::new()),
            activity: Arc::new(ActivityChannel::new()),
        });
        self.channel_set.register(channels.correlation.clone());
        context.channels = Some(channels.clone());
        channels
    }

    /// Drain this thread's activity channel into the metric sink. Called at
    /// the thread's own sample points and before each kernel launch.
    pub fn consume_activities(&self, context: &mut ThreadContext) -> usize {
        let channels = self.thread_channels(context);
        let metric = &self.metric;
        channels
            .activity
            .consume(|AttributedActivity { node, activity }| metric.attribute(node, &activity))
    }

    /// Resource-domain callback: module and context lifecycle.
    pub fn on_resource(&self, event: ResourceEvent<'_>) {
        match event {
            ResourceEvent::ModuleLoaded { module_id, cubin } => {
                match self.cubin_store.insert(module_id, cubin) {
                    Ok(entry) => {
                        let symbols = cubin_symbols::compute_function_offsets(cubin);
                        self.relocation.register(module_id, entry.lm_id, symbols);
                    }
                    Err(err) => {
                        tracing::error!(module_id, %err, "cubin registration failed");
                    }
                }
            }
            ResourceEvent::ModuleUnloadStarting { module_id, .. } => {
                // keep the registration: activity records for this module
                // may still be in flight
                tracing::debug!(module_id, "module unload, retaining cubin");
            }
            ResourceEvent::ContextCreated { context } => {
                for kind in [
                    ActivityKind::Memcpy,
                    ActivityKind::Kernel,
                    ActivityKind::Synchronization,
                    ActivityKind::Memset,
                    ActivityKind::Memory,
                ] {
                    check(self.tracing.enable_activity_kind(Some(context), kind, true));
                }
                if let Some(frequency) = self.pc_sampling_frequency {
                    check(self.tracing.configure_pc_sampling(
                        context,
                        PcSamplingConfig {
                            period: 0,
                            period2: frequency,
                        },
                    ));
                    check(self.tracing.enable_activity_kind(
                        Some(context),
                        ActivityKind::PcSampling,
                        true,
                    ));
                }
            }
            ResourceEvent::ContextDestroyStarting { context } => {
                tracing::debug!(?context, "context destroy");
            }
        }
    }

    /// Driver-domain callback.
    pub fn on_driver(&self, context: &mut ThreadContext, callback: DriverCallback) {
        context.stop_active = true;
        let op = classify_driver(callback.api);

        if op.is_kernel && callback.site == CallbackSite::Enter {
            // bound channel growth before the next wave of activities
            self.consume_activities(context);

            // the multi-device cooperative launch has no decodable function
            context.pending_kernel_ip =
                if callback.api == DriverApi::LaunchCooperativeKernelMultiDevice {
                    None
                } else {
                    callback.function.and_then(|function| {
                        self.tracing
                            .resolve_launched_function(function)
                            .map(|(cubin_id, function_index)| {
                                self.relocation.transform(cubin_id, function_index, 0)
                            })
                    })
                };
        }

        // a driver API issued from inside a runtime API is an
        // implementation detail of the runtime call; record nothing
        if context.runtime_api_active {
            return;
        }

        match callback.site {
            CallbackSite::Enter => {
                let correlation_id = self.next_correlation_id();
                self.publish_correlation(context, correlation_id, op);
                check(self.tracing.push_external_correlation(correlation_id));
                tracing::trace!(correlation_id, api = ?callback.api, "driver push");
            }
            CallbackSite::Exit => {
                let correlation_id = check(self.tracing.pop_external_correlation());
                tracing::trace!(correlation_id, api = ?callback.api, "driver pop");
            }
        }
    }

    /// Runtime-domain callback.
    pub fn on_runtime(&self, context: &mut ThreadContext, callback: RuntimeCallback) {
        context.stop_active = true;
        let op = classify_runtime(callback.api);

        match callback.site {
            CallbackSite::Enter => {
                context.runtime_api_active = true;
                if op.is_kernel {
                    self.consume_activities(context);
                }
                let correlation_id = self.next_correlation_id();
                check(self.tracing.push_external_correlation(correlation_id));
                tracing::trace!(correlation_id, api = ?callback.api, "runtime push");
            }
            CallbackSite::Exit => {
                context.runtime_api_active = false;
                let correlation_id = check(self.tracing.pop_external_correlation());
                // kernel ip was resolved by the nested driver launch
                self.publish_correlation(context, correlation_id, op);
                tracing::trace!(correlation_id, api = ?callback.api, "runtime pop");
            }
        }
    }

    /// Record the calling context and publish the correlation record.
    fn publish_correlation(&self, context: &mut ThreadContext, correlation_id: u64, op: OpClass) {
        let channels = self.thread_channels(context);

        let api_node = self.cct.current_context();
        let placeholder_node = self.cct.insert_placeholder(api_node, op.kind);
        let kernel_ip_node = if op.is_kernel {
            context
                .pending_kernel_ip
                .take()
                .filter(NormalizedIp::is_resolved)
                .map(|ip| self.cct.insert_normalized_ip(placeholder_node, ip))
        } else {
            None
        };

        channels.correlation.produce(CorrelationRecord {
            host_op_id: correlation_id,
            op_kind: op.kind,
            api_node,
            placeholder_node,
            kernel_ip_node,
            activity_channel: channels.activity.clone(),
        });
    }

    /// Per-thread flush hook: after an instrumented call was seen, force
    /// buffered vendor activity out and drain this thread's channel.
    pub fn device_flush(&self, context: &mut ThreadContext) {
        if !context.stop_active {
            return;
        }
        context.stop_active = false;
        check(self.tracing.flush_all());
        self.consume_activities(context);
    }
}
