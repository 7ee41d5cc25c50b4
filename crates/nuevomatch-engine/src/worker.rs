//! Workers
//!
//! A worker runs the full iSet pipeline plus the remainder call for one group
//! of subsets on one processing unit. The serial worker runs inline in the
//! caller; the parallel worker owns a bounded SPSC job queue and a dedicated
//! thread pinned to a core. Both publish result batches to their listeners.
//!
//! The secondary search interleaves across iSets, not across packets within
//! one iSet: each outer step issues independent loads against every iSet's
//! boundary array so outstanding cache misses overlap.

use crate::config::NuevoMatchConfig;
use crate::error::{ClassifierError, Result};
use crate::interval_set::{IntervalSet, IntervalSetInfoBatch};
use crate::remainder::RemainderClassifier;
use crate::spsc;
use crossbeam_utils::Backoff;
use nuevomatch_common::{empty_action_batch, ActionBatch, PacketBatch, Scalar};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Instant;

/// Receives result batches published by a worker.
///
/// Callbacks run synchronously on the worker's processing unit, in
/// registration order, with strictly increasing `batch_id` per worker.
pub trait WorkerListener<const N: usize>: Send + Sync {
    /// Invoked by the worker for every completed batch
    fn on_new_result(&self, results: &ActionBatch<N>, worker_idx: u32, batch_id: u32);
}

/// A unit of work flowing through a worker queue
#[derive(Debug, Clone, Copy)]
pub(crate) struct Job<const N: usize> {
    pub packets: PacketBatch<N>,
    pub batch_id: u32,
}

/// The stage short-circuit switches a worker consults per batch
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineOptions {
    /// Return the no-match batch immediately
    pub disable_all_classification: bool,
    /// Skip secondary search, validation, and remainder
    pub disable_bin_search: bool,
    /// Skip the validation stage
    pub disable_validation_phase: bool,
    /// Skip the remainder stage
    pub disable_remainder: bool,
}

impl PipelineOptions {
    pub(crate) fn from_config<const N: usize>(config: &NuevoMatchConfig<N>) -> Self {
        Self {
            disable_all_classification: config.disable_all_classification,
            disable_bin_search: config.disable_bin_search,
            disable_validation_phase: config.disable_validation_phase,
            disable_remainder: config.disable_remainder,
        }
    }
}

/// Number of secondary-search iterations for an initial error bound.
///
/// The loop halves the bound each step, so it runs `ceil(log2(e + 1))` times.
#[inline(always)]
pub(crate) fn search_iterations(max_error: u32) -> u32 {
    32 - max_error.leading_zeros()
}

/// Nanoseconds on the engine's process-local monotonic clock.
///
/// Worker accounting only ever subtracts readings, so the epoch is the first
/// call, not any wall-clock reference.
#[inline(always)]
fn clock_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Lock-free per-worker counters (shared with the processing unit).
///
/// Times are engine-clock nanoseconds; snapshots report microseconds.
#[derive(Debug)]
pub struct WorkerStats {
    jobs: AtomicU64,
    rejected: AtomicU64,
    work_ns: AtomicU64,
    publish_ns: AtomicU64,
    window_start_ns: AtomicU64,
    window_end_ns: AtomicU64,
}

impl WorkerStats {
    fn new() -> Self {
        Self {
            jobs: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            work_ns: AtomicU64::new(0),
            publish_ns: AtomicU64::new(0),
            window_start_ns: AtomicU64::new(clock_ns()),
            window_end_ns: AtomicU64::new(0),
        }
    }

    /// Reset all counters and open a new measurement window
    pub fn start_measurement(&self) {
        self.jobs.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
        self.work_ns.store(0, Ordering::Relaxed);
        self.publish_ns.store(0, Ordering::Relaxed);
        self.window_end_ns.store(0, Ordering::Relaxed);
        self.window_start_ns.store(clock_ns(), Ordering::Relaxed);
    }

    /// Close the measurement window
    pub fn stop_measurement(&self) {
        self.window_end_ns.store(clock_ns(), Ordering::Relaxed);
    }

    #[inline(always)]
    fn record_work(&self, nanos: u64) {
        self.jobs.fetch_add(1, Ordering::Relaxed);
        self.work_ns.fetch_add(nanos, Ordering::Relaxed);
    }

    #[inline(always)]
    fn record_publish(&self, nanos: u64) {
        self.publish_ns.fetch_add(nanos, Ordering::Relaxed);
    }

    #[inline(always)]
    fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Length of the current measurement window in microseconds.
    ///
    /// An open window (no `stop_measurement` yet) is measured up to now.
    pub fn window_micros(&self) -> f64 {
        let start = self.window_start_ns.load(Ordering::Relaxed);
        let mut end = self.window_end_ns.load(Ordering::Relaxed);
        if end <= start {
            end = clock_ns();
        }
        (end - start) as f64 / 1e3
    }

    /// Snapshot the current window
    pub fn snapshot(&self) -> WorkerPerf {
        let window_us = self.window_micros();

        let jobs = self.jobs.load(Ordering::Relaxed);
        let rejected = self.rejected.load(Ordering::Relaxed);
        let work_us = self.work_ns.load(Ordering::Relaxed) as f64 / 1e3;
        let publish_us = self.publish_ns.load(Ordering::Relaxed) as f64 / 1e3;

        WorkerPerf {
            jobs,
            rejected,
            throughput: if window_us > 0.0 {
                jobs as f64 / window_us
            } else {
                0.0
            },
            utilization: if window_us > 0.0 {
                (work_us / window_us).min(1.0)
            } else {
                0.0
            },
            backpressure: if window_us > 0.0 {
                rejected as f64 / window_us
            } else {
                0.0
            },
            average_work_time_us: if jobs > 0 { work_us / jobs as f64 } else { 0.0 },
            publish_time_us: publish_us,
        }
    }
}

/// Non-atomic snapshot of a worker's measurement window
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WorkerPerf {
    /// Jobs completed in the window
    pub jobs: u64,
    /// Jobs rejected with backpressure in the window
    pub rejected: u64,
    /// Completed jobs per microsecond
    pub throughput: f64,
    /// Fraction of the window spent working
    pub utilization: f64,
    /// Rejections per microsecond
    pub backpressure: f64,
    /// Mean time per job in microseconds (publish included)
    pub average_work_time_us: f64,
    /// Total time spent in listener callbacks, microseconds
    pub publish_time_us: f64,
}

/// The unit of grouping onto workers: an iSet or the remainder adapter
pub enum Subset<const N: usize> {
    /// A learned-index interval set
    IntervalSet(IntervalSet),
    /// The shared remainder classifier
    Remainder(Arc<dyn RemainderClassifier<N>>),
}

impl<const N: usize> Subset<N> {
    /// Serialized size in bytes; the load-balancing weight
    pub fn size_bytes(&self) -> u32 {
        match self {
            Subset::IntervalSet(iset) => iset.size_bytes(),
            Subset::Remainder(remainder) => remainder.size_bytes(),
        }
    }

    /// Number of rules this subset covers
    pub fn num_rules(&self) -> u32 {
        match self {
            Subset::IntervalSet(iset) => iset.num_rules(),
            Subset::Remainder(remainder) => remainder.num_rules(),
        }
    }

    /// Short description for logs
    pub fn describe(&self) -> String {
        match self {
            Subset::IntervalSet(iset) => format!(
                "iSet {} (field {}, {} rules)",
                iset.iset_index(),
                iset.field_index(),
                iset.num_rules()
            ),
            Subset::Remainder(remainder) => {
                format!("{} ({} rules)", remainder.name(), remainder.num_rules())
            }
        }
    }
}

/// Per-packet search state, sized once against the worker's iSet count
#[derive(Debug, Default)]
struct Scratch<const N: usize> {
    info: Vec<IntervalSetInfoBatch<N>>,
    key: Vec<Scalar>,
    position: Vec<u32>,
    u_bound: Vec<u32>,
    l_bound: Vec<u32>,
    current: Vec<bool>,
    next: Vec<bool>,
}

impl<const N: usize> Scratch<N> {
    fn resize(&mut self, num_isets: usize) {
        self.info
            .resize(num_isets, [Default::default(); N]);
        self.key.resize(num_isets, 0.0);
        self.position.resize(num_isets, 0);
        self.u_bound.resize(num_isets, 0);
        self.l_bound.resize(num_isets, 0);
        self.current.resize(num_isets, false);
        self.next.resize(num_isets, false);
    }
}

/// The pipeline kernel shared by both worker variants.
///
/// Owns its subsets exclusively; the remainder is shared with the container
/// for packing but never mutated after load.
pub(crate) struct WorkerCore<const N: usize> {
    worker_idx: u32,
    options: PipelineOptions,
    isets: Vec<IntervalSet>,
    remainder: Option<Arc<dyn RemainderClassifier<N>>>,
    listeners: Arc<RwLock<Vec<Arc<dyn WorkerListener<N>>>>>,
    stats: Arc<WorkerStats>,
    scratch: Scratch<N>,
}

impl<const N: usize> WorkerCore<N> {
    pub fn new(worker_idx: u32, options: PipelineOptions) -> Self {
        Self {
            worker_idx,
            options,
            isets: Vec::new(),
            remainder: None,
            listeners: Arc::new(RwLock::new(Vec::new())),
            stats: Arc::new(WorkerStats::new()),
            scratch: Scratch::default(),
        }
    }

    pub fn worker_idx(&self) -> u32 {
        self.worker_idx
    }

    pub fn stats_handle(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    pub fn listeners_handle(&self) -> Arc<RwLock<Vec<Arc<dyn WorkerListener<N>>>>> {
        self.listeners.clone()
    }

    /// Take ownership of a subset. At most one remainder per worker.
    pub fn add_subset(&mut self, subset: Subset<N>) -> Result<()> {
        match subset {
            Subset::IntervalSet(iset) => self.isets.push(iset),
            Subset::Remainder(remainder) => {
                if self.remainder.is_some() {
                    return Err(ClassifierError::DuplicateRemainder);
                }
                self.remainder = Some(remainder);
            }
        }
        self.scratch.resize(self.isets.len());
        Ok(())
    }

    /// Number of subsets held
    pub fn count(&self) -> u32 {
        self.isets.len() as u32 + u32::from(self.remainder.is_some())
    }

    /// Number of rules held across all subsets
    pub fn num_rules(&self) -> u32 {
        let iset_rules: u32 = self.isets.iter().map(IntervalSet::num_rules).sum();
        iset_rules
            + self
                .remainder
                .as_ref()
                .map(|r| r.num_rules())
                .unwrap_or(0)
    }

    /// Description of the held subsets for logs
    pub fn describe(&self) -> String {
        let mut parts = Vec::with_capacity(self.isets.len() + 1);
        if let Some(remainder) = &self.remainder {
            parts.push(format!("{} ({} rules)", remainder.name(), remainder.num_rules()));
        }
        for iset in &self.isets {
            parts.push(format!(
                "iSet {} (field {}, {} rules)",
                iset.iset_index(),
                iset.field_index(),
                iset.num_rules()
            ));
        }
        format!("<{}>", parts.join(", "))
    }

    /// Classify one job and publish the result batch
    pub fn work(&mut self, job: &Job<N>) -> ActionBatch<N> {
        let start = clock_ns();
        let output = self.run_pipeline(&job.packets);
        self.publish(&output, job.batch_id);
        self.stats.record_work(clock_ns().saturating_sub(start));
        output
    }

    /// Classify without publishing; the container's single-header path
    pub fn classify_inline(&mut self, packets: &PacketBatch<N>) -> ActionBatch<N> {
        self.run_pipeline(packets)
    }

    fn run_pipeline(&mut self, packets: &PacketBatch<N>) -> ActionBatch<N> {
        let mut output = empty_action_batch::<N>();

        if self.options.disable_all_classification {
            return output;
        }

        let Self {
            isets,
            scratch,
            options,
            remainder,
            ..
        } = self;
        let num_of_isets = isets.len();

        // Model inference, interleaved across iSets
        for (k, iset) in isets.iter().enumerate() {
            scratch.info[k] = iset.rqrmi_search(packets);
        }

        if options.disable_bin_search {
            return output;
        }

        if num_of_isets > 0 {
            for lane in 0..N {
                // Seed the bounded window from every iSet's prediction
                let mut max_error = 0u32;
                for k in 0..num_of_isets {
                    let info = scratch.info[k][lane];
                    let error = info.rqrmi_error;
                    let last = isets[k].size().saturating_sub(1);
                    let position = (info.rqrmi_output * isets[k].size() as Scalar) as u32;
                    scratch.key[k] = info.rqrmi_input;
                    scratch.position[k] = position;
                    scratch.u_bound[k] = last.min(position.saturating_add(error));
                    scratch.l_bound[k] = position.saturating_sub(error);
                    max_error = max_error.max(error);
                }

                // Secondary search, interleaved across iSets: probe all
                // boundary arrays, then move every position. The window
                // halves each step, so the loop runs exactly
                // ceil(log2(max_error + 1)) times.
                for _ in 0..search_iterations(max_error) {
                    for k in 0..num_of_isets {
                        let position = scratch.position[k];
                        scratch.current[k] = isets[k].get_index(position) <= scratch.key[k];
                        scratch.next[k] = isets[k].get_index(position + 1) > scratch.key[k];
                    }

                    for k in 0..num_of_isets {
                        if scratch.current[k] && scratch.next[k] {
                            // Target interval found; hold position
                        } else if scratch.current[k] {
                            scratch.l_bound[k] = scratch.position[k];
                            let sum = scratch.l_bound[k] + scratch.u_bound[k];
                            scratch.position[k] = (sum >> 1) + (sum & 1); // ceil
                        } else if scratch.info[k][lane].valid {
                            scratch.u_bound[k] = scratch.position[k];
                            scratch.position[k] = (scratch.l_bound[k] + scratch.u_bound[k]) >> 1;
                        }
                    }
                }

                if options.disable_validation_phase {
                    continue;
                }
                let Some(header) = &packets[lane] else {
                    continue;
                };

                // Validation, again interleaved across iSets; keep the
                // highest-ranked confirmed match.
                for k in 0..num_of_isets {
                    let candidate = isets[k].do_validation(header, scratch.position[k]);
                    if output[lane].outranked_by(&candidate) {
                        output[lane] = candidate;
                    }
                }
            }
        }

        if !options.disable_remainder {
            if let Some(remainder) = remainder {
                remainder.classify_batch(packets, &mut output);
            }
        }

        output
    }

    fn publish(&self, results: &ActionBatch<N>, batch_id: u32) {
        let start = clock_ns();
        let listeners = self.listeners.read();
        for listener in listeners.iter() {
            listener.on_new_result(results, self.worker_idx, batch_id);
        }
        self.stats.record_publish(clock_ns().saturating_sub(start));
    }
}

/// A worker running inline on the caller's processing unit
pub struct WorkerSerial<const N: usize> {
    core: WorkerCore<N>,
}

impl<const N: usize> WorkerSerial<N> {
    /// Create an empty serial worker
    pub fn new(worker_idx: u32, options: PipelineOptions) -> Self {
        Self {
            core: WorkerCore::new(worker_idx, options),
        }
    }

    /// Take ownership of a subset
    pub fn add_subset(&mut self, subset: Subset<N>) -> Result<()> {
        self.core.add_subset(subset)
    }

    /// Register a listener; must happen before classification starts
    pub fn add_listener(&self, listener: Arc<dyn WorkerListener<N>>) {
        self.core.listeners.write().push(listener);
    }

    /// Classify a batch inline. Always consumes the batch.
    pub fn classify(&mut self, batch_id: u32, packets: &PacketBatch<N>) -> bool {
        self.core.work(&Job {
            packets: *packets,
            batch_id,
        });
        true
    }

    /// Classify a batch and hand back the results without publishing
    pub(crate) fn classify_inline(&mut self, packets: &PacketBatch<N>) -> ActionBatch<N> {
        self.core.classify_inline(packets)
    }

    /// Shared counter handle
    pub fn stats(&self) -> Arc<WorkerStats> {
        self.core.stats_handle()
    }

    /// Number of subsets held
    pub fn count(&self) -> u32 {
        self.core.count()
    }

    /// Number of rules held
    pub fn num_rules(&self) -> u32 {
        self.core.num_rules()
    }

    /// Description of the held subsets
    pub fn describe(&self) -> String {
        self.core.describe()
    }
}

/// A worker with a dedicated processing unit and a bounded job queue.
///
/// `classify` enqueues without blocking; `false` is the backpressure signal
/// and the caller decides whether to retry, drop, or apply admission control.
/// Teardown drains the queue, then joins the thread.
pub struct WorkerParallel<const N: usize> {
    worker_idx: u32,
    producer: spsc::Producer<Job<N>>,
    stats: Arc<WorkerStats>,
    listeners: Arc<RwLock<Vec<Arc<dyn WorkerListener<N>>>>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl<const N: usize> std::fmt::Debug for WorkerParallel<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerParallel")
            .field("worker_idx", &self.worker_idx)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl<const N: usize> WorkerParallel<N> {
    /// Spawn a processing unit for `core`, optionally pinned to a CPU core
    pub(crate) fn spawn(
        mut core: WorkerCore<N>,
        queue_size: u32,
        core_id: Option<core_affinity::CoreId>,
    ) -> Result<Self> {
        if queue_size == 0 || !queue_size.is_power_of_two() {
            return Err(ClassifierError::InvalidQueueSize(queue_size));
        }

        let worker_idx = core.worker_idx();
        let stats = core.stats_handle();
        let listeners = core.listeners_handle();
        let running = Arc::new(AtomicBool::new(true));

        let (producer, mut consumer) = spsc::channel::<Job<N>>(queue_size as usize);
        let thread_running = running.clone();

        let handle = std::thread::Builder::new()
            .name(format!("nm-worker-{worker_idx}"))
            .spawn(move || {
                if let Some(id) = core_id {
                    if !core_affinity::set_for_current(id) {
                        tracing::warn!(worker_idx, core = id.id, "failed to pin worker to core");
                    }
                }

                let backoff = Backoff::new();
                loop {
                    match consumer.try_pop() {
                        Some(job) => {
                            backoff.reset();
                            core.work(&job);
                        }
                        None => {
                            // Queue drained; only now honor a stop request
                            if !thread_running.load(Ordering::Acquire) {
                                break;
                            }
                            backoff.snooze();
                        }
                    }
                }
            })
            .map_err(|e| ClassifierError::SpawnFailed(e.to_string()))?;

        Ok(Self {
            worker_idx,
            producer,
            stats,
            listeners,
            running,
            handle: Some(handle),
        })
    }

    /// Worker index
    pub fn worker_idx(&self) -> u32 {
        self.worker_idx
    }

    /// Register a listener; must happen before classification starts
    pub fn add_listener(&self, listener: Arc<dyn WorkerListener<N>>) {
        self.listeners.write().push(listener);
    }

    /// Try to enqueue a batch. `false` means the queue is full.
    pub fn classify(&mut self, batch_id: u32, packets: &PacketBatch<N>) -> bool {
        let job = Job {
            packets: *packets,
            batch_id,
        };
        match self.producer.try_push(job) {
            Ok(()) => true,
            Err(_) => {
                self.stats.record_rejected();
                false
            }
        }
    }

    /// Shared counter handle
    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }
}

impl<const N: usize> Drop for WorkerParallel<N> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
