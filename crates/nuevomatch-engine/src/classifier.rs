//! Classifier container
//!
//! `SerialNuevoMatch` owns a loaded classifier: the kept iSets, the remainder
//! classifier, and the workers they were grouped onto. It orchestrates
//! loading, subset filtering, remainder (re)building, load balancing, and
//! per-batch dispatch.

use crate::config::{NuevoMatchConfig, RemainderType};
use crate::error::{ClassifierError, Result};
use crate::interval_set::IntervalSet;
use crate::remainder::{CutSplit, RemainderClassifier, TupleMerge};
use crate::worker::{
    PipelineOptions, Subset, WorkerCore, WorkerListener, WorkerParallel, WorkerPerf, WorkerSerial,
};
use nuevomatch_common::{
    read_rule_list, ActionOutput, MatchRule, ObjectPacker, ObjectReader, PacketBatch, PacketHeader,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Reporting metadata kept per attached iSet; the live structures are owned
/// by the workers after grouping.
#[derive(Debug, Clone)]
struct IsetSummary {
    iset_index: u32,
    field_index: u32,
    num_rules: u32,
    size_bytes: u32,
    error_list: Vec<u32>,
    expected_error: f64,
}

/// A loaded, runnable classifier instance
pub struct SerialNuevoMatch<const N: usize = 1> {
    config: NuevoMatchConfig<N>,

    num_of_isets: u32,
    num_of_rules: u32,
    size: u32,
    build_time: u32,

    /// The original iSet region, re-emitted verbatim by `pack`
    pack_buffer: Vec<u8>,

    packet_counter: u64,
    remainder_rules: Vec<MatchRule>,
    remainder: Option<Arc<dyn RemainderClassifier<N>>>,

    serial: WorkerSerial<N>,
    parallel: Vec<WorkerParallel<N>>,
    summaries: Vec<IsetSummary>,
}

impl<const N: usize> SerialNuevoMatch<N> {
    /// Create an unloaded classifier with the given configuration
    pub fn new(config: NuevoMatchConfig<N>) -> Self {
        let options = PipelineOptions::from_config(&config);
        Self {
            config,
            num_of_isets: 0,
            num_of_rules: 0,
            size: 0,
            build_time: 0,
            pack_buffer: Vec::new(),
            packet_counter: 0,
            remainder_rules: Vec::new(),
            remainder: None,
            serial: WorkerSerial::new(0, options),
            parallel: Vec::new(),
            summaries: Vec::new(),
        }
    }

    /// Load a precompiled classifier from a packed container
    pub fn load(&mut self, reader: &mut ObjectReader<'_>) -> Result<()> {
        if self.config.num_of_cores == 0 {
            return Err(ClassifierError::InvalidCoreCount);
        }

        self.num_of_isets = reader.read_u32()?;
        self.num_of_rules = reader.read_u32()?;
        self.size = reader.read_u32()?;
        self.build_time = reader.read_u32()?;

        // The size is measured by the attached iSets, not by what was packed,
        // so filtered subsets do not count.
        self.size = 0;

        if self.config.disable_bin_search {
            info!("disabling binary search in all iSets");
        }
        if self.config.disable_remainder {
            info!("disabling remainder classifier");
        }
        if self.config.disable_validation_phase {
            info!("disabling validation phase in all iSets");
        }
        if self.config.disable_all_classification {
            info!("disabling classification");
        }

        if !self.config.disable_remainder && self.config.remainder_classifier.is_none() {
            return Err(ClassifierError::MissingRemainder);
        }

        let (kept, any_missing) = self.load_subsets(reader)?;

        // Everything consumed so far is the iSet region; keep it verbatim
        // for re-packing.
        self.pack_buffer = reader.buffer()[..reader.position()].to_vec();

        self.remainder = self.load_remainder(reader, any_missing)?;

        self.group_subsets(kept)
    }

    /// Pack this classifier: the original iSet region followed by the current
    /// remainder classifier
    pub fn pack(&self) -> ObjectPacker {
        let mut output = ObjectPacker::new();
        output.push_bytes(&self.pack_buffer);
        if let Some(remainder) = &self.remainder {
            output.push_object(&remainder.pack());
        }
        output
    }

    /// Classify one header on the caller's processing unit.
    ///
    /// Consults the subsets grouped onto worker 0; with `num_of_cores = 1`
    /// that is the whole classifier.
    pub fn classify(&mut self, header: &PacketHeader) -> ActionOutput {
        self.packet_counter += 1;

        let mut packets: PacketBatch<N> = [None; N];
        packets[0] = Some(*header);
        let output = self.serial.classify_inline(&packets);
        output[0]
    }

    /// Dispatch a batch to every worker; results arrive via the listeners.
    ///
    /// Returns `false` when any parallel worker rejected the batch with
    /// backpressure.
    pub fn classify_batch(&mut self, batch_id: u32, packets: &PacketBatch<N>) -> bool {
        self.packet_counter += packets.iter().filter(|p| p.is_some()).count() as u64;

        let mut accepted = true;
        for worker in &mut self.parallel {
            accepted &= worker.classify(batch_id, packets);
        }
        self.serial.classify(batch_id, packets);
        accepted
    }

    /// Register a listener with every worker. The listener list must be
    /// frozen before classification starts.
    pub fn add_listener(&self, listener: Arc<dyn WorkerListener<N>>) {
        self.serial.add_listener(listener.clone());
        for worker in &self.parallel {
            worker.add_listener(listener.clone());
        }
    }

    /// Number of rules in the loaded classifier
    pub fn get_num_of_rules(&self) -> u32 {
        self.num_of_rules
    }

    /// Memory size of the attached iSets in bytes
    pub fn get_size(&self) -> u32 {
        self.size
    }

    /// Build time of the precompiled classifier in milliseconds
    pub fn get_build_time(&self) -> u32 {
        self.build_time
    }

    /// Maximum number of header fields this classifier can match on;
    /// `u32::MAX` means no upper bound
    pub fn supported_number_of_fields(&self) -> u32 {
        u32::MAX
    }

    /// Packets seen since the last counter reset
    pub fn packet_count(&self) -> u64 {
        self.packet_counter
    }

    /// Reset all classifier counters
    pub fn reset_counters(&mut self) {
        self.packet_counter = 0;
    }

    /// Advance the packet counter without classifying, for packets short-cut
    /// around the classifier (caches and the like)
    pub fn advance_counter(&mut self) {
        self.packet_counter += 1;
    }

    /// Open the performance measurement window on every worker
    pub fn start_performance_measurement(&self) {
        self.serial.stats().start_measurement();
        for worker in &self.parallel {
            worker.stats().start_measurement();
        }
    }

    /// Close the performance measurement window
    pub fn stop_performance_measurement(&self) {
        self.serial.stats().stop_measurement();
        for worker in &self.parallel {
            worker.stats().stop_measurement();
        }
    }

    /// Per-worker performance snapshots; index 0 is the serial worker
    pub fn worker_perf(&self) -> Vec<WorkerPerf> {
        let mut perf = Vec::with_capacity(1 + self.parallel.len());
        perf.push(self.serial.stats().snapshot());
        for worker in &self.parallel {
            perf.push(worker.stats().snapshot());
        }
        perf
    }

    /// Log statistical information at the given verbosity
    pub fn print(&self, verbose: u32) {
        if verbose > 2 {
            for summary in &self.summaries {
                info!(
                    iset = summary.iset_index,
                    errors = ?summary.error_list,
                    "iSet error list"
                );
                info!(
                    iset = summary.iset_index,
                    expected_error = format!("{:.2}", summary.expected_error).as_str(),
                    "expected iSet error"
                );
            }
        }

        let total_us = self.serial.stats().window_micros();
        if self.packet_counter > 0 {
            info!(
                "performance: total time {:.3} usec, average time {:.3} usec per packet",
                total_us,
                total_us / self.packet_counter as f64
            );
        }

        if verbose > 1 {
            if let Some(remainder) = &self.remainder {
                info!(
                    bytes = remainder.size_bytes(),
                    "remainder classifier total size"
                );
            }
        }

        if verbose > 3 {
            if let Some(remainder) = &self.remainder {
                info!(
                    kind = remainder.name(),
                    rules = remainder.num_rules(),
                    "remainder classifier information"
                );
            }
        }
    }

    /// Clone this classifier into a fresh instance with its own workers.
    ///
    /// The clone is rebuilt from this instance's packed form under an
    /// equivalent configuration.
    pub fn try_clone(&self) -> Result<Self> {
        let config = NuevoMatchConfig {
            num_of_cores: self.config.num_of_cores,
            queue_size: self.config.queue_size,
            max_subsets: self.config.max_subsets,
            start_from_iset: self.config.start_from_iset,
            arbitrary_fields: self.config.arbitrary_fields.clone(),
            disable_isets: self.config.disable_isets,
            disable_remainder: self.config.disable_remainder,
            disable_bin_search: self.config.disable_bin_search,
            disable_validation_phase: self.config.disable_validation_phase,
            disable_all_classification: self.config.disable_all_classification,
            external_remainder: self.config.external_remainder,
            force_rebuilding_remainder: self.config.force_rebuilding_remainder,
            remainder_type: self.config.remainder_type,
            remainder_classifier: self.remainder.as_ref().map(|r| r.boxed_clone()),
        };

        let mut clone = Self::new(config);
        let packed = self.pack().into_bytes();
        let mut reader = ObjectReader::new(&packed);
        clone.load(&mut reader)?;
        Ok(clone)
    }

    /// Load every stored iSet, applying the subset filter. Skipped iSets
    /// donate their rules to the remainder set.
    fn load_subsets(&mut self, reader: &mut ObjectReader<'_>) -> Result<(Vec<IntervalSet>, bool)> {
        self.remainder_rules.clear();
        self.summaries.clear();

        let mut kept = Vec::new();
        let mut iset_rule_count = 0u32;
        let mut any_missing = false;

        for i in 0..self.num_of_isets {
            let mut sub_reader = reader.sub_reader()?;
            let mut iset = IntervalSet::load(i, &mut sub_reader)?;

            let skip_current_iset = (self.config.max_subsets >= 0
                && i >= self.config.max_subsets as u32)
                || i < self.config.start_from_iset
                || (!self.config.arbitrary_fields.is_empty()
                    && !self.config.arbitrary_fields.contains(&iset.field_index()));

            if skip_current_iset || self.config.disable_isets {
                let rules = iset.extract_rules();
                info!(iset = i, rules = rules.len(), "skipping iSet");
                self.remainder_rules.extend(rules);
                any_missing = true;
                continue;
            }

            if !self.config.arbitrary_fields.is_empty() {
                iset.rearrange_field_indices(&self.config.arbitrary_fields);
            }

            iset_rule_count += iset.num_rules();
            self.size += iset.size_bytes();
            self.summaries.push(IsetSummary {
                iset_index: i,
                field_index: iset.field_index(),
                num_rules: iset.num_rules(),
                size_bytes: iset.size_bytes(),
                error_list: iset.error_list().to_vec(),
                expected_error: iset.expected_error(),
            });
            kept.push(iset);
        }

        // The predefined remainder rule database follows the iSets
        let mut db_reader = reader.sub_reader()?;
        let predefined = read_rule_list(&mut db_reader)?;
        self.remainder_rules.extend(predefined);
        self.remainder_rules.sort_by_key(|r| r.priority);

        let net_total_rules = iset_rule_count + self.remainder_rules.len() as u32;
        info!(
            rules = net_total_rules,
            "total rules after removing validation phase duplicates"
        );
        for summary in &self.summaries {
            let coverage = if net_total_rules > 0 {
                summary.num_rules as f64 / net_total_rules as f64 * 100.0
            } else {
                0.0
            };
            info!(
                iset = summary.iset_index,
                rules = summary.num_rules,
                coverage = format!("{coverage:.2}%").as_str(),
                field = summary.field_index,
                bytes = summary.size_bytes,
                "iSet loaded"
            );
        }
        let total_coverage = if net_total_rules > 0 {
            iset_rule_count as f64 / net_total_rules as f64 * 100.0
        } else {
            0.0
        };
        info!(
            coverage = format!("{total_coverage:.2}%").as_str(),
            "total iSet coverage"
        );

        Ok((kept, any_missing))
    }

    /// Prepare the remainder classifier: keep an external one, load the
    /// stored one, or rebuild from the collected remainder rules. A failed
    /// load recovers exactly once via the rebuild path.
    fn load_remainder(
        &mut self,
        reader: &mut ObjectReader<'_>,
        any_missing: bool,
    ) -> Result<Option<Arc<dyn RemainderClassifier<N>>>> {
        if self.config.disable_remainder {
            self.config.remainder_classifier = None;
            return Ok(None);
        }

        if self.config.external_remainder {
            let instance = self
                .config
                .remainder_classifier
                .take()
                .ok_or(ClassifierError::MissingExternalRemainder)?;
            return Ok(Some(Arc::from(instance)));
        }

        let mut instance = self
            .config
            .remainder_classifier
            .take()
            .ok_or(ClassifierError::MissingRemainder)?;

        let rebuild_remainder = self.config.force_rebuilding_remainder || any_missing;

        if rebuild_remainder {
            let packed = self.build_remainder()?;
            instance
                .load(&mut ObjectReader::new(&packed))
                .map_err(ClassifierError::RemainderLoadFailed)?;
        } else {
            let loaded = reader
                .sub_reader()
                .map_err(ClassifierError::from)
                .and_then(|mut sub| instance.load(&mut sub).map_err(ClassifierError::from));
            if let Err(error) = loaded {
                warn!(%error, "error while loading remainder classifier");
                info!("recovering by rebuilding remainder classifier");
                let packed = self.build_remainder()?;
                instance
                    .load(&mut ObjectReader::new(&packed))
                    .map_err(ClassifierError::RemainderLoadFailed)?;
            }
        }

        Ok(Some(Arc::from(instance)))
    }

    /// Build a packed remainder from the collected rules with a temporary
    /// object, so a half-built structure never replaces the configured one.
    fn build_remainder(&self) -> Result<Vec<u8>> {
        info!(
            rules = self.remainder_rules.len(),
            "manually building remainder classifier"
        );
        let mut temp: Box<dyn RemainderClassifier<N>> = match self.config.remainder_type {
            RemainderType::CutSplit => Box::<CutSplit>::default(),
            RemainderType::TupleMerge => Box::<TupleMerge>::default(),
        };
        temp.build(&self.remainder_rules);
        Ok(temp.pack().into_bytes())
    }

    /// Longest-processing-time greedy partition of the live subsets over
    /// `num_of_cores` bins; bin 0 stays on the caller's processing unit.
    fn group_subsets(&mut self, kept: Vec<IntervalSet>) -> Result<()> {
        let mut subsets: Vec<Subset<N>> = kept.into_iter().map(Subset::IntervalSet).collect();
        if let Some(remainder) = &self.remainder {
            subsets.push(Subset::Remainder(remainder.clone()));
        }
        if subsets.is_empty() {
            return Err(ClassifierError::NoValidSubsets);
        }

        subsets.sort_by(|a, b| b.size_bytes().cmp(&a.size_bytes()));

        let num_of_cores = self.config.num_of_cores as usize;
        let mut bins: Vec<Vec<Subset<N>>> = (0..num_of_cores).map(|_| Vec::new()).collect();
        let mut bin_bytes = vec![0u64; num_of_cores];
        for subset in subsets {
            let target = bin_bytes
                .iter()
                .enumerate()
                .min_by_key(|(_, bytes)| **bytes)
                .map(|(bin, _)| bin)
                .unwrap_or(0);
            bin_bytes[target] += subset.size_bytes() as u64;
            bins[target].push(subset);
        }

        let options = PipelineOptions::from_config(&self.config);
        let mut bins = bins.into_iter();

        self.serial = WorkerSerial::new(0, options);
        for subset in bins.next().unwrap_or_default() {
            self.serial.add_subset(subset)?;
        }
        info!(
            worker = 0,
            subsets = self.serial.describe().as_str(),
            "serial worker ready"
        );

        self.parallel.clear();
        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        for (bin_index, bin) in bins.enumerate() {
            let worker_idx = bin_index as u32 + 1;
            let mut core = WorkerCore::new(worker_idx, options);
            for subset in bin {
                core.add_subset(subset)?;
            }
            info!(
                worker = worker_idx,
                subsets = core.describe().as_str(),
                "parallel worker ready"
            );

            let core_id = if core_ids.is_empty() {
                None
            } else {
                core_ids
                    .get(worker_idx as usize % core_ids.len())
                    .copied()
            };
            self.parallel
                .push(WorkerParallel::spawn(core, self.config.queue_size, core_id)?);
        }

        Ok(())
    }
}
