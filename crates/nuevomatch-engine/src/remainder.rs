//! Remainder classifiers
//!
//! The remainder stage is an exact classifier covering every rule no iSet
//! validates. The engine treats it as an opaque object with a
//! build/pack/load/classify/size contract; two implementations are provided.
//!
//! Both pack themselves as a type tag, their construction knobs, and the rule
//! list they were built from; `load` rebuilds the derived structure.

use nuevomatch_common::{
    read_rule_list, write_rule_list, ActionBatch, ActionOutput, MatchRule, ObjectPacker,
    ObjectReader, PacketBatch, PacketHeader, ReadError, ReadResult,
};
use std::collections::HashMap;
use std::fmt;

const CUTSPLIT_TAG: u32 = 1;
const TUPLEMERGE_TAG: u32 = 2;

/// The contract a remainder classifier exposes to the engine.
///
/// `classify_batch` must be monotone: a lane's result may only be overwritten
/// by a strictly higher-ranked match.
pub trait RemainderClassifier<const N: usize>: Send + Sync + fmt::Debug {
    /// Build the classifier from a rule list
    fn build(&mut self, rules: &[MatchRule]);

    /// Load the classifier from its packed form
    fn load(&mut self, reader: &mut ObjectReader<'_>) -> ReadResult<()>;

    /// Pack the classifier to bytes
    fn pack(&self) -> ObjectPacker;

    /// Classify a batch, improving `current` where a better match exists
    fn classify_batch(&self, packets: &PacketBatch<N>, current: &mut ActionBatch<N>);

    /// Number of rules this classifier covers
    fn num_rules(&self) -> u32;

    /// Serialized size in bytes, used for load balancing
    fn size_bytes(&self) -> u32;

    /// Short type name for logs
    fn name(&self) -> &'static str;

    /// Clone into a fresh boxed instance
    fn boxed_clone(&self) -> Box<dyn RemainderClassifier<N>>;
}

#[inline]
fn rule_list_packed_size(rules: &[MatchRule]) -> u32 {
    let body: usize = rules.iter().map(|r| 12 + 8 * r.fields.len()).sum();
    (4 + body) as u32
}

/// Merge a candidate into a lane, keeping the higher-ranked match
#[inline(always)]
fn improve(current: &mut ActionOutput, candidate: ActionOutput) {
    if current.outranked_by(&candidate) {
        *current = candidate;
    }
}

// ============================================================================
// CutSplit
// ============================================================================

/// Bucket array cut over one separable dimension
#[derive(Debug, Clone)]
struct CutGroup {
    dim: usize,
    base: u32,
    top: u32,
    cell: u64,
    /// Rules in each bucket stay sorted by priority
    buckets: Vec<Vec<MatchRule>>,
}

impl CutGroup {
    fn new(dim: usize, rules: &[MatchRule], binth: u32) -> Self {
        debug_assert!(!rules.is_empty());
        let base = rules.iter().map(|r| r.fields[dim].low).min().unwrap_or(0);
        let top = rules
            .iter()
            .map(|r| r.fields[dim].high)
            .max()
            .unwrap_or(u32::MAX);
        let span = (top as u64 - base as u64) + 1;

        let wanted = (rules.len() as u32).div_ceil(binth.max(1)) as usize;
        let num_buckets = wanted.next_power_of_two().clamp(1, 1 << 12);
        let cell = span.div_ceil(num_buckets as u64).max(1);

        let mut buckets = vec![Vec::new(); num_buckets];
        for rule in rules {
            let first = ((rule.fields[dim].low as u64 - base as u64) / cell) as usize;
            let last = ((rule.fields[dim].high as u64 - base as u64) / cell) as usize;
            for bucket in &mut buckets[first..=last.min(num_buckets - 1)] {
                bucket.push(rule.clone());
            }
        }

        Self {
            dim,
            base,
            top,
            cell,
            buckets,
        }
    }

    #[inline]
    fn lookup(&self, header: &PacketHeader) -> ActionOutput {
        let value = header.field(self.dim);
        if value < self.base || value > self.top {
            return ActionOutput::NO_MATCH;
        }
        let bucket = ((value as u64 - self.base as u64) / self.cell) as usize;
        for rule in &self.buckets[bucket.min(self.buckets.len() - 1)] {
            if rule.matches(header) {
                // Buckets are priority-sorted; the first hit wins
                return rule.output();
            }
        }
        ActionOutput::NO_MATCH
    }
}

/// Decision-structure classifier that cuts rule space on separable fields.
///
/// Every rule lands in exactly one place: the bucket array of the first
/// dimension where its range spans fewer than `2^(32 - threshold)` values,
/// or the linear spill list when no dimension qualifies. `binth` bounds the
/// intended bucket occupancy.
#[derive(Debug, Clone)]
pub struct CutSplit {
    binth: u32,
    threshold: u32,
    rules: Vec<MatchRule>,
    groups: Vec<CutGroup>,
    spill: Vec<MatchRule>,
}

impl CutSplit {
    /// Create an empty classifier with the given construction knobs
    pub fn new(binth: u32, threshold: u32) -> Self {
        Self {
            binth,
            threshold,
            rules: Vec::new(),
            groups: Vec::new(),
            spill: Vec::new(),
        }
    }

    #[inline]
    fn small_width(&self) -> u32 {
        if self.threshold >= 32 {
            0
        } else {
            (1u64 << (32 - self.threshold)) as u32 - 1
        }
    }

    fn rebuild(&mut self) {
        self.groups.clear();
        self.spill.clear();

        let small_width = self.small_width();
        let num_dims = self
            .rules
            .iter()
            .map(|r| r.fields.len())
            .max()
            .unwrap_or(0);

        let mut per_dim: Vec<Vec<MatchRule>> = vec![Vec::new(); num_dims];
        for rule in &self.rules {
            let separable = rule
                .fields
                .iter()
                .position(|f| f.high - f.low <= small_width);
            match separable {
                Some(dim) => per_dim[dim].push(rule.clone()),
                None => self.spill.push(rule.clone()),
            }
        }

        for (dim, rules) in per_dim.into_iter().enumerate() {
            if !rules.is_empty() {
                self.groups.push(CutGroup::new(dim, &rules, self.binth));
            }
        }
    }

    #[inline]
    fn lookup(&self, header: &PacketHeader) -> ActionOutput {
        let mut best = ActionOutput::NO_MATCH;
        for group in &self.groups {
            improve(&mut best, group.lookup(header));
        }
        for rule in &self.spill {
            if rule.matches(header) {
                improve(&mut best, rule.output());
                break;
            }
        }
        best
    }
}

impl Default for CutSplit {
    /// The canonical construction knobs: binth 8, threshold 24
    fn default() -> Self {
        Self::new(8, 24)
    }
}

impl<const N: usize> RemainderClassifier<N> for CutSplit {
    fn build(&mut self, rules: &[MatchRule]) {
        self.rules = rules.to_vec();
        self.rules.sort_by_key(|r| r.priority);
        self.rebuild();
    }

    fn load(&mut self, reader: &mut ObjectReader<'_>) -> ReadResult<()> {
        let tag = reader.read_u32()?;
        if tag != CUTSPLIT_TAG {
            return Err(ReadError::InvalidValue(format!(
                "expected a cutsplit blob (tag {CUTSPLIT_TAG}), found tag {tag}"
            )));
        }
        self.binth = reader.read_u32()?;
        self.threshold = reader.read_u32()?;
        self.rules = read_rule_list(reader)?;
        self.rules.sort_by_key(|r| r.priority);
        self.rebuild();
        Ok(())
    }

    fn pack(&self) -> ObjectPacker {
        let mut packer = ObjectPacker::new();
        packer.push_u32(CUTSPLIT_TAG);
        packer.push_u32(self.binth);
        packer.push_u32(self.threshold);
        write_rule_list(&mut packer, &self.rules);
        packer
    }

    fn classify_batch(&self, packets: &PacketBatch<N>, current: &mut ActionBatch<N>) {
        for (lane, packet) in packets.iter().enumerate() {
            if let Some(header) = packet {
                improve(&mut current[lane], self.lookup(header));
            }
        }
    }

    fn num_rules(&self) -> u32 {
        self.rules.len() as u32
    }

    fn size_bytes(&self) -> u32 {
        12 + rule_list_packed_size(&self.rules)
    }

    fn name(&self) -> &'static str {
        "cutsplit"
    }

    fn boxed_clone(&self) -> Box<dyn RemainderClassifier<N>> {
        Box::new(self.clone())
    }
}

// ============================================================================
// TupleMerge
// ============================================================================

/// FNV-1a over a word sequence (the flow-key hash recipe)
#[inline(always)]
fn fnv1a(words: impl Iterator<Item = u32>) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut h = FNV_OFFSET;
    for word in words {
        for byte in word.to_ne_bytes() {
            h ^= byte as u64;
            h = h.wrapping_mul(FNV_PRIME);
        }
    }
    h
}

/// Per-field mask bits covering a rule's range, coarsened to 4-bit steps so
/// near-identical tuples merge into one table.
fn rule_tuple(rule: &MatchRule) -> Vec<u8> {
    rule.fields
        .iter()
        .map(|f| {
            let agreed = (f.low ^ f.high).leading_zeros() as u8;
            agreed & !3
        })
        .collect()
}

#[inline(always)]
fn mask_for_bits(bits: u8) -> u32 {
    if bits == 0 {
        0
    } else {
        u32::MAX << (32 - bits as u32)
    }
}

#[derive(Debug, Clone)]
struct TupleTable {
    masks: Vec<u32>,
    buckets: HashMap<u64, Vec<MatchRule>>,
}

impl TupleTable {
    fn key_for(&self, fields: impl Iterator<Item = u32>) -> u64 {
        fnv1a(fields.zip(self.masks.iter()).map(|(v, &m)| v & m))
    }

    #[inline]
    fn lookup(&self, header: &PacketHeader) -> ActionOutput {
        let key = self.key_for(header.as_slice().iter().copied().take(self.masks.len()));
        if let Some(bucket) = self.buckets.get(&key) {
            for rule in bucket {
                if rule.matches(header) {
                    return rule.output();
                }
            }
        }
        ActionOutput::NO_MATCH
    }
}

/// Hash-table classifier keyed by per-field mask tuples.
///
/// Rules with the same (coarsened) mask tuple share one hash table; buckets
/// that would exceed `collision_limit` entries overflow into a linear list.
#[derive(Debug, Clone)]
pub struct TupleMerge {
    collision_limit: u32,
    rules: Vec<MatchRule>,
    tables: Vec<TupleTable>,
    overflow: Vec<MatchRule>,
}

impl TupleMerge {
    /// Create an empty classifier with the given bucket collision limit
    pub fn new(collision_limit: u32) -> Self {
        Self {
            collision_limit: collision_limit.max(1),
            rules: Vec::new(),
            tables: Vec::new(),
            overflow: Vec::new(),
        }
    }

    fn rebuild(&mut self) {
        self.tables.clear();
        self.overflow.clear();

        let mut table_of: HashMap<Vec<u8>, usize> = HashMap::new();
        for rule in &self.rules {
            let tuple = rule_tuple(rule);
            let table_index = *table_of.entry(tuple.clone()).or_insert_with(|| {
                self.tables.push(TupleTable {
                    masks: tuple.iter().map(|&b| mask_for_bits(b)).collect(),
                    buckets: HashMap::new(),
                });
                self.tables.len() - 1
            });

            let table = &mut self.tables[table_index];
            let key = table.key_for(rule.fields.iter().map(|f| f.low));
            let bucket = table.buckets.entry(key).or_default();
            if bucket.len() < self.collision_limit as usize {
                bucket.push(rule.clone());
            } else {
                self.overflow.push(rule.clone());
            }
        }
    }

    #[inline]
    fn lookup(&self, header: &PacketHeader) -> ActionOutput {
        let mut best = ActionOutput::NO_MATCH;
        for table in &self.tables {
            improve(&mut best, table.lookup(header));
        }
        for rule in &self.overflow {
            if rule.matches(header) {
                improve(&mut best, rule.output());
                break;
            }
        }
        best
    }
}

impl Default for TupleMerge {
    fn default() -> Self {
        Self::new(40)
    }
}

impl<const N: usize> RemainderClassifier<N> for TupleMerge {
    fn build(&mut self, rules: &[MatchRule]) {
        self.rules = rules.to_vec();
        self.rules.sort_by_key(|r| r.priority);
        self.rebuild();
    }

    fn load(&mut self, reader: &mut ObjectReader<'_>) -> ReadResult<()> {
        let tag = reader.read_u32()?;
        if tag != TUPLEMERGE_TAG {
            return Err(ReadError::InvalidValue(format!(
                "expected a tuplemerge blob (tag {TUPLEMERGE_TAG}), found tag {tag}"
            )));
        }
        self.collision_limit = reader.read_u32()?.max(1);
        self.rules = read_rule_list(reader)?;
        self.rules.sort_by_key(|r| r.priority);
        self.rebuild();
        Ok(())
    }

    fn pack(&self) -> ObjectPacker {
        let mut packer = ObjectPacker::new();
        packer.push_u32(TUPLEMERGE_TAG);
        packer.push_u32(self.collision_limit);
        write_rule_list(&mut packer, &self.rules);
        packer
    }

    fn classify_batch(&self, packets: &PacketBatch<N>, current: &mut ActionBatch<N>) {
        for (lane, packet) in packets.iter().enumerate() {
            if let Some(header) = packet {
                improve(&mut current[lane], self.lookup(header));
            }
        }
    }

    fn num_rules(&self) -> u32 {
        self.rules.len() as u32
    }

    fn size_bytes(&self) -> u32 {
        8 + rule_list_packed_size(&self.rules)
    }

    fn name(&self) -> &'static str {
        "tuplemerge"
    }

    fn boxed_clone(&self) -> Box<dyn RemainderClassifier<N>> {
        Box::new(self.clone())
    }
}
