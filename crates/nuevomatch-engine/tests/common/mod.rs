//! Test-side stand-in for the offline toolchain: fits single-stage linear
//! models over interval boundaries, computes true error bounds, and packs
//! container blobs the engine can load.

use nuevomatch_common::{
    write_rule_list, ActionOutput, FieldRange, MatchRule, ObjectPacker, PacketHeader, Scalar,
};
use nuevomatch_engine::model::{RqrmiModel, SubModel};
use nuevomatch_engine::remainder::{CutSplit, RemainderClassifier};
use rand::rngs::StdRng;
use rand::Rng;

/// Install a test subscriber so `RUST_LOG` surfaces engine logs under test
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A synthetic rule database: per-field iSet rule groups plus remainder rules
pub struct RuleDb {
    /// `(field_index, rules)` per iSet; rules are non-overlapping on the field
    pub isets: Vec<(u32, Vec<MatchRule>)>,
    /// Rules covered by the remainder classifier only
    pub remainder: Vec<MatchRule>,
}

impl RuleDb {
    /// Every rule in the database
    pub fn all_rules(&self) -> Vec<MatchRule> {
        let mut rules: Vec<MatchRule> = self
            .isets
            .iter()
            .flat_map(|(_, rules)| rules.iter().cloned())
            .collect();
        rules.extend(self.remainder.iter().cloned());
        rules
    }

    /// Total number of rules
    pub fn len(&self) -> usize {
        self.isets.iter().map(|(_, r)| r.len()).sum::<usize>() + self.remainder.len()
    }
}

/// The highest-ranked matching rule under a plain linear scan
pub fn reference_classify(rules: &[MatchRule], header: &PacketHeader) -> ActionOutput {
    let mut best = ActionOutput::NO_MATCH;
    for rule in rules {
        if rule.matches(header) && best.outranked_by(&rule.output()) {
            best = rule.output();
        }
    }
    best
}

/// Replicates the engine's f32 position arithmetic so the packed error bound
/// is honest for the exact prediction the engine will compute.
fn predicted_position(
    slope: Scalar,
    intercept: Scalar,
    input_min: Scalar,
    input_max: Scalar,
    key: u32,
    size: u32,
) -> u32 {
    let span = input_max - input_min;
    let x = if span > 0.0 {
        ((key as Scalar - input_min) / span).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let out = (slope * x + intercept).clamp(0.0, 1.0);
    (out * size as Scalar) as u32
}

/// Least-squares fit of normalized boundary positions, plus the worst-case
/// prediction error over every interval endpoint.
fn fit_model(boundaries: &[u32]) -> RqrmiModel {
    let size = (boundaries.len() - 1) as u32;
    let input_min = boundaries[0] as Scalar;
    let input_max = boundaries[boundaries.len() - 1] as Scalar;
    let span = (input_max - input_min).max(1.0) as f64;

    // Fit position/size against normalized key over the boundary points
    let n = boundaries.len() as f64;
    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    let mut sum_xx = 0.0;
    let mut sum_xy = 0.0;
    for (i, &b) in boundaries.iter().enumerate() {
        let x = (b as f64 - input_min as f64) / span;
        let y = i as f64 / size.max(1) as f64;
        sum_x += x;
        sum_y += y;
        sum_xx += x * x;
        sum_xy += x * y;
    }
    let denom = n * sum_xx - sum_x * sum_x;
    let (slope, intercept) = if denom.abs() < 1e-12 {
        (0.0, 0.0)
    } else {
        let slope = (n * sum_xy - sum_x * sum_y) / denom;
        (slope, (sum_y - slope * sum_x) / n)
    };
    let slope = slope as Scalar;
    let intercept = intercept as Scalar;

    let mut error = 0u32;
    for i in 0..size {
        for key in [boundaries[i as usize], boundaries[i as usize + 1] - 1] {
            let predicted = predicted_position(slope, intercept, input_min, input_max, key, size);
            error = error.max(predicted.abs_diff(i));
        }
    }

    RqrmiModel::from_parts(
        vec![vec![SubModel { slope, intercept }]],
        vec![error + 1],
        input_min,
        input_max,
    )
}

/// Pack one iSet object from rules sorted and non-overlapping on `field`
pub fn pack_iset_object(field: u32, rules: &[MatchRule]) -> Vec<u8> {
    let mut rules = rules.to_vec();
    rules.sort_by_key(|r| r.fields[field as usize].low);

    let mut boundaries: Vec<u32> = rules.iter().map(|r| r.fields[field as usize].low).collect();
    let sentinel = rules
        .last()
        .map(|r| r.fields[field as usize].high.saturating_add(1))
        .unwrap_or(1);
    boundaries.push(sentinel);

    let mut packer = ObjectPacker::new();
    packer.push_u32(field);
    packer.push_u32(rules.len() as u32);
    for &b in &boundaries {
        packer.push_f32(b as Scalar);
    }
    for rule in &rules {
        packer.push_u8(1);
        rule.write_to(&mut packer);
    }

    let model = fit_model(&boundaries);
    let mut model_packer = ObjectPacker::new();
    model.write_to(&mut model_packer);
    packer.push_object(&model_packer);

    packer.into_bytes()
}

/// Pack the iSet region of a container: fixed header, iSet objects, and the
/// predefined remainder rule list.
pub fn pack_region(db: &RuleDb, build_time_ms: u32) -> Vec<u8> {
    let mut packer = ObjectPacker::new();
    packer.push_u32(db.isets.len() as u32);
    packer.push_u32(db.len() as u32);
    packer.push_u32(0);
    packer.push_u32(build_time_ms);

    for (field, rules) in &db.isets {
        let object = pack_iset_object(*field, rules);
        packer.push_u32(object.len() as u32);
        packer.push_bytes(&object);
    }

    let mut rule_packer = ObjectPacker::new();
    write_rule_list(&mut rule_packer, &db.remainder);
    packer.push_object(&rule_packer);

    packer.into_bytes()
}

/// Pack a full container, optionally with a trailing CutSplit remainder blob
pub fn pack_container(db: &RuleDb, with_remainder_blob: bool) -> Vec<u8> {
    let region = pack_region(db, 42);
    if !with_remainder_blob {
        return region;
    }

    let mut remainder = CutSplit::default();
    let mut sorted = db.remainder.clone();
    sorted.sort_by_key(|r| r.priority);
    <CutSplit as RemainderClassifier<1>>::build(&mut remainder, &sorted);

    let mut packer = ObjectPacker::new();
    packer.push_bytes(&region);
    packer.push_object(&<CutSplit as RemainderClassifier<1>>::pack(&remainder));
    packer.into_bytes()
}

/// Generate a rule group that tiles `count` non-overlapping intervals on one
/// field. Boundary values stay below 2^24 so `f32` keys are exact.
fn interval_rules(
    rng: &mut StdRng,
    field: u32,
    num_fields: usize,
    count: usize,
    first_priority: i32,
) -> Vec<MatchRule> {
    let mut rules = Vec::with_capacity(count);
    let mut low = rng.gen_range(0..512u32);
    for offset in 0..count {
        let width = rng.gen_range(1..2000u32);
        let mut fields = vec![FieldRange::ANY; num_fields];
        fields[field as usize] = FieldRange::new(low, low + width - 1);
        // Every other rule also constrains a second field, so validation
        // failures actually happen.
        if offset % 2 == 1 {
            let other = (field as usize + 1) % num_fields;
            fields[other] = FieldRange::new(0, rng.gen_range(1000..1_000_000));
        }
        let priority = first_priority + offset as i32;
        rules.push(MatchRule {
            priority,
            action: priority,
            fields,
        });
        low += width + rng.gen_range(0..300u32);
    }
    rules
}

/// Generate a complete synthetic database: two iSets plus remainder rules
pub fn build_rule_db(rng: &mut StdRng) -> RuleDb {
    let num_fields = 4;
    let iset0 = interval_rules(rng, 0, num_fields, 40, 0);
    let iset1 = interval_rules(rng, 1, num_fields, 30, 1000);

    let remainder = (0..25)
        .map(|i| {
            let fields = (0..num_fields)
                .map(|_| match rng.gen_range(0..3) {
                    0 => FieldRange::exact(rng.gen_range(0..100_000)),
                    1 => {
                        let low = rng.gen_range(0..100_000);
                        FieldRange::new(low, low + rng.gen_range(0..50_000))
                    }
                    _ => FieldRange::ANY,
                })
                .collect();
            let priority = 2000 + i;
            MatchRule {
                priority,
                action: priority,
                fields,
            }
        })
        .collect();

    RuleDb {
        isets: vec![(0, iset0), (1, iset1)],
        remainder,
    }
}

/// Sample headers that exercise both match and miss paths
pub fn sample_headers(rng: &mut StdRng, rules: &[MatchRule], count: usize) -> Vec<PacketHeader> {
    (0..count)
        .map(|_| {
            if rng.gen_bool(0.6) && !rules.is_empty() {
                let rule = &rules[rng.gen_range(0..rules.len())];
                let values: Vec<u32> = rule
                    .fields
                    .iter()
                    .map(|f| {
                        let high = f.high.min(1 << 23);
                        rng.gen_range(f.low.min(high)..=high)
                    })
                    .collect();
                PacketHeader::new(&values)
            } else {
                let values: Vec<u32> = (0..4).map(|_| rng.gen_range(0..1 << 23)).collect();
                PacketHeader::new(&values)
            }
        })
        .collect()
}
