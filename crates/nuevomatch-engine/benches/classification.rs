//! Classification benchmark
//!
//! Measures the single-header hot path against remainder-only classifiers of
//! increasing size.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nuevomatch_common::{write_rule_list, FieldRange, MatchRule, ObjectPacker, ObjectReader, PacketHeader};
use nuevomatch_engine::{CutSplit, NuevoMatchConfig, SerialNuevoMatch};

fn rules(count: usize) -> Vec<MatchRule> {
    (0..count)
        .map(|i| {
            let port = (i % 60_000) as u32;
            MatchRule {
                priority: i as i32,
                action: i as i32,
                fields: vec![
                    FieldRange::new((i as u32) << 8, ((i as u32) << 8) + 255),
                    FieldRange::ANY,
                    FieldRange::ANY,
                    FieldRange::exact(port),
                    FieldRange::new(6, 6),
                ],
            }
        })
        .collect()
}

fn remainder_only_blob(rules: &[MatchRule]) -> Vec<u8> {
    let mut packer = ObjectPacker::new();
    packer.push_u32(0);
    packer.push_u32(rules.len() as u32);
    packer.push_u32(0);
    packer.push_u32(0);

    let mut rule_packer = ObjectPacker::new();
    write_rule_list(&mut rule_packer, rules);
    packer.push_object(&rule_packer);
    packer.into_bytes()
}

fn classifier_with(count: usize) -> SerialNuevoMatch<1> {
    let config = NuevoMatchConfig {
        force_rebuilding_remainder: true,
        remainder_classifier: Some(Box::<CutSplit>::default()),
        ..Default::default()
    };
    let mut classifier = SerialNuevoMatch::new(config);
    let blob = remainder_only_blob(&rules(count));
    classifier
        .load(&mut ObjectReader::new(&blob))
        .expect("benchmark classifier must load");
    classifier
}

fn classify_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("classify");

    let mut classifier = classifier_with(1000);
    let hit = PacketHeader::new(&[100 << 8, 0, 0, 100, 6]);
    let miss = PacketHeader::new(&[u32::MAX, 0, 0, 1, 17]);

    group.bench_function("hit", |b| {
        b.iter(|| black_box(classifier.classify(black_box(&hit))))
    });
    group.bench_function("miss", |b| {
        b.iter(|| black_box(classifier.classify(black_box(&miss))))
    });

    group.finish();
}

fn scaling_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("classify_scaling");

    for size in [100usize, 1000, 10_000] {
        let mut classifier = classifier_with(size);
        let header = PacketHeader::new(&[(size as u32 / 2) << 8, 0, 0, size as u32 / 2, 6]);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| black_box(classifier.classify(black_box(&header))))
        });
    }

    group.finish();
}

criterion_group!(benches, classify_benchmark, scaling_benchmark);
criterion_main!(benches);
