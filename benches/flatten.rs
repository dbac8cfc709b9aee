//! Benchmarks for ontology flattening and lookup.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use labelrail::ontology::{
    Classification, Divider, NormalizedOntology, OptionNode, SchemaId, SchemaIndex,
};

/// A synthetic ontology: `width` top-level classifications, each carrying
/// `width` options nested `depth` levels deep.
fn synthetic_ontology(width: usize, depth: usize) -> NormalizedOntology {
    fn options(prefix: &str, width: usize, depth: usize) -> Vec<OptionNode> {
        if depth == 0 {
            return Vec::new();
        }
        (0..width)
            .map(|i| {
                let id = format!("{prefix}-o{i}");
                OptionNode {
                    label: format!("Option {i}"),
                    feature_schema_id: SchemaId::new(id.as_str()),
                    options: options(&id, width, depth - 1),
                }
            })
            .collect()
    }

    NormalizedOntology {
        tools: Vec::new(),
        classifications: (0..width)
            .map(|i| {
                let id = format!("c{i}");
                Classification {
                    instructions: format!("Classification {i}"),
                    feature_schema_id: SchemaId::new(id.as_str()),
                    options: options(&id, width, depth),
                }
            })
            .collect(),
    }
}

fn bench_build(c: &mut Criterion) {
    let ontology = synthetic_ontology(8, 4);
    let divider = Divider::new("_");

    c.bench_function("flatten_8x4", |bench| {
        bench.iter(|| black_box(SchemaIndex::build(&ontology, &divider)))
    });
}

fn bench_invert(c: &mut Criterion) {
    let ontology = synthetic_ontology(8, 4);
    let divider = Divider::new("_");
    let forward = SchemaIndex::build(&ontology, &divider);

    c.bench_function("invert_8x4", |bench| {
        bench.iter(|| black_box(forward.invert()))
    });
}

fn bench_lookup(c: &mut Criterion) {
    let ontology = synthetic_ontology(8, 4);
    let divider = Divider::new("_");
    let forward = SchemaIndex::build(&ontology, &divider);
    let deep = SchemaId::new("c3-o1-o2-o3-o0");

    c.bench_function("require_deep_option", |bench| {
        bench.iter(|| black_box(forward.require(&deep).unwrap()))
    });
}

criterion_group!(benches, bench_build, bench_invert, bench_lookup);
criterion_main!(benches);
