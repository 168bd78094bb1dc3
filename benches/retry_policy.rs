//! Benchmarks for the hot paths of a step attempt
//!
//! Measures:
//! - Backoff computation with and without jitter, across attempt numbers
//! - Rendering a templated activity input against a populated run context

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;
use std::collections::HashMap;

use campaign_orchestrator::activity::FailureKind;
use campaign_orchestrator::workflow::{InputMapping, MappingContext, RetryPolicy};

fn bench_next_delay(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_next_delay");
    let jittered = RetryPolicy::default();
    let exact = RetryPolicy {
        jitter: 0.0,
        ..RetryPolicy::default()
    };
    let mut rng = StdRng::seed_from_u64(7);

    for attempt in [1u32, 3, 8] {
        group.bench_with_input(BenchmarkId::new("jitter", attempt), &attempt, |b, &attempt| {
            b.iter(|| {
                jittered.next_delay_with(&mut rng, black_box(attempt), FailureKind::TransientProvider)
            })
        });
        group.bench_with_input(BenchmarkId::new("exact", attempt), &attempt, |b, &attempt| {
            b.iter(|| exact.next_delay_with(&mut rng, black_box(attempt), FailureKind::Timeout))
        });
    }

    group.finish();
}

fn bench_render_input(c: &mut Criterion) {
    let input = json!({
        "lead": {"name": "Ana Silva", "company": "Acme", "email": "ana@acme.example"},
        "campaign": {"pitch": "We cut SDR ramp time in half.", "industry": "SaaS"}
    });
    let mut outputs = HashMap::new();
    outputs.insert(
        "copy".to_string(),
        json!({"subject": "Quick idea for Acme", "body": "Hi Ana, ..."}),
    );
    let mapping = InputMapping::Template {
        template: json!({
            "to": "{{input.lead.email}}",
            "subject": "{{steps.copy.subject}}",
            "body": "{{steps.copy.body}}\n\n{{input.campaign.pitch}}"
        }),
    };

    c.bench_function("render_template_input", |b| {
        b.iter(|| {
            let context = MappingContext::new(black_box(&input), &outputs);
            mapping.build(&context)
        })
    });
}

criterion_group!(benches, bench_next_delay, bench_render_input);
criterion_main!(benches);
