//! Benchmarks for the hybrid search primitives and the text analyzer.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use recall_core::analyzer::{analyze, infer_tags, tokenize};
use recall_core::search::{apply_diversity_cap, fuse_scores, sort_with_tiebreak, ScoredCandidate};

fn bench_tokenize(c: &mut Criterion) {
    let text = "The CacheManager.getUserById method caused a race_condition in auth.py \
                when handling session_cookies under high load, see TODO for a fix.";
    c.bench_function("tokenize", |b| {
        b.iter(|| black_box(tokenize(black_box(text))));
    });
}

fn bench_analyze(c: &mut Criterion) {
    let text = "Switched to session cookies for authentication because the JWT \
                refresh flow caused a race condition in AuthService.refreshToken.";
    c.bench_function("analyze", |b| {
        b.iter(|| black_box(analyze(black_box(text))));
    });
}

fn bench_infer_tags(c: &mut Criterion) {
    let content = "Fixed a crash caused by a stale cache entry; workaround until \
                    the upstream bug is patched.";
    c.bench_function("infer_tags", |b| {
        b.iter(|| black_box(infer_tags(black_box(content), "warning", &[])));
    });
}

fn bench_fuse_scores(c: &mut Criterion) {
    let lexical: Vec<(String, f32)> = (0..200)
        .map(|i| (format!("mem-{i}"), 1.0 - i as f32 / 200.0))
        .collect();
    let vector: Vec<(String, f32)> = (0..200)
        .map(|i| (format!("mem-{}", 100 + i), 1.0 - i as f32 / 200.0))
        .collect();

    c.bench_function("fuse_scores_200x200", |b| {
        b.iter(|| black_box(fuse_scores(black_box(&lexical), black_box(&vector), 0.3)));
    });
}

fn bench_sort_and_diversity_cap(c: &mut Criterion) {
    let candidates: Vec<ScoredCandidate> = (0..500)
        .map(|i| ScoredCandidate {
            id: i.to_string(),
            score: ((i * 37) % 500) as f32 / 500.0,
            file_path: Some(format!("src/file_{}.rs", i % 20)),
            access_count: (i % 7) as i64,
            created_at_unix: 1_700_000_000 + i as i64,
            tie_break_id: i as i64,
        })
        .collect();

    c.bench_function("sort_with_tiebreak_500", |b| {
        b.iter(|| {
            let mut candidates = candidates.clone();
            sort_with_tiebreak(black_box(&mut candidates));
        });
    });

    c.bench_function("apply_diversity_cap_500", |b| {
        b.iter(|| {
            let mut candidates = candidates.clone();
            sort_with_tiebreak(&mut candidates);
            black_box(apply_diversity_cap(black_box(candidates.clone()), 3));
        });
    });
}

criterion_group!(
    benches,
    bench_tokenize,
    bench_analyze,
    bench_infer_tags,
    bench_fuse_scores,
    bench_sort_and_diversity_cap,
);
criterion_main!(benches);
