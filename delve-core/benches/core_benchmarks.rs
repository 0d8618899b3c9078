use criterion::{black_box, criterion_group, criterion_main, Criterion};
use delve_core::cache::{cache_key, content_hash, CacheTier, MemoryTier};
use delve_core::config::DispatcherConfig;
use delve_core::research::context::ResearchContext;
use delve_core::research::prompts::planning_prompt;
use delve_core::{BudgetAccountant, ConcurrencyController, Learning, TokenUsage};
use std::time::Duration;
use tokio::time::Instant;

fn bench_cache_keys(c: &mut Criterion) {
    c.bench_function("cache_key_evaluation", |b| {
        b.iter(|| {
            cache_key(
                black_box("eval"),
                black_box(&["rust async runtimes", "https://tokio.rs/blog", "", "abc123"]),
            )
        })
    });

    let page = "Tokio is an asynchronous runtime for Rust. ".repeat(500);
    c.bench_function("content_hash_20kb", |b| {
        b.iter(|| content_hash(black_box(&page)))
    });
}

fn bench_memory_tier(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let tier = MemoryTier::new(1_000, 800);
    rt.block_on(async {
        for i in 0..500 {
            tier.set(&format!("k{i}"), format!("v{i}"), Duration::from_secs(300))
                .await
                .unwrap();
        }
    });

    c.bench_function("memory_tier_get_hit", |b| {
        b.iter(|| rt.block_on(tier.get(black_box("k250"))).unwrap())
    });

    c.bench_function("memory_tier_get_miss", |b| {
        b.iter(|| rt.block_on(tier.get(black_box("absent"))).unwrap())
    });

    let mut n = 0u64;
    c.bench_function("memory_tier_set_with_eviction", |b| {
        b.iter(|| {
            n += 1;
            rt.block_on(tier.set(&format!("new{n}"), "value".to_string(), Duration::from_secs(60)))
                .unwrap()
        })
    });
}

fn bench_budget(c: &mut Criterion) {
    let budget = BudgetAccountant::new(Some(u64::MAX / 2));
    let usage = TokenUsage::new(1_200, 300);
    c.bench_function("budget_charge_usage", |b| {
        b.iter(|| budget.charge_usage(black_box(&usage)))
    });
}

fn bench_concurrency_controller(c: &mut Criterion) {
    let config = DispatcherConfig {
        adjustment_interval_secs: 0,
        min_samples: 10,
        ..DispatcherConfig::default()
    };
    let start = Instant::now();
    let mut controller = ConcurrencyController::new(&config, start);
    let mut i = 0u64;
    c.bench_function("controller_record", |b| {
        b.iter(|| {
            i += 1;
            controller.record(
                black_box(i % 17 != 0),
                Duration::from_millis(200 + i % 900),
                start + Duration::from_millis(i),
            )
        })
    });
}

fn bench_planning_prompt(c: &mut Criterion) {
    let mut context = ResearchContext::new("How do Rust async runtimes schedule tasks?", None);
    for i in 0..50 {
        context.mark_visited(&format!("https://example.com/post/{i}"));
        context.record_issued(&format!("tokio scheduler detail {i}"));
        context.add_learning(Learning {
            text: format!("Learning number {i} about work stealing"),
            reliability: 0.8,
            source_url: None,
        });
    }
    c.bench_function("planning_prompt_50_learnings", |b| {
        b.iter(|| planning_prompt(black_box(&context), black_box(3)))
    });
}

criterion_group!(
    benches,
    bench_cache_keys,
    bench_memory_tier,
    bench_budget,
    bench_concurrency_controller,
    bench_planning_prompt,
);
criterion_main!(benches);
