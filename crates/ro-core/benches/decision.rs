use criterion::{black_box, criterion_group, criterion_main, Criterion};

use ro_core::{decide, EngineConfig, PageKey, Settings};

const URLS: &[&str] = &[
    "https://objkt.com/tokens/KT1RJ6PbjHpwc3M5rw5s2Nbmefwbuwbdxton/42",
    "https://objkt.com/tokens/KT1RJ6PbjHpwc3M5rw5s2Nbmefwbuwbdxton/42/owners?ref=tz1g4u4S2Fg7jsJVMmbYujxXQYsJB7ecSWGJ",
    "https://objkt.com/explore/tokens/1?sort=price&order=asc&ref=tz1ZzSmVcnVaWNZKJradtrDnjSjzTp6qjTEW#grid",
    "https://objkt.com/asset/hicetnunc/12345?utm_source=x&utm_medium=y",
];

fn bench_decide(c: &mut Criterion) {
    let passive = Settings { enabled: true, ..Settings::default() };
    let active = Settings { passive: false, ..passive.clone() };

    c.bench_function("decide_passive", |b| {
        b.iter(|| {
            for url in URLS {
                black_box(decide(&passive, black_box(url), "ref"));
            }
        })
    });

    c.bench_function("decide_active", |b| {
        b.iter(|| {
            for url in URLS {
                black_box(decide(&active, black_box(url), "ref"));
            }
        })
    });
}

fn bench_page_key(c: &mut Criterion) {
    let config = EngineConfig::default();
    c.bench_function("page_key", |b| {
        b.iter(|| {
            for url in URLS {
                black_box(PageKey::compute(black_box(url), &config));
            }
        })
    });
}

criterion_group!(benches, bench_decide, bench_page_key);
criterion_main!(benches);
