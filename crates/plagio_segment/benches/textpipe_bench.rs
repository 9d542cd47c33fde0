// crates/plagio_segment/benches/textpipe_bench.rs
use criterion::{criterion_group, criterion_main, Criterion};
use plagio_segment::normalizer::normalize_str;
use plagio_segment::textpipe::{hash_shingle, simhash128, token_hashes, tokenize_spans};
use plagio_segment::K_SHINGLE;

fn mk_text() -> String {
    let sentence = "Щенок играет с мячиком на большой поляне возле старого дома 42";
    let mut out = String::new();
    for _ in 0..200 {
        out.push_str(sentence);
        out.push(' ');
    }
    out
}

fn bench_pipeline(c: &mut Criterion) {
    let raw = mk_text();
    c.bench_function("normalize", |b| {
        b.iter(|| {
            let _ = normalize_str(&raw);
        })
    });

    let norm = normalize_str(&raw);
    let spans = tokenize_spans(&norm);
    c.bench_function("token_hashes_and_shingles", |b| {
        b.iter(|| {
            let th = token_hashes(&norm, &spans);
            let mut acc = 0u64;
            for pos in 0..(th.len() - K_SHINGLE + 1) {
                acc ^= hash_shingle(&th, pos, K_SHINGLE);
            }
            acc
        })
    });

    let th = token_hashes(&norm, &spans);
    c.bench_function("simhash128", |b| b.iter(|| simhash128(&th)));
}

criterion_group!(benches, bench_pipeline);
criterion_main!(benches);
