//! Сборка с маленьким бюджетом памяти: внешняя сортировка уходит в
//! прогоны и слияние, сегмент обязан остаться валидным и искомым.

use std::fs::File;
use std::io::{BufWriter, Write};

use plagio_segment::build::{build_segment_jsonl, BuildOptions};
use plagio_segment::reader::load_segment_bin;
use plagio_segment::search::SearchOptions;
use plagio_segment::search_multi::search_out_root;
use plagio_segment::validator::validate_out_root;
use tempfile::tempdir;

const DOCS: usize = 4_000;
const TOKENS_PER_DOC: usize = 24;

#[test]
fn big_build_with_tiny_ram_limit() {
    let td = tempdir().unwrap();
    let input = td.path().join("corpus.jsonl");
    {
        let f = File::create(&input).unwrap();
        let mut w = BufWriter::new(f);
        for d in 0..DOCS {
            let tokens: Vec<String> = (0..TOKENS_PER_DOC).map(|j| format!("w{d}x{j}")).collect();
            writeln!(
                w,
                r#"{{"doc_id":"doc-{d}","text":"{}","text_is_normalized":true}}"#,
                tokens.join(" ")
            )
            .unwrap();
        }
        // единственный документ с собственным словарём
        let target: Vec<String> = (0..TOKENS_PER_DOC).map(|j| format!("zq{j}")).collect();
        writeln!(
            w,
            r#"{{"doc_id":"needle","text":"{}","text_is_normalized":true}}"#,
            target.join(" ")
        )
        .unwrap();
        w.flush().unwrap();
    }

    let root = td.path().join("idx");
    let opt = BuildOptions {
        segment_name: "seg_big".to_string(),
        strict_text_is_normalized: Some(false),
        // ~128 записей на прогон: каждый бакет дробится и сливается
        ram_limit_bytes: 4 * 1024,
        ..BuildOptions::default()
    };
    let stats = build_segment_jsonl(&input, &root, &opt).unwrap();

    let shingles_per_doc = (TOKENS_PER_DOC - 9 + 1) as u64;
    assert_eq!(stats.docs, DOCS as u64 + 1);
    assert_eq!(stats.post9, (DOCS as u64 + 1) * shingles_per_doc);

    // валидатор проверяет сортировку и границы по всему сегменту
    let vr = validate_out_root(&root);
    assert!(vr.ok, "errors: {:?}", vr.errors);

    let seg = load_segment_bin(&root.join("seg_big")).unwrap();
    assert_eq!(seg.postings9.len(), stats.post9 as usize);

    // запрос находит ровно один документ, и это needle
    let target_text = (0..TOKENS_PER_DOC)
        .map(|j| format!("zq{j}"))
        .collect::<Vec<_>>()
        .join(" ");
    let res = search_out_root(&root, &target_text, true, &SearchOptions::default());
    assert_eq!(res.hits.len(), 1);
    assert_eq!(res.hits[0].doc_id, "needle");
    assert!((res.hits[0].score - 100.0).abs() < 1e-9);
}
