//! Поиск по нескольким сегментам: лучший балл на документ, top-K,
//! пропуск битых сегментов.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use plagio_segment::build::{build_segment_jsonl, BuildOptions};
use plagio_segment::manifest::{append_segment, load_manifest, SegmentEntry, SegmentStats};
use plagio_segment::search::SearchOptions;
use plagio_segment::search_multi::search_out_root;
use tempfile::tempdir;

fn write_lines(path: &Path, lines: &[String]) {
    let mut f = File::create(path).unwrap();
    for l in lines {
        writeln!(f, "{l}").unwrap();
    }
}

fn build_opts(name: &str) -> BuildOptions {
    BuildOptions {
        segment_name: name.to_string(),
        strict_text_is_normalized: Some(false),
        ..BuildOptions::default()
    }
}

fn loose() -> SearchOptions {
    SearchOptions {
        min_hits: 1,
        span_min_len: 1,
        ..SearchOptions::default()
    }
}

fn doc_line(id: &str, text: &str) -> String {
    format!(r#"{{"doc_id":"{id}","text":"{text}","text_is_normalized":true}}"#)
}

#[test]
fn best_score_per_doc_wins_across_segments() {
    let tokens: Vec<String> = (0..18).map(|i| format!("w{i}")).collect();
    let full = tokens.join(" ");
    // в другом сегменте тот же doc_id, но вторая половина текста другая
    let mut mutated = tokens.clone();
    for (i, t) in mutated.iter_mut().enumerate().skip(9) {
        *t = format!("x{i}");
    }
    let mutated = mutated.join(" ");

    let td = tempdir().unwrap();
    let root = td.path().join("idx");

    let in_a = td.path().join("a.jsonl");
    write_lines(&in_a, &[doc_line("d1", &full), doc_line("d2", "z0 z1 z2 z3 z4 z5 z6 z7 z8")]);
    build_segment_jsonl(&in_a, &root, &build_opts("seg_a")).unwrap();

    let in_b = td.path().join("b.jsonl");
    write_lines(&in_b, &[doc_line("d1", &mutated)]);
    build_segment_jsonl(&in_b, &root, &build_opts("seg_b")).unwrap();

    let res = search_out_root(&root, &full, true, &loose());
    assert_eq!(res.segments_scanned, 2);

    // d1 присутствует один раз и с баллом из seg_a (полное совпадение)
    let d1: Vec<_> = res.hits.iter().filter(|h| h.doc_id == "d1").collect();
    assert_eq!(d1.len(), 1);
    assert!((d1[0].score - 100.0).abs() < 1e-9);
    assert_eq!(d1[0].segment_name, "seg_a");
}

#[test]
fn topk_truncates_union() {
    let text = "a b c d e f g h i";
    let td = tempdir().unwrap();
    let root = td.path().join("idx");

    let in_a = td.path().join("a.jsonl");
    let lines: Vec<String> = (0..5).map(|i| doc_line(&format!("d{i}"), text)).collect();
    write_lines(&in_a, &lines);
    build_segment_jsonl(&in_a, &root, &build_opts("seg_a")).unwrap();

    let opt = SearchOptions {
        topk: 3,
        ..loose()
    };
    let res = search_out_root(&root, text, true, &opt);
    assert_eq!(res.hits.len(), 3);
}

#[test]
fn broken_segment_is_skipped_not_fatal() {
    let text = "a b c d e f g h i";
    let td = tempdir().unwrap();
    let root = td.path().join("idx");

    let in_a = td.path().join("a.jsonl");
    write_lines(&in_a, &[doc_line("d1", text)]);
    build_segment_jsonl(&in_a, &root, &build_opts("seg_a")).unwrap();

    // сегмент в манифесте, но на диске каталога нет
    append_segment(
        &root,
        SegmentEntry {
            segment_name: "seg_ghost".to_string(),
            path: "seg_ghost/".to_string(),
            built_at_utc: "20250101_000000".to_string(),
            stats: SegmentStats::default(),
        },
    )
    .unwrap();

    // и сегмент с урезанным bin
    let in_b = td.path().join("b.jsonl");
    write_lines(&in_b, &[doc_line("d9", text)]);
    build_segment_jsonl(&in_b, &root, &build_opts("seg_cut")).unwrap();
    let bin = root.join("seg_cut/index_native.bin");
    let full = fs::read(&bin).unwrap();
    fs::write(&bin, &full[..full.len() / 2]).unwrap();

    assert_eq!(load_manifest(&root).segments.len(), 3);

    let res = search_out_root(&root, text, true, &loose());
    assert_eq!(res.segments_scanned, 1);
    assert_eq!(res.hits.len(), 1);
    assert_eq!(res.hits[0].doc_id, "d1");
}
