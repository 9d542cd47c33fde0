//! Поиск по всем сегментам корня индекса: обход манифеста, объединение
//! результатов по doc_id (лучший балл), общий top-K.

use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;
use tracing::warn;

use crate::manifest::load_manifest;
use crate::query::build_query_shingles;
use crate::reader::{load_docinfo_json, load_segment_bin};
use crate::search::{by_score_desc, search_in_segment, Hit, SearchOptions};

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub query: String,
    /// Сколько сегментов реально открылось и было просмотрено;
    /// битые сегменты пропускаются и сюда не входят.
    pub segments_scanned: u64,
    pub hits: Vec<Hit>,
}

pub fn search_out_root(
    out_root: &Path,
    query: &str,
    query_is_normalized: bool,
    opt: &SearchOptions,
) -> SearchResult {
    let mut res = SearchResult {
        query: query.to_string(),
        segments_scanned: 0,
        hits: Vec::new(),
    };

    let q = build_query_shingles(query, query_is_normalized);
    if q.is_empty() {
        return res;
    }

    let manifest = load_manifest(out_root);
    let mut best: HashMap<String, Hit> = HashMap::new();

    for entry in &manifest.segments {
        let seg_dir = out_root.join(&entry.segment_name);
        let seg = match load_segment_bin(&seg_dir) {
            Ok(s) => s,
            Err(e) => {
                warn!(segment = %entry.segment_name, error = %e, "skipping broken segment");
                continue;
            }
        };
        let docinfo = match load_docinfo_json(&seg_dir) {
            Ok(d) => d,
            Err(e) => {
                warn!(segment = %entry.segment_name, error = %e, "skipping broken segment");
                continue;
            }
        };
        res.segments_scanned += 1;

        for hit in search_in_segment(&seg, &docinfo, &q, opt) {
            match best.get_mut(&hit.doc_id) {
                Some(prev) if prev.score >= hit.score => {}
                _ => {
                    best.insert(hit.doc_id.clone(), hit);
                }
            }
        }
    }

    res.hits = best.into_values().collect();
    res.hits.sort_unstable_by(by_score_desc);
    res.hits.truncate(opt.topk);
    res
}
