//! Двухфазный поиск по одному сегменту.
//!
//! Фаза A: дешёвый отбор кандидатов по уникальным хэшам запроса
//! (equal-range по постингам + счётчики hits). Фаза B: восстановление
//! коллинеарных спанов: каждая позиция запроса разворачивается в точки
//! (qpos, dpos), точки группируются по delta = dpos - qpos и жадно
//! склеиваются в прогоны. Асимметрия фаз намеренная: A прунит по
//! уникальным хэшам, B собирает улики полностью.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Serialize;

use crate::docinfo::DocInfo;
use crate::query::QueryShingles;
use crate::reader::SegmentData;
use crate::{K_SHINGLE, Posting9};

/// Настройки поиска. Значения по умолчанию подобраны под реальные корпуса.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub topk: usize,
    /// Сколько кандидатов фазы A попадает в сборку спанов.
    pub candidates_topn: usize,
    /// Минимум hits, чтобы документ стал кандидатом.
    pub min_hits: u32,
    /// Stop-hash: хэш с более длинным постинг-листом не информативен
    /// и выбрасывается целиком (и из hits, и из спанов).
    pub max_postings_per_hash: usize,
    /// Минимальная длина спана в шинглах.
    pub span_min_len: u32,
    /// Допустимый разрыв внутри спана (0 = строго подряд).
    pub span_gap: u32,
    pub max_spans_per_doc: usize,
    /// score = alpha*cov_q + (1-alpha)*cov_d.
    pub alpha: f64,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            topk: 20,
            candidates_topn: 200,
            min_hits: 2,
            max_postings_per_hash: 50_000,
            span_min_len: 6,
            span_gap: 0,
            max_spans_per_doc: 10,
            alpha: 0.60,
        }
    }
}

/// Непрерывный прогон совпавших шинглов на плоскости (q, d).
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct MatchSpan {
    pub q_start: u32,
    pub q_end: u32,
    pub d_start: u32,
    pub d_end: u32,
    pub len_shingles: u32,
}

/// Лучшее совпадение по одному документу внутри сегмента.
#[derive(Debug, Clone, Serialize)]
pub struct Hit {
    pub doc_id: String,
    pub segment_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub organization_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub external_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub source_path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub source_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub preview_text: String,
    /// Счётчик фазы A: сколько постингов совпало по не-stop хэшам.
    pub hits: u32,
    /// Сумма длин принятых спанов.
    pub matched_shingles: u64,
    pub coverage_query: f64,
    pub coverage_doc: f64,
    /// Итоговый балл в [0, 100].
    pub score: f64,
    pub spans: Vec<MatchSpan>,
}

/// Порядок выдачи: балл по убыванию, при равенстве hits по убыванию.
pub(crate) fn by_score_desc(a: &Hit, b: &Hit) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then(b.hits.cmp(&a.hits))
}

pub fn search_in_segment(
    seg: &SegmentData,
    docinfo: &[DocInfo],
    q: &QueryShingles,
    opt: &SearchOptions,
) -> Vec<Hit> {
    if seg.header.n_docs == 0 || seg.postings9.is_empty() || q.items.is_empty() || docinfo.is_empty()
    {
        return Vec::new();
    }
    // при расхождении bin и docids работаем по безопасному минимуму
    let n_docs_safe = (seg.header.n_docs as usize).min(docinfo.len());
    let postings = &seg.postings9;

    // Фаза A: equal-range на каждый уникальный хэш + счётчики по документам.
    // Диапазоны кэшируем: фаза B ходит по тем же участкам.
    let mut ranges: Vec<Option<(usize, usize)>> = Vec::with_capacity(q.items.len());
    let mut hits = vec![0u32; n_docs_safe];
    for item in &q.items {
        let (l, r) = equal_range(postings, item.h);
        if r - l > opt.max_postings_per_hash {
            ranges.push(None); // stop-hash
            continue;
        }
        for p in &postings[l..r] {
            if (p.did as usize) < n_docs_safe {
                hits[p.did as usize] += 1;
            }
        }
        ranges.push(Some((l, r)));
    }

    let min_hits = opt.min_hits.max(1);
    let mut candidates: Vec<(u32, u32)> = hits
        .iter()
        .enumerate()
        .filter(|&(_, &c)| c >= min_hits)
        .map(|(did, &c)| (did as u32, c))
        .collect();
    if opt.candidates_topn == 0 {
        candidates.clear();
    } else if candidates.len() > opt.candidates_topn {
        // частичный отбор: nth по hits убыванию, дальше хвост не нужен
        candidates.select_nth_unstable_by(opt.candidates_topn - 1, |a, b| b.1.cmp(&a.1));
        candidates.truncate(opt.candidates_topn);
    }

    let seg_name = seg
        .seg_dir
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let span_min_len = opt.span_min_len.max(1);
    let q_total = q.total_shingles as u64;

    let mut out: Vec<Hit> = Vec::new();
    for &(did, cnt) in &candidates {
        let spans = build_spans(postings, &ranges, q, did, span_min_len, opt.span_gap);
        if spans.is_empty() {
            continue;
        }
        // покрытие считается по всем принятым спанам; обрезка ниже
        // касается только размера списка улик в выдаче
        let matched: u64 = spans.iter().map(|s| s.len_shingles as u64).sum();
        let mut spans = spans;
        spans.sort_unstable_by(|a, b| {
            b.len_shingles
                .cmp(&a.len_shingles)
                .then(a.q_start.cmp(&b.q_start))
                .then(a.d_start.cmp(&b.d_start))
        });
        spans.truncate(opt.max_spans_per_doc);

        let tok_len = seg.docmeta[did as usize].tok_len;
        let d_total = tok_len.saturating_sub((K_SHINGLE - 1) as u32) as u64;
        let cov_q = clamp01(matched as f64 / q_total as f64);
        let cov_d = if d_total == 0 {
            0.0
        } else {
            clamp01(matched as f64 / d_total as f64)
        };
        let score01 = clamp01(opt.alpha * cov_q + (1.0 - opt.alpha) * cov_d);

        let info = &docinfo[did as usize];
        out.push(Hit {
            doc_id: info.doc_id.clone(),
            segment_name: seg_name.clone(),
            organization_id: info.organization_id.clone(),
            external_id: info.external_id.clone(),
            source_path: info.source_path.clone(),
            source_name: info.source_name.clone(),
            preview_text: info.preview_text.clone(),
            hits: cnt,
            matched_shingles: matched,
            coverage_query: cov_q,
            coverage_doc: cov_d,
            score: 100.0 * score01,
            spans,
        });
    }

    out.sort_unstable_by(by_score_desc);
    out.truncate(opt.topk);
    out
}

/// Фаза B для одного кандидата: точки (qpos, dpos) по кэшированным
/// диапазонам, группировка по delta, жадная склейка прогонов.
fn build_spans(
    postings: &[Posting9],
    ranges: &[Option<(usize, usize)>],
    q: &QueryShingles,
    did: u32,
    span_min_len: u32,
    span_gap: u32,
) -> Vec<MatchSpan> {
    let mut by_delta: HashMap<i64, Vec<(u32, u32)>> = HashMap::new();
    for (item, range) in q.items.iter().zip(ranges) {
        let Some((l, r)) = *range else { continue };
        let chunk = &postings[l..r];
        // внутри equal-range постинги отсортированы по (did, pos)
        let lo = chunk.partition_point(|p| p.did < did);
        let hi = chunk.partition_point(|p| p.did <= did);
        for p in &chunk[lo..hi] {
            for &qp in &item.qpos {
                by_delta
                    .entry(p.pos as i64 - qp as i64)
                    .or_default()
                    .push((qp, p.pos));
            }
        }
    }

    let mut spans = Vec::new();
    for pts in by_delta.values_mut() {
        pts.sort_unstable();
        let mut cur: Option<MatchSpan> = None;
        for &(qp, dp) in pts.iter() {
            match cur.as_mut() {
                Some(s) if qp <= s.q_end + 1 + span_gap && dp <= s.d_end + 1 + span_gap => {
                    s.q_end = s.q_end.max(qp);
                    s.d_end = s.d_end.max(dp);
                }
                _ => {
                    if let Some(s) = cur.take() {
                        push_span(&mut spans, s, span_min_len);
                    }
                    cur = Some(MatchSpan {
                        q_start: qp,
                        q_end: qp,
                        d_start: dp,
                        d_end: dp,
                        len_shingles: 0,
                    });
                }
            }
        }
        if let Some(s) = cur.take() {
            push_span(&mut spans, s, span_min_len);
        }
    }
    spans
}

fn push_span(spans: &mut Vec<MatchSpan>, mut s: MatchSpan, span_min_len: u32) {
    s.len_shingles = s.q_end - s.q_start + 1;
    if s.len_shingles >= span_min_len {
        spans.push(s);
    }
}

fn equal_range(postings: &[Posting9], h: u64) -> (usize, usize) {
    let l = postings.partition_point(|p| p.h < h);
    let r = postings.partition_point(|p| p.h <= h);
    (l, r)
}

fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::HeaderV2;
    use std::path::PathBuf;

    fn seg_with(postings: Vec<Posting9>, tok_lens: &[u32]) -> SegmentData {
        let mut postings = postings;
        postings.sort_unstable_by_key(|p| (p.h, p.did, p.pos));
        SegmentData {
            seg_dir: PathBuf::from("seg_test"),
            header: HeaderV2 {
                n_docs: tok_lens.len() as u32,
                n_post9: postings.len() as u64,
                n_post13: 0,
            },
            docmeta: tok_lens
                .iter()
                .map(|&t| crate::DocMeta {
                    tok_len: t,
                    simhash_hi: 0,
                    simhash_lo: 0,
                })
                .collect(),
            postings9: postings,
        }
    }

    fn infos(n: usize) -> Vec<DocInfo> {
        (0..n)
            .map(|i| DocInfo {
                doc_id: format!("d{i}"),
                ..DocInfo::default()
            })
            .collect()
    }

    fn q_of(items: Vec<(u64, Vec<u32>)>, total: u32) -> QueryShingles {
        QueryShingles {
            items: items
                .into_iter()
                .map(|(h, qpos)| crate::query::QueryHash { h, qpos })
                .collect(),
            total_shingles: total,
        }
    }

    fn opts_loose() -> SearchOptions {
        SearchOptions {
            min_hits: 1,
            span_min_len: 1,
            ..SearchOptions::default()
        }
    }

    #[test]
    fn collinear_run_merges_into_one_span() {
        // документ 0: хэши 10,11,12 на позициях 5,6,7; в запросе те же на 0,1,2
        let seg = seg_with(
            vec![
                Posting9 { h: 10, did: 0, pos: 5 },
                Posting9 { h: 11, did: 0, pos: 6 },
                Posting9 { h: 12, did: 0, pos: 7 },
            ],
            &[20],
        );
        let q = q_of(vec![(10, vec![0]), (11, vec![1]), (12, vec![2])], 3);
        let hits = search_in_segment(&seg, &infos(1), &q, &opts_loose());
        assert_eq!(hits.len(), 1);
        let h = &hits[0];
        assert_eq!(h.spans.len(), 1);
        assert_eq!(
            h.spans[0],
            MatchSpan {
                q_start: 0,
                q_end: 2,
                d_start: 5,
                d_end: 7,
                len_shingles: 3
            }
        );
        assert_eq!(h.matched_shingles, 3);
        // cov_q = 1, cov_d = 3/12
        assert!((h.coverage_query - 1.0).abs() < 1e-9);
        assert!((h.coverage_doc - 0.25).abs() < 1e-9);
    }

    #[test]
    fn different_delta_breaks_span() {
        let seg = seg_with(
            vec![
                Posting9 { h: 10, did: 0, pos: 5 },
                Posting9 { h: 11, did: 0, pos: 9 }, // delta 8 vs 5
            ],
            &[20],
        );
        let q = q_of(vec![(10, vec![0]), (11, vec![1])], 2);
        let hits = search_in_segment(&seg, &infos(1), &q, &opts_loose());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].spans.len(), 2);
        assert!(hits[0].spans.iter().all(|s| s.len_shingles == 1));
    }

    #[test]
    fn span_gap_bridges_small_holes() {
        // пропуск позиции 1 в запросе; gap=1 должен склеить
        let seg = seg_with(
            vec![
                Posting9 { h: 10, did: 0, pos: 5 },
                Posting9 { h: 12, did: 0, pos: 7 },
            ],
            &[20],
        );
        let q = q_of(vec![(10, vec![0]), (12, vec![2])], 3);

        let strict = search_in_segment(&seg, &infos(1), &q, &opts_loose());
        assert_eq!(strict[0].spans.len(), 2);

        let gap = SearchOptions {
            span_gap: 1,
            ..opts_loose()
        };
        let merged = search_in_segment(&seg, &infos(1), &q, &gap);
        assert_eq!(merged[0].spans.len(), 1);
        assert_eq!(merged[0].spans[0].len_shingles, 3);
    }

    #[test]
    fn repeated_query_position_expands_points() {
        // хэш 10 встречается в запросе на 0 и 9, в документе один раз:
        // в фазе A это один hit, в фазе B две точки
        let seg = seg_with(vec![Posting9 { h: 10, did: 0, pos: 4 }], &[20]);
        let q = q_of(vec![(10, vec![0, 9])], 10);
        let hits = search_in_segment(&seg, &infos(1), &q, &opts_loose());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].hits, 1);
        assert_eq!(hits[0].spans.len(), 2);
        assert_eq!(hits[0].matched_shingles, 2);
    }

    #[test]
    fn stop_hash_contributes_nothing() {
        let mut postings = Vec::new();
        // хэш 10 лежит в 5 документах и станет stop-hash при лимите 4
        for did in 0..5 {
            postings.push(Posting9 { h: 10, did, pos: 0 });
        }
        postings.push(Posting9 { h: 20, did: 0, pos: 1 });
        let seg = seg_with(postings, &[20, 20, 20, 20, 20]);
        let q = q_of(vec![(10, vec![0]), (20, vec![1])], 2);
        let opt = SearchOptions {
            max_postings_per_hash: 4,
            ..opts_loose()
        };
        let hits = search_in_segment(&seg, &infos(5), &q, &opt);
        // выжил только d0 за счёт хэша 20; hits == 1 (stop-hash не считался)
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "d0");
        assert_eq!(hits[0].hits, 1);
        assert_eq!(hits[0].matched_shingles, 1);
    }

    #[test]
    fn min_hits_filters_candidates() {
        let seg = seg_with(
            vec![
                Posting9 { h: 10, did: 0, pos: 0 },
                Posting9 { h: 11, did: 0, pos: 1 },
                Posting9 { h: 10, did: 1, pos: 3 },
            ],
            &[20, 20],
        );
        let q = q_of(vec![(10, vec![0]), (11, vec![1])], 2);
        let opt = SearchOptions {
            min_hits: 2,
            span_min_len: 1,
            ..SearchOptions::default()
        };
        let hits = search_in_segment(&seg, &infos(2), &q, &opt);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "d0");
    }

    #[test]
    fn candidates_partial_selection_keeps_topn() {
        // 10 документов, у did=0..4 по 2 совпадения, у остальных по 1
        let mut postings = Vec::new();
        for did in 0..10u32 {
            postings.push(Posting9 { h: 10, did, pos: 0 });
            if did < 5 {
                postings.push(Posting9 { h: 11, did, pos: 1 });
            }
        }
        let seg = seg_with(postings, &[20; 10]);
        let q = q_of(vec![(10, vec![0]), (11, vec![1])], 2);
        let opt = SearchOptions {
            candidates_topn: 5,
            topk: 100,
            ..opts_loose()
        };
        let hits = search_in_segment(&seg, &infos(10), &q, &opt);
        assert_eq!(hits.len(), 5);
        assert!(hits.iter().all(|h| h.hits == 2));
    }

    #[test]
    fn max_spans_caps_evidence_but_not_coverage() {
        // 3 одиночных совпадения на разных дельтах
        let seg = seg_with(
            vec![
                Posting9 { h: 10, did: 0, pos: 0 },
                Posting9 { h: 11, did: 0, pos: 5 },
                Posting9 { h: 12, did: 0, pos: 10 },
            ],
            &[20],
        );
        let q = q_of(vec![(10, vec![0]), (11, vec![1]), (12, vec![2])], 3);
        let opt = SearchOptions {
            max_spans_per_doc: 2,
            ..opts_loose()
        };
        let hits = search_in_segment(&seg, &infos(1), &q, &opt);
        assert_eq!(hits[0].spans.len(), 2);
        assert_eq!(hits[0].matched_shingles, 3);
    }

    #[test]
    fn score_clamped_to_0_100() {
        // точек больше, чем шинглов в запросе: matched > q_total,
        // покрытие обязано остаться в [0,1]
        let seg = seg_with(
            vec![
                Posting9 { h: 10, did: 0, pos: 4 },
                Posting9 { h: 10, did: 0, pos: 13 },
            ],
            &[20],
        );
        let q = q_of(vec![(10, vec![0, 9])], 10);
        let hits = search_in_segment(&seg, &infos(1), &q, &opts_loose());
        let h = &hits[0];
        assert!(h.coverage_query >= 0.0 && h.coverage_query <= 1.0);
        assert!(h.coverage_doc >= 0.0 && h.coverage_doc <= 1.0);
        assert!(h.score >= 0.0 && h.score <= 100.0);
    }

    #[test]
    fn safe_doc_count_with_short_docinfo() {
        // docinfo короче, чем n_docs: посторонний did не роняет поиск
        let seg = seg_with(
            vec![
                Posting9 { h: 10, did: 0, pos: 0 },
                Posting9 { h: 10, did: 1, pos: 0 },
            ],
            &[20, 20],
        );
        let q = q_of(vec![(10, vec![0])], 1);
        let hits = search_in_segment(&seg, &infos(1), &q, &opts_loose());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "d0");
    }
}
