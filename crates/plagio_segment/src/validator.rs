//! Оффлайн-проверка инвариантов запечатанного сегмента и целого корня.

use std::path::Path;

use crate::manifest::load_manifest;
use crate::reader::{load_docinfo_json, load_segment_bin};
use crate::{K_SHINGLE, Posting9};

#[derive(Debug, Default)]
pub struct ValidationResult {
    pub ok: bool,
    pub errors: Vec<String>,
}

fn is_sorted_postings(p: &[Posting9]) -> bool {
    p.windows(2)
        .all(|w| (w[0].h, w[0].did, w[0].pos) <= (w[1].h, w[1].did, w[1].pos))
}

pub fn validate_segment(seg_dir: &Path, check_sorted: bool) -> ValidationResult {
    let mut errors = Vec::new();

    let seg = match load_segment_bin(seg_dir) {
        Ok(s) => s,
        Err(e) => {
            return ValidationResult {
                ok: false,
                errors: vec![e.to_string()],
            }
        }
    };

    match load_docinfo_json(seg_dir) {
        Ok(docinfo) => {
            if docinfo.len() != seg.header.n_docs as usize {
                errors.push(format!(
                    "docids size mismatch: docinfo={} header.n_docs={}",
                    docinfo.len(),
                    seg.header.n_docs
                ));
            }
        }
        Err(e) => errors.push(e.to_string()),
    }

    if check_sorted && !is_sorted_postings(&seg.postings9) {
        errors.push("postings9 is not sorted by (h,did,pos)".to_string());
    }

    // границы did и pos; по одной ошибке каждого вида достаточно
    for p in &seg.postings9 {
        if p.did >= seg.header.n_docs {
            errors.push("posting did out of range".to_string());
            break;
        }
        let tok_len = seg.docmeta[p.did as usize].tok_len;
        if (tok_len as usize) < K_SHINGLE {
            errors.push("doc tok_len < K (invalid docmeta)".to_string());
            break;
        }
        if p.pos > tok_len - K_SHINGLE as u32 {
            errors.push("posting pos out of range".to_string());
            break;
        }
    }

    ValidationResult {
        ok: errors.is_empty(),
        errors,
    }
}

pub fn validate_out_root(out_root: &Path) -> ValidationResult {
    let m = load_manifest(out_root);
    if m.segments.is_empty() {
        return ValidationResult {
            ok: false,
            errors: vec!["manifest has no segments (or missing)".to_string()],
        };
    }

    let mut errors = Vec::new();
    for s in &m.segments {
        let seg_dir = out_root.join(&s.segment_name);
        let r = validate_segment(&seg_dir, true);
        for e in r.errors {
            errors.push(format!("{}: {e}", s.segment_name));
        }
    }
    ValidationResult {
        ok: errors.is_empty(),
        errors,
    }
}
