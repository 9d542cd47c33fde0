//! Реестр сегментов в корне индекса: `level5_manifest.json`.
//!
//! Манифест только дописывается; сериализацию конкурентных дозаписей
//! обеспечивает вызывающий слой.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::format::atomic_replace_file;

pub const MANIFEST_FILE: &str = "level5_manifest.json";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentStats {
    #[serde(default)]
    pub docs: u64,
    #[serde(default)]
    pub k9: u64,
    #[serde(default)]
    pub k13: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentEntry {
    pub segment_name: String,
    /// Каталог сегмента относительно корня, например `"seg_xxx/"`.
    pub path: String,
    #[serde(default)]
    pub built_at_utc: String,
    #[serde(default)]
    pub stats: SegmentStats,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    #[serde(default)]
    pub segments: Vec<SegmentEntry>,
}

/// Прочитать манифест. Отсутствующий или битый файл читается как пустой:
/// читатели не должны падать из-за корня без единой сборки.
pub fn load_manifest(out_root: &Path) -> Manifest {
    let p = out_root.join(MANIFEST_FILE);
    let bytes = match fs::read(&p) {
        Ok(b) => b,
        Err(_) => return Manifest::default(),
    };
    let mut m: Manifest = serde_json::from_slice(&bytes).unwrap_or_default();
    m.segments
        .retain(|e| !e.segment_name.is_empty() && !e.path.is_empty());
    m
}

/// Дозапись: load -> push -> tmp -> rename.
pub fn append_segment(out_root: &Path, entry: SegmentEntry) -> Result<()> {
    let fin = out_root.join(MANIFEST_FILE);
    let tmp = out_root.join(format!("{MANIFEST_FILE}.tmp"));

    let mut m = load_manifest(out_root);
    m.segments.push(entry);

    let bytes =
        serde_json::to_vec(&m).map_err(|e| Error::Parse(format!("manifest encode: {e}")))?;
    fs::write(&tmp, bytes).map_err(|e| Error::io_at(&tmp, e))?;
    atomic_replace_file(&tmp, &fin)
}
