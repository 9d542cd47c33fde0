//! Раскладка сегмента на диске и низкоуровневый ввод-вывод формата V2.
//!
//! Все бинарные записи пишутся и читаются по полям фиксированной ширины (LE);
//! на раскладку структур в памяти формат не опирается.

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use chrono::Utc;

use crate::error::{Error, Result};
use crate::Posting9;

pub const MAGIC: &[u8; 4] = b"PLAG";
pub const VERSION: u32 = 2;

/// magic + version + n_docs + n_post9 + n_post13.
pub const HEADER_BYTES: usize = 4 + 4 + 4 + 8 + 8;
/// tok_len + simhash_hi + simhash_lo.
pub const DOCMETA_BYTES: usize = 4 + 8 + 8;
/// h + did + pos.
pub const POSTING9_BYTES: usize = 8 + 4 + 4;

/// Файлы внутри каталога сегмента.
pub const SEGMENT_BIN: &str = "index_native.bin";
pub const SEGMENT_DOCIDS: &str = "index_native_docids.json";
pub const SEGMENT_META: &str = "index_native_meta.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderV2 {
    pub n_docs: u32,
    pub n_post9: u64,
    /// Зарезервировано под 13-токенные шинглы, всегда 0.
    pub n_post13: u64,
}

pub fn write_header_v2<W: Write>(w: &mut W, h: &HeaderV2) -> io::Result<()> {
    w.write_all(MAGIC)?;
    w.write_all(&VERSION.to_le_bytes())?;
    w.write_all(&h.n_docs.to_le_bytes())?;
    w.write_all(&h.n_post9.to_le_bytes())?;
    w.write_all(&h.n_post13.to_le_bytes())?;
    Ok(())
}

/// Разобрать заголовок из первых байт файла.
pub fn parse_header_v2(bytes: &[u8]) -> Result<HeaderV2> {
    if bytes.len() < HEADER_BYTES {
        return Err(Error::InvalidFormat("file too small for header".into()));
    }
    if &bytes[0..4] != MAGIC {
        return Err(Error::InvalidFormat("bad magic (expected PLAG)".into()));
    }
    let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    if version != VERSION {
        return Err(Error::InvalidFormat(format!(
            "unsupported version {version} (expected {VERSION})"
        )));
    }
    Ok(HeaderV2 {
        n_docs: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
        n_post9: u64::from_le_bytes(bytes[12..20].try_into().unwrap()),
        n_post13: u64::from_le_bytes(bytes[20..28].try_into().unwrap()),
    })
}

pub fn write_posting9<W: Write>(w: &mut W, p: &Posting9) -> io::Result<()> {
    w.write_all(&p.h.to_le_bytes())?;
    w.write_all(&p.did.to_le_bytes())?;
    w.write_all(&p.pos.to_le_bytes())?;
    Ok(())
}

/// Одна запись постинга из потока; чистый EOF перед первым полем даёт `None`.
pub fn read_posting9_opt<R: Read>(rd: &mut R) -> io::Result<Option<Posting9>> {
    let mut hb = [0u8; 8];
    match rd.read_exact(&mut hb) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let mut db = [0u8; 4];
    let mut pb = [0u8; 4];
    rd.read_exact(&mut db)?;
    rd.read_exact(&mut pb)?;
    Ok(Some(Posting9 {
        h: u64::from_le_bytes(hb),
        did: u32::from_le_bytes(db),
        pos: u32::from_le_bytes(pb),
    }))
}

/// Компактная UTC-метка сборки: YYYYMMDD_HHMMSS.
pub fn utc_now_compact() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

/// tmp -> fin через rename; при коллизии имён цель удаляется и rename
/// повторяется один раз.
pub fn atomic_replace_file(tmp: &Path, fin: &Path) -> Result<()> {
    if fs::rename(tmp, fin).is_ok() {
        return Ok(());
    }
    let _ = fs::remove_file(fin);
    fs::rename(tmp, fin).map_err(|e| Error::io_at(fin, e))
}
