//! Чтение запечатанного сегмента в память.
//!
//! Частичного успеха нет: любое расхождение с форматом даёт ошибку,
//! починкой читатель не занимается.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::docinfo::{parse_docinfo_array, DocInfo};
use crate::error::{Error, Result};
use crate::format::{self, HeaderV2, DOCMETA_BYTES, HEADER_BYTES, POSTING9_BYTES};
use crate::{DocMeta, Posting9};

/// Содержимое `index_native.bin`, целиком в памяти.
#[derive(Debug, Clone)]
pub struct SegmentData {
    pub seg_dir: PathBuf,
    pub header: HeaderV2,
    pub docmeta: Vec<DocMeta>,
    pub postings9: Vec<Posting9>,
}

pub fn load_segment_bin(seg_dir: &Path) -> Result<SegmentData> {
    let bin = seg_dir.join(format::SEGMENT_BIN);
    let f = File::open(&bin).map_err(|e| Error::io_at(&bin, e))?;
    let m = unsafe { Mmap::map(&f) }.map_err(|e| Error::io_at(&bin, e))?;

    let header = parse_header_at(&m, &bin)?;

    let docmeta_bytes = (header.n_docs as usize)
        .checked_mul(DOCMETA_BYTES)
        .ok_or_else(|| bad(&bin, "docmeta section overflows"))?;
    let postings_bytes = (header.n_post9 as usize)
        .checked_mul(POSTING9_BYTES)
        .ok_or_else(|| bad(&bin, "postings section overflows"))?;
    let expected = HEADER_BYTES
        .checked_add(docmeta_bytes)
        .and_then(|x| x.checked_add(postings_bytes))
        .ok_or_else(|| bad(&bin, "total size overflows"))?;
    if m.len() != expected {
        return Err(bad(
            &bin,
            &format!("size mismatch: file={} expected={expected}", m.len()),
        ));
    }

    // записи фиксированной ширины, читаем по полям
    let mut off = HEADER_BYTES;
    let mut docmeta = Vec::with_capacity(header.n_docs as usize);
    for _ in 0..header.n_docs {
        docmeta.push(DocMeta {
            tok_len: rd_u32(&m, &mut off),
            simhash_hi: rd_u64(&m, &mut off),
            simhash_lo: rd_u64(&m, &mut off),
        });
    }
    let mut postings9 = Vec::with_capacity(header.n_post9 as usize);
    for _ in 0..header.n_post9 {
        postings9.push(Posting9 {
            h: rd_u64(&m, &mut off),
            did: rd_u32(&m, &mut off),
            pos: rd_u32(&m, &mut off),
        });
    }

    Ok(SegmentData {
        seg_dir: seg_dir.to_path_buf(),
        header,
        docmeta,
        postings9,
    })
}

pub fn load_docinfo_json(seg_dir: &Path) -> Result<Vec<DocInfo>> {
    let p = seg_dir.join(format::SEGMENT_DOCIDS);
    let bytes = fs::read(&p).map_err(|e| Error::io_at(&p, e))?;
    parse_docinfo_array(&bytes).map_err(|e| match e {
        Error::Parse(msg) => Error::Parse(format!("{}: {msg}", p.display())),
        other => other,
    })
}

fn parse_header_at(m: &[u8], bin: &Path) -> Result<HeaderV2> {
    match format::parse_header_v2(m) {
        Ok(h) => Ok(h),
        Err(Error::InvalidFormat(msg)) => Err(bad(bin, &msg)),
        Err(other) => Err(other),
    }
}

fn bad(path: &Path, msg: &str) -> Error {
    Error::InvalidFormat(format!("{}: {msg}", path.display()))
}

// длина файла проверена заранее, срезы не выходят за границы
fn rd_u32(b: &[u8], off: &mut usize) -> u32 {
    let v = u32::from_le_bytes(b[*off..*off + 4].try_into().unwrap());
    *off += 4;
    v
}

fn rd_u64(b: &[u8], off: &mut usize) -> u64 {
    let v = u64::from_le_bytes(b[*off..*off + 8].try_into().unwrap());
    *off += 8;
    v
}
