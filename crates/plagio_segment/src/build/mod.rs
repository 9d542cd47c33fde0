//! Потоковая сборка сегмента из JSONL-корпуса.
//!
//! Топология: один поток-читатель кормит ограниченную очередь строк,
//! пул воркеров разбирает документы и пишет сырые постинги каждый в свой
//! файл, единственный упорядоченный writer выдаёт doc-метаданные и
//! doc-info строго по возрастанию did. Затем постинги проходят внешнюю
//! сортировку, и сегмент публикуется атомарно (tmp -> rename), всё или
//! ничего.

mod extsort;

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::Serialize;
use tracing::{debug, info};

use crate::common::preview::{preview_prefix, PREVIEW_MAX_BYTES};
use crate::common::strings::floor_char_boundary;
use crate::docinfo::DocInfo;
use crate::error::{Error, Result};
use crate::format::{self, HeaderV2, DOCMETA_BYTES, POSTING9_BYTES};
use crate::manifest::{self, SegmentEntry, SegmentStats};
use crate::normalizer::normalize;
use crate::textpipe::{hash_shingle, simhash128, token_hashes, tokenize_spans};
use crate::{DocMeta, K_SHINGLE};

/// Переменная окружения строгого режима: отсутствие флага
/// `text_is_normalized` в строке корпуса трактуется как «не нормализован».
pub const STRICT_ENV: &str = "PLAGIO_STRICT_TEXT_IS_NORMALIZED";

const MIB: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Пусто => автоимя `seg_<utc-compact>`.
    pub segment_name: String,
    /// None => значение берётся из окружения (PLAGIO_STRICT_TEXT_IS_NORMALIZED).
    pub strict_text_is_normalized: Option<bool>,
    /// Обрезка входного текста в байтах, 0 = без лимита.
    pub max_text_bytes_per_doc: usize,
    /// 0 = без лимита.
    pub max_tokens_per_doc: usize,
    /// 0 = без лимита.
    pub max_shingles_per_doc: usize,
    /// Первые N успешных документов; 0 = без лимита.
    pub max_docs_in_segment: u32,
    /// Шаг между позициями шинглов.
    pub shingle_stride: usize,
    /// Верхняя граница пула воркеров, дополнительно режется по числу ядер.
    pub max_threads: usize,
    /// Ёмкость очередей; 0 => max(32, 4 * threads).
    pub inflight_docs: usize,
    /// Бюджет памяти внешней сортировки на бакет.
    pub ram_limit_bytes: usize,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            segment_name: String::new(),
            strict_text_is_normalized: None,
            max_text_bytes_per_doc: 8 * MIB,
            max_tokens_per_doc: 100_000,
            max_shingles_per_doc: 50_000,
            max_docs_in_segment: 0,
            shingle_stride: 1,
            max_threads: 16,
            inflight_docs: 0,
            ram_limit_bytes: 512 * MIB,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildStats {
    pub segment_name: String,
    pub seg_dir: PathBuf,
    pub docs: u64,
    pub post9: u64,
    pub threads: usize,
    /// Строки, молча пропущенные при разборе (битый JSON, пустые поля,
    /// короткие документы, сверхдлинные строки).
    pub skipped: u64,
    pub strict_text_is_normalized: bool,
    pub built_at_utc: String,
}

pub(crate) fn env_strict_flag() -> bool {
    match std::env::var(STRICT_ENV) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "TRUE"),
        Err(_) => false,
    }
}

/// Результат обработки одного документа воркером; writer переупорядочивает
/// их по did.
struct DocResult {
    did: u32,
    meta: DocMeta,
    info: DocInfo,
}

struct Shared {
    stop: AtomicBool,
    next_did: AtomicU32,
    skipped: AtomicU64,
    first_err: Mutex<Option<Error>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            next_did: AtomicU32::new(0),
            skipped: AtomicU64::new(0),
            first_err: Mutex::new(None),
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn fail(&self, e: Error) {
        let mut g = self.first_err.lock().unwrap_or_else(|p| p.into_inner());
        if g.is_none() {
            *g = Some(e);
        }
        self.stop.store(true, Ordering::SeqCst);
    }

    fn skip_line(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// did выдаётся CAS-циклом: голый fetch_add перевыдаёт id,
    /// когда лимит документов конечен.
    fn try_acquire_did(&self, cap: u32) -> Option<u32> {
        loop {
            let cur = self.next_did.load(Ordering::SeqCst);
            if cap > 0 && cur >= cap {
                return None;
            }
            if self
                .next_did
                .compare_exchange(cur, cur + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Some(cur);
            }
        }
    }
}

/// Собрать сегмент из JSONL-корпуса в `out_root/<segment_name>/` и
/// дописать его в манифест. При любой ошибке после создания каталога
/// сегмента каталог удаляется целиком.
pub fn build_segment_jsonl(
    corpus_jsonl: &Path,
    out_root: &Path,
    opt: &BuildOptions,
) -> Result<BuildStats> {
    if opt.shingle_stride == 0 {
        return Err(Error::InvalidArgs("shingle_stride must be >= 1".into()));
    }
    let strict = opt.strict_text_is_normalized.unwrap_or_else(env_strict_flag);
    let segment_name = if opt.segment_name.is_empty() {
        format!("seg_{}", format::utc_now_compact())
    } else {
        opt.segment_name.clone()
    };

    fs::create_dir_all(out_root).map_err(|e| Error::io_at(out_root, e))?;
    let seg_dir = out_root.join(&segment_name);
    if seg_dir.exists() {
        return Err(Error::SegmentExists(seg_dir.display().to_string()));
    }
    fs::create_dir_all(&seg_dir).map_err(|e| Error::io_at(&seg_dir, e))?;

    let res = build_into(corpus_jsonl, out_root, &seg_dir, &segment_name, strict, opt);
    if res.is_err() {
        let _ = fs::remove_dir_all(&seg_dir);
    }
    res
}

fn build_into(
    corpus_jsonl: &Path,
    out_root: &Path,
    seg_dir: &Path,
    segment_name: &str,
    strict: bool,
    opt: &BuildOptions,
) -> Result<BuildStats> {
    let corpus = File::open(corpus_jsonl).map_err(|e| Error::io_at(corpus_jsonl, e))?;

    let hw = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    let threads = opt.max_threads.clamp(1, hw.max(1));
    let inflight = if opt.inflight_docs > 0 {
        opt.inflight_docs
    } else {
        (4 * threads).max(32)
    };
    // сверхдлинная строка пропускается ещё до очереди, чтобы не раздувать память
    let line_limit = if opt.max_text_bytes_per_doc > 0 {
        (opt.max_text_bytes_per_doc + MIB).max(2 * MIB)
    } else {
        usize::MAX
    };

    info!(segment = segment_name, threads, inflight, "building segment");

    let shared = Arc::new(Shared::new());
    let (line_tx, line_rx) = bounded::<String>(inflight);
    let (doc_tx, doc_rx) = bounded::<DocResult>(inflight);

    let reader = {
        let shared = Arc::clone(&shared);
        let corpus_path = corpus_jsonl.to_path_buf();
        thread::spawn(move || read_lines(corpus, &corpus_path, line_tx, &shared, line_limit))
    };

    let mut worker_files = Vec::with_capacity(threads);
    let mut workers = Vec::with_capacity(threads);
    for w in 0..threads {
        let path = seg_dir.join(format!("postings_w{w:02}.tmp"));
        worker_files.push(path.clone());
        let ctx = WorkerCtx {
            rx: line_rx.clone(),
            tx: doc_tx.clone(),
            shared: Arc::clone(&shared),
            path,
            strict,
            meta_path: format!("{segment_name}/"),
            opt: opt.clone(),
        };
        workers.push(thread::spawn(move || worker_loop(ctx)));
    }
    drop(line_rx);
    drop(doc_tx);

    let docmeta_path = seg_dir.join("docmeta.bin.tmp");
    let docids_tmp = seg_dir.join(format!("{}.tmp", format::SEGMENT_DOCIDS));
    let writer = {
        let shared = Arc::clone(&shared);
        let docmeta_path = docmeta_path.clone();
        let docids_tmp = docids_tmp.clone();
        thread::spawn(move || writer_loop(doc_rx, &shared, &docmeta_path, &docids_tmp))
    };

    reader
        .join()
        .map_err(|_| Error::Internal("reader thread panicked".into()))?;
    for w in workers {
        w.join()
            .map_err(|_| Error::Internal("worker thread panicked".into()))?;
    }
    let written = writer
        .join()
        .map_err(|_| Error::Internal("writer thread panicked".into()))?;

    if let Some(e) = shared
        .first_err
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .take()
    {
        return Err(e);
    }
    let n_docs = written?;
    if n_docs == 0 {
        return Err(Error::NoValidDocs);
    }

    // размер потока doc-метаданных обязан сойтись с числом документов
    let meta_len = fs::metadata(&docmeta_path)
        .map_err(|e| Error::io_at(&docmeta_path, e))?
        .len();
    if meta_len != n_docs as u64 * DOCMETA_BYTES as u64 {
        return Err(Error::InvalidFormat(format!(
            "docmeta stream size mismatch: {meta_len} bytes for {n_docs} docs"
        )));
    }

    // n_post9 известен заранее по размерам воркерных файлов
    let mut n_post9 = 0u64;
    for p in &worker_files {
        let len = fs::metadata(p).map_err(|e| Error::io_at(p, e))?.len();
        if len % POSTING9_BYTES as u64 != 0 {
            return Err(Error::InvalidFormat(format!(
                "raw postings file {} has partial record",
                p.display()
            )));
        }
        n_post9 += len / POSTING9_BYTES as u64;
    }

    debug!(n_docs, n_post9, "sorting postings");

    let bin_tmp = seg_dir.join(format!("{}.tmp", format::SEGMENT_BIN));
    {
        let bf = File::create(&bin_tmp).map_err(|e| Error::io_at(&bin_tmp, e))?;
        let mut bout = BufWriter::new(bf);
        format::write_header_v2(
            &mut bout,
            &HeaderV2 {
                n_docs,
                n_post9,
                n_post13: 0,
            },
        )
        .map_err(Error::Io)?;

        let mut meta_in = File::open(&docmeta_path).map_err(|e| Error::io_at(&docmeta_path, e))?;
        io::copy(&mut meta_in, &mut bout).map_err(Error::Io)?;

        let sorted = extsort::sort_postings_into(
            &worker_files,
            seg_dir,
            opt.ram_limit_bytes.max(2 * POSTING9_BYTES),
            &mut bout,
        )?;
        if sorted != n_post9 {
            return Err(Error::Internal(format!(
                "external sort wrote {sorted} postings, expected {n_post9}"
            )));
        }
        bout.flush().map_err(Error::Io)?;
    }
    let _ = fs::remove_file(&docmeta_path);
    for p in &worker_files {
        let _ = fs::remove_file(p);
    }

    let built_at = format::utc_now_compact();
    let meta_tmp = seg_dir.join(format!("{}.tmp", format::SEGMENT_META));
    let meta_json = serde_json::json!({
        "segment_name": segment_name,
        "built_at_utc": built_at,
        "stats": { "docs": n_docs, "k9": n_post9, "k13": 0 },
        "strict_text_is_normalized": strict as i32,
    });
    fs::write(
        &meta_tmp,
        serde_json::to_vec(&meta_json).map_err(|e| Error::Parse(format!("meta encode: {e}")))?,
    )
    .map_err(|e| Error::io_at(&meta_tmp, e))?;

    format::atomic_replace_file(&bin_tmp, &seg_dir.join(format::SEGMENT_BIN))?;
    format::atomic_replace_file(&docids_tmp, &seg_dir.join(format::SEGMENT_DOCIDS))?;
    format::atomic_replace_file(&meta_tmp, &seg_dir.join(format::SEGMENT_META))?;

    manifest::append_segment(
        out_root,
        SegmentEntry {
            segment_name: segment_name.to_string(),
            path: format!("{segment_name}/"),
            built_at_utc: built_at.clone(),
            stats: SegmentStats {
                docs: n_docs as u64,
                k9: n_post9,
                k13: 0,
            },
        },
    )?;

    let skipped = shared.skipped.load(Ordering::Relaxed);
    info!(
        segment = segment_name,
        docs = n_docs,
        post9 = n_post9,
        skipped,
        "segment sealed"
    );

    Ok(BuildStats {
        segment_name: segment_name.to_string(),
        seg_dir: seg_dir.to_path_buf(),
        docs: n_docs as u64,
        post9: n_post9,
        threads,
        skipped,
        strict_text_is_normalized: strict,
        built_at_utc: built_at,
    })
}

fn read_lines(
    corpus: File,
    corpus_path: &Path,
    tx: Sender<String>,
    shared: &Shared,
    line_limit: usize,
) {
    let rd = BufReader::new(corpus);
    for line in rd.lines() {
        if shared.stopped() {
            return;
        }
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                shared.fail(Error::io_at(corpus_path, e));
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        if line.len() > line_limit {
            shared.skip_line();
            continue;
        }
        // Err == все воркеры ушли; очередь закрыта
        if tx.send(line).is_err() {
            return;
        }
    }
}

struct WorkerCtx {
    rx: Receiver<String>,
    tx: Sender<DocResult>,
    shared: Arc<Shared>,
    path: PathBuf,
    strict: bool,
    meta_path: String,
    opt: BuildOptions,
}

fn worker_loop(ctx: WorkerCtx) {
    let file = match File::create(&ctx.path) {
        Ok(f) => f,
        Err(e) => {
            ctx.shared.fail(Error::io_at(&ctx.path, e));
            return;
        }
    };
    let mut out = BufWriter::new(file);
    while let Ok(line) = ctx.rx.recv() {
        if ctx.shared.stopped() {
            // дренируем очередь, работу выбрасываем
            continue;
        }
        if let Err(e) = process_line(&ctx, &line, &mut out) {
            ctx.shared.fail(e);
        }
    }
    if let Err(e) = out.flush() {
        ctx.shared.fail(Error::io_at(&ctx.path, e));
    }
}

/// Флаг нормализованности из строки корпуса: новый ключ приоритетнее
/// старого `normalized`; без флага true, в строгом режиме false.
fn line_text_is_normalized(v: &serde_json::Value, strict: bool) -> bool {
    for key in ["text_is_normalized", "normalized"] {
        if let Some(val) = v.get(key) {
            return val.as_bool().unwrap_or(true);
        }
    }
    !strict
}

fn str_field(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_default()
        .to_string()
}

fn process_line(ctx: &WorkerCtx, line: &str, out: &mut BufWriter<File>) -> Result<()> {
    let v: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => {
            ctx.shared.skip_line();
            return Ok(());
        }
    };
    let Some(doc_id) = v.get("doc_id").and_then(|x| x.as_str()).filter(|s| !s.is_empty()) else {
        ctx.shared.skip_line();
        return Ok(());
    };
    let Some(text) = v.get("text").and_then(|x| x.as_str()).filter(|s| !s.is_empty()) else {
        ctx.shared.skip_line();
        return Ok(());
    };

    let text_is_norm = line_text_is_normalized(&v, ctx.strict);

    // байтовый лимит: нормализованный вход режем по границе символа,
    // сырой как есть (нормализация сама переварит обрубок)
    let cap = ctx.opt.max_text_bytes_per_doc;
    let raw = text.as_bytes();
    let raw = if cap > 0 && raw.len() > cap {
        if text_is_norm {
            &raw[..floor_char_boundary(text, cap)]
        } else {
            &raw[..cap]
        }
    } else {
        raw
    };

    let norm: String = if text_is_norm {
        String::from_utf8_lossy(raw).into_owned()
    } else {
        normalize(raw)
    };

    let mut spans = tokenize_spans(&norm);
    if ctx.opt.max_tokens_per_doc > 0 && spans.len() > ctx.opt.max_tokens_per_doc {
        spans.truncate(ctx.opt.max_tokens_per_doc);
    }
    if spans.len() < K_SHINGLE {
        ctx.shared.skip_line();
        return Ok(());
    }

    let th = token_hashes(&norm, &spans);
    let (simhash_hi, simhash_lo) = simhash128(&th);
    let cnt = spans.len() - K_SHINGLE + 1;

    let Some(did) = ctx.shared.try_acquire_did(ctx.opt.max_docs_in_segment) else {
        // лимит документов исчерпан: сворачиваем конвейер
        ctx.shared.stop.store(true, Ordering::SeqCst);
        return Ok(());
    };

    let max_sh = if ctx.opt.max_shingles_per_doc > 0 {
        ctx.opt.max_shingles_per_doc
    } else {
        cnt
    };
    let mut produced = 0usize;
    let mut pos = 0usize;
    while pos < cnt && produced < max_sh {
        let h = hash_shingle(&th, pos, K_SHINGLE);
        let rec = crate::Posting9 {
            h,
            did,
            pos: pos as u32,
        };
        format::write_posting9(out, &rec).map_err(|e| Error::io_at(&ctx.path, e))?;
        produced += 1;
        pos += ctx.opt.shingle_stride;
    }

    let result = DocResult {
        did,
        meta: DocMeta {
            tok_len: spans.len() as u32,
            simhash_hi,
            simhash_lo,
        },
        info: DocInfo {
            doc_id: doc_id.to_string(),
            organization_id: str_field(&v, "organization_id"),
            external_id: str_field(&v, "external_id"),
            source_path: str_field(&v, "source_path"),
            source_name: str_field(&v, "source_name"),
            meta_path: ctx.meta_path.clone(),
            preview_text: preview_prefix(&norm, PREVIEW_MAX_BYTES),
        },
    };
    // Err == writer уже лёг и взвёл stop; результат можно выбросить
    let _ = ctx.tx.send(result);
    Ok(())
}

/// Единственная точка, где появляются doc-метаданные и doc-info.
/// Сообщения приходят вразнобой; буферизуем по did и выдаём строго
/// по возрастанию.
fn writer_loop(
    rx: Receiver<DocResult>,
    shared: &Shared,
    docmeta_path: &Path,
    docids_tmp: &Path,
) -> Result<u32> {
    let res = writer_inner(rx, docmeta_path, docids_tmp);
    if res.is_err() {
        shared.stop.store(true, Ordering::SeqCst);
    }
    res
}

fn writer_inner(rx: Receiver<DocResult>, docmeta_path: &Path, docids_tmp: &Path) -> Result<u32> {
    let mf = File::create(docmeta_path).map_err(|e| Error::io_at(docmeta_path, e))?;
    let mut meta_out = BufWriter::new(mf);
    let jf = File::create(docids_tmp).map_err(|e| Error::io_at(docids_tmp, e))?;
    let mut ids_out = BufWriter::new(jf);
    ids_out.write_all(b"[").map_err(Error::Io)?;

    let mut pending: BTreeMap<u32, DocResult> = BTreeMap::new();
    let mut next: u32 = 0;
    while let Ok(r) = rx.recv() {
        pending.insert(r.did, r);
        while let Some(r) = pending.remove(&next) {
            meta_out
                .write_all(&r.meta.tok_len.to_le_bytes())
                .and_then(|_| meta_out.write_all(&r.meta.simhash_hi.to_le_bytes()))
                .and_then(|_| meta_out.write_all(&r.meta.simhash_lo.to_le_bytes()))
                .map_err(|e| Error::io_at(docmeta_path, e))?;
            if next > 0 {
                ids_out.write_all(b",").map_err(Error::Io)?;
            }
            serde_json::to_writer(&mut ids_out, &r.info)
                .map_err(|e| Error::Parse(format!("doc-info encode: {e}")))?;
            next += 1;
        }
    }
    if !pending.is_empty() {
        // дырка в нумерации did: кто-то взял id и не докоммитил документ
        return Err(Error::Internal(format!(
            "doc id gap at {next}, {} results stranded",
            pending.len()
        )));
    }
    ids_out.write_all(b"]").map_err(Error::Io)?;
    meta_out.flush().map_err(Error::Io)?;
    ids_out.flush().map_err(Error::Io)?;
    Ok(next)
}
