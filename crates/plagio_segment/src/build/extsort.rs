//! Внешняя сортировка постингов без удержания всего объёма в памяти.
//!
//! Схема: один проход по сырым воркерным файлам раскладывает записи в 256
//! бакетов по старшему байту `h`; бакеты держат непересекающиеся префиксы
//! хэша, поэтому конкатенация отсортированных бакетов в порядке номеров
//! даёт глобально отсортированный поток без финального слияния. Внутри
//! бакета сортирует LSD-radix; когда бакет не влезает в бюджет памяти,
//! включаются прогоны на диске и k-way merge через min-heap.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::format::{read_posting9_opt, write_posting9, POSTING9_BYTES};
use crate::Posting9;

const BUCKETS: usize = 256;

/// Максимальный fan-in слияния; лишние прогоны пред-сливаются группами.
const MAX_MERGE_FANIN: usize = 64;

/// Порог сброса пер-бакетного буфера при партиционировании.
const PART_FLUSH_BYTES: usize = 64 * 1024;

/// Прогнать все воркерные файлы через сортировку и дописать глобально
/// отсортированные постинги в `out`. Возвращает число записанных записей.
pub(crate) fn sort_postings_into<W: Write>(
    worker_files: &[PathBuf],
    scratch_dir: &Path,
    ram_limit_bytes: usize,
    out: &mut W,
) -> Result<u64> {
    let mut counts = [0u64; BUCKETS];
    partition_by_top_byte(worker_files, scratch_dir, &mut counts)?;

    // лимит записей на бакет: половина бюджета под сами записи,
    // половина под вспомогательный буфер radix-сортировки
    let max_recs = (ram_limit_bytes / (2 * POSTING9_BYTES)).max(1);

    let mut total = 0u64;
    for b in 0..BUCKETS {
        if counts[b] == 0 {
            continue;
        }
        let bpath = bucket_path(scratch_dir, b);
        let n = counts[b] as usize;
        if n <= max_recs {
            let mut recs = read_postings_file(&bpath, n)?;
            radix_sort_postings(&mut recs);
            for p in &recs {
                write_posting9(out, p).map_err(Error::Io)?;
            }
        } else {
            debug!(bucket = b, records = n, max_recs, "bucket spills to runs");
            spill_and_merge_bucket(&bpath, scratch_dir, b, n, max_recs, out)?;
        }
        total += n as u64;
        let _ = fs::remove_file(&bpath);
    }
    Ok(total)
}

/// Первый проход: каждый воркерный файл читается один раз, записи
/// уходят в бакет по старшему байту `h` через небольшой буфер.
fn partition_by_top_byte(
    worker_files: &[PathBuf],
    scratch_dir: &Path,
    counts: &mut [u64; BUCKETS],
) -> Result<()> {
    let mut bufs: Vec<Vec<u8>> = (0..BUCKETS).map(|_| Vec::new()).collect();
    let mut files: Vec<Option<File>> = (0..BUCKETS).map(|_| None).collect();

    for wf in worker_files {
        let f = File::open(wf).map_err(|e| Error::io_at(wf, e))?;
        let mut rd = BufReader::new(f);
        let mut rec = [0u8; POSTING9_BYTES];
        loop {
            match rd.read_exact(&mut rec) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(Error::io_at(wf, e)),
            }
            // h хранится LE, его старший байт лежит в rec[7]
            let b = rec[7] as usize;
            counts[b] += 1;
            bufs[b].extend_from_slice(&rec);
            if bufs[b].len() >= PART_FLUSH_BYTES {
                flush_bucket_buf(scratch_dir, b, &mut files[b], &mut bufs[b])?;
            }
        }
    }
    for b in 0..BUCKETS {
        if !bufs[b].is_empty() {
            flush_bucket_buf(scratch_dir, b, &mut files[b], &mut bufs[b])?;
        }
    }
    Ok(())
}

fn flush_bucket_buf(
    scratch_dir: &Path,
    b: usize,
    file: &mut Option<File>,
    buf: &mut Vec<u8>,
) -> Result<()> {
    if file.is_none() {
        let p = bucket_path(scratch_dir, b);
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&p)
            .map_err(|e| Error::io_at(&p, e))?;
        *file = Some(f);
    }
    if let Some(f) = file {
        f.write_all(buf).map_err(Error::Io)?;
    }
    buf.clear();
    Ok(())
}

fn bucket_path(scratch_dir: &Path, b: usize) -> PathBuf {
    scratch_dir.join(format!("bucket_{b:03}.tmp"))
}

fn read_postings_file(path: &Path, n: usize) -> Result<Vec<Posting9>> {
    let f = File::open(path).map_err(|e| Error::io_at(path, e))?;
    let mut rd = BufReader::new(f);
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        match read_posting9_opt(&mut rd).map_err(|e| Error::io_at(path, e))? {
            Some(p) => out.push(p),
            None => {
                return Err(Error::Internal(format!(
                    "bucket {} shorter than counted",
                    path.display()
                )))
            }
        }
    }
    Ok(out)
}

/// Бакет не влезает в бюджет: режем на отсортированные прогоны по
/// `max_recs` записей, затем k-way merge (с пред-слиянием при fan-in > 64).
fn spill_and_merge_bucket<W: Write>(
    bpath: &Path,
    scratch_dir: &Path,
    b: usize,
    n: usize,
    max_recs: usize,
    out: &mut W,
) -> Result<u64> {
    let f = File::open(bpath).map_err(|e| Error::io_at(bpath, e))?;
    let mut rd = BufReader::new(f);

    let mut run_paths: Vec<PathBuf> = Vec::new();
    let mut left = n;
    while left > 0 {
        let take = left.min(max_recs);
        let mut chunk = Vec::with_capacity(take);
        for _ in 0..take {
            match read_posting9_opt(&mut rd).map_err(|e| Error::io_at(bpath, e))? {
                Some(p) => chunk.push(p),
                None => {
                    return Err(Error::Internal(format!(
                        "bucket {} shorter than counted",
                        bpath.display()
                    )))
                }
            }
        }
        left -= take;
        radix_sort_postings(&mut chunk);

        let rp = scratch_dir.join(format!("bucket_{b:03}_run{:04}.tmp", run_paths.len()));
        write_run(&rp, &chunk)?;
        run_paths.push(rp);
    }

    // сверх-широкое слияние дробим: группы по 64 уходят в промежуточные прогоны
    let mut generation = run_paths.len();
    while run_paths.len() > MAX_MERGE_FANIN {
        let group: Vec<PathBuf> = run_paths.drain(..MAX_MERGE_FANIN).collect();
        let merged = scratch_dir.join(format!("bucket_{b:03}_run{generation:04}.tmp"));
        generation += 1;
        {
            let mf = File::create(&merged).map_err(|e| Error::io_at(&merged, e))?;
            let mut mw = BufWriter::new(mf);
            merge_runs(&group, &mut mw)?;
            mw.flush().map_err(Error::Io)?;
        }
        for p in &group {
            let _ = fs::remove_file(p);
        }
        run_paths.push(merged);
    }

    let written = merge_runs(&run_paths, out)?;
    for p in &run_paths {
        let _ = fs::remove_file(p);
    }
    Ok(written)
}

fn write_run(path: &Path, recs: &[Posting9]) -> Result<()> {
    let f = File::create(path).map_err(|e| Error::io_at(path, e))?;
    let mut w = BufWriter::new(f);
    for p in recs {
        write_posting9(&mut w, p).map_err(Error::Io)?;
    }
    w.flush().map_err(Error::Io)?;
    Ok(())
}

struct RunReader {
    rd: BufReader<File>,
    cur: Option<Posting9>,
}

impl RunReader {
    fn open(path: &Path) -> Result<Self> {
        let f = File::open(path).map_err(|e| Error::io_at(path, e))?;
        let mut r = RunReader {
            rd: BufReader::new(f),
            cur: None,
        };
        r.advance()?;
        Ok(r)
    }

    fn advance(&mut self) -> Result<()> {
        self.cur = read_posting9_opt(&mut self.rd).map_err(Error::Io)?;
        Ok(())
    }
}

/// k-way merge по ключу (h, did, pos) через min-heap.
fn merge_runs<W: Write>(paths: &[PathBuf], out: &mut W) -> Result<u64> {
    let mut sources = paths
        .iter()
        .map(|p| RunReader::open(p))
        .collect::<Result<Vec<_>>>()?;

    let mut heap: BinaryHeap<Reverse<((u64, u32, u32), usize)>> = BinaryHeap::new();
    for (i, s) in sources.iter().enumerate() {
        if let Some(p) = s.cur {
            heap.push(Reverse(((p.h, p.did, p.pos), i)));
        }
    }

    let mut written = 0u64;
    while let Some(Reverse(((h, did, pos), i))) = heap.pop() {
        write_posting9(out, &Posting9 { h, did, pos }).map_err(Error::Io)?;
        written += 1;
        sources[i].advance()?;
        if let Some(p) = sources[i].cur {
            heap.push(Reverse(((p.h, p.did, p.pos), i)));
        }
    }
    Ok(written)
}

/// LSD-radix по байтам ключа, от младших к старшим: 4 прохода по pos,
/// 4 по did, 8 по h. Каждый проход: устойчивый counting sort на двух
/// таблицах по 256 входов; итоговый порядок (h, did, pos) по возрастанию.
pub(crate) fn radix_sort_postings(v: &mut Vec<Posting9>) {
    if v.len() <= 1 {
        return;
    }
    let mut aux: Vec<Posting9> = vec![Posting9::default(); v.len()];
    for pass in 0..16 {
        let mut count = [0usize; 256];
        for p in v.iter() {
            count[key_byte(p, pass) as usize] += 1;
        }
        if count.iter().any(|&c| c == v.len()) {
            // все записи в одной корзине, проход ничего не меняет
            continue;
        }
        let mut offs = [0usize; 256];
        let mut acc = 0usize;
        for (o, c) in offs.iter_mut().zip(count.iter()) {
            *o = acc;
            acc += c;
        }
        for p in v.iter() {
            let k = key_byte(p, pass) as usize;
            aux[offs[k]] = *p;
            offs[k] += 1;
        }
        std::mem::swap(v, &mut aux);
    }
}

#[inline]
fn key_byte(p: &Posting9, pass: usize) -> u8 {
    match pass {
        0..=3 => (p.pos >> (8 * pass)) as u8,
        4..=7 => (p.did >> (8 * (pass - 4))) as u8,
        _ => (p.h >> (8 * (pass - 8))) as u8,
    }
}
