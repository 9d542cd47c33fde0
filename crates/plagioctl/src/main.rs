use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use plagio_segment::build::{build_segment_jsonl, BuildOptions};
use plagio_segment::search::SearchOptions;
use plagio_segment::search_multi::search_out_root;
use plagio_segment::validator::{validate_out_root, validate_segment};

#[derive(Parser)]
#[command(version, about = "Plagio control: build/search/validate shingle segments")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Собрать сегмент из JSONL-корпуса и дописать его в манифест
    Build {
        #[arg(long)]
        input: PathBuf,
        /// Корень индекса (каталог сегментов + манифест)
        #[arg(long)]
        out: PathBuf,
        /// Имя сегмента; по умолчанию seg_<utc>
        #[arg(long)]
        segment_name: Option<String>,
        /// Строгий режим text_is_normalized
        /// (перекрывает PLAGIO_STRICT_TEXT_IS_NORMALIZED)
        #[arg(long)]
        strict: Option<bool>,
        /// Лимит текста на документ в байтах, 0 = без лимита
        #[arg(long)]
        max_text_bytes: Option<usize>,
        #[arg(long)]
        max_tokens: Option<usize>,
        #[arg(long)]
        max_shingles: Option<usize>,
        /// Первые N успешных документов, 0 = без лимита
        #[arg(long)]
        max_docs: Option<u32>,
        #[arg(long)]
        stride: Option<usize>,
        #[arg(long)]
        threads: Option<usize>,
        /// Ёмкость очередей конвейера
        #[arg(long)]
        inflight: Option<usize>,
        /// Бюджет памяти внешней сортировки
        #[arg(long)]
        ram_limit_bytes: Option<usize>,
    },
    /// Поиск по всем сегментам корня индекса
    Search {
        #[arg(long)]
        root: PathBuf,
        #[arg(long)]
        q: String,
        /// Запрос уже нормализован
        #[arg(long, default_value_t = false)]
        normalized: bool,
        #[arg(long, default_value_t = 20)]
        topk: usize,
        #[arg(long, default_value_t = 200)]
        candidates_topn: usize,
        #[arg(long, default_value_t = 2)]
        min_hits: u32,
        #[arg(long, default_value_t = 50_000)]
        max_postings_per_hash: usize,
        #[arg(long, default_value_t = 6)]
        span_min_len: u32,
        #[arg(long, default_value_t = 0)]
        span_gap: u32,
        #[arg(long, default_value_t = 10)]
        max_spans_per_doc: usize,
        #[arg(long, default_value_t = 0.60)]
        alpha: f64,
    },
    /// Проверить инварианты: один сегмент (--seg) или весь корень (--root)
    Validate {
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long)]
        seg: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    init_tracing();
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Build {
            input,
            out,
            segment_name,
            strict,
            max_text_bytes,
            max_tokens,
            max_shingles,
            max_docs,
            stride,
            threads,
            inflight,
            ram_limit_bytes,
        } => {
            let mut opt = BuildOptions::default();
            if let Some(v) = segment_name {
                opt.segment_name = v;
            }
            opt.strict_text_is_normalized = strict;
            if let Some(v) = max_text_bytes {
                opt.max_text_bytes_per_doc = v;
            }
            if let Some(v) = max_tokens {
                opt.max_tokens_per_doc = v;
            }
            if let Some(v) = max_shingles {
                opt.max_shingles_per_doc = v;
            }
            if let Some(v) = max_docs {
                opt.max_docs_in_segment = v;
            }
            if let Some(v) = stride {
                opt.shingle_stride = v;
            }
            if let Some(v) = threads {
                opt.max_threads = v;
            }
            if let Some(v) = inflight {
                opt.inflight_docs = v;
            }
            if let Some(v) = ram_limit_bytes {
                opt.ram_limit_bytes = v;
            }

            let stats = build_segment_jsonl(&input, &out, &opt)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(ExitCode::SUCCESS)
        }
        Cmd::Search {
            root,
            q,
            normalized,
            topk,
            candidates_topn,
            min_hits,
            max_postings_per_hash,
            span_min_len,
            span_gap,
            max_spans_per_doc,
            alpha,
        } => {
            let opt = SearchOptions {
                topk,
                candidates_topn,
                min_hits,
                max_postings_per_hash,
                span_min_len,
                span_gap,
                max_spans_per_doc,
                alpha,
            };
            let res = search_out_root(&root, &q, normalized, &opt);
            println!("{}", serde_json::to_string_pretty(&res)?);
            Ok(ExitCode::SUCCESS)
        }
        Cmd::Validate { root, seg } => {
            let vr = match (root, seg) {
                (Some(root), None) => validate_out_root(&root),
                (None, Some(seg)) => validate_segment(&seg, true),
                _ => bail!("pass exactly one of --root or --seg"),
            };
            if vr.ok {
                println!("OK");
                Ok(ExitCode::SUCCESS)
            } else {
                for e in &vr.errors {
                    eprintln!("FAIL: {e}");
                }
                Ok(ExitCode::from(2))
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
