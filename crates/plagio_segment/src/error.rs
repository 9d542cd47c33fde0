use std::path::PathBuf;

use thiserror::Error;

/// Ошибки уровня библиотеки.
///
/// Ошибки разбора отдельных строк корпуса сюда не попадают: такие строки
/// молча пропускаются и учитываются в статистике `skipped`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("io at {path}: {source}")]
    IoAt {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse: {0}")]
    Parse(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("invalid args: {0}")]
    InvalidArgs(String),

    #[error("segment already exists: {0}")]
    SegmentExists(String),

    #[error("no valid docs in corpus")]
    NoValidDocs,

    #[error("validation failed: {}", .0.join("; "))]
    ValidationFailed(Vec<String>),

    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::IoAt {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
