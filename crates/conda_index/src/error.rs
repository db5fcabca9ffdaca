use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while indexing a channel.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{path}: not a valid package archive: {reason}")]
    ArchiveFormat { path: PathBuf, reason: String },

    #[error("{path}: archive does not contain info/index.json")]
    MissingIndexJson { path: PathBuf },

    #[error("cache error: {0}")]
    Cache(#[from] rusqlite::Error),

    #[error("unusable cache: {0}")]
    CacheFormat(String),

    #[cfg(feature = "postgresql")]
    #[error("cache server error: {0}")]
    CacheServer(#[from] postgres::Error),

    #[error("{channel_prefix_file} contains invalid channel_prefix {found:?}")]
    InvalidChannelPrefix {
        channel_prefix_file: PathBuf,
        found: String,
    },

    #[error("another indexer is running on {subdir}")]
    CacheLocked { subdir: String },

    #[error("invalid patch instructions: {0}")]
    PatchMalformed(String),

    #[error("incompatible patch instructions version {0}")]
    PatchInstructionsVersion(u64),

    #[error("msgpack encode error: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    #[error("template error: {0}")]
    Template(#[from] tera::Error),

    #[error("interrupted")]
    Interrupted,

    #[error("failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("indexing failed for subdirs: {}", .0.join(", "))]
    SubdirsFailed(Vec<String>),
}

pub type Result<T> = std::result::Result<T, Error>;
