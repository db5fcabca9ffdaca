//! Durable per-subdir store of extracted package metadata.
//!
//! The cache tracks two kinds of state, keyed by archive filename: `stat`
//! rows (a fingerprint per *stage*, where `fs` is what the probe saw and
//! `indexed` is what has been extracted) and one payload table per metadata
//! kind. Repodata is generated entirely from the cache; the emitter never
//! goes back to the archives.

mod lock;
#[cfg(feature = "postgresql")]
mod postgres;
mod sqlite;

use std::path::Path;

use serde::Deserialize;

use crate::checksum::{Md5Bytes, Sha256Bytes};
use crate::error::{Error, Result};

pub use lock::CacheLock;
#[cfg(feature = "postgresql")]
pub use postgres::PostgresCache;
pub use sqlite::SqliteCache;

/// Stage tag for the upstream view of available packages.
pub const STAGE_FS: &str = "fs";
/// Stage tag recording what has been extracted into the payload tables.
pub const STAGE_INDEXED: &str = "indexed";

/// `base_url` handling is only enabled at this cache format version.
pub const CHANNEL_URL_FORMAT_VERSION: u32 = 2;

/// The cheap change-detection fingerprint of an archive: whole seconds and
/// byte size. Hashes are recorded when known but are advisory only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub mtime: i64,
    pub size: u64,
    pub sha256: Option<Sha256Bytes>,
    pub md5: Option<Md5Bytes>,
}

impl Fingerprint {
    pub fn new(mtime: i64, size: u64) -> Self {
        Fingerprint {
            mtime,
            size,
            sha256: None,
            md5: None,
        }
    }
}

/// One archive observed by the filesystem probe.
#[derive(Debug, Clone)]
pub struct FsEntry {
    /// Archive basename, e.g. `zlib-1.2.13-0.conda`.
    pub path: String,
    pub mtime: i64,
    pub size: u64,
}

/// The payload tables, one per cached metadata kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadTable {
    IndexJson,
    About,
    Recipe,
    RecipeLog,
    RunExports,
    PostInstall,
    Icon,
}

impl PayloadTable {
    pub fn table_name(self) -> &'static str {
        match self {
            PayloadTable::IndexJson => "index_json",
            PayloadTable::About => "about",
            PayloadTable::Recipe => "recipe",
            PayloadTable::RecipeLog => "recipe_log",
            PayloadTable::RunExports => "run_exports",
            PayloadTable::PostInstall => "post_install",
            PayloadTable::Icon => "icon",
        }
    }

    /// Column holding the payload blob; named after the table except for the
    /// icon table which predates the convention.
    pub fn column_name(self) -> &'static str {
        match self {
            PayloadTable::Icon => "icon_png",
            other => other.table_name(),
        }
    }
}

/// Extracted metadata for one archive, ready to be stored.
///
/// `index_json` is mandatory; an archive without a parseable `index.json`
/// never reaches the cache. `paths.json` is deliberately absent: it is
/// consumed during extraction to compute `post_install` and not retained.
#[derive(Debug, Clone, Default)]
pub struct PackagePayload {
    pub index_json: Vec<u8>,
    pub about: Option<Vec<u8>>,
    pub recipe: Option<Vec<u8>>,
    pub recipe_log: Option<Vec<u8>>,
    pub run_exports: Option<Vec<u8>>,
    pub post_install: Option<Vec<u8>>,
    pub icon: Option<Vec<u8>>,
}

impl PackagePayload {
    /// Iterate over the present payloads with their destination tables.
    pub fn tables(&self) -> impl Iterator<Item = (PayloadTable, &[u8])> {
        [
            (PayloadTable::About, self.about.as_deref()),
            (PayloadTable::Recipe, self.recipe.as_deref()),
            (PayloadTable::RecipeLog, self.recipe_log.as_deref()),
            (PayloadTable::RunExports, self.run_exports.as_deref()),
            (PayloadTable::PostInstall, self.post_install.as_deref()),
            (PayloadTable::Icon, self.icon.as_deref()),
            (PayloadTable::IndexJson, Some(self.index_json.as_slice())),
        ]
        .into_iter()
        .filter_map(|(table, data)| data.map(|d| (table, d)))
    }
}

/// Everything channeldata needs for one archive.
#[derive(Debug, Clone)]
pub struct ChanneldataRow {
    pub path: String,
    pub index_json: Vec<u8>,
    pub about: Option<Vec<u8>>,
    pub recipe: Option<Vec<u8>>,
    pub post_install: Option<Vec<u8>>,
    pub run_exports: Option<Vec<u8>>,
    pub icon: Option<Vec<u8>>,
}

/// Backend-agnostic contract of the metadata cache.
///
/// One handle serves one subdir; handles are moved between the extraction
/// and emission threads but never shared.
pub trait PackageCache: Send {
    /// Replace the entire `fs` stage for this subdir in one transaction.
    fn save_fs_state(&mut self, entries: &[FsEntry]) -> Result<()>;

    /// Paths whose `fs` fingerprint differs from their `indexed` fingerprint
    /// on (mtime, size), or that have no `indexed` row at all.
    fn changed_paths(&mut self) -> Result<Vec<FsEntry>>;

    /// Store payload rows and the matching `indexed` stat row, all in one
    /// transaction.
    fn store(&mut self, path: &str, fingerprint: &Fingerprint, payload: &PackagePayload)
        -> Result<()>;

    /// `(basename, index_json bytes)` for every path present in both the
    /// upstream stage and the `index_json` table, ordered by path.
    fn indexed_packages(&mut self) -> Result<Vec<(String, Vec<u8>)>>;

    /// `(basename, run_exports bytes)` for upstream paths that have
    /// run_exports, ordered by path.
    fn run_exports(&mut self) -> Result<Vec<(String, Vec<u8>)>>;

    /// Cached metadata for every upstream path, for channeldata.
    fn channeldata_inputs(&mut self) -> Result<Vec<ChanneldataRow>>;

    /// The stored `channel_url_format_version`, creating the default on
    /// first read.
    fn channel_url_format_version(&mut self) -> Result<u32>;
}

/// Which cache backend to use.
#[derive(Debug, Clone, Default)]
pub enum CacheBackend {
    /// A `cache.db` file per subdir.
    #[default]
    Sqlite,
    /// One shared server database for all subdirs of all channels.
    #[cfg(feature = "postgresql")]
    Postgresql {
        /// Connection URL, e.g. `postgresql://user@host/dbname`.
        url: String,
    },
}

/// Open the cache for one subdir of a channel.
pub fn open(
    channel_root: &Path,
    subdir: &str,
    backend: &CacheBackend,
    upstream_stage: &str,
) -> Result<Box<dyn PackageCache>> {
    match backend {
        CacheBackend::Sqlite => Ok(Box::new(SqliteCache::open(
            channel_root,
            subdir,
            upstream_stage,
        )?)),
        #[cfg(feature = "postgresql")]
        CacheBackend::Postgresql { url } => {
            let prefix = channel_prefix(channel_root)?;
            Ok(Box::new(PostgresCache::open(
                url,
                &prefix,
                subdir,
                upstream_stage,
            )?))
        }
    }
}

#[derive(Deserialize)]
struct ChannelPrefixFile {
    channel_prefix: String,
}

/// Read or create `<channel>/.cache/cache.json`, holding the random prefix
/// that namespaces this channel inside a shared backend.
pub fn channel_prefix(channel_root: &Path) -> Result<String> {
    let sidecar = channel_root.join(".cache").join("cache.json");
    if !sidecar.exists() {
        fs_err::create_dir_all(sidecar.parent().expect("sidecar path has a parent"))?;
        let prefix = uuid::Uuid::new_v4().simple().to_string();
        fs_err::write(
            &sidecar,
            serde_json::to_vec(&serde_json::json!({ "channel_prefix": prefix }))?,
        )?;
        return Ok(prefix);
    }
    let parsed: ChannelPrefixFile = serde_json::from_slice(&fs_err::read(&sidecar)?)?;
    // prevent SQL LIKE abuse
    if parsed.channel_prefix.is_empty()
        || !parsed
            .channel_prefix
            .bytes()
            .all(|b| b.is_ascii_alphanumeric())
    {
        return Err(Error::InvalidChannelPrefix {
            channel_prefix_file: sidecar,
            found: parsed.channel_prefix,
        });
    }
    Ok(parsed.channel_prefix)
}
