//! Create `repodata.json` and friends for a directory of conda packages.
//!
//! A channel directory holds one subdirectory per platform, each full of
//! `.conda` and `.tar.bz2` archives. [`ChannelIndex`] extracts the metadata
//! members of every archive into a per-subdir cache, then generates the
//! documents a package manager consumes: `repodata.json` (optionally
//! patched, sharded, and reduced to a `current_repodata.json` subset),
//! `run_exports.json`, `channeldata.json`, HTML listings and an RSS feed.
//!
//! Incremental behavior comes from the cache: an archive is only re-read
//! when its (mtime, size) fingerprint changes, and output files are only
//! rewritten when their bytes change.

pub mod archive;
pub mod cache;
mod channeldata;
mod checksum;
mod current;
mod error;
mod extract;
pub mod fs;
mod html;
mod patch;
mod repodata;
mod rss;
pub mod shards;
mod utils;
mod version;

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use fxhash::FxHashMap;

pub use crate::cache::{CacheBackend, PackageCache};
pub use crate::channeldata::{ChannelData, ChannelDataPackage};
pub use crate::checksum::{Md5Bytes, Sha256Bytes};
pub use crate::current::VersionPins;
pub use crate::error::{Error, Result};
pub use crate::extract::extract_package;
pub use crate::fs::{LocalFs, SubdirProbe};
pub use crate::patch::{
    ArchivePatchGenerator, PackageRecordPatch, PatchGenerator, PatchInstructions,
};
pub use crate::repodata::{ChannelInfo, PackageRecord, RepoData};
pub use crate::version::Version;

use crate::cache::{CacheLock, Fingerprint, FsEntry};
use crate::repodata::{REPODATA_VERSION, REPODATA_VERSION_BASE_URL};

/// The primary artifact, patched.
pub const REPODATA_JSON_FN: &str = "repodata.json";
/// The pre-patch counterpart of `repodata.json`.
pub const REPODATA_FROM_PKGS_JSON_FN: &str = "repodata_from_packages.json";
/// The newest-packages subset.
pub const CURRENT_REPODATA_JSON_FN: &str = "current_repodata.json";
/// Per-subdir run_exports document.
pub const RUN_EXPORTS_JSON_FN: &str = "run_exports.json";
/// Channel-level aggregate.
pub const CHANNELDATA_JSON_FN: &str = "channeldata.json";
/// Patch instructions echoed next to the repodata they produced.
pub const PATCH_INSTRUCTIONS_FN: &str = "patch_instructions.json";

/// Subdir names recognized when auto-detecting a channel's platforms.
pub const DEFAULT_SUBDIRS: &[&str] = &[
    "noarch",
    "emscripten-wasm32",
    "freebsd-64",
    "linux-32",
    "linux-64",
    "linux-aarch64",
    "linux-armv6l",
    "linux-armv7l",
    "linux-ppc64",
    "linux-ppc64le",
    "linux-riscv64",
    "linux-s390x",
    "osx-64",
    "osx-arm64",
    "wasi-wasm32",
    "win-32",
    "win-64",
    "win-arm64",
    "zos-z",
];

// zstd -T0 -b15 -e17 repodata.json: level 16 gives a nice jump in ratio and
// decompress speed
const ZSTD_COMPRESS_LEVEL: i32 = 16;

/// Cooperative stop signal, checked between archives and before
/// transactions.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Request cancellation; in-flight archive reads finish first.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything configurable about one indexing run.
#[derive(Debug, Clone)]
pub struct ChannelIndexConfig {
    /// Directory holding the platform subdirs.
    pub channel_root: PathBuf,
    /// Where output documents go; defaults to the channel root.
    pub output_root: Option<PathBuf>,
    /// Channel name shown in HTML and RSS; defaults to the root's basename.
    pub channel_name: Option<String>,
    /// Restrict indexing to these subdirs; `None` auto-detects.
    pub subdirs: Option<Vec<String>>,
    /// Extraction worker count; 0 picks the number of CPUs.
    pub threads: usize,
    /// Metadata cache backend.
    pub backend: CacheBackend,
    /// Stage tag naming the upstream view in the cache.
    pub upstream_stage: String,
    /// CEP-15 base url for packages served away from the repodata.
    pub base_url: Option<String>,
    /// Base url recorded in the shard manifest.
    pub shards_base_url: Option<String>,
    /// Write `repodata.json` / `repodata_from_packages.json`.
    pub write_monolithic: bool,
    /// Write the sharded repodata layout.
    pub write_shards: bool,
    /// Write `current_repodata.json`.
    pub write_current: bool,
    /// Write `run_exports.json`.
    pub write_run_exports: bool,
    /// Update `channeldata.json` after indexing.
    pub write_channeldata: bool,
    /// Write `index.html` listings.
    pub write_html: bool,
    /// Hover popups with digests on HTML download links.
    pub html_popups: bool,
    /// Write `rss.xml` (needs channeldata).
    pub write_rss: bool,
    /// Also write `.bz2` sidecars of the repodata documents.
    pub write_bz2: bool,
    /// Also write `.zst` sidecars of the repodata documents.
    pub write_zst: bool,
    /// One-line JSON documents; pretty-print when false.
    pub compact_json: bool,
    /// Probe the filesystem and extract changed archives. When false, emit
    /// from whatever the cache already holds.
    pub update_cache: bool,
    /// Extra versions to keep in `current_repodata.json`.
    pub current_index_versions: Option<VersionPins>,
}

impl Default for ChannelIndexConfig {
    fn default() -> Self {
        ChannelIndexConfig {
            channel_root: PathBuf::new(),
            output_root: None,
            channel_name: None,
            subdirs: None,
            threads: 0,
            backend: CacheBackend::default(),
            upstream_stage: cache::STAGE_FS.to_string(),
            base_url: None,
            shards_base_url: None,
            write_monolithic: true,
            write_shards: false,
            write_current: true,
            write_run_exports: false,
            write_channeldata: false,
            write_html: true,
            html_popups: true,
            write_rss: false,
            write_bz2: false,
            write_zst: false,
            compact_json: true,
            update_cache: true,
            current_index_versions: None,
        }
    }
}

/// A subdir whose cache is up to date and locked, ready for emission.
struct PreparedSubdir {
    subdir: String,
    cache: Box<dyn PackageCache>,
    /// Held through emission; readers of this subdir's cache are only ever
    /// on the thread owning this value.
    _lock: CacheLock,
}

/// Indexes one channel directory.
pub struct ChannelIndex {
    config: ChannelIndexConfig,
    output_root: PathBuf,
    channel_name: String,
    probe: Arc<dyn SubdirProbe>,
    cancel: CancellationToken,
}

impl ChannelIndex {
    /// Build an index runner for `config`.
    pub fn new(config: ChannelIndexConfig) -> Self {
        let output_root = config
            .output_root
            .clone()
            .unwrap_or_else(|| config.channel_root.clone());
        let channel_name = config.channel_name.clone().unwrap_or_else(|| {
            config
                .channel_root
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "channel".to_string())
        });
        ChannelIndex {
            config,
            output_root,
            channel_name,
            probe: Arc::new(LocalFs),
            cancel: CancellationToken::default(),
        }
    }

    /// Replace the filesystem probe, e.g. with a remote listing.
    pub fn with_probe(mut self, probe: Arc<dyn SubdirProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// A handle that cancels this run when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Index every subdir: probe, extract changed archives, emit outputs.
    ///
    /// Extraction of later subdirs overlaps with emission of earlier ones.
    /// A failed archive only skips that archive; a failed subdir only fails
    /// that subdir, reported at the end via [`Error::SubdirsFailed`].
    pub fn index(&self, patch_generator: Option<&dyn PatchGenerator>) -> Result<()> {
        let subdirs = self.detect_subdirs()?;
        tracing::info!("indexing subdirs {subdirs:?}");

        // extraction keeps the cores busy while already-extracted subdirs
        // assemble their outputs on a second pool
        let extract_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.threads)
            .build()?;
        let assembler_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.threads)
            .build()?;

        let mut failed: Vec<String> = Vec::new();
        let (tx, rx) = mpsc::channel::<(String, Result<PreparedSubdir>)>();
        let (fail_tx, fail_rx) = mpsc::channel::<String>();

        std::thread::scope(|scope| {
            let subdir_names = &subdirs;
            let extract_pool = &extract_pool;
            scope.spawn(move || {
                for subdir in subdir_names {
                    if self.cancel.is_cancelled() {
                        let _ = tx.send((subdir.clone(), Err(Error::Interrupted)));
                        break;
                    }
                    let prepared = self.prepare_subdir(subdir, extract_pool);
                    if tx.send((subdir.clone(), prepared)).is_err() {
                        break;
                    }
                }
                // sender drops here, ending the assembly loop
            });

            assembler_pool.in_place_scope(|assembler| {
                for (subdir, prepared) in rx {
                    match prepared {
                        Ok(mut prepared) => {
                            let fail_tx = fail_tx.clone();
                            assembler.spawn(move |_| {
                                tracing::info!("{} gathering repodata", prepared.subdir);
                                if let Err(e) = self.emit_subdir(&mut prepared, patch_generator)
                                {
                                    tracing::error!(
                                        "{} emission failed: {e}",
                                        prepared.subdir
                                    );
                                    let _ = fail_tx.send(prepared.subdir.clone());
                                } else {
                                    tracing::info!("completed {}", prepared.subdir);
                                }
                            });
                        }
                        Err(Error::Interrupted) => {
                            let _ = fail_tx.send(subdir);
                            break;
                        }
                        Err(e) => {
                            tracing::error!("{subdir} failed: {e}");
                            let _ = fail_tx.send(subdir);
                        }
                    }
                }
            });
            drop(fail_tx);
            failed.extend(fail_rx);
        });

        if self.cancel.is_cancelled() {
            return Err(Error::Interrupted);
        }
        if !failed.is_empty() {
            return Err(Error::SubdirsFailed(failed));
        }
        if self.config.write_channeldata {
            self.update_channeldata(&subdirs)?;
        }
        Ok(())
    }

    /// The subdirs to index: the configured list, or every recognized
    /// platform directory found under the channel root plus `noarch`.
    pub fn detect_subdirs(&self) -> Result<Vec<String>> {
        let mut subdirs: std::collections::BTreeSet<String> = match &self.config.subdirs {
            Some(subdirs) => subdirs.iter().cloned().collect(),
            None => {
                let mut detected: std::collections::BTreeSet<String> = DEFAULT_SUBDIRS
                    .iter()
                    .filter(|subdir| self.config.channel_root.join(subdir).is_dir())
                    .map(|subdir| subdir.to_string())
                    .collect();
                detected.insert("noarch".to_string());
                detected
            }
        };
        if !subdirs.contains("noarch") {
            tracing::warn!("indexing {subdirs:?} does not include noarch");
        }
        Ok(subdirs.into_iter().collect())
    }

    fn prepare_subdir(&self, subdir: &str, pool: &rayon::ThreadPool) -> Result<PreparedSubdir> {
        let subdir_path = self.config.channel_root.join(subdir);
        fs_err::create_dir_all(&subdir_path)?;

        let lock = CacheLock::acquire(&subdir_path.join(".cache"), subdir)?;
        let mut cache = cache::open(
            &self.config.channel_root,
            subdir,
            &self.config.backend,
            &self.config.upstream_stage,
        )?;

        if self.config.update_cache {
            tracing::debug!("{subdir} listdir");
            let entries = self.probe.list_subdir(&subdir_path)?;
            cache.save_fs_state(&entries)?;

            let changed = cache.changed_paths()?;
            tracing::info!("{subdir} extracting {} packages", changed.len());
            self.extract_changed(&subdir_path, cache.as_mut(), &changed, pool)?;
            if self.cancel.is_cancelled() {
                return Err(Error::Interrupted);
            }
        }

        Ok(PreparedSubdir {
            subdir: subdir.to_string(),
            cache,
            _lock: lock,
        })
    }

    /// Run the streaming extractor over `changed` on the worker pool;
    /// stores are applied serially on this thread.
    fn extract_changed(
        &self,
        subdir_path: &Path,
        cache: &mut dyn PackageCache,
        changed: &[FsEntry],
        pool: &rayon::ThreadPool,
    ) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        pool.in_place_scope(|scope| {
            for entry in changed {
                let tx = tx.clone();
                scope.spawn(move |_| {
                    if self.cancel.is_cancelled() {
                        return;
                    }
                    let archive_path = subdir_path.join(&entry.path);
                    let result = extract::extract_package(&archive_path);
                    let _ = tx.send((entry, result));
                });
            }
            drop(tx);

            for (entry, result) in rx {
                match result {
                    Ok(extracted) => {
                        let fingerprint = Fingerprint {
                            mtime: entry.mtime,
                            size: entry.size,
                            sha256: Some(extracted.sha256),
                            md5: Some(extracted.md5),
                        };
                        cache.store(&entry.path, &fingerprint, &extracted.payload)?;
                    }
                    Err(e) => {
                        // the stat row stays fs-only, so the archive is
                        // retried on the next run
                        tracing::warn!("not indexing {}: {e}", entry.path);
                    }
                }
            }
            Ok(())
        })
    }

    /// CEP-15 `base_url` for one subdir, when configured and enabled.
    fn subdir_base_url(&self, subdir: &str, format_version: u32) -> Option<String> {
        if format_version != cache::CHANNEL_URL_FORMAT_VERSION {
            return None;
        }
        self.config
            .base_url
            .as_ref()
            .map(|base| format!("{}/{subdir}/", base.trim_end_matches('/')))
    }

    fn emit_subdir(
        &self,
        prepared: &mut PreparedSubdir,
        patch_generator: Option<&dyn PatchGenerator>,
    ) -> Result<()> {
        let subdir = prepared.subdir.clone();
        let format_version = prepared.cache.channel_url_format_version()?;
        let base_url = self.subdir_base_url(&subdir, format_version);

        let mut repodata = RepoData {
            info: Some(ChannelInfo {
                subdir: subdir.clone(),
                base_url: base_url.clone(),
            }),
            version: Some(if base_url.is_some() {
                REPODATA_VERSION_BASE_URL
            } else {
                REPODATA_VERSION
            }),
            ..Default::default()
        };
        for (path, index_json) in prepared.cache.indexed_packages()? {
            let record: PackageRecord = match serde_json::from_slice(&index_json) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!("{subdir}/{path}: unreadable cached record: {e}");
                    continue;
                }
            };
            match archive::ArchiveType::try_from(&path) {
                Some(archive::ArchiveType::Conda) => {
                    repodata.conda_packages.insert(path, record);
                }
                Some(archive::ArchiveType::TarBz2) => {
                    repodata.packages.insert(path, record);
                }
                None => tracing::warn!("{path} doesn't look like a conda package"),
            }
        }

        if self.config.write_monolithic {
            tracing::info!("{subdir} writing pre-patch repodata");
            self.write_repodata_document(&subdir, &repodata, REPODATA_FROM_PKGS_JSON_FN)?;
        }

        tracing::info!("{subdir} applying patch instructions");
        let instructions = match patch_generator {
            Some(generator) => {
                let instructions = generator.instructions(&subdir, &repodata)?;
                self.write_document(
                    &subdir,
                    PATCH_INSTRUCTIONS_FN,
                    &serde_json::to_vec_pretty(&instructions)?,
                )?;
                instructions
            }
            None => PatchInstructions::default(),
        };
        patch::apply_instructions(&mut repodata, &instructions)?;

        if self.config.write_monolithic {
            tracing::info!("{subdir} writing patched repodata");
            self.write_repodata_document(&subdir, &repodata, REPODATA_JSON_FN)?;
        }

        if self.config.write_current {
            tracing::info!("{subdir} building current_repodata subset");
            let pins = self.config.current_index_versions.clone().unwrap_or_default();
            let current = current::build_current_repodata(&repodata, &pins);
            self.write_repodata_document(&subdir, &current, CURRENT_REPODATA_JSON_FN)?;
        }

        if self.config.write_run_exports {
            tracing::info!("{subdir} writing run_exports");
            let doc = build_run_exports_doc(&subdir, prepared.cache.as_mut())?;
            self.write_repodata_document(&subdir, &doc, RUN_EXPORTS_JSON_FN)?;
        }

        if self.config.write_shards {
            tracing::info!("{subdir} writing repodata shards");
            shards::write_shards(
                &self.output_root.join(&subdir),
                &subdir,
                &repodata,
                base_url.as_deref(),
                self.config.shards_base_url.as_deref(),
            )?;
        }

        if self.config.write_html {
            tracing::debug!("{subdir} writing index.html");
            let extra_files = self.extra_listing_files(&subdir);
            let page = html::render_subdir_index(
                &self.channel_name,
                &subdir,
                &repodata,
                extra_files,
                self.config.html_popups,
                chrono::Utc::now(),
            )?;
            self.write_document(&subdir, "index.html", page.as_bytes())?;
        }

        Ok(())
    }

    /// Repodata documents listed at the top of a subdir's `index.html`.
    fn extra_listing_files(&self, subdir: &str) -> Vec<html::FileRowSource> {
        let mut names = vec![
            REPODATA_JSON_FN.to_string(),
            REPODATA_FROM_PKGS_JSON_FN.to_string(),
            CURRENT_REPODATA_JSON_FN.to_string(),
            RUN_EXPORTS_JSON_FN.to_string(),
            PATCH_INSTRUCTIONS_FN.to_string(),
        ];
        if self.config.write_bz2 {
            names.push(format!("{REPODATA_JSON_FN}.bz2"));
        }
        if self.config.write_zst {
            names.push(format!("{REPODATA_JSON_FN}.zst"));
        }
        names
            .iter()
            .filter_map(|name| html::stat_extra_file(&self.output_root.join(subdir).join(name)))
            .collect()
    }

    /// Serialize a repodata-shaped document and write it with its optional
    /// compressed sidecars.
    fn write_repodata_document<T: serde::Serialize>(
        &self,
        subdir: &str,
        document: &T,
        filename: &str,
    ) -> Result<()> {
        let mut content = if self.config.compact_json {
            serde_json::to_vec(document)?
        } else {
            serde_json::to_vec_pretty(document)?
        };
        content.push(b'\n');
        self.write_document(subdir, filename, &content)?;

        let bz2_path = self.output_root.join(subdir).join(format!("{filename}.bz2"));
        if self.config.write_bz2 {
            let mut encoder =
                bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
            encoder.write_all(&content)?;
            utils::write_atomic(&bz2_path, &encoder.finish()?)?;
        } else {
            utils::remove_if_exists(&bz2_path)?;
        }

        let zst_path = self.output_root.join(subdir).join(format!("{filename}.zst"));
        if self.config.write_zst {
            let compressed = zstd::stream::encode_all(&content[..], ZSTD_COMPRESS_LEVEL)?;
            utils::write_atomic(&zst_path, &compressed)?;
        } else {
            utils::remove_if_exists(&zst_path)?;
        }
        Ok(())
    }

    fn write_document(&self, subdir: &str, filename: &str, content: &[u8]) -> Result<()> {
        let path = self.output_root.join(subdir).join(filename);
        tracing::debug!("write {}", path.display());
        utils::write_atomic(&path, content)?;
        Ok(())
    }

    /// Rebuild `channeldata.json` (and the channel HTML/RSS) from the
    /// emitted repodata plus cached metadata. Called by [`index`] when
    /// enabled; also usable on its own.
    ///
    /// [`index`]: ChannelIndex::index
    pub fn update_channeldata(&self, subdirs: &[String]) -> Result<()> {
        let channeldata_path = self.output_root.join(CHANNELDATA_JSON_FN);
        let mut channel_data: ChannelData = fs_err::read(&channeldata_path)
            .ok()
            .and_then(|data| serde_json::from_slice(&data).ok())
            .unwrap_or_default();

        for subdir in subdirs {
            tracing::info!("channeldata subdir: {subdir}");
            let repodata_path = self.output_root.join(subdir).join(REPODATA_JSON_FN);
            let repodata: RepoData = match fs_err::read(&repodata_path) {
                Ok(data) => serde_json::from_slice(&data)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            let mut cache = cache::open(
                &self.config.channel_root,
                subdir,
                &self.config.backend,
                &self.config.upstream_stage,
            )?;
            let rows: FxHashMap<String, cache::ChanneldataRow> = cache
                .channeldata_inputs()?
                .into_iter()
                .map(|row| (row.path.clone(), row))
                .collect();

            channeldata::update_channeldata(&mut channel_data, subdir, &repodata, &rows);
        }

        let mut content = if self.config.compact_json {
            serde_json::to_vec(&channel_data)?
        } else {
            serde_json::to_vec_pretty(&channel_data)?
        };
        content.push(b'\n');
        utils::write_atomic(&channeldata_path, &content)?;

        if self.config.write_html {
            let page =
                html::render_channel_index(&self.channel_name, &channel_data, chrono::Utc::now())?;
            utils::write_atomic(&self.output_root.join("index.html"), page.as_bytes())?;
        }
        if self.config.write_rss {
            let feed = rss::render_rss(&self.channel_name, &channel_data, chrono::Utc::now());
            utils::write_atomic(&self.output_root.join("rss.xml"), feed.as_bytes())?;
        }
        Ok(())
    }
}

/// `{info: {subdir}, packages: {...}, "packages.conda": {...}}` mapping
/// basename to its parsed run_exports.
fn build_run_exports_doc(subdir: &str, cache: &mut dyn PackageCache) -> Result<RunExportsDoc> {
    let mut doc = RunExportsDoc {
        info: ChannelInfo {
            subdir: subdir.to_string(),
            base_url: None,
        },
        packages: FxHashMap::default(),
        conda_packages: FxHashMap::default(),
    };
    for (path, data) in cache.run_exports()? {
        let parsed: serde_json::Value = match serde_json::from_slice(&data) {
            Ok(parsed) => parsed,
            Err(_) => continue,
        };
        if parsed.as_object().is_none_or(|map| map.is_empty()) {
            continue;
        }
        match archive::ArchiveType::try_from(&path) {
            Some(archive::ArchiveType::Conda) => {
                doc.conda_packages.insert(path, parsed);
            }
            Some(archive::ArchiveType::TarBz2) => {
                doc.packages.insert(path, parsed);
            }
            None => {}
        }
    }
    Ok(doc)
}

/// Shape of `run_exports.json`.
#[derive(Debug, serde::Serialize)]
struct RunExportsDoc {
    info: ChannelInfo,
    #[serde(serialize_with = "repodata::sort_map_alphabetically")]
    packages: FxHashMap<String, serde_json::Value>,
    #[serde(
        rename = "packages.conda",
        serialize_with = "repodata::sort_map_alphabetically"
    )]
    conda_packages: FxHashMap<String, serde_json::Value>,
}
