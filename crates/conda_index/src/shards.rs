//! Sharded repodata: one content-addressed msgpack document per package
//! name, plus a manifest mapping names to shard digests.

use std::collections::BTreeSet;
use std::path::Path;

use digest::Digest;
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::checksum::Sha256Bytes;
use crate::error::Result;
use crate::repodata::{sort_map_alphabetically, PackageRecord, RepoData};
use crate::utils;

pub const SHARDS_INDEX_FN: &str = "repodata_shards.msgpack.zst";

/// The manifest stored as `repodata_shards.msgpack.zst`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ShardedRepodata {
    pub info: ShardedSubdirInfo,
    /// Shard digest per package name; also the shard's filename.
    #[serde(serialize_with = "sort_map_alphabetically")]
    pub shards: FxHashMap<String, Sha256Bytes>,
}

/// Subdir information carried inside the manifest. The URLs are plain empty
/// strings when unconfigured; consumers distinguish "unset" poorly across
/// languages, so null is never written.
#[derive(Debug, Serialize, Deserialize)]
pub struct ShardedSubdirInfo {
    pub subdir: String,
    pub base_url: String,
    pub shards_base_url: String,
}

/// Repodata for a single package name.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Shard {
    #[serde(default, serialize_with = "sort_map_alphabetically")]
    pub packages: FxHashMap<String, PackageRecord>,

    #[serde(
        default,
        rename = "packages.conda",
        serialize_with = "sort_map_alphabetically"
    )]
    pub conda_packages: FxHashMap<String, PackageRecord>,

    #[serde(default)]
    pub removed: BTreeSet<String>,
}

/// Write one shard per package name into `subdir_dir`, then the manifest.
///
/// Shards are written under the hex sha256 of their compressed bytes, so an
/// unchanged shard is never rewritten and interrupted runs leave no
/// misnamed files.
pub fn write_shards(
    subdir_dir: &Path,
    subdir: &str,
    repodata: &RepoData,
    base_url: Option<&str>,
    shards_base_url: Option<&str>,
) -> Result<()> {
    let mut shards: FxHashMap<String, Shard> = FxHashMap::default();
    for (filename, record) in &repodata.packages {
        shards
            .entry(record.name.clone())
            .or_default()
            .packages
            .insert(filename.clone(), record.clone());
    }
    for (filename, record) in &repodata.conda_packages {
        shards
            .entry(record.name.clone())
            .or_default()
            .conda_packages
            .insert(filename.clone(), record.clone());
    }

    let mut index = ShardedRepodata {
        info: ShardedSubdirInfo {
            subdir: subdir.to_string(),
            base_url: base_url.unwrap_or_default().to_string(),
            shards_base_url: shards_base_url.unwrap_or_default().to_string(),
        },
        shards: FxHashMap::default(),
    };

    fs_err::create_dir_all(subdir_dir)?;
    for (name, shard) in &shards {
        let packed = rmp_serde::to_vec_named(shard)?;
        // higher levels are a waste of time for tiny gains on this
        // collection of small objects
        let compressed = zstd::stream::encode_all(packed.as_slice(), 0)?;
        let digest = Sha256Bytes(Sha256::digest(&compressed).into());
        let shard_path = subdir_dir.join(format!("{digest}.msgpack.zst"));
        if !shard_path.exists() {
            utils::write_atomic(&shard_path, &compressed)?;
        }
        index.shards.insert(name.clone(), digest);
    }

    let packed_index = rmp_serde::to_vec_named(&index)?;
    let compressed_index = zstd::stream::encode_all(packed_index.as_slice(), 0)?;
    utils::write_atomic(&subdir_dir.join(SHARDS_INDEX_FN), &compressed_index)?;
    Ok(())
}
