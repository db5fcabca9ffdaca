//! Turn one package archive into cache payload rows.
//!
//! The extractor pulls metadata members through the streaming reader, cleans
//! up the `index.json` document, derives `post_install` from `paths.json`,
//! and computes the archive's digests from the same open file.

use std::io::{Seek, SeekFrom};
use std::path::Path;

use serde_json::{Map, Value};

use crate::archive::{self, ICON_PATH, INDEX_JSON_PATH, PATHS_JSON_PATH, RECIPE_PATHS};
use crate::cache::PackagePayload;
use crate::checksum::{self, Md5Bytes, Sha256Bytes};
use crate::error::{Error, Result};

/// `index.json` keys that never belong in repodata records.
const FILTER_FIELDS: [&str; 10] = [
    "arch",
    "has_prefix",
    "mtime",
    "platform",
    "ucs",
    "requires_features",
    "binstar",
    "target-triplet",
    "machine",
    "operatingsystem",
];

/// Cache payload plus the digests computed over the archive bytes.
#[derive(Debug)]
pub struct ExtractedPackage {
    pub payload: PackagePayload,
    pub sha256: Sha256Bytes,
    pub md5: Md5Bytes,
    pub size: u64,
}

/// Extract the metadata of the archive at `archive_path`.
///
/// Fails only when the archive cannot be opened or its `index.json` is
/// missing or malformed; corrupt secondary members degrade to empty
/// payloads so the package still indexes.
pub fn extract_package(archive_path: &Path) -> Result<ExtractedPackage> {
    let mut file = fs_err::File::open(archive_path)?;
    let mut members = archive::read_metadata(archive_path, &mut file)?;

    file.seek(SeekFrom::Start(0))?;
    let (md5, sha256, size) = checksum::stream_digests(&mut file)?;

    let mut index_json: Map<String, Value> = members
        .remove(INDEX_JSON_PATH)
        .ok_or_else(|| Error::MissingIndexJson {
            path: archive_path.to_path_buf(),
        })
        .and_then(|data| {
            serde_json::from_slice(&data).map_err(|e| Error::ArchiveFormat {
                path: archive_path.to_path_buf(),
                reason: format!("invalid index.json: {e}"),
            })
        })?;

    for field in FILTER_FIELDS {
        index_json.remove(field);
    }
    normalize_integer(&mut index_json, "timestamp");
    index_json.insert("md5".to_string(), Value::String(md5.to_string()));
    index_json.insert("sha256".to_string(), Value::String(sha256.to_string()));
    index_json.insert("size".to_string(), Value::from(size));

    let recipe = RECIPE_PATHS
        .iter()
        .find_map(|path| members.remove(*path))
        .and_then(|data| match recipe_to_json(&data) {
            Ok(json) => Some(json),
            Err(e) => {
                tracing::debug!("{}: unusable recipe: {e}", archive_path.display());
                None
            }
        });

    let paths_json = members.remove(PATHS_JSON_PATH);
    let post_install = post_install_details(paths_json.as_deref());

    let payload = PackagePayload {
        index_json: serde_json::to_vec(&index_json)?,
        about: members
            .remove(archive::ABOUT_JSON_PATH)
            .map(valid_json_or_empty),
        recipe,
        recipe_log: members
            .remove(archive::RECIPE_LOG_PATH)
            .map(valid_json_or_empty),
        run_exports: members
            .remove(archive::RUN_EXPORTS_PATH)
            .map(valid_json_or_empty),
        post_install: Some(serde_json::to_vec(&post_install)?),
        icon: members.remove(ICON_PATH),
    };

    Ok(ExtractedPackage {
        payload,
        sha256,
        md5,
        size,
    })
}

/// Some build tools wrote fractional timestamps; records carry integers.
fn normalize_integer(map: &mut Map<String, Value>, key: &str) {
    let Some(float) = map.get(key).and_then(Value::as_f64) else {
        return;
    };
    let already_integer = map.get(key).and_then(Value::as_u64).is_some();
    if !already_integer && float.is_finite() && float >= 0.0 {
        map.insert(key.to_string(), Value::from(float as u64));
    }
}

/// Pass malformed JSON members through as the empty document instead of
/// failing the package.
fn valid_json_or_empty(data: Vec<u8>) -> Vec<u8> {
    match serde_json::from_slice::<Value>(&data) {
        Ok(_) => data,
        Err(_) => b"{}".to_vec(),
    }
}

/// Recipes ship as YAML; the cache stores rendered JSON.
fn recipe_to_json(data: &[u8]) -> Result<Vec<u8>> {
    let value: serde_yaml::Value = serde_yaml::from_slice(data)
        .map_err(|e| Error::CacheFormat(format!("recipe yaml: {e}")))?;
    let json = serde_json::to_value(value)
        .map_err(|e| Error::CacheFormat(format!("recipe yaml to json: {e}")))?;
    Ok(serde_json::to_vec(&json)?)
}

/// What `paths.json` tells us about post-install behavior. `paths.json`
/// itself is not cached.
#[derive(Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PostInstallDetails {
    pub binary_prefix: bool,
    pub text_prefix: bool,
    #[serde(rename = "activate.d")]
    pub activate_d: bool,
    #[serde(rename = "deactivate.d")]
    pub deactivate_d: bool,
    pub pre_link: bool,
    pub post_link: bool,
    pub pre_unlink: bool,
}

fn post_install_details(paths_json: Option<&[u8]>) -> PostInstallDetails {
    let mut details = PostInstallDetails::default();
    let Some(data) = paths_json else {
        return details;
    };
    let Ok(parsed) = serde_json::from_slice::<Value>(data) else {
        return details;
    };
    let paths = parsed
        .get("paths")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for entry in &paths {
        let path = entry.get("_path").and_then(Value::as_str).unwrap_or("");
        if entry
            .get("prefix_placeholder")
            .is_some_and(|placeholder| !placeholder.is_null())
        {
            match entry.get("file_mode").and_then(Value::as_str) {
                Some("binary") => details.binary_prefix = true,
                Some("text") => details.text_prefix = true,
                _ => {}
            }
        }
        if path.starts_with("etc/conda/activate.d") {
            details.activate_d = true;
        }
        if path.starts_with("etc/conda/deactivate.d") {
            details.deactivate_d = true;
        }
        details.pre_link |= is_link_script(path, "pre-link");
        details.post_link |= is_link_script(path, "post-link");
        details.pre_unlink |= is_link_script(path, "pre-unlink");
    }
    details
}

/// Matches `*/.*-pre-link.*` and friends: a hidden file in some directory
/// whose name carries the link-script tag.
fn is_link_script(path: &str, tag: &str) -> bool {
    let Some((_, basename)) = path.rsplit_once('/') else {
        return false;
    };
    basename.starts_with('.') && basename.contains(&format!("-{tag}."))
}
