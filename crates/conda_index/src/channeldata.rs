//! Aggregate per-package-name summaries across all subdirs into
//! `channeldata.json`.

use std::collections::{BTreeMap, BTreeSet};

use fxhash::FxHashMap;
use md5::Md5;
use digest::Digest;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;

use crate::cache::ChanneldataRow;
use crate::repodata::{sort_map_alphabetically, PackageRecord, RepoData};
use crate::version::Version;

pub const CHANNELDATA_VERSION: u64 = 1;

/// Index of subdirectories and per-name package summaries for a channel.
#[derive(Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ChannelData {
    pub channeldata_version: u64,

    #[serde(default, serialize_with = "sort_map_alphabetically")]
    pub packages: FxHashMap<String, ChannelDataPackage>,

    #[serde(default)]
    pub subdirs: BTreeSet<String>,
}

/// Summary of one package name across every subdir it appears in.
#[skip_serializing_none]
#[derive(Debug, Default, Deserialize, Serialize, PartialEq, Clone)]
pub struct ChannelDataPackage {
    /// True if this package has activation scripts.
    #[serde(rename = "activate.d")]
    pub has_activate_scripts: bool,

    /// True if this package has deactivation scripts.
    #[serde(rename = "deactivate.d")]
    pub has_deactivate_scripts: bool,

    /// True if this package contains binary files carrying the build prefix.
    pub binary_prefix: bool,

    /// True if this package contains text files carrying the build prefix.
    pub text_prefix: bool,

    #[serde(rename = "pre_link")]
    pub has_pre_link_scripts: bool,

    #[serde(rename = "post_link")]
    pub has_post_link_scripts: bool,

    #[serde(rename = "pre_unlink")]
    pub has_pre_unlink_scripts: bool,

    pub description: Option<String>,
    pub summary: Option<String>,
    pub home: Option<String>,
    pub license: Option<String>,
    pub dev_url: Option<String>,
    pub doc_url: Option<String>,
    pub doc_source_url: Option<String>,
    pub source_url: Option<String>,
    pub source_git_url: Option<String>,

    /// `md5:<hex>:<bytes>` over the embedded icon.
    pub icon_hash: Option<String>,
    pub icon_url: Option<String>,

    /// External ecosystem identifiers, from the recipe's about section.
    pub identifiers: Option<Value>,
    pub keywords: Option<Value>,
    pub tags: Option<Value>,

    /// One run_exports document per version of the package.
    #[serde(default)]
    pub run_exports: BTreeMap<String, Value>,

    /// Which subdirs carry the package.
    #[serde(default)]
    pub subdirs: BTreeSet<String>,

    /// Latest update time across builds, in whole seconds.
    pub timestamp: Option<u64>,

    /// Latest version.
    pub version: Option<String>,
}

/// Timestamps in package metadata are sometimes milliseconds.
pub fn make_seconds(timestamp: u64) -> u64 {
    if timestamp > 253_402_300_799 {
        // 9999-12-31
        timestamp / 1000
    } else {
        timestamp
    }
}

/// Fields of interest out of one archive's cached metadata.
#[derive(Debug, Default)]
struct SourceDoc {
    description: Option<String>,
    summary: Option<String>,
    home: Option<String>,
    license: Option<String>,
    dev_url: Option<String>,
    doc_url: Option<String>,
    doc_source_url: Option<String>,
    source_url: Option<String>,
    source_git_url: Option<String>,
    identifiers: Option<Value>,
    keywords: Option<Value>,
    tags: Option<Value>,
    icon_url: Option<String>,
    icon_hash: Option<String>,
    post_install: Option<crate::extract::PostInstallDetails>,
    run_exports: Option<Value>,
}

fn string_or_first(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(items) => items
            .iter()
            .find_map(|item| item.as_str().map(str::to_string)),
        _ => None,
    }
}

fn squash_newlines(text: String) -> String {
    text.trim().replace('\n', " ")
}

fn load_source_doc(row: &ChanneldataRow) -> SourceDoc {
    let mut doc = SourceDoc::default();

    if let Some(about) = row
        .about
        .as_deref()
        .and_then(|data| serde_json::from_slice::<Value>(data).ok())
    {
        doc.description = string_or_first(about.get("description")).map(squash_newlines);
        doc.summary = string_or_first(about.get("summary")).map(squash_newlines);
        doc.home = string_or_first(about.get("home"));
        doc.license = string_or_first(about.get("license"));
        doc.dev_url = string_or_first(about.get("dev_url"));
        doc.doc_url = string_or_first(about.get("doc_url"));
        doc.doc_source_url = string_or_first(about.get("doc_source_url"));
        doc.icon_url = string_or_first(about.get("icon_url"));
        doc.identifiers = about.get("identifiers").cloned().filter(|v| !v.is_null());
        doc.keywords = about.get("keywords").cloned().filter(|v| !v.is_null());
        doc.tags = about.get("tags").cloned().filter(|v| !v.is_null());
    }

    if let Some(recipe) = row
        .recipe
        .as_deref()
        .and_then(|data| serde_json::from_slice::<Value>(data).ok())
    {
        // source may be a single table or a list of them
        let source = match recipe.get("source") {
            Some(Value::Array(sources)) => sources.first().cloned(),
            Some(source) => Some(source.clone()),
            None => None,
        };
        if let Some(source) = source {
            doc.source_url = string_or_first(source.get("url"));
            doc.source_git_url = string_or_first(source.get("git_url"));
        }
    }

    doc.post_install = row
        .post_install
        .as_deref()
        .and_then(|data| serde_json::from_slice(data).ok());

    doc.run_exports = row
        .run_exports
        .as_deref()
        .and_then(|data| serde_json::from_slice::<Value>(data).ok())
        .filter(|value| value.as_object().is_some_and(|map| !map.is_empty()));

    if let Some(icon) = &row.icon {
        let mut hasher = Md5::new();
        hasher.update(icon);
        doc.icon_hash = Some(format!(
            "md5:{}:{}",
            hex::encode(hasher.finalize()),
            icon.len()
        ));
    }

    doc
}

/// Fold one subdir's patched repodata into the channeldata accumulator.
pub fn update_channeldata(
    channel_data: &mut ChannelData,
    subdir: &str,
    repodata: &RepoData,
    rows: &FxHashMap<String, ChanneldataRow>,
) {
    channel_data.channeldata_version = CHANNELDATA_VERSION;
    channel_data.subdirs.insert(subdir.to_string());

    // prefer .conda over its .tar.bz2 twin
    let mut all: FxHashMap<&str, (&str, &PackageRecord)> = FxHashMap::default();
    for (filename, record) in &repodata.packages {
        let twin = filename.replace(".tar.bz2", ".conda");
        if !repodata.conda_packages.contains_key(&twin) {
            all.insert(filename.as_str(), (filename.as_str(), record));
        }
    }
    for (filename, record) in &repodata.conda_packages {
        all.insert(filename.as_str(), (filename.as_str(), record));
    }

    // newest build per (name, version); channeldata keeps one run_exports
    // entry per version
    let mut newest: BTreeMap<(String, String), (&str, &PackageRecord)> = BTreeMap::new();
    for &(filename, record) in all.values() {
        let key = (record.name.clone(), record.version.to_string());
        let timestamp = record.timestamp.unwrap_or(0);
        match newest.get(&key) {
            Some((_, existing)) if existing.timestamp.unwrap_or(0) >= timestamp => {}
            _ => {
                newest.insert(key, (filename, record));
            }
        }
    }

    for ((name, version), (filename, record)) in &newest {
        let record_seconds = make_seconds(record.timestamp.unwrap_or(0));
        if let Some(existing) = channel_data.packages.get(name) {
            let known_subdir = existing.subdirs.contains(subdir);
            let known_version = existing.run_exports.is_empty()
                || existing.run_exports.contains_key(version);
            let newer = existing.timestamp.unwrap_or(0) < record_seconds;
            if known_subdir && known_version && !newer {
                continue;
            }
        }

        let doc = rows.get(*filename).map(load_source_doc).unwrap_or_default();
        let entry = channel_data.packages.entry(name.clone()).or_default();

        let data_newer = match &entry.version {
            Some(existing) => {
                let existing = Version::parse(existing);
                let incoming = Version::parse(version);
                incoming > existing
                    || (incoming == existing
                        && entry.timestamp.unwrap_or(0) < record_seconds)
            }
            None => true,
        };

        fn keep_newer<T: Clone>(slot: &mut Option<T>, incoming: Option<T>, data_newer: bool) {
            if incoming.is_some() && (data_newer || slot.is_none()) {
                *slot = incoming;
            }
        }

        keep_newer(&mut entry.description, doc.description, data_newer);
        keep_newer(&mut entry.summary, doc.summary, data_newer);
        keep_newer(&mut entry.home, doc.home, data_newer);
        keep_newer(&mut entry.license, doc.license, data_newer);
        keep_newer(&mut entry.dev_url, doc.dev_url, data_newer);
        keep_newer(&mut entry.doc_url, doc.doc_url, data_newer);
        keep_newer(&mut entry.doc_source_url, doc.doc_source_url, data_newer);
        keep_newer(&mut entry.source_url, doc.source_url, data_newer);
        keep_newer(&mut entry.source_git_url, doc.source_git_url, data_newer);
        keep_newer(&mut entry.icon_url, doc.icon_url, data_newer);
        keep_newer(&mut entry.icon_hash, doc.icon_hash, data_newer);
        keep_newer(&mut entry.identifiers, doc.identifiers, data_newer);
        keep_newer(&mut entry.keywords, doc.keywords, data_newer);
        keep_newer(&mut entry.tags, doc.tags, data_newer);
        if data_newer {
            entry.version = Some(version.clone());
        }

        // post-install traits are true if any build anywhere has them
        if let Some(post_install) = &doc.post_install {
            entry.binary_prefix |= post_install.binary_prefix;
            entry.text_prefix |= post_install.text_prefix;
            entry.has_activate_scripts |= post_install.activate_d;
            entry.has_deactivate_scripts |= post_install.deactivate_d;
            entry.has_pre_link_scripts |= post_install.pre_link;
            entry.has_post_link_scripts |= post_install.post_link;
            entry.has_pre_unlink_scripts |= post_install.pre_unlink;
        }

        if let Some(run_exports) = doc.run_exports {
            entry.run_exports.insert(version.clone(), run_exports);
        }

        entry.subdirs.insert(subdir.to_string());
        entry.timestamp = Some(make_seconds(
            entry.timestamp.unwrap_or(0).max(record_seconds),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, version: &str, timestamp: u64) -> PackageRecord {
        serde_json::from_value(serde_json::json!({
            "build": "0",
            "build_number": 0,
            "name": name,
            "version": version,
            "timestamp": timestamp,
        }))
        .unwrap()
    }

    fn row(path: &str, about: Value, run_exports: Option<Value>) -> (String, ChanneldataRow) {
        (
            path.to_string(),
            ChanneldataRow {
                path: path.to_string(),
                index_json: b"{}".to_vec(),
                about: Some(serde_json::to_vec(&about).unwrap()),
                recipe: None,
                post_install: None,
                run_exports: run_exports.map(|v| serde_json::to_vec(&v).unwrap()),
                icon: None,
            },
        )
    }

    #[test]
    fn test_aggregates_latest_version() {
        let mut repodata = RepoData::default();
        repodata
            .conda_packages
            .insert("a-1.0-0.conda".to_string(), record("a", "1.0", 100));
        repodata
            .conda_packages
            .insert("a-2.0-0.conda".to_string(), record("a", "2.0", 200));

        let rows: FxHashMap<String, ChanneldataRow> = [
            row(
                "a-1.0-0.conda",
                serde_json::json!({"summary": "old", "home": "https://a.test"}),
                Some(serde_json::json!({"weak": ["a"]})),
            ),
            row(
                "a-2.0-0.conda",
                serde_json::json!({"summary": "new"}),
                None,
            ),
        ]
        .into_iter()
        .collect();

        let mut channel_data = ChannelData::default();
        update_channeldata(&mut channel_data, "linux-64", &repodata, &rows);

        let entry = &channel_data.packages["a"];
        assert_eq!(entry.version.as_deref(), Some("2.0"));
        assert_eq!(entry.summary.as_deref(), Some("new"));
        // older build contributed what the newest lacked
        assert_eq!(entry.home.as_deref(), Some("https://a.test"));
        // run_exports recorded per version
        assert!(entry.run_exports.contains_key("1.0"));
        assert_eq!(entry.timestamp, Some(200));
        assert!(entry.subdirs.contains("linux-64"));
        assert!(channel_data.subdirs.contains("linux-64"));
    }

    #[test]
    fn test_subdirs_accumulate() {
        let mut repodata = RepoData::default();
        repodata
            .conda_packages
            .insert("a-1.0-0.conda".to_string(), record("a", "1.0", 100));
        let rows = FxHashMap::default();

        let mut channel_data = ChannelData::default();
        update_channeldata(&mut channel_data, "linux-64", &repodata, &rows);
        update_channeldata(&mut channel_data, "osx-64", &repodata, &rows);
        let subdirs: Vec<_> = channel_data.packages["a"].subdirs.iter().collect();
        assert_eq!(subdirs, ["linux-64", "osx-64"]);
    }

    #[test]
    fn test_make_seconds() {
        assert_eq!(make_seconds(1_633_770_400), 1_633_770_400);
        assert_eq!(make_seconds(1_633_770_400_000), 1_633_770_400);
    }
}
