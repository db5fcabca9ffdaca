//! Repodata patching.
//!
//! A patch generator inspects the pre-patch repodata of a subdir and hands
//! back instructions: per-record field overrides, removals and revocations.
//! Generators are data-in/data-out; loading one from a hotfix package
//! archive is provided here, anything fancier lives with the caller.

use std::collections::BTreeMap;
use std::path::PathBuf;

use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, skip_serializing_none, OneOrMany};

use crate::archive;
use crate::error::{Error, Result};
use crate::repodata::RepoData;

/// Highest `patch_instructions_version` this build understands.
pub const PATCH_INSTRUCTIONS_VERSION: u64 = 1;

/// Field overrides for a single package record. `features`, `license` and
/// `license_family` distinguish "absent from the patch" from "patched to
/// null" with a double option.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Default, Deserialize, Serialize, PartialEq, Clone)]
pub struct PackageRecordPatch {
    /// Replacement dependency list.
    pub depends: Option<Vec<String>>,

    /// Replacement constrains list.
    pub constrains: Option<Vec<String>>,

    /// Replacement track_features.
    #[serde_as(as = "Option<OneOrMany<_>>")]
    pub track_features: Option<Vec<String>>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub features: Option<Option<String>>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub license: Option<Option<String>>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub license_family: Option<Option<String>>,

    /// Any other patched fields, merged into the record's extras verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Patch instructions for a single subdirectory.
#[derive(Debug, Default, Deserialize, Serialize, PartialEq, Clone)]
pub struct PatchInstructions {
    #[serde(default)]
    pub patch_instructions_version: u64,

    /// Patches for `.tar.bz2` records.
    #[serde(default)]
    pub packages: FxHashMap<String, PackageRecordPatch>,

    /// Patches for `.conda` records.
    #[serde(default, rename = "packages.conda")]
    pub conda_packages: FxHashMap<String, PackageRecordPatch>,

    /// Filenames to move into `removed`.
    #[serde(default)]
    pub remove: Vec<String>,

    /// Filenames to revoke: they stay listed but grow an unsatisfiable
    /// dependency.
    #[serde(default)]
    pub revoke: Vec<String>,
}

/// Produces patch instructions for one subdir given its pre-patch repodata.
///
/// `Sync` because subdirs are patched concurrently from the assembler pool.
pub trait PatchGenerator: Sync {
    fn instructions(&self, subdir: &str, repodata: &RepoData) -> Result<PatchInstructions>;
}

impl<F> PatchGenerator for F
where
    F: Fn(&str, &RepoData) -> Result<PatchInstructions> + Sync,
{
    fn instructions(&self, subdir: &str, repodata: &RepoData) -> Result<PatchInstructions> {
        self(subdir, repodata)
    }
}

/// Reads `{subdir}/patch_instructions.json` out of a hotfix package archive
/// (`.conda` or `.tar.bz2`).
pub struct ArchivePatchGenerator {
    path: PathBuf,
}

impl ArchivePatchGenerator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ArchivePatchGenerator { path: path.into() }
    }
}

impl PatchGenerator for ArchivePatchGenerator {
    fn instructions(&self, subdir: &str, _repodata: &RepoData) -> Result<PatchInstructions> {
        let member = format!("{subdir}/patch_instructions.json");
        let mut file = fs_err::File::open(&self.path)?;
        match archive::read_payload_member(&self.path, &mut file, &member)? {
            Some(data) => Ok(serde_json::from_slice(&data)
                .map_err(|e| Error::PatchMalformed(format!("{member}: {e}")))?),
            None => Ok(PatchInstructions::default()),
        }
    }
}

/// Apply `instructions` to `repodata` in place.
///
/// A fix filed against a `.tar.bz2` name also applies to the `.conda`
/// sibling, on the assumption that both carry the same content; an explicit
/// `.conda` fix wins over the derived one.
pub fn apply_instructions(repodata: &mut RepoData, instructions: &PatchInstructions) -> Result<()> {
    if instructions.patch_instructions_version > PATCH_INSTRUCTIONS_VERSION {
        return Err(Error::PatchInstructionsVersion(
            instructions.patch_instructions_version,
        ));
    }

    for (filename, patch) in &instructions.packages {
        if let Some(record) = repodata.packages.get_mut(filename) {
            apply_record_patch(record, patch);
        }
        let conda_name = conda_counterpart(filename);
        if !instructions.conda_packages.contains_key(&conda_name) {
            if let Some(record) = repodata.conda_packages.get_mut(&conda_name) {
                apply_record_patch(record, patch);
            }
        }
    }
    for (filename, patch) in &instructions.conda_packages {
        if let Some(record) = repodata.conda_packages.get_mut(filename) {
            apply_record_patch(record, patch);
        }
    }

    for filename in &instructions.revoke {
        for name in with_conda_counterpart(filename) {
            let record = repodata
                .packages
                .get_mut(&name)
                .or_else(|| repodata.conda_packages.get_mut(&name));
            if let Some(record) = record {
                record.revoked = Some(true);
                record
                    .depends
                    .push("package_has_been_revoked".to_string());
            }
        }
    }

    for filename in &instructions.remove {
        for name in with_conda_counterpart(filename) {
            if repodata.packages.remove(&name).is_some()
                || repodata.conda_packages.remove(&name).is_some()
            {
                repodata.removed.insert(name);
            }
        }
    }

    Ok(())
}

fn conda_counterpart(filename: &str) -> String {
    match filename.strip_suffix(".tar.bz2") {
        Some(stem) => format!("{stem}.conda"),
        None => filename.to_string(),
    }
}

/// The filename itself plus, for `.tar.bz2`, its `.conda` sibling.
fn with_conda_counterpart(filename: &str) -> Vec<String> {
    let counterpart = conda_counterpart(filename);
    if counterpart == filename {
        vec![counterpart]
    } else {
        vec![filename.to_string(), counterpart]
    }
}

fn apply_record_patch(record: &mut crate::repodata::PackageRecord, patch: &PackageRecordPatch) {
    if let Some(depends) = &patch.depends {
        record.depends = depends.clone();
    }
    if let Some(constrains) = &patch.constrains {
        record.constrains = constrains.clone();
    }
    if let Some(track_features) = &patch.track_features {
        record.track_features = Some(track_features.clone());
    }
    if let Some(features) = &patch.features {
        record.features = features.clone();
    }
    if let Some(license) = &patch.license {
        record.license = license.clone();
    }
    if let Some(license_family) = &patch.license_family {
        record.license_family = license_family.clone();
    }
    for (key, value) in &patch.extra {
        record.extra.insert(key.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repodata::PackageRecord;

    fn repodata_with(filenames: &[&str]) -> RepoData {
        let mut repodata = RepoData::default();
        for filename in filenames {
            let record: PackageRecord = serde_json::from_str(
                r#"{"build": "0", "build_number": 0, "depends": ["zlib"],
                    "name": "a", "version": "1.0", "license": "MIT"}"#,
            )
            .unwrap();
            if filename.ends_with(".conda") {
                repodata.conda_packages.insert(filename.to_string(), record);
            } else {
                repodata.packages.insert(filename.to_string(), record);
            }
        }
        repodata
    }

    fn parse_instructions(json: &str) -> PatchInstructions {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_field_patch_replaces_lists_and_scalars() {
        let mut repodata = repodata_with(&["a-1.0-0.conda"]);
        let instructions = parse_instructions(
            r#"{
                "patch_instructions_version": 1,
                "packages.conda": {
                    "a-1.0-0.conda": {
                        "depends": ["zlib >=1.2"],
                        "license": null,
                        "custom_field": 7
                    }
                }
            }"#,
        );
        apply_instructions(&mut repodata, &instructions).unwrap();
        let record = &repodata.conda_packages["a-1.0-0.conda"];
        assert_eq!(record.depends, ["zlib >=1.2"]);
        assert_eq!(record.license, None);
        assert_eq!(record.extra["custom_field"], 7);
    }

    #[test]
    fn test_bz2_patch_reaches_conda_sibling() {
        let mut repodata = repodata_with(&["a-1.0-0.tar.bz2", "a-1.0-0.conda"]);
        let instructions = parse_instructions(
            r#"{"packages": {"a-1.0-0.tar.bz2": {"depends": ["patched"]}}}"#,
        );
        apply_instructions(&mut repodata, &instructions).unwrap();
        assert_eq!(repodata.packages["a-1.0-0.tar.bz2"].depends, ["patched"]);
        assert_eq!(repodata.conda_packages["a-1.0-0.conda"].depends, ["patched"]);
    }

    #[test]
    fn test_remove_moves_to_removed() {
        let mut repodata = repodata_with(&["a-1.0-0.conda", "b-1.0-0.conda"]);
        let instructions = parse_instructions(r#"{"remove": ["a-1.0-0.conda"]}"#);
        apply_instructions(&mut repodata, &instructions).unwrap();
        assert!(!repodata.conda_packages.contains_key("a-1.0-0.conda"));
        assert!(repodata.removed.contains("a-1.0-0.conda"));
        assert!(repodata.conda_packages.contains_key("b-1.0-0.conda"));
    }

    #[test]
    fn test_revoke_adds_marker_dependency() {
        let mut repodata = repodata_with(&["a-1.0-0.conda"]);
        let instructions = parse_instructions(r#"{"revoke": ["a-1.0-0.conda"]}"#);
        apply_instructions(&mut repodata, &instructions).unwrap();
        let record = &repodata.conda_packages["a-1.0-0.conda"];
        assert_eq!(record.revoked, Some(true));
        assert!(record
            .depends
            .contains(&"package_has_been_revoked".to_string()));
    }

    #[test]
    fn test_future_version_rejected() {
        let mut repodata = repodata_with(&["a-1.0-0.conda"]);
        let instructions = parse_instructions(r#"{"patch_instructions_version": 2}"#);
        assert!(matches!(
            apply_instructions(&mut repodata, &instructions),
            Err(Error::PatchInstructionsVersion(2))
        ));
    }
}
