//! Defines [`RepoData`], the index of package binaries available in one
//! subdirectory of a channel, and the records it contains.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use fxhash::FxHashMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_with::{serde_as, skip_serializing_none, DisplayFromStr, OneOrMany};

use crate::checksum::{Md5Bytes, Sha256Bytes};
use crate::version::Version;

/// Written as `repodata_version` when `base_url` is not in play.
pub const REPODATA_VERSION: u64 = 1;
/// Written when CEP-15 `base_url` is present.
pub const REPODATA_VERSION_BASE_URL: u64 = 2;

/// An index of the package binaries in a subdirectory of a channel.
// `packages` and `conda_packages` are serialized in a special way, hence no
// blanket key sorting here.
#[derive(Debug, Default, Deserialize, Serialize, PartialEq, Clone)]
pub struct RepoData {
    /// The channel information contained in the repodata.json file
    pub info: Option<ChannelInfo>,

    /// The tar.bz2 packages contained in the repodata.json file
    #[serde(default, serialize_with = "sort_map_alphabetically")]
    pub packages: FxHashMap<String, PackageRecord>,

    /// The conda packages contained in the repodata.json file (under a
    /// different key for backwards compatibility with previous conda
    /// versions)
    #[serde(
        default,
        rename = "packages.conda",
        serialize_with = "sort_map_alphabetically"
    )]
    pub conda_packages: FxHashMap<String, PackageRecord>,

    /// Removed packages; their files may still be present but they are no
    /// longer installable.
    #[serde(default)]
    pub removed: BTreeSet<String>,

    /// The version of the repodata format
    #[serde(rename = "repodata_version")]
    pub version: Option<u64>,
}

/// Information about the subdirectory of the channel.
#[derive(Debug, Deserialize, Serialize, Eq, PartialEq, Clone)]
pub struct ChannelInfo {
    /// The channel's subdirectory
    pub subdir: String,

    /// The `base_url` for all package urls, per CEP-15.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// A single record in repodata: one binary distribution of a package.
///
/// Fields that the patch pipeline or older channels put into records but
/// that this crate does not interpret ride along in `extra`, preserved
/// verbatim.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct PackageRecord {
    /// The build string of the package
    pub build: String,

    /// The build number of the package
    pub build_number: u64,

    /// Additional constraints on packages that are not dependencies: if the
    /// named package is installed at all, it must satisfy these.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constrains: Vec<String>,

    /// Specification of packages this package depends on
    #[serde(default)]
    pub depends: Vec<String>,

    /// Deprecated feature set specifier.
    pub features: Option<String>,

    /// md5 of the `.tar.bz2` counterpart of a `.conda` record, carried in
    /// `current_repodata.json` to avoid churn.
    pub legacy_bz2_md5: Option<Md5Bytes>,

    /// The specific license of the package
    pub license: Option<String>,

    /// The license family
    pub license_family: Option<String>,

    /// md5 of the package archive
    pub md5: Option<Md5Bytes>,

    /// The lowercase name of the package
    pub name: String,

    /// If set, the package is architecture independent in the given way
    /// (`python` or `generic`).
    pub noarch: Option<String>,

    /// Set by a patch revoking this package.
    pub revoked: Option<bool>,

    /// sha256 of the package archive
    pub sha256: Option<Sha256Bytes>,

    /// Size of the package archive in bytes
    pub size: Option<u64>,

    /// The subdirectory where the package can be found
    pub subdir: Option<String>,

    /// The time the package was created, as provided by the build tool.
    /// Often milliseconds, sometimes seconds; normalized only where a
    /// document calls for it.
    pub timestamp: Option<u64>,

    /// Features that downweight the package during solves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[serde_as(as = "Option<OneOrMany<_>>")]
    pub track_features: Option<Vec<String>>,

    /// The version of the package
    #[serde_as(as = "DisplayFromStr")]
    pub version: Version,

    /// Uninterpreted fields, passed through unchanged.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl PackageRecord {
    /// Ordering key for "newest build of a name": version, then
    /// build_number, then build string.
    pub fn build_triple(&self) -> (&Version, u64, &str) {
        (&self.version, self.build_number, self.build.as_str())
    }
}

/// Serialize a map with its keys in alphabetical order so output bytes are a
/// function of content only.
pub fn sort_map_alphabetically<T: Serialize, S: Serializer>(
    value: &FxHashMap<String, T>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    value.iter().collect::<BTreeMap<_, _>>().serialize(serializer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(json: &str) -> PackageRecord {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_record_round_trip_preserves_unknown_fields() {
        let rec = record(
            r#"{
                "build": "0",
                "build_number": 0,
                "depends": ["python >=3.8"],
                "name": "a",
                "version": "1.0",
                "app_entry": "something"
            }"#,
        );
        assert_eq!(rec.extra["app_entry"], "something");
        let out = serde_json::to_value(&rec).unwrap();
        assert_eq!(out["app_entry"], "something");
        // absent optionals stay absent
        assert!(out.get("md5").is_none());
    }

    #[test]
    fn test_repodata_serializes_sorted() {
        let mut repodata = RepoData {
            info: Some(ChannelInfo {
                subdir: "noarch".to_string(),
                base_url: None,
            }),
            version: Some(REPODATA_VERSION),
            ..Default::default()
        };
        for name in ["zlib", "attrs", "mamba"] {
            repodata.conda_packages.insert(
                format!("{name}-1.0-0.conda"),
                record(&format!(
                    r#"{{"build": "0", "build_number": 0, "name": "{name}", "version": "1.0"}}"#
                )),
            );
        }
        let json = serde_json::to_string(&repodata).unwrap();
        let attrs = json.find("attrs-1.0-0.conda").unwrap();
        let mamba = json.find("mamba-1.0-0.conda").unwrap();
        let zlib = json.find("zlib-1.0-0.conda").unwrap();
        assert!(attrs < mamba && mamba < zlib);
        // a removed key is always present, even when empty
        assert!(json.contains("\"removed\":[]"));
    }
}
