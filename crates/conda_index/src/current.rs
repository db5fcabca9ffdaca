//! Build `current_repodata.json`: the newest build of every package, plus
//! older versions that those builds explicitly pin as dependencies, as a
//! much smaller document for solvers that only care about up-to-date
//! environments.

use std::collections::{BTreeSet, VecDeque};

use fxhash::FxHashMap;

use crate::repodata::{PackageRecord, RepoData};
use crate::version::Version;

/// Requested extra versions to keep, e.g. `python -> ["3.9", "3.10"]`.
/// A pin matches versions that start with it at a component boundary.
pub type VersionPins = FxHashMap<String, Vec<String>>;

struct Candidate<'a> {
    filename: &'a str,
    record: &'a PackageRecord,
    conda: bool,
}

/// Derive the reduced repodata from the patched repodata of one subdir.
pub fn build_current_repodata(repodata: &RepoData, pins: &VersionPins) -> RepoData {
    let mut by_name: FxHashMap<&str, Vec<Candidate<'_>>> = FxHashMap::default();
    let all = repodata
        .packages
        .iter()
        .map(|(filename, record)| (filename, record, false))
        .chain(
            repodata
                .conda_packages
                .iter()
                .map(|(filename, record)| (filename, record, true)),
        );
    for (filename, record, conda) in all {
        by_name.entry(record.name.as_str()).or_default().push(Candidate {
            filename,
            record,
            conda,
        });
    }

    let mut kept: BTreeSet<&str> = BTreeSet::new();
    let mut worklist: VecDeque<&Candidate<'_>> = VecDeque::new();

    // the newest build of every name, with any extra pinned versions
    for candidates in by_name.values() {
        for candidate in newest_builds(candidates, pins.get(&candidates[0].record.name)) {
            if kept.insert(candidate.filename) {
                worklist.push_back(candidate);
            }
        }
    }

    // dependencies on versions that are not the newest pull those versions
    // in too, transitively
    while let Some(candidate) = worklist.pop_front() {
        for spec in &candidate.record.depends {
            let Some((dep_name, Some(dep_version))) = parse_dep(spec) else {
                continue;
            };
            let Some(candidates) = by_name.get(dep_name) else {
                continue;
            };
            let satisfied = candidates.iter().any(|c| {
                kept.contains(c.filename) && c.record.version.starts_with(&dep_version)
            });
            if satisfied {
                continue;
            }
            let best = candidates
                .iter()
                .filter(|c| c.record.version.starts_with(&dep_version))
                .map(|c| c.record.build_triple())
                .max();
            if let Some(best) = best {
                for extra in candidates
                    .iter()
                    .filter(|c| c.record.build_triple() == best)
                {
                    if kept.insert(extra.filename) {
                        worklist.push_back(extra);
                    }
                }
            }
        }
    }

    let mut current = RepoData {
        info: repodata.info.clone(),
        version: repodata.version,
        removed: repodata.removed.clone(),
        ..Default::default()
    };
    for candidates in by_name.values() {
        for candidate in candidates {
            if !kept.contains(candidate.filename) {
                continue;
            }
            let mut record = candidate.record.clone();
            if candidate.conda {
                // carry the md5 of the twin .tar.bz2 to avoid churn for
                // clients that cached the older archive
                let twin = candidate.filename.replace(".conda", ".tar.bz2");
                record.legacy_bz2_md5 =
                    repodata.packages.get(&twin).and_then(|record| record.md5);
                current
                    .conda_packages
                    .insert(candidate.filename.to_string(), record);
            } else {
                current
                    .packages
                    .insert(candidate.filename.to_string(), record);
            }
        }
    }
    current
}

/// Split a dependency spec into its package name and, when the spec pins a
/// plain version (`zlib 1.2` or `zlib ==1.2`, optionally with a build
/// string), that version. Range constraints return `None` for the version.
fn parse_dep(spec: &str) -> Option<(&str, Option<Version>)> {
    let mut parts = spec.split_whitespace();
    let name = parts.next()?;
    if name.starts_with("__") {
        return None;
    }
    let version = parts.next().and_then(|constraint| {
        let plain = constraint.strip_prefix("==").unwrap_or(constraint);
        if plain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '!'))
        {
            Some(Version::parse(plain))
        } else {
            None
        }
    });
    Some((name, version))
}

/// The records carrying the maximum (version, build_number, build) triple,
/// plus, for each pin, the records with the newest pinned version.
fn newest_builds<'c, 'a>(
    candidates: &'c [Candidate<'a>],
    pins: Option<&Vec<String>>,
) -> Vec<&'c Candidate<'a>> {
    let mut kept: Vec<&Candidate<'_>> = Vec::new();
    if let Some(best) = candidates.iter().map(|c| c.record.build_triple()).max() {
        kept.extend(
            candidates
                .iter()
                .filter(|c| c.record.build_triple() == best),
        );
    }
    for pin in pins.into_iter().flatten() {
        let pin = Version::parse(pin);
        let best = candidates
            .iter()
            .filter(|c| c.record.version.starts_with(&pin))
            .map(|c| c.record.build_triple())
            .max();
        if let Some(best) = best {
            let to_add: Vec<_> = candidates
                .iter()
                .filter(|c| {
                    c.record.build_triple() == best
                        && !kept.iter().any(|k| k.filename == c.filename)
                })
                .collect();
            kept.extend(to_add);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, version: &str, build_number: u64, depends: &[&str]) -> PackageRecord {
        serde_json::from_value(serde_json::json!({
            "build": format!("h{build_number}"),
            "build_number": build_number,
            "depends": depends,
            "name": name,
            "version": version,
        }))
        .unwrap()
    }

    fn repodata(records: Vec<(&str, PackageRecord)>) -> RepoData {
        let mut repodata = RepoData::default();
        for (filename, rec) in records {
            if filename.ends_with(".conda") {
                repodata.conda_packages.insert(filename.to_string(), rec);
            } else {
                repodata.packages.insert(filename.to_string(), rec);
            }
        }
        repodata
    }

    #[test]
    fn test_keeps_only_newest_build() {
        let repodata = repodata(vec![
            ("a-1.0-h0.conda", record("a", "1.0", 0, &[])),
            ("a-2.0-h0.conda", record("a", "2.0", 0, &[])),
            ("a-2.0-h1.conda", record("a", "2.0", 1, &[])),
        ]);
        let current = build_current_repodata(&repodata, &VersionPins::default());
        let names: Vec<_> = current.conda_packages.keys().collect();
        assert_eq!(names, ["a-2.0-h1.conda"]);
    }

    #[test]
    fn test_pinned_dependency_pulls_old_version() {
        // a's newest build needs exactly zlib 1.1, which is not the newest
        let repodata = repodata(vec![
            ("a-2.0-h0.conda", record("a", "2.0", 0, &["zlib 1.1"])),
            ("zlib-1.2-h0.conda", record("zlib", "1.2", 0, &[])),
            ("zlib-1.1-h0.conda", record("zlib", "1.1", 0, &[])),
            ("zlib-1.1-h1.conda", record("zlib", "1.1", 1, &[])),
        ]);
        let current = build_current_repodata(&repodata, &VersionPins::default());
        assert!(current.conda_packages.contains_key("a-2.0-h0.conda"));
        assert!(current.conda_packages.contains_key("zlib-1.2-h0.conda"));
        // newest build of the pinned version, not every build
        assert!(current.conda_packages.contains_key("zlib-1.1-h1.conda"));
        assert!(!current.conda_packages.contains_key("zlib-1.1-h0.conda"));
    }

    #[test]
    fn test_range_dependencies_do_not_expand() {
        let repodata = repodata(vec![
            ("a-2.0-h0.conda", record("a", "2.0", 0, &["zlib >=1.1"])),
            ("zlib-1.2-h0.conda", record("zlib", "1.2", 0, &[])),
            ("zlib-1.1-h0.conda", record("zlib", "1.1", 0, &[])),
        ]);
        let current = build_current_repodata(&repodata, &VersionPins::default());
        assert!(current.conda_packages.contains_key("zlib-1.2-h0.conda"));
        assert!(!current.conda_packages.contains_key("zlib-1.1-h0.conda"));
    }

    #[test]
    fn test_pins_keep_extra_versions() {
        let repodata = repodata(vec![
            ("python-3.9.12-h0.conda", record("python", "3.9.12", 0, &[])),
            ("python-3.10.4-h0.conda", record("python", "3.10.4", 0, &[])),
        ]);
        let mut pins = VersionPins::default();
        pins.insert("python".to_string(), vec!["3.9".to_string()]);
        let current = build_current_repodata(&repodata, &pins);
        assert!(current.conda_packages.contains_key("python-3.10.4-h0.conda"));
        assert!(current.conda_packages.contains_key("python-3.9.12-h0.conda"));
    }

    #[test]
    fn test_legacy_md5_carried_from_twin() {
        let mut bz2 = record("a", "1.0", 0, &[]);
        bz2.md5 = Some("19d07b1f2eb7bd8f0c8e967b228f57d2".parse().unwrap());
        let repodata = repodata(vec![
            ("a-1.0-h0.tar.bz2", bz2),
            ("a-1.0-h0.conda", record("a", "1.0", 0, &[])),
        ]);
        let current = build_current_repodata(&repodata, &VersionPins::default());
        assert_eq!(
            current.conda_packages["a-1.0-h0.conda"].legacy_bz2_md5,
            Some("19d07b1f2eb7bd8f0c8e967b228f57d2".parse().unwrap())
        );
    }
}
