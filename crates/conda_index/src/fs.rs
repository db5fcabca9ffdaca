//! The probe that decides which archives a subdir offers.
//!
//! The default lists the local directory; replace it to index a remote
//! object store or to feed paths in manually. Whatever the source, every
//! path that should be considered for emission must come through here so it
//! lands in the cache's `fs` stage.

use std::path::Path;
use std::time::UNIX_EPOCH;

use crate::archive::ArchiveType;
use crate::cache::FsEntry;
use crate::error::Result;

/// Lists a subdir's package archives with their change-detection
/// fingerprints.
pub trait SubdirProbe: Send + Sync {
    fn list_subdir(&self, subdir_path: &Path) -> Result<Vec<FsEntry>>;
}

/// Probe a local channel directory.
#[derive(Debug, Default)]
pub struct LocalFs;

impl SubdirProbe for LocalFs {
    fn list_subdir(&self, subdir_path: &Path) -> Result<Vec<FsEntry>> {
        let mut entries = Vec::new();
        for entry in fs_err::read_dir(subdir_path)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            // skips hidden files, .cache, and non-archives such as
            // repodata.json and index.html in one test
            if file_name.starts_with('.') || ArchiveType::try_from(&file_name).is_none() {
                continue;
            }
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            entries.push(FsEntry {
                path: file_name,
                mtime: mtime_seconds(&metadata),
                size: metadata.len(),
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }
}

/// Modification time as whole seconds since the epoch. Sub-second precision
/// varies per filesystem, so comparisons use the coarser unit.
fn mtime_seconds(metadata: &std::fs::Metadata) -> i64 {
    match metadata.modified() {
        Ok(modified) => match modified.duration_since(UNIX_EPOCH) {
            Ok(duration) => duration.as_secs() as i64,
            Err(before_epoch) => -(before_epoch.duration().as_secs() as i64),
        },
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_subdir_filters_non_archives() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a-1.0-0.conda"), b"x").unwrap();
        std::fs::write(dir.path().join("b-1.0-0.tar.bz2"), b"xy").unwrap();
        std::fs::write(dir.path().join("repodata.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("index.html"), b"<html>").unwrap();
        std::fs::write(dir.path().join(".hidden.conda"), b"z").unwrap();
        std::fs::create_dir(dir.path().join(".cache")).unwrap();

        let entries = LocalFs.list_subdir(dir.path()).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(names, ["a-1.0-0.conda", "b-1.0-0.tar.bz2"]);
        assert_eq!(entries[1].size, 2);
        assert!(entries[0].mtime > 0);
    }
}
