//! Streaming access to the metadata members of package archives.
//!
//! Both package formats are read without extracting anything to disk. For
//! `.conda` (a zip holding an `info-*.tar.zst` and a `pkg-*.tar.zst`) only
//! the info tarball is opened; for `.tar.bz2` the outer tarball is streamed
//! through a bzip2 decoder. Reading stops as soon as every wanted member has
//! been seen.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tar::Archive;
use zip::CompressionMethod;

use crate::error::{Error, Result};

pub const INDEX_JSON_PATH: &str = "info/index.json";
pub const ABOUT_JSON_PATH: &str = "info/about.json";
pub const RECIPE_LOG_PATH: &str = "info/recipe_log.json";
pub const RUN_EXPORTS_PATH: &str = "info/run_exports.json";
pub const PATHS_JSON_PATH: &str = "info/paths.json";
pub const ICON_PATH: &str = "info/icon.png";

/// Recipe candidates; the first one encountered in the archive wins.
pub const RECIPE_PATHS: [&str; 3] = [
    "info/recipe/meta.yaml.rendered",
    "info/recipe/meta.yaml",
    "info/meta.yaml",
];

/// Describes the type of a conda package archive.
#[derive(Copy, Clone, Debug, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub enum ArchiveType {
    /// A file with the `.conda` extension.
    Conda,

    /// A file with the `.tar.bz2` extension.
    TarBz2,
}

impl ArchiveType {
    /// Returns the file extension for this archive type.
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveType::Conda => ".conda",
            ArchiveType::TarBz2 => ".tar.bz2",
        }
    }

    /// Tries to determine the type of conda archive from its filename.
    pub fn try_from(path: impl AsRef<Path>) -> Option<ArchiveType> {
        Self::split_str(path.as_ref().to_string_lossy().as_ref())
            .map(|(_, archive_type)| archive_type)
    }

    /// Split the given string into its filename and archive type, removing
    /// the extension. Only recognizes conda package extensions.
    #[allow(clippy::manual_map)]
    pub fn split_str(path: &str) -> Option<(&str, ArchiveType)> {
        if let Some(path) = path.strip_suffix(".conda") {
            Some((path, ArchiveType::Conda))
        } else if let Some(path) = path.strip_suffix(".tar.bz2") {
            Some((path, ArchiveType::TarBz2))
        } else {
            None
        }
    }
}

fn format_error(path: &Path, reason: impl ToString) -> Error {
    Error::ArchiveFormat {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Stream the info section of a `.conda` package as a tar archive.
fn stream_conda_info<'a, R: Read + Seek + 'a>(
    path: &Path,
    reader: R,
) -> Result<Archive<impl Read + 'a>> {
    let mut archive = zip::ZipArchive::new(reader).map_err(|e| format_error(path, e))?;

    let file_name = archive
        .file_names()
        .find(|file_name| file_name.starts_with("info-") && file_name.ends_with(".tar.zst"))
        .ok_or_else(|| format_error(path, "missing info-*.tar.zst"))?
        .to_owned();

    // Find the offset and size of the inner tarball; it must be stored
    // uncompressed so we can seek straight to it.
    let (offset, size) = {
        let entry = archive
            .by_name(&file_name)
            .map_err(|e| format_error(path, e))?;
        if entry.compression() != CompressionMethod::Stored {
            return Err(format_error(path, "info entry is not stored uncompressed"));
        }
        (entry.data_start(), entry.size())
    };

    let mut reader = archive.into_inner();
    reader.seek(SeekFrom::Start(offset))?;
    let decoder = zstd::stream::read::Decoder::new(reader.take(size))?;
    Ok(Archive::new(decoder))
}

/// Stream a `.tar.bz2` package as a tar archive.
fn stream_tar_bz2<'a, R: Read + 'a>(reader: R) -> Archive<impl Read + 'a> {
    Archive::new(bzip2_rs::DecoderReader::new(reader))
}

/// The wanted-member bookkeeping for one archive read.
struct Wanted {
    members: Vec<&'static str>,
    recipe_seen: bool,
}

impl Wanted {
    fn new() -> Self {
        let mut members = vec![
            INDEX_JSON_PATH,
            ABOUT_JSON_PATH,
            RECIPE_LOG_PATH,
            RUN_EXPORTS_PATH,
            PATHS_JSON_PATH,
            ICON_PATH,
        ];
        members.extend(RECIPE_PATHS);
        Wanted {
            members,
            recipe_seen: false,
        }
    }

    fn take(&mut self, name: &str) -> bool {
        if self.recipe_seen && RECIPE_PATHS.contains(&name) {
            return false;
        }
        match self.members.iter().position(|m| *m == name) {
            Some(i) => {
                self.members.swap_remove(i);
                if RECIPE_PATHS.contains(&name) {
                    self.recipe_seen = true;
                    self.members.retain(|m| !RECIPE_PATHS.contains(m));
                }
                true
            }
            None => false,
        }
    }

    fn drop_icon(&mut self) {
        self.members.retain(|m| *m != ICON_PATH);
    }

    fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Read every wanted metadata member out of the archive at `path`, reading
/// from `reader` (usually the opened file).
///
/// Returns a map of member name to raw bytes. Absent members are simply
/// missing from the map. The archive is abandoned as soon as all wanted
/// members have been observed; `info/icon.png` stops being wanted once
/// `info/index.json` has been seen without an `icon` entry.
pub fn read_metadata<R: Read + Seek>(
    path: &Path,
    reader: &mut R,
) -> Result<HashMap<String, Vec<u8>>> {
    let archive_type = ArchiveType::try_from(path)
        .ok_or_else(|| format_error(path, "unrecognized package extension"))?;
    match archive_type {
        ArchiveType::Conda => collect_members(path, stream_conda_info(path, reader)?),
        ArchiveType::TarBz2 => collect_members(path, stream_tar_bz2(reader)),
    }
}

fn collect_members<R: Read>(
    path: &Path,
    mut archive: Archive<R>,
) -> Result<HashMap<String, Vec<u8>>> {
    let mut wanted = Wanted::new();
    let mut members = HashMap::new();

    let entries = archive.entries().map_err(|e| format_error(path, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| format_error(path, e))?;
        let name = match entry.path() {
            Ok(entry_path) => entry_path.to_string_lossy().into_owned(),
            Err(_) => continue,
        };
        if !wanted.take(&name) {
            continue;
        }

        let mut data = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut data)
            .map_err(|e| format_error(path, e))?;

        if name == INDEX_JSON_PATH {
            // most packages have no icon; stop waiting for one
            let has_icon = serde_json::from_slice::<serde_json::Value>(&data)
                .ok()
                .map(|v| v.get("icon").is_some_and(|icon| !icon.is_null()))
                .unwrap_or(false);
            if !has_icon {
                wanted.drop_icon();
            }
        }
        members.insert(name, data);

        if wanted.is_empty() {
            tracing::debug!("{} early close", path.display());
            break;
        }
    }

    Ok(members)
}

/// Extract a single member from a patch-instruction archive's payload, e.g.
/// `linux-64/patch_instructions.json` out of a `.conda` or `.tar.bz2`.
pub fn read_payload_member<R: Read + Seek>(
    path: &Path,
    reader: &mut R,
    member: &str,
) -> Result<Option<Vec<u8>>> {
    let archive_type = ArchiveType::try_from(path)
        .ok_or_else(|| format_error(path, "unrecognized package extension"))?;
    match archive_type {
        ArchiveType::Conda => {
            let archive = stream_conda_payload(path, reader)?;
            find_member(path, archive, member)
        }
        ArchiveType::TarBz2 => find_member(path, stream_tar_bz2(reader), member),
    }
}

/// Stream the `pkg-*.tar.zst` section of a `.conda` package.
fn stream_conda_payload<'a, R: Read + Seek + 'a>(
    path: &Path,
    reader: R,
) -> Result<Archive<impl Read + 'a>> {
    let mut archive = zip::ZipArchive::new(reader).map_err(|e| format_error(path, e))?;
    let file_name = archive
        .file_names()
        .find(|file_name| file_name.starts_with("pkg-") && file_name.ends_with(".tar.zst"))
        .ok_or_else(|| format_error(path, "missing pkg-*.tar.zst"))?
        .to_owned();
    let (offset, size) = {
        let entry = archive
            .by_name(&file_name)
            .map_err(|e| format_error(path, e))?;
        if entry.compression() != CompressionMethod::Stored {
            return Err(format_error(path, "pkg entry is not stored uncompressed"));
        }
        (entry.data_start(), entry.size())
    };
    let mut reader = archive.into_inner();
    reader.seek(SeekFrom::Start(offset))?;
    let decoder = zstd::stream::read::Decoder::new(reader.take(size))?;
    Ok(Archive::new(decoder))
}

fn find_member<R: Read>(
    path: &Path,
    mut archive: Archive<R>,
    member: &str,
) -> Result<Option<Vec<u8>>> {
    let entries = archive.entries().map_err(|e| format_error(path, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| format_error(path, e))?;
        let matches = entry
            .path()
            .map(|p| p == PathBuf::from(member))
            .unwrap_or(false);
        if matches {
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut data)
                .map_err(|e| format_error(path, e))?;
            return Ok(Some(data));
        }
    }
    Ok(None)
}
