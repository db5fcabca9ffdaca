//! Output-file plumbing shared by all emitters.

use std::io;
use std::path::Path;

use uuid::Uuid;

/// Write `content` to `path` through a temporary file in the same directory
/// plus an atomic rename, so readers never observe a partial document.
///
/// When the file already holds exactly `content` nothing is written and the
/// mtime is left alone. Returns whether the file changed.
pub fn write_atomic(path: &Path, content: &[u8]) -> io::Result<bool> {
    if let Some(parent) = path.parent() {
        fs_err::create_dir_all(parent)?;
    }

    if let Ok(existing) = fs_err::read(path) {
        if existing == content {
            return Ok(false);
        }
    }

    let temp_path = path.with_file_name(format!(
        "{}.{}",
        path.file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_default(),
        Uuid::new_v4().simple()
    ));
    fs_err::write(&temp_path, content)?;
    match fs_err::rename(&temp_path, path) {
        Ok(()) => Ok(true),
        Err(e) => {
            let _ = fs_err::remove_file(&temp_path);
            Err(e)
        }
    }
}

/// Remove `path` if present.
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs_err::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// `1.2 MB`-style sizes for the HTML listing.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
