//! Render the human-readable `index.html` listings.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tera::Tera;

use crate::channeldata::{make_seconds, ChannelData};
use crate::error::Result;
use crate::repodata::RepoData;
use crate::utils::human_bytes;

const SUBDIR_TEMPLATE: &str = include_str!("../templates/subdir-index.html");
const CHANNEL_TEMPLATE: &str = include_str!("../templates/channel-index.html");

fn environment() -> Result<Tera> {
    let mut tera = Tera::default();
    tera.add_raw_template("subdir-index.html", SUBDIR_TEMPLATE)?;
    tera.add_raw_template("channel-index.html", CHANNEL_TEMPLATE)?;
    Ok(tera)
}

#[derive(Serialize)]
struct FileRow {
    filename: String,
    size: String,
    timestamp: String,
    sha256: String,
    md5: String,
    /// Hover text on the download link; empty disables the popup.
    popup: String,
}

fn format_timestamp(timestamp: u64) -> String {
    let seconds = make_seconds(timestamp) as i64;
    match Utc.timestamp_opt(seconds, 0) {
        chrono::LocalResult::Single(datetime) => {
            datetime.format("%Y-%m-%d %H:%M:%S %Z").to_string()
        }
        _ => String::new(),
    }
}

/// Extra downloadable files listed above the packages, e.g. the repodata
/// documents themselves.
pub fn stat_extra_file(path: &Path) -> Option<FileRowSource> {
    let metadata = fs_err::metadata(path).ok()?;
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Some(FileRowSource {
        filename: path.file_name()?.to_string_lossy().into_owned(),
        size: metadata.len(),
        timestamp: mtime,
        sha256: None,
        md5: None,
    })
}

/// What the caller knows about a file to list.
pub struct FileRowSource {
    pub filename: String,
    pub size: u64,
    pub timestamp: u64,
    pub sha256: Option<String>,
    pub md5: Option<String>,
}

impl FileRowSource {
    fn into_row(self, popups: bool) -> FileRow {
        let popup = if popups {
            self.sha256
                .as_deref()
                .map(|sha256| format!("sha256: {sha256}"))
                .unwrap_or_default()
        } else {
            String::new()
        };
        FileRow {
            filename: self.filename,
            size: human_bytes(self.size),
            timestamp: format_timestamp(self.timestamp),
            sha256: self.sha256.unwrap_or_default(),
            md5: self.md5.unwrap_or_default(),
            popup,
        }
    }
}

/// Render the per-subdir package listing. `popups` controls the hover text
/// on download links.
pub fn render_subdir_index(
    channel_name: &str,
    subdir: &str,
    repodata: &RepoData,
    extra_files: Vec<FileRowSource>,
    popups: bool,
    now: DateTime<Utc>,
) -> Result<String> {
    let mut rows: Vec<FileRow> = repodata
        .packages
        .iter()
        .chain(repodata.conda_packages.iter())
        .map(|(filename, record)| {
            FileRowSource {
                filename: filename.clone(),
                size: record.size.unwrap_or(0),
                timestamp: record.timestamp.unwrap_or(0),
                sha256: record.sha256.map(|digest| digest.to_string()),
                md5: record.md5.map(|digest| digest.to_string()),
            }
            .into_row(popups)
        })
        .collect();
    rows.sort_by(|a, b| a.filename.cmp(&b.filename));

    let mut context = tera::Context::new();
    context.insert("title", &format!("{channel_name}/{subdir}"));
    context.insert(
        "extra_files",
        &extra_files
            .into_iter()
            .map(|file| file.into_row(popups))
            .collect::<Vec<_>>(),
    );
    context.insert("packages", &rows);
    context.insert("current_time", &now.format("%Y-%m-%d %H:%M:%S %Z").to_string());
    Ok(environment()?.render("subdir-index.html", &context)?)
}

#[derive(Serialize)]
struct ChannelRow {
    name: String,
    version: String,
    summary: String,
    home: String,
    license: String,
    subdirs: String,
    timestamp: String,
}

/// Render the channel-level package overview.
pub fn render_channel_index(
    channel_name: &str,
    channeldata: &ChannelData,
    now: DateTime<Utc>,
) -> Result<String> {
    let mut rows: Vec<ChannelRow> = channeldata
        .packages
        .iter()
        .map(|(name, package)| ChannelRow {
            name: name.clone(),
            version: package.version.clone().unwrap_or_default(),
            summary: package.summary.clone().unwrap_or_default(),
            home: package.home.clone().unwrap_or_default(),
            license: package.license.clone().unwrap_or_default(),
            subdirs: package
                .subdirs
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", "),
            timestamp: package.timestamp.map(format_timestamp).unwrap_or_default(),
        })
        .collect();
    rows.sort_by(|a, b| a.name.cmp(&b.name));

    let mut context = tera::Context::new();
    context.insert("title", channel_name);
    context.insert("packages", &rows);
    context.insert(
        "subdirs",
        &channeldata.subdirs.iter().cloned().collect::<Vec<_>>(),
    );
    context.insert("current_time", &now.format("%Y-%m-%d %H:%M:%S %Z").to_string());
    Ok(environment()?.render("channel-index.html", &context)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_subdir_index() {
        let mut repodata = RepoData::default();
        let record: crate::repodata::PackageRecord = serde_json::from_value(serde_json::json!({
            "build": "0",
            "build_number": 0,
            "name": "demo",
            "version": "1.0",
            "size": 2048,
            "timestamp": 1_600_000_000u64,
        }))
        .unwrap();
        repodata
            .conda_packages
            .insert("demo-1.0-0.conda".to_string(), record);

        let html = render_subdir_index(
            "testchannel",
            "noarch",
            &repodata,
            Vec::new(),
            true,
            Utc::now(),
        )
        .unwrap();
        assert!(html.contains("testchannel/noarch"));
        assert!(html.contains("demo-1.0-0.conda"));
        assert!(html.contains("2.0 KB"));
    }

    #[test]
    fn test_render_channel_index() {
        let mut channeldata = ChannelData::default();
        channeldata.subdirs.insert("noarch".to_string());
        channeldata.packages.insert(
            "demo".to_string(),
            crate::channeldata::ChannelDataPackage {
                version: Some("1.0".to_string()),
                summary: Some("a demo".to_string()),
                ..Default::default()
            },
        );
        let html = render_channel_index("testchannel", &channeldata, Utc::now()).unwrap();
        assert!(html.contains("demo"));
        assert!(html.contains("a demo"));
    }
}
