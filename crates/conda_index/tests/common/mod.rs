//! Builders for small test package archives in both on-disk formats.

use std::io::Write;
use std::path::{Path, PathBuf};

pub fn index_json(name: &str, version: &str, build_number: u64) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "version": version,
        "build": format!("h{build_number}"),
        "build_number": build_number,
        "depends": [],
        "subdir": "noarch",
        "timestamp": 1_600_000_000u64 + build_number,
    })
}

fn tar_bytes(members: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, data.as_slice()).unwrap();
    }
    builder.into_inner().unwrap()
}

fn info_members(
    index: &serde_json::Value,
    extra: &[(&str, Vec<u8>)],
) -> Vec<(String, Vec<u8>)> {
    let mut members = vec![(
        "info/index.json".to_string(),
        serde_json::to_vec_pretty(index).unwrap(),
    )];
    members.extend(
        extra
            .iter()
            .map(|(path, data)| (path.to_string(), data.clone())),
    );
    members
}

/// Write `{stem}.conda` into `dir`: a zip of stored `info-*.tar.zst` and
/// `pkg-*.tar.zst` entries.
pub fn write_conda(
    dir: &Path,
    stem: &str,
    index: &serde_json::Value,
    extra: &[(&str, Vec<u8>)],
) -> PathBuf {
    let info_tar = tar_bytes(&info_members(index, extra));
    let info_zst = zstd::stream::encode_all(&info_tar[..], 0).unwrap();
    let pkg_tar = tar_bytes(&[("lib/payload.txt".to_string(), b"payload".to_vec())]);
    let pkg_zst = zstd::stream::encode_all(&pkg_tar[..], 0).unwrap();

    let path = dir.join(format!("{stem}.conda"));
    let file = std::fs::File::create(&path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    writer
        .start_file(format!("info-{stem}.tar.zst"), options)
        .unwrap();
    writer.write_all(&info_zst).unwrap();
    writer
        .start_file(format!("pkg-{stem}.tar.zst"), options)
        .unwrap();
    writer.write_all(&pkg_zst).unwrap();
    writer.finish().unwrap();
    path
}

/// Write `{stem}.tar.bz2` into `dir`.
pub fn write_tar_bz2(
    dir: &Path,
    stem: &str,
    index: &serde_json::Value,
    extra: &[(&str, Vec<u8>)],
) -> PathBuf {
    let mut members = info_members(index, extra);
    members.push(("lib/payload.txt".to_string(), b"payload".to_vec()));
    let tar = tar_bytes(&members);

    let path = dir.join(format!("{stem}.tar.bz2"));
    let file = std::fs::File::create(&path).unwrap();
    let mut encoder = bzip2::write::BzEncoder::new(file, bzip2::Compression::default());
    encoder.write_all(&tar).unwrap();
    encoder.finish().unwrap();
    path
}

pub fn sha256_hex(path: &Path) -> String {
    use sha2::Digest;
    hex::encode(sha2::Sha256::digest(std::fs::read(path).unwrap()))
}

pub fn read_json(path: &Path) -> serde_json::Value {
    serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
}
