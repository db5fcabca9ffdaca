mod common;

use std::path::Path;

use conda_index::{
    ChannelIndex, ChannelIndexConfig, Error, PatchInstructions, RepoData,
    CURRENT_REPODATA_JSON_FN, REPODATA_FROM_PKGS_JSON_FN, REPODATA_JSON_FN, RUN_EXPORTS_JSON_FN,
};

use common::{index_json, read_json, sha256_hex, write_conda, write_tar_bz2};

fn quiet_config(channel_root: &Path) -> ChannelIndexConfig {
    ChannelIndexConfig {
        channel_root: channel_root.to_path_buf(),
        write_html: false,
        ..Default::default()
    }
}

fn run(config: ChannelIndexConfig) {
    ChannelIndex::new(config).index(None).unwrap();
}

#[test]
fn test_two_conda_packages() {
    let channel = tempfile::tempdir().unwrap();
    let noarch = channel.path().join("noarch");
    std::fs::create_dir(&noarch).unwrap();
    let a_path = write_conda(&noarch, "a-1.0-h0", &index_json("a", "1.0", 0), &[]);
    write_conda(&noarch, "b-2.0-h0", &index_json("b", "2.0", 0), &[]);

    run(quiet_config(channel.path()));

    let repodata = read_json(&noarch.join(REPODATA_JSON_FN));
    assert_eq!(repodata["info"]["subdir"], "noarch");
    assert_eq!(repodata["packages"], serde_json::json!({}));
    assert_eq!(repodata["removed"], serde_json::json!([]));

    let conda_packages = repodata["packages.conda"].as_object().unwrap();
    assert_eq!(conda_packages.len(), 2);

    let record = &conda_packages["a-1.0-h0.conda"];
    assert_eq!(record["name"], "a");
    assert_eq!(record["version"], "1.0");
    assert_eq!(record["build_number"], 0);
    // computed over the archive bytes, overriding anything embedded
    assert_eq!(record["sha256"], sha256_hex(&a_path).as_str());
    assert_eq!(
        record["size"].as_u64().unwrap(),
        std::fs::metadata(&a_path).unwrap().len()
    );
    assert!(record["md5"].as_str().unwrap().len() == 32);
}

#[test]
fn test_patch_remove_keeps_prepatch_document() {
    let channel = tempfile::tempdir().unwrap();
    let noarch = channel.path().join("noarch");
    std::fs::create_dir(&noarch).unwrap();
    write_conda(&noarch, "a-1.0-h0", &index_json("a", "1.0", 0), &[]);
    write_conda(&noarch, "b-2.0-h0", &index_json("b", "2.0", 0), &[]);

    let patch = |_subdir: &str, _repodata: &RepoData| -> conda_index::Result<PatchInstructions> {
        Ok(serde_json::from_value(serde_json::json!({
            "patch_instructions_version": 1,
            "remove": ["a-1.0-h0.conda"],
        }))
        .unwrap())
    };
    ChannelIndex::new(quiet_config(channel.path()))
        .index(Some(&patch))
        .unwrap();

    let repodata = read_json(&noarch.join(REPODATA_JSON_FN));
    assert!(repodata["packages.conda"]["a-1.0-h0.conda"].is_null());
    assert_eq!(repodata["removed"], serde_json::json!(["a-1.0-h0.conda"]));

    let from_packages = read_json(&noarch.join(REPODATA_FROM_PKGS_JSON_FN));
    assert!(from_packages["packages.conda"]["a-1.0-h0.conda"].is_object());
    assert_eq!(from_packages["removed"], serde_json::json!([]));
}

#[test]
fn test_mixed_extensions() {
    let channel = tempfile::tempdir().unwrap();
    let noarch = channel.path().join("noarch");
    std::fs::create_dir(&noarch).unwrap();
    write_conda(&noarch, "b-2.0-h0", &index_json("b", "2.0", 0), &[]);
    write_tar_bz2(&noarch, "a-1.0-h0", &index_json("a", "1.0", 0), &[]);

    run(quiet_config(channel.path()));

    let repodata = read_json(&noarch.join(REPODATA_JSON_FN));
    assert!(repodata["packages"]["a-1.0-h0.tar.bz2"].is_object());
    assert!(repodata["packages.conda"]["b-2.0-h0.conda"].is_object());
}

#[test]
fn test_incremental_and_idempotent() {
    let channel = tempfile::tempdir().unwrap();
    let noarch = channel.path().join("noarch");
    std::fs::create_dir(&noarch).unwrap();
    write_conda(&noarch, "a-1.0-h0", &index_json("a", "1.0", 0), &[]);
    write_conda(&noarch, "b-2.0-h0", &index_json("b", "2.0", 0), &[]);

    run(quiet_config(channel.path()));
    let first = std::fs::read(noarch.join(REPODATA_JSON_FN)).unwrap();

    // a second run with no changes is a byte-for-byte no-op
    run(quiet_config(channel.path()));
    let second = std::fs::read(noarch.join(REPODATA_JSON_FN)).unwrap();
    assert_eq!(first, second);

    // adding one archive only adds that archive's entry
    write_conda(&noarch, "c-3.0-h0", &index_json("c", "3.0", 0), &[]);
    run(quiet_config(channel.path()));
    let third = read_json(&noarch.join(REPODATA_JSON_FN));
    let conda_packages = third["packages.conda"].as_object().unwrap();
    assert_eq!(conda_packages.len(), 3);

    // records of untouched archives are unchanged, including digests
    let first_parsed: serde_json::Value = serde_json::from_slice(&first).unwrap();
    assert_eq!(
        first_parsed["packages.conda"]["a-1.0-h0.conda"],
        conda_packages["a-1.0-h0.conda"]
    );
}

#[test]
fn test_removed_archive_drops_from_repodata() {
    let channel = tempfile::tempdir().unwrap();
    let noarch = channel.path().join("noarch");
    std::fs::create_dir(&noarch).unwrap();
    write_conda(&noarch, "a-1.0-h0", &index_json("a", "1.0", 0), &[]);
    let b_path = write_conda(&noarch, "b-2.0-h0", &index_json("b", "2.0", 0), &[]);

    run(quiet_config(channel.path()));
    std::fs::remove_file(&b_path).unwrap();
    run(quiet_config(channel.path()));

    let repodata = read_json(&noarch.join(REPODATA_JSON_FN));
    let conda_packages = repodata["packages.conda"].as_object().unwrap();
    assert_eq!(conda_packages.len(), 1);
    assert!(conda_packages.contains_key("a-1.0-h0.conda"));
}

#[test]
fn test_corrupt_archive_is_skipped() {
    let channel = tempfile::tempdir().unwrap();
    let noarch = channel.path().join("noarch");
    std::fs::create_dir(&noarch).unwrap();
    write_conda(&noarch, "a-1.0-h0", &index_json("a", "1.0", 0), &[]);
    std::fs::write(noarch.join("broken-1.0-h0.conda"), b"not a zip at all").unwrap();

    // a bad archive fails itself, not the subdir
    run(quiet_config(channel.path()));

    let repodata = read_json(&noarch.join(REPODATA_JSON_FN));
    let conda_packages = repodata["packages.conda"].as_object().unwrap();
    assert_eq!(conda_packages.len(), 1);
    assert!(conda_packages.contains_key("a-1.0-h0.conda"));
}

#[test]
fn test_current_repodata_subset() {
    let channel = tempfile::tempdir().unwrap();
    let noarch = channel.path().join("noarch");
    std::fs::create_dir(&noarch).unwrap();
    write_conda(&noarch, "a-1.0-h0", &index_json("a", "1.0", 0), &[]);
    write_conda(&noarch, "a-2.0-h0", &index_json("a", "2.0", 0), &[]);

    run(quiet_config(channel.path()));

    let current = read_json(&noarch.join(CURRENT_REPODATA_JSON_FN));
    let conda_packages = current["packages.conda"].as_object().unwrap();
    assert_eq!(conda_packages.len(), 1);
    assert!(conda_packages.contains_key("a-2.0-h0.conda"));

    // the monolithic document still lists everything
    let repodata = read_json(&noarch.join(REPODATA_JSON_FN));
    assert_eq!(repodata["packages.conda"].as_object().unwrap().len(), 2);
}

#[test]
fn test_run_exports_document() {
    let channel = tempfile::tempdir().unwrap();
    let noarch = channel.path().join("noarch");
    std::fs::create_dir(&noarch).unwrap();
    let run_exports = serde_json::json!({"weak": ["liba >=1.0"]});
    write_conda(
        &noarch,
        "liba-1.0-h0",
        &index_json("liba", "1.0", 0),
        &[(
            "info/run_exports.json",
            serde_json::to_vec(&run_exports).unwrap(),
        )],
    );
    write_conda(&noarch, "b-2.0-h0", &index_json("b", "2.0", 0), &[]);

    let config = ChannelIndexConfig {
        write_run_exports: true,
        ..quiet_config(channel.path())
    };
    run(config);

    let doc = read_json(&noarch.join(RUN_EXPORTS_JSON_FN));
    assert_eq!(doc["info"]["subdir"], "noarch");
    assert_eq!(doc["packages.conda"]["liba-1.0-h0.conda"], run_exports);
    // packages without run_exports are absent, not empty
    assert!(doc["packages.conda"]["b-2.0-h0.conda"].is_null());
}

#[test]
fn test_locked_subdir_fails_cleanly() {
    let channel = tempfile::tempdir().unwrap();
    let noarch = channel.path().join("noarch");
    std::fs::create_dir(&noarch).unwrap();
    write_conda(&noarch, "a-1.0-h0", &index_json("a", "1.0", 0), &[]);

    let _held = conda_index::cache::CacheLock::acquire(&noarch.join(".cache"), "noarch").unwrap();

    match ChannelIndex::new(quiet_config(channel.path())).index(None) {
        Err(Error::SubdirsFailed(subdirs)) => assert_eq!(subdirs, ["noarch"]),
        other => panic!("expected SubdirsFailed, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_no_update_cache_emits_from_cache() {
    let channel = tempfile::tempdir().unwrap();
    let noarch = channel.path().join("noarch");
    std::fs::create_dir(&noarch).unwrap();
    write_conda(&noarch, "a-1.0-h0", &index_json("a", "1.0", 0), &[]);

    run(quiet_config(channel.path()));

    // nuke the outputs but keep the cache, then emit without probing
    std::fs::remove_file(noarch.join(REPODATA_JSON_FN)).unwrap();
    let config = ChannelIndexConfig {
        update_cache: false,
        ..quiet_config(channel.path())
    };
    run(config);

    let repodata = read_json(&noarch.join(REPODATA_JSON_FN));
    assert!(repodata["packages.conda"]["a-1.0-h0.conda"].is_object());
}

#[test]
fn test_base_url_enables_repodata_version_2() {
    let channel = tempfile::tempdir().unwrap();
    let noarch = channel.path().join("noarch");
    std::fs::create_dir(&noarch).unwrap();
    write_conda(&noarch, "a-1.0-h0", &index_json("a", "1.0", 0), &[]);

    let config = ChannelIndexConfig {
        base_url: Some("https://packages.example.test/stable".to_string()),
        ..quiet_config(channel.path())
    };
    run(config);

    let repodata = read_json(&noarch.join(REPODATA_JSON_FN));
    assert_eq!(repodata["repodata_version"], 2);
    assert_eq!(
        repodata["info"]["base_url"],
        "https://packages.example.test/stable/noarch/"
    );
}

#[test]
fn test_separate_output_root() {
    let channel = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let noarch = channel.path().join("noarch");
    std::fs::create_dir(&noarch).unwrap();
    write_conda(&noarch, "a-1.0-h0", &index_json("a", "1.0", 0), &[]);

    let config = ChannelIndexConfig {
        output_root: Some(output.path().to_path_buf()),
        ..quiet_config(channel.path())
    };
    run(config);

    assert!(output.path().join("noarch").join(REPODATA_JSON_FN).exists());
    assert!(!noarch.join(REPODATA_JSON_FN).exists());
    // the cache stays with the channel
    assert!(noarch.join(".cache").join("cache.db").exists());
}

#[test]
fn test_channeldata_and_feeds() {
    let channel = tempfile::tempdir().unwrap();
    let noarch = channel.path().join("noarch");
    std::fs::create_dir(&noarch).unwrap();
    let about = serde_json::json!({
        "summary": "a demo package",
        "home": "https://demo.example.test",
        "license": "BSD-3-Clause",
    });
    write_conda(
        &noarch,
        "demo-1.0-h0",
        &index_json("demo", "1.0", 0),
        &[("info/about.json", serde_json::to_vec(&about).unwrap())],
    );

    let config = ChannelIndexConfig {
        write_channeldata: true,
        write_rss: true,
        write_html: true,
        ..quiet_config(channel.path())
    };
    run(config);

    let channeldata = read_json(&channel.path().join("channeldata.json"));
    assert_eq!(channeldata["channeldata_version"], 1);
    assert_eq!(channeldata["subdirs"], serde_json::json!(["noarch"]));
    let package = &channeldata["packages"]["demo"];
    assert_eq!(package["version"], "1.0");
    assert_eq!(package["summary"], "a demo package");
    assert_eq!(package["license"], "BSD-3-Clause");
    assert_eq!(package["subdirs"], serde_json::json!(["noarch"]));

    let rss = std::fs::read_to_string(channel.path().join("rss.xml")).unwrap();
    assert!(rss.contains("demo 1.0 [noarch]"));

    let channel_html = std::fs::read_to_string(channel.path().join("index.html")).unwrap();
    assert!(channel_html.contains("demo"));
    let subdir_html = std::fs::read_to_string(noarch.join("index.html")).unwrap();
    assert!(subdir_html.contains("demo-1.0-h0.conda"));
}
