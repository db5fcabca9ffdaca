mod common;

use conda_index::shards::{Shard, ShardedRepodata, SHARDS_INDEX_FN};
use conda_index::{ChannelIndex, ChannelIndexConfig, REPODATA_JSON_FN};
use sha2::Digest;

use common::{index_json, read_json, write_conda, write_tar_bz2};

#[test]
fn test_sharded_layout_round_trips() {
    let channel = tempfile::tempdir().unwrap();
    let noarch = channel.path().join("noarch");
    std::fs::create_dir(&noarch).unwrap();
    write_conda(&noarch, "a-1.0-h0", &index_json("a", "1.0", 0), &[]);
    write_conda(&noarch, "a-1.1-h0", &index_json("a", "1.1", 0), &[]);
    write_conda(&noarch, "b-2.0-h0", &index_json("b", "2.0", 0), &[]);
    write_tar_bz2(&noarch, "b-1.9-h0", &index_json("b", "1.9", 0), &[]);

    let config = ChannelIndexConfig {
        channel_root: channel.path().to_path_buf(),
        write_shards: true,
        write_html: false,
        ..Default::default()
    };
    ChannelIndex::new(config).index(None).unwrap();

    let index_bytes = zstd::stream::decode_all(
        &std::fs::read(noarch.join(SHARDS_INDEX_FN)).unwrap()[..],
    )
    .unwrap();
    let index: ShardedRepodata = rmp_serde::from_slice(&index_bytes).unwrap();

    assert_eq!(index.info.subdir, "noarch");
    // unset urls are empty strings for cross-tool compatibility
    assert_eq!(index.info.base_url, "");
    assert_eq!(index.info.shards_base_url, "");

    let mut shard_names: Vec<_> = index.shards.keys().cloned().collect();
    shard_names.sort();
    assert_eq!(shard_names, ["a", "b"]);

    // reconstructing repodata from the shards matches the monolithic file
    let monolithic = read_json(&noarch.join(REPODATA_JSON_FN));
    let mut total_records = 0;
    for (name, digest) in &index.shards {
        let shard_path = noarch.join(format!("{}.msgpack.zst", hex::encode(digest.0)));
        let compressed = std::fs::read(&shard_path).unwrap();
        // content-addressed by the compressed bytes
        assert_eq!(sha2::Sha256::digest(&compressed).as_slice(), &digest.0);

        let shard: Shard =
            rmp_serde::from_slice(&zstd::stream::decode_all(&compressed[..]).unwrap()).unwrap();
        for (filename, record) in &shard.conda_packages {
            assert_eq!(&record.name, name);
            let expected = &monolithic["packages.conda"][filename];
            assert_eq!(expected["name"], record.name.as_str());
            assert_eq!(
                expected["sha256"].as_str().unwrap(),
                record.sha256.unwrap().to_string()
            );
            total_records += 1;
        }
        for (filename, record) in &shard.packages {
            assert_eq!(&record.name, name);
            assert!(monolithic["packages"][filename].is_object());
            total_records += 1;
        }
    }
    assert_eq!(
        total_records,
        monolithic["packages"].as_object().unwrap().len()
            + monolithic["packages.conda"].as_object().unwrap().len()
    );
}

#[test]
fn test_shard_emission_is_idempotent() {
    let channel = tempfile::tempdir().unwrap();
    let noarch = channel.path().join("noarch");
    std::fs::create_dir(&noarch).unwrap();
    write_conda(&noarch, "a-1.0-h0", &index_json("a", "1.0", 0), &[]);

    let config = ChannelIndexConfig {
        channel_root: channel.path().to_path_buf(),
        write_shards: true,
        write_html: false,
        ..Default::default()
    };
    ChannelIndex::new(config.clone()).index(None).unwrap();

    let count_shards = || {
        std::fs::read_dir(&noarch)
            .unwrap()
            .filter(|entry| {
                entry
                    .as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".msgpack.zst")
            })
            .count()
    };
    let first = count_shards();

    ChannelIndex::new(config).index(None).unwrap();
    assert_eq!(count_shards(), first);
}
