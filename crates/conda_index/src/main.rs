use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use clap_verbosity_flag::Verbosity;
use conda_index::{
    ArchivePatchGenerator, CacheBackend, ChannelIndex, ChannelIndexConfig, Error, PatchGenerator,
    VersionPins,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Sqlite,
    Postgresql,
}

/// Create repodata.json and friends for a directory of conda packages.
#[derive(Parser)]
#[command(name = "conda-index", version, about, long_about = None)]
struct Cli {
    /// The channel directory, containing one subdirectory per platform.
    channel: PathBuf,

    #[command(flatten)]
    verbosity: Verbosity,

    /// Write output documents to a separate directory tree.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Subdir to index; accepts multiple. Defaults to auto-detection.
    #[arg(long = "subdir")]
    subdirs: Vec<String>,

    /// Channel name listed in index.html and rss.xml.
    #[arg(short = 'n', long)]
    channel_name: Option<String>,

    /// A .conda or .tar.bz2 hotfix package carrying
    /// {subdir}/patch_instructions.json members.
    #[arg(long)]
    patch_generator: Option<PathBuf>,

    /// Extraction worker threads. 0 uses the CPU count.
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Write repodata.json with all package metadata in a single file
    /// (default).
    #[arg(long, overrides_with = "no_monolithic")]
    monolithic: bool,

    /// Skip writing repodata.json / repodata_from_packages.json.
    #[arg(long)]
    no_monolithic: bool,

    /// Write sharded repodata (repodata_shards.msgpack.zst).
    #[arg(long, overrides_with = "no_shards")]
    shards: bool,

    /// Skip writing sharded repodata (default).
    #[arg(long)]
    no_shards: bool,

    /// Write current_repodata.json (default).
    #[arg(long, overrides_with = "no_current_repodata")]
    current_repodata: bool,

    /// Skip writing current_repodata.json.
    #[arg(long)]
    no_current_repodata: bool,

    /// Write run_exports.json.
    #[arg(long, overrides_with = "no_run_exports")]
    run_exports: bool,

    /// Skip writing run_exports.json (default).
    #[arg(long)]
    no_run_exports: bool,

    /// Generate channeldata.json.
    #[arg(long, overrides_with = "no_channeldata")]
    channeldata: bool,

    /// Skip generating channeldata.json (default).
    #[arg(long)]
    no_channeldata: bool,

    /// Write rss.xml (only with --channeldata).
    #[arg(long, overrides_with = "no_rss")]
    rss: bool,

    /// Skip writing rss.xml (default).
    #[arg(long)]
    no_rss: bool,

    /// Skip writing index.html.
    #[arg(long)]
    no_html: bool,

    /// Skip the digest hover popups on index.html download links.
    #[arg(long)]
    no_html_popup: bool,

    /// Write repodata.json.bz2.
    #[arg(long, overrides_with = "no_bz2")]
    bz2: bool,

    /// Skip writing repodata.json.bz2 (default).
    #[arg(long)]
    no_bz2: bool,

    /// Write repodata.json.zst.
    #[arg(long, overrides_with = "no_zst")]
    zst: bool,

    /// Skip writing repodata.json.zst (default).
    #[arg(long)]
    no_zst: bool,

    /// Output JSON as one line per document (default).
    #[arg(long, overrides_with = "no_compact")]
    compact: bool,

    /// Pretty-print JSON output instead.
    #[arg(long)]
    no_compact: bool,

    /// Skip the filesystem probe and extraction; emit repodata from the
    /// existing cache only.
    #[arg(long)]
    no_update_cache: bool,

    /// Stage in the stat table naming the upstream view of packages.
    #[arg(long, default_value = "fs")]
    upstream_stage: String,

    /// Cache backend.
    #[arg(long, value_enum, default_value_t = Backend::Sqlite)]
    backend: Backend,

    /// Connection URL for the postgresql backend.
    #[arg(long, env = "CONDA_INDEX_DBURL")]
    db_url: Option<String>,

    /// URL of the directory tree holding packages when they are served
    /// separately from repodata.json; enables repodata_version=2.
    #[arg(long)]
    base_url: Option<String>,

    /// Base URL for individual shards in the shard index.
    #[arg(long)]
    shards_base_url: Option<String>,

    /// YAML file of package name to list of versions to always keep in
    /// current_repodata.json.
    #[arg(short = 'm', long)]
    current_index_versions_file: Option<PathBuf>,
}

fn load_version_pins(path: &PathBuf) -> anyhow::Result<VersionPins> {
    let content = fs_err::read(path)?;
    Ok(serde_yaml::from_slice(&content)?)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity.tracing_level_filter())
        .init();

    let backend = match cli.backend {
        Backend::Sqlite => CacheBackend::Sqlite,
        Backend::Postgresql => CacheBackend::Postgresql {
            url: cli
                .db_url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("--backend postgresql needs --db-url"))?,
        },
    };

    let current_index_versions = cli
        .current_index_versions_file
        .as_ref()
        .map(load_version_pins)
        .transpose()?;

    let config = ChannelIndexConfig {
        channel_root: cli.channel,
        output_root: cli.output,
        channel_name: cli.channel_name,
        subdirs: (!cli.subdirs.is_empty()).then_some(cli.subdirs),
        threads: cli.threads,
        backend,
        upstream_stage: cli.upstream_stage,
        base_url: cli.base_url,
        shards_base_url: cli.shards_base_url,
        // paired --x/--no-x flags: clap keeps whichever came last
        write_monolithic: cli.monolithic || !cli.no_monolithic,
        write_shards: cli.shards && !cli.no_shards,
        write_current: cli.current_repodata || !cli.no_current_repodata,
        write_run_exports: cli.run_exports && !cli.no_run_exports,
        write_channeldata: cli.channeldata && !cli.no_channeldata,
        write_html: !cli.no_html,
        html_popups: !cli.no_html_popup,
        write_rss: cli.rss && !cli.no_rss,
        write_bz2: cli.bz2 && !cli.no_bz2,
        write_zst: cli.zst && !cli.no_zst,
        compact_json: cli.compact || !cli.no_compact,
        update_cache: !cli.no_update_cache,
        current_index_versions,
    };

    let channel_index = ChannelIndex::new(config);

    let cancel = channel_index.cancellation_token();
    ctrlc::set_handler(move || {
        tracing::warn!("interrupt received, finishing in-flight archives");
        cancel.cancel();
    })?;

    let patch_generator = cli
        .patch_generator
        .map(|path| Box::new(ArchivePatchGenerator::new(path)) as Box<dyn PatchGenerator>);

    match channel_index.index(patch_generator.as_deref()) {
        Ok(()) => {
            println!("Finished indexing channel.");
            Ok(())
        }
        Err(Error::Interrupted) => {
            tracing::warn!("indexing interrupted; cache left consistent");
            std::process::exit(130);
        }
        Err(e) => Err(e.into()),
    }
}
