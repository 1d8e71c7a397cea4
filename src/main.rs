//! smmap-cache: read byte ranges of a local or remote file through a
//! memory-mapped cache that any number of processes can share.

use std::io::Write;

use clap::Parser;
use tracing::info;

use smmap_cache::cache::SharedBlockCache;
use smmap_cache::config::{CacheArgs, CacheConfig, Cli, Command, INDEX_FILE_NAME};
use smmap_cache::fetch::{FileFetcher, Fetcher, HttpFetcher};

fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging. Stdout carries data, so logs go to stderr.
    let filter = if cli.verbose {
        "smmap_cache=debug"
    } else {
        "smmap_cache=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!("smmap-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration defaults.
    let defaults = match &cli.config {
        Some(path) => CacheConfig::load(path)?,
        None => CacheConfig::default(),
    };

    match cli.command {
        Command::Read {
            source,
            start,
            end,
            output,
            metrics,
            cache,
        } => {
            let cache = open_cache(&source, &cache, &defaults)?;
            let end = end.unwrap_or_else(|| cache.size());
            let data = cache.fetch_range(start, end)?;

            match output {
                Some(path) => std::fs::write(&path, data)?,
                None => {
                    let mut stdout = std::io::stdout().lock();
                    stdout.write_all(data)?;
                    stdout.flush()?;
                }
            }
            info!(start, end, bytes = data.len(), "Range read");

            if metrics {
                eprint!("{}", cache.metrics().encode()?);
            }
        }
        Command::Prefetch { source, cache } => {
            let cache = open_cache(&source, &cache, &defaults)?;
            cache.prefetch()?;
            let stats = cache.stats();
            info!(
                blocks = stats.block_count,
                fetched = cache.metrics().fetched_bytes.get(),
                "Prefetch complete"
            );
        }
        Command::Status { cache_dir } => {
            let info = SharedBlockCache::inspect(&cache_dir.join(INDEX_FILE_NAME))?;
            println!("total size:     {}", info.total_size);
            println!("block size:     {}", info.block_size);
            println!(
                "present blocks: {}/{} ({:.1}%)",
                info.present_blocks,
                info.block_count,
                info.fill_fraction() * 100.0
            );
        }
    }

    Ok(())
}

/// Open the fetcher for `source` and the cache in front of it.
fn open_cache(
    source: &str,
    args: &CacheArgs,
    defaults: &CacheConfig,
) -> anyhow::Result<SharedBlockCache> {
    let (fetcher, size): (Box<dyn Fetcher>, u64) =
        if source.starts_with("http://") || source.starts_with("https://") {
            let fetcher = HttpFetcher::new(source)?;
            let size = fetcher.content_length()?;
            (Box::new(fetcher), size)
        } else {
            let fetcher = FileFetcher::open(source)?;
            let size = fetcher.len();
            (Box::new(fetcher), size)
        };

    let config = args.resolve(defaults, size);
    info!(source, size, location = %config.location.display(), "Opening cache");
    Ok(SharedBlockCache::open_boxed(config, fetcher)?)
}
