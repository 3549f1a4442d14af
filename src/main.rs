//! vcstore - command-line access to a content-addressed block store
//!
//! Usage:
//!   vcstore --store DIR init
//!   vcstore --store DIR put < payload
//!   vcstore --store DIR import --block-size 4096 < image
//!   vcstore --store DIR export ROOT > image
//!
//! Example:
//!   vcstore --config /etc/vcstore.toml stats

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use serde::Serialize;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use vcstore::config::parse_log_level;
use vcstore::store::MAX_BLOCK_SIZE;
use vcstore::{
    create_store, logging, open_store, Address, BlockOp, BlockTree, Config, Store, StoreStats,
    TreeNode,
};

#[derive(Parser, Debug)]
#[command(name = "vcstore")]
#[command(about = "Content-addressed block store with copy-on-write block trees", long_about = None)]
struct Args {
    /// Store directory (overrides store.path from the config file)
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an empty store
    Init,

    /// Store stdin as one block and print its address
    Put,

    /// Write the block stored under ADDRESS to stdout
    Get { address: Address },

    /// Split stdin into blocks, store them as one tree and print its root
    Import {
        /// Bytes per block
        #[arg(short, long, default_value_t = 4096)]
        block_size: usize,
    },

    /// Write every block of the tree ROOT to stdout
    Export { root: TreeNode },

    /// Print the number of blocks in the tree ROOT
    Count { root: TreeNode },

    /// Print store counters as JSON
    Stats,
}

#[derive(Serialize)]
struct StatsReport<'a> {
    path: &'a Path,
    #[serde(flatten)]
    stats: StoreStats,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    init_logging(args.log_level.as_deref(), args.config.is_some().then_some(&config))?;

    let dir = match args.store.as_ref().or(config.store.path.as_ref()) {
        Some(dir) => dir.clone(),
        None => bail!("no store directory: pass --store or set store.path in the config"),
    };

    match args.command {
        Command::Init => {
            create_store(&dir)
                .with_context(|| format!("failed to create store at {}", dir.display()))?;
            log::info!("created store at {}", dir.display());
        }
        Command::Put => {
            let mut store = open(&dir, &config)?;
            let data = read_stdin()?;
            let addr = store.put(&data).context("failed to store block")?;
            println!("{}", addr);
            store.release().context("failed to flush store")?;
        }
        Command::Get { address } => {
            let mut store = open(&dir, &config)?;
            let data = store
                .read(&address)
                .with_context(|| format!("failed to read block {}", address))?;
            io::stdout().lock().write_all(&data)?;
        }
        Command::Import { block_size } => {
            if block_size == 0 || block_size > MAX_BLOCK_SIZE {
                bail!("block size must be between 1 and {}", MAX_BLOCK_SIZE);
            }

            let mut store = open(&dir, &config)?;
            let data = read_stdin()?;
            let ops: Vec<BlockOp> = data
                .chunks(block_size)
                .enumerate()
                .map(|(i, chunk)| BlockOp::new(i as u64, chunk))
                .collect();
            let blocks = ops.len();

            let root = BlockTree::new(&mut store)
                .put_many(&TreeNode::Empty, ops)
                .context("failed to import blocks")?;
            log::info!("imported {} bytes as {} blocks", data.len(), blocks);
            println!("{}", root);
            store.release().context("failed to flush store")?;
        }
        Command::Export { root } => {
            let mut store = open(&dir, &config)?;
            let mut tree = BlockTree::new(&mut store);
            let count = tree.count(&root).context("failed to count blocks")?;

            let mut out = io::stdout().lock();
            for block in 0..count {
                let data = tree
                    .read(&root, block)
                    .with_context(|| format!("failed to read block {}", block))?;
                out.write_all(&data)?;
            }
            out.flush()?;
        }
        Command::Count { root } => {
            let mut store = open(&dir, &config)?;
            let count = BlockTree::new(&mut store)
                .count(&root)
                .context("failed to count blocks")?;
            println!("{}", count);
        }
        Command::Stats => {
            let store = open(&dir, &config)?;
            let report = StatsReport {
                path: &dir,
                stats: store.stats(),
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

/// Install env_logger: --log-level wins, then the config file, then RUST_LOG
fn init_logging(cli_level: Option<&str>, config: Option<&Config>) -> Result<()> {
    let level = match (cli_level, config) {
        (Some(level), _) => Some(parse_log_level(level)?),
        (None, Some(config)) => Some(config.log.level_filter()?),
        (None, None) => None,
    };

    match level {
        Some(level) => env_logger::Builder::new().filter_level(level).init(),
        None => env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init(),
    }
    Ok(())
}

fn open(dir: &Path, config: &Config) -> Result<Store> {
    open_store(dir, &config.store, logging::global())
        .with_context(|| format!("failed to open store at {}", dir.display()))
}

fn read_stdin() -> Result<Vec<u8>> {
    let mut data = Vec::new();
    io::stdin()
        .lock()
        .read_to_end(&mut data)
        .context("failed to read stdin")?;
    Ok(data)
}
