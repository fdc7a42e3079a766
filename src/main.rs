#![forbid(unsafe_code)]

use chrono::NaiveDate;
use directories::ProjectDirs;
use error_iter::ErrorIter as _;
use is_terminal::IsTerminal as _;
use onlyargs::CliError;
use onlyargs_derive::OnlyArgs;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::{env, process::ExitCode, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;
use utxotrace::basis::{self, TransactionSummary};
use utxotrace::client::cache::TtlCache;
use utxotrace::client::esplora::EsploraClient;
use utxotrace::client::price::{YahooPriceClient, PRICE_TTL};
use utxotrace::client::resolve_raw_transactions;
use utxotrace::errors::{EsploraClientError, ParseError, PriceDbError, StoreError, TagsError};
use utxotrace::flow::{self, AddressBook};
use utxotrace::imports::{tags, wallet};
use utxotrace::model::{wallet_stats, PriceDb, PriceLookup, TraceStats, TreeSummary};
use utxotrace::model::{TransactionTree, UtxoFlow, WalletFlowSummary, WalletStats};
use utxotrace::store::{MemoryStore, Store};
use utxotrace::trace::{self, Edge, TraceOptions};
use utxotrace::tree::{self, BuildOptions, FocusTree, WalletFlowTree};

const RAW_TX_MEMO: &str = "raw_tx_memo.ron";
const TEMP_MEMO: &str = ".temp_memo.ron";
const DEFAULT_ESPLORA_URL: &str = "https://mempool.space/api/,https://blockstream.info/api/";
const DEFAULT_CACHE_TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, OnlyArgs)]
#[footer = "Additional environment variables:"]
#[footer = "  - ESPLORA_URL accepts a comma-separated list of http: or https: URLs, tried in order"]
#[footer = "      default is \"https://mempool.space/api/,https://blockstream.info/api/\""]
#[footer = "  - RAYON_NUM_THREADS sets the connection concurrency for the Esplora client"]
#[footer = "      default is 32"]
#[footer = "  - CACHE_TTL_SECS sets how long fetched transactions stay cached in memory"]
#[footer = "      default is 86400"]
#[footer = "  - TERM_COLOR accepts \"always\" to override automatic terminal sensing"]
#[footer = "  - RUST_LOG configures log filtering, e.g. \"debug\" or \"utxotrace=trace\""]
struct Args {
    /// Read wallet export CSV from a file.
    ///   The wallet name is the file name up to its last `-`.
    ///
    #[long]
    input_wallet: Vec<PathBuf>,

    /// Read network transaction export CSV from a file.
    #[long]
    input_network: Vec<PathBuf>,

    /// Read `wallet,address` CSV from a file.
    ///   Required for wallet flows and flow chains.
    ///
    #[long]
    input_addresses: Vec<PathBuf>,

    /// Read Tx Tags CSV from a file.
    #[long]
    input_tx_tags: Vec<PathBuf>,

    /// Read store snapshot from a file.
    #[long]
    input_store: Option<PathBuf>,

    /// Write store snapshot to a file.
    ///
    #[long]
    output_store: Option<PathBuf>,

    /// Read daily BTCUSD prices from a directory of RON files.
    #[long]
    price_db: Option<PathBuf>,

    /// Fetch prices missing from the price DB over HTTP.
    #[long]
    fetch_prices: bool,

    /// Link transactions with blockchain data instead of address reuse.
    #[long]
    exact: bool,

    /// Maximum number of ancestor hops followed from any transaction.
    #[long]
    #[default(10)]
    max_depth: usize,

    /// Maximum number of edges in one traversal path.
    #[long]
    #[default(10)]
    max_path_length: usize,

    /// Start trees only at transactions without a parent.
    ///   Every transaction then belongs to exactly one tree.
    ///
    #[long]
    strict_roots: bool,

    /// Print the ancestors and descendants of this transaction.
    #[long]
    focus: Option<String>,

    /// Write the full report as JSON to a file.
    #[short('o')]
    output: Option<PathBuf>,

    /// Enable verbose output.
    verbose: bool,
}

#[derive(Debug, Error)]
enum Error {
    #[error("Argument parsing error")]
    Args(#[from] CliError),

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("Unable to parse wallet: {0:?}")]
    Wallet(PathBuf, #[source] ParseError),

    #[error("Unable to parse Addresses CSV: {0:?}")]
    Address(PathBuf, #[source] csv::Error),

    #[error("Unable to parse Tx Tags CSV: {0:?}")]
    TxTags(PathBuf, #[source] TagsError),

    #[error("Unable to load price DB")]
    PriceDb(#[from] PriceDbError),

    #[error("Store error, unable to read {0:?}")]
    InputStore(PathBuf, #[source] StoreError),

    #[error("Store error, unable to write {0:?}")]
    OutputStore(PathBuf, #[source] StoreError),

    #[error("Esplora client error")]
    EsploraClient(#[from] EsploraClientError),

    #[error("Error parsing CACHE_TTL_SECS")]
    CacheTtl(#[source] std::num::ParseIntError),

    #[error("Unable to locate user cache directory")]
    CacheDir,

    #[error("Unable to write raw transaction memo: `{0:?}`")]
    MemoWrite(PathBuf, #[source] StoreError),

    #[error("Unable to rename raw transaction memo: `{0:?}`")]
    MemoRename(PathBuf, #[source] std::io::Error),

    #[error("Unable to write report: {0:?}")]
    Report(PathBuf, #[source] serde_json::Error),
}

/// Everything computed in one run.
#[derive(Debug, Serialize)]
struct Report {
    wallets: BTreeMap<String, WalletStats>,
    edges: Vec<Edge>,
    trace_stats: TraceStats,
    trees: Vec<TransactionTree>,
    tree_summaries: Vec<TreeSummary>,
    focus: Option<FocusTree>,
    flows: Vec<UtxoFlow>,
    wallet_flows: Vec<WalletFlowTree>,
    wallet_flow_summaries: Vec<WalletFlowSummary>,
    flow_chains: Vec<TransactionTree>,
    transactions: Vec<basis::Transaction>,
    cost_basis: TransactionSummary,
    skipped: Vec<String>,
}

/// Price sources consulted in order.
#[derive(Default)]
struct Prices {
    sources: Vec<Box<dyn PriceLookup>>,
}

impl PriceLookup for Prices {
    fn get_price(&self, date: NaiveDate) -> Option<Decimal> {
        self.sources
            .iter()
            .find_map(|source| source.get_price(date))
    }
}

fn main() -> ExitCode {
    // Initialize the tracing subscriber for instrumentation.
    // Uses the `RUST_LOG` environment var for configuration. E.g. `RUST_LOG=debug cargo run`
    //
    // See: https://docs.rs/tracing-subscriber/latest/tracing_subscriber/struct.EnvFilter.html#directives
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let term_color = env::var("TERM_COLOR")
        .map(|color| color == "always")
        .unwrap_or_else(|_| std::io::stdout().is_terminal());
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_ansi(term_color))
        .with(env_filter)
        .init();

    match run(onlyargs::parse()) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            for source in err.sources().skip(1) {
                eprintln!("  Caused by: {source}");
            }

            ExitCode::FAILURE
        }
    }
}

fn run(args: Result<Args, CliError>) -> Result<(), Error> {
    let args = args?;

    // Find user's cache directory and make sure it exists.
    let project_dir =
        ProjectDirs::from("design.contract", "DCD", "utxotrace").ok_or(Error::CacheDir)?;
    let cache_dir = project_dir.cache_dir();
    fs::create_dir_all(cache_dir)?;
    let memo_path = cache_dir.join(RAW_TX_MEMO);

    let mut store = match &args.input_store {
        Some(path) => MemoryStore::load(path).map_err(|err| Error::InputStore(path.clone(), err))?,
        None => MemoryStore::new(),
    };
    if let Some(memo) = read_memo(&memo_path) {
        store.merge_raw_cache(memo);
    }

    for path in &args.input_wallet {
        let records = wallet::read_wallet(path).map_err(|err| Error::Wallet(path.clone(), err))?;
        let added = store.add_records(records);
        debug!("Added {added} records from {path:?}");
    }
    for path in &args.input_network {
        let records = wallet::read_network(path).map_err(|err| Error::Wallet(path.clone(), err))?;
        let added = store.add_records(records);
        debug!("Added {added} records from {path:?}");
    }

    let mut book = AddressBook::default();
    for path in &args.input_addresses {
        book.extend(wallet::read_addresses(path).map_err(|err| Error::Address(path.clone(), err))?);
    }

    let mut tx_tags = tags::TxTags::new();
    for path in &args.input_tx_tags {
        tx_tags.extend(tags::read_tx_tags(path).map_err(|err| Error::TxTags(path.clone(), err))?);
    }

    let records = store.list_all_transactions();
    let groups = trace::group_transactions(&records);
    info!(
        "Loaded {} records in {} transactions",
        records.len(),
        groups.len()
    );

    let wallets = wallet_stats(&records);
    if args.verbose {
        for (name, stats) in &wallets {
            println!("{name}: {stats:#?}");
        }
    }

    let mut prices = Prices::default();
    if let Some(path) = &args.price_db {
        prices.sources.push(Box::new(PriceDb::new(path)?));
    }
    if args.fetch_prices {
        let missing: Vec<_> = groups
            .iter()
            .map(|group| group.date.date_naive())
            .filter(|&date| prices.get_price(date).is_none())
            .collect();
        let yahoo = YahooPriceClient::new(Arc::new(TtlCache::new(PRICE_TTL)));
        prices.sources.push(Box::new(yahoo.prefetch(missing)));
    }

    // Blockchain data is needed for exact tracing and for wallet flows.
    let mut skipped = Vec::new();
    let mut tip_height = None;
    let raw = if args.exact || !book.is_empty() {
        let client = esplora_client()?;
        let hosts: Vec<_> = client.hosts().collect();
        info!("Resolving transactions with {}", hosts.join(", "));
        tip_height = client.tip_height();

        let txids: Vec<_> = groups.iter().map(|group| group.txid.clone()).collect();
        let resolved = resolve_raw_transactions(&client, &mut store, &txids);
        skipped = resolved.skipped;

        write_memo(cache_dir, &memo_path, &store)?;

        Some(resolved.transactions)
    } else {
        None
    };

    let opts = TraceOptions {
        use_real_blockchain_data: args.exact,
        max_depth: args.max_depth,
        max_path_length: args.max_path_length,
    };
    let edges = trace::trace_relationships(&groups, &opts, raw.as_ref());
    if args.verbose {
        edges.stats().pretty_print();
    }

    let build_opts = BuildOptions {
        allow_overlapping_roots: !args.strict_roots,
    };
    let mut trees = tree::build_trees(&groups, &edges, &build_opts);
    tree::backfill_prices(&mut trees, &prices);

    let tree_summaries: Vec<_> = trees.iter().map(TransactionTree::summarize).collect();
    for summary in &tree_summaries {
        println!(
            "{} ({} transactions): {}",
            summary.root_id, summary.node_count, summary.description
        );
    }

    let focus = args.focus.as_deref().and_then(|txid| {
        let focus = tree::focus_tree(txid, &groups, &edges, &opts);
        if focus.is_none() {
            warn!("Focus transaction `{txid}` is not in the input");
        }

        focus
    });
    if let Some(focus) = &focus {
        print_focus(focus);
    }

    let flows = match &raw {
        Some(raw) => flow::build_flows(raw.values(), &book),
        None => Vec::new(),
    };
    let wallet_flows = tree::build_wallet_flow_trees(&flows);
    let wallet_flow_summaries: Vec<_> = wallet_flows
        .iter()
        .map(|wallet_flow| flow::wallet_summary(&flows, &wallet_flow.wallet))
        .collect();
    let flow_chains = tree::build_flow_chains(&flows, opts.max_depth);
    if args.verbose {
        for summary in &wallet_flow_summaries {
            println!("{summary:#?}");
        }
    }

    let mut transactions = basis::records_to_transactions(&records, &tx_tags, &prices);
    if let Some(raw) = &raw {
        basis::apply_block_status(&mut transactions, raw, tip_height);
    }
    let transactions = basis::compute_cost_basis(transactions);
    let cost_basis = basis::summarize_transactions(&transactions);
    println!();
    print!("{cost_basis}");

    if let Some(path) = &args.output_store {
        store
            .save(path)
            .map_err(|err| Error::OutputStore(path.clone(), err))?;
    }

    if let Some(path) = &args.output {
        let report = Report {
            wallets,
            edges: edges.iter().cloned().collect(),
            trace_stats: edges.stats().clone(),
            trees,
            tree_summaries,
            focus,
            flows,
            wallet_flows,
            wallet_flow_summaries,
            flow_chains,
            transactions,
            cost_basis,
            skipped,
        };
        write_report(path, &report)?;
    }

    Ok(())
}

fn esplora_client() -> Result<EsploraClient, Error> {
    let servers: Vec<String> = env::var("ESPLORA_URL")
        .unwrap_or_else(|_| DEFAULT_ESPLORA_URL.to_string())
        .split(',')
        .map(str::trim)
        .filter(|server| !server.is_empty())
        .map(str::to_string)
        .collect();
    let ttl = match env::var("CACHE_TTL_SECS") {
        Ok(secs) => secs.parse().map_err(Error::CacheTtl)?,
        Err(_) => DEFAULT_CACHE_TTL_SECS,
    };

    Ok(EsploraClient::new(
        &servers,
        Arc::new(TtlCache::new(Duration::from_secs(ttl))),
    )?)
}

fn read_memo(path: &Path) -> Option<MemoryStore> {
    if !path.exists() {
        return None;
    }

    debug!("Reading raw transaction memo from {path:?}");
    match MemoryStore::load(path) {
        Ok(memo) => Some(memo),
        Err(err) => {
            warn!("Ignoring raw transaction memo {path:?}: {err}");
            None
        }
    }
}

fn write_memo(cache_dir: &Path, path: &Path, store: &MemoryStore) -> Result<(), Error> {
    let temp = cache_dir.join(TEMP_MEMO);
    debug!("Writing temporary raw transaction memo to {temp:?}");

    store
        .raw_cache()
        .save(&temp)
        .map_err(|err| Error::MemoWrite(temp.clone(), err))?;

    debug!("Renaming temporary raw transaction memo to {path:?}");
    fs::rename(temp, path).map_err(|err| Error::MemoRename(path.to_path_buf(), err))
}

fn write_report(path: &Path, report: &Report) -> Result<(), Error> {
    debug!("Writing report to {path:?}");

    let file = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(file, report).map_err(|err| Error::Report(path.to_path_buf(), err))
}

fn print_focus(focus: &FocusTree) {
    let mut levels: Vec<_> = focus.nodes.iter().map(|node| node.level).collect();
    levels.sort_unstable();
    levels.dedup();

    println!();
    println!("Focus on {}", focus.focus().txid);
    for level in levels {
        for node in focus.level(level) {
            println!(
                "{level:+3} {:?} {} {} sats {}",
                node.kind,
                node.txid,
                node.amount,
                node.date.format("%Y-%m-%d")
            );
        }
    }

    let stats = &focus.stats;
    println!(
        "Value change: {} sats ({}%) across {} transactions and {} wallets",
        stats.value_change, stats.value_change_percent, stats.transaction_count, stats.wallet_count
    );
    println!();
}
