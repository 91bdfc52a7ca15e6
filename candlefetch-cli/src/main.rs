//! candlefetch CLI: chunked candle retrieval and broker inspection.
//!
//! Commands:
//! - `plan`: print the chunk plan for a retrieval without touching the network
//! - `fetch`: run the retrieval, report chunk progress, optionally write the rows
//! - `accounts`: list accounts visible to the token
//! - `symbols`: list tradeable instruments
//! - `prices`: current quotes
//! - `ticks`: stream live ticks for a number of seconds

use anyhow::{bail, Context, Result};
use candlefetch_core::config::{CandlefetchConfig, FetchConfig};
use candlefetch_core::data::{
    BrokerSession, CandleFetcher, CandleQuery, CandleSink, ChunkRequest, CollectingSink,
    FetchError, OandaSession, ParserStats, RowBuffer, FAVORITE_SYMBOLS,
};
use candlefetch_core::domain::{FeedVariant, Granularity, TimeRange};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "candlefetch",
    about = "candlefetch: chunked, streaming candle retrieval"
)]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// API token; overrides broker.token from the config file.
    #[arg(long, global = true, env = "CANDLEFETCH_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct QueryArgs {
    /// Instrument, e.g. EUR_USD.
    #[arg(long)]
    symbol: String,

    /// Candle granularity (S5 … W, M).
    #[arg(long, default_value = "M1")]
    granularity: Granularity,

    /// Range start (RFC 3339 or YYYY-MM-DD).
    #[arg(long)]
    from: String,

    /// Range end (RFC 3339 or YYYY-MM-DD). Defaults to now.
    #[arg(long)]
    until: Option<String>,

    /// Upper bound on the number of candles.
    #[arg(long)]
    count: Option<u32>,

    /// Feed variant: bid or bid_ask. Defaults to fetch.feed from the config.
    #[arg(long)]
    feed: Option<FeedVariant>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the chunk plan for a retrieval.
    Plan {
        #[command(flatten)]
        query: QueryArgs,
    },
    /// Fetch candles through the chunked streaming pipeline.
    Fetch {
        #[command(flatten)]
        query: QueryArgs,

        /// Sort buffers by the time of their first row before writing.
        #[arg(long, default_value_t = false)]
        sort: bool,

        /// Write the concatenated binary rows to this file.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// List accounts visible to the token.
    Accounts,
    /// List tradeable instruments.
    Symbols,
    /// Show current prices. Defaults to the favorite symbols.
    Prices { symbols: Vec<String> },
    /// Stream live ticks. Defaults to the favorite symbols.
    Ticks {
        symbols: Vec<String>,

        /// Stop after this many seconds.
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref(), cli.token)?;

    match cli.command {
        Commands::Plan { query } => run_plan(&config, &query),
        Commands::Fetch {
            query,
            sort,
            output,
        } => run_fetch(&config, &query, sort, output),
        Commands::Accounts => run_accounts(&config),
        Commands::Symbols => run_symbols(&config),
        Commands::Prices { symbols } => run_prices(&config, &or_favorites(symbols)),
        Commands::Ticks { symbols, seconds } => run_ticks(&config, &or_favorites(symbols), seconds),
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "candlefetch=info,candlefetch_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(path: Option<&PathBuf>, token: Option<String>) -> Result<CandlefetchConfig> {
    let mut config = match path {
        Some(path) => CandlefetchConfig::from_file(path)?,
        None => CandlefetchConfig::default(),
    };
    if let Some(token) = token {
        config.broker.token = token;
    }
    Ok(config)
}

fn connect(config: &CandlefetchConfig) -> Result<Arc<OandaSession>> {
    config.require_token()?;
    Ok(Arc::new(OandaSession::new(config.broker.clone())?))
}

fn or_favorites(symbols: Vec<String>) -> Vec<String> {
    if symbols.is_empty() {
        FAVORITE_SYMBOLS.iter().map(|s| s.to_string()).collect()
    } else {
        symbols
    }
}

/// Accepts RFC 3339 timestamps or bare dates (midnight UTC).
fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("invalid time '{s}': expected RFC 3339 or YYYY-MM-DD"))?;
    match date.and_hms_opt(0, 0, 0) {
        Some(midnight) => Ok(midnight.and_utc()),
        None => bail!("invalid date '{s}'"),
    }
}

fn build_query(args: &QueryArgs) -> Result<CandleQuery> {
    let from = parse_time(&args.from)?;
    let until = match &args.until {
        Some(s) => parse_time(s)?,
        None => Utc::now(),
    };
    if from > until {
        bail!("--from ({from}) must not be after --until ({until})");
    }
    Ok(CandleQuery {
        symbol: args.symbol.clone(),
        granularity: args.granularity,
        range: TimeRange::new(from, until),
        desired_count: args.count,
    })
}

fn fetch_config(config: &CandlefetchConfig, args: &QueryArgs) -> FetchConfig {
    let mut fetch = config.fetch;
    if let Some(feed) = args.feed {
        fetch.feed = feed;
    }
    fetch
}

fn run_plan(config: &CandlefetchConfig, args: &QueryArgs) -> Result<()> {
    let query = build_query(args)?;
    let plan = candlefetch_core::data::plan(
        &query.symbol,
        query.granularity,
        query.range,
        query.desired_count,
        config.fetch.per_request_limit,
    )?;

    println!(
        "{} {}: {} chunk(s), {} row(s), limit {}",
        query.symbol,
        query.granularity,
        plan.len(),
        plan.total_rows(),
        plan.per_request_limit()
    );
    if plan.is_empty() {
        return Ok(());
    }
    println!("{:>5}  {:<25} {:<25} {:>6}", "Chunk", "From", "Until", "Rows");
    println!("{}", "-".repeat(65));
    for chunk in plan.iter() {
        println!(
            "{:>5}  {:<25} {:<25} {:>6}",
            chunk.index,
            chunk.from.to_rfc3339(),
            chunk.until.to_rfc3339(),
            chunk.row_count_estimate
        );
    }
    Ok(())
}

/// Prints one line per finished chunk. Buffers are only retained when they
/// will be written out; otherwise rows are counted and dropped.
struct StdoutProgress {
    total: usize,
    rows: AtomicUsize,
    kept: Option<CollectingSink>,
}

impl StdoutProgress {
    fn new(total: usize, keep_buffers: bool) -> Self {
        Self {
            total,
            rows: AtomicUsize::new(0),
            kept: keep_buffers.then(CollectingSink::new),
        }
    }

    fn row_count(&self) -> usize {
        self.rows.load(Ordering::SeqCst)
    }
}

impl CandleSink for StdoutProgress {
    fn on_data(&self, chunk: &ChunkRequest, buffer: RowBuffer) {
        self.rows.fetch_add(buffer.row_count(), Ordering::SeqCst);
        if let Some(kept) = &self.kept {
            kept.on_data(chunk, buffer);
        }
    }

    fn on_chunk_complete(&self, chunk: &ChunkRequest, result: Result<&ParserStats, &FetchError>) {
        match result {
            Ok(stats) => println!(
                "[{}/{}] OK: {} rows, {} bytes ({} → {})",
                chunk.index + 1,
                self.total,
                stats.rows_emitted,
                stats.bytes_seen,
                chunk.from.to_rfc3339(),
                chunk.until.to_rfc3339()
            ),
            Err(e) => println!("[{}/{}] FAIL: {e}", chunk.index + 1, self.total),
        }
    }

    fn on_done(&self, _error: Option<&FetchError>, _buffers_emitted: usize) {}
}

fn run_fetch(
    config: &CandlefetchConfig,
    args: &QueryArgs,
    sort: bool,
    output: Option<PathBuf>,
) -> Result<()> {
    let query = build_query(args)?;
    let session = connect(config)?;
    let fetcher = CandleFetcher::new(session.clone(), fetch_config(config, args));

    let plan = fetcher.plan(&query)?;
    let sink = Arc::new(StdoutProgress::new(plan.len(), output.is_some()));

    let started = Instant::now();
    let handle = fetcher.fetch_candles(&query, sink.clone())?;
    let outcome = handle.wait();
    session.close();

    println!(
        "\nFetch complete: {} chunk(s), {} buffer(s), {} row(s) in {:.2}s",
        outcome.chunks,
        outcome.buffers_emitted,
        sink.row_count(),
        started.elapsed().as_secs_f64()
    );

    if let (Some(path), Some(kept)) = (output, &sink.kept) {
        let buffers: Vec<RowBuffer> = if sort {
            kept.sorted_by_time()
        } else {
            kept.take_buffers().into_iter().map(|(_, b)| b).collect()
        };
        let bytes: Vec<u8> = buffers.iter().flat_map(|b| b.as_bytes().iter().copied()).collect();
        std::fs::write(&path, &bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("Wrote {} bytes to {}", bytes.len(), path.display());
    }

    if let Some(err) = outcome.error {
        bail!("fetch failed: {err}");
    }
    Ok(())
}

fn run_accounts(config: &CandlefetchConfig) -> Result<()> {
    let session = connect(config)?;
    let accounts = session.accounts()?;
    if accounts.is_empty() {
        println!("No accounts.");
        return Ok(());
    }
    println!("{:<12} {:<24} {:<8} {:>8}", "Account", "Name", "Currency", "Margin");
    println!("{}", "-".repeat(55));
    for a in &accounts {
        println!(
            "{:<12} {:<24} {:<8} {:>8}",
            a.account_id, a.name, a.currency, a.margin_rate
        );
    }
    Ok(())
}

fn run_symbols(config: &CandlefetchConfig) -> Result<()> {
    let session = connect(config)?;
    let mut symbols = session.symbols()?;
    symbols.sort_by(|a, b| a.name.cmp(&b.name));
    for s in &symbols {
        println!("{:<12} {:<32} pip {}", s.name, s.display_name, s.pip);
    }
    println!("\n{} symbol(s)", symbols.len());
    Ok(())
}

fn run_prices(config: &CandlefetchConfig, symbols: &[String]) -> Result<()> {
    let session = connect(config)?;
    let prices = session.current_prices(symbols)?;
    println!("{:<12} {:>12} {:>12}  Time", "Symbol", "Bid", "Ask");
    for p in &prices {
        println!("{:<12} {:>12} {:>12}  {}", p.instrument, p.bid, p.ask, p.time);
    }
    Ok(())
}

fn run_ticks(config: &CandlefetchConfig, symbols: &[String], seconds: u64) -> Result<()> {
    let session = connect(config)?;
    let subscription = session.subscribe_ticks(symbols)?;
    let deadline = Instant::now() + Duration::from_secs(seconds);
    let mut received = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match subscription.recv_timeout(remaining) {
            Ok(tick) => {
                received += 1;
                println!("{:<12} {:>12} {:>12}  {}", tick.instrument, tick.bid, tick.ask, tick.time);
            }
            Err(RecvTimeoutError::Timeout) => break,
            Err(RecvTimeoutError::Disconnected) => {
                tracing::warn!("tick_stream_disconnected");
                break;
            }
        }
    }

    session.unsubscribe_ticks(symbols)?;
    session.close();
    println!("\n{received} tick(s) in {seconds}s");
    Ok(())
}
