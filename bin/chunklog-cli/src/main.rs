//! Chunklog CLI
//!
//! Command line front end for a local chunklog data directory.

use anyhow::{Context, Result, bail};
use chunklog_common::{EngineConfig, LogId, LogKind};
use chunklog_engine::LogEngine;
use chunklog_meta_store::RedbLogStore;
use chunklog_storage::FsChunkStore;
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "chunklog")]
#[command(about = "Chunked log storage CLI")]
#[command(version)]
struct Args {
    /// Directory holding the metadata database and chunk files
    #[arg(long, env = "CHUNKLOG_DATA_DIR", default_value = "./chunklog-data")]
    data_dir: PathBuf,

    /// Engine configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    Text,
    Json,
}

impl From<KindArg> for LogKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Text => Self::Text,
            KindArg::Json => Self::Json,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new log
    Create {
        /// Owning job
        job_id: String,
        #[arg(long, value_enum, default_value = "text")]
        kind: KindArg,
    },
    /// List all logs
    List,
    /// Show a log's chunk layout and extent
    Info { log_id: LogId },
    /// Append whole lines from a file (or stdin) at the end of the log
    Append {
        log_id: LogId,
        /// Input file, stdin when omitted
        file: Option<PathBuf>,
        /// Byte offset to write at (defaults to the current end)
        #[arg(long, requires = "line")]
        offset: Option<u64>,
        /// Line index of the first line written
        #[arg(long, requires = "offset")]
        line: Option<u32>,
        /// Make the data durable before returning
        #[arg(long)]
        flush: bool,
    },
    /// Follow stdin and append each line until EOF or Ctrl-C
    Ingest { log_id: LogId },
    /// Print a byte range of the log
    Cat {
        log_id: LogId,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long)]
        length: Option<u64>,
    },
    /// Print the byte offset at which a line starts
    LineOffset { log_id: LogId, line: u32 },
    /// Find lines containing a term
    Search {
        log_id: LogId,
        text: String,
        #[arg(long, default_value_t = 0)]
        first_line: u32,
        #[arg(long, default_value_t = 100)]
        max_results: usize,
        /// Print search statistics after the results
        #[arg(long)]
        stats: bool,
    },
    /// Extend the persisted search index over sealed chunks
    Index { log_id: LogId },
    /// Seal and persist buffered data
    Flush {
        /// Only this log
        log_id: Option<LogId>,
    },
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path));
    }
    let config: EngineConfig = builder
        .add_source(
            config::Environment::with_prefix("CHUNKLOG")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("failed to load configuration")?
        .try_deserialize()
        .context("invalid configuration")?;
    Ok(config)
}

async fn open_engine(args: &Args) -> Result<LogEngine> {
    let config = load_config(args.config.as_deref())?;
    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("failed to create {}", args.data_dir.display()))?;

    let meta = RedbLogStore::open(args.data_dir.join("meta.redb"))
        .context("failed to open metadata store")?;
    let chunks = FsChunkStore::new(args.data_dir.join("chunks"));
    let engine = LogEngine::new(config, Arc::new(meta), Arc::new(chunks))?;
    info!("Opened data directory {}", args.data_dir.display());
    Ok(engine)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let engine = open_engine(&args).await?;
    let ticker = engine.start_flush_ticker();
    let result = run(&engine, args.command).await;
    engine.shutdown(Some(ticker)).await?;
    result
}

async fn run(engine: &LogEngine, command: Commands) -> Result<()> {
    match command {
        Commands::Create { job_id, kind } => {
            let log = engine.create_log(&job_id, kind.into()).await?;
            println!("{}", log.id);
        }
        Commands::List => {
            let logs = engine.list_logs().await?;
            if logs.is_empty() {
                println!("No logs");
                return Ok(());
            }
            println!("{:<38} {:<6} {:>7} {:>12}", "ID", "KIND", "CHUNKS", "JOB");
            for log in logs {
                let kind = match log.kind {
                    LogKind::Text => "text",
                    LogKind::Json => "json",
                };
                println!(
                    "{:<38} {:<6} {:>7} {:>12}",
                    log.id,
                    kind,
                    log.chunks.len(),
                    log.job_id
                );
            }
        }
        Commands::Info { log_id } => {
            let log = engine.get_log(log_id).await?;
            let meta = engine.get_metadata(log_id).await?;
            let info = serde_json::json!({
                "log": log,
                "length": meta.length,
                "line_count": meta.line_count,
            });
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Commands::Append {
            log_id,
            file,
            offset,
            line,
            flush,
        } => {
            let data = match file {
                Some(path) => tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("failed to read {}", path.display()))?,
                None => {
                    let mut buf = Vec::new();
                    tokio::io::stdin().read_to_end(&mut buf).await?;
                    buf
                }
            };
            if data.is_empty() {
                bail!("nothing to append");
            }
            let (offset, line) = match (offset, line) {
                (Some(offset), Some(line)) => (offset, line),
                _ => {
                    let meta = engine.get_metadata(log_id).await?;
                    (meta.length, meta.line_count)
                }
            };
            engine.append(log_id, offset, line, &data, flush).await?;
            let meta = engine.get_metadata(log_id).await?;
            println!("{} bytes, {} lines", meta.length, meta.line_count);
        }
        Commands::Ingest { log_id } => ingest(engine, log_id).await?,
        Commands::Cat {
            log_id,
            offset,
            length,
        } => {
            let reader = engine
                .read_range(log_id, offset, length.unwrap_or(u64::MAX))
                .await?;
            let mut slices = std::pin::pin!(reader.into_stream());
            let mut stdout = std::io::stdout().lock();
            while let Some(slice) = slices.next().await {
                stdout.write_all(&slice)?;
            }
            stdout.flush()?;
        }
        Commands::LineOffset { log_id, line } => {
            let (line, offset) = engine.get_line_offset(log_id, line).await?;
            println!("{line} {offset}");
        }
        Commands::Search {
            log_id,
            text,
            first_line,
            max_results,
            stats,
        } => {
            let mut results = engine
                .search(log_id, &text, first_line, max_results)
                .await?;
            while let Some(line) = results.next().await {
                let (_, start) = engine.get_line_offset(log_id, line).await?;
                let (_, end) = engine.get_line_offset(log_id, line + 1).await?;
                let mut reader = engine.read_range(log_id, start, end - start).await?;
                let text = reader.read_to_end().await;
                print!("{line}: {}", String::from_utf8_lossy(&text));
            }
            if stats {
                let s = results.stats();
                eprintln!(
                    "scanned {} bytes / {} lines in {} blocks, skipped {} blocks, {} indexed matches, {:?}",
                    s.scanned_bytes,
                    s.scanned_lines,
                    s.scanned_blocks,
                    s.skipped_blocks,
                    s.indexed_matches,
                    s.elapsed
                );
            }
        }
        Commands::Index { log_id } => match engine.update_index(log_id).await? {
            Some(length) => println!("Index covers {length} bytes"),
            None => println!("Index unchanged"),
        },
        Commands::Flush { log_id } => {
            match log_id {
                Some(log_id) => engine.flush(log_id).await?,
                None => engine.flush_all().await?,
            }
            let stats = engine.cache_stats();
            println!("{} chunks still buffered", stats.chunks);
        }
    }
    Ok(())
}

/// Append stdin line by line until EOF or Ctrl-C
async fn ingest(engine: &LogEngine, log_id: LogId) -> Result<()> {
    let meta = engine.get_metadata(log_id).await?;
    let (mut offset, mut line_index) = (meta.length, meta.line_count);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            next = lines.next_line() => {
                let Some(line) = next? else {
                    break;
                };
                let mut data = line.into_bytes();
                data.push(b'\n');
                engine.append(log_id, offset, line_index, &data, false).await?;
                offset += data.len() as u64;
                line_index += 1;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, flushing");
                break;
            }
        }
    }
    println!("{offset} bytes, {line_index} lines");
    Ok(())
}
