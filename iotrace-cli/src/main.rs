//! iotrace CLI - Command-line tools for replaying, merging and inspecting traces

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use iotrace_core::config::{BackendConfig, IoTraceConfig, PathRewrite};
use iotrace_core::merge::{merge_directory, open_directory};
use iotrace_core::replay::{ReplayOutcome, ReplayReport, Replayer};
use iotrace_core::trace::{
    Record, RecordSource, SplitReader, TraceReader, TraceSummary, TraceWriter,
};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the merged trace inside the merge output directory
const MERGED_TRACE: &str = "merged.log";

#[derive(Parser)]
#[command(name = "iotrace")]
#[command(about = "Capture, merge and replay filesystem-client traces", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file, read in place of IOTRACE_CONFIG_PATH (IOTRACE_*
    /// variables still override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a trace against a filesystem
    Replay {
        /// Trace file (the log stream when --index is given)
        trace: PathBuf,

        /// Length index of a split trace
        #[arg(long)]
        index: Option<PathBuf>,

        #[command(flatten)]
        target: Target,

        #[command(flatten)]
        options: ReplayOptions,
    },
    /// Merge every trace in a directory into <OUT_DIR>/merged.log
    Merge {
        /// Directory holding per-process traces
        dir: PathBuf,

        /// Output directory
        out_dir: PathBuf,

        /// Replay the merged stream instead of writing it
        #[arg(long)]
        replay: bool,

        #[command(flatten)]
        target: OptionalTarget,

        #[command(flatten)]
        options: ReplayOptions,
    },
    /// Summarize a trace
    Inspect {
        /// Trace file (the log stream when --index is given)
        trace: PathBuf,

        /// Length index of a split trace
        #[arg(long)]
        index: Option<PathBuf>,

        /// Print every record
        #[arg(short, long)]
        verbose: bool,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Rewrite a split log/index trace as a framed trace
    Convert {
        /// Log stream
        log: PathBuf,
        /// Length index
        index: PathBuf,
        /// Framed output trace
        out: PathBuf,
    },
    /// Version information
    Version,
}

#[derive(Args)]
struct Target {
    /// Filesystem host
    #[arg(long)]
    host: String,

    /// Filesystem port
    #[arg(long)]
    port: u16,
}

#[derive(Args)]
struct OptionalTarget {
    /// Filesystem host (with --replay)
    #[arg(long, requires = "replay")]
    host: Option<String>,

    /// Filesystem port (with --replay)
    #[arg(long, requires = "replay")]
    port: Option<u16>,
}

#[derive(Args)]
struct ReplayOptions {
    /// One lane for all records, no bandwidth reports
    #[arg(long)]
    sequential: bool,

    /// Reproduce the captured gaps between records
    #[arg(long)]
    wait: bool,

    /// Rewrite OPEN paths starting with FROM to start with TO
    #[arg(long, value_name = "FROM=TO")]
    rewrite_prefix: Option<String>,

    /// Count reads whose size differs from the capture
    #[arg(long)]
    verify: bool,

    /// Let CLOSE run without waiting for earlier READs on other lanes
    #[arg(long)]
    no_close_barrier: bool,

    /// Retire a lane after this long without work
    #[arg(long, value_parser = humantime::parse_duration)]
    idle_timeout: Option<Duration>,

    /// Resolve trace paths beneath this directory (local backend)
    #[arg(long, conflicts_with = "null_backend")]
    root: Option<PathBuf>,

    /// Issue no I/O at all
    #[arg(long)]
    null_backend: bool,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

impl ReplayOptions {
    /// Layer the flags over the loaded configuration
    fn apply(&self, config: &mut IoTraceConfig) -> Result<()> {
        let replay = &mut config.replay;
        replay.sequential |= self.sequential;
        replay.wait |= self.wait;
        replay.verify_reads |= self.verify;
        if self.no_close_barrier {
            replay.close_barrier = false;
        }
        if let Some(timeout) = self.idle_timeout {
            replay.lane_idle_timeout = timeout;
        }
        if let Some(rewrite) = &self.rewrite_prefix {
            replay.path_rewrite = Some(rewrite.parse::<PathRewrite>()?);
        }
        if self.null_backend {
            config.backend = BackendConfig::Null;
        } else if let Some(root) = &self.root {
            config.backend = BackendConfig::Local { root: root.clone() };
        }
        config.validate()?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("iotrace {}", env!("CARGO_PKG_VERSION"));
            println!("iotrace-core {}", iotrace_core::VERSION);
        }
        Commands::Replay {
            trace,
            index,
            target,
            options,
        } => {
            let config = load_config(cli.config.as_deref(), &options)?;
            let source = open_trace(&trace, index.as_deref())?;
            let report = replay(&config, &target.host, target.port, source).await?;
            finish_replay(&report, options.json)?;
        }
        Commands::Merge {
            dir,
            out_dir,
            replay: replay_merged,
            target,
            options,
        } => {
            if replay_merged {
                let (Some(host), Some(port)) = (target.host, target.port) else {
                    bail!("--replay needs --host and --port");
                };
                let config = load_config(cli.config.as_deref(), &options)?;
                let previous = out_dir.join(MERGED_TRACE);
                let (merger, sources) = open_directory(&dir, Some(&previous))?;
                println!("Replaying {} merged traces", sources.len());
                let report = replay(&config, &host, port, merger).await?;
                finish_replay(&report, options.json)?;
            } else {
                std::fs::create_dir_all(&out_dir)
                    .with_context(|| format!("creating {}", out_dir.display()))?;
                let output = out_dir.join(MERGED_TRACE);
                let report = merge_directory(&dir, &output)?;
                for source in &report.sources {
                    println!("  {source}");
                }
                println!(
                    "Merged {} traces, {} records into {}",
                    report.sources.len(),
                    report.records,
                    report.output.display()
                );
            }
        }
        Commands::Inspect {
            trace,
            index,
            verbose,
            json,
        } => {
            let mut source = open_trace(&trace, index.as_deref())?;
            let summary = if verbose {
                TraceSummary::collect_with(&mut source, |n, record| {
                    println!("{}", describe(n, record));
                })
            } else {
                TraceSummary::collect(&mut source)
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&trace, &summary);
            }
            if let Some(record) = summary.premature_end {
                bail!("trace ended prematurely at record #{record}");
            }
        }
        Commands::Convert { log, index, out } => {
            let mut reader = SplitReader::open(&log, &index)?;
            let writer = TraceWriter::create(&out)?;
            let mut converted = 0u64;
            let result = loop {
                match reader.next_record() {
                    Ok(Some(record)) => {
                        writer.append_verbatim(&record)?;
                        converted += 1;
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                }
            };
            writer.close()?;
            println!("Converted {converted} records into {}", out.display());
            if let Err(e) = result {
                bail!("trace ended prematurely at record #{}: {e}", converted + 1);
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>, options: &ReplayOptions) -> Result<IoTraceConfig> {
    let mut config = IoTraceConfig::load_with(path)?;
    options.apply(&mut config)?;
    Ok(config)
}

fn open_trace(trace: &Path, index: Option<&Path>) -> Result<Box<dyn RecordSource>> {
    let source: Box<dyn RecordSource> = match index {
        Some(index) => Box::new(SplitReader::open(trace, index)?),
        None => Box::new(TraceReader::open(trace)?),
    };
    Ok(source)
}

async fn replay<S>(config: &IoTraceConfig, host: &str, port: u16, source: S) -> Result<ReplayReport>
where
    S: RecordSource + 'static,
{
    let backend = config
        .backend
        .connector()
        .connect(host, port)
        .await
        .with_context(|| format!("connecting to {host}:{port}"))?;

    let replayer = Replayer::new(backend.clone(), config.replay.clone());
    let shutdown = replayer.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, draining queued operations");
            shutdown.cancel();
        }
    });

    let report = replayer.replay(source).await;
    backend.disconnect().await;
    Ok(report?)
}

fn finish_replay(report: &ReplayReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        let stats = &report.stats;
        println!("Records dispatched: {}", stats.dispatched);
        println!(
            "File operations:    {} ({} opens, {} reads, {} closes)",
            stats.file_operations(),
            stats.opens,
            stats.reads,
            stats.closes
        );
        println!("Bytes read:         {}", stats.bytes_read);
        println!("Backend errors:     {}", stats.backend_errors);
        println!("Missing handles:    {}", stats.missing_handles);
        if stats.verify_mismatches > 0 {
            println!("Verify mismatches:  {}", stats.verify_mismatches);
        }
        println!("Lanes:              {} spawned, {} retired", stats.lanes_spawned, stats.lanes_retired);
        println!(
            "Elapsed:            {}",
            humantime::format_duration(Duration::from_millis(report.elapsed.as_millis() as u64))
        );
        println!("Throughput:         {:.1} ops/s", report.throughput());
        println!(
            "Bandwidth:          {:.2} MiB/s",
            report.bandwidth() / (1024.0 * 1024.0)
        );
    }

    match &report.outcome {
        ReplayOutcome::Completed => Ok(()),
        ReplayOutcome::Stopped => bail!("replay stopped before the end of the trace"),
        ReplayOutcome::Premature { record, reason } => {
            bail!("trace ended prematurely at record #{record}: {reason}")
        }
    }
}

fn print_summary(trace: &Path, summary: &TraceSummary) {
    println!("Trace:           {}", trace.display());
    println!("Records:         {}", summary.records);
    for (op, count) in &summary.per_operation {
        println!("  {op:<10}     {count}");
    }
    println!("Threads:         {}", summary.threads);
    println!("File operations: {}", summary.file_operations());
    println!(
        "Elapsed:         {}",
        humantime::format_duration(Duration::from_micros(summary.elapsed().as_micros() as u64))
    );
    match summary.throughput_per_ms() {
        Some(rate) => println!("Throughput:      {rate:.3} ops/ms"),
        None => println!("Throughput:      n/a"),
    }
    if let (Some(record), Some(reason)) = (summary.premature_end, &summary.premature_reason) {
        println!("Premature end:   record #{record}: {reason}");
    }
}

fn describe(n: u64, record: &Record) -> String {
    let args = record
        .operation
        .arguments()
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    let mut line = format!(
        "#{n} day={} time={} thread={} {} [{args}]",
        record.day,
        record.time,
        record.thread_id,
        record.kind()
    );
    if let Some(path) = record.operation.path() {
        line.push_str(&format!(" {path}"));
    }
    line
}
