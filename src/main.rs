//
// Copyright (C) 2026 the flashback-replay authors
// Licensed under the GNU General Public License v3.0 or later
//

// -----------------------------------------------------------------------------
// flashback - replay recorded MongoDB workloads against live deployments
// -----------------------------------------------------------------------------

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{fmt, EnvFilter};

use flashback::dispatcher::{stress_dispatcher, timed_dispatcher};
use flashback::mongo::MongoDialer;
use flashback::op::OpType;
use flashback::reader::{CyclicOpsReader, FileOpsReader, OpsReader};
use flashback::replay::{run_replay, NodeSpec, ReplayConfig, REPORT_INTERVAL};

/// How to schedule the recorded ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Style {
    /// Replay ops as fast as the workers accept them.
    Stress,
    /// Replay ops honoring their recorded timestamps.
    Real,
}

#[derive(Parser)]
#[command(
    name = "flashback",
    version,
    about = "Replay a recorded MongoDB workload against live deployments and compare per-node latency"
)]
struct Cli {
    /// The file of serialized ops generated by the record scripts.
    #[arg(long = "ops_filename")]
    ops_filename: PathBuf,

    /// The baseline database server, <host>[:<port>].
    #[arg(long, default_value = "localhost:27017")]
    url: String,

    /// A challenger database configured with different parameters; ops are
    /// sent to it and the baseline simultaneously. Only in "real" style.
    #[arg(long = "challenger_url")]
    challenger_url: Option<String>,

    /// A second challenger. Only in "real" style.
    #[arg(long = "challenger_url2")]
    challenger_url2: Option<String>,

    /// A third challenger. Only in "real" style.
    #[arg(long = "challenger_url3")]
    challenger_url3: Option<String>,

    /// How to replay the ops.
    #[arg(long, value_enum)]
    style: Style,

    /// Pacing multiplier for "real" style; 2 sends ops twice as fast.
    #[arg(long, default_value_t = 1.0)]
    speedup: f64,

    /// In "real" style, cycle through the trace indefinitely.
    #[arg(long)]
    cyclic: bool,

    /// Number of workers sending ops to the databases.
    #[arg(long, default_value_t = 10)]
    workers: usize,

    /// Maximum number of ops to replay; 0 replays the whole trace.
    #[arg(long = "maxOps", default_value_t = 0)]
    max_ops: u64,

    /// Skip the first N ops.
    #[arg(long = "numSkipOps", default_value_t = 0)]
    num_skip_ops: usize,

    /// Socket timeout in nanoseconds.
    #[arg(long = "socketTimeout", default_value_t = 60_000_000_000)]
    socket_timeout_ns: u64,

    /// Log every op that takes longer than this many milliseconds on any
    /// node. 0 disables slow-op logging.
    #[arg(long = "slow_op_threshold_ms", default_value_t = 0)]
    slow_op_threshold_ms: u64,

    /// Print op errors and other verbose information.
    #[arg(long)]
    verbose: bool,

    /// Unix timestamp in milliseconds (i.e. 1396456709419) of the first op
    /// to replay. Otherwise, play from the top.
    #[arg(long = "start_time", default_value_t = 0)]
    start_time: i64,

    /// Write regular log messages to this file instead of stdout.
    #[arg(long)]
    stdout: Option<PathBuf>,

    /// Write error and warning log messages to this file instead of stderr.
    #[arg(long)]
    stderr: Option<PathBuf>,

    /// Stats analyzer output for the baseline, one line per interval.
    #[arg(long = "statsfilename")]
    stats_filename: Option<PathBuf>,

    /// Stats analyzer output for the challenger.
    #[arg(long = "challenger_statsfilename")]
    challenger_stats_filename: Option<PathBuf>,

    /// Stats analyzer output for challenger2.
    #[arg(long = "challenger_statsfilename2")]
    challenger_stats_filename2: Option<PathBuf>,

    /// Stats analyzer output for challenger3.
    #[arg(long = "challenger_statsfilename3")]
    challenger_stats_filename3: Option<PathBuf>,

    /// Only replay ops of this type.
    #[arg(long = "op_filter")]
    op_filter: Option<String>,
}

impl Cli {
    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("the `workers` argument must be a positive number");
        }
        if self.speedup <= 0.0 {
            bail!("the `speedup` argument must be greater than zero");
        }
        if self.style == Style::Stress {
            if self.cyclic {
                bail!("cyclic replay is only supported in \"real\" style");
            }
            if self.challenger_url.is_some()
                || self.challenger_url2.is_some()
                || self.challenger_url3.is_some()
            {
                bail!("challenger urls are only supported in \"real\" style");
            }
        }
        Ok(())
    }

    fn nodes(&self) -> Vec<NodeSpec> {
        let mut specs = vec![NodeSpec {
            name: "default".to_string(),
            url: self.url.clone(),
            stats_path: self.stats_filename.clone(),
        }];
        let challengers = [
            ("challenger", &self.challenger_url, &self.challenger_stats_filename),
            ("challenger2", &self.challenger_url2, &self.challenger_stats_filename2),
            ("challenger3", &self.challenger_url3, &self.challenger_stats_filename3),
        ];
        for (name, url, stats_path) in challengers {
            if let Some(url) = url {
                specs.push(NodeSpec {
                    name: name.to_string(),
                    url: url.clone(),
                    stats_path: stats_path.clone(),
                });
            }
        }
        specs
    }
}

fn init_logging(cli: &Cli) -> Result<()> {
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::new(format!("flashback={}", level));

    let open = |path: &PathBuf| -> Result<Mutex<File>> {
        let file = File::create(path)
            .with_context(|| format!("failed to create log file {}", path.display()))?;
        Ok(Mutex::new(file))
    };

    match (&cli.stdout, &cli.stderr) {
        (None, None) => fmt().with_env_filter(filter).init(),
        (Some(out), None) => fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(open(out)?)
            .init(),
        (None, Some(err)) => fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(
                open(err)?
                    .with_max_level(tracing::Level::WARN)
                    .or_else(std::io::stdout),
            )
            .init(),
        (Some(out), Some(err)) => fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(
                open(err)?
                    .with_max_level(tracing::Level::WARN)
                    .or_else(open(out)?),
            )
            .init(),
    }
    Ok(())
}

fn make_reader(cli: &Cli) -> Result<Box<dyn OpsReader>> {
    let op_filter = cli
        .op_filter
        .as_deref()
        .map(str::parse::<OpType>)
        .transpose()
        .context("invalid op_filter")?;

    let mut reader: Box<dyn OpsReader> = if cli.style == Style::Real && cli.cyclic {
        let path = cli.ops_filename.clone();
        Box::new(CyclicOpsReader::new(move || {
            Ok(Box::new(FileOpsReader::open(&path, op_filter)?) as Box<dyn OpsReader>)
        })?)
    } else {
        Box::new(FileOpsReader::open(&cli.ops_filename, op_filter)?)
    };

    if cli.start_time > 0 {
        let skipped = reader.set_start_time(cli.start_time)?;
        info!(skipped, start_time = cli.start_time, "positioned trace at start time");
    }
    if cli.num_skip_ops > 0 {
        reader.skip_ops(cli.num_skip_ops)?;
        info!(skipped = cli.num_skip_ops, "skipped leading ops");
    }
    Ok(reader)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.validate()?;
    init_logging(&cli)?;

    let reader = make_reader(&cli)?;
    let ops_rx = match cli.style {
        Style::Stress => stress_dispatcher(reader, cli.max_ops),
        Style::Real => timed_dispatcher(reader, cli.max_ops, cli.speedup),
    };

    let cfg = ReplayConfig {
        workers: cli.workers,
        slow_op_threshold: (cli.slow_op_threshold_ms > 0)
            .then(|| Duration::from_millis(cli.slow_op_threshold_ms)),
        verbose: cli.verbose,
        report_interval: REPORT_INTERVAL,
    };
    let dialer = Arc::new(MongoDialer::new(Duration::from_nanos(cli.socket_timeout_ns)));

    let ops_executed = run_replay(cfg, cli.nodes(), ops_rx, dialer).await?;
    info!(ops_executed, "replay finished");
    Ok(())
}
