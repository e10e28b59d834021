use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::{num::NonZeroUsize, path::PathBuf, sync::Arc};
use tracing_subscriber::EnvFilter;
use xmlscout::{
    config::CliOverrides, Connector, FtpConnector, LocalConnector, MatchMode, Outcome,
    ResultOrder, ResultSink, RunProgress, RunReport, RunStatus, SearchConfig, SearchCoordinator,
    SearchRecord,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Parser)]
struct CliSearchConfig {
    /// Keyword, regular expression or XPath expression (can be specified multiple times)
    #[arg(short = 'k', long = "keyword")]
    keywords: Vec<String>,

    /// How keywords are matched against file contents
    #[arg(short, long, value_enum)]
    mode: Option<ModeArg>,

    /// Match letter case exactly (literal and regex modes)
    #[arg(short = 'c', long)]
    case_sensitive: bool,

    /// Local directory laid out like the remote tree
    #[arg(short = 'd', long)]
    root: Option<PathBuf>,

    /// FTP server to search (overrides server.host)
    #[arg(long)]
    host: Option<String>,

    /// Walk every directory below --root instead of date directories
    #[arg(short, long)]
    recursive: bool,

    /// First date directory to search (YYYY-MM-DD)
    #[arg(long = "from")]
    start_date: Option<NaiveDate>,

    /// Last date directory to search, inclusive (YYYY-MM-DD)
    #[arg(long = "to")]
    end_date: Option<NaiveDate>,

    /// Glob applied to file names (e.g. "TCO_*_KMC_*.xml")
    #[arg(short, long)]
    glob: Option<String>,

    /// File extensions to include (e.g. xml,XML)
    #[arg(short = 'e', long)]
    extensions: Option<String>,

    /// File names to leave out (glob format)
    #[arg(short, long)]
    ignore: Vec<String>,

    /// Number of concurrent workers
    #[arg(short = 'j', long)]
    workers: Option<NonZeroUsize>,

    /// Maximum number of open sessions
    #[arg(long)]
    pool_size: Option<NonZeroUsize>,

    /// Skip files larger than this many bytes
    #[arg(long)]
    max_size: Option<u64>,

    /// Report every hit in a file instead of stopping at the first
    #[arg(short, long)]
    all_hits: bool,

    /// Stop starting new files after this many have matched (0 for no limit)
    #[arg(long)]
    max_results: Option<usize>,

    /// Print results in enumeration order instead of completion order
    #[arg(long)]
    ordered: bool,

    /// Show only statistics, not matches
    #[arg(short, long)]
    stats: bool,

    /// Print one JSON object per file, then the run report
    #[arg(long)]
    json: bool,

    /// Path to a config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Search XML files in a range of date directories
    Search(Box<CliSearchConfig>),

    /// Print the effective configuration
    Config {
        /// Path to a config file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Literal,
    Regex,
    Xpath,
}

impl From<ModeArg> for MatchMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Literal => MatchMode::Literal,
            ModeArg::Regex => MatchMode::Regex,
            ModeArg::Xpath => MatchMode::Xpath,
        }
    }
}

fn main() -> Result<()> {
    run()
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Search(args) => search(*args),
        Commands::Config { config } => {
            let config = SearchConfig::load_from(config.as_deref())?;
            print!("{}", config.to_yaml()?);
            Ok(())
        }
    }
}

fn search(args: CliSearchConfig) -> Result<()> {
    let overrides = CliOverrides {
        keywords: args.keywords,
        mode: args.mode.map(MatchMode::from),
        case_sensitive: args.case_sensitive,
        all_hits: args.all_hits,
        start_date: args.start_date,
        end_date: args.end_date,
        filename_glob: args.glob,
        max_workers: args.workers,
        pool_size: args.pool_size,
        max_file_size: args.max_size,
        local_root: args.root,
        result_order: args.ordered.then_some(ResultOrder::Candidate),
        max_results: args.max_results,
        recursive: args.recursive,
        log_level: args.log_level,
    };

    let mut config = SearchConfig::load_from(args.config.as_deref())?.merge_with_cli(overrides);
    if let Some(extensions) = args.extensions {
        config.search.file_extensions = Some(
            extensions
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        );
    }
    if !args.ignore.is_empty() {
        config.search.ignore_patterns = args.ignore;
    }
    if let Some(host) = args.host {
        config.server.host = host;
        config.server.local_root = None;
    }

    init_logging(&config.log_level);
    config.validate()?;

    let connector = connector_for(&config)?;
    let coordinator = SearchCoordinator::new(connector, config);

    let printer = RecordPrinter::new(args.stats, args.json);
    let progress = printer.progress.clone();
    let report = coordinator.run(printer);
    progress.finish_and_clear();

    if args.json {
        println!(
            "{}",
            serde_json::to_string(&report).context("failed to serialize run report")?
        );
    } else {
        print_summary(&report);
    }

    match report.status {
        RunStatus::Failed { reason } => bail!("search failed: {}", reason),
        _ => Ok(()),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // Logs go to stderr so `--json` output stays machine-readable
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn connector_for(config: &SearchConfig) -> Result<Arc<dyn Connector>> {
    match &config.server.local_root {
        Some(root) => Ok(Arc::new(LocalConnector::new(root))),
        None if config.server.host.is_empty() => {
            bail!("no server configured; pass --host or --root, or set server.host")
        }
        None => Ok(Arc::new(FtpConnector::new(&config.server, &config.pool))),
    }
}

/// Prints records as the coordinator hands them over
struct RecordPrinter {
    stats_only: bool,
    json: bool,
    progress: ProgressBar,
}

impl RecordPrinter {
    fn new(stats_only: bool, json: bool) -> Self {
        let progress = if json {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(0)
        };
        progress.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} files")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        Self {
            stats_only,
            json,
            progress,
        }
    }

    fn print_record(&self, record: &SearchRecord) {
        if self.json {
            match serde_json::to_string(record) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!("Could not serialize {}: {}", record.candidate.remote_path, e),
            }
            return;
        }

        let path = &record.candidate.remote_path;
        match &record.outcome {
            Outcome::Matched(hits) => {
                println!("\n{}", path.blue());
                for hit in hits {
                    let position = match hit.line {
                        Some(line) => line.to_string(),
                        None => format!("@{}", hit.offset),
                    };
                    println!(
                        "{}: [{}] {}",
                        position.green(),
                        hit.term.yellow(),
                        hit.snippet.trim()
                    );
                }
            }
            Outcome::Skipped(reason) => println!("{}: {}", path, format!("skipped, {}", reason).yellow()),
            Outcome::Failed(error) => println!("{}: {}", path, format!("failed, {}", error.message).red()),
            Outcome::NoMatch | Outcome::Cancelled => {}
        }
    }
}

impl ResultSink for RecordPrinter {
    fn on_record(&mut self, record: SearchRecord) {
        if self.stats_only && !self.json {
            return;
        }
        self.progress.suspend(|| self.print_record(&record));
    }

    fn on_progress(&mut self, progress: &RunProgress) {
        self.progress.set_length(progress.total as u64);
        self.progress.set_position(progress.counters.finished() as u64);
    }
}

fn print_summary(report: &RunReport) {
    let counters = &report.counters;
    println!(
        "\nFound {} matching files in {} scanned ({} skipped, {} errors) of {} candidates",
        counters.matched, counters.scanned, counters.skipped, counters.errors, report.total_candidates
    );
    for failure in &report.enumeration_errors {
        println!("{}", failure.to_string().red());
    }
    match &report.status {
        RunStatus::Completed => {}
        RunStatus::Cancelled => println!("{}", "Search cancelled".yellow()),
        RunStatus::LimitReached => println!(
            "{}",
            format!("Stopped after {} matching files", counters.matched).yellow()
        ),
        RunStatus::Failed { reason } => println!("{}", reason.red()),
    }
    if !report.is_completed() {
        return;
    }
    let transfer = &report.transfer;
    println!(
        "Read {} bytes from {} files over {} connections (peak {} in use) in {}",
        transfer.bytes_read,
        transfer.files_opened,
        transfer.connections_opened,
        report.peak_connections,
        format!("{:.2}s", report.elapsed.as_secs_f64())
    );
}
