use chrono::{Local, NaiveDate};
use config::{Config as ConfigBuilder, File};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::enumerate::DateRange;
use crate::errors::{SearchError, SearchResult};

/// Upper bound on concurrent workers for one run
pub const MAX_WORKERS: usize = 20;

/// Configuration for a search run.
///
/// # Configuration Locations
///
/// The configuration can be loaded from multiple locations in order of precedence:
/// 1. Custom config file specified via `--config` flag
/// 2. Local `.xmlscout.yaml` in the current directory
/// 3. Global `$HOME/.config/xmlscout/config.yaml`
///
/// # Configuration Format
///
/// ```yaml
/// server:
///   host: "ftp.example.com"
///   port: 21
///   username: "reader"
///
/// pool:
///   size: 4
///   acquire_timeout: "30s"
///   retry_delay: "1s"
///
/// layout:
///   root: "SAMSUNG"
///   send_directory: "Send File"
///
/// search:
///   keywords: ["ERROR_CODE_42"]
///   mode: literal
///   start_date: "2024-03-01"
///   end_date: "2024-03-07"
///   filename_glob: "TCO_*_KMC_*.xml"
///   max_workers: 8
///
/// log_level: "info"
/// ```
///
/// Every section and field has a default, so a partial file is fine.
/// Command-line values take precedence; see `merge_with_cli`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub layout: RemoteLayout,

    #[serde(default)]
    pub search: SearchRequest,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            pool: PoolSettings::default(),
            layout: RemoteLayout::default(),
            search: SearchRequest::default(),
            log_level: default_log_level(),
        }
    }
}

/// Where the remote tree lives and how to log in
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    /// Serve the tree from a local directory instead of a remote host
    pub local_root: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 21,
            username: "anonymous".to_string(),
            password: String::new(),
            local_root: None,
        }
    }
}

/// Connection pool sizing, timeouts and reconnect policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Maximum number of live sessions
    pub size: NonZeroUsize,
    #[serde(with = "duration_format")]
    pub acquire_timeout: Duration,
    #[serde(with = "duration_format")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_format")]
    pub read_timeout: Duration,
    /// Reconnect attempts after the first failed connect
    pub max_retries: u32,
    /// Base delay between reconnect attempts, doubled after each failure
    #[serde(with = "duration_format")]
    pub retry_delay: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: NonZeroUsize::new(10).unwrap_or(NonZeroUsize::MIN),
            acquire_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// How files are arranged below the layout root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partitioning {
    /// `/<root>/<date>/<send_directory>/<file>`, one directory per date
    #[default]
    ByDate,
    /// Any file at any depth below the root; the date range is not used
    #[serde(alias = "recursive")]
    Flat,
}

/// Directory layout of the remote tree: `/<root>/<date>/<send_directory>/`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteLayout {
    pub root: String,
    pub send_directory: String,
    /// `chrono` format string for the date directory names
    pub date_format: String,
    pub partitioning: Partitioning,
}

impl Default for RemoteLayout {
    fn default() -> Self {
        Self {
            root: "SAMSUNG".to_string(),
            send_directory: "Send File".to_string(),
            date_format: "%Y%m%d".to_string(),
            partitioning: Partitioning::default(),
        }
    }
}

/// How file contents are matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Multi-keyword substring search
    #[default]
    #[serde(alias = "text", alias = "literal_set")]
    Literal,
    /// One regular expression per keyword
    #[serde(alias = "pattern")]
    Regex,
    /// Keywords are XPath expressions evaluated against the parsed document
    #[serde(alias = "structured_query")]
    Xpath,
}

/// Order in which result records reach the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultOrder {
    /// As soon as each file finishes
    #[default]
    Completion,
    /// In enumeration order, buffering early finishers
    Candidate,
}

/// Parameters of one search run. Immutable once the run starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchRequest {
    /// Keywords, regular expressions or XPath expressions depending on `mode`
    pub keywords: Vec<String>,
    pub mode: MatchMode,
    pub case_sensitive: bool,
    /// Stop reading a file at its first hit instead of collecting every hit
    pub stop_on_first_match: bool,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Glob applied to file names; empty matches everything
    pub filename_glob: String,
    /// Allowed file extensions; `None` allows all
    pub file_extensions: Option<Vec<String>>,
    /// Glob patterns for file names to leave out
    pub ignore_patterns: Vec<String>,
    pub max_workers: NonZeroUsize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Files declared larger than this are skipped unread
    pub max_file_size: u64,
    /// XPath mode parses files up to this size into a tree, larger ones are streamed
    pub document_parse_limit: u64,
    pub result_order: ResultOrder,
    /// Stop handing out files once this many have matched; 0 means no limit
    pub max_results: usize,
}

impl Default for SearchRequest {
    fn default() -> Self {
        let today = Local::now().date_naive();
        Self {
            keywords: Vec::new(),
            mode: MatchMode::default(),
            case_sensitive: false,
            stop_on_first_match: true,
            start_date: today,
            end_date: today,
            filename_glob: "*.xml".to_string(),
            file_extensions: Some(vec!["xml".to_string()]),
            ignore_patterns: Vec::new(),
            max_workers: default_worker_count(),
            chunk_size: 256 * 1024,
            chunk_overlap: 1024,
            max_file_size: 50 * 1024 * 1024,
            document_parse_limit: 4 * 1024 * 1024,
            result_order: ResultOrder::default(),
            max_results: 0,
        }
    }
}

fn default_worker_count() -> NonZeroUsize {
    NonZeroUsize::new(num_cpus::get().clamp(1, 8)).unwrap_or(NonZeroUsize::MIN)
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl SearchRequest {
    /// Keywords with surrounding whitespace removed and blanks dropped
    pub fn normalized_keywords(&self) -> Vec<String> {
        self.keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn date_range(&self) -> SearchResult<DateRange> {
        DateRange::new(self.start_date, self.end_date)
    }

    /// Checks the invariants a run relies on
    pub fn validate(&self) -> SearchResult<()> {
        if self.normalized_keywords().is_empty() {
            return Err(SearchError::config_error("at least one keyword is required"));
        }
        if self.max_workers.get() > MAX_WORKERS {
            return Err(SearchError::config_error(format!(
                "max_workers must be between 1 and {}, got {}",
                MAX_WORKERS, self.max_workers
            )));
        }
        if self.chunk_size == 0 {
            return Err(SearchError::config_error("chunk_size must be positive"));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(SearchError::config_error(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        self.date_range()?;
        Ok(())
    }
}

/// Values given on the command line. `None` / empty leaves the file value alone.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub keywords: Vec<String>,
    pub mode: Option<MatchMode>,
    pub case_sensitive: bool,
    pub all_hits: bool,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub filename_glob: Option<String>,
    pub max_workers: Option<NonZeroUsize>,
    pub pool_size: Option<NonZeroUsize>,
    pub max_file_size: Option<u64>,
    pub local_root: Option<PathBuf>,
    pub result_order: Option<ResultOrder>,
    pub max_results: Option<usize>,
    /// Walk everything below the local root instead of date directories
    pub recursive: bool,
    pub log_level: Option<String>,
}

impl SearchConfig {
    /// Loads configuration from the default locations
    pub fn load() -> SearchResult<Self> {
        Self::load_from(None)
    }

    /// Loads configuration, layering an explicit file over the default locations
    pub fn load_from(config_path: Option<&Path>) -> SearchResult<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if !path.exists() {
                return Err(SearchError::config_error(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
        }

        let config_files = [
            dirs::config_dir().map(|p| p.join("xmlscout/config.yaml")),
            Some(PathBuf::from(".xmlscout.yaml")),
            config_path.map(PathBuf::from),
        ];

        for path in config_files.iter().flatten() {
            if path.exists() {
                builder = builder.add_source(File::from(path.as_path()));
            }
        }

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Applies command-line values over file values
    pub fn merge_with_cli(mut self, cli: CliOverrides) -> Self {
        if !cli.keywords.is_empty() {
            self.search.keywords = cli.keywords;
        }
        if let Some(mode) = cli.mode {
            self.search.mode = mode;
        }
        if cli.case_sensitive {
            self.search.case_sensitive = true;
        }
        if cli.all_hits {
            self.search.stop_on_first_match = false;
        }
        if let Some(start) = cli.start_date {
            self.search.start_date = start;
        }
        if let Some(end) = cli.end_date {
            self.search.end_date = end;
        }
        if let Some(glob) = cli.filename_glob {
            self.search.filename_glob = glob;
        }
        if let Some(workers) = cli.max_workers {
            self.search.max_workers = workers;
        }
        if let Some(size) = cli.pool_size {
            self.pool.size = size;
        }
        if let Some(max) = cli.max_file_size {
            self.search.max_file_size = max;
        }
        if cli.local_root.is_some() {
            self.server.local_root = cli.local_root;
        }
        if let Some(order) = cli.result_order {
            self.search.result_order = order;
        }
        if let Some(max) = cli.max_results {
            self.search.max_results = max;
        }
        if cli.recursive {
            self.layout.partitioning = Partitioning::Flat;
            self.layout.root = String::new();
        }
        if let Some(level) = cli.log_level {
            self.log_level = level;
        }
        self
    }

    pub fn validate(&self) -> SearchResult<()> {
        if self.layout.partitioning == Partitioning::ByDate
            && self.layout.date_format.trim().is_empty()
        {
            return Err(SearchError::config_error("layout.date_format must not be empty"));
        }
        self.search.validate()
    }

    /// Renders the effective configuration, password omitted
    pub fn to_yaml(&self) -> SearchResult<String> {
        serde_yaml::to_string(self).map_err(|e| SearchError::config_error(e.to_string()))
    }
}

/// Durations written the way people type them: "30s", "1m 30s", "250ms"
mod duration_format {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
