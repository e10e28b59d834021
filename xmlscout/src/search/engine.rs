use rayon::ThreadPoolBuilder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::matcher::Matcher;
use super::processor::FileProcessor;
use super::CancellationToken;
use crate::config::{ResultOrder, SearchConfig};
use crate::enumerate::{CandidateFile, EnumerationFailure, FileEnumerator};
use crate::errors::{SearchError, SearchResult};
use crate::filters::NameFilter;
use crate::metrics::{TransferMetrics, TransferStats};
use crate::pool::ConnectionPool;
use crate::results::{FileError, Outcome, RunCounters, RunProgress, SearchRecord};
use crate::transport::Connector;

/// Receives records from the aggregator, one at a time, on the thread that
/// called [`SearchCoordinator::run`]
pub trait ResultSink {
    fn on_record(&mut self, record: SearchRecord);

    /// Called after every counter change
    fn on_progress(&mut self, _progress: &RunProgress) {}
}

impl<F: FnMut(SearchRecord)> ResultSink for F {
    fn on_record(&mut self, record: SearchRecord) {
        self(record)
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Cancelled,
    /// `max_results` files matched; the remaining candidates were not started
    LimitReached,
    /// A setup fault; no candidate was scanned
    Failed { reason: String },
}

/// Summary of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub total_candidates: usize,
    pub counters: RunCounters,
    pub enumeration_errors: Vec<EnumerationFailure>,
    /// Most connections on loan at once
    pub peak_connections: usize,
    pub transfer: TransferStats,
    #[serde(serialize_with = "serialize_elapsed")]
    pub elapsed: Duration,
}

impl RunReport {
    fn failed(reason: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            status: RunStatus::Failed {
                reason: reason.into(),
            },
            total_candidates: 0,
            counters: RunCounters::default(),
            enumeration_errors: Vec::new(),
            peak_connections: 0,
            transfer: TransferStats::default(),
            elapsed,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

fn serialize_elapsed<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&humantime::format_duration(*value).to_string())
}

/// Counters of the current run, written by the aggregator only
#[derive(Debug, Default)]
struct RunState {
    progress: Mutex<RunProgress>,
}

impl RunState {
    fn snapshot(&self) -> RunProgress {
        *self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, apply: impl FnOnce(&mut RunProgress)) -> RunProgress {
        let mut progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        apply(&mut progress);
        *progress
    }
}

enum WorkerEvent {
    Started,
    Finished(SearchRecord),
}

/// Emits records in candidate order, holding back early finishers
struct ReorderBuffer {
    next: usize,
    pending: BTreeMap<usize, SearchRecord>,
}

impl ReorderBuffer {
    fn new() -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
        }
    }

    fn push(&mut self, record: SearchRecord, sink: &mut impl ResultSink) {
        self.pending.insert(record.index, record);
        while let Some(record) = self.pending.remove(&self.next) {
            sink.on_record(record);
            self.next += 1;
        }
    }

    /// Emits whatever is left; gaps come from candidates that never started
    fn flush(self, sink: &mut impl ResultSink) {
        for record in self.pending.into_values() {
            sink.on_record(record);
        }
    }
}

/// Runs one search: enumerate, fan out over workers, aggregate.
pub struct SearchCoordinator {
    connector: Arc<dyn Connector>,
    config: SearchConfig,
    cancel: CancellationToken,
    state: Arc<RunState>,
    metrics: TransferMetrics,
}

impl SearchCoordinator {
    pub fn new(connector: Arc<dyn Connector>, config: SearchConfig) -> Self {
        Self {
            connector,
            config,
            cancel: CancellationToken::new(),
            state: Arc::new(RunState::default()),
            metrics: TransferMetrics::new(),
        }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn metrics(&self) -> &TransferMetrics {
        &self.metrics
    }

    /// A token that cancels this coordinator's run when fired
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Current counters; safe to call from any thread
    pub fn progress(&self) -> RunProgress {
        self.state.snapshot()
    }

    /// Runs the search to completion, feeding every record to `sink`
    pub fn run<S: ResultSink>(&self, mut sink: S) -> RunReport {
        let started = Instant::now();
        self.state.update(|p| *p = RunProgress::default());

        let setup = match self.prepare() {
            Ok(setup) => setup,
            Err(e) => {
                warn!("Search setup failed: {}", e);
                return RunReport::failed(e.to_string(), started.elapsed());
            }
        };
        let Setup {
            processor,
            pool,
            candidates,
            enumeration_errors,
        } = setup;

        let total = candidates.len();
        let progress = self.state.update(|p| p.total = total);
        sink.on_progress(&progress);

        if !self.cancel.is_cancelled() && total > 0 {
            if let Err(e) = self.execute(&processor, &pool, &candidates, &mut sink) {
                pool.close();
                return RunReport::failed(e.to_string(), started.elapsed());
            }
        }

        let counters = self.state.snapshot().counters;
        let limit = self.config.search.max_results;
        let status = if self.cancel.is_cancelled() {
            RunStatus::Cancelled
        } else if limit > 0 && counters.matched >= limit && counters.started < total {
            RunStatus::LimitReached
        } else {
            RunStatus::Completed
        };
        pool.close();
        self.metrics.log_stats();

        let report = RunReport {
            status,
            total_candidates: total,
            counters,
            enumeration_errors,
            peak_connections: pool.peak_in_use(),
            transfer: self.metrics.get_stats(),
            elapsed: started.elapsed(),
        };
        info!(
            "Search {:?} in {}: {} candidates, {} scanned, {} matched, {} skipped, {} errors",
            report.status,
            humantime::format_duration(report.elapsed),
            total,
            report.counters.scanned,
            report.counters.matched,
            report.counters.skipped,
            report.counters.errors
        );
        report
    }

    /// Runs the search on a background thread
    pub fn spawn(self) -> SearchHandle {
        let (tx, rx) = mpsc::channel();
        let cancel = self.cancel.clone();
        let state = Arc::clone(&self.state);
        let thread = thread::Builder::new()
            .name("xmlscout-search".to_string())
            .spawn(move || {
                self.run(move |record: SearchRecord| {
                    // The caller may drop the receiver and only wait for the report
                    let _ = tx.send(record);
                })
            });
        SearchHandle {
            cancel,
            state,
            results: rx,
            thread,
        }
    }

    /// Validation, compilation, pool and enumeration. Any error here fails the run.
    fn prepare(&self) -> SearchResult<Setup> {
        let request = &self.config.search;
        self.config.validate()?;
        let range = request.date_range()?;
        let matcher = Arc::new(Matcher::from_request(request)?);
        let filter = NameFilter::new(
            &request.filename_glob,
            request.file_extensions.as_deref(),
            &request.ignore_patterns,
        )?;
        info!(
            "Searching {} for {:?} ({:?} mode, {} workers, {} connections)",
            range,
            request.normalized_keywords(),
            request.mode,
            request.max_workers,
            self.config.pool.size
        );

        let pool = ConnectionPool::open(
            Arc::clone(&self.connector),
            self.config.pool.clone(),
            self.metrics.clone(),
        )?;

        let enumerator = FileEnumerator::new(self.config.layout.clone(), filter);
        let mut candidates = Vec::new();
        let mut enumeration_errors = Vec::new();
        let mut lease = pool.acquire(self.config.pool.acquire_timeout)?;
        for item in enumerator.enumerate(lease.session(), range) {
            if self.cancel.is_cancelled() {
                break;
            }
            match item {
                Ok(candidate) => candidates.push(candidate),
                Err(failure) => enumeration_errors.push(failure),
            }
        }
        pool.release(lease);
        info!(
            "Found {} candidates ({} directories failed to list)",
            candidates.len(),
            enumeration_errors.len()
        );

        Ok(Setup {
            processor: FileProcessor::new(matcher, request, self.metrics.clone()),
            pool,
            candidates,
            enumeration_errors,
        })
    }

    /// Fans candidates out to the workers and aggregates on this thread
    fn execute<S: ResultSink>(
        &self,
        processor: &FileProcessor,
        pool: &ConnectionPool,
        candidates: &[CandidateFile],
        sink: &mut S,
    ) -> SearchResult<()> {
        let workers = self
            .config
            .search
            .max_workers
            .get()
            .min(candidates.len())
            .max(1);
        let threads = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("xmlscout-worker-{}", i))
            .build()
            .map_err(|e| SearchError::config_error(format!("worker pool: {}", e)))?;

        let cursor = AtomicUsize::new(0);
        let matched = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel::<WorkerEvent>();
        let order = self.config.search.result_order;

        threads.in_place_scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let shared = Dispatch {
                    cursor: &cursor,
                    matched: &matched,
                };
                scope.spawn(move |_| self.worker(processor, pool, candidates, shared, tx));
            }
            drop(tx);
            self.aggregate(rx, order, sink);
        });
        Ok(())
    }

    fn worker(
        &self,
        processor: &FileProcessor,
        pool: &ConnectionPool,
        candidates: &[CandidateFile],
        dispatch: Dispatch<'_>,
        events: Sender<WorkerEvent>,
    ) {
        let limit = self.config.search.max_results;
        while !self.cancel.is_cancelled() {
            if limit > 0 && dispatch.matched.load(Ordering::SeqCst) >= limit {
                debug!("Result limit of {} reached, worker stopping", limit);
                break;
            }
            let index = dispatch.cursor.fetch_add(1, Ordering::SeqCst);
            let Some(candidate) = candidates.get(index) else {
                break;
            };
            if events.send(WorkerEvent::Started).is_err() {
                break;
            }
            let record = self.process(processor, pool, index, candidate);
            if record.outcome.is_match() {
                dispatch.matched.fetch_add(1, Ordering::SeqCst);
            }
            if events.send(WorkerEvent::Finished(record)).is_err() {
                break;
            }
        }
    }

    /// Size check, acquire, scan, give the session back. Always one record.
    fn process(
        &self,
        processor: &FileProcessor,
        pool: &ConnectionPool,
        index: usize,
        candidate: &CandidateFile,
    ) -> SearchRecord {
        let started = Instant::now();
        let path = &candidate.remote_path;
        let mut bytes_read = 0;

        let outcome = if let Some(reason) = processor.skip_reason(candidate) {
            debug!("Skipping {}: {}", path, reason);
            Outcome::Skipped(reason)
        } else if self.cancel.is_cancelled() {
            Outcome::Cancelled
        } else {
            match pool.acquire(self.config.pool.acquire_timeout) {
                Err(e) => {
                    warn!("No connection for {}: {}", path, e);
                    Outcome::Failed(FileError::from(e))
                }
                Ok(mut lease) => match processor.scan(lease.session(), candidate, &self.cancel) {
                    Ok(scan) => {
                        pool.release(lease);
                        bytes_read = scan.bytes_read;
                        scan.outcome
                    }
                    Err(SearchError::Cancelled) => {
                        pool.release(lease);
                        Outcome::Cancelled
                    }
                    Err(e) if e.is_transport_fault() => {
                        warn!("Transfer of {} failed, dropping its connection: {}", path, e);
                        pool.invalidate(lease);
                        Outcome::Failed(FileError::from(e))
                    }
                    Err(e) => {
                        warn!("Failed to scan {}: {}", path, e);
                        pool.release(lease);
                        Outcome::Failed(FileError::from(e))
                    }
                },
            }
        };

        let mut record = SearchRecord::new(index, candidate.clone(), outcome);
        record.bytes_read = bytes_read;
        record.elapsed = started.elapsed();
        record
    }

    fn aggregate<S: ResultSink>(
        &self,
        events: Receiver<WorkerEvent>,
        order: ResultOrder,
        sink: &mut S,
    ) {
        let mut reorder = ReorderBuffer::new();
        for event in events {
            match event {
                WorkerEvent::Started => {
                    let progress = self.state.update(|p| p.counters.started += 1);
                    sink.on_progress(&progress);
                }
                WorkerEvent::Finished(record) => {
                    let progress = self.state.update(|p| p.counters.record(&record.outcome));
                    sink.on_progress(&progress);
                    match order {
                        ResultOrder::Completion => sink.on_record(record),
                        ResultOrder::Candidate => reorder.push(record, sink),
                    }
                }
            }
        }
        reorder.flush(sink);
    }
}

/// Counters the workers share while claiming candidates
#[derive(Clone, Copy)]
struct Dispatch<'a> {
    /// Index of the next unclaimed candidate
    cursor: &'a AtomicUsize,
    matched: &'a AtomicUsize,
}

struct Setup {
    processor: FileProcessor,
    pool: ConnectionPool,
    candidates: Vec<CandidateFile>,
    enumeration_errors: Vec<EnumerationFailure>,
}

/// A search running on a background thread
pub struct SearchHandle {
    cancel: CancellationToken,
    state: Arc<RunState>,
    results: Receiver<SearchRecord>,
    thread: std::io::Result<JoinHandle<RunReport>>,
}

impl SearchHandle {
    /// Stops the run; in-flight files finish as cancelled
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn progress(&self) -> RunProgress {
        self.state.snapshot()
    }

    /// Records as they are produced
    pub fn results(&self) -> &Receiver<SearchRecord> {
        &self.results
    }

    /// Waits for the run to end
    pub fn wait(self) -> RunReport {
        let started = Instant::now();
        match self.thread {
            Ok(thread) => thread.join().unwrap_or_else(|_| {
                RunReport::failed("search thread panicked", started.elapsed())
            }),
            Err(e) => RunReport::failed(
                format!("failed to start search thread: {}", e),
                started.elapsed(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatchMode;
    use crate::transport::memory::MemoryServer;
    use chrono::NaiveDate;
    use std::num::NonZeroUsize;

    fn config(keywords: &[&str]) -> SearchConfig {
        let mut config = SearchConfig::default();
        config.search.keywords = keywords.iter().map(|k| k.to_string()).collect();
        config.search.start_date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        config.search.end_date = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        config.search.max_workers = NonZeroUsize::new(3).unwrap();
        config.pool.size = NonZeroUsize::new(2).unwrap();
        config.pool.acquire_timeout = Duration::from_secs(5);
        config.pool.retry_delay = Duration::from_millis(1);
        config
    }

    fn server(files: usize) -> MemoryServer {
        let server = MemoryServer::new();
        for i in 0..files {
            let body = if i % 2 == 0 { "ALERT" } else { "fine" };
            server.add_file(
                &format!("/SAMSUNG/2024030{}/Send File/f{:02}.xml", 1 + i % 2, i),
                format!("<r>{}</r>", body),
            );
        }
        server
    }

    #[test]
    fn test_run_collects_every_candidate() {
        let server = server(6);
        let coordinator = SearchCoordinator::new(Arc::new(server), config(&["alert"]));
        let mut records = Vec::new();
        let report = coordinator.run(|r: SearchRecord| records.push(r));

        assert!(report.is_completed());
        assert_eq!(report.total_candidates, 6);
        assert_eq!(report.counters.scanned, 6);
        assert_eq!(report.counters.matched, 3);
        assert_eq!(records.len(), 6);
        assert_eq!(coordinator.progress().counters.finished(), 6);
    }

    #[test]
    fn test_candidate_order() {
        let server = server(8);
        let mut config = config(&["alert"]);
        config.search.result_order = ResultOrder::Candidate;
        let coordinator = SearchCoordinator::new(Arc::new(server), config);
        let mut indices = Vec::new();
        coordinator.run(|r: SearchRecord| indices.push(r.index));
        assert_eq!(indices, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_setup_faults_fail_the_run() {
        let server = server(2);
        let mut bad_query = config(&["/r[1]"]);
        bad_query.search.mode = MatchMode::Xpath;
        let report = SearchCoordinator::new(Arc::new(server.clone()), bad_query).run(|_: SearchRecord| {});
        assert!(matches!(report.status, RunStatus::Failed { .. }));
        assert_eq!(server.connect_count(), 0, "no connection before the request is valid");

        server.refuse_all_connections(true);
        let report = SearchCoordinator::new(Arc::new(server), config(&["alert"])).run(|_: SearchRecord| {});
        assert!(matches!(report.status, RunStatus::Failed { .. }));
    }

    #[test]
    fn test_invalid_regex_searches_literally() {
        let server = MemoryServer::new();
        server.add_file("/SAMSUNG/20240301/Send File/a.xml", "<r>total (unclosed</r>");
        server.add_file("/SAMSUNG/20240301/Send File/b.xml", "<r>unclosed</r>");
        let mut config = config(&["(unclosed"]);
        config.search.mode = MatchMode::Regex;

        let mut matched = Vec::new();
        let report = SearchCoordinator::new(Arc::new(server), config).run(|r: SearchRecord| {
            if r.outcome.is_match() {
                matched.push(r.candidate.name);
            }
        });
        assert!(report.is_completed());
        assert_eq!(matched, vec!["a.xml"]);
    }

    #[test]
    fn test_max_results_stops_dispatch() {
        let server = server(8);
        let mut config = config(&["alert"]);
        config.search.max_workers = NonZeroUsize::new(1).unwrap();
        config.search.max_results = 2;

        let mut records = Vec::new();
        let report = SearchCoordinator::new(Arc::new(server), config).run(|r: SearchRecord| records.push(r));
        assert_eq!(report.status, RunStatus::LimitReached);
        assert_eq!(report.total_candidates, 8);
        assert_eq!(report.counters.matched, 2);
        assert_eq!(report.counters.started, 2);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_max_results_not_reached() {
        let mut config = config(&["alert"]);
        config.search.max_results = 10;
        let report = SearchCoordinator::new(Arc::new(server(6)), config).run(|_: SearchRecord| {});
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.counters.matched, 3);
    }

    #[test]
    fn test_cancel_before_run() {
        let coordinator = SearchCoordinator::new(Arc::new(server(4)), config(&["alert"]));
        coordinator.cancel();
        let mut records = 0;
        let report = coordinator.run(|_: SearchRecord| records += 1);
        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(records, 0);
        assert_eq!(report.counters.started, 0);
    }

    #[test]
    fn test_reorder_buffer() {
        let candidate = CandidateFile {
            remote_path: "/a.xml".to_string(),
            name: "a.xml".to_string(),
            size_bytes: 1,
            modified_at: None,
            source_subdirectory: "20240301".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 3, 1),
        };
        let record = |i| SearchRecord::new(i, candidate.clone(), Outcome::NoMatch);

        let mut out = Vec::new();
        let mut sink = |r: SearchRecord| out.push(r.index);
        let mut buffer = ReorderBuffer::new();
        buffer.push(record(2), &mut sink);
        buffer.push(record(0), &mut sink);
        buffer.push(record(4), &mut sink);
        buffer.push(record(1), &mut sink);
        buffer.flush(&mut sink);
        assert_eq!(out, vec![0, 1, 2, 4]);
    }

    #[test]
    fn test_spawn_streams_records() {
        let handle = SearchCoordinator::new(Arc::new(server(5)), config(&["alert"])).spawn();
        let received: Vec<SearchRecord> = handle.results().iter().collect();
        let report = handle.wait();
        assert!(report.is_completed());
        assert_eq!(received.len(), 5);
        assert_eq!(report.counters.matched, 3);
    }
}
