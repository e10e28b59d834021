use quick_xml::Reader;
use std::io::BufReader;
use std::sync::Arc;
use tracing::{debug, trace};

use super::chunk::ChunkReader;
use super::matcher::Matcher;
use super::xpath::QuerySet;
use super::CancellationToken;
use crate::config::SearchRequest;
use crate::enumerate::CandidateFile;
use crate::errors::{SearchError, SearchResult};
use crate::metrics::TransferMetrics;
use crate::results::{MatchHit, Outcome, SkipReason};
use crate::transport::RemoteSession;

/// Streaming buffer in front of the XML parser
const XML_BUFFER_CAPACITY: usize = 64 * 1024;

/// What scanning one file produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileScan {
    pub outcome: Outcome,
    pub bytes_read: u64,
}

/// Scans single candidates over a borrowed session
#[derive(Debug, Clone)]
pub struct FileProcessor {
    matcher: Arc<Matcher>,
    metrics: TransferMetrics,
    chunk_size: usize,
    chunk_overlap: usize,
    max_file_size: u64,
    document_parse_limit: u64,
    stop_on_first_match: bool,
}

impl FileProcessor {
    pub fn new(matcher: Arc<Matcher>, request: &SearchRequest, metrics: TransferMetrics) -> Self {
        Self {
            matcher,
            metrics,
            chunk_size: request.chunk_size,
            chunk_overlap: request.chunk_overlap,
            max_file_size: request.max_file_size,
            document_parse_limit: request.document_parse_limit,
            stop_on_first_match: request.stop_on_first_match,
        }
    }

    /// Decides from the listing alone whether a file is skipped
    pub fn skip_reason(&self, candidate: &CandidateFile) -> Option<SkipReason> {
        (candidate.size_bytes > self.max_file_size).then(|| SkipReason::TooLarge {
            size: candidate.size_bytes,
            limit: self.max_file_size,
        })
    }

    /// Streams one candidate through the run's matcher.
    ///
    /// Errors are scoped to this file. `SearchError::Cancelled` means the
    /// cancellation token fired between chunks; the session is still usable.
    pub fn scan(
        &self,
        session: &mut dyn RemoteSession,
        candidate: &CandidateFile,
        cancel: &CancellationToken,
    ) -> SearchResult<FileScan> {
        let path = candidate.remote_path.as_str();
        trace!("Opening {} ({} bytes)", path, candidate.size_bytes);
        let stream = session.open_read(path)?;
        self.metrics.record_file_opened();
        let mut chunks = ChunkReader::new(stream, path, self.chunk_size, self.chunk_overlap)
            .with_metrics(self.metrics.clone());

        let hits = match self.matcher.as_ref() {
            Matcher::Structured(queries) if candidate.size_bytes <= self.document_parse_limit => {
                self.query_document(queries, &mut chunks, cancel)?
            }
            Matcher::Structured(queries) => self.query_stream(queries, &mut chunks, cancel)?,
            _ => self.scan_chunks(&mut chunks, cancel)?,
        };

        debug!(
            "Scanned {}: {} hits in {} bytes",
            path,
            hits.len(),
            chunks.bytes_read()
        );
        Ok(FileScan {
            outcome: if hits.is_empty() {
                Outcome::NoMatch
            } else {
                Outcome::Matched(hits)
            },
            bytes_read: chunks.bytes_read(),
        })
    }

    fn scan_chunks<R: std::io::Read>(
        &self,
        chunks: &mut ChunkReader<R>,
        cancel: &CancellationToken,
    ) -> SearchResult<Vec<MatchHit>> {
        let mut scanner = self.matcher.scanner();
        let mut hits = Vec::new();
        loop {
            if cancel.is_cancelled() {
                return Err(SearchError::Cancelled);
            }
            let Some(chunk) = chunks.next_chunk()? else {
                break;
            };
            hits.extend(scanner.feed(&chunk));
            if self.stop_on_first_match && !hits.is_empty() {
                hits.truncate(1);
                return Ok(hits);
            }
        }
        hits.extend(scanner.finish());
        if self.stop_on_first_match {
            hits.truncate(1);
        }
        Ok(hits)
    }

    /// Reassembles the document from its chunks and evaluates it as a tree
    fn query_document<R: std::io::Read>(
        &self,
        queries: &QuerySet,
        chunks: &mut ChunkReader<R>,
        cancel: &CancellationToken,
    ) -> SearchResult<Vec<MatchHit>> {
        let mut document = Vec::new();
        loop {
            if cancel.is_cancelled() {
                return Err(SearchError::Cancelled);
            }
            match chunks.next_chunk()? {
                Some(chunk) => document.extend_from_slice(chunk.fresh()),
                None => break,
            }
        }
        queries.evaluate_document(&document, chunks.path(), self.stop_on_first_match)
    }

    /// Evaluates the document while it streams in
    fn query_stream<R: std::io::Read>(
        &self,
        queries: &QuerySet,
        chunks: &mut ChunkReader<R>,
        cancel: &CancellationToken,
    ) -> SearchResult<Vec<MatchHit>> {
        let path = chunks.path().to_string();
        let stream = chunks.stream(cancel);
        let mut reader = Reader::from_reader(BufReader::with_capacity(XML_BUFFER_CAPACITY, stream));
        match queries.evaluate_stream(&mut reader, &path, self.stop_on_first_match) {
            Ok(hits) => Ok(hits),
            // A parse error caused by the transport is a transport error
            Err(e) => Err(reader.get_mut().get_mut().take_failure().unwrap_or(e)),
        }
    }
}
