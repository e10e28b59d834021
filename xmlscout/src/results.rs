/// Result records produced by a search run.
///
/// Every candidate a worker picks up ends in exactly one [`SearchRecord`].
/// The record's [`Outcome`] keeps "skipped" apart from "scanned, no match",
/// and failed files carry the error classification so a caller can tell a
/// timeout from a malformed document without parsing messages.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::enumerate::CandidateFile;
use crate::errors::{ErrorKind, SearchError};

/// Evidence that one term matched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchHit {
    /// The keyword, pattern or query that matched
    pub term: String,
    /// Position of `term` in the request's keyword list
    pub term_index: usize,
    /// Byte offset of the hit in the file
    pub offset: u64,
    /// 1-based line of the hit; not tracked for structured queries
    pub line: Option<u64>,
    /// Surrounding text, lossily decoded
    pub snippet: String,
}

/// Why a file was not read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    TooLarge { size: u64, limit: u64 },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLarge { size, limit } => {
                write!(f, "too large ({} bytes, limit {})", size, limit)
            }
        }
    }
}

/// A per-file failure, detached from the error that caused it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&SearchError> for FileError {
    fn from(err: &SearchError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<SearchError> for FileError {
    fn from(err: SearchError) -> Self {
        Self::from(&err)
    }
}

/// Terminal state of one candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    Matched(Vec<MatchHit>),
    NoMatch,
    Skipped(SkipReason),
    Failed(FileError),
    Cancelled,
}

impl Outcome {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Matched(_))
    }

    /// True for outcomes that read the whole file, or enough of it to decide
    pub fn is_scanned(&self) -> bool {
        matches!(self, Self::Matched(_) | Self::NoMatch)
    }

    pub fn hits(&self) -> &[MatchHit] {
        match self {
            Self::Matched(hits) => hits,
            _ => &[],
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Matched(_) => "matched",
            Self::NoMatch => "no match",
            Self::Skipped(_) => "skipped",
            Self::Failed(_) => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Result of scanning one candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRecord {
    /// Position of the candidate in enumeration order
    pub index: usize,
    pub candidate: CandidateFile,
    pub outcome: Outcome,
    /// Fresh bytes read for this file
    pub bytes_read: u64,
    #[serde(with = "millis")]
    pub elapsed: Duration,
}

impl SearchRecord {
    pub fn new(index: usize, candidate: CandidateFile, outcome: Outcome) -> Self {
        Self {
            index,
            candidate,
            outcome,
            bytes_read: 0,
            elapsed: Duration::ZERO,
        }
    }
}

/// Live counters of a run.
///
/// `started` counts candidates a worker picked up. Each of those ends in
/// exactly one of `scanned`, `skipped`, `errors` or `cancelled`; `matched`
/// is the subset of `scanned` that had hits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub started: usize,
    pub scanned: usize,
    pub matched: usize,
    pub skipped: usize,
    pub errors: usize,
    pub cancelled: usize,
}

impl RunCounters {
    /// Accounts for one finished candidate
    pub fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Matched(_) => {
                self.scanned += 1;
                self.matched += 1;
            }
            Outcome::NoMatch => self.scanned += 1,
            Outcome::Skipped(_) => self.skipped += 1,
            Outcome::Failed(_) => self.errors += 1,
            Outcome::Cancelled => self.cancelled += 1,
        }
    }

    /// Candidates that reached a terminal outcome
    pub fn finished(&self) -> usize {
        self.scanned + self.skipped + self.errors + self.cancelled
    }

    pub fn in_flight(&self) -> usize {
        self.started.saturating_sub(self.finished())
    }
}

/// Snapshot of a run in progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProgress {
    pub counters: RunCounters,
    /// Candidates found by enumeration
    pub total: usize,
}

impl RunProgress {
    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.counters.finished())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
