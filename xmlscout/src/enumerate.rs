/// Candidate discovery over the remote tree.
///
/// A date-partitioned tree looks like `/<root>/<date>/<send directory>/<file>`.
/// For each date in the requested range the enumerator lists exactly one
/// directory and yields the files that pass the [`NameFilter`]. Dates are
/// visited in ascending order and names within a date are sorted, so two runs
/// over the same tree see the same candidate sequence.
///
/// Listing is lazy: the next date directory is only listed once the
/// previous one has been drained. A missing date directory contributes no
/// candidates. Any other listing failure is yielded as an
/// [`EnumerationFailure`] for that date and enumeration moves on.
///
/// A flat tree is walked once from its root, at any depth, in path order.
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, trace, warn};

use crate::config::{Partitioning, RemoteLayout};
use crate::errors::{ErrorKind, SearchError, SearchResult};
use crate::filters::NameFilter;
use crate::transport::{join_remote, RemoteSession};

/// Inclusive range of calendar dates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> SearchResult<Self> {
        if start > end {
            return Err(SearchError::config_error(format!(
                "start date {} is after end date {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    /// Number of days covered, both ends included
    pub fn days(&self) -> usize {
        (self.end - self.start).num_days() as usize + 1
    }

    pub fn iter(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        std::iter::successors(Some(self.start), move |d| {
            d.checked_add_signed(ChronoDuration::days(1))
                .filter(|next| *next <= end)
        })
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// A file selected for scanning. Read-only once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateFile {
    pub remote_path: String,
    pub name: String,
    /// Size as declared by the listing
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
    /// The date directory the file was found under, e.g. `20240301`. In a
    /// flat tree, the parent directory relative to the root.
    pub source_subdirectory: String,
    /// `None` in a flat tree
    pub date: Option<NaiveDate>,
}

/// A directory that could not be listed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumerationFailure {
    pub date: Option<NaiveDate>,
    pub directory: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for EnumerationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.date {
            Some(date) => write!(f, "{} ({}): {}", self.directory, date, self.message),
            None => write!(f, "{}: {}", self.directory, self.message),
        }
    }
}

/// Maps a date range onto remote directories and filters their listings
#[derive(Debug, Clone)]
pub struct FileEnumerator {
    layout: RemoteLayout,
    filter: NameFilter,
}

impl FileEnumerator {
    pub fn new(layout: RemoteLayout, filter: NameFilter) -> Self {
        Self { layout, filter }
    }

    /// Directory name for one date, e.g. `20240301` with the default format
    pub fn date_directory(&self, date: NaiveDate) -> String {
        date.format(&self.layout.date_format).to_string()
    }

    /// Full remote path of the send directory for one date
    pub fn directory_for(&self, date: NaiveDate) -> String {
        join_remote(&[
            &self.layout.root,
            &self.date_directory(date),
            &self.layout.send_directory,
        ])
    }

    /// Lazily lists every date in `range` through `session`. A flat tree
    /// ignores the range and is walked whole.
    pub fn enumerate<'a>(
        &'a self,
        session: &'a mut dyn RemoteSession,
        range: DateRange,
    ) -> Enumeration<'a> {
        let partitions: Box<dyn Iterator<Item = Option<NaiveDate>> + 'a> =
            match self.layout.partitioning {
                Partitioning::ByDate => {
                    debug!(
                        "Enumerating {} ({} days) under /{}",
                        range,
                        range.days(),
                        self.layout.root
                    );
                    Box::new(range.iter().map(Some))
                }
                Partitioning::Flat => {
                    debug!("Walking every directory under /{}", self.layout.root);
                    Box::new(std::iter::once(None))
                }
            };
        Enumeration {
            enumerator: self,
            session,
            partitions,
            pending: VecDeque::new(),
        }
    }

    fn list_partition(
        &self,
        session: &mut dyn RemoteSession,
        partition: Option<NaiveDate>,
    ) -> Result<Vec<CandidateFile>, EnumerationFailure> {
        match partition {
            Some(date) => self.list_date(session, date),
            None => self.walk_tree(session),
        }
    }

    fn walk_tree(
        &self,
        session: &mut dyn RemoteSession,
    ) -> Result<Vec<CandidateFile>, EnumerationFailure> {
        let root = join_remote(&[&self.layout.root]);
        let files = match session.walk(&root) {
            Ok(files) => files,
            Err(e) => {
                warn!("Failed to walk {}: {}", root, e);
                let error = SearchError::enumeration(&root, e.to_string());
                return Err(EnumerationFailure {
                    date: None,
                    kind: error.kind(),
                    message: e.to_string(),
                    directory: root,
                });
            }
        };

        let prefix = root.trim_end_matches('/');
        let mut candidates: Vec<CandidateFile> = files
            .into_iter()
            .filter(|file| self.filter.matches(&file.entry.name))
            .map(|file| {
                let parent = file.path.rsplit_once('/').map_or("", |(parent, _)| parent);
                CandidateFile {
                    source_subdirectory: parent
                        .strip_prefix(prefix)
                        .unwrap_or(parent)
                        .trim_start_matches('/')
                        .to_string(),
                    size_bytes: file.entry.size,
                    modified_at: file.entry.modified,
                    date: None,
                    name: file.entry.name,
                    remote_path: file.path,
                }
            })
            .collect();
        candidates.sort_by(|a, b| a.remote_path.cmp(&b.remote_path));
        debug!("{} candidates under {}", candidates.len(), root);
        Ok(candidates)
    }

    fn list_date(
        &self,
        session: &mut dyn RemoteSession,
        date: NaiveDate,
    ) -> Result<Vec<CandidateFile>, EnumerationFailure> {
        let subdirectory = self.date_directory(date);
        let directory = self.directory_for(date);

        let entries = match session.list_dir(&directory) {
            Ok(entries) => entries,
            Err(SearchError::NotFound(_)) => {
                trace!("No directory for {}: {}", date, directory);
                return Ok(Vec::new());
            }
            Err(e) => {
                warn!("Failed to list {}: {}", directory, e);
                let error = SearchError::enumeration(&directory, e.to_string());
                return Err(EnumerationFailure {
                    date: Some(date),
                    kind: error.kind(),
                    message: e.to_string(),
                    directory,
                });
            }
        };

        let mut candidates: Vec<CandidateFile> = entries
            .into_iter()
            .filter(|entry| !entry.is_dir && self.filter.matches(&entry.name))
            .map(|entry| CandidateFile {
                remote_path: join_remote(&[&directory, &entry.name]),
                size_bytes: entry.size,
                modified_at: entry.modified,
                source_subdirectory: subdirectory.clone(),
                date: Some(date),
                name: entry.name,
            })
            .collect();
        candidates.sort_by(|a, b| a.name.cmp(&b.name));
        debug!("{} candidates in {}", candidates.len(), directory);
        Ok(candidates)
    }
}

/// Lazy candidate sequence returned by [`FileEnumerator::enumerate`]
pub struct Enumeration<'a> {
    enumerator: &'a FileEnumerator,
    session: &'a mut dyn RemoteSession,
    partitions: Box<dyn Iterator<Item = Option<NaiveDate>> + 'a>,
    pending: VecDeque<CandidateFile>,
}

impl Iterator for Enumeration<'_> {
    type Item = Result<CandidateFile, EnumerationFailure>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(candidate) = self.pending.pop_front() {
                return Some(Ok(candidate));
            }
            let partition = self.partitions.next()?;
            match self.enumerator.list_partition(self.session, partition) {
                Ok(candidates) => self.pending.extend(candidates),
                Err(failure) => return Some(Err(failure)),
            }
        }
    }
}
