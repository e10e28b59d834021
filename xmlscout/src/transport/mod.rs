/// The boundary between the search engine and whatever serves the files.
///
/// The engine needs four things from a session: list a directory, open a
/// file for sequential reading, answer a liveness check, and hang up.
/// Walking a whole subtree is built on listing unless the session has a
/// faster way. A `Connector` knows how to produce new sessions; the pool
/// calls it when a slot is empty or its session has gone stale.
///
/// Three implementations ship with the crate:
/// - [`ftp::FtpConnector`] talks to the FTP server holding the drop
/// - [`local::LocalConnector`] serves a directory on local disk
/// - [`memory::MemoryServer`] holds the tree in memory and can inject
///   failures, which the tests and benches lean on
pub mod ftp;
pub mod local;
pub mod memory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Read;

use crate::errors::{SearchError, SearchResult};

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub name: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub is_dir: bool,
}

/// A file found by [`RemoteSession::walk`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkedFile {
    /// Absolute remote path
    pub path: String,
    pub entry: RemoteEntry,
}

/// A live session to the server. Never shared between threads at once.
pub trait RemoteSession: Send {
    /// Lists `path`. A directory that does not exist is `SearchError::NotFound`.
    fn list_dir(&mut self, path: &str) -> SearchResult<Vec<RemoteEntry>>;

    /// Every file below `root`, at any depth, sorted by path.
    ///
    /// A missing `root` is `SearchError::NotFound`. Subdirectories that vanish
    /// while the walk runs are passed over.
    fn walk(&mut self, root: &str) -> SearchResult<Vec<WalkedFile>> {
        let mut files = Vec::new();
        let mut directories = vec![join_remote(&[root])];
        let mut first = true;
        while let Some(directory) = directories.pop() {
            let entries = match self.list_dir(&directory) {
                Ok(entries) => entries,
                Err(SearchError::NotFound(_)) if !first => continue,
                Err(e) => return Err(e),
            };
            first = false;
            for entry in entries {
                let path = join_remote(&[&directory, &entry.name]);
                if entry.is_dir {
                    directories.push(path);
                } else {
                    files.push(WalkedFile { path, entry });
                }
            }
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    /// Opens `path` for sequential reading from the first byte
    fn open_read(&mut self, path: &str) -> SearchResult<Box<dyn Read + Send + '_>>;

    /// Cheap liveness check, the equivalent of a protocol NOOP
    fn is_alive(&mut self) -> bool;

    fn disconnect(&mut self);
}

/// Opens new sessions to one server
pub trait Connector: Send + Sync {
    fn connect(&self) -> SearchResult<Box<dyn RemoteSession>>;

    /// Human readable target, used in log lines
    fn describe(&self) -> String;
}

/// Joins path segments into an absolute remote path with single separators
pub fn join_remote(segments: &[&str]) -> String {
    let mut path = String::new();
    for segment in segments {
        for part in segment.split('/').filter(|p| !p.is_empty()) {
            path.push('/');
            path.push_str(part);
        }
    }
    if path.is_empty() {
        path.push('/');
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_remote() {
        assert_eq!(
            join_remote(&["SAMSUNG", "20240301", "Send File"]),
            "/SAMSUNG/20240301/Send File"
        );
        assert_eq!(join_remote(&["/SAMSUNG/", "/a.xml"]), "/SAMSUNG/a.xml");
        assert_eq!(join_remote(&[]), "/");
        assert_eq!(join_remote(&["", "x"]), "/x");
    }

    #[test]
    fn test_walk_lists_nested_files() {
        let server = memory::MemoryServer::new();
        server.add_file("/drop/b.xml", "<b/>");
        server.add_file("/drop/2024/03/a.xml", "<a/>");
        server.add_file("/drop/2024/notes.txt", "n");
        server.add_dir("/drop/empty");
        server.add_file("/elsewhere/c.xml", "<c/>");
        let mut session = server.connect().unwrap();

        let paths: Vec<String> = session
            .walk("drop")
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert_eq!(
            paths,
            vec!["/drop/2024/03/a.xml", "/drop/2024/notes.txt", "/drop/b.xml"]
        );
        assert!(matches!(
            session.walk("/missing"),
            Err(SearchError::NotFound(_))
        ));
    }
}
