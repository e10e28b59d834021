use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{join_remote, Connector, RemoteEntry, RemoteSession};
use crate::errors::{SearchError, SearchResult};

/// Largest slice handed out by a single `read` call
const MAX_READ: usize = 16 * 1024;

/// An in-memory file tree that behaves like a remote server.
///
/// Cloning shares the tree. Faults can be injected per directory, per file
/// or per connection attempt, and the server keeps counters the tests use
/// to check how the pool and the workers behaved.
#[derive(Clone, Default)]
pub struct MemoryServer {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    tree: Mutex<Tree>,
    faults: Mutex<Faults>,
    epoch: AtomicU64,
    next_session: AtomicU64,
    connects: AtomicUsize,
    opens: AtomicUsize,
    active_reads: AtomicUsize,
    peak_reads: AtomicUsize,
}

#[derive(Default)]
struct Tree {
    files: BTreeMap<String, MemoryFile>,
    dirs: BTreeSet<String>,
}

struct MemoryFile {
    data: Arc<[u8]>,
    declared_size: u64,
    modified: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Faults {
    failing_listings: HashSet<String>,
    failing_reads: HashMap<String, usize>,
    refused_connects: usize,
    refuse_all: bool,
    read_delay: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn parent_of(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, name)| name)
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file, creating its parent directories
    pub fn add_file(&self, path: &str, content: impl Into<Vec<u8>>) {
        let data: Vec<u8> = content.into();
        let size = data.len() as u64;
        self.insert(path, data, size);
    }

    /// Adds a file whose listing reports `declared_size` instead of its real length
    pub fn add_file_with_size(&self, path: &str, content: impl Into<Vec<u8>>, declared_size: u64) {
        self.insert(path, content.into(), declared_size);
    }

    fn insert(&self, path: &str, data: Vec<u8>, declared_size: u64) {
        let path = join_remote(&[path]);
        let mut tree = lock(&self.inner.tree);
        let mut dir = parent_of(&path).to_string();
        while dir != "/" {
            let next = parent_of(&dir).to_string();
            tree.dirs.insert(dir);
            dir = next;
        }
        tree.files.insert(
            path,
            MemoryFile {
                data: data.into(),
                declared_size,
                modified: Some(Utc::now()),
            },
        );
    }

    /// Adds an empty directory
    pub fn add_dir(&self, path: &str) {
        let path = join_remote(&[path]);
        let mut tree = lock(&self.inner.tree);
        let mut dir = path;
        while dir != "/" {
            let next = parent_of(&dir).to_string();
            tree.dirs.insert(dir);
            dir = next;
        }
    }

    /// Makes every listing of `dir` fail
    pub fn fail_listing(&self, dir: &str) {
        lock(&self.inner.faults)
            .failing_listings
            .insert(join_remote(&[dir]));
    }

    /// Makes reads of `path` fail once `bytes` bytes have been delivered
    pub fn fail_reads_after(&self, path: &str, bytes: usize) {
        lock(&self.inner.faults)
            .failing_reads
            .insert(join_remote(&[path]), bytes);
    }

    /// Refuses the next `count` connection attempts
    pub fn refuse_connections(&self, count: usize) {
        lock(&self.inner.faults).refused_connects = count;
    }

    /// Refuses every connection attempt while `refuse` is set
    pub fn refuse_all_connections(&self, refuse: bool) {
        lock(&self.inner.faults).refuse_all = refuse;
    }

    /// Sleeps this long inside every `read` call
    pub fn set_read_delay(&self, delay: Duration) {
        lock(&self.inner.faults).read_delay = delay;
    }

    /// Kills every session opened so far; they fail their next liveness check
    pub fn drop_sessions(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Successful connections so far
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Files opened for reading so far
    pub fn open_count(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    /// Highest number of files that were being read at the same moment
    pub fn peak_concurrent_reads(&self) -> usize {
        self.inner.peak_reads.load(Ordering::SeqCst)
    }
}

impl Connector for MemoryServer {
    fn connect(&self) -> SearchResult<Box<dyn RemoteSession>> {
        {
            let mut faults = lock(&self.inner.faults);
            if faults.refuse_all {
                return Err(SearchError::connection("connection refused"));
            }
            if faults.refused_connects > 0 {
                faults.refused_connects -= 1;
                return Err(SearchError::connection("connection refused"));
            }
        }
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            id: self.inner.next_session.fetch_add(1, Ordering::SeqCst),
            epoch: self.inner.epoch.load(Ordering::SeqCst),
            server: self.clone(),
            connected: true,
        }))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

struct MemorySession {
    id: u64,
    epoch: u64,
    server: MemoryServer,
    connected: bool,
}

impl MemorySession {
    fn ensure_alive(&mut self) -> SearchResult<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(SearchError::connection(format!("session {} is closed", self.id)))
        }
    }
}

impl RemoteSession for MemorySession {
    fn list_dir(&mut self, path: &str) -> SearchResult<Vec<RemoteEntry>> {
        self.ensure_alive()?;
        let path = join_remote(&[path]);
        if lock(&self.server.inner.faults)
            .failing_listings
            .contains(&path)
        {
            return Err(SearchError::transfer(&path, "550 listing refused"));
        }

        let tree = lock(&self.server.inner.tree);
        if path != "/" && !tree.dirs.contains(&path) {
            return Err(SearchError::not_found(path));
        }

        let mut entries: Vec<RemoteEntry> = tree
            .dirs
            .iter()
            .filter(|dir| parent_of(dir) == path)
            .map(|dir| RemoteEntry {
                name: name_of(dir).to_string(),
                size: 0,
                modified: None,
                is_dir: true,
            })
            .collect();
        entries.extend(
            tree.files
                .iter()
                .filter(|(file, _)| parent_of(file) == path)
                .map(|(file, entry)| RemoteEntry {
                    name: name_of(file).to_string(),
                    size: entry.declared_size,
                    modified: entry.modified,
                    is_dir: false,
                }),
        );
        // Servers do not promise any order
        entries.reverse();
        Ok(entries)
    }

    fn open_read(&mut self, path: &str) -> SearchResult<Box<dyn Read + Send + '_>> {
        self.ensure_alive()?;
        let path = join_remote(&[path]);
        let data = lock(&self.server.inner.tree)
            .files
            .get(&path)
            .map(|f| Arc::clone(&f.data))
            .ok_or_else(|| SearchError::not_found(&path))?;
        let (fail_after, delay) = {
            let faults = lock(&self.server.inner.faults);
            (faults.failing_reads.get(&path).copied(), faults.read_delay)
        };

        let inner = &self.server.inner;
        inner.opens.fetch_add(1, Ordering::SeqCst);
        let active = inner.active_reads.fetch_add(1, Ordering::SeqCst) + 1;
        inner.peak_reads.fetch_max(active, Ordering::SeqCst);

        Ok(Box::new(MemoryReader {
            data,
            pos: 0,
            fail_after,
            delay,
            server: self.server.clone(),
        }))
    }

    fn is_alive(&mut self) -> bool {
        self.connected && self.epoch == self.server.inner.epoch.load(Ordering::SeqCst)
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}

struct MemoryReader {
    data: Arc<[u8]>,
    pos: usize,
    fail_after: Option<usize>,
    delay: Duration,
    server: MemoryServer,
}

impl Read for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let mut limit = self.data.len();
        if let Some(fail_after) = self.fail_after {
            if self.pos >= fail_after {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "426 connection closed; transfer aborted",
                ));
            }
            limit = limit.min(fail_after);
        }
        let n = buf.len().min(limit - self.pos).min(MAX_READ);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl Drop for MemoryReader {
    fn drop(&mut self) {
        self.server.inner.active_reads.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(session: &mut dyn RemoteSession, path: &str) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        session
            .open_read(path)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?
            .read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_listing_reports_files_and_dirs() {
        let server = MemoryServer::new();
        server.add_file("/root/20240301/Send File/a.xml", "<a/>");
        server.add_file("/root/20240301/Send File/sub/b.xml", "<b/>");
        let mut session = server.connect().unwrap();

        let mut entries = session.list_dir("/root/20240301/Send File").unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.xml");
        assert_eq!(entries[0].size, 4);
        assert_eq!(entries[1].name, "sub");
        assert!(entries[1].is_dir);

        assert!(matches!(
            session.list_dir("/root/20240302"),
            Err(SearchError::NotFound(_))
        ));
    }

    #[test]
    fn test_injected_read_failure() {
        let server = MemoryServer::new();
        server.add_file("/f.xml", vec![b'x'; 100]);
        server.fail_reads_after("/f.xml", 40);
        let mut session = server.connect().unwrap();

        let mut reader = session.open_read("/f.xml").unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(reader.read(&mut buf).unwrap(), 40);
        assert!(reader.read(&mut buf).is_err());
    }

    #[test]
    fn test_refused_connections_recover() {
        let server = MemoryServer::new();
        server.refuse_connections(2);
        assert!(server.connect().is_err());
        assert!(server.connect().is_err());
        assert!(server.connect().is_ok());
        assert_eq!(server.connect_count(), 1);
    }

    #[test]
    fn test_dropped_sessions_fail_liveness() {
        let server = MemoryServer::new();
        let mut session = server.connect().unwrap();
        assert!(session.is_alive());
        server.drop_sessions();
        assert!(!session.is_alive());
        assert!(server.connect().unwrap().is_alive());
    }

    #[test]
    fn test_concurrent_read_tracking() {
        let server = MemoryServer::new();
        server.add_file("/a.xml", "aaaa");
        let mut first = server.connect().unwrap();
        let mut second = server.connect().unwrap();
        {
            let _a = first.open_read("/a.xml").unwrap();
            let _b = second.open_read("/a.xml").unwrap();
        }
        assert_eq!(read_all(first.as_mut(), "/a.xml").unwrap(), b"aaaa");
        assert_eq!(server.peak_concurrent_reads(), 2);
        assert_eq!(server.open_count(), 3);
    }
}
