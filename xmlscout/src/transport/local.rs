use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tracing::{trace, warn};

use super::{join_remote, Connector, RemoteEntry, RemoteSession, WalkedFile};
use crate::errors::{SearchError, SearchResult};

/// Serves a local directory as if it were the remote tree.
///
/// Useful against a mirrored or mounted copy of the server, or a plain folder
/// of XML files walked recursively. Remote paths are resolved below `root`;
/// `..` never escapes it.
#[derive(Debug, Clone)]
pub struct LocalConnector {
    root: PathBuf,
}

impl LocalConnector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Connector for LocalConnector {
    fn connect(&self) -> SearchResult<Box<dyn RemoteSession>> {
        if !self.root.is_dir() {
            return Err(SearchError::connection(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        Ok(Box::new(LocalSession {
            root: self.root.clone(),
            connected: true,
        }))
    }

    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }
}

struct LocalSession {
    root: PathBuf,
    connected: bool,
}

impl LocalSession {
    fn resolve(&self, remote: &str) -> SearchResult<PathBuf> {
        if !self.connected {
            return Err(SearchError::connection("session is disconnected"));
        }
        let mut path = self.root.clone();
        for component in Path::new(remote.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => return Err(SearchError::not_found(remote)),
            }
        }
        Ok(path)
    }
}

fn map_io(remote: &str, err: std::io::Error) -> SearchError {
    match err.kind() {
        std::io::ErrorKind::NotFound => SearchError::not_found(remote),
        _ => SearchError::transfer(remote, err.to_string()),
    }
}

impl RemoteSession for LocalSession {
    fn list_dir(&mut self, path: &str) -> SearchResult<Vec<RemoteEntry>> {
        let dir = self.resolve(path)?;
        trace!("Listing local directory: {}", dir.display());
        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| map_io(path, e))? {
            let entry = entry.map_err(|e| map_io(path, e))?;
            let metadata = entry.metadata().map_err(|e| map_io(path, e))?;
            entries.push(RemoteEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: metadata.len(),
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
                is_dir: metadata.is_dir(),
            });
        }
        Ok(entries)
    }

    fn walk(&mut self, root: &str) -> SearchResult<Vec<WalkedFile>> {
        let dir = self.resolve(root)?;
        if !dir.is_dir() {
            return Err(SearchError::not_found(root));
        }
        trace!("Walking local directory: {}", dir.display());

        let walker = WalkBuilder::new(&dir)
            .standard_filters(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .build();
        let mut files = Vec::new();
        for result in walker {
            let entry = match result {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry under {}: {}", dir.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!("Skipping {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let segments: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
            files.push(WalkedFile {
                path: join_remote(&segments),
                entry: RemoteEntry {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    size: metadata.len(),
                    modified: metadata.modified().ok().map(DateTime::<Utc>::from),
                    is_dir: false,
                },
            });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    fn open_read(&mut self, path: &str) -> SearchResult<Box<dyn Read + Send + '_>> {
        let file = File::open(self.resolve(path)?).map_err(|e| map_io(path, e))?;
        Ok(Box::new(file))
    }

    fn is_alive(&mut self) -> bool {
        self.connected && self.root.is_dir()
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}
