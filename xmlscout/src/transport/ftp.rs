use chrono::{DateTime, Utc};
use std::io::{self, Read};
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;
use suppaftp::list::File as ListedFile;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Status};
use tracing::{debug, trace};

use super::{Connector, RemoteEntry, RemoteSession};
use crate::config::{PoolSettings, ServerSettings};
use crate::errors::{SearchError, SearchResult};

/// Opens passive-mode FTP sessions to the server holding the drop.
///
/// Every session logs in with the configured credentials and switches to
/// binary transfers. The connect timeout bounds the TCP handshake; the read
/// timeout applies to the control socket and to every data socket, so a
/// stalled transfer surfaces as `SearchError::Timeout`.
#[derive(Debug, Clone)]
pub struct FtpConnector {
    host: String,
    port: u16,
    username: String,
    password: String,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl FtpConnector {
    pub fn new(server: &ServerSettings, pool: &PoolSettings) -> Self {
        Self {
            host: server.host.clone(),
            port: server.port,
            username: server.username.clone(),
            password: server.password.clone(),
            connect_timeout: pool.connect_timeout,
            read_timeout: pool.read_timeout,
        }
    }

    fn address(&self) -> SearchResult<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| SearchError::connection(format!("resolving {}: {}", self.describe(), e)))?
            .next()
            .ok_or_else(|| SearchError::connection(format!("{} has no address", self.host)))
    }

    fn open(&self) -> SearchResult<FtpStream> {
        let target = self.describe();
        let fail = |e: &dyn std::fmt::Display| SearchError::connection(format!("{}: {}", target, e));

        let mut stream = FtpStream::connect_timeout(self.address()?, self.connect_timeout)
            .map_err(|e| fail(&e))?;
        let socket = stream.get_ref();
        socket
            .set_read_timeout(Some(self.read_timeout))
            .map_err(|e| fail(&e))?;
        socket
            .set_write_timeout(Some(self.read_timeout))
            .map_err(|e| fail(&e))?;
        stream
            .login(&self.username, &self.password)
            .map_err(|e| fail(&e))?;
        stream
            .transfer_type(FileType::Binary)
            .map_err(|e| fail(&e))?;
        Ok(stream)
    }
}

impl Connector for FtpConnector {
    fn connect(&self) -> SearchResult<Box<dyn RemoteSession>> {
        let stream = self.open()?;
        debug!("Logged in to {} as {}", self.describe(), self.username);
        Ok(Box::new(FtpSession {
            stream: Some(stream),
            read_timeout: self.read_timeout,
        }))
    }

    fn describe(&self) -> String {
        format!("ftp://{}:{}", self.host, self.port)
    }
}

struct FtpSession {
    stream: Option<FtpStream>,
    read_timeout: Duration,
}

impl FtpSession {
    fn stream(&mut self) -> SearchResult<&mut FtpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| SearchError::connection("session is disconnected"))
    }
}

fn map_ftp(path: &str, err: FtpError) -> SearchError {
    match err {
        FtpError::UnexpectedResponse(response) if response.status == Status::FileUnavailable => {
            SearchError::not_found(path)
        }
        FtpError::ConnectionError(e) => SearchError::from_read(path, e),
        other => SearchError::transfer(path, other.to_string()),
    }
}

/// Turns `LIST` output into entries. Lines no parser understands, such as
/// the `total` header, are dropped.
fn parse_listing(lines: &[String]) -> Vec<RemoteEntry> {
    lines
        .iter()
        .filter_map(|line| match ListedFile::from_str(line) {
            Ok(file) => Some(file),
            Err(e) => {
                trace!("Ignoring listing line '{}': {}", line, e);
                None
            }
        })
        .filter(|file| file.name() != "." && file.name() != "..")
        .map(|file| RemoteEntry {
            name: file.name().to_string(),
            size: file.size() as u64,
            modified: Some(DateTime::<Utc>::from(file.modified())),
            is_dir: file.is_directory(),
        })
        .collect()
}

impl RemoteSession for FtpSession {
    fn list_dir(&mut self, path: &str) -> SearchResult<Vec<RemoteEntry>> {
        let lines = self.stream()?.list(Some(path)).map_err(|e| map_ftp(path, e))?;
        Ok(parse_listing(&lines))
    }

    fn open_read(&mut self, path: &str) -> SearchResult<Box<dyn Read + Send + '_>> {
        let read_timeout = self.read_timeout;
        let ftp = self.stream()?;
        let data = ftp.retr_as_stream(path).map_err(|e| map_ftp(path, e))?;
        data.get_ref()
            .set_read_timeout(Some(read_timeout))
            .map_err(|e| SearchError::transfer(path, e.to_string()))?;
        Ok(Box::new(FtpReader {
            ftp,
            data: Some(Box::new(data)),
            path: path.to_string(),
        }))
    }

    fn is_alive(&mut self) -> bool {
        self.stream.as_mut().is_some_and(|ftp| ftp.noop().is_ok())
    }

    fn disconnect(&mut self) {
        if let Some(mut ftp) = self.stream.take() {
            if let Err(e) = ftp.quit() {
                debug!("QUIT failed: {}", e);
            }
        }
    }
}

/// A `RETR` data stream. The transfer is closed on the control connection
/// at end of file, or aborted if the reader is dropped early.
struct FtpReader<'a> {
    ftp: &'a mut FtpStream,
    data: Option<Box<dyn Read + Send>>,
    path: String,
}

impl Read for FtpReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(data) = self.data.as_mut() else {
            return Ok(0);
        };
        let n = data.read(buf)?;
        if n == 0 && !buf.is_empty() {
            if let Some(data) = self.data.take() {
                self.ftp.finalize_retr_stream(data).map_err(|e| {
                    io::Error::other(format!("closing transfer of {}: {}", self.path, e))
                })?;
            }
        }
        Ok(n)
    }
}

impl Drop for FtpReader<'_> {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            if let Err(e) = self.ftp.abort(data) {
                debug!("Aborting transfer of {} failed: {}", self.path, e);
            }
        }
    }
}
