use std::io::{self, Read};
use tracing::trace;

use super::CancellationToken;
use crate::errors::{SearchError, SearchResult};
use crate::metrics::TransferMetrics;

/// One window of a remote file.
///
/// `data` starts with `overlap` bytes repeated from the previous chunk,
/// followed by fresh bytes. `offset` is the file position of `data[0]`.
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    pub data: &'a [u8],
    pub offset: u64,
    pub overlap: usize,
    /// Newlines in the file before `data[0]`
    pub lines_before: u64,
}

impl Chunk<'_> {
    /// The bytes this chunk adds to what was already seen
    pub fn fresh(&self) -> &[u8] {
        &self.data[self.overlap..]
    }

    /// 1-based line number of `data[pos]`
    pub fn line_at(&self, pos: usize) -> u64 {
        let end = pos.min(self.data.len());
        self.lines_before + count_newlines(&self.data[..end]) as u64 + 1
    }
}

fn count_newlines(bytes: &[u8]) -> usize {
    bytes.iter().filter(|&&b| b == b'\n').count()
}

/// Reads a stream as a sequence of overlapping chunks.
///
/// Each chunk holds up to `chunk_size` bytes. Every chunk after the first
/// begins with the last `overlap` bytes of its predecessor, so any
/// occurrence of at most `overlap + 1` bytes lies wholly inside some chunk.
/// Only one chunk is held in memory at a time.
pub struct ChunkReader<R> {
    reader: R,
    path: String,
    buf: Vec<u8>,
    chunk_size: usize,
    overlap: usize,
    /// File offset of `buf[0]`
    offset: u64,
    /// Leading bytes of `buf` repeated from the previous chunk
    carried: usize,
    lines_before: u64,
    bytes_read: u64,
    started: bool,
    eof: bool,
    metrics: Option<TransferMetrics>,
}

impl<R: Read> ChunkReader<R> {
    pub fn new(reader: R, path: impl Into<String>, chunk_size: usize, overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            reader,
            path: path.into(),
            buf: Vec::with_capacity(chunk_size),
            chunk_size,
            overlap: overlap.min(chunk_size - 1),
            offset: 0,
            carried: 0,
            lines_before: 0,
            bytes_read: 0,
            started: false,
            eof: false,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: TransferMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Fresh bytes delivered so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Reads the next chunk, or `None` once the stream is exhausted
    pub fn next_chunk(&mut self) -> SearchResult<Option<Chunk<'_>>> {
        if !self.advance()? {
            return Ok(None);
        }
        Ok(Some(Chunk {
            data: &self.buf,
            offset: self.offset,
            overlap: self.carried,
            lines_before: self.lines_before,
        }))
    }

    /// Slides the window forward. Returns false when nothing fresh is left.
    fn advance(&mut self) -> SearchResult<bool> {
        if self.eof {
            return Ok(false);
        }

        if self.started {
            let keep = self.overlap.min(self.buf.len());
            let dropped = self.buf.len() - keep;
            self.lines_before += count_newlines(&self.buf[..dropped]) as u64;
            self.offset += dropped as u64;
            self.buf.drain(..dropped);
            self.carried = keep;
        }
        self.started = true;

        while self.buf.len() < self.chunk_size {
            let start = self.buf.len();
            self.buf.resize(self.chunk_size, 0);
            match self.reader.read(&mut self.buf[start..]) {
                Ok(0) => {
                    self.buf.truncate(start);
                    self.eof = true;
                    break;
                }
                Ok(n) => self.buf.truncate(start + n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => self.buf.truncate(start),
                Err(e) => {
                    self.buf.truncate(start);
                    return Err(SearchError::from_read(&self.path, e));
                }
            }
        }

        let fresh = self.buf.len() - self.carried;
        if fresh == 0 {
            self.eof = true;
            return Ok(false);
        }
        self.bytes_read += fresh as u64;
        if let Some(metrics) = &self.metrics {
            metrics.record_chunk(fresh as u64);
        }
        trace!(
            "Chunk of {} at offset {}: {} fresh bytes",
            self.path,
            self.offset,
            fresh
        );
        Ok(true)
    }

    /// A `Read` view over the fresh bytes, for consumers that want the
    /// plain byte stream. Cancellation is checked before each chunk.
    pub fn stream<'r>(&'r mut self, cancel: &'r CancellationToken) -> ChunkStream<'r, R> {
        ChunkStream {
            chunks: self,
            cancel,
            pos: 0,
            primed: false,
            failure: None,
        }
    }
}

/// Byte stream over the fresh part of each chunk, in file order.
///
/// Transport failures and cancellation surface as a generic `io::Error` to
/// whatever reads the stream; the original cause is kept and can be taken
/// back with [`ChunkStream::take_failure`].
pub struct ChunkStream<'r, R> {
    chunks: &'r mut ChunkReader<R>,
    cancel: &'r CancellationToken,
    pos: usize,
    primed: bool,
    failure: Option<SearchError>,
}

impl<R: Read> ChunkStream<'_, R> {
    pub fn take_failure(&mut self) -> Option<SearchError> {
        self.failure.take()
    }

    fn fail(&mut self, err: SearchError) -> io::Error {
        let io_err = io::Error::other(err.to_string());
        self.failure = Some(err);
        io_err
    }
}

impl<R: Read> Read for ChunkStream<'_, R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.failure.is_some() {
            return Err(io::Error::other("stream already failed"));
        }
        if out.is_empty() {
            return Ok(0);
        }
        while !self.primed || self.pos >= self.chunks.buf.len() {
            if self.cancel.is_cancelled() {
                return Err(self.fail(SearchError::Cancelled));
            }
            match self.chunks.advance() {
                Ok(true) => {
                    self.primed = true;
                    self.pos = self.chunks.carried;
                }
                Ok(false) => return Ok(0),
                Err(e) => return Err(self.fail(e)),
            }
        }
        let available = &self.chunks.buf[self.pos..];
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hands out at most `step` bytes per read, like a slow socket
    struct Trickle<'a> {
        data: &'a [u8],
        step: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(out.len()).min(self.data.len());
            out[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    struct Broken;

    impl Read for Broken {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"))
        }
    }

    fn collect(data: &[u8], chunk_size: usize, overlap: usize) -> Vec<(Vec<u8>, u64, usize)> {
        let mut reader = ChunkReader::new(Trickle { data, step: 3 }, "/t.xml", chunk_size, overlap);
        let mut chunks = Vec::new();
        while let Some(chunk) = reader.next_chunk().unwrap() {
            chunks.push((chunk.data.to_vec(), chunk.offset, chunk.overlap));
        }
        chunks
    }

    #[test]
    fn test_chunks_overlap() {
        let chunks = collect(b"abcdefghij", 4, 1);
        assert_eq!(
            chunks,
            vec![
                (b"abcd".to_vec(), 0, 0),
                (b"defg".to_vec(), 3, 1),
                (b"ghij".to_vec(), 6, 1),
            ]
        );
    }

    #[test]
    fn test_tail_chunk_is_short() {
        let chunks = collect(b"abcdefgh", 4, 1);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2], (b"gh".to_vec(), 6, 1));
    }

    #[test]
    fn test_fresh_bytes_rebuild_stream() {
        let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let mut reader = ChunkReader::new(&data[..], "/t.xml", 1000, 100);
        let mut rebuilt = Vec::new();
        while let Some(chunk) = reader.next_chunk().unwrap() {
            assert!(chunk.data.len() <= 1000);
            rebuilt.extend_from_slice(chunk.fresh());
        }
        assert_eq!(rebuilt, data);
        assert_eq!(reader.bytes_read(), 10_000);
    }

    #[test]
    fn test_empty_stream_has_no_chunks() {
        assert!(collect(b"", 8, 2).is_empty());
    }

    #[test]
    fn test_line_numbers_follow_chunks() {
        let data = b"one\ntwo\nthree\nfour\n";
        let mut reader = ChunkReader::new(&data[..], "/t.xml", 6, 2);
        let mut lines = Vec::new();
        while let Some(chunk) = reader.next_chunk().unwrap() {
            if let Some(pos) = chunk.data.windows(4).position(|w| w == b"four") {
                lines.push(chunk.line_at(pos));
            }
        }
        assert_eq!(lines.first(), Some(&4));
    }

    #[test]
    fn test_read_error_surfaces() {
        let mut reader = ChunkReader::new(Broken, "/t.xml", 8, 2);
        let err = reader.next_chunk().unwrap_err();
        assert!(matches!(err, SearchError::Transfer { .. }));
    }

    #[test]
    fn test_stream_yields_fresh_bytes() {
        let data = b"<root><a>hello</a></root>";
        let mut reader = ChunkReader::new(Trickle { data, step: 5 }, "/t.xml", 7, 3);
        let cancel = CancellationToken::new();
        let mut out = Vec::new();
        reader.stream(&cancel).read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_stream_observes_cancellation() {
        let data = vec![b'x'; 100];
        let mut reader = ChunkReader::new(&data[..], "/t.xml", 10, 2);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut stream = reader.stream(&cancel);
        let mut out = Vec::new();
        assert!(stream.read_to_end(&mut out).is_err());
        assert!(matches!(stream.take_failure(), Some(SearchError::Cancelled)));
    }
}
