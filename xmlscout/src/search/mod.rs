/// Concurrent content search over remote candidates.
///
/// A run moves through four stages:
///
/// 1. [`engine::SearchCoordinator`] validates the request, opens the
///    connection pool and enumerates candidates.
/// 2. A fixed set of rayon workers pulls candidate indices from a shared
///    cursor. Each worker borrows a pooled session per file.
/// 3. [`processor::FileProcessor`] streams the file through a
///    [`chunk::ChunkReader`] and hands chunks (or the reassembled document,
///    for structured queries) to the run's [`matcher::Matcher`].
/// 4. Workers report back over a channel to a single aggregator, which owns
///    the run counters and forwards records to the caller's sink.
///
/// ```rust,ignore
/// let coordinator = SearchCoordinator::new(Arc::new(connector), config);
/// let report = coordinator.run(|record: SearchRecord| {
///     if record.outcome.is_match() {
///         println!("{}", record.candidate.remote_path);
///     }
/// });
/// ```
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod chunk;
pub mod engine;
pub mod matcher;
pub mod processor;
pub mod xpath;

pub use chunk::{Chunk, ChunkReader};
pub use engine::{RunReport, RunStatus, SearchCoordinator, SearchHandle};
pub use matcher::Matcher;
pub use processor::FileProcessor;

/// Level-triggered cancellation flag shared by everything in one run
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
