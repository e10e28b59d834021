pub mod config;
pub mod enumerate;
pub mod errors;
pub mod filters;
pub mod metrics;
pub mod pool;
pub mod results;
pub mod search;
pub mod transport;

pub use config::{MatchMode, Partitioning, ResultOrder, SearchConfig, SearchRequest};
pub use enumerate::{CandidateFile, DateRange, EnumerationFailure, FileEnumerator};
pub use errors::{ErrorKind, SearchError, SearchResult};
pub use pool::{ConnectionPool, Lease};
pub use results::{MatchHit, Outcome, RunCounters, RunProgress, SearchRecord, SkipReason};
pub use search::engine::ResultSink;
pub use search::{CancellationToken, RunReport, RunStatus, SearchCoordinator, SearchHandle};
pub use transport::ftp::FtpConnector;
pub use transport::local::LocalConnector;
pub use transport::memory::MemoryServer;
pub use transport::{Connector, RemoteEntry, RemoteSession, WalkedFile};
