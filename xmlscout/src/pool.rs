/// A bounded pool of transport sessions shared by the search workers.
///
/// The pool is an arena of slots. Each slot is either idle (holding a
/// session), lent (its session currently belongs to a `Lease`), or vacant
/// (never opened, or emptied by `invalidate`). Workers go through explicit
/// `acquire` / `release` / `invalidate` calls; a lease moves the session out
/// of its slot, so a suspect session can never be handed to a second worker.
///
/// Only the slot bookkeeping sits behind the mutex. Connecting, liveness
/// liveness checks and transfers all happen with the lock released.
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::PoolSettings;
use crate::errors::{SearchError, SearchResult};
use crate::metrics::TransferMetrics;
use crate::transport::{Connector, RemoteSession};

/// Opaque handle to a pool slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

impl SlotId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// A session on loan from the pool. Give it back with
/// [`ConnectionPool::release`] or [`ConnectionPool::invalidate`].
#[must_use = "a lease must be released or invalidated"]
pub struct Lease {
    slot: SlotId,
    session: Box<dyn RemoteSession>,
}

impl Lease {
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn session(&mut self) -> &mut dyn RemoteSession {
        self.session.as_mut()
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("slot", &self.slot).finish()
    }
}

enum SlotState {
    Idle(Box<dyn RemoteSession>),
    Lent,
    Vacant,
}

struct Slot {
    state: SlotState,
    last_used_at: Option<Instant>,
    failure_count: u32,
}

/// Point-in-time view of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    pub id: SlotId,
    pub in_use: bool,
    pub connected: bool,
    pub last_used_at: Option<Instant>,
    pub failure_count: u32,
}

struct PoolState {
    slots: Vec<Slot>,
    lent: usize,
    peak_lent: usize,
    closed: bool,
}

enum Claim {
    Idle(SlotId, Box<dyn RemoteSession>),
    Vacant(SlotId),
}

impl PoolState {
    /// Marks a slot as lent; an idle session is preferred over opening a new one
    fn claim(&mut self) -> Option<Claim> {
        let idle = self
            .slots
            .iter()
            .position(|s| matches!(s.state, SlotState::Idle(_)));
        let index = idle.or_else(|| {
            self.slots
                .iter()
                .position(|s| matches!(s.state, SlotState::Vacant))
        })?;

        let previous = std::mem::replace(&mut self.slots[index].state, SlotState::Lent);
        self.lent += 1;
        self.peak_lent = self.peak_lent.max(self.lent);
        match previous {
            SlotState::Idle(session) => Some(Claim::Idle(SlotId(index), session)),
            _ => Some(Claim::Vacant(SlotId(index))),
        }
    }
}

pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    settings: PoolSettings,
    state: Mutex<PoolState>,
    available: Condvar,
    metrics: TransferMetrics,
}

impl ConnectionPool {
    /// Creates the pool and opens its first session.
    ///
    /// Failing to open that first session is a setup fault: nothing can be
    /// searched without at least one working connection.
    pub fn open(
        connector: Arc<dyn Connector>,
        settings: PoolSettings,
        metrics: TransferMetrics,
    ) -> SearchResult<Self> {
        let slots = (0..settings.size.get())
            .map(|_| Slot {
                state: SlotState::Vacant,
                last_used_at: None,
                failure_count: 0,
            })
            .collect();
        let pool = Self {
            connector,
            settings,
            state: Mutex::new(PoolState {
                slots,
                lent: 0,
                peak_lent: 0,
                closed: false,
            }),
            available: Condvar::new(),
            metrics,
        };

        let lease = pool.acquire(pool.settings.connect_timeout)?;
        pool.release(lease);
        info!(
            "Connection pool ready: {} (capacity {})",
            pool.connector.describe(),
            pool.capacity()
        );
        Ok(pool)
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Borrows a healthy session, waiting up to `timeout` for one to free up
    pub fn acquire(&self, timeout: Duration) -> SearchResult<Lease> {
        let deadline = Instant::now() + timeout;
        let claim = {
            let mut state = self.lock();
            let mut waited = false;
            loop {
                if state.closed {
                    return Err(SearchError::connection("connection pool is closed"));
                }
                if let Some(claim) = state.claim() {
                    break claim;
                }
                let now = Instant::now();
                if now >= deadline {
                    drop(state);
                    self.metrics.record_acquire_timeout();
                    return Err(SearchError::timeout(format!(
                        "no connection available within {}",
                        humantime::format_duration(timeout)
                    )));
                }
                if !waited {
                    self.metrics.record_acquire_wait();
                    waited = true;
                }
                state = self
                    .available
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        };

        match claim {
            Claim::Idle(slot, session) => self.check_out(slot, session, deadline),
            Claim::Vacant(slot) => self.fill(slot, deadline),
        }
    }

    /// Hands out an idle session after probing it; stale ones are replaced
    fn check_out(
        &self,
        slot: SlotId,
        mut session: Box<dyn RemoteSession>,
        deadline: Instant,
    ) -> SearchResult<Lease> {
        if session.is_alive() {
            return Ok(Lease { slot, session });
        }
        debug!("Session in slot {} failed its liveness check", slot.0);
        self.metrics.record_stale_session();
        session.disconnect();
        self.fill(slot, deadline)
    }

    /// Opens a new session for a slot this thread has already claimed
    fn fill(&self, slot: SlotId, deadline: Instant) -> SearchResult<Lease> {
        match self.connect_with_retry(deadline) {
            Ok(session) => Ok(Lease { slot, session }),
            Err(e) => {
                self.vacate(slot);
                Err(e)
            }
        }
    }

    /// Connects with bounded retries and exponential backoff.
    ///
    /// The first attempt is always made. Backoff sleeps are cut short at
    /// `deadline`, and once it has passed the acquire fails with a timeout
    /// instead of trying again.
    fn connect_with_retry(&self, deadline: Instant) -> SearchResult<Box<dyn RemoteSession>> {
        let attempts = self.settings.max_retries + 1;
        let mut delay = self.settings.retry_delay;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.connector.connect() {
                Ok(session) => {
                    self.metrics.record_connect(true);
                    debug!("Connected to {} (attempt {})", self.connector.describe(), attempt);
                    return Ok(session);
                }
                Err(e) => {
                    self.metrics.record_connect(false);
                    warn!(
                        "Connect attempt {}/{} to {} failed: {}",
                        attempt,
                        attempts,
                        self.connector.describe(),
                        e
                    );
                    if attempt < attempts {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        thread::sleep(delay.min(remaining));
                        if Instant::now() >= deadline {
                            self.metrics.record_acquire_timeout();
                            return Err(SearchError::timeout(format!(
                                "reconnecting to {} ran past the acquire deadline after {} attempts: {}",
                                self.connector.describe(),
                                attempt,
                                e
                            )));
                        }
                        delay = delay.saturating_mul(2);
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(SearchError::connection(format!(
            "giving up on {} after {} attempts: {}",
            self.connector.describe(),
            attempts,
            last_error.map_or_else(|| "no attempt made".to_string(), |e| e.to_string())
        )))
    }

    fn vacate(&self, slot: SlotId) {
        let mut state = self.lock();
        let entry = &mut state.slots[slot.0];
        entry.state = SlotState::Vacant;
        entry.failure_count += 1;
        state.lent -= 1;
        drop(state);
        self.available.notify_one();
    }

    /// Returns a healthy session to the free set
    pub fn release(&self, lease: Lease) {
        let Lease { slot, mut session } = lease;
        let mut state = self.lock();
        state.lent -= 1;
        if state.closed {
            drop(state);
            session.disconnect();
            return;
        }
        let entry = &mut state.slots[slot.0];
        entry.state = SlotState::Idle(session);
        entry.last_used_at = Some(Instant::now());
        entry.failure_count = 0;
        drop(state);
        self.available.notify_one();
    }

    /// Discards a session that failed mid-transfer; the slot is reopened on demand
    pub fn invalidate(&self, lease: Lease) {
        let Lease { slot, mut session } = lease;
        session.disconnect();
        self.metrics.record_invalidation();
        debug!("Invalidated session in slot {}", slot.0);
        self.vacate(slot);
    }

    /// Disconnects idle sessions and refuses further acquires.
    /// Sessions still on loan are disconnected when they come back.
    pub fn close(&self) {
        let sessions: Vec<Box<dyn RemoteSession>> = {
            let mut state = self.lock();
            state.closed = true;
            state
                .slots
                .iter_mut()
                .filter_map(|slot| {
                    match std::mem::replace(&mut slot.state, SlotState::Vacant) {
                        SlotState::Idle(session) => Some(session),
                        SlotState::Lent => {
                            slot.state = SlotState::Lent;
                            None
                        }
                        SlotState::Vacant => None,
                    }
                })
                .collect()
        };
        self.available.notify_all();
        for mut session in sessions {
            session.disconnect();
        }
    }

    pub fn capacity(&self) -> usize {
        self.settings.size.get()
    }

    /// Sessions currently on loan
    pub fn in_use(&self) -> usize {
        self.lock().lent
    }

    /// Most sessions ever on loan at the same moment
    pub fn peak_in_use(&self) -> usize {
        self.lock().peak_lent
    }

    pub fn slot_info(&self) -> Vec<SlotInfo> {
        self.lock()
            .slots
            .iter()
            .enumerate()
            .map(|(index, slot)| SlotInfo {
                id: SlotId(index),
                in_use: matches!(slot.state, SlotState::Lent),
                connected: !matches!(slot.state, SlotState::Vacant),
                last_used_at: slot.last_used_at,
                failure_count: slot.failure_count,
            })
            .collect()
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close();
    }
}
