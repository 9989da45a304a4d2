//! Pending Request Table.
//!
//! Maps correlation IDs to the result slot of a caller awaiting a reply.
//!
//! Flow:
//! 1. `Connection::call` generates a CorrelationId
//! 2. `register()` stores a oneshot sender and hands back the receiver
//! 3. The envelope is written to the socket
//! 4. Exactly one `settle()` removes the entry and fills the slot
//!
//! Every removal goes through `settle()`. Settled ids are remembered for a
//! while so a late reply is recognised and dropped instead of being mistaken
//! for a call from the validator.

use crate::domain::{CorrelationId, MessageType, RetiredIdsConfig, TransportError, TransportResult};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

/// Receiving half of a pending request's result slot.
pub type ReplySlot = oneshot::Receiver<TransportResult<Bytes>>;

/// How a pending request ends.
#[derive(Debug)]
pub enum Resolution {
    /// Matching reply arrived.
    Reply(Bytes),
    /// Timeout, connection loss or close.
    Fail(TransportError),
    /// The caller stopped waiting; nobody to notify.
    Abandon,
    /// The frame never left: the socket refused it.
    Unsent,
}

/// What `settle` found for an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// A live entry was removed and resolved.
    Settled,
    /// The id belonged to a request that already ended.
    Retired,
    /// The id was never issued here.
    Unknown,
}

/// A pending request waiting for its reply
struct PendingRequest {
    /// Slot filled exactly once
    slot: oneshot::Sender<TransportResult<Bytes>>,
    /// Kind of the request (for logging)
    message_type: MessageType,
    /// When request was registered
    created_at: Instant,
}

/// Statistics for the pending request table
#[derive(Debug, Default)]
pub struct PendingStats {
    /// Total requests registered
    pub total_registered: AtomicU64,
    /// Total requests resolved by a reply
    pub total_replied: AtomicU64,
    /// Total requests that timed out
    pub total_timeouts: AtomicU64,
    /// Total requests failed by a lost connection
    pub total_connection_lost: AtomicU64,
    /// Total requests failed by close()
    pub total_closed: AtomicU64,
    /// Total requests dropped by their caller
    pub total_cancelled: AtomicU64,
    /// Total requests the socket refused
    pub total_send_failures: AtomicU64,
}

impl PendingStats {
    fn record(&self, resolution: &Resolution) {
        let counter = match resolution {
            Resolution::Reply(_) => &self.total_replied,
            Resolution::Fail(TransportError::Timeout { .. }) => &self.total_timeouts,
            Resolution::Fail(TransportError::Closed) => &self.total_closed,
            Resolution::Fail(_) => &self.total_connection_lost,
            Resolution::Abandon => &self.total_cancelled,
            Resolution::Unsent => &self.total_send_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Table of outstanding requests, owned by one connection.
pub struct PendingTable {
    entries: HashMap<CorrelationId, PendingRequest>,
    retired: RetiredIds,
    stats: Arc<PendingStats>,
}

impl PendingTable {
    pub fn new(config: &RetiredIdsConfig) -> Self {
        Self {
            entries: HashMap::new(),
            retired: RetiredIds::new(config.ttl(), config.capacity),
            stats: Arc::new(PendingStats::default()),
        }
    }

    /// Register a pending request and get the receiver for its result.
    pub fn register(&mut self, correlation_id: CorrelationId, message_type: MessageType) -> ReplySlot {
        let (tx, rx) = oneshot::channel();

        let request = PendingRequest {
            slot: tx,
            message_type,
            created_at: Instant::now(),
        };

        self.entries.insert(correlation_id, request);
        self.stats.total_registered.fetch_add(1, Ordering::Relaxed);

        rx
    }

    /// Remove an entry and resolve it. The only way an entry ever leaves.
    ///
    /// Settling an id that is no longer live is a no-op.
    pub fn settle(&mut self, correlation_id: &CorrelationId, resolution: Resolution) -> Settlement {
        let Some(pending) = self.entries.remove(correlation_id) else {
            return if self.retired.contains(correlation_id) {
                Settlement::Retired
            } else {
                Settlement::Unknown
            };
        };

        self.stats.record(&resolution);

        let elapsed = pending.created_at.elapsed();
        let outcome = match resolution {
            Resolution::Reply(content) => Some(Ok(content)),
            Resolution::Fail(error) => Some(Err(error)),
            Resolution::Abandon => None,
            Resolution::Unsent => {
                debug!(
                    correlation_id = %correlation_id,
                    message_type = %pending.message_type,
                    "Removed unsent request"
                );
                return Settlement::Settled;
            }
        };

        self.retired.retire(correlation_id.clone());

        match outcome {
            Some(result) => {
                let ok = result.is_ok();
                if pending.slot.send(result).is_err() {
                    debug!(
                        correlation_id = %correlation_id,
                        "Pending request receiver dropped"
                    );
                } else {
                    debug!(
                        correlation_id = %correlation_id,
                        message_type = %pending.message_type,
                        success = ok,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Settled pending request"
                    );
                }
            }
            None => debug!(
                correlation_id = %correlation_id,
                message_type = %pending.message_type,
                elapsed_ms = elapsed.as_millis() as u64,
                "Abandoned pending request"
            ),
        }

        Settlement::Settled
    }

    /// Fail every live entry with the same error and leave the table empty.
    ///
    /// Returns the number of requests failed.
    pub fn fail_all(&mut self, error: TransportError) -> usize {
        let ids: Vec<CorrelationId> = self.entries.keys().cloned().collect();
        for id in &ids {
            self.settle(id, Resolution::Fail(error.clone()));
        }
        ids.len()
    }

    /// Get number of currently pending requests
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check if a correlation ID is pending
    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.entries.contains_key(correlation_id)
    }

    /// Get statistics
    pub fn stats(&self) -> Arc<PendingStats> {
        Arc::clone(&self.stats)
    }
}

/// Time- and size-bounded memory of ids that already ended.
///
/// Ids are retired in time order, so expiry and eviction both pop from the
/// front of the queue.
pub struct RetiredIds {
    /// id -> sequence number of its latest retirement
    seen: HashMap<CorrelationId, (u64, Instant)>,
    order: VecDeque<(CorrelationId, u64, Instant)>,
    next_seq: u64,
    ttl: Duration,
    capacity: usize,
}

impl RetiredIds {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            seen: HashMap::new(),
            order: VecDeque::new(),
            next_seq: 0,
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn retire(&mut self, correlation_id: CorrelationId) {
        let now = Instant::now();
        self.expire(now);

        let seq = self.next_seq;
        self.next_seq += 1;
        self.seen.insert(correlation_id.clone(), (seq, now));
        self.order.push_back((correlation_id, seq, now));

        while self.order.len() > self.capacity {
            self.pop_front();
        }
    }

    #[must_use]
    pub fn contains(&self, correlation_id: &CorrelationId) -> bool {
        self.seen
            .get(correlation_id)
            .is_some_and(|(_, retired_at)| retired_at.elapsed() < self.ttl)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn expire(&mut self, now: Instant) {
        while let Some((_, _, retired_at)) = self.order.front() {
            if now.duration_since(*retired_at) < self.ttl {
                break;
            }
            self.pop_front();
        }
    }

    fn pop_front(&mut self) {
        if let Some((id, seq, _)) = self.order.pop_front() {
            // Only forget the id if this queue entry is its latest retirement.
            if self.seen.get(&id).is_some_and(|(latest, _)| *latest == seq) {
                self.seen.remove(&id);
            }
        }
    }
}
