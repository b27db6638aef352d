use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{oneshot, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{InvalidRequest, RequestError};
use crate::pdu::ModbusMessage;
use crate::types::UnitId;

/// A decoded response and the CRC check of the frame that carried it
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Received {
    pub(crate) message: ModbusMessage,
    pub(crate) integrity: Result<(), InvalidRequest>,
}

pub(crate) type ReplySender = oneshot::Sender<Result<Received, RequestError>>;
pub(crate) type ReplyReceiver = oneshot::Receiver<Result<Received, RequestError>>;

/// A request that was written and is waiting for its reply
pub(crate) struct PendingRequest {
    pub(crate) request: ModbusMessage,
    created_at: Instant,
    seq: u64,
    reply: ReplySender,
    // RTU: held until the request is answered or given up on
    _slot: Option<OwnedSemaphorePermit>,
}

impl PendingRequest {
    pub(crate) fn complete(self, result: Result<Received, RequestError>) {
        // the caller may have stopped waiting
        let _ = self.reply.send(result);
    }
}

#[derive(Default)]
struct Entries {
    by_key: HashMap<u16, PendingRequest>,
    /// RTU only: the request whose reply the half-duplex line is waiting for
    awaiting: Option<u16>,
    next_seq: u64,
}

/// Requests in flight, keyed by transaction id (TCP) or by an internal sequence key (RTU)
#[derive(Default)]
pub(crate) struct PendingTable {
    entries: Mutex<Entries>,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().by_key.len()
    }

    /// Record a request under `key`, returning its sequence number and the receiving end of its reply
    pub(crate) fn insert(
        &self,
        key: u16,
        request: ModbusMessage,
        slot: Option<OwnedSemaphorePermit>,
    ) -> (u64, ReplyReceiver) {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.lock();
        let seq = entries.next_seq;
        entries.next_seq += 1;
        let previous = entries.by_key.insert(
            key,
            PendingRequest {
                request,
                created_at: Instant::now(),
                seq,
                reply: tx,
                _slot: slot,
            },
        );
        if let Some(previous) = previous {
            tracing::warn!("transaction id {:#06X} reused while a request was still pending", key);
            previous.complete(Err(RequestError::Expired));
        }
        (seq, rx)
    }

    /// Mark `key` as the request the line is waiting on
    pub(crate) fn await_reply(&self, key: u16) {
        self.lock().awaiting = Some(key);
    }

    /// Sequence number and request of the entry under `key`, left in the table
    pub(crate) fn peek(&self, key: u16) -> Option<(u64, ModbusMessage)> {
        self.lock()
            .by_key
            .get(&key)
            .map(|x| (x.seq, x.request.clone()))
    }

    /// Key, sequence number and request the line is waiting on, if it was addressed to `unit_id`
    pub(crate) fn peek_awaiting(&self, unit_id: UnitId) -> Option<(u16, u64, ModbusMessage)> {
        let entries = self.lock();
        let key = entries.awaiting?;
        entries
            .by_key
            .get(&key)
            .filter(|x| x.request.unit_id() == unit_id)
            .map(|x| (key, x.seq, x.request.clone()))
    }

    /// Take the entry, but only if it still belongs to the same request
    pub(crate) fn take_matching(&self, key: u16, seq: u64) -> Option<PendingRequest> {
        let mut entries = self.lock();
        if entries.by_key.get(&key).map(|x| x.seq) != Some(seq) {
            return None;
        }
        if entries.awaiting == Some(key) {
            entries.awaiting = None;
        }
        entries.by_key.remove(&key)
    }

    /// Forget the entry, but only if it still belongs to the same request
    pub(crate) fn remove(&self, key: u16, seq: u64) {
        drop(self.take_matching(key, seq));
    }

    /// Fail every entry with `err`
    pub(crate) fn fail_all(&self, err: RequestError) {
        let drained: Vec<PendingRequest> = {
            let mut entries = self.lock();
            entries.awaiting = None;
            entries.by_key.drain().map(|(_, x)| x).collect()
        };
        if !drained.is_empty() {
            tracing::warn!("failing {} pending request(s): {}", drained.len(), err);
        }
        for entry in drained {
            entry.complete(Err(err));
        }
    }

    /// Fail every entry older than `ttl` with [`RequestError::Expired`]
    pub(crate) fn expire(&self, ttl: Duration, now: Instant) -> usize {
        let expired: Vec<PendingRequest> = {
            let mut entries = self.lock();
            let keys: Vec<u16> = entries
                .by_key
                .iter()
                .filter(|(_, x)| now.saturating_duration_since(x.created_at) > ttl)
                .map(|(key, _)| *key)
                .collect();
            if let Some(awaiting) = entries.awaiting {
                if keys.contains(&awaiting) {
                    entries.awaiting = None;
                }
            }
            keys.iter()
                .filter_map(|key| entries.by_key.remove(key))
                .collect()
        };
        let count = expired.len();
        for entry in expired {
            entry.complete(Err(RequestError::Expired));
        }
        count
    }
}

/// Periodically expire stale entries
///
/// The sweep period is twice the TTL.
pub(crate) fn spawn_sweeper(table: Arc<PendingTable>, ttl: Duration) -> JoinHandle<()> {
    let period = ttl.saturating_mul(2).max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            interval.tick().await;
            let count = table.expire(ttl, Instant::now());
            if count > 0 {
                tracing::warn!("{} pending request(s) expired without a reply", count);
            }
        }
    })
}
