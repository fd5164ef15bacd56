use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;

use iproto_common::protocol::error::{Error, Result};
use iproto_common::protocol::{RequestType, SyncId};

/// Hands out sync ids for one connection.
///
/// The first id is 1. After `u64::MAX` the counter wraps back to 1; 0 is
/// never produced.
#[derive(Debug)]
pub struct SyncIdGenerator {
    last: AtomicU64,
}

impl SyncIdGenerator {
    pub fn new() -> Self {
        Self::starting_after(0)
    }

    /// A generator whose next id follows `last`.
    pub fn starting_after(last: SyncId) -> Self {
        Self {
            last: AtomicU64::new(last),
        }
    }

    pub fn next(&self) -> SyncId {
        let advance = |n: SyncId| if n == SyncId::MAX { 1 } else { n + 1 };
        match self
            .last
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(advance(n)))
        {
            Ok(previous) | Err(previous) => advance(previous),
        }
    }
}

impl Default for SyncIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// A request waiting for its response.
#[derive(Debug)]
pub struct PendingRequest {
    pub code: RequestType,
    pub deadline: Instant,
    sender: oneshot::Sender<Result<Bytes>>,
}

/// In-flight requests of one connection, keyed by sync id.
///
/// Removing an entry is what resolves it: whoever removes it (the reader
/// pump, the deadline timer, the dropped caller, or a connection failure)
/// is the only one that delivers a result.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: DashMap<SyncId, PendingRequest>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new pending request under the next free sync id.
    ///
    /// Ids still pending (possible after the generator wraps) are skipped.
    pub fn register(
        &self,
        sync_ids: &SyncIdGenerator,
        code: RequestType,
        deadline: Instant,
    ) -> (SyncId, oneshot::Receiver<Result<Bytes>>) {
        loop {
            let sync = sync_ids.next();
            if let Entry::Vacant(slot) = self.entries.entry(sync) {
                let (sender, receiver) = oneshot::channel();
                slot.insert(PendingRequest {
                    code,
                    deadline,
                    sender,
                });
                return (sync, receiver);
            }
        }
    }

    /// Delivers `result` to the request registered under `sync`.
    ///
    /// Returns `false` if no such request is pending anymore.
    pub fn resolve(&self, sync: SyncId, result: Result<Bytes>) -> bool {
        match self.entries.remove(&sync) {
            Some((_, pending)) => {
                // The caller may have gone away in the meantime
                let _ = pending.sender.send(result);
                true
            }
            None => false,
        }
    }

    /// Removes the request without delivering anything.
    pub fn cancel(&self, sync: SyncId) -> bool {
        self.entries.remove(&sync).is_some()
    }

    /// Resolves every pending request with an error built by `error`.
    ///
    /// Returns how many requests were failed.
    pub fn fail_all(&self, error: impl Fn() -> Error) -> usize {
        let mut failed = 0;
        for sync in self.sync_ids() {
            if self.resolve(sync, Err(error())) {
                failed += 1;
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, sync: SyncId) -> bool {
        self.entries.contains_key(&sync)
    }

    pub fn sync_ids(&self) -> Vec<SyncId> {
        self.entries.iter().map(|entry| *entry.key()).collect()
    }

    /// The furthest deadline among pending requests.
    pub fn latest_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|entry| entry.value().deadline).max()
    }
}

/// Removes a pending entry when the waiting caller goes away.
///
/// Dropping it after the entry was resolved is a no-op.
pub(crate) struct PendingGuard<'a> {
    table: &'a CorrelationTable,
    sync: SyncId,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(table: &'a CorrelationTable, sync: SyncId) -> Self {
        Self { table, sync }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.cancel(self.sync);
    }
}
