use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use bytes::Bytes;
use futures::future::{join_all, BoxFuture};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use iproto_client::strategy::SelectionStrategy;
use iproto_client::{ClientConfig, ConnectionPool, Connector, Request, RequestDispatcher};
use iproto_common::protocol::error::{Error, Result};
use iproto_common::protocol::ServerAddress;

use crate::provider::{ClusterAddressProvider, ClusterTopology};

type PoolMap = BTreeMap<ServerAddress, Arc<ConnectionPool>>;

/// What a reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub epoch: u64,
    pub added: Vec<ServerAddress>,
    pub removed: Vec<ServerAddress>,
    /// The topology was older than the one already applied and was ignored
    pub stale: bool,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Keeps one connection pool per address of the cluster topology.
///
/// # Architecture
///
/// - the provider's topology is applied once on creation, then a single
///   task applies every update published on the provider's watch channel
/// - reconciliations are serialized and applied monotonically by epoch
/// - requests pick a pool that has a ready connection with the cluster
///   strategy; the pool map is an `Arc` snapshot swapped as a whole, so
///   dispatching never waits for a reconciliation
/// - pools leaving the topology are drained and closed in the background
pub struct ClusterConnectionManager {
    inner: Arc<ManagerInner>,
    reconciler: JoinHandle<()>,
}

struct ManagerInner {
    provider: Arc<dyn ClusterAddressProvider>,
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    strategy: Arc<dyn SelectionStrategy>,
    pools: RwLock<Arc<PoolMap>>,
    // Epoch of the last applied topology, None before the first one
    applied: Mutex<Option<u64>>,
    epoch: AtomicU64,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl ManagerInner {
    fn snapshot(&self) -> Arc<PoolMap> {
        Arc::clone(&self.pools.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn swap(&self, pools: PoolMap) -> Arc<PoolMap> {
        let mut current = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, Arc::new(pools))
    }

    /// Brings the pool set in line with `topology`.
    ///
    /// A topology older than the applied one is ignored; an equal epoch is
    /// only re-applied when `forced`.
    async fn reconcile(&self, topology: &ClusterTopology, forced: bool) -> ReconcileReport {
        let mut applied = self.applied.lock().await;
        let mut report = ReconcileReport {
            epoch: topology.epoch,
            ..Default::default()
        };

        if self.closed.load(Ordering::SeqCst) {
            return report;
        }
        if let Some(last) = *applied {
            if topology.epoch < last || (topology.epoch == last && !forced) {
                debug!(epoch = topology.epoch, applied = last, "Ignoring stale topology");
                report.stale = true;
                return report;
            }
        }

        let current = self.snapshot();
        report.removed = current
            .keys()
            .filter(|address| !topology.addresses.contains(*address))
            .cloned()
            .collect();
        report.added = topology
            .addresses
            .iter()
            .filter(|address| !current.contains_key(*address))
            .cloned()
            .collect();

        let opened = join_all(report.added.iter().map(|address| {
            ConnectionPool::connect(
                address.clone(),
                self.config.clone(),
                Arc::clone(&self.connector),
            )
        }))
        .await;

        let mut next = (*current).clone();
        let mut leaving = Vec::with_capacity(report.removed.len());
        for address in &report.removed {
            if let Some(pool) = next.remove(address) {
                leaving.push(pool);
            }
        }
        for (address, result) in report.added.iter().zip(opened) {
            match result {
                Ok(pool) => {
                    next.insert(address.clone(), Arc::new(pool));
                }
                Err(e) => warn!(address = %address, error = %e, "Failed to create pool"),
            }
        }
        self.swap(next);

        // Requests already running on a leaving pool finish or time out
        let drain_timeout = self.config.request_timeout;
        for pool in leaving {
            tokio::spawn(async move {
                if let Err(e) = pool.close_gracefully(drain_timeout).await {
                    warn!(address = %pool.address(), error = %e, "Failed to close removed pool");
                }
            });
        }

        *applied = Some(topology.epoch);
        self.epoch.store(topology.epoch, Ordering::SeqCst);

        if report.is_noop() {
            debug!(epoch = topology.epoch, "Topology applied without changes");
        } else {
            info!(
                epoch = topology.epoch,
                added = report.added.len(),
                removed = report.removed.len(),
                "Applied cluster topology"
            );
        }
        report
    }

    fn select_pool(&self) -> Result<Arc<ConnectionPool>> {
        let pools = self.snapshot();
        let candidates: Vec<_> = pools
            .values()
            .filter(|pool| pool.ready_count() > 0)
            .cloned()
            .collect();
        self.strategy.next(&candidates).cloned().ok_or_else(|| {
            Error::NoAvailableConnection(format!(
                "no ready connection among {} cluster address(es)",
                pools.len()
            ))
        })
    }
}

impl ClusterConnectionManager {
    /// Connects to every address the provider currently knows and follows
    /// its updates from then on.
    pub async fn connect(
        provider: Arc<dyn ClusterAddressProvider>,
        config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        if config.connections == 0 {
            return Err(Error::Config("connections must be at least 1".to_string()));
        }

        let mut updates = provider.subscribe();
        let topology = updates.borrow_and_update().clone();

        let inner = Arc::new(ManagerInner {
            strategy: config.cluster_strategy.build(),
            provider,
            config,
            connector,
            pools: RwLock::new(Arc::new(PoolMap::new())),
            applied: Mutex::new(None),
            epoch: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        inner.reconcile(&topology, false).await;
        let reconciler = spawn_reconciler(Arc::downgrade(&inner), updates, inner.shutdown.clone());

        Ok(Self { inner, reconciler })
    }

    /// Applies `topology` unless an equal or newer one was already applied.
    pub async fn reconcile(&self, topology: &ClusterTopology) -> ReconcileReport {
        self.inner.reconcile(topology, false).await
    }

    /// Re-applies the provider's current topology, even if its epoch was
    /// already applied.
    pub async fn refresh(&self) -> ReconcileReport {
        let topology = self.inner.provider.topology();
        self.inner.reconcile(&topology, true).await
    }

    /// Addresses that currently have a pool.
    pub fn addresses(&self) -> Vec<ServerAddress> {
        self.inner.snapshot().keys().cloned().collect()
    }

    pub fn pool(&self, address: &ServerAddress) -> Option<Arc<ConnectionPool>> {
        self.inner.snapshot().get(address).cloned()
    }

    /// Epoch of the last applied topology.
    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stops following the provider and closes every pool.
    ///
    /// Closing twice does nothing.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.shutdown.cancel();

        // Wait for a reconciliation in progress
        let _applied = self.inner.applied.lock().await;
        let pools = self.inner.swap(PoolMap::new());

        let results = join_all(pools.values().map(|pool| pool.close())).await;
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(()) => {}
                Err(Error::Close(errors)) => failures.extend(errors),
                Err(e) => failures.push(e.to_string()),
            }
        }

        debug!(pools = pools.len(), failed = failures.len(), "Cluster connections closed");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Close(failures))
        }
    }
}

impl RequestDispatcher for ClusterConnectionManager {
    fn dispatch(&self, request: Request) -> BoxFuture<'_, Result<Bytes>> {
        Box::pin(async move {
            let pool = self.inner.select_pool()?;
            pool.dispatch(request).await
        })
    }
}

impl std::fmt::Debug for ClusterConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConnectionManager")
            .field("epoch", &self.epoch())
            .field("addresses", &self.addresses())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for ClusterConnectionManager {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        self.reconciler.abort();
    }
}

/// Applies every topology published by the provider, one at a time.
fn spawn_reconciler(
    manager: Weak<ManagerInner>,
    mut updates: watch::Receiver<ClusterTopology>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = updates.changed() => {
                    if changed.is_err() {
                        debug!("Address provider dropped, no more topology updates");
                        break;
                    }
                }
            }

            let topology = updates.borrow_and_update().clone();
            let Some(manager) = manager.upgrade() else { break };
            manager.reconcile(&topology, false).await;
        }
    })
}
