use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use iproto_common::protocol::error::{Error, Result};
use iproto_common::protocol::ServerAddress;

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::connector::Connector;
use crate::strategy::SelectionStrategy;

/// How often a graceful close checks whether requests are still in flight.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A fixed-size set of connections to one server address.
///
/// # Architecture
///
/// - `config.connections` connections are opened concurrently on creation
/// - [`acquire`](Self::acquire) asks the selection strategy to pick among
///   the connections that are currently ready; it never waits
/// - a maintenance task replaces failed connections every
///   `config.reconnect_interval` until the pool is closed or dropped
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use iproto_client::{ClientConfig, ConnectionPool, TcpConnector};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ClientConfig { connections: 4, ..Default::default() };
/// let pool = ConnectionPool::connect("127.0.0.1:3301".parse()?, config, Arc::new(TcpConnector)).await?;
///
/// let connection = pool.acquire()?;
/// connection.ping().await?;
///
/// pool.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    maintenance: JoinHandle<()>,
}

struct PoolInner {
    address: ServerAddress,
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    strategy: Arc<dyn SelectionStrategy>,
    connections: RwLock<Vec<Arc<Connection>>>,
    // Serializes replenishing with itself and with close
    replenishing: Mutex<()>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl PoolInner {
    fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn replenish(&self) -> usize {
        let _serial = self.replenishing.lock().await;
        if self.shutdown.is_cancelled() {
            return 0;
        }

        let live = self
            .snapshot()
            .iter()
            .filter(|connection| !connection.state().is_terminal())
            .count();
        let missing = self.config.connections.saturating_sub(live);

        let mut opened = Vec::with_capacity(missing);
        if missing > 0 {
            let attempts = (0..missing).map(|_| {
                Connection::connect(self.address.clone(), &self.config, self.connector.as_ref())
            });
            for result in join_all(attempts).await {
                match result {
                    Ok(connection) => opened.push(Arc::new(connection)),
                    Err(e) => warn!(address = %self.address, error = %e, "Failed to open connection"),
                }
            }
        }

        let count = opened.len();
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        connections.retain(|connection| !connection.state().is_terminal());
        connections.extend(opened);
        count
    }
}

impl ConnectionPool {
    /// Opens a pool of `config.connections` connections to `address`.
    ///
    /// Connection failures are logged and do not fail the pool; the
    /// maintenance task keeps retrying them.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `config.connections` or
    /// `config.reconnect_interval` is zero.
    pub async fn connect(
        address: ServerAddress,
        config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        if config.connections == 0 {
            return Err(Error::Config("connections must be at least 1".to_string()));
        }
        if config.reconnect_interval.is_zero() {
            return Err(Error::Config("reconnect interval must not be zero".to_string()));
        }

        let inner = Arc::new(PoolInner {
            strategy: config.selection_strategy.build(),
            address,
            config,
            connector,
            connections: RwLock::new(Vec::new()),
            replenishing: Mutex::new(()),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        let opened = inner.replenish().await;
        debug!(
            address = %inner.address,
            opened,
            wanted = inner.config.connections,
            "Connection pool created"
        );

        let maintenance = spawn_maintenance(
            Arc::downgrade(&inner),
            inner.shutdown.clone(),
            inner.config.reconnect_interval,
        );
        Ok(Self { inner, maintenance })
    }

    pub fn address(&self) -> &ServerAddress {
        &self.inner.address
    }

    /// Picks a ready connection.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoAvailableConnection` when no connection is ready.
    pub fn acquire(&self) -> Result<Arc<Connection>> {
        let ready: Vec<_> = self
            .inner
            .snapshot()
            .into_iter()
            .filter(|connection| connection.is_ready())
            .collect();
        self.inner
            .strategy
            .next(&ready)
            .cloned()
            .ok_or_else(|| {
                Error::NoAvailableConnection(format!("no ready connection to {}", self.inner.address))
            })
    }

    /// Number of connections held, ready or not.
    pub fn size(&self) -> usize {
        self.inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn ready_count(&self) -> usize {
        self.inner
            .snapshot()
            .iter()
            .filter(|connection| connection.is_ready())
            .count()
    }

    /// Requests sent through this pool and not yet resolved.
    pub fn in_flight(&self) -> usize {
        self.inner
            .snapshot()
            .iter()
            .map(|connection| connection.pending_count())
            .sum()
    }

    /// Latest deadline among requests in flight on any connection.
    pub fn latest_deadline(&self) -> Option<Instant> {
        self.inner
            .snapshot()
            .iter()
            .filter_map(|connection| connection.latest_deadline())
            .max()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Drops failed or closed connections and opens new ones up to the
    /// configured count. Returns how many connections were opened.
    pub async fn replenish(&self) -> usize {
        self.inner.replenish().await
    }

    /// Closes every connection.
    ///
    /// All connections are closed even if some fail; the failures are
    /// collected into `Error::Close`. Closing twice does nothing.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.shutdown.cancel();

        let _serial = self.inner.replenishing.lock().await;
        let connections = std::mem::take(
            &mut *self
                .inner
                .connections
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        );

        let results = join_all(connections.iter().map(|connection| connection.close())).await;
        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|result| result.err())
            .map(|e| e.to_string())
            .collect();

        debug!(
            address = %self.inner.address,
            closed = connections.len(),
            failed = failures.len(),
            "Connection pool closed"
        );
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Close(failures))
        }
    }

    /// Waits for in-flight requests to finish, then closes the pool. The
    /// pool keeps serving requests while it drains.
    ///
    /// Waiting stops after `drain_timeout` or once the latest request
    /// deadline has passed, whichever comes later; requests carrying a
    /// longer timeout than `drain_timeout` are not cut short.
    pub async fn close_gracefully(&self, drain_timeout: Duration) -> Result<()> {
        let floor = Instant::now() + drain_timeout;
        loop {
            if self.in_flight() == 0 {
                break;
            }
            let deadline = self.latest_deadline().map_or(floor, |latest| latest.max(floor));
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        let remaining = self.in_flight();
        if remaining > 0 {
            warn!(
                address = %self.inner.address,
                remaining,
                "Closing pool with requests still in flight"
            );
        }
        self.close().await
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        self.maintenance.abort();
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("address", &self.inner.address)
            .field("size", &self.size())
            .field("ready", &self.ready_count())
            .finish()
    }
}

/// Replaces failed connections until the pool is closed or dropped.
fn spawn_maintenance(
    pool: Weak<PoolInner>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(pool) = pool.upgrade() else { break };
            let opened = pool.replenish().await;
            if opened > 0 {
                info!(address = %pool.address, opened, "Replaced failed connections");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::SelectionStrategyKind;
    use crate::connector::TcpConnector;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_zero_connections_is_rejected() {
        let config = ClientConfig {
            connections: 0,
            ..Default::default()
        };
        let result =
            ConnectionPool::connect("127.0.0.1:1".parse().unwrap(), config, Arc::new(TcpConnector)).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_unreachable_server_still_creates_pool() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = ServerAddress::from(listener.local_addr().unwrap());
        drop(listener);

        let config = ClientConfig {
            connections: 3,
            selection_strategy: SelectionStrategyKind::RoundRobin,
            ..Default::default()
        };
        let pool = ConnectionPool::connect(address, config, Arc::new(TcpConnector))
            .await
            .unwrap();

        assert_eq!(pool.size(), 0);
        assert_eq!(pool.ready_count(), 0);
        assert!(matches!(pool.acquire(), Err(Error::NoAvailableConnection(_))));

        pool.close().await.unwrap();
        assert!(pool.is_closed());
        // closing twice is fine
        pool.close().await.unwrap();
    }
}
