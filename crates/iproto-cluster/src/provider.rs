//! Cluster address providers.
//!
//! A provider owns the current [`ClusterTopology`] and publishes every
//! change on a `watch` channel. Consumers either read the latest snapshot or
//! subscribe and react to changes; the manager does the latter.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rmpv::Value;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use iproto_client::RequestDispatcher;
use iproto_common::protocol::error::{Error, Result};
use iproto_common::protocol::ServerAddress;

/// Node statuses that count as healthy.
const HEALTHY_STATUSES: [&str; 2] = ["available", "healthy"];

/// A set of server addresses tagged with a monotonically increasing epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterTopology {
    pub addresses: BTreeSet<ServerAddress>,
    pub epoch: u64,
}

impl ClusterTopology {
    pub fn new(addresses: impl IntoIterator<Item = ServerAddress>, epoch: u64) -> Self {
        Self {
            addresses: addresses.into_iter().collect(),
            epoch,
        }
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// Source of the cluster's server addresses.
pub trait ClusterAddressProvider: Send + Sync {
    /// The latest topology.
    fn topology(&self) -> ClusterTopology;

    /// A receiver notified whenever the topology changes.
    fn subscribe(&self) -> watch::Receiver<ClusterTopology>;

    fn current_addresses(&self) -> Vec<ServerAddress> {
        self.topology().addresses.into_iter().collect()
    }

    /// Stops any background work. The last topology stays readable.
    fn close(&self) {}
}

/// A fixed list of addresses. Its topology has epoch 0 and never changes.
#[derive(Debug)]
pub struct StaticAddressProvider {
    sender: watch::Sender<ClusterTopology>,
}

impl StaticAddressProvider {
    pub fn new(addresses: impl IntoIterator<Item = ServerAddress>) -> Self {
        let (sender, _) = watch::channel(ClusterTopology::new(addresses, 0));
        Self { sender }
    }
}

impl ClusterAddressProvider for StaticAddressProvider {
    fn topology(&self) -> ClusterTopology {
        self.sender.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<ClusterTopology> {
        self.sender.subscribe()
    }
}

/// Discovery configuration.
///
/// # Default Configuration
///
/// - `function`: `get_routers`
/// - `delay`: 60s between polls
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Stored procedure returning the cluster's node records
    pub function: String,
    /// Pause between two polls
    pub delay: Duration,
}

impl DiscoveryConfig {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            function: "get_routers".to_string(),
            delay: Duration::from_secs(60),
        }
    }
}

/// Discovers addresses by calling a procedure on an entry endpoint.
///
/// The procedure returns node records, either as a map keyed by instance
/// uuid or as an array:
///
/// ```text
/// { "<uuid>": { "uri": "host:port", "status": "available" }, ... }
/// [ { "uuid": "<uuid>", "uri": "host:port", "status": "healthy" }, ... ]
/// ```
///
/// Only nodes whose status is `available` or `healthy` are kept. A new
/// topology (epoch + 1) is published only when the healthy set changes.
/// Failed polls and polls returning no healthy node keep the last known set.
pub struct DiscoveryAddressProvider {
    inner: Arc<DiscoveryInner>,
    shutdown: CancellationToken,
    poller: JoinHandle<()>,
}

struct DiscoveryInner {
    entry: Arc<dyn RequestDispatcher>,
    config: DiscoveryConfig,
    sender: watch::Sender<ClusterTopology>,
    // One poll at a time, scheduled or on demand
    polling: Mutex<()>,
}

impl DiscoveryInner {
    async fn fetch(&self) -> Result<BTreeSet<ServerAddress>> {
        let data = self
            .entry
            .call(&self.config.function, Vec::new())
            .await
            .map_err(|e| {
                Error::Discovery(format!("calling '{}' failed: {}", self.config.function, e))
            })?;
        parse_nodes(&data)
    }

    /// Publishes `addresses` if they differ from the current set.
    fn publish(&self, addresses: BTreeSet<ServerAddress>) -> bool {
        self.sender.send_if_modified(|topology| {
            if topology.addresses == addresses {
                return false;
            }
            topology.addresses = addresses;
            topology.epoch += 1;
            true
        })
    }

    async fn poll(&self) -> Result<bool> {
        let _serial = self.polling.lock().await;
        let addresses = match self.fetch().await {
            Ok(addresses) => addresses,
            Err(e) => {
                warn!(
                    function = %self.config.function,
                    error = %e,
                    "Discovery failed, keeping last known addresses"
                );
                return Err(e);
            }
        };

        if addresses.is_empty() {
            warn!(
                function = %self.config.function,
                "Discovery returned no healthy nodes, keeping last known addresses"
            );
            return Ok(false);
        }

        let changed = self.publish(addresses);
        if changed {
            let topology = self.sender.borrow().clone();
            info!(
                epoch = topology.epoch,
                nodes = topology.len(),
                "Discovered new cluster topology"
            );
        }
        Ok(changed)
    }
}

impl DiscoveryAddressProvider {
    /// Runs the first discovery and starts polling every `config.delay`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Discovery` if the first call fails or finds no
    /// healthy node, and `Error::Config` if `config.delay` is zero.
    pub async fn start(entry: Arc<dyn RequestDispatcher>, config: DiscoveryConfig) -> Result<Self> {
        if config.delay.is_zero() {
            return Err(Error::Config("discovery delay must not be zero".to_string()));
        }

        let (sender, _) = watch::channel(ClusterTopology::default());
        let inner = Arc::new(DiscoveryInner {
            entry,
            config,
            sender,
            polling: Mutex::new(()),
        });

        let addresses = inner.fetch().await?;
        if addresses.is_empty() {
            return Err(Error::Discovery(format!(
                "'{}' returned no healthy nodes",
                inner.config.function
            )));
        }
        inner.publish(addresses);

        let shutdown = CancellationToken::new();
        let poller = spawn_poller(Arc::clone(&inner), shutdown.clone());
        Ok(Self {
            inner,
            shutdown,
            poller,
        })
    }

    /// Runs one discovery cycle now. Returns whether the topology changed.
    pub async fn poll(&self) -> Result<bool> {
        self.inner.poll().await
    }
}

impl ClusterAddressProvider for DiscoveryAddressProvider {
    fn topology(&self) -> ClusterTopology {
        self.inner.sender.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<ClusterTopology> {
        self.inner.sender.subscribe()
    }

    fn close(&self) {
        self.shutdown.cancel();
    }
}

impl fmt::Debug for DiscoveryAddressProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryAddressProvider")
            .field("function", &self.inner.config.function)
            .field("delay", &self.inner.config.delay)
            .field("topology", &*self.inner.sender.borrow())
            .finish()
    }
}

impl Drop for DiscoveryAddressProvider {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.poller.abort();
    }
}

fn spawn_poller(inner: Arc<DiscoveryInner>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(inner.config.delay);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; the initial poll already ran
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            // Errors are logged inside poll
            let _ = inner.poll().await;
        }
        debug!(function = %inner.config.function, "Discovery stopped");
    })
}

/// Extracts the healthy addresses from a discovery response.
///
/// Stored procedures return their results as an array, so a single map or
/// array wrapped in one is unwrapped first.
pub fn parse_nodes(data: &Value) -> Result<BTreeSet<ServerAddress>> {
    let nodes = match data {
        Value::Array(items) if items.len() == 1 && !is_record(&items[0]) => &items[0],
        other => other,
    };

    let records: Vec<(Option<&Value>, &Value)> = match nodes {
        Value::Map(entries) => entries.iter().map(|(uuid, record)| (Some(uuid), record)).collect(),
        Value::Array(items) => items.iter().map(|record| (None, record)).collect(),
        Value::Nil => Vec::new(),
        other => {
            return Err(Error::Discovery(format!(
                "expected a map or an array of nodes, got {}",
                other
            )))
        }
    };

    let mut healthy = BTreeSet::new();
    for (uuid, record) in records {
        let uri = field(record, "uri").and_then(Value::as_str);
        let status = field(record, "status").and_then(Value::as_str);
        let uuid = uuid.or_else(|| field(record, "uuid"));

        let Some(uri) = uri else {
            debug!(?uuid, "Skipping node record without uri");
            continue;
        };
        if !status.is_some_and(|s| HEALTHY_STATUSES.contains(&s)) {
            debug!(uri, ?status, "Skipping unhealthy node");
            continue;
        }

        // uri may carry credentials: user:password@host:port
        let host_port = uri.rsplit_once('@').map_or(uri, |(_, rest)| rest);
        healthy.insert(host_port.parse::<ServerAddress>()?);
    }
    Ok(healthy)
}

fn field<'a>(record: &'a Value, name: &str) -> Option<&'a Value> {
    record
        .as_map()?
        .iter()
        .find(|(key, _)| key.as_str() == Some(name))
        .map(|(_, value)| value)
}

fn is_record(value: &Value) -> bool {
    field(value, "uri").is_some()
}
