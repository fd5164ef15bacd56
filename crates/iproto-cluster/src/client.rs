use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;

use iproto_client::{ClientConfig, Connector, Request, RequestDispatcher, TcpConnector};
use iproto_common::protocol::error::Result;
use iproto_common::protocol::ServerAddress;

use crate::manager::{ClusterConnectionManager, ReconcileReport};
use crate::provider::{ClusterAddressProvider, StaticAddressProvider};
use crate::retry::{RetryPolicy, RetryingDispatcher};

/// Cluster client: connection manager, address provider and retry policy
/// in one handle.
///
/// # Example
///
/// ```rust,no_run
/// use iproto_client::{ClientConfig, RequestDispatcher};
/// use iproto_cluster::Client;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Client::connect(
///     vec!["10.0.0.1:3301".parse()?, "10.0.0.2:3301".parse()?],
///     ClientConfig::default(),
/// )
/// .await?;
///
/// let data = client.call("box.info", vec![]).await?;
/// println!("{}", data);
///
/// client.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    provider: Arc<dyn ClusterAddressProvider>,
    dispatcher: RetryingDispatcher<Arc<ClusterConnectionManager>>,
}

impl Client {
    /// Connects to a fixed set of addresses over TCP, without retries.
    pub async fn connect(addresses: Vec<ServerAddress>, config: ClientConfig) -> Result<Self> {
        Self::with_provider(
            Arc::new(StaticAddressProvider::new(addresses)),
            config,
            Arc::new(TcpConnector),
            RetryPolicy::none(),
        )
        .await
    }

    pub async fn with_provider(
        provider: Arc<dyn ClusterAddressProvider>,
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let manager =
            ClusterConnectionManager::connect(Arc::clone(&provider), config, connector).await?;
        Ok(Self {
            provider,
            dispatcher: RetryingDispatcher::new(Arc::new(manager), policy),
        })
    }

    pub fn manager(&self) -> &ClusterConnectionManager {
        self.dispatcher.inner()
    }

    pub fn provider(&self) -> &dyn ClusterAddressProvider {
        self.provider.as_ref()
    }

    /// Re-applies the provider's current addresses.
    pub async fn refresh(&self) -> ReconcileReport {
        self.manager().refresh().await
    }

    /// Stops the provider and closes every connection.
    pub async fn close(&self) -> Result<()> {
        self.provider.close();
        self.manager().close().await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("manager", self.manager())
            .field("policy", self.dispatcher.policy())
            .finish()
    }
}

impl RequestDispatcher for Client {
    fn dispatch(&self, request: Request) -> BoxFuture<'_, Result<Bytes>> {
        self.dispatcher.dispatch(request)
    }
}
