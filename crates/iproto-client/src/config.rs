use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use iproto_common::protocol::error::Result;

use crate::strategy::SelectionStrategyKind;

/// Produces the authentication scramble from a password and the server salt.
///
/// The cipher itself is supplied by the caller; the connection only frames
/// the `AUTH` request around whatever the cipher returns.
pub trait AuthCipher: Send + Sync {
    /// Method name sent alongside the scramble (for example `chap-sha1`).
    fn method(&self) -> &str;

    /// Computes the scramble for `password` using the greeting salt.
    fn scramble(&self, password: &str, salt: &[u8]) -> Result<Vec<u8>>;
}

/// User credentials together with the cipher used to prove them.
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
    pub cipher: Arc<dyn AuthCipher>,
}

impl Credentials {
    pub fn new(
        user: impl Into<String>,
        password: impl Into<String>,
        cipher: Arc<dyn AuthCipher>,
    ) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
            cipher,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .field("method", &self.cipher.method())
            .finish()
    }
}

/// Client configuration.
///
/// Built once before any connection is opened and never mutated by the
/// client afterwards.
///
/// # Default Configuration
///
/// - `connect_timeout`: 1000ms
/// - `read_timeout`: 1000ms
/// - `request_timeout`: 2000ms
/// - `connections`: 1 per server address
/// - `selection_strategy`: parallel round-robin
/// - `cluster_strategy`: random
/// - `reconnect_interval`: 1s
/// - `credentials`: none (guest session)
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use iproto_client::ClientConfig;
///
/// let config = ClientConfig {
///     connections: 4,
///     request_timeout: Duration::from_secs(5),
///     ..Default::default()
/// };
/// assert_eq!(config.connect_timeout, Duration::from_millis(1000));
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upper bound for opening a connection, handshake and authentication included
    pub connect_timeout: Duration,
    /// Upper bound for each read during the handshake
    pub read_timeout: Duration,
    /// Deadline applied to requests that do not carry their own
    pub request_timeout: Duration,
    /// Number of connections kept open per server address
    pub connections: usize,
    /// Picks a connection inside a pool
    pub selection_strategy: SelectionStrategyKind,
    /// Picks a pool among the cluster's addresses
    pub cluster_strategy: SelectionStrategyKind,
    /// How often pools replace failed connections
    pub reconnect_interval: Duration,
    /// Authenticate as this user; `None` keeps the guest session
    pub credentials: Option<Credentials>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(1000),
            read_timeout: Duration::from_millis(1000),
            request_timeout: Duration::from_millis(2000),
            connections: 1,
            selection_strategy: SelectionStrategyKind::ParallelRoundRobin,
            cluster_strategy: SelectionStrategyKind::Random,
            reconnect_interval: Duration::from_secs(1),
            credentials: None,
        }
    }
}
