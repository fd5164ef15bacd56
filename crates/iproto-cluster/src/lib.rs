//! Cluster support for the iproto client.
//!
//! - **[`provider`]**: where server addresses come from (a static list or a
//!   discovery procedure) and how topology changes are published
//! - **[`manager`]**: one connection pool per address, reconciled with the
//!   topology as it changes
//! - **[`retry`]**: retry policies and the dispatcher that applies them
//! - **[`Client`]**: the three combined behind one request dispatcher

pub mod client;
pub mod manager;
pub mod provider;
pub mod retry;

pub use client::Client;
pub use manager::{ClusterConnectionManager, ReconcileReport};
pub use provider::{
    ClusterAddressProvider, ClusterTopology, DiscoveryAddressProvider, DiscoveryConfig,
    StaticAddressProvider,
};
pub use retry::{ErrorPredicate, RetryDelay, RetryPolicy, RetryRule, RetryingDispatcher};
