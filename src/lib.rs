//! Pooled, cluster-aware client for servers speaking the iproto binary
//! protocol.
//!
//! This crate re-exports the workspace members:
//!
//! - [`common`]: addresses, errors, request/response bodies and framing
//! - [`client`]: connections, pools and selection strategies
//! - [`cluster`]: address providers, the cluster connection manager,
//!   retries and the [`Client`] facade

pub use iproto_client as client;
pub use iproto_cluster as cluster;
pub use iproto_common as common;

pub use iproto_client::{ClientConfig, RequestDispatcher};
pub use iproto_cluster::Client;
pub use iproto_common::{Error, Result, ServerAddress};
