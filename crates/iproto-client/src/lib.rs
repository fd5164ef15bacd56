pub mod config;
pub mod connection;
pub mod connector;
pub mod dispatcher;
pub mod pool;
pub mod strategy;

pub use config::{AuthCipher, ClientConfig, Credentials};
pub use connection::{Connection, ConnectionState};
pub use connector::{AsyncStream, BoxedStream, Connector, TcpConnector};
pub use dispatcher::{Request, RequestDispatcher};
pub use pool::ConnectionPool;
pub use strategy::{
    ParallelRoundRobin, Random, RoundRobin, SelectionStrategy, SelectionStrategyKind,
};
