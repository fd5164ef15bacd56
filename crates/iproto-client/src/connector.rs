use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use iproto_common::protocol::error::{Error, Result};
use iproto_common::protocol::ServerAddress;

/// A bidirectional byte stream a connection can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens transports to servers.
///
/// [`TcpConnector`] is used by default. A TLS-wrapping connector, or an
/// in-memory one in tests, plugs in here.
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, address: &'a ServerAddress) -> BoxFuture<'a, Result<BoxedStream>>;
}

/// Plain TCP connector.
///
/// Resolves the address (which may yield several socket addresses) and
/// tries each until one accepts. `TCP_NODELAY` is set because requests are
/// small and latency-bound.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl TcpConnector {
    async fn open(address: &ServerAddress) -> Result<TcpStream> {
        let socket_addrs = tokio::net::lookup_host((address.host(), address.port()))
            .await
            .map_err(|e| Error::InvalidAddress(format!("cannot resolve '{}': {}", address, e)))?;

        let mut last_err = None;
        for socket_addr in socket_addrs {
            match TcpStream::connect(socket_addr).await {
                Ok(stream) => {
                    stream
                        .set_nodelay(true)
                        .map_err(|e| Error::from_io(e, "setting TCP_NODELAY"))?;
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(Error::Transport(format!(
            "Failed to connect to {}: {}",
            address,
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "address resolved to nothing".to_string())
        )))
    }
}

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, address: &'a ServerAddress) -> BoxFuture<'a, Result<BoxedStream>> {
        Box::pin(async move {
            let stream = Self::open(address).await?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}
