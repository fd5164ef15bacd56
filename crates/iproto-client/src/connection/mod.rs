//! A single multiplexed connection to one server.
//!
//! # Lifecycle
//!
//! ```text
//! Connecting -> Handshaking -> Authenticating -> Ready -> Closing -> Closed
//!                                                  \
//!                                                   Failed
//! ```
//!
//! `Authenticating` is skipped for guest sessions. Any non-terminal state
//! can move to `Failed` when the transport or the framing breaks.
//!
//! # Tasks
//!
//! Once ready, a connection owns two tasks:
//!
//! - **reader pump**: decodes frames and resolves pending requests by sync id
//! - **writer pump**: drains the outbound queue into the socket
//!
//! Callers never touch the socket; they register a pending entry, queue a
//! frame and wait on their own oneshot receiver.

pub mod correlation;
mod handshake;

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use iproto_common::protocol::body;
use iproto_common::protocol::error::{Error, Result};
use iproto_common::protocol::{OpCode, ProtocolHeader, ProtocolMessage, RequestType, ServerAddress};
use iproto_common::transport::{Framer, Greeting};

use crate::config::ClientConfig;
use crate::connector::Connector;

pub use correlation::{CorrelationTable, PendingRequest, SyncIdGenerator};
use correlation::PendingGuard;

/// Frames waiting for the writer pump before senders have to wait.
const OUTBOUND_QUEUE: usize = 1024;

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Upper bound for flushing and shutting down the socket on close.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Handshaking = 1,
    Authenticating = 2,
    Ready = 3,
    Closing = 4,
    Closed = 5,
    Failed = 6,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Handshaking,
            2 => ConnectionState::Authenticating,
            3 => ConnectionState::Ready,
            4 => ConnectionState::Closing,
            5 => ConnectionState::Closed,
            _ => ConnectionState::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

/// State shared between the connection handle and its pumps.
struct Shared {
    address: ServerAddress,
    state: AtomicU8,
    table: CorrelationTable,
    sync_ids: SyncIdGenerator,
    shutdown: CancellationToken,
}

impl Shared {
    fn new(address: ServerAddress) -> Self {
        Self {
            address,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            table: CorrelationTable::new(),
            sync_ids: SyncIdGenerator::new(),
            shutdown: CancellationToken::new(),
        }
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Moves to `to` unless the current state is one of `unless`.
    ///
    /// Returns the state the connection was in when the transition happened.
    fn transition(
        &self,
        to: ConnectionState,
        unless: &[ConnectionState],
    ) -> Option<ConnectionState> {
        self.state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |raw| {
                let current = ConnectionState::from_u8(raw);
                (!unless.contains(&current)).then_some(to as u8)
            })
            .ok()
            .map(ConnectionState::from_u8)
    }

    fn complete(&self, message: ProtocolMessage) {
        let sync = message.header.sync;
        let result = match message.header.code {
            OpCode::Error(code) => Err(body::response_error(code, &message.body)),
            _ => Ok(message.body),
        };
        if !self.table.resolve(sync, result) {
            debug!(address = %self.address, sync, "Dropping response with no pending request");
        }
    }

    /// Marks the connection failed and resolves everything in flight with `cause`.
    fn fail(&self, cause: Error) {
        let terminal = [
            ConnectionState::Closing,
            ConnectionState::Closed,
            ConnectionState::Failed,
        ];
        if self.transition(ConnectionState::Failed, &terminal).is_none() {
            return;
        }
        self.shutdown.cancel();
        let failed = self.table.fail_all(|| replicate(&cause));
        warn!(address = %self.address, error = %cause, failed, "Connection failed");
    }
}

/// Copy of a connection failure handed to each pending request.
fn replicate(cause: &Error) -> Error {
    match cause {
        Error::Framing(message) => Error::Framing(message.clone()),
        Error::Transport(message) => Error::Transport(message.clone()),
        Error::Timeout(message) => Error::Timeout(message.clone()),
        other => Error::Transport(other.to_string()),
    }
}

/// One pipelined connection to a server.
///
/// Cloning is not supported; share it behind an `Arc`. Dropping the
/// connection stops both pumps.
pub struct Connection {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Bytes>,
    greeting: Greeting,
    request_timeout: Duration,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Opens a connection, reads the greeting and authenticates if
    /// credentials are configured.
    ///
    /// The whole sequence is bounded by `config.connect_timeout`; whatever
    /// is still in progress when it expires is dropped.
    pub async fn connect(
        address: ServerAddress,
        config: &ClientConfig,
        connector: &dyn Connector,
    ) -> Result<Self> {
        let connect_timeout = config.connect_timeout;
        let establish = Self::establish(address.clone(), config, connector);
        match tokio::time::timeout(connect_timeout, establish).await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectTimeout {
                address: address.to_string(),
                timeout_ms: connect_timeout.as_millis() as u64,
            }),
        }
    }

    async fn establish(
        address: ServerAddress,
        config: &ClientConfig,
        connector: &dyn Connector,
    ) -> Result<Self> {
        let shared = Arc::new(Shared::new(address));
        let mut stream = connector.connect(&shared.address).await?;

        shared.set_state(ConnectionState::Handshaking);
        let greeting = handshake::read_greeting(&mut stream, config.read_timeout).await?;
        debug!(
            address = %shared.address,
            version = %greeting.server_version,
            "Received greeting"
        );

        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
        if let Some(credentials) = &config.credentials {
            shared.set_state(ConnectionState::Authenticating);
            let sync = shared.sync_ids.next();
            handshake::authenticate(
                &mut stream,
                &mut buffer,
                credentials,
                &greeting,
                sync,
                config.read_timeout,
            )
            .await?;
            debug!(address = %shared.address, user = %credentials.user, "Authenticated");
        }

        let (reader, writer) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);

        shared.set_state(ConnectionState::Ready);
        tokio::spawn(read_pump(Arc::clone(&shared), reader, buffer));
        let writer = tokio::spawn(write_pump(Arc::clone(&shared), writer, outbound_rx));

        debug!(address = %shared.address, "Connection ready");
        Ok(Self {
            shared,
            outbound,
            greeting,
            request_timeout: config.request_timeout,
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn address(&self) -> &ServerAddress {
        &self.shared.address
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn greeting(&self) -> &Greeting {
        &self.greeting
    }

    /// Number of requests sent and not yet resolved.
    pub fn pending_count(&self) -> usize {
        self.shared.table.len()
    }

    /// Deadline of the pending request that may run the longest.
    pub fn latest_deadline(&self) -> Option<Instant> {
        self.shared.table.latest_deadline()
    }

    /// Sends a request using the configured request timeout.
    pub async fn send(&self, code: RequestType, body: Bytes) -> Result<Bytes> {
        self.send_with_timeout(code, body, self.request_timeout).await
    }

    /// Sends a request and waits for the body of its response.
    ///
    /// # Errors
    ///
    /// - `Error::RequestTimeout` if no response arrives within `timeout`
    /// - `Error::Server` if the server answered with an error
    /// - `Error::ConnectionClosed` if the connection is not ready or is
    ///   closed while waiting
    /// - the connection's failure if it breaks while waiting
    pub async fn send_with_timeout(
        &self,
        code: RequestType,
        body: Bytes,
        timeout: Duration,
    ) -> Result<Bytes> {
        self.ensure_ready()?;

        let deadline = Instant::now() + timeout;
        let table = &self.shared.table;
        let (sync, mut response) = table.register(&self.shared.sync_ids, code, deadline);
        let _guard = PendingGuard::new(table, sync);

        // A failure between the check above and the registration has
        // already swept the table, so this entry would never be resolved.
        self.ensure_ready()?;

        let frame = Framer::encode(&ProtocolHeader::new(sync, code), &body)?;
        let exchange = async {
            if self.outbound.send(frame).await.is_err() {
                return Err(self.closed_error());
            }
            (&mut response).await.unwrap_or_else(|_| Err(self.closed_error()))
        };

        let outcome = tokio::time::timeout_at(deadline, exchange).await;
        match outcome {
            Ok(result) => result,
            Err(_) if table.cancel(sync) => {
                debug!(address = %self.shared.address, sync, "Request timed out");
                Err(Error::RequestTimeout {
                    sync,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            // Resolved right as the deadline fired
            Err(_) => response.await.unwrap_or_else(|_| Err(self.closed_error())),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        self.send(RequestType::Ping, body::ping_body()?).await?;
        Ok(())
    }

    /// Closes the connection.
    ///
    /// Every pending request is resolved with `Error::ConnectionClosed`.
    /// Closing twice, or closing a failed connection, does nothing.
    pub async fn close(&self) -> Result<()> {
        let terminal = [
            ConnectionState::Closing,
            ConnectionState::Closed,
            ConnectionState::Failed,
        ];
        if self
            .shared
            .transition(ConnectionState::Closing, &terminal)
            .is_none()
        {
            return Ok(());
        }

        debug!(address = %self.shared.address, "Closing connection");
        self.shared.shutdown.cancel();
        let address = self.shared.address.to_string();
        self.shared
            .table
            .fail_all(|| Error::ConnectionClosed(address.clone()));

        let writer = self.writer.lock().await.take();
        let result = match writer {
            Some(handle) => handle
                .await
                .map_err(|e| Error::Transport(format!("writer for {} failed: {}", address, e))),
            None => Ok(()),
        };
        self.shared.set_state(ConnectionState::Closed);
        result
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Ready => Ok(()),
            state => Err(Error::ConnectionClosed(format!(
                "{} is {:?}",
                self.shared.address, state
            ))),
        }
    }

    fn closed_error(&self) -> Error {
        Error::ConnectionClosed(self.shared.address.to_string())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.shared.address)
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish()
    }
}

async fn read_pump<R>(shared: Arc<Shared>, mut reader: R, mut buffer: BytesMut)
where
    R: AsyncRead + Unpin,
{
    let cause = loop {
        // Drain first: authentication may have left whole frames behind
        if let Err(e) = drain(&shared, &mut buffer) {
            break e;
        }

        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            read = reader.read_buf(&mut buffer) => match read {
                Ok(0) => {
                    break Error::Transport(format!("{}: connection closed by server", shared.address));
                }
                Ok(_) => {}
                Err(e) => break Error::from_io(e, &format!("reading from {}", shared.address)),
            },
        }
    };
    shared.fail(cause);
}

fn drain(shared: &Shared, buffer: &mut BytesMut) -> Result<()> {
    while let Some((message, consumed)) = Framer::decode(buffer)? {
        buffer.advance(consumed);
        shared.complete(message);
    }
    Ok(())
}

async fn write_pump<W>(shared: Arc<Shared>, mut writer: W, mut outbound: mpsc::Receiver<Bytes>)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        // A peer that stops reading must not keep the pump from stopping
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            written = writer.write_all(&frame) => {
                if let Err(e) = written {
                    shared.fail(Error::from_io(e, &format!("writing to {}", shared.address)));
                    break;
                }
            }
        }
    }
    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await;
}
