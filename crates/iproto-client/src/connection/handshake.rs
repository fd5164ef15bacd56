//! Greeting and authentication, run before the pumps take over the stream.

use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use iproto_common::protocol::body;
use iproto_common::protocol::error::{Error, Result};
use iproto_common::protocol::{OpCode, ProtocolHeader, ProtocolMessage, RequestType, SyncId};
use iproto_common::transport::{Framer, Greeting, GREETING_SIZE};

use crate::config::Credentials;

pub(crate) async fn read_greeting<S>(stream: &mut S, read_timeout: Duration) -> Result<Greeting>
where
    S: AsyncRead + Unpin,
{
    let mut raw = [0u8; GREETING_SIZE];
    tokio::time::timeout(read_timeout, stream.read_exact(&mut raw))
        .await
        .map_err(|_| {
            Error::Handshake(format!(
                "no greeting within {}ms",
                read_timeout.as_millis()
            ))
        })?
        .map_err(|e| Error::from_io(e, "reading greeting"))?;
    Greeting::parse(&raw)
}

/// Sends the `AUTH` request and waits for its reply.
///
/// Bytes read past the reply stay in `buffer` for the reader pump.
pub(crate) async fn authenticate<S>(
    stream: &mut S,
    buffer: &mut BytesMut,
    credentials: &Credentials,
    greeting: &Greeting,
    sync: SyncId,
    read_timeout: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let scramble = credentials
        .cipher
        .scramble(&credentials.password, &greeting.salt)?;
    let request = body::auth_body(&credentials.user, credentials.cipher.method(), &scramble)?;
    let frame = Framer::encode(&ProtocolHeader::new(sync, RequestType::Auth), &request)?;
    stream
        .write_all(&frame)
        .await
        .map_err(|e| Error::from_io(e, "sending auth request"))?;

    let reply = tokio::time::timeout(read_timeout, read_frame(stream, buffer))
        .await
        .map_err(|_| {
            Error::Handshake(format!(
                "no auth reply within {}ms",
                read_timeout.as_millis()
            ))
        })??;

    if reply.header.sync != sync {
        return Err(Error::Handshake(format!(
            "auth reply carries sync {}, expected {}",
            reply.header.sync, sync
        )));
    }

    match reply.header.code {
        OpCode::Ok => Ok(()),
        OpCode::Error(code) => match body::response_error(code, &reply.body) {
            Error::Server { message, .. } => Err(Error::Authentication(message)),
            other => Err(Error::Authentication(other.to_string())),
        },
        other => Err(Error::Handshake(format!(
            "unexpected auth reply code {:?}",
            other
        ))),
    }
}

async fn read_frame<S>(stream: &mut S, buffer: &mut BytesMut) -> Result<ProtocolMessage>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some((message, consumed)) = Framer::decode(buffer)? {
            buffer.advance(consumed);
            return Ok(message);
        }
        let read = stream
            .read_buf(buffer)
            .await
            .map_err(|e| Error::from_io(e, "reading auth reply"))?;
        if read == 0 {
            return Err(Error::Handshake(
                "server closed the connection during authentication".to_string(),
            ));
        }
    }
}
