#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::config::{AuthCipher, Credentials};
    use crate::connector::BoxedStream;
    use futures::future::BoxFuture;
    use iproto_common::protocol::keys;
    use rmpv::Value;
    use std::sync::Mutex as StdMutex;
    use tokio::io::DuplexStream;

    /// Hands out one end of an in-memory pipe, once.
    struct PipeConnector {
        client: StdMutex<Option<DuplexStream>>,
    }

    impl Connector for PipeConnector {
        fn connect<'a>(&'a self, _address: &'a ServerAddress) -> BoxFuture<'a, Result<BoxedStream>> {
            let stream = self.client.lock().unwrap().take();
            Box::pin(async move {
                stream
                    .map(|s| Box::new(s) as BoxedStream)
                    .ok_or_else(|| Error::Transport("pipe already used".into()))
            })
        }
    }

    /// Server end of the pipe, speaking just enough of the protocol.
    struct FakeServer {
        stream: DuplexStream,
        buffer: BytesMut,
    }

    impl FakeServer {
        async fn greet(&mut self) {
            let greeting = Greeting {
                server_version: "2.11.1".into(),
                protocol: "Binary".into(),
                instance_uuid: None,
                salt: vec![1; 20],
            };
            self.stream.write_all(&greeting.to_bytes()).await.unwrap();
        }

        async fn next_request(&mut self) -> ProtocolMessage {
            loop {
                if let Some((message, consumed)) = Framer::decode(&self.buffer).unwrap() {
                    self.buffer.advance(consumed);
                    return message;
                }
                let read = self.stream.read_buf(&mut self.buffer).await.unwrap();
                assert!(read > 0, "client hung up");
            }
        }

        async fn reply(&mut self, sync: u64, data: Value) {
            let body = body::data_body(data).unwrap();
            let frame = Framer::encode(&ProtocolHeader::new(sync, OpCode::Ok), &body).unwrap();
            self.stream.write_all(&frame).await.unwrap();
        }

        async fn reply_error(&mut self, sync: u64, code: u32, message: &str) {
            let body = body::error_body(message).unwrap();
            let frame = Framer::encode(&ProtocolHeader::new(sync, OpCode::Error(code)), &body).unwrap();
            self.stream.write_all(&frame).await.unwrap();
        }
    }

    fn address() -> ServerAddress {
        "db-1:3301".parse().unwrap()
    }

    fn pipe() -> (PipeConnector, FakeServer) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        (
            PipeConnector {
                client: StdMutex::new(Some(client)),
            },
            FakeServer {
                stream: server,
                buffer: BytesMut::new(),
            },
        )
    }

    async fn connected(config: &ClientConfig) -> (Connection, FakeServer) {
        let (connector, mut server) = pipe();
        server.greet().await;
        let connection = Connection::connect(address(), config, &connector).await.unwrap();
        (connection, server)
    }

    fn function_name(request: &ProtocolMessage) -> String {
        let value = body::decode_value(&request.body).unwrap();
        value
            .as_map()
            .unwrap()
            .iter()
            .find(|(k, _)| k.as_u64() == Some(keys::FUNCTION_NAME as u64))
            .and_then(|(_, v)| v.as_str().map(str::to_string))
            .unwrap()
    }

    async fn wait_for_pending(connection: &Connection, count: usize) {
        while connection.pending_count() != count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_connect_reads_greeting() {
        let (connection, _server) = connected(&ClientConfig::default()).await;

        assert!(connection.is_ready());
        assert_eq!(connection.greeting().server_version, "2.11.1");
        assert_eq!(connection.address(), &address());
        assert_eq!(connection.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_ping() {
        let (connection, mut server) = connected(&ClientConfig::default()).await;

        let responder = tokio::spawn(async move {
            let request = server.next_request().await;
            assert_eq!(request.header.code, OpCode::Request(RequestType::Ping));
            server.reply(request.header.sync, Value::Nil).await;
            server
        });

        connection.ping().await.unwrap();
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_requests_matched_by_sync() {
        let (connection, mut server) = connected(&ClientConfig::default()).await;
        let connection = Arc::new(connection);
        const N: usize = 16;

        // Answer in reverse order of arrival, echoing the function name
        let responder = tokio::spawn(async move {
            let mut requests = Vec::new();
            for _ in 0..N {
                requests.push(server.next_request().await);
            }
            for request in requests.into_iter().rev() {
                let name = function_name(&request);
                server.reply(request.header.sync, Value::from(name)).await;
            }
            server
        });

        let callers: Vec<_> = (0..N)
            .map(|i| {
                let connection = Arc::clone(&connection);
                tokio::spawn(async move {
                    let name = format!("fn_{}", i);
                    let request = body::call_body(&name, vec![]).unwrap();
                    let response = connection.send(RequestType::Call, request).await.unwrap();
                    (name, body::response_data(&response).unwrap())
                })
            })
            .collect();

        for caller in callers {
            let (name, data) = caller.await.unwrap();
            assert_eq!(data.as_str(), Some(name.as_str()));
        }
        responder.await.unwrap();
        assert_eq!(connection.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_server_error_reply() {
        let (connection, mut server) = connected(&ClientConfig::default()).await;

        let responder = tokio::spawn(async move {
            let request = server.next_request().await;
            server
                .reply_error(request.header.sync, 33, "Procedure 'nope' is not defined")
                .await;
            server
        });

        let request = body::call_body("nope", vec![]).unwrap();
        let err = connection.send(RequestType::Call, request).await.unwrap_err();
        assert!(err.is_no_such_procedure());
        assert!(err.to_string().contains("is not defined"));
        assert!(connection.is_ready());
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_resolves_pending_with_connection_closed() {
        let (connection, _server) = connected(&ClientConfig::default()).await;
        let connection = Arc::new(connection);

        let callers: Vec<_> = (0..3)
            .map(|_| {
                let connection = Arc::clone(&connection);
                tokio::spawn(async move {
                    connection
                        .send(RequestType::Ping, body::ping_body().unwrap())
                        .await
                })
            })
            .collect();
        wait_for_pending(&connection, 3).await;

        connection.close().await.unwrap();

        for caller in callers {
            assert!(matches!(caller.await.unwrap(), Err(Error::ConnectionClosed(_))));
        }
        assert_eq!(connection.pending_count(), 0);
        assert_eq!(connection.state(), ConnectionState::Closed);

        // Idempotent, and the connection refuses new work
        connection.close().await.unwrap();
        assert!(matches!(connection.ping().await, Err(Error::ConnectionClosed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_with_stalled_peer() {
        // The server greets, then never reads; a 1 MiB frame cannot fit the pipe
        let (connection, _server) = connected(&ClientConfig::default()).await;

        let err = connection
            .send_with_timeout(
                RequestType::Call,
                Bytes::from(vec![0u8; 1024 * 1024]),
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RequestTimeout { .. }));

        let closed = tokio::time::timeout(Duration::from_secs(3), connection.close()).await;
        assert!(closed.is_ok(), "close hung on a blocked write");
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(connection.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resolves_once_and_late_response_is_dropped() {
        let (connection, mut server) = connected(&ClientConfig::default()).await;

        let request = body::call_body("slow", vec![]).unwrap();
        let send = connection.send_with_timeout(RequestType::Call, request, Duration::from_millis(100));
        let (result, late) = tokio::join!(send, server.next_request());

        assert!(matches!(result, Err(Error::RequestTimeout { timeout_ms: 100, .. })));
        assert_eq!(connection.pending_count(), 0);

        // The late answer finds nothing to resolve and leaves the connection usable
        server.reply(late.header.sync, Value::from("late")).await;
        let responder = tokio::spawn(async move {
            let request = server.next_request().await;
            server.reply(request.header.sync, Value::from("fresh")).await;
            server
        });

        let request = body::call_body("fast", vec![]).unwrap();
        let response = connection.send(RequestType::Call, request).await.unwrap();
        assert_eq!(body::response_data(&response).unwrap(), Value::from("fresh"));
        assert!(connection.is_ready());
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_caller_removes_pending_entry() {
        let (connection, _server) = connected(&ClientConfig::default()).await;
        let connection = Arc::new(connection);

        let caller = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move {
                connection
                    .send(RequestType::Ping, body::ping_body().unwrap())
                    .await
            })
        };
        wait_for_pending(&connection, 1).await;

        caller.abort();
        let _ = caller.await;
        assert_eq!(connection.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_server_hangup_fails_pending() {
        let (connection, server) = connected(&ClientConfig::default()).await;
        let connection = Arc::new(connection);

        let caller = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move {
                connection
                    .send(RequestType::Ping, body::ping_body().unwrap())
                    .await
            })
        };
        wait_for_pending(&connection, 1).await;
        drop(server);

        let err = caller.await.unwrap().unwrap_err();
        assert!(err.is_network());
        assert_eq!(connection.state(), ConnectionState::Failed);
        assert_eq!(connection.pending_count(), 0);
        assert!(matches!(connection.ping().await, Err(Error::ConnectionClosed(_))));
    }

    #[tokio::test]
    async fn test_garbage_from_server_fails_with_framing_error() {
        let (connection, mut server) = connected(&ClientConfig::default()).await;
        let connection = Arc::new(connection);

        let caller = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move {
                connection
                    .send(RequestType::Ping, body::ping_body().unwrap())
                    .await
            })
        };
        server.next_request().await;
        server.stream.write_all(&[0xc1, 0x00, 0x00]).await.unwrap();

        assert!(matches!(caller.await.unwrap(), Err(Error::Framing(_))));
        assert_eq!(connection.state(), ConnectionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_without_greeting() {
        let (connector, _server) = pipe();
        let config = ClientConfig {
            connect_timeout: Duration::from_millis(50),
            ..Default::default()
        };

        let err = Connection::connect(address(), &config, &connector)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectTimeout { timeout_ms: 50, .. }));
    }

    #[tokio::test]
    async fn test_connect_rejects_foreign_greeting() {
        let (connector, mut server) = pipe();
        server.stream.write_all(&[b'x'; 128]).await.unwrap();

        let err = Connection::connect(address(), &ClientConfig::default(), &connector)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Handshake(_)));
    }

    struct Reversed;

    impl AuthCipher for Reversed {
        fn method(&self) -> &str {
            "reversed"
        }

        fn scramble(&self, password: &str, salt: &[u8]) -> Result<Vec<u8>> {
            let mut out: Vec<u8> = password.bytes().rev().collect();
            out.extend_from_slice(salt);
            Ok(out)
        }
    }

    fn with_credentials() -> ClientConfig {
        ClientConfig {
            credentials: Some(Credentials::new("admin", "secret", Arc::new(Reversed))),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_authentication_sends_scramble() {
        let (connector, mut server) = pipe();
        server.greet().await;

        let responder = tokio::spawn(async move {
            let request = server.next_request().await;
            assert_eq!(request.header.code, OpCode::Request(RequestType::Auth));
            let value = body::decode_value(&request.body).unwrap();
            let entries = value.as_map().unwrap();
            let user = entries
                .iter()
                .find(|(k, _)| k.as_u64() == Some(keys::USER_NAME as u64))
                .map(|(_, v)| v.clone());
            assert_eq!(user, Some(Value::from("admin")));
            server.reply(request.header.sync, Value::Nil).await;
            server
        });

        let connection = Connection::connect(address(), &with_credentials(), &connector)
            .await
            .unwrap();
        assert!(connection.is_ready());
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_authentication_rejected() {
        let (connector, mut server) = pipe();
        server.greet().await;

        let responder = tokio::spawn(async move {
            let request = server.next_request().await;
            server
                .reply_error(request.header.sync, 47, "Incorrect password supplied for user 'admin'")
                .await;
            server
        });

        let err = Connection::connect(address(), &with_credentials(), &connector)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authentication(ref m) if m.contains("Incorrect password")));
        responder.await.unwrap();
    }
}
