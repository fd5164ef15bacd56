//! In-process iproto server for integration tests.
//!
//! Listens on `127.0.0.1:0`, greets every connection, answers `PING` and
//! `CALL` of registered functions, and can drop all of its connections to
//! simulate a server restart.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use rmpv::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use iproto_common::protocol::{body, keys, OpCode, ProtocolHeader, RequestType, ServerAddress};
use iproto_common::transport::{Framer, Greeting};
use iproto_common::ER_NO_SUCH_PROC;

/// Error code and message returned by a handler.
pub type Failure = (u32, String);

type Handler = Arc<dyn Fn(&[Value]) -> Result<Value, Failure> + Send + Sync>;

#[derive(Default)]
struct State {
    functions: Mutex<HashMap<String, Handler>>,
    delay: Mutex<Duration>,
    connections: Mutex<Vec<JoinHandle<()>>>,
    accepted: AtomicUsize,
    calls: AtomicUsize,
}

pub struct MockServer {
    address: ServerAddress,
    state: Arc<State>,
    acceptor: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = ServerAddress::from(listener.local_addr().unwrap());
        let state = Arc::new(State::default());

        let acceptor = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    state.accepted.fetch_add(1, Ordering::SeqCst);
                    let handle = tokio::spawn(serve(stream, Arc::clone(&state)));
                    state.connections.lock().unwrap().push(handle);
                }
            })
        };

        Self {
            address,
            state,
            acceptor,
        }
    }

    pub fn address(&self) -> ServerAddress {
        self.address.clone()
    }

    pub fn register(
        &self,
        name: &str,
        handler: impl Fn(&[Value]) -> Result<Value, Failure> + Send + Sync + 'static,
    ) {
        self.state
            .functions
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::new(handler));
    }

    /// Registers a function that always returns `value`.
    pub fn register_value(&self, name: &str, value: Value) {
        self.register(name, move |_| Ok(value.clone()));
    }

    /// Delay applied before answering every request from now on.
    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock().unwrap() = delay;
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// `CALL` requests received so far.
    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Closes every open connection; the server keeps accepting new ones.
    pub fn drop_connections(&self) {
        for handle in self.state.connections.lock().unwrap().drain(..) {
            handle.abort();
        }
    }

    pub fn shutdown(&self) {
        self.acceptor.abort();
        self.drop_connections();
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Discovery records in the layout routers report them:
/// `{uuid: {uri, status}}`.
pub fn node_records(nodes: &[(&ServerAddress, &str)]) -> Value {
    Value::Map(
        nodes
            .iter()
            .enumerate()
            .map(|(i, (address, status))| {
                (
                    Value::from(format!("uuid-{}", i)),
                    Value::Map(vec![
                        (Value::from("uri"), Value::from(format!("admin:secret@{}", address))),
                        (Value::from("status"), Value::from(*status)),
                    ]),
                )
            })
            .collect(),
    )
}

async fn serve(stream: TcpStream, state: Arc<State>) {
    let (mut reader, mut writer) = stream.into_split();
    let greeting = Greeting {
        server_version: "2.11.1".into(),
        protocol: "Binary".into(),
        instance_uuid: None,
        salt: vec![7; 20],
    };
    if writer.write_all(&greeting.to_bytes()).await.is_err() {
        return;
    }

    let (replies, mut outbound) = mpsc::unbounded_channel::<Bytes>();
    let pump = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let mut buffer = BytesMut::new();
    loop {
        while let Ok(Some((message, consumed))) = Framer::decode(&buffer) {
            buffer.advance(consumed);
            let state = Arc::clone(&state);
            let replies = replies.clone();
            tokio::spawn(async move {
                let delay = *state.delay.lock().unwrap();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let frame = answer(&state, message.header.sync, message.header.code, &message.body);
                let _ = replies.send(frame);
            });
        }

        match reader.read_buf(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
    pump.abort();
}

fn answer(state: &State, sync: u64, code: OpCode, request: &[u8]) -> Bytes {
    let result = match code {
        OpCode::Request(RequestType::Ping) => Ok(Value::Nil),
        OpCode::Request(RequestType::Call) => {
            state.calls.fetch_add(1, Ordering::SeqCst);
            call(state, request)
        }
        other => Err((48, format!("Unsupported request {:?}", other))),
    };

    let (code, body) = match result {
        Ok(data) => (OpCode::Ok, body::data_body(data).unwrap()),
        Err((code, message)) => (OpCode::Error(code), body::error_body(&message).unwrap()),
    };
    Framer::encode(&ProtocolHeader::new(sync, code), &body).unwrap()
}

fn call(state: &State, request: &[u8]) -> Result<Value, Failure> {
    let value = body::decode_value(request).unwrap();
    let field = |key: u8| {
        value
            .as_map()
            .and_then(|map| map.iter().find(|(k, _)| k.as_u64() == Some(key as u64)))
            .map(|(_, v)| v.clone())
    };
    let name = field(keys::FUNCTION_NAME)
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    let args = match field(keys::TUPLE) {
        Some(Value::Array(args)) => args,
        _ => Vec::new(),
    };

    let handler = state.functions.lock().unwrap().get(&name).cloned();
    match handler {
        Some(handler) => handler(&args),
        None => Err((
            ER_NO_SUCH_PROC,
            format!("Procedure '{}' is not defined", name),
        )),
    }
}

/// Polls `condition` every 10ms, panicking after 5s.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
