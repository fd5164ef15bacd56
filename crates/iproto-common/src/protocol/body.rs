//! Request and response bodies.
//!
//! Bodies travel through the core as opaque bytes. These helpers build the
//! few request bodies the client issues itself (`PING`, `CALL`, `EVAL`,
//! `AUTH`) and read the `DATA` / `ERROR` keys out of response bodies.

use bytes::Bytes;
use rmpv::Value;

use crate::protocol::error::{Error, Result};
use crate::protocol::keys;

/// Encodes a single MessagePack value.
pub fn encode_value(value: &Value) -> Result<Bytes> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, value)?;
    Ok(Bytes::from(buf))
}

/// Decodes a single MessagePack value. An empty slice decodes to `Nil`.
pub fn decode_value(data: &[u8]) -> Result<Value> {
    if data.is_empty() {
        return Ok(Value::Nil);
    }
    let mut cursor = data;
    let value = rmpv::decode::read_value(&mut cursor)?;
    if !cursor.is_empty() {
        return Err(Error::InvalidResponse(format!(
            "{} trailing bytes after body",
            cursor.len()
        )));
    }
    Ok(value)
}

fn map(entries: Vec<(u8, Value)>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(key, value)| (Value::from(key), value))
            .collect(),
    )
}

pub fn ping_body() -> Result<Bytes> {
    encode_value(&Value::Map(Vec::new()))
}

/// Body of a `CALL` request invoking a stored function with positional arguments.
pub fn call_body(function: &str, args: Vec<Value>) -> Result<Bytes> {
    encode_value(&map(vec![
        (keys::FUNCTION_NAME, Value::from(function)),
        (keys::TUPLE, Value::Array(args)),
    ]))
}

/// Body of an `EVAL` request evaluating an expression with positional arguments.
pub fn eval_body(expression: &str, args: Vec<Value>) -> Result<Bytes> {
    encode_value(&map(vec![
        (keys::EXPR, Value::from(expression)),
        (keys::TUPLE, Value::Array(args)),
    ]))
}

/// Body of an `AUTH` request: the user name and `[method, scramble]`.
pub fn auth_body(user: &str, method: &str, scramble: &[u8]) -> Result<Bytes> {
    encode_value(&map(vec![
        (keys::USER_NAME, Value::from(user)),
        (
            keys::TUPLE,
            Value::Array(vec![Value::from(method), Value::Binary(scramble.to_vec())]),
        ),
    ]))
}

fn lookup(body: &Value, key: u8) -> Option<&Value> {
    body.as_map()?
        .iter()
        .find(|(k, _)| k.as_u64() == Some(key as u64))
        .map(|(_, v)| v)
}

/// Extracts the `DATA` value of a successful response body.
///
/// Responses without a `DATA` key (ping, auth) yield `Nil`.
pub fn response_data(body: &[u8]) -> Result<Value> {
    let value = decode_value(body)?;
    Ok(lookup(&value, keys::DATA).cloned().unwrap_or(Value::Nil))
}

/// Builds the error for a response whose header carried error `code`.
///
/// The message comes from the body's `ERROR` key; an unreadable body still
/// produces a server error so the code is never lost.
pub fn response_error(code: u32, body: &[u8]) -> Error {
    let message = decode_value(body)
        .ok()
        .and_then(|value| lookup(&value, keys::ERROR_24).and_then(|m| m.as_str().map(str::to_string)))
        .unwrap_or_else(|| "unknown error".to_string());
    Error::Server { code, message }
}

/// Body of an error response, as a server would send it.
pub fn error_body(message: &str) -> Result<Bytes> {
    encode_value(&map(vec![(keys::ERROR_24, Value::from(message))]))
}

/// Body of a successful response carrying `data`.
pub fn data_body(data: Value) -> Result<Bytes> {
    encode_value(&map(vec![(keys::DATA, data)]))
}
