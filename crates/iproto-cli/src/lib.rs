// Copyright 2025 iproto Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # iproto CLI
//!
//! Helpers behind the `iproto` binary. Arguments are typed on the command
//! line as JSON and results are printed as JSON, so this crate converts
//! between JSON and MessagePack values.

use anyhow::{Context, Result};
use rmpv::Value;
use serde_json::Value as Json;

/// Parses call arguments given as JSON.
///
/// A JSON array is taken as the argument list; any other value becomes the
/// single argument.
pub fn parse_args(raw: &str) -> Result<Vec<Value>> {
    let json: Json = serde_json::from_str(raw).context("arguments are not valid JSON")?;
    match json {
        Json::Array(items) => items.into_iter().map(json_to_value).collect(),
        other => Ok(vec![json_to_value(other)?]),
    }
}

pub fn json_to_value(json: Json) -> Result<Value> {
    rmpv::ext::to_value(json).context("failed to convert JSON to MessagePack")
}

/// Converts a MessagePack value to JSON.
///
/// Map keys that are not strings are printed with their JSON form, binary
/// data becomes an array of bytes and extension values become
/// `{"type": .., "data": [..]}`.
pub fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Nil => Json::Null,
        Value::Boolean(b) => Json::Bool(*b),
        Value::Integer(i) => match (i.as_u64(), i.as_i64()) {
            (Some(u), _) => Json::from(u),
            (None, Some(n)) => Json::from(n),
            (None, None) => Json::Null,
        },
        Value::F32(f) => Json::from(*f as f64),
        Value::F64(f) => Json::from(*f),
        Value::String(s) => Json::String(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        Value::Binary(bytes) => Json::Array(bytes.iter().map(|b| Json::from(*b)).collect()),
        Value::Array(items) => Json::Array(items.iter().map(value_to_json).collect()),
        Value::Map(entries) => Json::Object(
            entries
                .iter()
                .map(|(k, v)| (map_key(k), value_to_json(v)))
                .collect(),
        ),
        Value::Ext(kind, data) => serde_json::json!({
            "type": kind,
            "data": data,
        }),
    }
}

fn map_key(key: &Value) -> String {
    match key {
        Value::String(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
        other => value_to_json(other).to_string(),
    }
}
