use bytes::Bytes;
use rmpv::Value;

use crate::protocol::error::{Error, Result};
use crate::protocol::keys;

/// Per-connection identifier correlating a request with its response.
pub type SyncId = u64;

/// Bit set in the response code when the server reports an error.
const ERROR_FLAG: u32 = 0x8000;

/// Request types understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Select,
    Insert,
    Replace,
    Update,
    Delete,
    Auth,
    Eval,
    Upsert,
    Call,
    Execute,
    Ping,
    Id,
}

impl RequestType {
    pub fn code(self) -> u32 {
        match self {
            RequestType::Select => 1,
            RequestType::Insert => 2,
            RequestType::Replace => 3,
            RequestType::Update => 4,
            RequestType::Delete => 5,
            RequestType::Auth => 7,
            RequestType::Eval => 8,
            RequestType::Upsert => 9,
            RequestType::Call => 10,
            RequestType::Execute => 11,
            RequestType::Ping => 64,
            RequestType::Id => 73,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        let ty = match code {
            1 => RequestType::Select,
            2 => RequestType::Insert,
            3 => RequestType::Replace,
            4 => RequestType::Update,
            5 => RequestType::Delete,
            7 => RequestType::Auth,
            8 => RequestType::Eval,
            9 => RequestType::Upsert,
            10 => RequestType::Call,
            11 => RequestType::Execute,
            64 => RequestType::Ping,
            73 => RequestType::Id,
            _ => return None,
        };
        Some(ty)
    }
}

/// The code carried in a message header.
///
/// Requests carry a [`RequestType`]; responses carry either `Ok` or an
/// error with the server's error number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Request(RequestType),
    Ok,
    Error(u32),
    Unknown(u32),
}

impl OpCode {
    pub fn from_raw(raw: u32) -> Self {
        if raw == 0 {
            OpCode::Ok
        } else if raw & ERROR_FLAG != 0 {
            OpCode::Error(raw & !ERROR_FLAG)
        } else {
            RequestType::from_code(raw)
                .map(OpCode::Request)
                .unwrap_or(OpCode::Unknown(raw))
        }
    }

    pub fn as_raw(self) -> u32 {
        match self {
            OpCode::Request(ty) => ty.code(),
            OpCode::Ok => 0,
            OpCode::Error(code) => code | ERROR_FLAG,
            OpCode::Unknown(raw) => raw,
        }
    }

    pub fn is_error(self) -> bool {
        matches!(self, OpCode::Error(_))
    }
}

impl From<RequestType> for OpCode {
    fn from(ty: RequestType) -> Self {
        OpCode::Request(ty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolHeader {
    pub sync: SyncId,
    pub code: OpCode,
    pub schema_id: Option<u64>,
}

impl ProtocolHeader {
    pub fn new(sync: SyncId, code: impl Into<OpCode>) -> Self {
        Self {
            sync,
            code: code.into(),
            schema_id: None,
        }
    }

    pub fn with_schema_id(mut self, schema_id: u64) -> Self {
        self.schema_id = Some(schema_id);
        self
    }

    /// Header as the MessagePack map written on the wire.
    pub fn to_value(&self) -> Value {
        let mut entries = vec![
            (Value::from(keys::REQUEST_TYPE), Value::from(self.code.as_raw())),
            (Value::from(keys::SYNC), Value::from(self.sync)),
        ];
        if let Some(schema_id) = self.schema_id {
            entries.push((Value::from(keys::SCHEMA_VERSION), Value::from(schema_id)));
        }
        Value::Map(entries)
    }

    /// Reads a header from its MessagePack map. Unknown keys are ignored.
    pub fn from_value(value: &Value) -> Result<Self> {
        let entries = value
            .as_map()
            .ok_or_else(|| Error::Framing(format!("header is not a map: {}", value)))?;

        let mut code = None;
        let mut sync = None;
        let mut schema_id = None;
        for (key, val) in entries {
            match key.as_u64() {
                Some(k) if k == keys::REQUEST_TYPE as u64 => code = val.as_u64(),
                Some(k) if k == keys::SYNC as u64 => sync = val.as_u64(),
                Some(k) if k == keys::SCHEMA_VERSION as u64 => schema_id = val.as_u64(),
                _ => {}
            }
        }

        let code = code.ok_or_else(|| Error::Framing("header has no code".to_string()))?;
        let code = u32::try_from(code)
            .map_err(|_| Error::Framing(format!("header code {} out of range", code)))?;
        let sync = sync.ok_or_else(|| Error::Framing("header has no sync".to_string()))?;

        Ok(Self {
            sync,
            code: OpCode::from_raw(code),
            schema_id,
        })
    }
}

/// One decoded frame: a header and the still-encoded body.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolMessage {
    pub header: ProtocolHeader,
    pub body: Bytes,
}

impl ProtocolMessage {
    pub fn new(header: ProtocolHeader, body: Bytes) -> Self {
        Self { header, body }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_raw_mapping() {
        assert_eq!(OpCode::from_raw(0), OpCode::Ok);
        assert_eq!(OpCode::from_raw(10), OpCode::Request(RequestType::Call));
        assert_eq!(OpCode::from_raw(0x8000 | 33), OpCode::Error(33));
        assert_eq!(OpCode::from_raw(99), OpCode::Unknown(99));

        assert_eq!(OpCode::Error(33).as_raw(), 0x8021);
        assert_eq!(OpCode::Request(RequestType::Ping).as_raw(), 64);
    }

    #[test]
    fn test_request_type_codes_are_consistent() {
        for code in 0..128 {
            if let Some(ty) = RequestType::from_code(code) {
                assert_eq!(ty.code(), code);
            }
        }
    }

    #[test]
    fn test_header_value_with_schema() {
        let header = ProtocolHeader::new(7, RequestType::Select).with_schema_id(42);
        let parsed = ProtocolHeader::from_value(&header.to_value()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_header_missing_sync_is_framing_error() {
        let value = Value::Map(vec![(Value::from(0u8), Value::from(0u8))]);
        let err = ProtocolHeader::from_value(&value).unwrap_err();
        assert!(matches!(err, Error::Framing(_)));
    }

    #[test]
    fn test_header_not_a_map() {
        let err = ProtocolHeader::from_value(&Value::from("nope")).unwrap_err();
        assert!(matches!(err, Error::Framing(_)));
    }
}
