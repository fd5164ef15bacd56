use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::protocol::error::{Error, Result};

/// Size of the greeting a server sends right after accepting a connection.
pub const GREETING_SIZE: usize = 128;

const LINE_SIZE: usize = GREETING_SIZE / 2;

/// The server's initial greeting.
///
/// Two 64-byte lines: `Tarantool <version> (<protocol>) <instance uuid>`
/// and the base64-encoded per-connection salt used for authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub server_version: String,
    pub protocol: String,
    pub instance_uuid: Option<String>,
    pub salt: Vec<u8>,
}

impl Greeting {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != GREETING_SIZE {
            return Err(Error::Handshake(format!(
                "greeting must be {} bytes, got {}",
                GREETING_SIZE,
                data.len()
            )));
        }

        let identity = line(&data[..LINE_SIZE])?;
        let mut parts = identity.split_whitespace();
        match parts.next() {
            Some("Tarantool") => {}
            _ => {
                return Err(Error::Handshake(format!(
                    "unexpected server identity '{}'",
                    identity
                )))
            }
        }
        let server_version = parts
            .next()
            .ok_or_else(|| Error::Handshake("greeting has no server version".to_string()))?
            .to_string();
        let protocol = parts
            .next()
            .map(|p| p.trim_matches(|c| c == '(' || c == ')').to_string())
            .unwrap_or_else(|| "Binary".to_string());
        let instance_uuid = parts.next().map(str::to_string);

        let salt = STANDARD.decode(line(&data[LINE_SIZE..])?)?;
        if salt.is_empty() {
            return Err(Error::Handshake("greeting has an empty salt".to_string()));
        }

        Ok(Self {
            server_version,
            protocol,
            instance_uuid,
            salt,
        })
    }

    /// Renders a greeting the way a server writes it.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut identity = format!("Tarantool {} ({})", self.server_version, self.protocol);
        if let Some(uuid) = &self.instance_uuid {
            identity.push(' ');
            identity.push_str(uuid);
        }
        let mut out = Vec::with_capacity(GREETING_SIZE);
        out.extend_from_slice(&padded(&identity));
        out.extend_from_slice(&padded(&STANDARD.encode(&self.salt)));
        out
    }
}

fn line(raw: &[u8]) -> Result<&str> {
    std::str::from_utf8(raw)
        .map(|s| s.trim_end_matches(['\n', ' ', '\0']))
        .map_err(|e| Error::Handshake(format!("greeting is not UTF-8: {}", e)))
}

fn padded(text: &str) -> [u8; LINE_SIZE] {
    let mut line = [b' '; LINE_SIZE];
    let len = text.len().min(LINE_SIZE - 1);
    line[..len].copy_from_slice(&text.as_bytes()[..len]);
    line[LINE_SIZE - 1] = b'\n';
    line
}
