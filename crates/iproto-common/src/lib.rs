//! iproto common types and framing
//!
//! This crate holds everything the client crates share about the binary
//! protocol itself:
//!
//! - **Protocol Layer**: addresses, headers and op codes, request/response
//!   body helpers, and the error taxonomy
//! - **Transport Layer**: the streaming frame codec and the server greeting
//!
//! # Wire Protocol
//!
//! - **Transport**: TCP, one session per connection, requests pipelined
//! - **Serialization**: MessagePack
//! - **Message Format**: `[MessagePack uint length] + [header map] + [body]`
//! - **Correlation**: the header `sync` field pairs a response with its request
//!
//! # Example
//!
//! ```
//! use iproto_common::protocol::{body, ProtocolHeader, RequestType};
//! use iproto_common::transport::Framer;
//!
//! let body = body::call_body("box.info", vec![]).unwrap();
//! let frame = Framer::encode(&ProtocolHeader::new(1, RequestType::Call), &body).unwrap();
//! let (message, _) = Framer::decode(&frame).unwrap().unwrap();
//! assert_eq!(message.header.sync, 1);
//! ```

pub mod protocol;
pub mod transport;

pub use protocol::*;
