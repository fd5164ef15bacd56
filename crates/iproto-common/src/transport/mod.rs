//! Transport layer: frame encoding/decoding and the server greeting.
//!
//! # Wire Format
//!
//! Every message is one frame:
//!
//! ```text
//! [MessagePack uint length] [header map] [body]
//! ```
//!
//! Before the first frame the server sends a fixed-size [`Greeting`]
//! carrying its version and the salt used for authentication.
//!
//! # Components
//!
//! - **[`Framer`]**: streaming encode/decode of frames
//! - **[`Greeting`]**: parsing of the 128-byte server greeting

pub mod frame;
pub mod greeting;

pub use frame::{Framer, MAX_FRAME_SIZE};
pub use greeting::{Greeting, GREETING_SIZE};
