pub mod address;
pub mod body;
pub mod error;
pub mod header;
pub mod keys;


pub use address::{ServerAddress, DEFAULT_PORT};
pub use error::{Error, Result, ER_NO_SUCH_PROC};
pub use header::{OpCode, ProtocolHeader, ProtocolMessage, RequestType, SyncId};
