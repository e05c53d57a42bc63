//! RPC client core for query server communication.
//!
//! The query server is a long-running child process; the client speaks a
//! request/response/notification protocol over its stdin/stdout. Messages are
//! JSON framed with `Content-Length` headers. Each request carries a unique
//! ID for correlation with its response, enabling concurrent requests over a
//! single duplex channel; unsolicited notifications (progress, log lines) are
//! routed to registered handlers.

pub mod connection;
pub mod protocol;
pub mod transport;

mod error;

pub use connection::RpcConnection;
pub use error::{RpcError, RpcResult};
