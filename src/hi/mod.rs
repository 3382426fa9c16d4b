//! The high-level engine: typed records, connections, requests and responses.

pub mod codec;
pub(crate) mod connection;
pub(crate) mod dispatch;
pub mod handler;
pub mod request;
pub mod response;
pub(crate) mod state;
