use crate::s11n::ProtocolStatus;

use thiserror::Error;

use std::io;

/// Errors a handler may return. The dispatcher reports them on `FCGI_STDERR` and in the
/// request's app status.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
    /// I/O failure on the transport. Fatal to the connection.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The byte stream does not frame into valid records. Fatal to the connection.
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// A name-value pair stream could not be decoded. Fatal to the connection.
    #[error("invalid params encoding: {0}")]
    InvalidParamsEncoding(String),

    /// The connection already has `max_reqs` requests open.
    #[error("request {0} rejected: too many open requests")]
    OverloadedRequest(u16),

    /// A second request arrived on a connection that does not multiplex.
    #[error("request {0} rejected: connection does not multiplex")]
    MultiplexRejected(u16),

    /// The role is not one this crate knows, or no handler is registered for it.
    #[error("request {0} rejected: no handler for role {1}")]
    UnknownRole(u16, u16),

    /// A request buffered more of a stream than the connection holds for one request.
    /// Only that request is aborted.
    #[error("request {request_id}: more than {limit} bytes of {stream} buffered; aborting")]
    InputLimit { request_id: u16, stream: &'static str, limit: usize },

    #[error("handler failed: {0}")]
    HandlerFailure(String),

    /// The server already has `max_conns` connections open.
    #[error("connection refused: {0} connections already open")]
    AdmissionRejected(usize),

    /// The response has already been completed; nothing more can be written.
    #[error("response for request {0} is already complete")]
    ResponseComplete(u16),
}

impl Error {
    /// Whether the connection that produced this error must be closed.
    pub fn is_fatal(&self) -> bool {
        match *self {
            Error::Transport(_) | Error::MalformedRecord(_) | Error::InvalidParamsEncoding(_) => true,
            _ => false,
        }
    }

    /// The `FCGI_END_REQUEST` protocol status that reports a per-request rejection.
    pub fn protocol_status(&self) -> Option<ProtocolStatus> {
        match *self {
            Error::OverloadedRequest(_) => Some(ProtocolStatus::Overloaded),
            Error::MultiplexRejected(_) => Some(ProtocolStatus::CantMultiplexConnections),
            Error::UnknownRole(..) => Some(ProtocolStatus::UnknownRole),
            _ => None,
        }
    }
}

/// Shorthand for the error a writer sees once its connection is gone.
pub(crate) fn connection_closed() -> Error {
    Error::Transport(io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_framing_and_transport_are_fatal() {
        assert!(Error::Transport(io::ErrorKind::UnexpectedEof.into()).is_fatal());
        assert!(Error::MalformedRecord("x".into()).is_fatal());
        assert!(Error::InvalidParamsEncoding("x".into()).is_fatal());
        assert!(!Error::OverloadedRequest(1).is_fatal());
        assert!(!Error::MultiplexRejected(1).is_fatal());
        assert!(!Error::UnknownRole(1, 9).is_fatal());
        assert!(!Error::InputLimit { request_id: 1, stream: "stdin", limit: 4 }.is_fatal());
        assert!(!Error::HandlerFailure("x".into()).is_fatal());
        assert!(!Error::AdmissionRejected(1).is_fatal());
    }

    #[test]
    fn rejections_map_to_protocol_status() {
        assert_eq!(Error::OverloadedRequest(3).protocol_status(), Some(ProtocolStatus::Overloaded));
        assert_eq!(Error::MultiplexRejected(3).protocol_status(),
                   Some(ProtocolStatus::CantMultiplexConnections));
        assert_eq!(Error::UnknownRole(3, 9).protocol_status(), Some(ProtocolStatus::UnknownRole));
        assert_eq!(Error::HandlerFailure("x".into()).protocol_status(), None);
        assert_eq!(Error::InputLimit { request_id: 3, stream: "params", limit: 4 }
                       .protocol_status(), None);
    }
}
