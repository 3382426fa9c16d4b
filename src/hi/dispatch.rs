//! Role dispatch: runs the registered handler for a request and shapes its output for the role.

use crate::error::Error;
use crate::hi::handler::FastcgiRequestHandler;
use crate::hi::request::FastcgiRequest;
use crate::hi::response::{FastcgiResponse, Outcome, ResponseEnvelope};
use crate::params::Params;
use crate::s11n::Role;

use bytes::{BufMut, Bytes, BytesMut};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// App status reported for failed or aborted requests that didn't set their own.
pub const APP_STATUS_FAILURE: u32 = 1;

/// Params an authorizer must not see.
const AUTHORIZER_HIDDEN_PARAMS: [&str; 4] =
    ["CONTENT_LENGTH", "PATH_INFO", "PATH_TRANSLATED", "SCRIPT_NAME"];

/// Prefix under which authorizer variables reach the web server.
const VARIABLE_PREFIX: &str = "Variable-";

pub(crate) fn strip_authorizer_params(params: &mut Params) {
    for name in AUTHORIZER_HIDDEN_PARAMS.iter() {
        if params.remove(name).is_some() {
            debug!("hiding {} from authorizer", name);
        }
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "",
    }
}

fn put_header(out: &mut BytesMut, name: &str, value: &str) {
    out.put_slice(name.as_bytes());
    out.put_slice(b": ");
    out.put_slice(value.as_bytes());
    out.put_slice(b"\r\n");
}

/// The CGI header block for a response: status line, headers, and for a successful
/// authorizer its variables, followed by the blank line.
pub(crate) fn header_block(role: Role, envelope: &mut ResponseEnvelope) -> Bytes {
    let status = envelope.status.unwrap_or(200);
    let mut out = BytesMut::new();

    let reason = reason_phrase(status);
    let status_value = if reason.is_empty() {
        status.to_string()
    } else {
        format!("{} {}", status, reason)
    };
    put_header(&mut out, "Status", &status_value);

    if role == Role::Authorizer {
        if (200..300).contains(&status) {
            for (name, value) in envelope.variables.iter() {
                put_header(&mut out, &format!("{}{}", VARIABLE_PREFIX, name), value);
            }
        } else if !envelope.variables.is_empty() {
            debug!("authorizer denied with status {}; dropping {} variables",
                   status, envelope.variables.len());
        }
        envelope.variables.clear();
    }

    for (name, value) in envelope.headers.iter() {
        put_header(&mut out, name, value);
    }
    out.put_slice(b"\r\n");
    out.freeze()
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", msg)
    } else {
        "handler panicked".to_owned()
    }
}

/// Starts the handler for a request whose params are complete.
///
/// The handler runs in its own task. Whatever happens to it (return, error, panic or
/// cancellation through `cancel`), the response is completed with an `FCGI_END_REQUEST`.
pub(crate) fn spawn(
    handler: Arc<dyn FastcgiRequestHandler>,
    mut request: FastcgiRequest,
    response: FastcgiResponse,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    if request.role == Role::Authorizer {
        strip_authorizer_params(&mut request.params);
    }

    macro_rules! param {
        ($name:expr) => {
            request.params.get($name).unwrap_or(concat!("<no ", $name, " set!>"))
        }
    }
    info!("request {}: {:?} {} {} from {}", request.request_id, request.role,
          param!("REQUEST_METHOD"), param!("REQUEST_URI"), param!("REMOTE_ADDR"));

    let request_id = request.request_id;
    let completion = response.completion();
    tokio::spawn(async move {
        let call = AssertUnwindSafe(async move { handler.call(request, response).await })
            .catch_unwind();
        let outcome = tokio::select! {
            result = call => match result {
                Ok(Ok(())) => Outcome::Returned,
                Ok(Err(e)) => {
                    let err = Error::HandlerFailure(e.to_string());
                    error!("request {}: {}", request_id, err);
                    Outcome::Failed(err.to_string())
                },
                Err(panic) => {
                    let err = Error::HandlerFailure(panic_message(&*panic));
                    error!("request {}: {}", request_id, err);
                    Outcome::Failed(err.to_string())
                },
            },
            _ = cancel.cancelled() => {
                info!("request {}: aborted", request_id);
                Outcome::Aborted
            },
        };
        completion.complete(outcome).await;
    })
}
