use crate::params::Params;
use crate::s11n::Role;

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio::sync::mpsc;

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

/// Connection side of an input stream. Sending never waits; the connection checks
/// `buffered()` against its limit instead.
#[derive(Debug)]
pub(crate) struct InputSender {
    tx: mpsc::UnboundedSender<Bytes>,
    buffered: Arc<AtomicUsize>,
}

impl InputSender {
    /// Bytes sent that the handler has not taken yet.
    pub(crate) fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    /// Gives the chunk back if the handler dropped its end.
    pub(crate) fn send(&self, chunk: Bytes) -> Result<(), Bytes> {
        let len = chunk.len();
        self.buffered.fetch_add(len, Ordering::AcqRel);
        self.tx.send(chunk).map_err(|mpsc::error::SendError(chunk)| {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            chunk
        })
    }
}

pub(crate) fn input_channel() -> (InputSender, InputStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let buffered = Arc::new(AtomicUsize::new(0));
    (InputSender { tx, buffered: buffered.clone() }, InputStream { rx, buffered })
}

/// One input stream of a request (`FCGI_STDIN` or `FCGI_DATA`), delivered chunk by chunk
/// as records arrive.
///
/// The stream ends when the web server sends the terminating empty record, or when the
/// request is aborted. A handler that has no use for a stream should drop it. Unread
/// chunks are held for the handler up to a fixed limit; a request that falls further
/// behind than that is aborted.
#[derive(Debug)]
pub struct InputStream {
    rx: mpsc::UnboundedReceiver<Bytes>,
    buffered: Arc<AtomicUsize>,
}

impl InputStream {
    /// The next chunk, or `None` once the stream has terminated.
    pub async fn chunk(&mut self) -> Option<Bytes> {
        let chunk = self.rx.recv().await;
        self.taken(chunk)
    }

    /// Collects the rest of the stream.
    pub async fn read_to_end(&mut self) -> Bytes {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.chunk().await {
            out.extend_from_slice(&chunk);
        }
        out.freeze()
    }

    fn taken(&self, chunk: Option<Bytes>) -> Option<Bytes> {
        if let Some(ref chunk) = chunk {
            self.buffered.fetch_sub(chunk.len(), Ordering::AcqRel);
        }
        chunk
    }
}

impl Stream for InputStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Bytes>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(chunk) => Poll::Ready(self.taken(chunk)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// What a handler sees of a request.
#[derive(Debug)]
pub struct FastcgiRequest {
    pub role: Role,
    pub request_id: u16,
    pub keep_connection: bool,
    pub params: Params,
    pub stdin: InputStream,
    /// The `FCGI_DATA` stream; only present for the filter role.
    pub data: Option<InputStream>,
}

impl FastcgiRequest {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    /// `REQUEST_METHOD`, the method-equivalent of the request.
    pub fn method(&self) -> Option<&str> {
        self.params.get("REQUEST_METHOD")
    }

    /// Looks up an HTTP request header through its CGI name, so `header("Content-Type")`
    /// reads `CONTENT_TYPE` and `header("X-Foo")` reads `HTTP_X_FOO`.
    pub fn header(&self, name: &str) -> Option<&str> {
        let cgi_name = name.to_ascii_uppercase().replace('-', "_");
        match cgi_name.as_str() {
            "CONTENT_TYPE" | "CONTENT_LENGTH" => self.params.get(&cgi_name),
            _ => self.params.get(format!("HTTP_{}", cgi_name)),
        }
    }

    /// HTTP request headers carried in the params, as (`Header-Name`, value) pairs.
    pub fn headers(&self) -> Vec<(String, String)> {
        self.params.iter()
            .filter_map(|(name, value)| {
                let name = std::str::from_utf8(name).ok()?;
                let value = std::str::from_utf8(value).ok()?;
                let stripped = match name.strip_prefix("HTTP_") {
                    Some(rest) => rest,
                    None if name == "CONTENT_TYPE" || name == "CONTENT_LENGTH" => name,
                    None => return None,
                };
                Some((header_case(stripped), value.to_owned()))
            })
            .collect()
    }
}

/// `X_FORWARDED_FOR` -> `X-Forwarded-For`
fn header_case(cgi_name: &str) -> String {
    cgi_name.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                },
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
