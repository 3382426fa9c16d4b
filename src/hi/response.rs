use crate::error::{self, Error};
use crate::hi::codec::{EndRequest, FastcgiRecord, FastcgiRecordBody};
use crate::hi::connection::Outgoing;
use crate::hi::dispatch;
use crate::s11n::{ProtocolStatus, Role, MAX_CONTENT_LENGTH};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Output side of a request's lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputState {
    /// The handler is running and nothing has been written yet.
    Dispatched,
    /// Headers are out; body records follow as the handler writes them.
    Responding,
    /// `FCGI_END_REQUEST` has been queued.
    Done,
}

/// Everything the handler has set that is not yet on the wire.
#[derive(Debug)]
pub struct ResponseEnvelope {
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
    /// Authorizer variables, sent as `Variable-<name>` headers on success.
    pub variables: Vec<(String, String)>,
    pub stderr: BytesMut,
    pub app_status: u32,
}

impl ResponseEnvelope {
    fn new() -> ResponseEnvelope {
        ResponseEnvelope {
            status: None,
            headers: vec![(
                "X-Powered-By".to_owned(),
                concat!("tokio-fcgi-server/", env!("CARGO_PKG_VERSION")).to_owned(),
            )],
            variables: vec![],
            stderr: BytesMut::new(),
            app_status: 0,
        }
    }
}

fn set_pair(pairs: &mut Vec<(String, String)>, name: String, value: String) {
    match pairs.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(&name)) {
        Some(slot) => slot.1 = value,
        None => pairs.push((name, value)),
    }
}

/// How the handler's run ended.
#[derive(Debug)]
pub(crate) enum Outcome {
    Returned,
    Failed(String),
    Aborted,
}

#[derive(Debug)]
struct ResponseState {
    envelope: ResponseEnvelope,
    phase: OutputState,
}

#[derive(Debug)]
pub(crate) struct ResponseInner {
    request_id: u16,
    serial: u64,
    role: Role,
    keep_connection: bool,
    out: mpsc::Sender<Outgoing>,
    state: Mutex<ResponseState>,
}

impl ResponseInner {
    fn lock(&self) -> MutexGuard<ResponseState> {
        // Nothing panics while the lock is held; a poisoned lock still has a usable state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn send(&self, record: FastcgiRecordBody) -> Result<(), Error> {
        let record = FastcgiRecord { request_id: self.request_id, body: record };
        self.out.send(Outgoing::Record(record)).await.map_err(|_| error::connection_closed())
    }

    /// Moves to `Responding`, returning the header block if it still has to be sent.
    fn begin_output(&self) -> Result<Option<Bytes>, Error> {
        let mut state = self.lock();
        match state.phase {
            OutputState::Done => Err(Error::ResponseComplete(self.request_id)),
            OutputState::Responding => Ok(None),
            OutputState::Dispatched => {
                state.phase = OutputState::Responding;
                Ok(Some(dispatch::header_block(self.role, &mut state.envelope)))
            }
        }
    }

    async fn write_stdout(&self, data: &[u8]) -> Result<(), Error> {
        if let Some(head) = self.begin_output()? {
            debug!("request {}: sending {} bytes of headers", self.request_id, head.len());
            self.send(FastcgiRecordBody::Stdout(head)).await?;
        }
        for chunk in data.chunks(MAX_CONTENT_LENGTH) {
            self.send(FastcgiRecordBody::Stdout(Bytes::copy_from_slice(chunk))).await?;
        }
        Ok(())
    }

    /// Emits the closing records. Only the first call does anything.
    pub(crate) async fn complete(&self, outcome: Outcome) {
        let (head, stderr, app_status) = {
            let mut state = self.lock();
            let head = match (state.phase, &outcome) {
                (OutputState::Done, _) => return,
                (OutputState::Dispatched, Outcome::Returned) => {
                    Some(dispatch::header_block(self.role, &mut state.envelope))
                },
                (OutputState::Dispatched, Outcome::Failed(_)) => {
                    // Nothing went out yet, so the web server can still be told.
                    if state.envelope.status.is_none() {
                        state.envelope.status = Some(500);
                    }
                    Some(dispatch::header_block(self.role, &mut state.envelope))
                },
                _ => None,
            };
            state.phase = OutputState::Done;

            let envelope = &mut state.envelope;
            let app_status = match outcome {
                Outcome::Returned => envelope.app_status,
                Outcome::Failed(ref msg) => {
                    envelope.stderr.extend_from_slice(msg.as_bytes());
                    envelope.stderr.extend_from_slice(b"\n");
                    match envelope.app_status {
                        0 => dispatch::APP_STATUS_FAILURE,
                        status => status,
                    }
                },
                Outcome::Aborted => dispatch::APP_STATUS_FAILURE,
            };
            (head, envelope.stderr.split().freeze(), app_status)
        };

        if let Err(e) = self.send_epilogue(head, stderr, app_status, &outcome).await {
            debug!("request {}: could not finish response: {}", self.request_id, e);
        }
    }

    async fn send_epilogue(&self, head: Option<Bytes>, stderr: Bytes, app_status: u32,
                           outcome: &Outcome) -> Result<(), Error> {
        if !matches!(outcome, Outcome::Aborted) {
            if let Some(head) = head {
                self.send(FastcgiRecordBody::Stdout(head)).await?;
            }
            self.send(FastcgiRecordBody::Stdout(Bytes::new())).await?;
        }
        if !stderr.is_empty() {
            for chunk in stderr.chunks(MAX_CONTENT_LENGTH) {
                self.send(FastcgiRecordBody::Stderr(stderr.slice_ref(chunk))).await?;
            }
            self.send(FastcgiRecordBody::Stderr(Bytes::new())).await?;
        }

        debug!("request {}: sending end records, app status {}", self.request_id, app_status);
        let finished = Outgoing::Finished {
            request_id: self.request_id,
            serial: self.serial,
            end: EndRequest { app_status, protocol_status: ProtocolStatus::RequestComplete },
            keep_connection: self.keep_connection,
        };
        self.out.send(finished).await.map_err(|_| error::connection_closed())
    }
}

/// The handler's side of a response.
///
/// Status and headers can be changed until the first body write; they go out as one
/// CGI header block in front of the body. The body is streamed in `FCGI_STDOUT` records
/// as it is written. Stderr is buffered and sent when the response completes.
#[derive(Debug)]
pub struct FastcgiResponse {
    inner: Arc<ResponseInner>,
}

impl FastcgiResponse {
    pub(crate) fn new(request_id: u16, serial: u64, role: Role, keep_connection: bool,
                      out: mpsc::Sender<Outgoing>) -> FastcgiResponse {
        FastcgiResponse {
            inner: Arc::new(ResponseInner {
                request_id,
                serial,
                role,
                keep_connection,
                out,
                state: Mutex::new(ResponseState {
                    envelope: ResponseEnvelope::new(),
                    phase: OutputState::Dispatched,
                }),
            }),
        }
    }

    /// The handle the dispatcher keeps to complete the response after the handler is done.
    pub(crate) fn completion(&self) -> Arc<ResponseInner> {
        self.inner.clone()
    }

    pub fn request_id(&self) -> u16 {
        self.inner.request_id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn state(&self) -> OutputState {
        self.inner.lock().phase
    }

    fn headers_pending(&self, what: &str) -> Option<MutexGuard<ResponseState>> {
        let state = self.inner.lock();
        if state.phase == OutputState::Dispatched {
            Some(state)
        } else {
            warn!("request {}: {} after headers were sent; ignored", self.inner.request_id, what);
            None
        }
    }

    pub fn set_status(&mut self, status: u16) {
        if let Some(mut state) = self.headers_pending("status change") {
            state.envelope.status = Some(status);
        }
    }

    pub fn set_header<K: Into<String>, V: Into<String>>(&mut self, name: K, value: V) {
        if let Some(mut state) = self.headers_pending("header change") {
            set_pair(&mut state.envelope.headers, name.into(), value.into());
        }
    }

    pub fn clear_header(&mut self, name: &str) {
        if let Some(mut state) = self.headers_pending("header change") {
            state.envelope.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        }
    }

    /// Sets a variable for the web server to add to the authorized request.
    /// Only meaningful for the authorizer role.
    pub fn set_variable<K: Into<String>, V: Into<String>>(&mut self, name: K, value: V) {
        if self.inner.role != Role::Authorizer {
            warn!("request {}: variables are only sent by authorizers; ignored",
                  self.inner.request_id);
            return;
        }
        if let Some(mut state) = self.headers_pending("variable change") {
            set_pair(&mut state.envelope.variables, name.into(), value.into());
        }
    }

    /// The app status reported in `FCGI_END_REQUEST`; 0 unless set.
    pub fn set_app_status(&mut self, app_status: u32) {
        self.inner.lock().envelope.app_status = app_status;
    }

    /// Buffers data for `FCGI_STDERR`.
    pub fn write_stderr<B: AsRef<[u8]>>(&mut self, data: B) {
        self.inner.lock().envelope.stderr.extend_from_slice(data.as_ref());
    }

    /// Sends the header block now, if it hasn't been sent.
    pub async fn send_headers(&mut self) -> Result<(), Error> {
        self.inner.write_stdout(&[]).await
    }

    /// Writes body data, sending the headers first if needed.
    pub async fn write<B: AsRef<[u8]>>(&mut self, data: B) -> Result<(), Error> {
        self.inner.write_stdout(data.as_ref()).await
    }

    /// Ends the response right away instead of when the handler returns.
    pub async fn finish(self) -> Result<(), Error> {
        debug!("request {}: finishing response", self.inner.request_id);
        self.inner.complete(Outcome::Returned).await;
        Ok(())
    }
}
