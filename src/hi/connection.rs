//! One web server connection: routes incoming records to requests and serializes the
//! records they produce.
//!
//! The reading half runs the request table; every request's handler runs in its own
//! task. All output goes through one channel to the writer task so records reach the
//! transport one at a time, in the order each request produced them.

use crate::config::ServerConfig;
use crate::error::{self, Error};
use crate::hi::codec::{BeginRequest, EndRequest, FastcgiCodec, FastcgiRecord, FastcgiRecordBody};
use crate::hi::dispatch;
use crate::hi::handler::Handlers;
use crate::hi::request::FastcgiRequest;
use crate::hi::response::FastcgiResponse;
use crate::hi::state::{Action, InputKind, RequestSlot, Streams};
use crate::params::Params;
use crate::s11n::{ProtocolStatus, MANAGEMENT_REQUEST_ID};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use std::collections::HashMap;
use std::sync::Arc;

/// Records that may wait for the writer before handlers have to.
const OUTPUT_QUEUE: usize = 64;

/// What every connection of a server reads and nothing writes.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) config: ServerConfig,
    /// Answers to `FCGI_GET_VALUES`.
    pub(crate) values: HashMap<String, String>,
    pub(crate) handlers: Handlers,
}

impl Shared {
    pub(crate) fn new(config: ServerConfig, handlers: Handlers) -> Shared {
        let values = config.management_values();
        Shared { config, values, handlers }
    }
}

/// Work for the writer task.
#[derive(Debug)]
pub(crate) enum Outgoing {
    Record(FastcgiRecord),
    /// The `FCGI_END_REQUEST` that retires a request.
    Finished {
        request_id: u16,
        serial: u64,
        end: EndRequest,
        keep_connection: bool,
    },
}

/// Sent back by the writer once a request's end record is flushed.
#[derive(Debug)]
struct Completion {
    request_id: u16,
    serial: u64,
}

struct Connection {
    shared: Arc<Shared>,
    requests: HashMap<u16, RequestSlot>,
    next_serial: u64,
    out: mpsc::Sender<Outgoing>,
}

/// Runs a connection until the peer closes it, a request without keep-connection ends,
/// or a fatal error. Requests still open at that point are aborted.
pub(crate) async fn serve<IO>(io: IO, shared: Arc<Shared>) -> Result<(), Error>
    where IO: AsyncRead + AsyncWrite + Send + 'static
{
    let (reader, writer) = tokio::io::split(io);
    let frames = FramedRead::new(reader, FastcgiCodec::default());
    let sink = FramedWrite::new(writer, FastcgiCodec::default());

    let (out_tx, out_rx) = mpsc::channel(OUTPUT_QUEUE);
    let (done_tx, done_rx) = mpsc::unbounded_channel();

    let mut conn = Connection {
        shared,
        requests: HashMap::new(),
        next_serial: 0,
        out: out_tx,
    };

    let result = tokio::select! {
        result = conn.read_loop(frames, done_rx) => result,
        result = write_loop(sink, out_rx, done_tx) => result,
    };

    if !conn.requests.is_empty() {
        info!("connection ending with {} open requests; aborting them", conn.requests.len());
        for slot in conn.requests.values_mut() {
            slot.abort();
        }
    }
    // Dropping the slots stops their handler tasks.
    drop(conn);
    result
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, FastcgiCodec>,
    mut out: mpsc::Receiver<Outgoing>,
    done: mpsc::UnboundedSender<Completion>,
) -> Result<(), Error>
    where W: AsyncWrite + Unpin
{
    while let Some(outgoing) = out.recv().await {
        match outgoing {
            Outgoing::Record(record) => sink.send(record).await?,
            Outgoing::Finished { request_id, serial, end, keep_connection } => {
                let record = FastcgiRecord { request_id, body: FastcgiRecordBody::EndRequest(end) };
                sink.send(record).await?;
                let _ = done.send(Completion { request_id, serial });
                if !keep_connection {
                    debug!("request {} did not ask to keep the connection; closing", request_id);
                    sink.close().await?;
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

impl Connection {
    async fn read_loop<R>(
        &mut self,
        mut frames: FramedRead<R, FastcgiCodec>,
        mut done: mpsc::UnboundedReceiver<Completion>,
    ) -> Result<(), Error>
        where R: AsyncRead + Unpin
    {
        loop {
            tokio::select! {
                biased;
                Some(completion) = done.recv() => self.completed(completion),
                frame = frames.next() => match frame {
                    Some(Ok(record)) => match self.route(record).await {
                        Ok(()) => (),
                        Err(e) if e.is_fatal() => {
                            error!("closing connection: {}", e);
                            return Err(e);
                        },
                        Err(e) => warn!("{}", e),
                    },
                    Some(Err(e)) => {
                        error!("closing connection: {}", e);
                        return Err(e);
                    },
                    None => {
                        debug!("peer closed the connection");
                        return Ok(());
                    },
                },
            }
        }
    }

    fn completed(&mut self, completion: Completion) {
        let current = self.requests.get(&completion.request_id)
            .map(|slot| slot.serial == completion.serial)
            .unwrap_or(false);
        if current {
            debug!("request {} complete", completion.request_id);
            self.requests.remove(&completion.request_id);
        }
    }

    async fn send(&self, request_id: u16, body: FastcgiRecordBody) -> Result<(), Error> {
        let record = FastcgiRecord { request_id, body };
        self.out.send(Outgoing::Record(record)).await.map_err(|_| error::connection_closed())
    }

    /// Answers a BEGIN that will not become a request. `err` has to carry a protocol
    /// status; anything else is handed back.
    async fn reject(&self, request_id: u16, err: Error) -> Result<(), Error> {
        let protocol_status = match err.protocol_status() {
            Some(protocol_status) => protocol_status,
            None => return Err(err),
        };
        warn!("{}", err);
        let end = EndRequest { app_status: 0, protocol_status };
        self.send(request_id, FastcgiRecordBody::EndRequest(end)).await
    }

    async fn route(&mut self, record: FastcgiRecord) -> Result<(), Error> {
        let FastcgiRecord { request_id, body } = record;
        match body {
            FastcgiRecordBody::GetValues(names) => self.get_values(request_id, names).await,
            FastcgiRecordBody::UnknownType(record_type, _) => {
                if request_id == MANAGEMENT_REQUEST_ID {
                    self.send(request_id, FastcgiRecordBody::UnknownTypeResponse(record_type)).await
                } else {
                    warn!("request {}: ignoring record of unknown type {}", request_id, record_type);
                    Ok(())
                }
            },
            FastcgiRecordBody::BeginRequest(begin) => self.begin(request_id, begin).await,
            FastcgiRecordBody::AbortRequest => self.abort(request_id).await,
            FastcgiRecordBody::Params(chunk) => self.params(request_id, chunk).await,
            FastcgiRecordBody::Stdin(chunk) => self.input(request_id, InputKind::Stdin, chunk).await,
            FastcgiRecordBody::Data(chunk) => self.input(request_id, InputKind::Data, chunk).await,
            body @ FastcgiRecordBody::EndRequest(_)
                | body @ FastcgiRecordBody::Stdout(_)
                | body @ FastcgiRecordBody::Stderr(_)
                | body @ FastcgiRecordBody::GetValuesResult(_)
                | body @ FastcgiRecordBody::UnknownTypeResponse(_) => {
                let msg = format!("web server sent a {:?} record (request {}), which only \
                                   applications send", body.record_type(), request_id);
                error!("{}", msg);
                Err(Error::MalformedRecord(msg))
            },
        }
    }

    async fn get_values(&self, request_id: u16, names: Vec<Bytes>) -> Result<(), Error> {
        if request_id != MANAGEMENT_REQUEST_ID {
            warn!("request {}: FCGI_GET_VALUES outside the management id; ignored", request_id);
            return Ok(());
        }
        let values = names.into_iter()
            .filter_map(|name| {
                let value = std::str::from_utf8(&name).ok()
                    .and_then(|key| self.shared.values.get(key))?;
                debug!("get value {} = {}", String::from_utf8_lossy(&name), value);
                Some((name, Bytes::from(value.clone())))
            })
            .collect();
        self.send(MANAGEMENT_REQUEST_ID, FastcgiRecordBody::GetValuesResult(values)).await
    }

    async fn begin(&mut self, request_id: u16, begin: BeginRequest) -> Result<(), Error> {
        debug!("request {}: begin {:?}", request_id, begin);
        if request_id == MANAGEMENT_REQUEST_ID {
            warn!("FCGI_BEGIN_REQUEST on the management id; ignored");
            return Ok(());
        }
        if self.requests.contains_key(&request_id) {
            warn!("request {}: duplicate FCGI_BEGIN_REQUEST; ignored", request_id);
            return Ok(());
        }

        let config = &self.shared.config;
        if !config.multiplex && !self.requests.is_empty() {
            return self.reject(request_id, Error::MultiplexRejected(request_id)).await;
        }
        if self.requests.len() >= config.max_reqs {
            return self.reject(request_id, Error::OverloadedRequest(request_id)).await;
        }
        let role = match begin.role() {
            Some(role) if self.shared.handlers.get(role).is_some() => role,
            _ => {
                let err = Error::UnknownRole(request_id, begin.role_code);
                return self.reject(request_id, err).await;
            }
        };

        self.next_serial += 1;
        let slot = RequestSlot::new(request_id, self.next_serial, role, begin.keep_connection);
        self.requests.insert(request_id, slot);
        Ok(())
    }

    async fn abort(&mut self, request_id: u16) -> Result<(), Error> {
        match self.requests.get(&request_id) {
            Some(slot) if !slot.is_aborted() => {
                info!("request {}: aborted by the web server while {:?}", request_id, slot.state());
                self.end_aborted(request_id).await
            },
            Some(_) => Ok(()),
            None => {
                debug!("request {}: abort for a request that isn't open; ignored", request_id);
                Ok(())
            }
        }
    }

    /// Aborts an open request and makes sure its `FCGI_END_REQUEST` goes out.
    async fn end_aborted(&mut self, request_id: u16) -> Result<(), Error> {
        let slot = match self.requests.get_mut(&request_id) {
            Some(slot) => slot,
            None => return Ok(()),
        };
        slot.abort();
        if slot.is_dispatched() {
            // The handler task sends the end record once it sees the cancellation.
            return Ok(());
        }
        let finished = Outgoing::Finished {
            request_id,
            serial: slot.serial,
            end: EndRequest {
                app_status: dispatch::APP_STATUS_FAILURE,
                protocol_status: ProtocolStatus::RequestComplete,
            },
            keep_connection: slot.keep_connection,
        };
        self.out.send(finished).await.map_err(|_| error::connection_closed())
    }

    async fn params(&mut self, request_id: u16, chunk: Bytes) -> Result<(), Error> {
        let action = match self.requests.get_mut(&request_id) {
            Some(slot) => slot.params(chunk)?,
            None => {
                debug!("request {}: params for a request that isn't open; ignored", request_id);
                return Ok(());
            }
        };
        self.perform(request_id, action).await
    }

    async fn input(&mut self, request_id: u16, kind: InputKind, chunk: Bytes)
        -> Result<(), Error>
    {
        let action = match self.requests.get_mut(&request_id) {
            Some(slot) => slot.input(kind, chunk),
            None => {
                debug!("request {}: {:?} for a request that isn't open; ignored", request_id, kind);
                return Ok(());
            }
        };
        self.perform(request_id, action).await
    }

    async fn perform(&mut self, request_id: u16, action: Action) -> Result<(), Error> {
        match action {
            Action::Nothing => Ok(()),
            Action::Dispatch(params) => self.dispatch(request_id, params).await,
            Action::Overflow(err) => {
                warn!("{}", err);
                self.end_aborted(request_id).await
            },
        }
    }

    async fn dispatch(&mut self, request_id: u16, params: Params)
        -> Result<(), Error>
    {
        let slot = match self.requests.get_mut(&request_id) {
            Some(slot) => slot,
            None => return Ok(()),
        };
        let handler = match self.shared.handlers.get(slot.role) {
            Some(handler) => handler.clone(),
            None => {
                let role = slot.role;
                self.requests.remove(&request_id);
                return self.reject(request_id, Error::UnknownRole(request_id, role as u16)).await;
            }
        };

        let Streams { stdin, data } = slot.open_streams();
        let request = FastcgiRequest {
            role: slot.role,
            request_id,
            keep_connection: slot.keep_connection,
            params,
            stdin,
            data,
        };
        let response = FastcgiResponse::new(request_id, slot.serial, slot.role,
                                            slot.keep_connection, self.out.clone());
        let task = dispatch::spawn(handler, request, response, slot.cancel_token());
        slot.set_task(task);
        Ok(())
    }
}
