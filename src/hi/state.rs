//! Per-request input state machine.
//!
//! A `RequestSlot` lives in its connection's request table from `FCGI_BEGIN_REQUEST` until
//! its `FCGI_END_REQUEST` has been flushed. It collects the params stream, then hands stdin
//! and data chunks to the running handler. The output half of the lifecycle belongs to
//! `FastcgiResponse`.

use crate::error::Error;
use crate::hi::request::{self, InputSender, InputStream};
use crate::params::Params;
use crate::s11n::Role;

use bytes::{Bytes, BytesMut};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Params bytes a request may send before its params stream ends.
pub(crate) const MAX_PARAMS_LEN: usize = 256 * 1024;

/// Bytes of one input stream held for a handler that has not read them yet, including
/// whatever arrived before dispatch.
pub(crate) const MAX_BUFFERED_INPUT: usize = 1024 * 1024;

/// Input side of a request's lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputState {
    /// Waiting for the empty `FCGI_PARAMS` record.
    CollectingParams,
    /// The handler is running; stdin (and data, for filters) are still open.
    CollectingInput,
    /// Every input stream of the role has terminated.
    InputClosed,
}

/// Which input stream a chunk belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputKind {
    Stdin,
    Data,
}

impl InputKind {
    fn name(self) -> &'static str {
        match self {
            InputKind::Stdin => "stdin",
            InputKind::Data => "data",
        }
    }
}

#[derive(Debug)]
enum Feed {
    /// Before dispatch: chunks wait here.
    Waiting { backlog: Vec<Bytes>, buffered: usize, ended: bool },
    Open(InputSender),
    Closed,
}

impl Feed {
    fn waiting() -> Feed {
        Feed::Waiting { backlog: vec![], buffered: 0, ended: false }
    }

    fn is_closed(&self) -> bool {
        matches!(*self, Feed::Closed | Feed::Waiting { ended: true, .. })
    }
}

/// What the connection has to do after feeding a record to a slot.
#[derive(Debug)]
pub(crate) enum Action {
    Nothing,
    /// Params are complete: start the handler.
    Dispatch(Params),
    /// The request went over one of its buffer limits and has to be aborted.
    Overflow(Error),
}

/// Receivers for a freshly dispatched request. Chunks that arrived early are already
/// queued on them.
pub(crate) struct Streams {
    pub(crate) stdin: InputStream,
    pub(crate) data: Option<InputStream>,
}

#[derive(Debug)]
pub(crate) struct RequestSlot {
    pub(crate) request_id: u16,
    /// Distinguishes this request from earlier ones that used the same id.
    pub(crate) serial: u64,
    pub(crate) role: Role,
    pub(crate) keep_connection: bool,
    state: InputState,
    params: BytesMut,
    stdin: Feed,
    data: Feed,
    aborted: bool,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RequestSlot {
    pub(crate) fn new(request_id: u16, serial: u64, role: Role, keep_connection: bool)
        -> RequestSlot
    {
        let data = if role == Role::Filter { Feed::waiting() } else { Feed::Closed };
        RequestSlot {
            request_id,
            serial,
            role,
            keep_connection,
            state: InputState::CollectingParams,
            params: BytesMut::new(),
            stdin: Feed::waiting(),
            data,
            aborted: false,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub(crate) fn state(&self) -> InputState {
        self.state
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub(crate) fn is_dispatched(&self) -> bool {
        self.task.is_some()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// A chunk of the params stream; the empty one completes it.
    pub(crate) fn params(&mut self, chunk: Bytes) -> Result<Action, Error> {
        if self.aborted {
            return Ok(Action::Nothing);
        }
        if self.state != InputState::CollectingParams {
            warn!("request {}: params record after the params stream ended; ignored",
                  self.request_id);
            return Ok(Action::Nothing);
        }
        if !chunk.is_empty() {
            if self.params.len() + chunk.len() > MAX_PARAMS_LEN {
                return Ok(Action::Overflow(self.limit("params", MAX_PARAMS_LEN)));
            }
            debug!("request {}: consuming {} bytes of params", self.request_id, chunk.len());
            self.params.extend_from_slice(&chunk);
            return Ok(Action::Nothing);
        }

        debug!("request {}: done reading params", self.request_id);
        let params = Params::decode(self.params.split().freeze())?;
        self.params = BytesMut::new();
        self.state = InputState::CollectingInput;
        Ok(Action::Dispatch(params))
    }

    /// A chunk of stdin or data; the empty one terminates that stream. Never waits for
    /// the handler.
    pub(crate) fn input(&mut self, kind: InputKind, chunk: Bytes) -> Action {
        if self.aborted {
            return Action::Nothing;
        }
        let request_id = self.request_id;
        let overflow = self.limit(kind.name(), MAX_BUFFERED_INPUT);
        let feed = match kind {
            InputKind::Stdin => &mut self.stdin,
            InputKind::Data if self.role == Role::Filter => &mut self.data,
            InputKind::Data => {
                // This is only used by the "Filter" role.
                warn!("request {}: FCGI_DATA for a {:?} request; ignored", request_id, self.role);
                return Action::Nothing;
            }
        };

        let mut stopped = false;
        let action = match *feed {
            Feed::Closed | Feed::Waiting { ended: true, .. } => {
                warn!("request {}: {:?} record after the stream ended; ignored", request_id, kind);
                Action::Nothing
            },
            Feed::Waiting { ref mut ended, .. } if chunk.is_empty() => {
                *ended = true;
                Action::Nothing
            },
            Feed::Waiting { ref mut backlog, ref mut buffered, .. } => {
                if *buffered + chunk.len() > MAX_BUFFERED_INPUT {
                    Action::Overflow(overflow)
                } else {
                    *buffered += chunk.len();
                    backlog.push(chunk);
                    Action::Nothing
                }
            },
            Feed::Open(_) if chunk.is_empty() => {
                debug!("request {}: {:?} is done", request_id, kind);
                stopped = true;
                Action::Nothing
            },
            Feed::Open(ref tx) => {
                if tx.buffered() + chunk.len() > MAX_BUFFERED_INPUT {
                    Action::Overflow(overflow)
                } else {
                    if tx.send(chunk).is_err() {
                        debug!("request {}: handler stopped reading {:?}", request_id, kind);
                        stopped = true;
                    }
                    Action::Nothing
                }
            },
        };
        if stopped {
            *feed = Feed::Closed;
        }
        self.update_input_state();
        action
    }

    /// Opens the input channels once the handler is about to start.
    pub(crate) fn open_streams(&mut self) -> Streams {
        let stdin = open(&mut self.stdin);
        let data = if self.role == Role::Filter {
            Some(open(&mut self.data))
        } else {
            None
        };
        self.update_input_state();
        Streams { stdin, data }
    }

    pub(crate) fn set_task(&mut self, task: JoinHandle<()>) {
        self.task = Some(task);
    }

    /// Stops taking input and cancels the handler. The handler's task still sends the
    /// `FCGI_END_REQUEST`; if there is no handler yet the caller must.
    pub(crate) fn abort(&mut self) {
        self.aborted = true;
        self.params = BytesMut::new();
        self.stdin = Feed::Closed;
        self.data = Feed::Closed;
        self.state = InputState::InputClosed;
        self.cancel.cancel();
    }

    fn limit(&self, stream: &'static str, limit: usize) -> Error {
        Error::InputLimit { request_id: self.request_id, stream, limit }
    }

    fn update_input_state(&mut self) {
        if self.state == InputState::CollectingInput
            && self.stdin.is_closed() && self.data.is_closed()
        {
            debug!("request {}: all input received", self.request_id);
            self.state = InputState::InputClosed;
        }
    }
}

/// Streams that already ended close once their backlog has been delivered.
fn open(feed: &mut Feed) -> InputStream {
    let (tx, rx) = request::input_channel();
    match std::mem::replace(feed, Feed::Closed) {
        Feed::Waiting { backlog, ended, .. } => {
            // `rx` is still here, so these cannot fail.
            for chunk in backlog {
                let _ = tx.send(chunk);
            }
            if !ended {
                *feed = Feed::Open(tx);
            }
        },
        other => *feed = other,
    }
    rx
}

impl Drop for RequestSlot {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
