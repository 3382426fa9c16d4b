use crate::error::HandlerError;
use crate::hi::request::FastcgiRequest;
use crate::hi::response::FastcgiResponse;
use crate::s11n::Role;

use futures::future::BoxFuture;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Application code for one role.
///
/// Each call gets its own request and response; nothing is shared between invocations
/// except the handler itself. Returning (or calling `FastcgiResponse::finish`) ends the
/// response. An `Err` is reported to the web server through stderr and a non-zero app
/// status, and the connection carries on.
///
/// Implemented for any `Fn(FastcgiRequest, FastcgiResponse) -> impl Future`, so an
/// `async fn` with that signature can be registered directly.
pub trait FastcgiRequestHandler: Send + Sync + 'static {
    fn call(&self, request: FastcgiRequest, response: FastcgiResponse)
        -> BoxFuture<'static, Result<(), HandlerError>>;
}

impl<F, Fut> FastcgiRequestHandler for F
    where F: Fn(FastcgiRequest, FastcgiResponse) -> Fut + Send + Sync + 'static,
          Fut: Future<Output = Result<(), HandlerError>> + Send + 'static
{
    fn call(&self, request: FastcgiRequest, response: FastcgiResponse)
        -> BoxFuture<'static, Result<(), HandlerError>>
    {
        Box::pin(self(request, response))
    }
}

/// The handlers registered for each role, fixed once the server starts.
#[derive(Clone, Default)]
pub struct Handlers {
    responder: Option<Arc<dyn FastcgiRequestHandler>>,
    authorizer: Option<Arc<dyn FastcgiRequestHandler>>,
    filter: Option<Arc<dyn FastcgiRequestHandler>>,
}

impl Handlers {
    pub fn new() -> Handlers {
        Handlers::default()
    }

    pub fn responder<H: FastcgiRequestHandler>(mut self, handler: H) -> Handlers {
        self.responder = Some(Arc::new(handler));
        self
    }

    pub fn authorizer<H: FastcgiRequestHandler>(mut self, handler: H) -> Handlers {
        self.authorizer = Some(Arc::new(handler));
        self
    }

    pub fn filter<H: FastcgiRequestHandler>(mut self, handler: H) -> Handlers {
        self.filter = Some(Arc::new(handler));
        self
    }

    pub fn get(&self, role: Role) -> Option<&Arc<dyn FastcgiRequestHandler>> {
        match role {
            Role::Responder => self.responder.as_ref(),
            Role::Authorizer => self.authorizer.as_ref(),
            Role::Filter => self.filter.as_ref(),
        }
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("responder", &self.responder.is_some())
            .field("authorizer", &self.authorizer.is_some())
            .field("filter", &self.filter.is_some())
            .finish()
    }
}
