//! A FastCGI application server on tokio.
//!
//! Register a handler per role and hand the server a listen target:
//!
//! ```no_run
//! use tokio_fcgi_server::{FastcgiRequest, FastcgiResponse, Handlers, HandlerError, Server,
//!                         ServerConfig};
//!
//! async fn hello(_req: FastcgiRequest, mut resp: FastcgiResponse) -> Result<(), HandlerError> {
//!     resp.set_header("Content-Type", "text/plain");
//!     resp.write("hello\n").await?;
//!     Ok(())
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let server = Server::new(ServerConfig::default(), Handlers::new().responder(hello))?;
//! server.listen("127.0.0.1:9000").await?;
//! # Ok(())
//! # }
//! ```

#[macro_use] extern crate enum_primitive;
#[macro_use] extern crate log;

pub mod config;
pub mod error;
mod hi;
pub mod lowlevel;
pub mod params;
pub mod s11n;
pub mod server;

pub use config::{ConfigError, ServerConfig};
pub use error::{Error, HandlerError};
pub use hi::codec::{BeginRequest, EndRequest, FastcgiCodec, FastcgiRecord, FastcgiRecordBody};
pub use hi::handler::{FastcgiRequestHandler, Handlers};
pub use hi::request::{FastcgiRequest, InputStream};
pub use hi::response::{FastcgiResponse, OutputState};
pub use lowlevel::FastcgiLowlevelCodec;
pub use params::Params;
pub use s11n::{ProtocolStatus, RecordType, Role, FASTCGI_VERSION};
pub use server::{Listener, Server};
