//! Serves one handler per FastCGI role.
//!
//! Listens on the first argument, or `$FCGI_LISTEN`, or `./roles.sock`. A TCP address like
//! `127.0.0.1:9000` listens on TCP; anything else is a Unix socket path. Set
//! `$FCGI_CONFIG` to a TOML file to change the server limits.
//!
//! - responder: `GET` says hello (echoing any `My-<x>-Message` headers), `POST` echoes
//!   the body.
//! - authorizer: allows requests carrying `Authorization: hello-auth`.
//! - filter: responds with the data stream reversed.

use tokio_fcgi_server::{FastcgiRequest, FastcgiResponse, HandlerError, Handlers, Server,
                        ServerConfig};

use std::env;
use std::error::Error;

async fn responder(mut req: FastcgiRequest, mut resp: FastcgiResponse)
    -> Result<(), HandlerError>
{
    match req.method() {
        Some("GET") => {
            resp.set_header("Content-Type", "text/plain");
            let mut body = String::new();
            for (name, value) in req.headers() {
                let lower = name.to_ascii_lowercase();
                if let Some(key) = lower.strip_prefix("my-").and_then(|n| n.strip_suffix("-message")) {
                    body.push_str(&format!("{}: {}\n", key, value));
                }
            }
            body.push_str("hello index");
            resp.write(body).await?;
        },
        Some("POST") => {
            resp.set_header("Content-Type", "text/plain");
            let data = req.stdin.read_to_end().await;
            resp.write("Received data:\n").await?;
            resp.write(data).await?;
        },
        _ => resp.set_status(501),
    }
    Ok(())
}

async fn authorizer(mut req: FastcgiRequest, mut resp: FastcgiResponse)
    -> Result<(), HandlerError>
{
    match req.method() {
        Some("GET") | Some("POST") => {
            req.stdin.read_to_end().await;
            if req.header("Authorization") == Some("hello-auth") {
                resp.set_variable("My-Hello-Message", "howdy!");
                resp.set_variable("My-Foo-Message", "bar!");
                resp.set_status(200);
            } else {
                resp.set_status(403);
                resp.set_header("Content-Type", "text/plain");
                resp.write("authorizer app: permission denied").await?;
            }
        },
        _ => {
            resp.set_status(501);
            resp.set_header("Content-Type", "text/plain");
            resp.write("unsupported method").await?;
        },
    }
    Ok(())
}

async fn filter(mut req: FastcgiRequest, mut resp: FastcgiResponse)
    -> Result<(), HandlerError>
{
    match req.method() {
        Some("GET") | Some("POST") => {
            resp.set_header("Content-Type", "text/plain");
            req.stdin.read_to_end().await;
            let data = match req.data.as_mut() {
                Some(data) => data.read_to_end().await,
                None => Default::default(),
            };
            if data.is_empty() {
                resp.write("error: no data to filter with").await?;
            } else {
                let text = String::from_utf8_lossy(&data);
                resp.write(text.chars().rev().collect::<String>()).await?;
            }
        },
        _ => resp.set_status(501),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let target = env::args().nth(1)
        .or_else(|| env::var("FCGI_LISTEN").ok())
        .unwrap_or_else(|| "./roles.sock".to_owned());

    let config = match env::var("FCGI_CONFIG") {
        Ok(path) => ServerConfig::load(path)?,
        Err(_) => ServerConfig::default(),
    };

    let handlers = Handlers::new()
        .responder(responder)
        .authorizer(authorizer)
        .filter(filter);

    let server = Server::new(config, handlers)?;
    server.listen(&target).await?;
    Ok(())
}
