#![allow(dead_code)]

use tokio_fcgi_server::params::encode_pairs;
use tokio_fcgi_server::*;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio_util::codec::Framed;

use std::collections::HashMap;
use std::time::Duration;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub async fn responder(mut req: FastcgiRequest, mut resp: FastcgiResponse)
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

pub async fn authorizer(mut req: FastcgiRequest, mut resp: FastcgiResponse)
    -> Result<(), HandlerError>
{
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
    Ok(())
}

pub async fn filter(mut req: FastcgiRequest, mut resp: FastcgiResponse)
    -> Result<(), HandlerError>
{
    resp.set_header("Content-Type", "text/plain");
    req.stdin.read_to_end().await;
    let data = match req.data.as_mut() {
        Some(data) => data.read_to_end().await,
        None => Bytes::new(),
    };
    if data.is_empty() {
        resp.write("error: no data to filter with").await?;
    } else {
        let text = String::from_utf8_lossy(&data);
        resp.write(text.chars().rev().collect::<String>()).await?;
    }
    Ok(())
}

pub fn role_handlers() -> Handlers {
    Handlers::new()
        .responder(responder)
        .authorizer(authorizer)
        .filter(filter)
}

pub fn server(config: ServerConfig, handlers: Handlers) -> Server {
    Server::new(config, handlers).unwrap()
}

/// A web server's end of a connection.
pub struct Client<IO> {
    framed: Framed<IO, FastcgiCodec>,
}

impl Client<DuplexStream> {
    /// Connects to `server` over an in-memory pipe.
    pub fn connect(server: &Server) -> Client<DuplexStream> {
        let (client, server_side) = tokio::io::duplex(256 * 1024);
        server.spawn_connection(server_side).unwrap();
        Client::new(client)
    }
}

impl<IO: AsyncRead + AsyncWrite + Unpin> Client<IO> {
    pub fn new(io: IO) -> Client<IO> {
        Client { framed: Framed::new(io, FastcgiCodec::default()) }
    }

    pub async fn send(&mut self, request_id: u16, body: FastcgiRecordBody) {
        self.framed.send(FastcgiRecord { request_id, body }).await.unwrap();
    }

    pub async fn begin(&mut self, request_id: u16, role: Role, keep_connection: bool) {
        let begin = BeginRequest::new(role, keep_connection);
        self.send(request_id, FastcgiRecordBody::BeginRequest(begin)).await;
    }

    /// Sends the params without the terminating empty record.
    pub async fn params_chunk(&mut self, request_id: u16, pairs: &[(&str, &str)]) {
        let mut buf = BytesMut::new();
        encode_pairs(pairs.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())), &mut buf).unwrap();
        self.send(request_id, FastcgiRecordBody::Params(buf.freeze())).await;
    }

    pub async fn params(&mut self, request_id: u16, pairs: &[(&str, &str)]) {
        if !pairs.is_empty() {
            self.params_chunk(request_id, pairs).await;
        }
        self.send(request_id, FastcgiRecordBody::Params(Bytes::new())).await;
    }

    /// Sends `data` followed by the terminating empty record.
    pub async fn stdin(&mut self, request_id: u16, data: &[u8]) {
        for chunk in data.chunks(0xFFFF) {
            self.send(request_id, FastcgiRecordBody::Stdin(Bytes::copy_from_slice(chunk))).await;
        }
        self.send(request_id, FastcgiRecordBody::Stdin(Bytes::new())).await;
    }

    pub async fn data(&mut self, request_id: u16, data: &[u8]) {
        for chunk in data.chunks(0xFFFF) {
            self.send(request_id, FastcgiRecordBody::Data(Bytes::copy_from_slice(chunk))).await;
        }
        self.send(request_id, FastcgiRecordBody::Data(Bytes::new())).await;
    }

    /// A whole request: begin, params, stdin.
    pub async fn request(&mut self, request_id: u16, role: Role, keep_connection: bool,
                         params: &[(&str, &str)], stdin: &[u8]) {
        self.begin(request_id, role, keep_connection).await;
        self.params(request_id, params).await;
        self.stdin(request_id, stdin).await;
    }

    /// The next record; `None` once the application closed the connection.
    pub async fn recv(&mut self) -> Option<FastcgiRecord> {
        match tokio::time::timeout(TIMEOUT, self.framed.next()).await {
            Ok(Some(Ok(record))) => Some(record),
            Ok(Some(Err(e))) => panic!("client read error: {}", e),
            Ok(None) => None,
            Err(_) => panic!("timed out waiting for a record"),
        }
    }

    /// Whether the application closes the connection without sending anything else.
    pub async fn closed(&mut self) -> bool {
        match tokio::time::timeout(TIMEOUT, self.framed.next()).await {
            Ok(None) | Ok(Some(Err(_))) => true,
            Ok(Some(Ok(record))) => panic!("expected close, got {:?}", record),
            Err(_) => false,
        }
    }

    /// Reads until every request in `ids` has ended.
    pub async fn responses(&mut self, ids: &[u16]) -> HashMap<u16, Response> {
        let mut responses: HashMap<u16, Response> = HashMap::new();
        let mut pending = ids.len();
        while pending > 0 {
            let record = match self.recv().await {
                Some(record) => record,
                None => panic!("connection closed with {} responses pending", pending),
            };
            assert!(ids.contains(&record.request_id), "unexpected record {:?}", record);
            let response = responses.entry(record.request_id).or_default();
            assert!(response.end.is_none(), "record after end: {:?}", record);
            response.records.push(record.body.clone());
            match record.body {
                FastcgiRecordBody::Stdout(data) => response.stdout.extend_from_slice(&data),
                FastcgiRecordBody::Stderr(data) => response.stderr.extend_from_slice(&data),
                FastcgiRecordBody::EndRequest(end) => {
                    response.end = Some(end);
                    pending -= 1;
                },
                other => panic!("unexpected record body {:?}", other),
            }
        }
        responses
    }

    pub async fn response(&mut self, request_id: u16) -> Response {
        self.responses(&[request_id]).await.remove(&request_id).unwrap()
    }

    pub fn into_inner(self) -> IO {
        self.framed.into_inner()
    }
}

/// Everything an application sent for one request.
#[derive(Debug, Default)]
pub struct Response {
    pub records: Vec<FastcgiRecordBody>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub end: Option<EndRequest>,
}

impl Response {
    pub fn end(&self) -> EndRequest {
        self.end.unwrap()
    }

    /// Whether stdout was closed with an empty record right before the end.
    pub fn stdout_terminated(&self) -> bool {
        self.records.iter().rev()
            .find(|body| matches!(body, FastcgiRecordBody::Stdout(_)))
            .map(|body| *body == FastcgiRecordBody::Stdout(Bytes::new()))
            .unwrap_or(false)
    }

    /// Splits stdout into the CGI header block and the body.
    pub fn cgi(&self) -> CgiResponse {
        let text = String::from_utf8(self.stdout.clone()).unwrap();
        let (head, body) = match text.find("\r\n\r\n") {
            Some(pos) => (&text[..pos], &text[pos + 4..]),
            None => panic!("no header block in {:?}", text),
        };
        let headers: Vec<(String, String)> = head.split("\r\n")
            .map(|line| {
                let (name, value) = line.split_once(": ").unwrap();
                (name.to_owned(), value.to_owned())
            })
            .collect();
        let status = headers.iter()
            .find(|(name, _)| name == "Status")
            .map(|(_, value)| value.split(' ').next().unwrap().parse().unwrap())
            .unwrap();
        CgiResponse { status, headers, body: body.to_owned() }
    }
}

#[derive(Debug)]
pub struct CgiResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl CgiResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}
