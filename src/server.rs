//! HTTP/1.0 server: the transport surface that turns inbound bytes into
//! route or mailbox dispatch.
//!
//! Structurally modeled on `SocketServer::start`/`accept_loop`: bind once,
//! spawn an accept loop, hand each connection to its own task. Behavior
//! (path layout, status codes, body suppression on mailbox posts) is
//! grounded in `httpd.py`'s `HTTPD`/`WireProtocolMessageHandler`/
//! `RoutedRequestHandler`.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use crate::actor::HttpRequestContext;
use crate::registry::Registry;
use crate::wire::{encode_response, RequestDecoder, SenderIdentity, Status};

pub struct HttpServer {
    local_addr: SocketAddr,
}

impl HttpServer {
    /// Bind `ip:port` (0 for an OS-chosen port) without yet accepting
    /// connections. Split from `serve` so a caller can learn the bound
    /// port (needed to construct a `Registry` whose local-pid check is
    /// correct) before the registry that will answer requests exists.
    pub async fn bind(ip: Ipv4Addr, port: u16) -> Result<(TcpListener, SocketAddr), crate::error::Error> {
        let listener = TcpListener::bind((ip, port))
            .await
            .map_err(crate::error::Error::SocketError)?;
        let local_addr = listener.local_addr().map_err(crate::error::Error::SocketError)?;
        Ok((listener, local_addr))
    }

    /// Start accepting connections on an already-bound listener. Each
    /// accepted connection is handled on its own spawned task.
    pub fn serve(listener: TcpListener, registry: Registry) -> Self {
        let local_addr = listener
            .local_addr()
            .expect("listener bound by HttpServer::bind always has a local addr");
        tokio::spawn(accept_loop(listener, registry));
        HttpServer { local_addr }
    }

    /// Convenience: bind and immediately serve, for callers that don't
    /// need the registry to know the bound port ahead of time (tests).
    pub async fn start(
        ip: Ipv4Addr,
        port: u16,
        registry: Registry,
    ) -> Result<Self, crate::error::Error> {
        let (listener, _) = Self::bind(ip, port).await?;
        Ok(Self::serve(listener, registry))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn accept_loop(listener: TcpListener, registry: Registry) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                log::debug!("accepted connection from {peer_addr}");
                let registry = registry.clone();
                tokio::spawn(handle_connection(stream, registry));
            }
            Err(e) => {
                log::warn!("accept failed: {e}");
                break;
            }
        }
    }
}

/// Split `/<id>/<rest>` into `(id, rest)`. A path with no second segment
/// (e.g. `/id`) has no matching route or mailbox.
fn split_path(path: &str) -> Option<(&str, &str)> {
    let path = path.strip_prefix('/')?;
    let (id, rest) = path.split_once('/')?;
    Some((id, rest))
}

async fn handle_connection(mut stream: TcpStream, registry: Registry) {
    use tokio::io::AsyncReadExt;

    let mut decoder = RequestDecoder::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                log::debug!("read error: {e}");
                return;
            }
        };

        let requests = match decoder.feed(&buf[..n]) {
            Ok(reqs) => reqs,
            Err(e) => {
                log::warn!("malformed request: {e}");
                return;
            }
        };

        for req in requests {
            let response = dispatch_request(&registry, &req).await;
            if stream.write_all(&response).await.is_err() {
                return;
            }
        }
    }
}

async fn dispatch_request(
    registry: &Registry,
    req: &crate::wire::ParsedRequest,
) -> bytes::Bytes {
    let (raw_path, query) = match req.path.split_once('?') {
        Some((p, q)) => (p, q.to_string()),
        None => (req.path.as_str(), String::new()),
    };

    let Some((id, rest)) = split_path(raw_path) else {
        return encode_response(Status::NotFound404, None, b"");
    };

    if req.method.eq_ignore_ascii_case("POST") {
        if let Some(handler) = registry.mailbox_handler(id, rest).await {
            // A non-process-originating POST never reaches the handler and
            // is answered 404, same as an unknown target — the sender
            // identification headers are the only thing that distinguishes
            // a libprocess peer from an arbitrary HTTP client here.
            match req.sender_kind() {
                SenderIdentity::Modern(from) => {
                    handler.handle(Some(from), req.body.clone()).await;
                    // Message posts never carry a response body, mirroring
                    // `flush()`'s suppression in the original handler.
                    return encode_response(Status::Accepted202, None, b"");
                }
                SenderIdentity::Legacy(from) => {
                    handler.handle(Some(from), req.body.clone()).await;
                    return encode_response(Status::NoContent204, None, b"");
                }
                SenderIdentity::Unknown => {
                    return encode_response(Status::NotFound404, None, b"");
                }
            }
        }
        return encode_response(Status::NotFound404, None, b"");
    }

    if let Some(handler) = registry.route_handler(id, &format!("/{rest}")).await {
        let (body, content_type) = handler
            .handle(HttpRequestContext { query })
            .await;
        return encode_response(Status::Ok200, content_type.as_deref(), &body);
    }

    encode_response(Status::NotFound404, None, b"")
}
