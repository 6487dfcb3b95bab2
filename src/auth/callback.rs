/// One-shot loopback HTTP listener that captures the OAuth redirect
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::AuthError;

const MAX_REQUEST_BYTES: usize = 8192;
const READ_TIMEOUT: Duration = Duration::from_secs(5);

const SUCCESS_HTML: &str = "<html><head><title>Login complete</title></head>\
<body><h1>Login complete</h1><p>You can close this window and return to the application.</p></body></html>";
const INVALID_REQUEST_HTML: &str = "<html><body><h1>Invalid request</h1></body></html>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Success,
    Timeout,
    Cancelled,
    Error(String),
}

/// Result of one wait; consumed immediately by the flow, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackResult {
    pub raw_query: String,
    pub outcome: CallbackOutcome,
}

impl CallbackResult {
    fn without_query(outcome: CallbackOutcome) -> Self {
        Self {
            raw_query: String::new(),
            outcome,
        }
    }
}

/// A bound loopback socket waiting for exactly one redirect.
///
/// `wait_for_callback` consumes the handle, so the socket is closed on every
/// exit path and a second concurrent wait cannot be expressed.
#[derive(Debug)]
pub struct CallbackListener {
    listener: TcpListener,
    path: String,
    port: u16,
}

impl CallbackListener {
    /// Bind `127.0.0.1`. A preferred port is bound exactly; otherwise the OS picks one.
    pub async fn start(preferred_port: Option<u16>, path: &str) -> Result<Self, AuthError> {
        let port = preferred_port.unwrap_or(0);
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| AuthError::Listener(format!("bind 127.0.0.1:{} failed: {}", port, e)))?;
        let port = listener
            .local_addr()
            .map_err(|e| AuthError::Listener(format!("local_addr failed: {}", e)))?
            .port();

        debug!("Callback listener bound on 127.0.0.1:{}", port);

        Ok(Self {
            listener,
            path: format!("/{}", path.trim_start_matches('/')),
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Serve requests until one hits the callback path, the timeout fires,
    /// or `cancel` is triggered.
    pub async fn wait_for_callback(self, timeout: Duration, cancel: CancellationToken) -> CallbackResult {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        // Browsers open speculative connections, so each one is served on its own task
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut deadline => return CallbackResult::without_query(CallbackOutcome::Timeout),
                _ = cancel.cancelled() => return CallbackResult::without_query(CallbackOutcome::Cancelled),
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        connections.spawn(serve(socket, peer, self.path.clone()));
                    }
                    Err(e) => {
                        return CallbackResult::without_query(CallbackOutcome::Error(format!(
                            "accept failed: {}",
                            e
                        )));
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Ok(Some(raw_query)) = joined {
                        return CallbackResult {
                            raw_query,
                            outcome: CallbackOutcome::Success,
                        };
                    }
                }
            }
        }
    }
}

/// Answer one connection. Returns the query string when it was the callback.
async fn serve(mut socket: TcpStream, peer: SocketAddr, callback_path: String) -> Option<String> {
    let request = match tokio::time::timeout(READ_TIMEOUT, read_request_head(&mut socket)).await {
        Ok(Ok(request)) => request,
        Ok(Err(e)) => {
            warn!("Callback read from {} failed: {}", peer, e);
            return None;
        }
        Err(_) => {
            debug!("Connection from {} sent no request", peer);
            return None;
        }
    };

    match parse_request_target(&request) {
        Some((path, query)) if path == callback_path => {
            respond(&mut socket, "200 OK", SUCCESS_HTML).await;
            Some(query.to_string())
        }
        target => {
            debug!("Ignoring request from {} for {:?}", peer, target.map(|(p, _)| p));
            respond(&mut socket, "400 Bad Request", INVALID_REQUEST_HTML).await;
            None
        }
    }
}

async fn read_request_head(socket: &mut TcpStream) -> std::io::Result<String> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if buffer.windows(4).any(|w| w == b"\r\n\r\n") || buffer.len() >= MAX_REQUEST_BYTES {
            break;
        }
    }

    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Split `GET /path?query HTTP/1.1` into path and raw query.
fn parse_request_target(request: &str) -> Option<(&str, &str)> {
    let mut parts = request.lines().next()?.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    parts.next()?.strip_prefix("HTTP/")?;

    if !method.eq_ignore_ascii_case("GET") {
        return None;
    }

    Some(target.split_once('?').unwrap_or((target, "")))
}

async fn respond(socket: &mut TcpStream, status: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    // Browser may already be gone
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}
