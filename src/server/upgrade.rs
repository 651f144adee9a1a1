//! Server side of the WebSocket opening handshake.
//!
//! The request head is read and parsed with `httparse`, negotiated with
//! tungstenite's `create_response` and answered with `write_response`.
//! Every request that cannot be upgraded gets an HTTP error status before
//! the stream is dropped, which `accept_async` alone would not do.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::server::{
    Request, Response, create_response, write_response,
};
use tokio_tungstenite::tungstenite::http::{self, StatusCode, header};
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::debug;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Largest request head accepted.
const MAX_REQUEST_HEAD: usize = 8 * 1024;

/// Most headers parsed from one request.
const MAX_HEADERS: usize = 64;

// ============================================================================
// Rejection
// ============================================================================

/// Why a request cannot be upgraded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Rejection {
    status: StatusCode,
    reason: String,
}

impl Rejection {
    fn new(status: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    fn bad_request(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, reason)
    }

    /// Status sent to the client.
    pub(crate) fn status(&self) -> StatusCode {
        self.status
    }

    /// Plain-text error response.
    fn response(&self) -> Result<http::Response<String>> {
        let body = format!("websocket: {}\n", self.reason);

        http::Response::builder()
            .status(self.status)
            .header(header::CONNECTION, "close")
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .header(header::CONTENT_LENGTH, body.len())
            .body(body)
            .map_err(|e| Error::upgrade(format!("Unable to build error response: {e}")))
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Performs the opening handshake on `stream`.
///
/// # Errors
///
/// - [`Error::ConnectionTimeout`] if the handshake does not finish in time
/// - [`Error::Upgrade`] if the peer disconnects or the request is rejected
/// - [`Error::Io`] if writing the response fails
pub(crate) async fn accept(
    mut stream: TcpStream,
    handshake_timeout: Duration,
) -> Result<WebSocketStream<TcpStream>> {
    timeout(handshake_timeout, handshake(&mut stream))
        .await
        .map_err(|_| Error::connection_timeout(handshake_timeout.as_millis() as u64))??;

    Ok(WebSocketStream::from_raw_socket(stream, Role::Server, None).await)
}

async fn handshake(stream: &mut TcpStream) -> Result<()> {
    let head = read_head(stream).await?;

    match negotiate(&head) {
        Ok(response) => {
            write_head(stream, &response).await?;
            stream.flush().await?;
            Ok(())
        }
        Err(rejection) => {
            debug!(
                status = %rejection.status(),
                reason = %rejection.reason,
                "Rejecting upgrade request"
            );

            let response = rejection.response()?;
            write_head(stream, &response).await?;
            stream.write_all(response.body().as_bytes()).await?;
            stream.shutdown().await?;

            Err(Error::upgrade(rejection.reason))
        }
    }
}

/// Reads until the request head is complete, malformed or too large.
async fn read_head(stream: &mut TcpStream) -> Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(1024);

    loop {
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(Error::upgrade("Connection closed before request head"));
        }

        if buf.len() >= MAX_REQUEST_HEAD || !is_partial(&buf) {
            return Ok(buf);
        }
    }
}

fn is_partial(buf: &[u8]) -> bool {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    matches!(
        httparse::Request::new(&mut headers).parse(buf),
        Ok(httparse::Status::Partial)
    )
}

async fn write_head<T>(stream: &mut TcpStream, response: &http::Response<T>) -> Result<()> {
    let mut head = Vec::new();
    write_response(&mut head, response)?;
    stream.write_all(&head).await?;
    Ok(())
}

/// Builds the `101 Switching Protocols` response for `head`, or the reason
/// it cannot be upgraded.
pub(crate) fn negotiate(head: &[u8]) -> std::result::Result<Response, Rejection> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);

    let len = match parsed.parse(head) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            return Err(Rejection::new(
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                "request head too large",
            ));
        }
        Err(e) => return Err(Rejection::bad_request(format!("malformed request: {e}"))),
    };

    if len != head.len() {
        return Err(Rejection::bad_request("data after request head"));
    }

    if parsed.method != Some("GET") {
        return Err(Rejection::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "request method is not GET",
        ));
    }

    let version = match parsed.version {
        Some(1) => http::Version::HTTP_11,
        _ => http::Version::HTTP_10,
    };

    let mut builder = http::Request::builder()
        .method(http::Method::GET)
        .uri(parsed.path.unwrap_or("/"))
        .version(version);
    for h in parsed.headers.iter() {
        builder = builder.header(h.name, h.value);
    }

    let request: Request = builder
        .body(())
        .map_err(|e| Rejection::bad_request(format!("invalid request: {e}")))?;

    create_response(&request).map_err(|e| Rejection::bad_request(e.to_string()))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const UPGRADE_REQUEST: &[u8] = b"GET /ws HTTP/1.1\r\n\
        Host: localhost\r\n\
        Connection: Upgrade\r\n\
        Upgrade: websocket\r\n\
        Sec-WebSocket-Version: 13\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";

    fn rejected(head: &[u8]) -> Rejection {
        negotiate(head).expect_err("request should be rejected")
    }

    #[test]
    fn test_upgrade_request_switches_protocols() {
        let response = negotiate(UPGRADE_REQUEST).expect("valid upgrade");
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(
            response.headers()["Sec-WebSocket-Accept"],
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_header_matching_ignores_case() {
        let head = b"GET / HTTP/1.1\r\n\
            connection: keep-alive, upgrade\r\n\
            upgrade: WebSocket\r\n\
            sec-websocket-version: 13\r\n\
            sec-websocket-key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
        assert!(negotiate(head).is_ok());
    }

    #[test]
    fn test_plain_get_is_bad_request() {
        let head = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        assert_eq!(rejected(head).status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_missing_key_is_bad_request() {
        let head = b"GET / HTTP/1.1\r\n\
            Host: localhost\r\n\
            Connection: Upgrade\r\n\
            Upgrade: websocket\r\n\
            Sec-WebSocket-Version: 13\r\n\r\n";
        assert_eq!(rejected(head).status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_upgrade_header_alone_is_bad_request() {
        let head = b"GET / HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\r\n";
        assert_eq!(rejected(head).status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_wrong_version_is_bad_request() {
        let head = b"GET / HTTP/1.1\r\n\
            Connection: Upgrade\r\n\
            Upgrade: websocket\r\n\
            Sec-WebSocket-Version: 8\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
        assert_eq!(rejected(head).status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_http_10_is_bad_request() {
        let head = b"GET / HTTP/1.0\r\n\
            Connection: Upgrade\r\n\
            Upgrade: websocket\r\n\
            Sec-WebSocket-Version: 13\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
        assert_eq!(rejected(head).status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_post_is_method_not_allowed() {
        let head = b"POST / HTTP/1.1\r\nUpgrade: websocket\r\n\r\n";
        assert_eq!(rejected(head).status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn test_trailing_data_is_bad_request() {
        let mut head = UPGRADE_REQUEST.to_vec();
        head.extend_from_slice(b"junk");
        assert_eq!(rejected(&head).status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_malformed_head_is_bad_request() {
        assert_eq!(rejected(b"\x00\x01 nonsense\r\n\r\n").status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_incomplete_head_is_too_large() {
        let head = b"GET / HTTP/1.1\r\nHost: localhost\r\n";
        assert_eq!(
            rejected(head).status(),
            StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
        );
    }

    #[test]
    fn test_is_partial() {
        assert!(is_partial(b"GET / HTTP/1.1\r\nHost: loc"));
        assert!(!is_partial(UPGRADE_REQUEST));
        assert!(!is_partial(b"\x00garbage\r\n\r\n"));
    }

    #[test]
    fn test_rejection_response_format() {
        let response = Rejection::bad_request("missing key")
            .response()
            .expect("response");

        let mut head = Vec::new();
        write_response(&mut head, &response).expect("serialize");
        let head = String::from_utf8(head).expect("utf-8");

        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
        assert_eq!(response.body(), "websocket: missing key\n");
        assert_eq!(
            response.headers()[header::CONTENT_LENGTH],
            response.body().len().to_string().as_str()
        );
    }
}
