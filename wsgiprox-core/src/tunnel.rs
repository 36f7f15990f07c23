//! The Tunnel Engine (spec §4.2): CONNECT hijack, TLS termination with a
//! CA-issued leaf certificate, manual parse of the decrypted inner request,
//! and either the WebSocket branch or the ordinary response-streaming
//! branch.

use std::sync::Arc;

use futures_util::StreamExt;
use http::HeaderMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsAcceptor;

use wsgiprox_shared::WsgiproxCa;
use wsgiprox_shared::ca::load_leaf;
use wsgiprox_shared::tls::leaf_server_config;

use crate::app::App;
use crate::error::TunnelError;
use crate::peek_stream::PeekStream;
use crate::request::{BodyReader, NormalizedRequest, UrlScheme, fold_headers};
use crate::resolver::{ResolveContext, UrlResolver};
use crate::websocket::{WebSocketStream, handshake_response};

/// Literal bytes written verbatim before the TLS handshake begins (spec §6
/// "Tunnel-open envelope on the wire"). `HTTP/1.0` plus `Proxy-Connection:
/// close` keeps the tunnel itself non-keepalive; everything after it is the
/// inner, independently-framed request(s).
pub const CONNECT_ESTABLISHED: &[u8] =
    b"HTTP/1.0 200 Connection Established\r\nProxy-Connection: close\r\nServer: wsgiprox\r\n\r\n";

const MAX_HEAD_BYTES: usize = 64 * 1024;

pub(crate) struct ParsedHead {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
}

/// Reads and parses one HTTP request line + header block off `peek`,
/// leaving any bytes past the blank line buffered for a subsequent body
/// read. Used both for the CONNECT request-target itself and for the inner
/// request decrypted off the TLS tunnel (spec §4.2 steps 5 and 7).
///
/// The header block is parsed by hand rather than handed wholesale to
/// `httparse`: spec §4.2 step 7 / §7 require a malformed header line (no
/// `:`) to be skipped, with the rest of the request still parsed, and
/// `httparse::Request::parse` aborts the entire parse on the first such
/// line.
pub(crate) async fn read_http_head<S: AsyncRead + Unpin>(
    peek: &mut PeekStream<S>,
) -> Result<ParsedHead, TunnelError> {
    let mut size = 1024usize;
    loop {
        let buf = peek.peek(size).await?.to_vec();
        if let Some(head_end) = find_head_end(&buf) {
            discard(peek, head_end).await?;
            return parse_head(&buf[..head_end]);
        }
        if buf.len() < size || size >= MAX_HEAD_BYTES {
            return Err(TunnelError::BadRequest("incomplete or oversized request head".into()));
        }
        size = (size * 2).min(MAX_HEAD_BYTES);
    }
}

/// Byte offset just past the blank line ending the request head, if the
/// buffer contains one.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// Parses a complete request line + header block (terminated by the blank
/// line, which is included in `block`). Lines with no `:` are skipped
/// rather than failing the whole parse.
fn parse_head(block: &[u8]) -> Result<ParsedHead, TunnelError> {
    let text = String::from_utf8_lossy(block);
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| TunnelError::BadRequest("missing method".into()))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| TunnelError::BadRequest("missing request-target".into()))?
        .to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        match line.split_once(':') {
            Some((name, value)) => headers.push((name.trim().to_string(), value.trim().to_string())),
            None => continue,
        }
    }

    Ok(ParsedHead { method, target, headers })
}

async fn discard<S: AsyncRead + Unpin>(peek: &mut PeekStream<S>, n: usize) -> Result<(), TunnelError> {
    let mut sink = vec![0u8; n];
    peek.read_exact(&mut sink).await?;
    Ok(())
}

fn header_map(headers: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::try_from(name.as_str()),
            http::header::HeaderValue::try_from(value.as_str()),
        ) {
            map.append(name, value);
        }
    }
    map
}

/// Runs one intercepted HTTPS tunnel to completion: TLS termination, one
/// inner request, one response (or one WebSocket session), then close.
/// wsgiprox does not keep the tunnel open across multiple inner requests —
/// the envelope is written non-keepalive and each CONNECT corresponds to
/// exactly one decrypted exchange.
pub async fn run_tunnel<S>(
    mut raw: S,
    target_host: String,
    target_port: u16,
    resolver: Arc<dyn UrlResolver>,
    app: Arc<dyn App>,
    ca: &WsgiproxCa,
    use_wildcard_cert: bool,
) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    raw.write_all(CONNECT_ESTABLISHED).await?;

    let leaf_path = if use_wildcard_cert {
        ca.get_wildcard_cert(&target_host)?
    } else {
        ca.cert_for_host(&target_host)?
    };
    let (cert_der, key_der) = load_leaf(&leaf_path)?;
    let server_config = leaf_server_config(cert_der, key_der)?;
    let acceptor = TlsAcceptor::from(Arc::new(server_config));
    let tls_stream = acceptor.accept(raw).await?;

    let mut peek = PeekStream::new(tls_stream);
    let head = read_http_head(&mut peek).await?;
    let headers = header_map(&head.headers);
    let folded = fold_headers(head.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    let effective_url = format!("https://{target_host}{}", head.target);
    let ctx = ResolveContext { headers: &headers };
    let rewritten = resolver.resolve(&effective_url, &ctx);
    let (path_info, query_string) = NormalizedRequest::split_path_and_query(&rewritten);

    let is_websocket = folded
        .get("HTTP_UPGRADE")
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));

    let (read_half, mut write_half) = tokio::io::split(peek);

    if is_websocket {
        let client_key = folded
            .get("HTTP_SEC_WEBSOCKET_KEY")
            .ok_or_else(|| TunnelError::WebSocket("missing Sec-WebSocket-Key".into()))?;
        write_half.write_all(handshake_response(client_key).as_bytes()).await?;

        let duplex = tokio::io::join(read_half, write_half);
        let ws = WebSocketStream::new(duplex);
        let req = NormalizedRequest {
            method: head.method,
            request_uri: rewritten,
            path_info,
            query_string,
            server_protocol: "HTTP/1.1".to_string(),
            url_scheme: UrlScheme::Https,
            proxy_scheme: Some(UrlScheme::Https),
            proxy_host: Some(target_host),
            proxy_port: Some(target_port),
            headers: folded,
            body: Box::pin(tokio::io::empty()),
        };
        app.call_websocket(req, ws).await;
        return Ok(());
    }

    let content_length = folded.get("CONTENT_LENGTH").and_then(|v| v.parse::<u64>().ok());
    let body: BodyReader = Box::pin(read_half.take(content_length.unwrap_or(0)));
    let req = NormalizedRequest {
        method: head.method,
        request_uri: rewritten,
        path_info,
        query_string,
        server_protocol: "HTTP/1.1".to_string(),
        url_scheme: UrlScheme::Https,
        proxy_scheme: Some(UrlScheme::Https),
        proxy_host: Some(target_host),
        proxy_port: Some(target_port),
        headers: folded,
        body,
    };

    let response = app.call(req).await;
    write_response(&mut write_half, response).await?;
    let _ = write_half.shutdown().await;
    Ok(())
}

async fn write_response<W: AsyncWrite + Unpin>(
    out: &mut W,
    mut response: crate::app::AppResponse,
) -> Result<(), TunnelError> {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        response.status.as_u16(),
        response.status.canonical_reason().unwrap_or("")
    );
    for (name, value) in response.headers.iter() {
        if let Ok(value) = value.to_str() {
            head.push_str(name.as_str());
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
    }
    head.push_str("\r\n");
    out.write_all(head.as_bytes()).await?;

    while let Some(chunk) = response.body.next().await {
        if chunk.is_empty() {
            continue;
        }
        out.write_all(&chunk).await?;
    }
    out.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_method_target_and_headers() {
        let mut peek = PeekStream::new(std::io::Cursor::new(
            b"GET /path?x=1 HTTP/1.1\r\nHost: example.com\r\nX-Custom: value\r\n\r\nbody-bytes".to_vec(),
        ));
        let head = read_http_head(&mut peek).await.expect("parse head");
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/path?x=1");
        assert_eq!(
            head.headers,
            vec![("Host".to_string(), "example.com".to_string()), ("X-Custom".to_string(), "value".to_string())]
        );

        let mut rest = Vec::new();
        peek.read_to_end(&mut rest).await.expect("read remainder");
        assert_eq!(rest, b"body-bytes");
    }

    #[tokio::test]
    async fn skips_malformed_header_line_instead_of_failing() {
        let mut peek = PeekStream::new(std::io::Cursor::new(
            b"GET /path HTTP/1.1\r\nHost: example.com\r\nthis line has no colon\r\nX-Ok: yes\r\n\r\n".to_vec(),
        ));
        let head = read_http_head(&mut peek).await.expect("parse head despite bad line");
        assert_eq!(
            head.headers,
            vec![("Host".to_string(), "example.com".to_string()), ("X-Ok".to_string(), "yes".to_string())]
        );
    }
}
