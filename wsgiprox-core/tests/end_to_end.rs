//! End-to-end scenarios straight out of the testable-properties table
//! (plain HTTP, HTTPS tunnel with and without a body, identity-host
//! passthrough over both, and WebSocket upgrade over both): a real
//! `Dispatcher` behind a real `TcpListener`, driven by a bare-metal client
//! that speaks the proxy protocol (including CONNECT + TLS) by hand.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use base64::Engine;
use bytes::Bytes;
use futures_util::stream;
use http::StatusCode;
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use wsgiprox_core::app::{App, AppResponse};
use wsgiprox_core::request::NormalizedRequest;
use wsgiprox_core::resolver::FixedResolver;
use wsgiprox_core::tunnel::CONNECT_ESTABLISHED;
use wsgiprox_core::websocket::{Message, WebSocketStream};
use wsgiprox_core::Dispatcher;
use wsgiprox_shared::WsgiproxCa;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

struct EchoApp;

impl App for EchoApp {
    fn call<'a>(&'a self, mut req: NormalizedRequest) -> BoxFuture<'a, AppResponse> {
        Box::pin(async move {
            let mut body = Vec::new();
            let _ = req.body.read_to_end(&mut body).await;
            let mut text = format!("Requested Url: {}", req.request_uri);
            if !body.is_empty() {
                text.push_str(" Post Data: ");
                text.push_str(&String::from_utf8_lossy(&body));
            }
            AppResponse::new(StatusCode::OK).with_body(Box::pin(stream::once(async move { Bytes::from(text.into_bytes()) })))
        })
    }

    fn call_websocket<'a>(&'a self, req: NormalizedRequest, mut ws: WebSocketStream) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            while let Ok(Some(Message::Text(text))) = ws.recv().await {
                let reply = format!("WS Request Url: {} Echo: {text}", req.request_uri);
                if ws.send(Message::Text(reply)).await.is_err() {
                    break;
                }
            }
        })
    }
}

async fn start_proxy() -> (SocketAddr, WsgiproxCa) {
    let dir = std::env::temp_dir().join(format!("wsgiprox-e2e-{}", std::process::id()));
    let _ = tokio::fs::remove_dir_all(&dir).await;
    let ca = WsgiproxCa::init(&dir.join("ca.pem"), &dir.join("certs"), "wsgiprox-test-ca").expect("ca init");

    let resolver = Arc::new(FixedResolver::new(
        "http://localhost:8080/prefix",
        vec!["wsgiprox".to_string()],
    ));
    let dispatcher = Dispatcher::new(resolver, Arc::new(EchoApp), ca.clone(), vec![], false);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { return };
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                let _ = dispatcher.serve_connection(stream).await;
            });
        }
    });

    (addr, ca)
}

async fn read_response(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match tokio::time::timeout(std::time::Duration::from_secs(2), stream.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(_)) => break,
        }
    }
    String::from_utf8_lossy(&buf).to_string()
}

#[tokio::test]
async fn scenario_1_plain_http_rewrites_url() {
    let (addr, _ca) = start_proxy().await;
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream
        .write_all(b"GET http://example.com/path/file?foo=bar HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
        .await
        .expect("write request");

    let response = read_response(&mut stream).await;
    assert!(
        response.contains("Requested Url: http://localhost:8080/prefix/http://example.com/path/file?foo=bar"),
        "unexpected response: {response}"
    );
}

#[tokio::test]
async fn scenario_4_identity_host_passes_through() {
    let (addr, _ca) = start_proxy().await;
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream
        .write_all(b"GET http://wsgiprox/path/file?foo=bar HTTP/1.1\r\nHost: wsgiprox\r\nConnection: close\r\n\r\n")
        .await
        .expect("write request");

    let response = read_response(&mut stream).await;
    assert!(response.contains("Requested Url: /path/file?foo=bar"), "unexpected response: {response}");
}

fn trusting_tls_connector(ca: &WsgiproxCa) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from(ca.root_cert_der().to_vec()))
        .expect("trust root CA");
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

#[tokio::test]
async fn scenario_2_https_tunnel_terminates_and_rewrites_url() {
    let (addr, ca) = start_proxy().await;
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .expect("write CONNECT");

    let mut envelope = vec![0u8; CONNECT_ESTABLISHED.len()];
    stream.read_exact(&mut envelope).await.expect("read envelope");
    assert_eq!(envelope, CONNECT_ESTABLISHED);

    let connector = trusting_tls_connector(&ca);
    let server_name = ServerName::try_from("example.com").expect("server name");
    let mut tls = connector.connect(server_name, stream).await.expect("tls connect");

    tls.write_all(b"GET /path/file?foo=bar HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
        .await
        .expect("write inner request");

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match tokio::time::timeout(std::time::Duration::from_secs(2), tls.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(_)) => break,
        }
    }
    let response = String::from_utf8_lossy(&buf);
    assert!(
        response.contains("Requested Url: http://localhost:8080/prefix/https://example.com/path/file?foo=bar"),
        "unexpected response: {response}"
    );
}

fn masked_text_frame(text: &str) -> Vec<u8> {
    let payload = text.as_bytes();
    let mut out = vec![0x80 | 0x1, 0x80 | payload.len() as u8];
    let mask = [9u8, 8, 7, 6];
    out.extend_from_slice(&mask);
    out.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    out
}

#[tokio::test]
async fn scenario_7_wss_websocket_echoes_through_tunnel() {
    let (addr, ca) = start_proxy().await;
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .expect("write CONNECT");
    let mut envelope = vec![0u8; CONNECT_ESTABLISHED.len()];
    stream.read_exact(&mut envelope).await.expect("read envelope");

    let connector = trusting_tls_connector(&ca);
    let server_name = ServerName::try_from("example.com").expect("server name");
    let mut tls = connector.connect(server_name, stream).await.expect("tls connect");

    let client_key = base64::engine::general_purpose::STANDARD.encode(b"0123456789012345");
    let request = format!(
        "GET /websocket?type=ws HTTP/1.1\r\nHost: example.com\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: {client_key}\r\nSec-WebSocket-Version: 13\r\n\r\n"
    );
    tls.write_all(request.as_bytes()).await.expect("write ws upgrade");

    // Read the 101 response headers (ends with the blank line).
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        tls.read_exact(&mut byte).await.expect("read handshake byte");
        head.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&head);
    assert!(head.starts_with("HTTP/1.1 101"), "unexpected handshake: {head}");

    tls.write_all(&masked_text_frame("ssl message")).await.expect("write frame");

    // Read one server frame (unmasked: 2 header bytes + up to 125-byte payload).
    let mut frame_header = [0u8; 2];
    tls.read_exact(&mut frame_header).await.expect("read frame header");
    let len = (frame_header[1] & 0x7F) as usize;
    let mut payload = vec![0u8; len];
    tls.read_exact(&mut payload).await.expect("read frame payload");

    let text = String::from_utf8_lossy(&payload);
    assert_eq!(
        text,
        "WS Request Url: http://localhost:8080/prefix/https://example.com/websocket?type=ws Echo: ssl message"
    );
}

#[tokio::test]
async fn scenario_3_https_tunnel_post_body_round_trips() {
    let (addr, ca) = start_proxy().await;
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .expect("write CONNECT");
    let mut envelope = vec![0u8; CONNECT_ESTABLISHED.len()];
    stream.read_exact(&mut envelope).await.expect("read envelope");

    let connector = trusting_tls_connector(&ca);
    let server_name = ServerName::try_from("example.com").expect("server name");
    let mut tls = connector.connect(server_name, stream).await.expect("tls connect");

    let body = b"hello=world";
    let request = format!(
        "POST /path/file?foo=bar HTTP/1.1\r\nHost: example.com\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    tls.write_all(request.as_bytes()).await.expect("write request head");
    tls.write_all(body).await.expect("write request body");

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match tokio::time::timeout(std::time::Duration::from_secs(2), tls.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(_)) => break,
        }
    }
    let response = String::from_utf8_lossy(&buf);
    assert!(
        response.contains("Requested Url: http://localhost:8080/prefix/https://example.com/path/file?foo=bar"),
        "unexpected response: {response}"
    );
    assert!(response.contains("Post Data: hello=world"), "unexpected response: {response}");
}

#[tokio::test]
async fn scenario_5_https_identity_host_resolves_to_bare_path() {
    let (addr, ca) = start_proxy().await;
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream
        .write_all(b"CONNECT wsgiprox:443 HTTP/1.1\r\nHost: wsgiprox:443\r\n\r\n")
        .await
        .expect("write CONNECT");
    let mut envelope = vec![0u8; CONNECT_ESTABLISHED.len()];
    stream.read_exact(&mut envelope).await.expect("read envelope");

    let connector = trusting_tls_connector(&ca);
    let server_name = ServerName::try_from("wsgiprox").expect("server name");
    let mut tls = connector.connect(server_name, stream).await.expect("tls connect");

    tls.write_all(b"GET /path/file?foo=bar HTTP/1.1\r\nHost: wsgiprox\r\nConnection: close\r\n\r\n")
        .await
        .expect("write inner request");

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match tokio::time::timeout(std::time::Duration::from_secs(2), tls.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(_)) => break,
        }
    }
    let response = String::from_utf8_lossy(&buf);
    assert!(response.contains("Requested Url: /path/file?foo=bar"), "unexpected response: {response}");
}

#[tokio::test]
async fn scenario_6_plain_websocket_upgrade_echoes() {
    let (addr, _ca) = start_proxy().await;
    let mut stream = TcpStream::connect(addr).await.expect("connect");

    let client_key = base64::engine::general_purpose::STANDARD.encode(b"0123456789012345");
    let request = format!(
        "GET ws://example.com/websocket HTTP/1.1\r\nHost: example.com\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: {client_key}\r\nSec-WebSocket-Version: 13\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.expect("write ws upgrade");

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.expect("read handshake byte");
        head.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&head);
    assert!(head.starts_with("HTTP/1.1 101"), "unexpected handshake: {head}");

    stream.write_all(&masked_text_frame("hello")).await.expect("write frame");

    let mut frame_header = [0u8; 2];
    stream.read_exact(&mut frame_header).await.expect("read frame header");
    let len = (frame_header[1] & 0x7F) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.expect("read frame payload");

    let text = String::from_utf8_lossy(&payload);
    assert_eq!(
        text,
        "WS Request Url: http://localhost:8080/prefix/http://example.com/websocket Echo: hello"
    );
}
