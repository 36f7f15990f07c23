//! The Proxy Dispatcher (spec §4.1): the first thing that sees a freshly
//! accepted connection. A CONNECT request is routed straight to the Tunnel
//! Engine against the raw socket; everything else is served as ordinary
//! HTTP/1.1, with the plain-HTTP proxy rewrite, the magic CA-distribution
//! paths, and the non-TLS WebSocket upgrade handled inline.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body::Frame;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyStream, Full, StreamBody};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use wsgiprox_shared::WsgiproxCa;

use crate::app::App;
use crate::error::TunnelError;
use crate::peek_stream::PeekStream;
use crate::request::{BodyReader, NormalizedRequest, UrlScheme, fold_headers};
use crate::resolver::{ResolveContext, UrlResolver};
use crate::tunnel::{self, read_http_head};
use crate::websocket::{WebSocketStream, accept_key};

pub const CA_PEM_PATH: &str = "/wsgiprox-ca.pem";
pub const CA_P12_PATH: &str = "/wsgiprox-ca.p12";

type RespBody = BoxBody<Bytes, Infallible>;

#[derive(Clone)]
pub struct Dispatcher {
    resolver: Arc<dyn UrlResolver>,
    app: Arc<dyn App>,
    ca: WsgiproxCa,
    own_hostnames: Arc<Vec<String>>,
    use_wildcard_cert: bool,
}

impl Dispatcher {
    pub fn new(
        resolver: Arc<dyn UrlResolver>,
        app: Arc<dyn App>,
        ca: WsgiproxCa,
        own_hostnames: Vec<String>,
        use_wildcard_cert: bool,
    ) -> Self {
        Dispatcher {
            resolver,
            app,
            ca,
            own_hostnames: Arc::new(own_hostnames),
            use_wildcard_cert,
        }
    }

    /// Entry point for one freshly-accepted connection. Peeks the first
    /// bytes so a CONNECT request can be handled directly against the raw
    /// socket (the Tunnel Engine writes the literal envelope itself); any
    /// other request is served through hyper's HTTP/1.1 connection driver.
    pub async fn serve_connection<S>(self, stream: S) -> Result<(), TunnelError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut peek = PeekStream::new(stream);
        let looks_like_connect = peek.peek(8).await?.starts_with(b"CONNECT ");

        if looks_like_connect {
            let head = read_http_head(&mut peek).await?;
            let target = wsgiprox_shared::TargetUri::from_connect_target(&head.target)
                .map_err(|e| TunnelError::BadRequest(format!("bad CONNECT target: {e}")))?;
            return tunnel::run_tunnel(
                peek.into_inner(),
                target.host().to_string(),
                target.port(),
                self.resolver.clone(),
                self.app.clone(),
                &self.ca,
                self.use_wildcard_cert,
            )
            .await;
        }

        let io = TokioIo::new(peek);
        hyper::server::conn::http1::Builder::new()
            .serve_connection(io, service_fn(move |req| {
                let dispatcher = self.clone();
                async move { dispatcher.handle_http(req).await }
            }))
            .with_upgrades()
            .await
            .map_err(|e| TunnelError::Io(std::io::Error::other(e)))
    }

    async fn handle_http(self, mut req: Request<Incoming>) -> Result<Response<RespBody>, Infallible> {
        if req.method() == Method::CONNECT {
            warn!("CONNECT reached the HTTP dispatcher; raw socket was not available");
            return Ok(text_response(StatusCode::METHOD_NOT_ALLOWED, "HTTPS Proxy Not Supported"));
        }

        if let Some(response) = self.serve_magic_path(&req) {
            return Ok(response);
        }

        let is_websocket_upgrade = req
            .headers()
            .get(http::header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));

        let is_absolute_proxy_form = req.uri().scheme().is_some();

        if is_absolute_proxy_form && is_websocket_upgrade {
            return Ok(self.handle_plain_websocket(req).await);
        }

        let effective_url = if is_absolute_proxy_form {
            req.uri().to_string()
        } else {
            req.uri().path_and_query().map(ToString::to_string).unwrap_or_default()
        };

        let (request_uri, path_info, query_string) = if is_absolute_proxy_form {
            let ctx = ResolveContext { headers: req.headers() };
            let rewritten = self.resolver.resolve(&effective_url, &ctx);
            let (path_info, query_string) = NormalizedRequest::split_path_and_query(&rewritten);
            (rewritten, path_info, query_string)
        } else {
            let (path_info, query_string) = NormalizedRequest::split_path_and_query(&effective_url);
            (effective_url.clone(), path_info, query_string)
        };

        let method = req.method().to_string();
        let server_protocol = format!("{:?}", req.version());
        let headers = fold_headers(
            req.headers()
                .iter()
                .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
        );
        let body: BodyReader = incoming_to_reader(req.into_body());

        let normalized = NormalizedRequest {
            method,
            request_uri,
            path_info,
            query_string,
            server_protocol,
            url_scheme: UrlScheme::Http,
            proxy_scheme: None,
            proxy_host: None,
            proxy_port: None,
            headers,
            body,
        };

        let app_response = self.app.call(normalized).await;
        let mut response = Response::builder().status(app_response.status);
        if let Some(response_headers) = response.headers_mut() {
            *response_headers = app_response.headers;
        }
        Ok(response
            .body(BoxBody::new(StreamBody::new(
                app_response.body.map(|chunk| Ok::<_, Infallible>(Frame::data(chunk))),
            )))
            .unwrap_or_else(|_| text_response(StatusCode::INTERNAL_SERVER_ERROR, "response build failed")))
    }

    /// The non-TLS WebSocket upgrade path for a plain `ws://` proxied
    /// request (scenario 6): hyper writes the 101 reply itself, then the
    /// connection is hijacked for raw frame I/O.
    async fn handle_plain_websocket(self, mut req: Request<Incoming>) -> Response<RespBody> {
        let Some(client_key) = req
            .headers()
            .get("sec-websocket-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
        else {
            return text_response(StatusCode::BAD_REQUEST, "missing Sec-WebSocket-Key");
        };

        // The client's request-target carries a `ws://` scheme; the app
        // sees the same effective URL it would for a plain HTTP request to
        // the same host (scenario 6 expects `http://`, not `ws://`).
        let authority = req
            .uri()
            .authority()
            .map(ToString::to_string)
            .or_else(|| req.headers().get(http::header::HOST).and_then(|v| v.to_str().ok()).map(str::to_string))
            .unwrap_or_default();
        let effective_url = format!("http://{authority}{}", req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/"));
        let ctx = ResolveContext { headers: req.headers() };
        let rewritten = self.resolver.resolve(&effective_url, &ctx);
        let (path_info, query_string) = NormalizedRequest::split_path_and_query(&rewritten);
        let method = req.method().to_string();
        let headers = fold_headers(
            req.headers()
                .iter()
                .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
        );

        let upgrade = hyper::upgrade::on(&mut req);
        let app = self.app.clone();
        tokio::spawn(async move {
            let upgraded = match upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    debug!("websocket upgrade failed: {e}");
                    return;
                }
            };
            let io = TokioIo::new(upgraded);
            let ws = WebSocketStream::new(io);
            let normalized = NormalizedRequest {
                method,
                request_uri: rewritten,
                path_info,
                query_string,
                server_protocol: "HTTP/1.1".to_string(),
                url_scheme: UrlScheme::Http,
                proxy_scheme: None,
                proxy_host: None,
                proxy_port: None,
                headers,
                body: Box::pin(tokio::io::empty()),
            };
            app.call_websocket(normalized, ws).await;
        });

        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(http::header::UPGRADE, "websocket")
            .header(http::header::CONNECTION, "Upgrade")
            .header("Sec-WebSocket-Accept", accept_key(&client_key))
            .body(BoxBody::new(Full::new(Bytes::new())))
            .unwrap_or_else(|_| text_response(StatusCode::INTERNAL_SERVER_ERROR, "handshake build failed"))
    }

    fn serve_magic_path(&self, req: &Request<Incoming>) -> Option<Response<RespBody>> {
        let path = req.uri().path();
        if path != CA_PEM_PATH && path != CA_P12_PATH {
            return None;
        }
        if !self.own_hostnames.is_empty() && !self.is_own_host(req.headers()) {
            return None;
        }

        if path == CA_PEM_PATH {
            let pem_bytes = pem_encode(self.ca.root_cert_der());
            Some(bytes_response(StatusCode::OK, "application/x-x509-ca-cert", pem_bytes))
        } else {
            match self.ca.root_pkcs12("wsgiprox") {
                Ok(bundle) => Some(bytes_response(StatusCode::OK, "application/x-pkcs12", bundle)),
                Err(e) => {
                    warn!("failed to export root CA as pkcs12: {e}");
                    Some(text_response(StatusCode::INTERNAL_SERVER_ERROR, "CA export failed"))
                }
            }
        }
    }

    fn is_own_host(&self, headers: &HeaderMap) -> bool {
        let Some(host) = headers.get(http::header::HOST).and_then(|v| v.to_str().ok()) else {
            return false;
        };
        let host_only = host.split(':').next().unwrap_or(host);
        self.own_hostnames.iter().any(|h| h == host_only || h == host)
    }
}

fn pem_encode(der: &[u8]) -> Vec<u8> {
    use base64::Engine;
    let encoded = base64::engine::general_purpose::STANDARD.encode(der);
    let mut out = String::from("-----BEGIN CERTIFICATE-----\n");
    for line in encoded.as_bytes().chunks(64) {
        out.push_str(&String::from_utf8_lossy(line));
        out.push('\n');
    }
    out.push_str("-----END CERTIFICATE-----\n");
    out.into_bytes()
}

fn incoming_to_reader(body: Incoming) -> BodyReader {
    let stream = BodyStream::new(body)
        .try_filter_map(|frame| async move { Ok(frame.into_data().ok()) })
        .map_err(std::io::Error::other);
    Box::pin(StreamReader::new(stream))
}

fn text_response(status: StatusCode, body: &'static str) -> Response<RespBody> {
    Response::builder()
        .status(status)
        .body(BoxBody::new(Full::new(Bytes::from_static(body.as_bytes()))))
        .unwrap_or_else(|_| Response::new(BoxBody::new(Full::new(Bytes::new()))))
}

fn bytes_response(status: StatusCode, content_type: &'static str, body: Vec<u8>) -> Response<RespBody> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, content_type)
        .body(BoxBody::new(Full::new(Bytes::from(body))))
        .unwrap_or_else(|_| text_response(StatusCode::INTERNAL_SERVER_ERROR, "response build failed"))
}
