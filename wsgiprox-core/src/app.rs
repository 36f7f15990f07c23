//! The downstream application contract (spec §6). Implementing this is out
//! of scope for wsgiprox itself — it only defines the boundary the
//! Dispatcher and Tunnel Engine hand normalized requests across.

use std::future::Future;
use std::pin::Pin;

use futures_util::stream::BoxStream;
use http::{HeaderMap, StatusCode};

use crate::request::NormalizedRequest;
use crate::websocket::WebSocketStream;

pub type BodyStream = BoxStream<'static, bytes::Bytes>;
type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What the app hands back for a plain HTTP(S) request. The WSGI
/// `start_response(status, headers)` callback collapses into this return
/// value: the Tunnel Engine writes `status`/`headers` before polling the
/// first item of `body`, so "callback fires exactly once before any body
/// byte" holds structurally rather than by convention.
pub struct AppResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl AppResponse {
    pub fn new(status: StatusCode) -> Self {
        AppResponse {
            status,
            headers: HeaderMap::new(),
            body: Box::pin(futures_util::stream::empty()),
        }
    }

    pub fn with_body(mut self, body: BodyStream) -> Self {
        self.body = body;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// A downstream application embedded behind the proxy. `call` handles every
/// non-websocket request (including ones wsgiprox itself didn't intercept,
/// e.g. magic paths are served by the Dispatcher before the app ever sees
/// them). `call_websocket` handles requests that upgraded; the app reads and
/// writes through `ws` directly instead of returning a body.
pub trait App: Send + Sync {
    fn call<'a>(&'a self, req: NormalizedRequest) -> BoxFuture<'a, AppResponse>;

    /// Default: closes the connection with "going away", matching the
    /// stance of an app that never opted into websockets.
    fn call_websocket<'a>(
        &'a self,
        req: NormalizedRequest,
        ws: WebSocketStream,
    ) -> BoxFuture<'a, ()> {
        let _ = req;
        Box::pin(async move {
            let _ = ws.close(1001, "websocket not supported").await;
        })
    }
}
