//! A minimal downstream application used for manual smoke-testing and the
//! integration tests: it echoes back the rewritten request URL, matching
//! the literal response bodies the end-to-end scenarios describe.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::stream;
use http::StatusCode;
use tokio::io::AsyncReadExt;
use tracing::debug;

use wsgiprox_core::app::{App, AppResponse};
use wsgiprox_core::request::NormalizedRequest;
use wsgiprox_core::websocket::{Message, WebSocketStream};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub struct EchoApp;

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

            let mut response = AppResponse::new(StatusCode::OK);
            response
                .headers
                .insert(http::header::CONTENT_TYPE, http::HeaderValue::from_static("text/plain"));
            response.body = Box::pin(stream::once(async move { Bytes::from(text.into_bytes()) }));
            response
        })
    }

    fn call_websocket<'a>(&'a self, req: NormalizedRequest, mut ws: WebSocketStream) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            loop {
                match ws.recv().await {
                    Ok(Some(Message::Text(text))) => {
                        let reply = format!("WS Request Url: {} Echo: {text}", req.request_uri);
                        if ws.send(Message::Text(reply)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(Message::Binary(data))) => {
                        if ws.send(Message::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(Message::Ping(payload))) => {
                        if ws.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(Message::Pong(_))) => {}
                    Ok(Some(Message::Close(_))) | Ok(None) => break,
                    Err(e) => {
                        debug!("websocket session ended: {e}");
                        break;
                    }
                }
            }
        })
    }
}
