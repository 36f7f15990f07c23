//! Hand-rolled WebSocket handshake and frame codec (RFC 6455). wsgiprox
//! tunnels a handful of frame types end to end; it does not need a general
//! purpose client/server library for that, so this stays a small, self
//! contained implementation rather than pulling in a framework crate.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TunnelError;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes `Sec-WebSocket-Accept` from the client's `Sec-WebSocket-Key`
/// (spec §7, RFC 6455 section 1.3).
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// The literal 101 response bytes. No trailing blank line beyond the one
/// that ends the header block — the handshake response ends the framing
/// itself, so nothing else is written before the first data frame.
pub fn handshake_response(client_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_key(client_key)
    )
}

trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<(u16, String)>),
}

const OP_CONTINUATION: u8 = 0x0;
const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xA;

/// A WebSocket connection tunneled over an already-accepted byte stream
/// (plain TCP for the WS-before-TLS path, or the TLS-terminated stream for
/// an intercepted `wss://` upgrade).
pub struct WebSocketStream {
    io: Box<dyn AsyncStream>,
}

impl WebSocketStream {
    pub fn new(io: impl AsyncRead + AsyncWrite + Send + Unpin + 'static) -> Self {
        WebSocketStream { io: Box::new(io) }
    }

    /// Reads one logical message, reassembling continuation frames. Control
    /// frames (ping/pong/close) may interleave a fragmented message per RFC
    /// 6455 and are returned as soon as they're read rather than buffered.
    pub async fn recv(&mut self) -> Result<Option<Message>, TunnelError> {
        let mut assembled: Vec<u8> = Vec::new();
        let mut assembled_opcode: Option<u8> = None;

        loop {
            let frame = match read_frame(&mut self.io).await? {
                Some(frame) => frame,
                None => return Ok(None),
            };

            match frame.opcode {
                OP_PING => return Ok(Some(Message::Ping(frame.payload))),
                OP_PONG => return Ok(Some(Message::Pong(frame.payload))),
                OP_CLOSE => return Ok(Some(Message::Close(parse_close_payload(&frame.payload)))),
                OP_CONTINUATION => {
                    assembled.extend_from_slice(&frame.payload);
                }
                OP_TEXT | OP_BINARY => {
                    assembled_opcode = Some(frame.opcode);
                    assembled = frame.payload;
                }
                other => return Err(TunnelError::WebSocket(format!("unsupported opcode {other}"))),
            }

            if frame.fin {
                let opcode = assembled_opcode.ok_or_else(|| {
                    TunnelError::WebSocket("continuation frame with no preceding header frame".into())
                })?;
                return Ok(Some(match opcode {
                    OP_TEXT => Message::Text(
                        String::from_utf8(assembled)
                            .map_err(|_| TunnelError::WebSocket("invalid utf-8 in text frame".into()))?,
                    ),
                    _ => Message::Binary(assembled),
                }));
            }
        }
    }

    pub async fn send(&mut self, message: Message) -> Result<(), TunnelError> {
        let (opcode, payload) = match message {
            Message::Text(text) => (OP_TEXT, text.into_bytes()),
            Message::Binary(data) => (OP_BINARY, data),
            Message::Ping(data) => (OP_PING, data),
            Message::Pong(data) => (OP_PONG, data),
            Message::Close(reason) => (OP_CLOSE, encode_close_payload(reason)),
        };
        write_frame(&mut self.io, opcode, &payload).await
    }

    pub async fn close(mut self, code: u16, reason: &str) -> Result<(), TunnelError> {
        self.send(Message::Close(Some((code, reason.to_string())))).await
    }
}

struct Frame {
    fin: bool,
    opcode: u8,
    payload: Vec<u8>,
}

/// Server-received frames MUST be masked (RFC 6455 section 5.1); unmasked
/// frames are a protocol violation and abort the connection.
async fn read_frame(io: &mut Box<dyn AsyncStream>) -> Result<Option<Frame>, TunnelError> {
    let mut header = [0u8; 2];
    if io.read_exact(&mut header).await.is_err() {
        return Ok(None);
    }

    let fin = header[0] & 0x80 != 0;
    let opcode = header[0] & 0x0F;
    let masked = header[1] & 0x80 != 0;
    if !masked {
        return Err(TunnelError::WebSocket("client frame was not masked".into()));
    }

    let len_bits = header[1] & 0x7F;
    let payload_len: u64 = match len_bits {
        126 => {
            let mut ext = [0u8; 2];
            io.read_exact(&mut ext).await?;
            u16::from_be_bytes(ext) as u64
        }
        127 => {
            let mut ext = [0u8; 8];
            io.read_exact(&mut ext).await?;
            u64::from_be_bytes(ext)
        }
        n => n as u64,
    };

    let mut mask = [0u8; 4];
    io.read_exact(&mut mask).await?;

    let mut payload = vec![0u8; payload_len as usize];
    io.read_exact(&mut payload).await?;
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }

    Ok(Some(Frame { fin, opcode, payload }))
}

/// Server-sent frames MUST NOT be masked (RFC 6455 section 5.1).
async fn write_frame(io: &mut Box<dyn AsyncStream>, opcode: u8, payload: &[u8]) -> Result<(), TunnelError> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    out.push(0x80 | opcode);

    let len = payload.len();
    if len < 126 {
        out.push(len as u8);
    } else if len <= u16::MAX as usize {
        out.push(126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    out.extend_from_slice(payload);

    io.write_all(&out).await?;
    io.flush().await?;
    Ok(())
}

fn parse_close_payload(payload: &[u8]) -> Option<(u16, String)> {
    if payload.len() < 2 {
        return None;
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).to_string();
    Some((code, reason))
}

fn encode_close_payload(reason: Option<(u16, String)>) -> Vec<u8> {
    match reason {
        Some((code, text)) => {
            let mut out = code.to_be_bytes().to_vec();
            out.extend_from_slice(text.as_bytes());
            out
        }
        None => Vec::new(),
    }
}
