use std::error::Error;

use wsgiprox_shared::CaError;

#[derive(Debug)]
pub enum TunnelError {
    Io(std::io::Error),
    Ca(CaError),
    Tls(rustls::Error),
    Http(httparse::Error),
    WebSocket(String),
    BadRequest(String),
}

impl Error for TunnelError {}

impl std::fmt::Display for TunnelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<std::io::Error> for TunnelError {
    fn from(value: std::io::Error) -> Self {
        TunnelError::Io(value)
    }
}

impl From<CaError> for TunnelError {
    fn from(value: CaError) -> Self {
        TunnelError::Ca(value)
    }
}

impl From<rustls::Error> for TunnelError {
    fn from(value: rustls::Error) -> Self {
        TunnelError::Tls(value)
    }
}

impl From<httparse::Error> for TunnelError {
    fn from(value: httparse::Error) -> Self {
        TunnelError::Http(value)
    }
}
