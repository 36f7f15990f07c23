use std::error::Error;

#[derive(Debug)]
pub enum CaError {
    Io(std::io::Error),
    RcGen(rcgen::Error),
    KeyStore(p12_keystore::error::Error),
    RustLs(rustls::Error),
    RustLsPem(rustls::pki_types::pem::Error),
    NoHomeDir,
}

impl Error for CaError {}

impl std::fmt::Display for CaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<std::io::Error> for CaError {
    fn from(value: std::io::Error) -> Self {
        CaError::Io(value)
    }
}

impl From<rcgen::Error> for CaError {
    fn from(value: rcgen::Error) -> Self {
        CaError::RcGen(value)
    }
}

impl From<p12_keystore::error::Error> for CaError {
    fn from(value: p12_keystore::error::Error) -> Self {
        CaError::KeyStore(value)
    }
}

impl From<rustls::Error> for CaError {
    fn from(value: rustls::Error) -> Self {
        CaError::RustLs(value)
    }
}

impl From<rustls::pki_types::pem::Error> for CaError {
    fn from(value: rustls::pki_types::pem::Error) -> Self {
        CaError::RustLsPem(value)
    }
}
