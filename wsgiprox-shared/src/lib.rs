#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

pub mod ca;
pub mod crypto;
pub mod error;
pub mod tls;
pub mod uri;

pub use ca::WsgiproxCa;
pub use error::CaError;
pub use uri::TargetUri;
