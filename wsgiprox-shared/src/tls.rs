use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use rustls::version::{TLS12, TLS13};

use crate::error::CaError;

/// Builds a server-side TLS configuration for one intercepted connection,
/// presenting `leaf`/`key` for every client hello. rustls negotiates TLS
/// 1.2 or 1.3 on its own; there is no SSLv2/SSLv3 code path to refuse.
pub fn leaf_server_config(
    leaf: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig, CaError> {
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    let signing_key = provider
        .key_provider
        .load_private_key(key)
        .map_err(CaError::RustLs)?;
    let certified_key = CertifiedKey::new(vec![leaf], signing_key);

    let mut config = ServerConfig::builder_with_protocol_versions(&[&TLS12, &TLS13])
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SingleCertResolver(Arc::new(certified_key))));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

#[derive(Debug)]
struct SingleCertResolver(Arc<CertifiedKey>);

impl rustls::server::ResolvesServerCert for SingleCertResolver {
    fn resolve(&self, _client_hello: rustls::server::ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}
