use once_cell::sync::OnceCell;

pub static INIT_CRYPTO: OnceCell<()> = OnceCell::new();

/// Installs the process-wide rustls crypto provider. Safe to call repeatedly;
/// only the first call has any effect.
#[allow(clippy::expect_used)]
pub fn init_crypto() {
    INIT_CRYPTO.get_or_init(|| {
        rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .expect("failed to install rustls crypto provider");
    });
}
