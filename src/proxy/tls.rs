//! Local root CA for HTTPS interception.
//!
//! The CA lives in `ca.pem`/`ca.key` under the configured directory and is
//! generated there on first use. Leaf certificates are minted per host on
//! demand and their server configs cached for the life of the process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose,
};
use rustls::crypto::CryptoProvider;
use rustls::ServerConfig;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::TlsAcceptor;

/// File holding the CA certificate.
pub const CA_CERT_FILE: &str = "ca.pem";
/// File holding the CA private key.
pub const CA_KEY_FILE: &str = "ca.key";

const CA_COMMON_NAME: &str = "vcrproxy interception CA";

/// Errors raised while loading the CA or minting certificates.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// The CA files exist but cannot be used.
    #[error("invalid CA in {}: {reason}", .path.display())]
    InvalidCa {
        /// Offending file or directory.
        path: PathBuf,
        /// What is wrong.
        reason: String,
    },
    /// Filesystem failure.
    #[error("failed to {action} {}: {source}", .path.display())]
    Io {
        /// What was being attempted.
        action: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Certificate generation failed.
    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),
    /// rustls rejected the generated material.
    #[error("tls configuration failed: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Root CA that signs a leaf certificate for every intercepted host.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    provider: Arc<CryptoProvider>,
    leaves: Mutex<HashMap<String, Arc<ServerConfig>>>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority").finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Generates a fresh CA held only in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if key or certificate generation fails.
    pub fn generate() -> Result<Self, TlsError> {
        Self::generate_with_key().map(|(ca, _)| ca)
    }

    fn generate_with_key() -> Result<(Self, String), TlsError> {
        let key = KeyPair::generate()?;
        let key_pem = key.serialize_pem();
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name = distinguished_name(CA_COMMON_NAME);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let cert = params.self_signed(&key)?;
        Ok((Self::assemble(Issuer::new(params, key), cert.der().clone(), cert.pem()), key_pem))
    }

    /// Loads the CA from `dir`, generating and persisting one if neither file
    /// exists yet.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::InvalidCa`] if only one of the files exists or
    /// either cannot be parsed.
    pub fn load_or_create(dir: &Path) -> Result<Self, TlsError> {
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);
        match (cert_path.exists(), key_path.exists()) {
            (true, true) => Self::load(&cert_path, &key_path),
            (false, false) => {
                let (ca, key_pem) = Self::generate_with_key()?;
                std::fs::create_dir_all(dir).map_err(|source| TlsError::Io {
                    action: "create",
                    path: dir.to_path_buf(),
                    source,
                })?;
                write(&key_path, &key_pem)?;
                write(&cert_path, &ca.cert_pem)?;
                tracing::info!(path = %cert_path.display(), "generated interception CA");
                Ok(ca)
            }
            _ => Err(TlsError::InvalidCa {
                path: dir.to_path_buf(),
                reason: format!("expected both {CA_CERT_FILE} and {CA_KEY_FILE}"),
            }),
        }
    }

    fn load(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        let cert_pem = read(cert_path)?;
        let key_pem = read(key_path)?;
        let invalid =
            |path: &Path, reason: String| TlsError::InvalidCa { path: path.to_path_buf(), reason };
        let key = KeyPair::from_pem(&key_pem).map_err(|err| invalid(key_path, err.to_string()))?;
        let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes())
            .map_err(|err| invalid(cert_path, err.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key)
            .map_err(|err| invalid(cert_path, err.to_string()))?;
        tracing::debug!(path = %cert_path.display(), "loaded interception CA");
        Ok(Self::assemble(issuer, cert_der, cert_pem))
    }

    fn assemble(
        issuer: Issuer<'static, KeyPair>,
        cert_der: CertificateDer<'static>,
        cert_pem: String,
    ) -> Self {
        Self {
            issuer,
            cert_der,
            cert_pem,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            leaves: Mutex::new(HashMap::new()),
        }
    }

    /// PEM of the CA certificate, for clients to trust.
    #[must_use]
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// TLS acceptor presenting a leaf certificate for `host`. Ports and IPv6
    /// brackets are stripped; leaves are cached per host.
    ///
    /// # Errors
    ///
    /// Returns an error if the leaf cannot be minted.
    pub fn acceptor_for(&self, host: &str) -> Result<TlsAcceptor, TlsError> {
        let host = host_name(host);
        let mut leaves = self.leaves.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(config) = leaves.get(host) {
            return Ok(TlsAcceptor::from(Arc::clone(config)));
        }
        let config = Arc::new(self.mint(host)?);
        leaves.insert(host.to_string(), Arc::clone(&config));
        tracing::debug!(host, "minted leaf certificate");
        Ok(TlsAcceptor::from(config))
    }

    fn mint(&self, host: &str) -> Result<ServerConfig, TlsError> {
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::new(vec![host.to_string()])?;
        params.distinguished_name = distinguished_name(host);
        params.is_ca = IsCa::NoCa;
        params.use_authority_key_identifier_extension = true;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let leaf = params.signed_by(&key, &self.issuer)?;

        let chain = vec![leaf.der().clone(), self.cert_der.clone()];
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
        let mut config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(chain, key_der)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(config)
    }
}

/// Host part of an authority: `[::1]:443` → `::1`, `api.test:8443` → `api.test`.
fn host_name(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            host
        }
        _ => authority,
    }
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, common_name);
    name
}

fn read(path: &Path) -> Result<String, TlsError> {
    std::fs::read_to_string(path)
        .map_err(|source| TlsError::Io { action: "read", path: path.to_path_buf(), source })
}

fn write(path: &Path, contents: &str) -> Result<(), TlsError> {
    std::fs::write(path, contents)
        .map_err(|source| TlsError::Io { action: "write", path: path.to_path_buf(), source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_name_strips_ports_and_brackets() {
        assert_eq!(host_name("api.test:8443"), "api.test");
        assert_eq!(host_name("api.test"), "api.test");
        assert_eq!(host_name("[::1]:443"), "::1");
        assert_eq!(host_name("127.0.0.1:5001"), "127.0.0.1");
    }

    #[test]
    fn generated_ca_is_persisted_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let created = CertificateAuthority::load_or_create(dir.path()).unwrap();
        assert!(dir.path().join(CA_CERT_FILE).exists());
        assert!(dir.path().join(CA_KEY_FILE).exists());

        let loaded = CertificateAuthority::load_or_create(dir.path()).unwrap();
        assert_eq!(loaded.cert_pem(), created.cert_pem());
        loaded.acceptor_for("api.example.test:443").unwrap();
    }

    #[test]
    fn half_present_or_garbled_ca_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CA_CERT_FILE), "not a cert").unwrap();
        assert!(matches!(
            CertificateAuthority::load_or_create(dir.path()),
            Err(TlsError::InvalidCa { .. })
        ));

        std::fs::write(dir.path().join(CA_KEY_FILE), "not a key").unwrap();
        assert!(matches!(
            CertificateAuthority::load_or_create(dir.path()),
            Err(TlsError::InvalidCa { .. })
        ));
    }

    #[test]
    fn leaves_are_cached_per_host() {
        let ca = CertificateAuthority::generate().unwrap();
        ca.acceptor_for("a.test:443").unwrap();
        ca.acceptor_for("a.test:8443").unwrap();
        ca.acceptor_for("b.test").unwrap();
        assert_eq!(ca.leaves.lock().unwrap().len(), 2);
    }
}
