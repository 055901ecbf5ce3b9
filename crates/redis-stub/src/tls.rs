//! Certificates and rustls configuration for secure-mode stubs.
//!
//! Every secure server generates its own short-lived self-signed identity.
//! Tests trust that certificate directly; there is no CA chain.

use crate::error::StubError;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

const VALIDITY: Duration = Duration::hours(3);

/// A PEM-encoded certificate and its private key.
#[derive(Clone)]
pub struct CertifiedPem {
    pub cert_pem: String,
    pub key_pem: String,
}

impl std::fmt::Debug for CertifiedPem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertifiedPem")
            .field("cert_pem", &self.cert_pem)
            .finish_non_exhaustive()
    }
}

/// Generate a fresh ECDSA P-256 certificate for `localhost`, valid for a few
/// hours and usable for both server and client authentication.
pub fn generate_self_signed() -> Result<CertifiedPem, StubError> {
    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;

    let mut params = CertificateParams::new(vec!["localhost".to_string()])?;
    let mut name = DistinguishedName::new();
    name.push(DnType::OrganizationName, "redis-stub");
    name.push(DnType::CommonName, "localhost");
    params.distinguished_name = name;

    // 128 random bits, top bit cleared to keep the DER integer positive.
    let mut serial: [u8; 16] = rand::random();
    serial[0] &= 0x7f;
    params.serial_number = Some(SerialNumber::from_slice(&serial));

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::minutes(1);
    params.not_after = now + VALIDITY;
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    let cert = params.self_signed(&key_pair)?;
    Ok(CertifiedPem {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

/// TLS 1.3 server config presenting `identity`. With `client_ca`, clients
/// must present a certificate that chains to one of its entries.
pub fn server_config(
    identity: &CertifiedPem,
    client_ca: Option<&[u8]>,
) -> Result<Arc<ServerConfig>, StubError> {
    let certs = parse_certs(identity.cert_pem.as_bytes())?;
    let key = parse_key(identity.key_pem.as_bytes())?;

    let builder = ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?;

    let config = match client_ca {
        Some(pem) => {
            let roots = root_store(pem)?;
            let verifier =
                WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider()).build()?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)?
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key)?,
    };

    Ok(Arc::new(config))
}

/// TLS 1.3 client config trusting `server_cert_pem`, optionally presenting
/// `identity` for mutual TLS.
pub fn client_config(
    server_cert_pem: &[u8],
    identity: Option<&CertifiedPem>,
) -> Result<Arc<ClientConfig>, StubError> {
    let builder = ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_root_certificates(root_store(server_cert_pem)?);

    let config = match identity {
        Some(identity) => builder.with_client_auth_cert(
            parse_certs(identity.cert_pem.as_bytes())?,
            parse_key(identity.key_pem.as_bytes())?,
        )?,
        None => builder.with_no_client_auth(),
    };

    Ok(Arc::new(config))
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn root_store(pem: &[u8]) -> Result<RootCertStore, StubError> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certs(pem)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, StubError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(StubError::Pem)?;
    if certs.is_empty() {
        return Err(StubError::NoCertificates);
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, StubError> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(StubError::Pem)?
        .ok_or(StubError::NoPrivateKey)
}
