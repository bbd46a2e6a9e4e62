//! # Cryptographic Infrastructure
//!
//! - **Signatures**: Domain-separated Ed25519 signing and verification
//! - **Certificates**: Self-signed Ed25519 certificates bound to the identity key
//! - **TLS**: rustls client/server configurations under a [`TlsVersionPolicy`]
//! - **Thumbprints**: SHA-256 certificate fingerprints used for pinning
//!
//! ## Trust Model
//!
//! No PKI or CA is involved. The TLS layer only checks that the peer
//! presents a well-formed Ed25519 certificate and proves possession of its
//! key; who the peer *is* gets decided after the handshake by the signed
//! hello (identity binding) and the certificate pin store (TOFU). The
//! `dangerous()` rustls APIs are therefore used on purpose.
//!
//! ## Domain Separation
//!
//! Each signed structure uses its own prefix so a signature produced for
//! one context can never be replayed in another.

use std::sync::Arc;

use anyhow::{Context, Result};
use ed25519_dalek::Signature;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use sha2::{Digest, Sha256};

use crate::config::TlsVersionPolicy;
use crate::identity::{Keypair, PublicKey};

// ============================================================================
// Signature Error Types
// ============================================================================

/// Error type for signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

// ============================================================================
// Domain Separation Prefixes
// ============================================================================

/// Peer descriptor signatures.
pub const DESCRIPTOR_SIGNATURE_DOMAIN: &[u8] = b"meshgate-descriptor-v1:";

/// Identity-key endorsements of control signing keys.
pub const CONTROL_KEY_ENDORSEMENT_DOMAIN: &[u8] = b"meshgate-control-keys-v1:";

/// Content provider record signatures.
pub const PROVIDER_SIGNATURE_DOMAIN: &[u8] = b"meshgate-provider-v1:";

/// Application hello exchanged after the TLS handshake.
pub const HELLO_SIGNATURE_DOMAIN: &[u8] = b"meshgate-hello-v1:";

/// Relay registration challenge responses.
pub const RELAY_REGISTER_DOMAIN: &[u8] = b"meshgate-relay-register-v1:";

/// DHT and NAT requests carried over UDP.
pub const RPC_REQUEST_DOMAIN: &[u8] = b"meshgate-rpc-request-v1:";

/// Sign data with domain separation.
///
/// Returns the 64-byte Ed25519 signature as a `Vec<u8>`.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a domain-separated signature against an advertised public key.
///
/// Uses `verify_strict` so malleable and small-order encodings are refused.
pub fn verify_with_domain(
    public_key: &PublicKey,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> std::result::Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;

    let verifying_key = public_key
        .verifying_key()
        .ok_or(SignatureError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

// ============================================================================
// Certificates
// ============================================================================

/// ALPN protocol identifier for overlay connections.
pub const ALPN: &[u8] = b"meshgate/1";

/// SNI presented by clients. Peers are identified by the hello, not by name.
const OVERLAY_SERVER_NAME: &str = "meshgate.overlay";

/// Hex-encoded SHA-256 of a DER certificate.
pub fn certificate_thumbprint(cert_der: &[u8]) -> String {
    hex::encode(Sha256::digest(cert_der))
}

fn ed25519_pkcs8(keypair: &Keypair) -> Vec<u8> {
    const ED25519_OID: [u8; 5] = [0x06, 0x03, 0x2b, 0x65, 0x70];
    const PKCS8_VERSION: [u8; 3] = [0x02, 0x01, 0x00];

    let mut pkcs8 = Vec::with_capacity(48);
    pkcs8.extend_from_slice(&[0x30, 0x2e]);
    pkcs8.extend_from_slice(&PKCS8_VERSION);
    pkcs8.extend_from_slice(&[0x30, 0x05]);
    pkcs8.extend_from_slice(&ED25519_OID);
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]);
    pkcs8.extend_from_slice(&keypair.secret_key_bytes());
    pkcs8
}

/// Generate a self-signed certificate for the identity key, valid from
/// `not_before` until `not_after`.
pub fn generate_certificate(
    keypair: &Keypair,
    not_before: time::OffsetDateTime,
    not_after: time::OffsetDateTime,
) -> Result<CertificateDer<'static>> {
    let pkcs8_der = PrivatePkcs8KeyDer::from(ed25519_pkcs8(keypair));
    let key_pair = rcgen::KeyPair::try_from(&pkcs8_der)
        .context("failed to create Ed25519 key pair for certificate")?;

    let mut params = rcgen::CertificateParams::new(vec![OVERLAY_SERVER_NAME.to_string()])
        .context("failed to create certificate params")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(keypair.peer_id().to_hex()),
    );
    params.not_before = not_before;
    params.not_after = not_after;

    let cert = params
        .self_signed(&key_pair)
        .context("failed to generate self-signed Ed25519 certificate")?;
    Ok(CertificateDer::from(cert.der().to_vec()))
}

/// Generate a certificate valid for `validity_days` starting one hour ago.
pub fn generate_identity_certificate(
    keypair: &Keypair,
    validity_days: u32,
) -> Result<CertificateDer<'static>> {
    let now = time::OffsetDateTime::now_utc();
    generate_certificate(
        keypair,
        now - time::Duration::hours(1),
        now + time::Duration::days(i64::from(validity_days)),
    )
}

pub fn extract_public_key_from_cert(cert_der: &[u8]) -> Option<[u8; 32]> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    let key_bytes = &cert.public_key().subject_public_key.data;
    key_bytes.as_ref().try_into().ok()
}

/// Certificate `notAfter` as milliseconds since the Unix epoch.
pub fn certificate_not_after_ms(cert_der: &[u8]) -> Option<u64> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    let secs = cert.validity().not_after.timestamp();
    u64::try_from(secs).ok().map(|s| s.saturating_mul(1000))
}

// ============================================================================
// TLS Configuration
// ============================================================================

fn protocol_versions(
    policy: TlsVersionPolicy,
) -> &'static [&'static rustls::SupportedProtocolVersion] {
    static STRICT: [&rustls::SupportedProtocolVersion; 1] = [&rustls::version::TLS13];
    static FALLBACK: [&rustls::SupportedProtocolVersion; 2] =
        [&rustls::version::TLS13, &rustls::version::TLS12];
    match policy {
        TlsVersionPolicy::StrictLatest => &STRICT,
        TlsVersionPolicy::LatestWithFallback => &FALLBACK,
    }
}

/// Client and server TLS configurations built from one identity certificate.
#[derive(Clone)]
pub struct TlsMaterial {
    pub client: Arc<rustls::ClientConfig>,
    pub server: Arc<rustls::ServerConfig>,
    pub certificate: CertificateDer<'static>,
    pub thumbprint: String,
    pub policy: TlsVersionPolicy,
}

impl TlsMaterial {
    pub fn new(
        keypair: &Keypair,
        certificate: CertificateDer<'static>,
        policy: TlsVersionPolicy,
    ) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let key = PrivateKeyDer::Pkcs8(ed25519_pkcs8(keypair).into());
        let versions = protocol_versions(policy);

        let mut server = rustls::ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(versions)
            .context("unsupported TLS protocol versions for server")?
            .with_client_cert_verifier(Arc::new(Ed25519ClientCertVerifier {
                provider: provider.clone(),
            }))
            .with_single_cert(vec![certificate.clone()], key.clone_key())
            .context("failed to create server TLS config")?;
        server.alpn_protocols = vec![ALPN.to_vec()];

        let mut client = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(versions)
            .context("unsupported TLS protocol versions for client")?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(Ed25519ServerCertVerifier { provider }))
            .with_client_auth_cert(vec![certificate.clone()], key)
            .context("failed to create client TLS config with client auth")?;
        client.alpn_protocols = vec![ALPN.to_vec()];

        let thumbprint = certificate_thumbprint(certificate.as_ref());
        Ok(Self {
            client: Arc::new(client),
            server: Arc::new(server),
            certificate,
            thumbprint,
            policy,
        })
    }

    pub fn server_name() -> Result<ServerName<'static>> {
        ServerName::try_from(OVERLAY_SERVER_NAME).context("invalid overlay server name")
    }
}

fn check_ed25519_certificate(end_entity: &CertificateDer<'_>) -> Result<(), rustls::Error> {
    let public_key = extract_public_key_from_cert(end_entity.as_ref()).ok_or(
        rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding),
    )?;
    if !PublicKey::from_bytes(public_key).is_valid() {
        return Err(rustls::Error::InvalidCertificate(
            rustls::CertificateError::ApplicationVerificationFailure,
        ));
    }
    Ok(())
}

#[derive(Debug)]
struct Ed25519ClientCertVerifier {
    provider: Arc<CryptoProvider>,
}

impl rustls::server::danger::ClientCertVerifier for Ed25519ClientCertVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        check_ed25519_certificate(end_entity)?;
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct Ed25519ServerCertVerifier {
    provider: Arc<CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for Ed25519ServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        check_ed25519_certificate(end_entity)?;
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;

    #[test]
    fn domain_separated_signature_roundtrip() {
        let keypair = Keypair::generate();
        let sig = sign_with_domain(&keypair, DESCRIPTOR_SIGNATURE_DOMAIN, b"payload");
        assert!(
            verify_with_domain(&keypair.public_key(), DESCRIPTOR_SIGNATURE_DOMAIN, b"payload", &sig)
                .is_ok()
        );
    }

    #[test]
    fn signature_does_not_cross_domains() {
        let keypair = Keypair::generate();
        let sig = sign_with_domain(&keypair, HELLO_SIGNATURE_DOMAIN, b"payload");
        assert_eq!(
            verify_with_domain(&keypair.public_key(), DESCRIPTOR_SIGNATURE_DOMAIN, b"payload", &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn malformed_signatures_are_classified() {
        let keypair = Keypair::generate();
        let pk = keypair.public_key();
        assert_eq!(
            verify_with_domain(&pk, HELLO_SIGNATURE_DOMAIN, b"x", &[]),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            verify_with_domain(&pk, HELLO_SIGNATURE_DOMAIN, b"x", &[0u8; 10]),
            Err(SignatureError::InvalidLength)
        );
        let sig = sign_with_domain(&keypair, HELLO_SIGNATURE_DOMAIN, b"x");
        assert_eq!(
            verify_with_domain(&PublicKey::from_bytes([0u8; 32]), HELLO_SIGNATURE_DOMAIN, b"x", &sig),
            Err(SignatureError::InvalidPublicKey)
        );
    }

    #[test]
    fn certificate_carries_identity_key() {
        let keypair = Keypair::generate();
        let cert = generate_identity_certificate(&keypair, 30).expect("certificate");
        assert_eq!(
            extract_public_key_from_cert(cert.as_ref()),
            Some(keypair.public_key_bytes())
        );
    }

    #[test]
    fn certificate_not_after_reflects_validity() {
        let keypair = Keypair::generate();
        let cert = generate_identity_certificate(&keypair, 10).expect("certificate");
        let not_after = certificate_not_after_ms(cert.as_ref()).expect("not_after");
        let now = crate::clock::SystemClock.now_ms();
        let ten_days = 10 * 24 * 60 * 60 * 1000;
        assert!(not_after > now + ten_days - 60_000);
        assert!(not_after < now + ten_days + 60_000);
    }

    #[test]
    fn thumbprints_differ_between_certificates() {
        let keypair = Keypair::generate();
        let a = generate_identity_certificate(&keypair, 30).unwrap();
        let b = generate_identity_certificate(&keypair, 31).unwrap();
        let ta = certificate_thumbprint(a.as_ref());
        assert_eq!(ta.len(), 64);
        assert_ne!(ta, certificate_thumbprint(b.as_ref()));
    }

    #[test]
    fn tls_material_builds_for_both_policies() {
        let keypair = Keypair::generate();
        let cert = generate_identity_certificate(&keypair, 30).unwrap();
        for policy in [TlsVersionPolicy::StrictLatest, TlsVersionPolicy::LatestWithFallback] {
            let material = TlsMaterial::new(&keypair, cert.clone(), policy).expect("tls material");
            assert_eq!(material.thumbprint, certificate_thumbprint(cert.as_ref()));
            assert_eq!(material.client.alpn_protocols, vec![ALPN.to_vec()]);
        }
        assert_eq!(protocol_versions(TlsVersionPolicy::StrictLatest).len(), 1);
        assert_eq!(protocol_versions(TlsVersionPolicy::LatestWithFallback).len(), 2);
    }
}
