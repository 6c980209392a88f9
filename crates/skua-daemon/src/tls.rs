//! TLS listener configuration and the chain-of-trust authenticator.
//!
//! Mutual authentication is mandatory. Because revocation state lives in
//! the engine, the authenticator cannot be cached: a fresh
//! [`rustls::ServerConfig`] is built for every accepted connection,
//! embedding a [`ChainVerifier`] closed over the CRL snapshot taken at
//! accept time. Only TLS 1.2 is offered.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};
use thiserror::Error;
use tracing::debug;

use skua_core::policy::chain::{verify_chain, CrlSnapshot};
use skua_core::wire::WIRE_VERSION;

/// Errors while loading the TLS material at startup.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TlsSetupError {
    /// Reading a PEM file failed.
    #[error("failed to read {path}: {source}")]
    Io {
        /// The file being read.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The CA file must contain exactly one certificate.
    #[error("expected exactly one CA certificate, found {0}")]
    CaCount(usize),

    /// The server certificate file contained no certificate.
    #[error("no server certificate in {0}")]
    NoCert(String),

    /// The key file contained no usable private key.
    #[error("no private key in {0}")]
    NoKey(String),

    /// rustls rejected the material.
    #[error(transparent)]
    Tls(#[from] rustls::Error),
}

/// Server identity plus trust root, loaded once at startup.
pub struct TlsAuthority {
    ca_der: Vec<u8>,
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    provider: Arc<CryptoProvider>,
}

impl TlsAuthority {
    /// Loads the CA certificate, server certificate, and server key.
    ///
    /// # Errors
    ///
    /// Returns [`TlsSetupError`] when a file is unreadable, the CA file
    /// does not hold exactly one certificate, or the key is unusable.
    pub fn load(cacert: &Path, cert: &Path, key: &Path) -> Result<Self, TlsSetupError> {
        let read = |path: &Path| -> Result<std::fs::File, TlsSetupError> {
            std::fs::File::open(path).map_err(|source| TlsSetupError::Io {
                path: path.display().to_string(),
                source,
            })
        };

        let ca_certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(read(cacert)?))
            .collect::<Result<_, _>>()
            .map_err(|source| TlsSetupError::Io {
                path: cacert.display().to_string(),
                source,
            })?;
        if ca_certs.len() != 1 {
            return Err(TlsSetupError::CaCount(ca_certs.len()));
        }
        let ca_der = ca_certs[0].as_ref().to_vec();

        let cert_chain: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(read(cert)?))
            .collect::<Result<_, _>>()
            .map_err(|source| TlsSetupError::Io {
                path: cert.display().to_string(),
                source,
            })?;
        if cert_chain.is_empty() {
            return Err(TlsSetupError::NoCert(cert.display().to_string()));
        }

        let key = rustls_pemfile::private_key(&mut BufReader::new(read(key)?))
            .map_err(|source| TlsSetupError::Io {
                path: key.display().to_string(),
                source,
            })?
            .ok_or_else(|| TlsSetupError::NoKey(key.display().to_string()))?;

        Ok(Self {
            ca_der,
            cert_chain,
            key,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        })
    }

    /// DER of the trust root, handed to the engine for chain verification.
    #[must_use]
    pub fn ca_der(&self) -> &[u8] {
        &self.ca_der
    }

    /// Builds the per-connection server configuration.
    ///
    /// `crls` is the revocation snapshot taken at accept time; the
    /// resulting configuration must not be reused for later connections.
    ///
    /// # Errors
    ///
    /// Returns [`rustls::Error`] if the configuration cannot be built.
    pub fn server_config(&self, crls: CrlSnapshot) -> Result<Arc<ServerConfig>, rustls::Error> {
        let verifier = Arc::new(ChainVerifier {
            ca_der: self.ca_der.clone(),
            crls,
            provider: Arc::clone(&self.provider),
        });
        let config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_protocol_versions(&[&rustls::version::TLS12])?
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.cert_chain.clone(), self.key.clone_key())?;
        Ok(Arc::new(config))
    }
}

/// Client certificate verifier running the engine's chain validation.
///
/// TLS-level acceptance here is only the transport gate; the engine
/// re-verifies the chain (with a fresh snapshot) in `handle_initial` and
/// derives authorization from it.
#[derive(Debug)]
struct ChainVerifier {
    ca_der: Vec<u8>,
    crls: CrlSnapshot,
    provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for ChainVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let mut chain: Vec<Vec<u8>> = Vec::with_capacity(intermediates.len() + 1);
        chain.push(end_entity.as_ref().to_vec());
        chain.extend(intermediates.iter().map(|cert| cert.as_ref().to_vec()));

        match verify_chain(&chain, &self.ca_der, &self.crls, Utc::now(), WIRE_VERSION) {
            Ok(_) => Ok(ClientCertVerified::assertion()),
            Err(e) => {
                debug!(error = %e, "client chain rejected during handshake");
                Err(rustls::Error::General(e.to_string()))
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
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
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
