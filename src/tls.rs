//! TLS configuration for connections to the attestation service
//!
//! Normal connections validate the server chain against the webpki roots.
//! Test deployments may opt out of chain validation with
//! `ignore_certificate_errors`; handshake signatures are still checked so
//! the peer must hold the key of the certificate it presents.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};

use crate::error::{Error, Result};

/// Certificate verifier that accepts any server chain
#[derive(Debug)]
pub struct PermissiveCertVerifier {
    /// Standard verifier, used only for handshake signatures
    inner: Arc<rustls::client::WebPkiServerVerifier>,
}

impl PermissiveCertVerifier {
    pub fn new() -> Result<Self> {
        let inner = rustls::client::WebPkiServerVerifier::builder(Arc::new(root_store()))
            .build()
            .map_err(|e| Error::Tls(format!("Failed to build verifier: {}", e)))?;

        Ok(Self { inner })
    }
}

impl ServerCertVerifier for PermissiveCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        tracing::warn!(server = ?server_name, "accepting server certificate without chain validation");
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn root_store() -> rustls::RootCertStore {
    rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    }
}

/// Build the rustls client configuration for the given validation mode
pub fn client_config(ignore_certificate_errors: bool) -> Result<rustls::ClientConfig> {
    // Ensure crypto provider is installed
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let config = if ignore_certificate_errors {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PermissiveCertVerifier::new()?))
            .with_no_client_auth()
    } else {
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store())
            .with_no_client_auth()
    };

    Ok(config)
}

/// Create a reqwest client over the configured TLS stack
pub fn create_client(ignore_certificate_errors: bool, use_compression: bool) -> Result<reqwest::Client> {
    let config = client_config(ignore_certificate_errors)?;

    reqwest::Client::builder()
        .use_preconfigured_tls(config)
        .gzip(use_compression)
        .build()
        .map_err(|e| Error::Tls(format!("Failed to build HTTP client: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_store_not_empty() {
        assert!(!root_store().roots.is_empty());
    }

    #[test]
    fn test_client_configs_build() {
        assert!(client_config(false).is_ok());
        assert!(client_config(true).is_ok());
    }
}
