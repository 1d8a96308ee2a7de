use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Build a TLS acceptor from configured cert/key paths.
///
/// Returns `None` (plain HTTP) unless both paths are configured, as opposed
/// to the lineage's auto-generated self-signed fallback: an unreachable
/// HTTPS endpoint a browser will actually refuse to connect to is a louder,
/// more honest failure mode than a silently-trusted throwaway cert.
pub fn build_acceptor(
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> Result<Option<tokio_rustls::TlsAcceptor>> {
    let (cert_path, key_path) = match (cert_path, key_path) {
        (Some(cert), Some(key)) => (cert, key),
        _ => return Ok(None),
    };

    let (certs, key) = load_certs_from_files(cert_path, key_path)?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Failed to build TLS server config")?;

    Ok(Some(tokio_rustls::TlsAcceptor::from(Arc::new(config))))
}

fn load_certs_from_files(
    cert_path: &str,
    key_path: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_pem = std::fs::read(cert_path)
        .with_context(|| format!("Failed to read TLS cert: {cert_path}"))?;
    let key_pem =
        std::fs::read(key_path).with_context(|| format!("Failed to read TLS key: {key_path}"))?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to parse TLS certificate PEM")?;

    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .context("Failed to parse TLS private key PEM")?
        .context("No private key found in PEM file")?;

    tracing::info!("Loaded TLS cert from {cert_path}");
    Ok((certs, key))
}
