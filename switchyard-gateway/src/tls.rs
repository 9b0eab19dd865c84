//! TLS termination for the gateway listener.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use anyhow::Context;
use pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;

/// Builds a TLS acceptor from the configured certificate and key paths.
pub fn build_acceptor(config: &TlsConfig) -> anyhow::Result<TlsAcceptor> {
    let cert_file = File::open(&config.cert_path)
        .with_context(|| format!("opening certificate {}", config.cert_path))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .context("reading certificate chain")?;

    let key_file =
        File::open(&config.key_path).with_context(|| format!("opening key {}", config.key_path))?;
    let mut key_reader = BufReader::new(key_file);
    let key = rustls_pemfile::pkcs8_private_keys(&mut key_reader)
        .map(|result| result.map(PrivateKeyDer::Pkcs8))
        .next()
        .context("no PKCS#8 private key found")?
        .context("reading private key")?;

    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("assembling TLS server config")?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
