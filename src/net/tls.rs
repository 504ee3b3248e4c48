//! # TLS Wrapper
//!
//! Builds the `rustls` server configuration from [`TlsOptions`] and exposes it as a pipeline
//! stage that performs the server handshake before a connection reaches the core.
//!
//! Key and trust stores are PEM files. The key store carries the certificate chain followed by
//! the private key (PKCS#8, PKCS#1 or SEC1); the trust store carries the CA certificates client
//! certificates are verified against.

use super::options::{ClientAuth, TlsOptions};
use super::pipeline::StreamStage;
use super::stream::ConnStream;
use crate::error::NetError;
use async_trait::async_trait;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

/// Builds the server configuration. Every failure is reported as [`NetError::TlsConfig`].
pub fn server_config(options: &TlsOptions) -> Result<Arc<ServerConfig>, NetError> {
    options.validate()?;
    let key_store = options
        .key_store_path
        .as_deref()
        .ok_or_else(|| NetError::TlsConfig("keyStorePath is not set".into()))?;
    if options.key_store_password.is_some() || options.trust_store_password.is_some() {
        warn!("Store passwords are ignored; PEM stores are read unencrypted");
    }

    let chain = load_certs(key_store)?;
    let key = PrivateKeyDer::from_pem_file(key_store).map_err(|e| {
        NetError::TlsConfig(format!("no private key in {}: {e}", key_store.display()))
    })?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| NetError::TlsConfig(e.to_string()))?;

    let builder = match options.client_auth {
        ClientAuth::None => builder.with_no_client_auth(),
        mode @ (ClientAuth::Request | ClientAuth::Required) => {
            let trust_store = options
                .trust_store_path
                .as_deref()
                .ok_or_else(|| NetError::TlsConfig("trustStorePath is not set".into()))?;
            let mut roots = RootCertStore::empty();
            for cert in load_certs(trust_store)? {
                roots
                    .add(cert)
                    .map_err(|e| NetError::TlsConfig(format!("bad trust anchor: {e}")))?;
            }
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider);
            let verifier = if mode == ClientAuth::Request {
                verifier.allow_unauthenticated()
            } else {
                verifier
            };
            let verifier = verifier
                .build()
                .map_err(|e| NetError::TlsConfig(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        }
    };

    let config = builder
        .with_single_cert(chain, key)
        .map_err(|e| NetError::TlsConfig(e.to_string()))?;
    debug!(client_auth = ?options.client_auth, "TLS configuration loaded");
    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, NetError> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| NetError::TlsConfig(format!("cannot read {}: {e}", path.display())))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| NetError::TlsConfig(format!("bad certificate in {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(NetError::TlsConfig(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Pipeline stage running the TLS server handshake.
pub struct TlsStage {
    acceptor: TlsAcceptor,
}

impl TlsStage {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
        }
    }

    pub fn from_options(options: &TlsOptions) -> Result<Self, NetError> {
        Ok(Self::new(server_config(options)?))
    }
}

#[async_trait]
impl StreamStage for TlsStage {
    fn name(&self) -> &'static str {
        "tls"
    }

    async fn apply(&self, stream: ConnStream) -> Result<ConnStream, NetError> {
        match stream {
            ConnStream::Plain(tcp) => {
                let tls = self
                    .acceptor
                    .accept(tcp)
                    .await
                    .map_err(|e| NetError::Tls(format!("handshake failed: {e}")))?;
                Ok(ConnStream::Tls(Box::new(tls)))
            }
            ConnStream::Tls(_) => Err(NetError::Tls("stream is already encrypted".into())),
        }
    }
}
