//! TLS termination for `https` endpoints, built on tokio-rustls.

use std::sync::Arc;

use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{self, RootCertStore};
use tokio_rustls::TlsAcceptor;

use crate::config::{ClientCertPolicy, TlsOptions};

/// Builds the shared acceptor out of the engine's TLS options.
///
/// Fails at engine start, never at accept time: bad certificate material is
/// a configuration error.
pub(crate) fn build_acceptor(options: &TlsOptions) -> crate::Result<TlsAcceptor> {
    let provider = Arc::new(ring::default_provider());

    let builder = rustls::ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(crate::Error::new_listen)?;

    let builder = match options.client_cert {
        ClientCertPolicy::None => builder.with_no_client_auth(),
        ref policy => {
            let mut roots = RootCertStore::empty();
            for root in &options.client_ca_roots {
                roots.add(root.clone()).map_err(crate::Error::new_listen)?;
            }
            let mut verifier =
                WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                    .with_crls(options.revocation_lists.iter().cloned());
            if *policy == ClientCertPolicy::Optional {
                verifier = verifier.allow_unauthenticated();
            }
            let verifier = verifier.build().map_err(crate::Error::new_listen)?;
            builder.with_client_cert_verifier(verifier)
        }
    };

    let mut config = builder
        .with_single_cert(
            options.cert_chain.clone(),
            options.private_key.clone_key(),
        )
        .map_err(crate::Error::new_listen)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}
