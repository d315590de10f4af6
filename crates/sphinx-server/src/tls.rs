use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio_rustls::TlsAcceptor;

/// Build the server-side TLS acceptor from PEM files.
pub fn acceptor(cert_path: &Path, key_path: &Path) -> anyhow::Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(
        File::open(cert_path)
            .with_context(|| format!("opening ssl_cert {}", cert_path.display()))?,
    ))
    .collect::<Result<Vec<_>, _>>()
    .context("parsing ssl_cert PEM")?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(
        File::open(key_path).with_context(|| format!("opening ssl_key {}", key_path.display()))?,
    ))
    .context("parsing ssl_key PEM")?
    .context("ssl_key contains no private key")?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building TLS config")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
