use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use log::{info, warn};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::{ServerCertVerified, ServerCertVerifier};
use tokio_rustls::rustls::{
    Certificate, ClientConfig, OwnedTrustAnchor, PrivateKey, RootCertStore, ServerName,
};
use tokio_rustls::TlsConnector;

use crate::{MumbleConfig, TransportError};

pub async fn connect(config: &MumbleConfig) -> Result<TlsStream<TcpStream>, TransportError> {
    info!("Connecting to {}, port {}", config.host, config.port);

    let tls = client_config(config).await?;
    let domain = ServerName::try_from(config.host.as_str())
        .map_err(|_| TransportError::InvalidServerName(config.host.clone()))?;

    let stream = TcpStream::connect((config.host.as_str(), config.port)).await?;
    stream.set_nodelay(true)?;

    let connector = TlsConnector::from(Arc::new(tls));
    Ok(connector.connect(domain, stream).await?)
}

async fn client_config(config: &MumbleConfig) -> Result<ClientConfig, TransportError> {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));

    let builder = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots);

    let mut tls = match &config.certfile {
        Some(certfile) => {
            info!("Using certificate '{}'", certfile.display());
            let (certs, key) = load_identity(certfile).await?;
            builder.with_client_auth_cert(certs, key)?
        }
        None => builder.with_no_client_auth(),
    };

    if config.accept_invalid_certs {
        warn!("Server certificate verification is disabled");
        tls.dangerous()
            .set_certificate_verifier(Arc::new(AcceptAnyServerCert));
    }

    Ok(tls)
}

/// Reads a PEM file holding the client certificate chain and its PKCS#8 key.
async fn load_identity(path: &Path) -> Result<(Vec<Certificate>, PrivateKey), TransportError> {
    let content = tokio::fs::read(path).await?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut Cursor::new(&content))?
        .into_iter()
        .map(Certificate)
        .collect();

    if certs.is_empty() {
        return Err(TransportError::Certificate(format!(
            "no certificate in '{}'",
            path.display()
        )));
    }

    let key = rustls_pemfile::pkcs8_private_keys(&mut Cursor::new(&content))?
        .into_iter()
        .map(PrivateKey)
        .next()
        .ok_or_else(|| {
            TransportError::Certificate(format!("no PKCS#8 private key in '{}'", path.display()))
        })?;

    Ok((certs, key))
}

/// Mumble servers commonly run on self-signed certificates.
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn missing_key_is_reported() {
        let dir = std::env::temp_dir().join(format!("bridge-cert-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("empty.pem");
        tokio::fs::write(&path, b"").await.unwrap();

        let err = load_identity(&path).await.unwrap_err();
        assert!(matches!(err, TransportError::Certificate(_)));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn plain_config_builds() {
        let config = MumbleConfig::new("voice.example.org", "bridge");
        assert!(client_config(&config).await.is_ok());

        let mut config = config;
        config.accept_invalid_certs = true;
        assert!(client_config(&config).await.is_ok());
    }
}
