//! TLS context factory.
//!
//! Both sides authenticate each other against one CA: the server requires and
//! verifies client certificates, the client verifies the server certificate
//! and presents its own.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{Result, TransportError};

/// Paths of the PEM material making up one TLS profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

/// Ready-to-use client TLS context.
#[derive(Clone)]
pub struct ClientTls {
    pub(crate) connector: TlsConnector,
    pub(crate) server_name: ServerName<'static>,
}

impl ClientTls {
    /// Name the server certificate is verified against.
    pub fn server_name(&self) -> &ServerName<'static> {
        &self.server_name
    }
}

/// Build the server-side TLS context (mutual TLS).
pub fn server_context(files: &TlsFiles) -> Result<TlsAcceptor> {
    ensure_crypto_provider();

    let roots = load_roots(&files.ca)?;
    let certs = load_certs(&files.cert)?;
    let key = load_private_key(&files.key)?;

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| TransportError::Tls(format!("client verifier: {e}")))?;

    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(format!("invalid cert/key: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build the client-side TLS context, verifying the server as `server_name`.
pub fn client_context(files: &TlsFiles, server_name: &str) -> Result<ClientTls> {
    ensure_crypto_provider();

    let roots = load_roots(&files.ca)?;
    let certs = load_certs(&files.cert)?;
    let key = load_private_key(&files.key)?;

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| TransportError::Tls(format!("invalid cert/key: {e}")))?;

    let server_name = ServerName::try_from(server_name.to_string())
        .map_err(|_| TransportError::InvalidServerName(server_name.to_string()))?;

    Ok(ClientTls {
        connector: TlsConnector::from(Arc::new(config)),
        server_name,
    })
}

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("rustls crypto provider already installed");
        }
    });
}

fn open(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).map_err(|e| TransportError::TlsFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(BufReader::new(file))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsFile {
            path: path.to_path_buf(),
            source: e,
        })?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::TlsFile {
            path: path.to_path_buf(),
            source: e,
        })?
        .ok_or_else(|| TransportError::Tls(format!("no private key found in {}", path.display())))
}

fn load_roots(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| TransportError::Tls(format!("invalid CA certificate: {e}")))?;
    }
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use rcgen::{
        BasicConstraints, CertificateParams, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::tcp::{Dialer, MuxListener};

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "tunmux-tls-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        dir
    }

    /// Writes a CA plus server and client leaf certificates, returns (server, client) profiles.
    fn write_pki(dir: &Path) -> (TlsFiles, TlsFiles) {
        let ca_key = KeyPair::generate().expect("ca key");
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).expect("ca params");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca = ca_params.self_signed(&ca_key).expect("ca cert");

        let issue = |name: &str, purpose: ExtendedKeyUsagePurpose| {
            let key = KeyPair::generate().expect("leaf key");
            let mut params =
                CertificateParams::new(vec!["localhost".to_string()]).expect("leaf params");
            params.extended_key_usages = vec![purpose];
            let cert = params.signed_by(&key, &ca, &ca_key).expect("leaf cert");
            let cert_path = dir.join(format!("{name}.pem"));
            let key_path = dir.join(format!("{name}.key"));
            std::fs::write(&cert_path, cert.pem()).expect("write cert");
            std::fs::write(&key_path, key.serialize_pem()).expect("write key");
            (cert_path, key_path)
        };

        let (server_cert, server_key) = issue("server", ExtendedKeyUsagePurpose::ServerAuth);
        let (client_cert, client_key) = issue("client", ExtendedKeyUsagePurpose::ClientAuth);

        let ca_path = dir.join("ca.pem");
        std::fs::write(&ca_path, ca.pem()).expect("write ca");

        (
            TlsFiles {
                cert: server_cert,
                key: server_key,
                ca: ca_path.clone(),
            },
            TlsFiles {
                cert: client_cert,
                key: client_key,
                ca: ca_path,
            },
        )
    }

    #[test]
    fn missing_files_are_config_errors() {
        let files = TlsFiles {
            cert: PathBuf::from("/nonexistent/tunmux/cert.pem"),
            key: PathBuf::from("/nonexistent/tunmux/key.pem"),
            ca: PathBuf::from("/nonexistent/tunmux/ca.pem"),
        };

        let err = server_context(&files).err().expect("server context should fail");
        assert!(matches!(err, TransportError::TlsFile { .. }));
        assert!(err.is_config());

        let err = client_context(&files, "localhost")
            .err()
            .expect("client context should fail");
        assert!(err.is_config());
    }

    #[test]
    fn empty_pem_is_rejected() {
        let dir = temp_dir("empty");
        let empty = dir.join("empty.pem");
        std::fs::write(&empty, "").expect("write empty");
        let files = TlsFiles {
            cert: empty.clone(),
            key: empty.clone(),
            ca: empty,
        };

        let err = server_context(&files).err().expect("should fail");
        assert!(matches!(err, TransportError::Tls(_)));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn mutual_tls_roundtrip() {
        let dir = temp_dir("mtls");
        let (server_files, client_files) = write_pki(&dir);

        let acceptor = server_context(&server_files).expect("server context");
        let client_tls = client_context(&client_files, "localhost").expect("client context");

        let listener = MuxListener::bind("127.0.0.1:0", Some(acceptor))
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().to_string();
        assert_eq!(listener.transport_name(), "tcp+tls");

        let server = tokio::spawn(async move {
            let incoming = listener.accept().await.expect("accept");
            let mut stream = incoming.establish().await.expect("tls handshake");
            assert!(stream.is_tls());
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.expect("read");
            stream.write_all(&buf).await.expect("write");
            stream.flush().await.expect("flush");
        });

        let mut client = Dialer::with_tls(client_tls)
            .dial(&addr)
            .await
            .expect("tls dial");
        assert!(client.is_tls());
        client.write_all(b"hello").await.expect("write");
        client.flush().await.expect("flush");
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"hello");

        server.await.expect("server task");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
