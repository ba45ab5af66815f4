//! Encrypted or plain byte channels
//!
//! Both variants satisfy the same read/write contract; which one is used is
//! decided once, when the factory is built from the configuration.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::{Mode, TlsConfig};
use crate::error::{Error, Result};

/// A bidirectional byte stream a session can run over
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Type-erased channel handed to the authenticator
pub type Channel = Box<dyn AsyncStream>;

/// Builds channels on top of connected TCP streams
#[derive(Clone)]
pub enum ChannelFactory {
    /// No encryption
    Plain,
    /// TLS server side
    TlsServer(TlsAcceptor),
    /// TLS client side
    TlsClient {
        connector: TlsConnector,
        server_name: Option<String>,
    },
}

impl std::fmt::Debug for ChannelFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelFactory::Plain => write!(f, "ChannelFactory::Plain"),
            ChannelFactory::TlsServer(_) => write!(f, "ChannelFactory::TlsServer"),
            ChannelFactory::TlsClient { server_name, .. } => {
                write!(f, "ChannelFactory::TlsClient({:?})", server_name)
            }
        }
    }
}

impl ChannelFactory {
    /// Select and prepare the channel variant for this instance
    pub fn from_config(tls: &TlsConfig, mode: Mode) -> Result<Self> {
        if !tls.enabled {
            tracing::warn!("Proceeding in plain-text mode, eavesdropping communications will be easy");
            return Ok(ChannelFactory::Plain);
        }

        match mode {
            Mode::Listen => Self::server(tls),
            Mode::Dial => Self::client(tls),
        }
    }

    fn server(tls: &TlsConfig) -> Result<Self> {
        let key_file = required(&tls.key_file, "X.509 private key")?;
        let cert_file = required(&tls.cert_file, "X.509 certificate")?;
        let certs = load_certs(cert_file)?;
        let key = load_private_key(key_file)?;
        tracing::info!("Using peer TLS private key: {}", key_file.display());
        tracing::info!("Using peer TLS certificate: {}", cert_file.display());

        let builder = ServerConfig::builder();
        let builder = match &tls.ca_file {
            Some(ca_file) => {
                let roots = load_roots(ca_file)?;
                let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                    .build()
                    .map_err(|e| Error::TlsMaterial(format!("client verifier: {}", e)))?;
                tracing::info!("Peers will be authenticated with the TLS certificate authority");
                builder.with_client_cert_verifier(verifier)
            }
            None => {
                tracing::warn!("Peers can connect without a TLS certificate, the internal VPN address will be exposed");
                builder.with_no_client_auth()
            }
        };
        let config = builder
            .with_single_cert(certs, key)
            .map_err(|e| Error::TlsMaterial(format!("certificate/key mismatch: {}", e)))?;

        Ok(ChannelFactory::TlsServer(TlsAcceptor::from(Arc::new(config))))
    }

    fn client(tls: &TlsConfig) -> Result<Self> {
        let ca_file = required(&tls.ca_file, "X.509 certificate authority")?;
        let roots = load_roots(ca_file)?;
        let builder = ClientConfig::builder().with_root_certificates(roots);

        let config = match (&tls.key_file, &tls.cert_file) {
            (Some(key_file), Some(cert_file)) => {
                tracing::info!("Using peer TLS certificate: {}", cert_file.display());
                builder
                    .with_client_auth_cert(load_certs(cert_file)?, load_private_key(key_file)?)
                    .map_err(|e| Error::TlsMaterial(format!("client certificate/key mismatch: {}", e)))?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(Error::TlsMaterial(
                    "a client certificate requires both a key file and a certificate file".into(),
                ))
            }
        };

        Ok(ChannelFactory::TlsClient {
            connector: TlsConnector::from(Arc::new(config)),
            server_name: tls.server_name.clone(),
        })
    }

    /// Scheme shown in logs
    pub fn scheme(&self) -> &'static str {
        match self {
            ChannelFactory::Plain => "tcp",
            _ => "tls",
        }
    }

    /// Run the server side of the channel handshake
    pub async fn accept(&self, stream: TcpStream) -> Result<Channel> {
        stream.set_nodelay(true)?;
        match self {
            ChannelFactory::Plain => Ok(Box::new(stream)),
            ChannelFactory::TlsServer(acceptor) => {
                let tls = acceptor.accept(stream).await.map_err(tls_error)?;
                Ok(Box::new(tls))
            }
            ChannelFactory::TlsClient { .. } => {
                Err(Error::Tls("client-side TLS factory cannot accept connections".into()))
            }
        }
    }

    /// Run the client side of the channel handshake; `host` is the dialed name
    pub async fn connect(&self, stream: TcpStream, host: &str) -> Result<Channel> {
        stream.set_nodelay(true)?;
        match self {
            ChannelFactory::Plain => Ok(Box::new(stream)),
            ChannelFactory::TlsClient { connector, server_name } => {
                let name = server_name.as_deref().unwrap_or(host);
                let domain = ServerName::try_from(name.to_string())
                    .map_err(|e| Error::Config(format!("invalid TLS server name '{}': {}", name, e)))?;
                let tls = connector.connect(domain, stream).await.map_err(tls_error)?;
                Ok(Box::new(tls))
            }
            ChannelFactory::TlsServer(_) => {
                Err(Error::Tls("server-side TLS factory cannot dial".into()))
            }
        }
    }
}

/// Pull the TLS diagnostic out of a handshake I/O error
fn tls_error(err: std::io::Error) -> Error {
    let detail = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .map(|tls| format!("TLS Error - [{}]", tls));
    match detail {
        Some(detail) => Error::Tls(detail),
        None => Error::Tls(err.to_string()),
    }
}

fn required<'a>(path: &'a Option<std::path::PathBuf>, what: &str) -> Result<&'a Path> {
    path.as_deref()
        .ok_or_else(|| Error::TlsMaterial(format!("{} path is not configured", what)))
}

fn open(path: &Path, what: &str) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| Error::TlsMaterial(format!("{} {} not readable: {}", what, path.display(), e)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open(path, "X.509 certificate")?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::TlsMaterial(format!("invalid certificate {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::TlsMaterial(format!("no certificate found in {}", path.display())));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open(path, "X.509 private key")?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::TlsMaterial(format!("invalid private key {}: {}", path.display(), e)))?
        .ok_or_else(|| Error::TlsMaterial(format!("no private key found in {}", path.display())))
}

fn load_roots(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| Error::TlsMaterial(format!("invalid CA certificate {}: {}", path.display(), e)))?;
    }
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_plain_factory_when_tls_disabled() {
        let tls = TlsConfig { enabled: false, ..TlsConfig::default() };
        let factory = ChannelFactory::from_config(&tls, Mode::Listen).unwrap();
        assert!(matches!(factory, ChannelFactory::Plain));
        assert_eq!(factory.scheme(), "tcp");
    }

    #[test]
    fn test_missing_material_is_reported() {
        let tls = TlsConfig {
            key_file: Some(PathBuf::from("/nonexistent/key.pem")),
            cert_file: Some(PathBuf::from("/nonexistent/cert.pem")),
            ..TlsConfig::default()
        };
        let err = ChannelFactory::from_config(&tls, Mode::Listen).unwrap_err();
        assert!(matches!(err, Error::TlsMaterial(_)));
        assert_eq!(err.exit_code(), 105);

        let err = ChannelFactory::from_config(&TlsConfig::default(), Mode::Dial).unwrap_err();
        assert!(matches!(err, Error::TlsMaterial(_)));
    }

    #[test]
    fn test_empty_pem_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("ca.pem");
        std::fs::write(&ca, "not a certificate\n").unwrap();
        let tls = TlsConfig { ca_file: Some(ca), ..TlsConfig::default() };
        assert!(matches!(
            ChannelFactory::from_config(&tls, Mode::Dial),
            Err(Error::TlsMaterial(_))
        ));
    }

    #[tokio::test]
    async fn test_plain_channel_carries_bytes() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let factory = ChannelFactory::Plain;

        let server = tokio::spawn({
            let factory = factory.clone();
            async move {
                let (stream, _) = listener.accept().await.unwrap();
                let mut channel = factory.accept(stream).await.unwrap();
                let mut buf = [0u8; 4];
                channel.read_exact(&mut buf).await.unwrap();
                buf
            }
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut channel = factory.connect(stream, "127.0.0.1").await.unwrap();
        channel.write_all(b"ping").await.unwrap();
        assert_eq!(&server.await.unwrap(), b"ping");
    }

    mod handshake {
        use super::*;
        use crate::auth::Authenticator;
        use crate::network::codec::TunnelCodec;
        use crate::peers::PeerRegistry;
        use rcgen::{
            BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, SanType,
        };
        use std::net::{IpAddr, Ipv4Addr};
        use tokio_util::codec::Framed;

        const PEERS_A: &str = "10.0.0.1/24:psk1:AA:BB:CC:DD:EE:01\n10.0.0.2:psk2:AA:BB:CC:DD:EE:02\n";
        const PEERS_B: &str = "10.0.0.2/24:psk2:AA:BB:CC:DD:EE:02\n10.0.0.1:psk1:AA:BB:CC:DD:EE:01\n";

        fn authority(name: &str) -> Certificate {
            let mut params = CertificateParams::default();
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.distinguished_name.push(DnType::CommonName, name);
            Certificate::from_params(params).unwrap()
        }

        /// Certificate and key PEM signed by `ca`, valid for localhost and 127.0.0.1
        fn issue(ca: &Certificate, name: &str, usage: ExtendedKeyUsagePurpose) -> (String, String) {
            let mut params = CertificateParams::new(vec!["localhost".to_string()]);
            params.subject_alt_names.push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
            params.distinguished_name.push(DnType::CommonName, name);
            params.extended_key_usages = vec![usage];
            let cert = Certificate::from_params(params).unwrap();
            (cert.serialize_pem_with_signer(ca).unwrap(), cert.serialize_private_key_pem())
        }

        fn write(dir: &Path, name: &str, pem: &str) -> PathBuf {
            let path = dir.join(name);
            std::fs::write(&path, pem).unwrap();
            path
        }

        struct Material {
            _dir: tempfile::TempDir,
            listener: TlsConfig,
            dialer: TlsConfig,
            anonymous: TlsConfig,
            stranger: TlsConfig,
        }

        fn material() -> Material {
            let dir = tempfile::tempdir().unwrap();
            let ca = authority("etherdwarf test CA");
            let other_ca = authority("unrelated CA");
            let ca_file = write(dir.path(), "ca.pem", &ca.serialize_pem().unwrap());
            let other_ca_file = write(dir.path(), "other-ca.pem", &other_ca.serialize_pem().unwrap());

            let (cert, key) = issue(&ca, "listener", ExtendedKeyUsagePurpose::ServerAuth);
            let listener = TlsConfig {
                enabled: true,
                ca_file: Some(ca_file.clone()),
                cert_file: Some(write(dir.path(), "listener.pem", &cert)),
                key_file: Some(write(dir.path(), "listener.key", &key)),
                server_name: None,
            };

            let (cert, key) = issue(&ca, "dialer", ExtendedKeyUsagePurpose::ClientAuth);
            let dialer = TlsConfig {
                enabled: true,
                ca_file: Some(ca_file.clone()),
                cert_file: Some(write(dir.path(), "dialer.pem", &cert)),
                key_file: Some(write(dir.path(), "dialer.key", &key)),
                server_name: Some("localhost".into()),
            };
            let anonymous = TlsConfig {
                enabled: true,
                ca_file: Some(ca_file),
                cert_file: None,
                key_file: None,
                server_name: None,
            };
            let stranger = TlsConfig {
                ca_file: Some(other_ca_file),
                ..dialer.clone()
            };

            Material { _dir: dir, listener, dialer, anonymous, stranger }
        }

        fn authenticator(peers: &str) -> Authenticator {
            Authenticator::new(Arc::new(PeerRegistry::load(peers).unwrap()))
        }

        #[tokio::test]
        async fn test_tls_peers_authenticate_over_verified_channel() {
            let material = material();
            let server = ChannelFactory::from_config(&material.listener, Mode::Listen).unwrap();
            let client = ChannelFactory::from_config(&material.dialer, Mode::Dial).unwrap();
            assert_eq!(server.scheme(), "tls");
            assert_eq!(client.scheme(), "tls");

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let accepted = tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                let channel = server.accept(stream).await?;
                let mut transport = Framed::new(channel, TunnelCodec);
                authenticator(PEERS_A).authenticate(&mut transport).await
            });

            let stream = TcpStream::connect(addr).await.unwrap();
            let channel = client.connect(stream, "127.0.0.1").await.unwrap();
            let mut transport = Framed::new(channel, TunnelCodec);
            let listener_peer = authenticator(PEERS_B).authenticate(&mut transport).await.unwrap();
            let dialer_peer = accepted.await.unwrap().unwrap();

            assert_eq!(listener_peer.address, Ipv4Addr::new(10, 0, 0, 1));
            assert_eq!(dialer_peer.address, Ipv4Addr::new(10, 0, 0, 2));
        }

        #[tokio::test]
        async fn test_tls_listener_requires_client_certificate() {
            let material = material();
            let server = ChannelFactory::from_config(&material.listener, Mode::Listen).unwrap();
            let client = ChannelFactory::from_config(&material.anonymous, Mode::Dial).unwrap();

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let accepted = tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                server.accept(stream).await.map(|_| ())
            });

            let stream = TcpStream::connect(addr).await.unwrap();
            let _client = client.connect(stream, "127.0.0.1").await;
            let result = tokio::time::timeout(std::time::Duration::from_secs(10), accepted)
                .await
                .unwrap()
                .unwrap();

            match result {
                Err(Error::Tls(detail)) => assert!(detail.starts_with("TLS Error - ["), "{}", detail),
                other => panic!("expected a TLS error, got {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_tls_dialer_rejects_listener_from_unknown_authority() {
            let material = material();
            let server = ChannelFactory::from_config(&material.listener, Mode::Listen).unwrap();
            let client = ChannelFactory::from_config(&material.stranger, Mode::Dial).unwrap();

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let accepted = tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                server.accept(stream).await.map(|_| ())
            });

            let stream = TcpStream::connect(addr).await.unwrap();
            match client.connect(stream, "127.0.0.1").await {
                Err(Error::Tls(detail)) => assert!(detail.starts_with("TLS Error - ["), "{}", detail),
                Err(other) => panic!("expected a TLS error, got {}", other),
                Ok(_) => panic!("handshake with an untrusted listener succeeded"),
            }
            assert!(accepted.await.unwrap().is_err());
        }
    }
}
