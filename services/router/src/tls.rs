//! TLS material for listeners and inner hops.
//!
//! Listeners terminate TLS with a certificate issued for the endpoint host by a
//! [`CertificateIssuer`]. The inner hop to rack workloads uses a connector that
//! accepts any server certificate; the outer hop already authenticated the
//! router to the client. Direct upstreams are verified against public roots.

use std::sync::Arc;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use tokio_rustls::TlsConnector;
use tracing::info;

use crate::error::{Result, RouterError};

/// ALPN offered by `https` listeners.
pub const ALPN_HTTPS: &[&[u8]] = &[b"h2", b"http/1.1"];

/// ALPN offered by `tls` listeners.
pub const ALPN_NONE: &[&[u8]] = &[];

/// A certificate chain and its private key.
#[derive(Debug)]
pub struct IssuedCertificate {
    /// Leaf first.
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

/// Issues certificates for hostnames.
pub trait CertificateIssuer: Send + Sync {
    fn issue(&self, hostname: &str) -> Result<IssuedCertificate>;
}

/// An in-process certificate authority.
///
/// Generated at startup; signs a fresh leaf for every requested hostname.
pub struct LocalAuthority {
    ca: Certificate,
    ca_key: KeyPair,
}

impl LocalAuthority {
    pub fn generate(common_name: &str) -> Result<Self> {
        let failure = |e: rcgen::Error| RouterError::CertificateIssuanceFailure {
            host: common_name.to_string(),
            detail: e.to_string(),
        };

        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(failure)?;
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let ca_key = KeyPair::generate().map_err(failure)?;
        let ca = params.self_signed(&ca_key).map_err(failure)?;

        info!(common_name = %common_name, "Generated local certificate authority");

        Ok(Self { ca, ca_key })
    }

    /// DER of the CA certificate, for clients that want to trust it.
    pub fn ca_der(&self) -> CertificateDer<'static> {
        self.ca.der().clone()
    }
}

impl CertificateIssuer for LocalAuthority {
    fn issue(&self, hostname: &str) -> Result<IssuedCertificate> {
        let failure = |e: rcgen::Error| RouterError::CertificateIssuanceFailure {
            host: hostname.to_string(),
            detail: e.to_string(),
        };

        let mut params = CertificateParams::new(vec![hostname.to_string()]).map_err(failure)?;
        params.distinguished_name.push(DnType::CommonName, hostname);

        let key = KeyPair::generate().map_err(failure)?;
        let leaf = params
            .signed_by(&key, &self.ca, &self.ca_key)
            .map_err(failure)?;

        Ok(IssuedCertificate {
            chain: vec![leaf.der().clone(), self.ca.der().clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        })
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Build a listener TLS config for one certificate.
pub fn server_config(cert: &IssuedCertificate, alpn: &[&[u8]]) -> Result<Arc<ServerConfig>> {
    let tls_error = |e: rustls::Error| {
        RouterError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
    };

    let mut config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?
        .with_no_client_auth()
        .with_single_cert(cert.chain.clone(), cert.key.clone_key())
        .map_err(tls_error)?;
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

    Ok(Arc::new(config))
}

/// Build a connector that skips server verification. HTTP/1.1 only.
pub fn insecure_connector() -> Result<TlsConnector> {
    let provider = provider();
    let mut config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| RouterError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier(provider)))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Build a connector that verifies servers against `roots`. HTTP/1.1 only.
pub fn verifying_connector(roots: RootCertStore) -> Result<TlsConnector> {
    let mut config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| RouterError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsConnector::from(Arc::new(config)))
}

/// The Mozilla root set bundled by `webpki-roots`.
pub fn public_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

/// Server name presented on the inner hop.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string()).map_err(|e| {
        RouterError::HandshakeFailure(format!("invalid server name {}: {}", host, e))
    })
}

#[derive(Debug)]
struct NoVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::TlsAcceptor;

    #[test]
    fn test_issue_includes_ca_in_chain() {
        let authority = LocalAuthority::generate("rackgate test CA").unwrap();
        let cert = authority.issue("app.example.test").unwrap();

        assert_eq!(cert.chain.len(), 2);
        assert_eq!(cert.chain[1], authority.ca_der());
        assert_ne!(cert.chain[0], cert.chain[1]);
    }

    #[test]
    fn test_server_config_alpn() {
        let authority = LocalAuthority::generate("rackgate test CA").unwrap();
        let cert = authority.issue("localhost").unwrap();

        let https = server_config(&cert, ALPN_HTTPS).unwrap();
        assert_eq!(https.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);

        let tls = server_config(&cert, ALPN_NONE).unwrap();
        assert!(tls.alpn_protocols.is_empty());
    }

    /// Accept one TLS connection and echo four bytes.
    async fn spawn_tls_echo(cert: &IssuedCertificate) -> std::net::SocketAddr {
        let acceptor = TlsAcceptor::from(server_config(cert, ALPN_NONE).unwrap());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let Ok(mut tls) = acceptor.accept(stream).await else {
                return;
            };
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await.unwrap();
            tls.write_all(&buf).await.unwrap();
            tls.flush().await.unwrap();
        });

        addr
    }

    #[tokio::test]
    async fn test_verifying_connector_checks_roots() {
        let authority = LocalAuthority::generate("rackgate test CA").unwrap();
        let cert = authority.issue("localhost").unwrap();

        let addr = spawn_tls_echo(&cert).await;
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let rejected = verifying_connector(public_roots())
            .unwrap()
            .connect(server_name("localhost").unwrap(), stream)
            .await;
        assert!(rejected.is_err());

        let mut roots = RootCertStore::empty();
        roots.add(authority.ca_der()).unwrap();
        let addr = spawn_tls_echo(&cert).await;
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut tls = verifying_connector(roots)
            .unwrap()
            .connect(server_name("localhost").unwrap(), stream)
            .await
            .unwrap();

        tls.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tls.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_insecure_connector_accepts_untrusted_certificate() {
        let authority = LocalAuthority::generate("rackgate test CA").unwrap();
        let cert = authority.issue("localhost").unwrap();
        let acceptor = TlsAcceptor::from(server_config(&cert, ALPN_NONE).unwrap());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut tls = acceptor.accept(stream).await.unwrap();
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await.unwrap();
            tls.write_all(&buf).await.unwrap();
            tls.flush().await.unwrap();
        });

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut tls = insecure_connector()
            .unwrap()
            .connect(server_name("rack").unwrap(), stream)
            .await
            .unwrap();

        tls.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tls.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
