//! TLS acceptor for inbound links and connector for outbound links.

use crate::config::{ClientTlsConfig, TlsConfig};
use crate::error::ServerError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Loads the server certificate and key and builds an acceptor.
pub fn create_tls_acceptor(config: &TlsConfig) -> Result<TlsAcceptor, ServerError> {
    let cert_path = config
        .cert_path
        .as_ref()
        .ok_or_else(|| ServerError::TlsConfig("cert_path not set".into()))?;
    let key_path = config
        .key_path
        .as_ref()
        .ok_or_else(|| ServerError::TlsConfig("key_path not set".into()))?;

    let client_ca_path = match (config.require_client_cert, config.client_ca_path.as_ref()) {
        (true, None) => {
            return Err(ServerError::TlsConfig(
                "client_ca_path not set for mTLS".into(),
            ))
        }
        (true, Some(path)) => Some(path),
        (false, _) => None,
    };

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let server_config = match client_ca_path {
        Some(ca_path) => {
            let root_store = load_root_store(ca_path)?;
            let client_verifier = WebPkiClientVerifier::builder(Arc::new(root_store))
                .build()
                .map_err(|e| {
                    ServerError::TlsConfig(format!("failed to build client verifier: {}", e))
                })?;

            rustls::ServerConfig::builder()
                .with_client_cert_verifier(client_verifier)
                .with_single_cert(certs, key)
                .map_err(|e| ServerError::TlsConfig(format!("invalid server cert/key: {}", e)))?
        }
        None => rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ServerError::TlsConfig(format!("invalid server cert/key: {}", e)))?,
    };

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Builds the connector used for outbound sensor links.
pub fn create_tls_connector(config: &ClientTlsConfig) -> Result<TlsConnector, ServerError> {
    let client_config = if config.insecure {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth()
    } else {
        let root_store = match config.ca_path {
            Some(ref ca_path) => load_root_store(ca_path)?,
            None => {
                let mut store = RootCertStore::empty();
                store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                store
            }
        };
        let builder = rustls::ClientConfig::builder().with_root_certificates(root_store);

        match (&config.cert_path, &config.key_path) {
            (Some(cert_path), Some(key_path)) => {
                let certs = load_certs(cert_path)?;
                let key = load_private_key(key_path)?;
                builder.with_client_auth_cert(certs, key).map_err(|e| {
                    ServerError::TlsConfig(format!("invalid client cert/key: {}", e))
                })?
            }
            _ => builder.with_no_client_auth(),
        }
    };

    Ok(TlsConnector::from(Arc::new(client_config)))
}

/// Name presented to the peer: the configured override, else the host.
pub fn server_name(config: &ClientTlsConfig, host: &str) -> Result<ServerName<'static>, ServerError> {
    let name = config.server_name.as_deref().unwrap_or(host);
    ServerName::try_from(name.to_string())
        .map_err(|_| ServerError::TlsConfig(format!("invalid server name: {}", name)))
}

/// Skips certificate verification. Sensor nodes ship self-signed
/// certificates that no root store can vouch for.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

fn load_root_store(path: &Path) -> Result<RootCertStore, ServerError> {
    let mut store = RootCertStore::empty();
    for cert in load_certs(path)? {
        store
            .add(cert)
            .map_err(|e| ServerError::TlsConfig(format!("invalid CA cert {:?}: {}", path, e)))?;
    }
    Ok(store)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let file = File::open(path)
        .map_err(|e| ServerError::TlsConfig(format!("cannot open cert file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::TlsConfig(format!("invalid cert file {:?}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(ServerError::TlsConfig(format!(
            "no certificates found in {:?}",
            path
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let file = File::open(path)
        .map_err(|e| ServerError::TlsConfig(format!("cannot open key file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| ServerError::TlsConfig(format!("invalid key file {:?}: {}", path, e)))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => {
                return Err(ServerError::TlsConfig(format!(
                    "no private key found in {:?}",
                    path
                )))
            }
            _ => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_missing_cert_file() {
        let err = load_certs(Path::new("/nonexistent/cert.pem")).unwrap_err();
        assert!(err.to_string().contains("cannot open"));
    }

    #[test]
    fn test_cert_file_without_certs() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"just text\n").unwrap();
        let err = load_certs(file.path()).unwrap_err();
        assert!(err.to_string().contains("no certificates"));
    }

    #[test]
    fn test_key_file_without_key() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"not a valid key").unwrap();
        let err = load_private_key(file.path()).unwrap_err();
        assert!(err.to_string().contains("no private key"));
    }

    #[test]
    fn test_acceptor_requires_paths() {
        let config = TlsConfig {
            cert_path: None,
            ..TlsConfig::default()
        };
        let err = create_tls_acceptor(&config).err().unwrap();
        assert!(err.to_string().contains("cert_path not set"));

        let config = TlsConfig {
            key_path: None,
            ..TlsConfig::default()
        };
        let err = create_tls_acceptor(&config).err().unwrap();
        assert!(err.to_string().contains("key_path not set"));
    }

    #[test]
    fn test_acceptor_mtls_checked_before_loading() {
        let config = TlsConfig {
            cert_path: Some("/nonexistent/cert.pem".into()),
            key_path: Some("/nonexistent/key.pem".into()),
            require_client_cert: true,
            client_ca_path: None,
            ..TlsConfig::default()
        };
        let err = create_tls_acceptor(&config).err().unwrap();
        assert!(err.to_string().contains("client_ca_path not set"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_connector_builds() {
        assert!(create_tls_connector(&ClientTlsConfig::default()).is_ok());

        let verified = ClientTlsConfig {
            insecure: false,
            ..ClientTlsConfig::default()
        };
        assert!(create_tls_connector(&verified).is_ok());

        let bad_ca = ClientTlsConfig {
            insecure: false,
            ca_path: Some("/nonexistent/ca.pem".into()),
            ..ClientTlsConfig::default()
        };
        assert!(create_tls_connector(&bad_ca).is_err());
    }

    #[test]
    fn test_server_name() {
        let config = ClientTlsConfig::default();
        assert!(matches!(
            server_name(&config, "127.0.0.1").unwrap(),
            ServerName::IpAddress(_)
        ));

        let config = ClientTlsConfig {
            server_name: Some("sensor.local".into()),
            ..ClientTlsConfig::default()
        };
        assert!(matches!(
            server_name(&config, "127.0.0.1").unwrap(),
            ServerName::DnsName(_)
        ));
    }
}
