use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig as RustlsConfig;
use pgwire::tokio::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::config::ServerConfig;

/// Build the acceptor for `FLEETSLOT_TLS_CERT` / `FLEETSLOT_TLS_KEY`.
/// Returns `None` when neither is configured; plaintext connections only.
pub fn load_tls_acceptor(config: &ServerConfig) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (config.tls_cert.as_deref(), config.tls_key.as_deref()) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both FLEETSLOT_TLS_CERT and FLEETSLOT_TLS_KEY must be set, or neither",
            ));
        }
    };

    let certs = read_certs(cert_path)?;
    if certs.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("no certificates found in {cert_path}"),
        ));
    }
    let key = read_key(key_path)?;

    let mut tls = RustlsConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    tls.alpn_protocols = vec![b"postgresql".to_vec()];

    tracing::info!("tls enabled with certificate {cert_path}");
    Ok(Some(TlsAcceptor::from(Arc::new(tls))))
}

fn read_certs(path: &str) -> io::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::certs(&mut reader).collect()
}

fn read_key(path: &str) -> io::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
        io::Error::new(ErrorKind::InvalidInput, format!("no private key found in {path}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(cert: Option<&str>, key: Option<&str>) -> ServerConfig {
        let mut cfg = ServerConfig::from_lookup(|_| None);
        cfg.tls_cert = cert.map(String::from);
        cfg.tls_key = key.map(String::from);
        cfg
    }

    fn load_err(cfg: ServerConfig) -> io::Error {
        match load_tls_acceptor(&cfg) {
            Ok(_) => panic!("expected tls setup to fail"),
            Err(e) => e,
        }
    }

    #[test]
    fn plaintext_when_unconfigured() {
        let acceptor = load_tls_acceptor(&config_with(None, None)).unwrap();
        assert!(acceptor.is_none());
    }

    #[test]
    fn half_configured_is_rejected() {
        let err = load_err(config_with(Some("cert.pem"), None));
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        let err = load_err(config_with(None, Some("key.pem")));
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn missing_files_surface_io_errors() {
        let dir = std::env::temp_dir().join(format!("fleetslot_tls_{}", ulid::Ulid::new()));
        let cert = dir.join("cert.pem");
        let key = dir.join("key.pem");
        let err = load_err(config_with(cert.to_str(), key.to_str()));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn empty_cert_file_is_rejected() {
        let dir = std::env::temp_dir().join(format!("fleetslot_tls_{}", ulid::Ulid::new()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("cert.pem");
        let key = dir.join("key.pem");
        std::fs::write(&cert, "").unwrap();
        std::fs::write(&key, "").unwrap();
        let err = load_err(config_with(cert.to_str(), key.to_str()));
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        std::fs::remove_dir_all(&dir).ok();
    }
}
