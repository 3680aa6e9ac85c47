//! Single-node Redis client wrapper using the fred crate.
//!
//! The operator only ever talks to one replica at a time, over a short-lived
//! connection, to ask it for its replication state. The connection task is
//! owned by [`RedisClient`] and aborted when the client is closed or
//! dropped, so a cancelled or failed probe never leaves a socket behind.

use std::sync::Arc;
use std::time::Duration;

use fred::prelude::*;
use fred::types::InfoKind;
use rustls::pki_types::CertificateDer;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

use super::parsing::ReplicationInfo;
use super::types::ParseError;

/// Errors that can occur during Redis operations.
#[derive(Error, Debug)]
pub enum RedisError {
    #[error("Redis error: {0}")]
    Redis(#[from] fred::error::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Timeout after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    #[error("Invalid TLS material: {0}")]
    Tls(String),
}

/// TLS material loaded from a Kubernetes secret.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsCertData {
    /// CA certificate in PEM format.
    pub ca_cert_pem: Vec<u8>,
    /// Client certificate in PEM format (optional, for mTLS).
    pub client_cert_pem: Option<Vec<u8>>,
    /// Client key in PEM format (optional, for mTLS).
    pub client_key_pem: Option<Vec<u8>>,
}

impl std::fmt::Debug for TlsCertData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsCertData")
            .field("ca_cert_pem", &format_args!("{} bytes", self.ca_cert_pem.len()))
            .field("client_cert", &self.client_cert_pem.is_some())
            .field("client_key", &self.client_key_pem.is_some())
            .finish()
    }
}

/// Redis client bound to a single node.
pub struct RedisClient {
    client: Client,
    connection: JoinHandle<Result<(), fred::error::Error>>,
    timeout: Duration,
}

impl RedisClient {
    /// Connect to a single (non-clustered) node.
    ///
    /// # Arguments
    /// * `host` - IP or hostname, without brackets for IPv6
    /// * `port` - Port number
    /// * `password` - Optional password for AUTH
    /// * `tls_certs` - Optional TLS certificate data
    /// * `timeout` - Bound for connecting, for each command and for closing
    #[instrument(skip_all, fields(host = %host, port = %port, tls = tls_certs.is_some()))]
    pub async fn connect_single(
        host: &str,
        port: u16,
        password: Option<&str>,
        tls_certs: Option<&TlsCertData>,
        timeout: Duration,
    ) -> Result<Self, RedisError> {
        let mut redis_config = Config {
            server: ServerConfig::Centralized {
                server: Server::new(host, port),
            },
            ..Default::default()
        };

        if let Some(pass) = password {
            redis_config.password = Some(pass.to_string());
        }

        if let Some(certs) = tls_certs {
            let tls_connector = build_tls_connector(certs)?;
            redis_config.tls = Some(tls_connector.into());
        }

        let client = Builder::from_config(redis_config)
            .with_performance_config(|perf| {
                perf.default_command_timeout = timeout;
            })
            .with_connection_config(|conn| {
                conn.connection_timeout = timeout;
            })
            .build()?;

        // Owned from here on: any early return or cancellation drops it.
        let connection = client.connect();
        let redis = Self {
            client,
            connection,
            timeout,
        };

        match tokio::time::timeout(timeout, redis.client.wait_for_connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(RedisError::Timeout {
                    operation: format!("connect {host}:{port}"),
                    duration: timeout,
                });
            }
        }
        debug!("Connected to Redis node");

        Ok(redis)
    }

    /// Run `INFO replication` and parse the reply.
    #[instrument(skip(self))]
    pub async fn info_replication(&self) -> Result<ReplicationInfo, RedisError> {
        let response: String = self.client.info(Some(InfoKind::Replication)).await?;
        Ok(ReplicationInfo::parse(&response)?)
    }

    /// Send `QUIT` within the timeout, then tear the connection down.
    pub async fn close(self) {
        match tokio::time::timeout(self.timeout, self.client.quit()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "QUIT failed"),
            Err(_) => debug!(timeout = ?self.timeout, "QUIT timed out"),
        }
    }
}

impl Drop for RedisClient {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

/// Build a TLS connector from certificate data.
///
/// The certificate chain is verified against the secret's CA. Replicas are
/// dialled by pod IP, which certificates rarely list, so a name mismatch on
/// an otherwise valid chain is accepted.
fn build_tls_connector(certs: &TlsCertData) -> Result<TlsConnector, RedisError> {
    use rustls::client::WebPkiServerVerifier;
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{ServerName, UnixTime};
    use rustls::{
        CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    };

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

    let mut root_store = RootCertStore::empty();
    let ca_certs = rustls_pemfile::certs(&mut certs.ca_cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RedisError::Tls(format!("Failed to parse CA certificate: {}", e)))?;

    for cert in ca_certs {
        root_store
            .add(cert)
            .map_err(|e| RedisError::Tls(format!("Failed to add CA certificate: {}", e)))?;
    }

    let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(root_store), provider.clone())
        .build()
        .map_err(|e| RedisError::Tls(format!("Failed to build verifier: {}", e)))?;

    #[derive(Debug)]
    struct PodAddressVerifier {
        inner: Arc<WebPkiServerVerifier>,
    }

    impl ServerCertVerifier for PodAddressVerifier {
        fn verify_server_cert(
            &self,
            end_entity: &CertificateDer<'_>,
            intermediates: &[CertificateDer<'_>],
            server_name: &ServerName<'_>,
            ocsp_response: &[u8],
            now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            match self.inner.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                ocsp_response,
                now,
            ) {
                Err(rustls::Error::InvalidCertificate(
                    CertificateError::NotValidForName
                    | CertificateError::NotValidForNameContext { .. },
                )) => Ok(ServerCertVerified::assertion()),
                other => other,
            }
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            self.inner.verify_tls12_signature(message, cert, dss)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            self.inner.verify_tls13_signature(message, cert, dss)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.inner.supported_verify_schemes()
        }
    }

    let verifier = Arc::new(PodAddressVerifier { inner });

    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| RedisError::Tls(format!("Failed to select TLS versions: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(verifier);

    let config = if let (Some(cert_pem), Some(key_pem)) =
        (&certs.client_cert_pem, &certs.client_key_pem)
    {
        let client_certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
            .collect::<Result<Vec<CertificateDer<'static>>, _>>()
            .map_err(|e| RedisError::Tls(format!("Failed to parse client certificate: {}", e)))?;

        let client_key = rustls_pemfile::private_key(&mut key_pem.as_slice())
            .map_err(|e| RedisError::Tls(format!("Failed to parse client key: {}", e)))?
            .ok_or_else(|| RedisError::Tls("No private key found in PEM".to_string()))?;

        builder
            .with_client_auth_cert(client_certs, client_key)
            .map_err(|e| RedisError::Tls(format!("Failed to build TLS config: {}", e)))?
    } else {
        builder.with_no_client_auth()
    };

    Ok(TlsConnector::from(config))
}
