//! TLS transport factory for reconnecting framed RPC connections.
//!
//! Each dial opens a TCP stream, performs a TLS client handshake against
//! either the supplied root certificates or the bundled web PKI roots, and
//! hands the encrypted stream to a [`Transport`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::{Error, Result};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use proven_framed_rpc::connection::transport::DEFAULT_KEEP_ALIVE;
use proven_framed_rpc::{
    CancellationToken, ConnectionTransport, Transport, TransportConfig, TransportStage, dial_tcp,
};
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

/// Options for [`TlsConnectionTransport`].
#[derive(Debug, Clone)]
pub struct TlsOptions {
    /// `host:port` to dial. The host is also the TLS server name.
    pub address: String,
    /// PEM bundle of trusted roots; `None` uses the web PKI roots.
    pub root_certs_pem: Option<Vec<u8>>,
    /// TCP keep-alive interval; `None` leaves the OS default.
    pub keep_alive: Option<Duration>,
    /// Bound on the TCP connect phase of a dial.
    pub dial_timeout: Option<Duration>,
    /// Configuration for dialed transports.
    pub transport_config: TransportConfig,
}

impl TlsOptions {
    /// Options for `address` with web PKI roots.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            root_certs_pem: None,
            keep_alive: Some(DEFAULT_KEEP_ALIVE),
            dial_timeout: None,
            transport_config: TransportConfig::default(),
        }
    }

    /// Trust only the certificates in `pem`.
    #[must_use]
    pub fn with_root_certs_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.root_certs_pem = Some(pem.into());
        self
    }

    /// Set the TCP keep-alive interval.
    #[must_use]
    pub const fn with_keep_alive(mut self, keep_alive: Option<Duration>) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Bound the TCP connect phase.
    #[must_use]
    pub const fn with_dial_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Set the configuration for dialed transports.
    #[must_use]
    pub fn with_transport_config(mut self, config: TransportConfig) -> Self {
        self.transport_config = config;
        self
    }
}

/// Dials TLS-wrapped TCP transports.
pub struct TlsConnectionTransport {
    address: String,
    server_name: ServerName<'static>,
    connector: TlsConnector,
    keep_alive: Option<Duration>,
    dial_timeout: Option<Duration>,
    transport_config: TransportConfig,
    stage: TransportStage,
}

impl std::fmt::Debug for TlsConnectionTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnectionTransport")
            .field("address", &self.address)
            .field("server_name", &self.server_name)
            .field("keep_alive", &self.keep_alive)
            .field("dial_timeout", &self.dial_timeout)
            .field("transport_config", &self.transport_config)
            .finish_non_exhaustive()
    }
}

impl TlsConnectionTransport {
    /// Build a factory from `options`.
    ///
    /// # Errors
    ///
    /// Returns an error if the address has no host, the host is not a valid
    /// server name, or the root certificates cannot be loaded.
    pub fn new(options: TlsOptions) -> Result<Self> {
        let host = host_of(&options.address)?;
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| Error::InvalidServerName(format!("{host}: {e}")))?;

        let roots = match &options.root_certs_pem {
            Some(pem) => parse_root_certs(pem)?,
            None => RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            },
        };
        Ok(Self::with_client_config(
            options,
            server_name,
            Arc::new(client_config(roots)?),
        ))
    }

    /// Build a factory from a prepared rustls configuration.
    #[must_use]
    pub fn with_client_config(
        options: TlsOptions,
        server_name: ServerName<'static>,
        config: Arc<ClientConfig>,
    ) -> Self {
        Self {
            address: options.address,
            server_name,
            connector: TlsConnector::from(config),
            keep_alive: options.keep_alive,
            dial_timeout: options.dial_timeout,
            transport_config: options.transport_config,
            stage: TransportStage::new(),
        }
    }
}

#[async_trait]
impl ConnectionTransport for TlsConnectionTransport {
    async fn dial(&self, ctx: &CancellationToken) -> proven_framed_rpc::Result<Transport> {
        debug!(address = %self.address, "Dialing TLS");
        let stream = dial_tcp(ctx, &self.address, self.dial_timeout, self.keep_alive).await?;

        let tls = tokio::select! {
            biased;
            () = ctx.cancelled() => return Err(proven_framed_rpc::Error::Canceled),
            tls = self.connector.connect(self.server_name.clone(), stream) => tls.map_err(|e| {
                let address = &self.address;
                proven_framed_rpc::Error::Dial(format!("TLS handshake with {address} failed: {e}"))
            })?,
        };
        info!(address = %self.address, "TLS connection established");

        let transport = Transport::new(tls, self.transport_config.clone());
        self.stage.stage(transport.clone());
        Ok(transport)
    }

    fn is_connected(&self) -> bool {
        self.stage.is_connected()
    }

    fn finalize(&self) {
        self.stage.finalize();
    }

    fn close(&self) {
        self.stage.close();
    }
}

/// The host part of `host:port`, without IPv6 brackets.
fn host_of(address: &str) -> Result<&str> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidAddress(address.to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(Error::InvalidAddress(address.to_string()));
    }
    Ok(host)
}

fn parse_root_certs(pem: &[u8]) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    let mut reader = pem;
    for cert in rustls_pemfile::certs(&mut reader) {
        roots.add(cert?)?;
    }
    if roots.is_empty() {
        return Err(Error::NoCertificates);
    }
    Ok(roots)
}

fn client_config(roots: RootCertStore) -> Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    Ok(ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("example.com:443").unwrap(), "example.com");
        assert_eq!(host_of("[::1]:8443").unwrap(), "::1");
        assert_matches!(host_of("example.com"), Err(Error::InvalidAddress(_)));
        assert_matches!(host_of(":443"), Err(Error::InvalidAddress(_)));
        assert_matches!(host_of("example.com:https"), Err(Error::InvalidAddress(_)));
    }

    #[test]
    fn test_pem_without_certificates() {
        assert_matches!(parse_root_certs(b"not a pem bundle"), Err(Error::NoCertificates));
    }
}
