use thiserror::Error;

/// Errors building a TLS transport factory.
#[derive(Debug, Error)]
pub enum Error {
    /// The address is not `host:port`.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The host cannot be used as a TLS server name.
    #[error("invalid server name: {0}")]
    InvalidServerName(String),

    /// The root certificate PEM could not be read.
    #[error("failed to parse root certificates: {0}")]
    Pem(#[from] std::io::Error),

    /// The root certificate PEM contained no certificates.
    #[error("no certificates found in root certificate PEM")]
    NoCertificates,

    /// rustls rejected a certificate or the configuration.
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
