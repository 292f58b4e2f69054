use std::borrow::Cow;
use std::io;
use std::time::Duration;

use tokio_native_tls::TlsConnector;

mod conn;
mod fcgi;
mod pool;

pub(crate) use conn::{Connector, Exchange};
pub(crate) use pool::ClientPool;

/// The wire protocol used to reach the target.
///
/// This is the closed set of client transports the generator can drive;
/// each variant yields a connector bound to the target in one step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    /// HTTP/1.1 cleartext.
    Http1,
    /// HTTP/1.1 over TLS.
    Http1Tls,
    /// HTTP/2 cleartext, prior knowledge.
    Http2,
    /// HTTP/2 over TLS, ALPN `h2`.
    Http2Tls,
    /// FastCGI responder role over TCP.
    Fcgi,
}

impl Transport {
    /// The URL scheme requests against this transport carry.
    pub fn scheme(&self) -> &'static str {
        match self {
            Transport::Http1 | Transport::Http2 | Transport::Fcgi => "http",
            Transport::Http1Tls | Transport::Http2Tls => "https",
        }
    }

    pub fn uses_tls(&self) -> bool {
        matches!(self, Transport::Http1Tls | Transport::Http2Tls)
    }

    pub(crate) fn is_http2(&self) -> bool {
        matches!(self, Transport::Http2 | Transport::Http2Tls)
    }

    /// Browser-like per-destination connection budget: seven pipelined
    /// HTTP/1 connections, one multiplexed HTTP/2 connection. FastCGI
    /// mirrors HTTP/1.
    pub fn connections_per_destination(&self) -> usize {
        match self {
            Transport::Http1 | Transport::Http1Tls | Transport::Fcgi => 7,
            Transport::Http2 | Transport::Http2Tls => 1,
        }
    }

    /// Build the TLS side of this transport, ALPN included.
    ///
    /// Certificates are deliberately not verified: the generator targets
    /// test rigs with self-signed material.
    pub(crate) fn tls_connector(&self) -> Result<Option<TlsConnector>, StartError> {
        if !self.uses_tls() {
            return Ok(None);
        }

        let mut builder = native_tls::TlsConnector::builder();
        builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);

        match self {
            Transport::Http1Tls => {
                builder.request_alpns(&["http/1.1"]);
            }
            Transport::Http2Tls => {
                builder.request_alpns(&["h2"]);
            }
            Transport::Http1 | Transport::Http2 | Transport::Fcgi => {}
        }

        let config = builder.build().map_err(StartError::Tls)?;
        Ok(Some(TlsConnector::from(config)))
    }
}

/// The client could not be brought up at all. Fatal to the run.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("failed to resolve the target address: {0}")]
    AddressLookup(io::Error),
    #[error("the target host is not a valid header value")]
    InvalidHost,
    #[error("failed to build the TLS configuration: {0}")]
    Tls(native_tls::Error),
    #[error("failed to connect to the target: {0}")]
    Connect(io::Error),
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(native_tls::Error),
    #[error("HTTP handshake failed: {0}")]
    Handshake(hyper::Error),
    #[error("the target did not accept a connection within {0:?}")]
    Timeout(Duration),
}

/// A single request failed. Counted and reported, never fatal to the run.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("transport error: {0}")]
    Transport(#[from] hyper::Error),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] http::Error),
    #[error("failed to re-establish a pooled connection: {0}")]
    Reconnect(#[from] StartError),
    #[error("malformed FastCGI response: {0}")]
    Fcgi(Cow<'static, str>),
    #[error("the connection pool is shut down")]
    Closed,
    #[error("HTTP status {0} reported as failure")]
    HttpStatus(u16),
}
