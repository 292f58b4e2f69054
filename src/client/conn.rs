use std::io;
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs};

use exponential_backoff::Backoff;
use http::response::Parts;
use http::uri::PathAndQuery;
use http::{header, HeaderValue, Request, Uri};
use hyper::body::Bytes;
use hyper::client::conn;
use hyper::client::conn::SendRequest;
use hyper::Body;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Duration, Instant};
use tokio_native_tls::TlsConnector;

use crate::client::fcgi::FcgiConnection;
use crate::client::{RequestError, StartError, Transport};
use crate::utils::monotonic_nanos;

/// The maximum number of connect attempts before giving up.
const RETRY_MAX_DEFAULT: u32 = 3;
const RETRY_MIN_PAUSE: Duration = Duration::from_millis(100);
const RETRY_MAX_PAUSE: Duration = Duration::from_secs(2);

#[derive(Clone)]
enum Scheme {
    Cleartext,
    Tls(TlsConnector),
}

/// Produces ready-to-use connections to one target, the transport and the
/// protocol wrapper built together.
#[derive(Clone)]
pub(crate) struct Connector {
    transport: Transport,
    scheme: Scheme,
    addr: SocketAddr,
    host: String,
    port: u16,
    host_header: HeaderValue,
    connect_timeout: Duration,
}

impl Connector {
    /// Resolve the target and prepare the transport. IPv4 records win when
    /// the host resolves to both families.
    pub(crate) fn new(
        transport: Transport,
        host: &str,
        port: u16,
        connect_timeout: Duration,
    ) -> Result<Self, StartError> {
        let scheme = match transport.tls_connector()? {
            Some(tls) => Scheme::Tls(tls),
            None => Scheme::Cleartext,
        };

        let addr_iter = (host, port)
            .to_socket_addrs()
            .map_err(StartError::AddressLookup)?;
        let mut selected = None;
        for addr in addr_iter {
            selected = Some(addr);
            if addr.is_ipv4() {
                break;
            }
        }
        let addr = selected.ok_or_else(|| {
            StartError::AddressLookup(io::Error::new(
                ErrorKind::Other,
                "no address records for host",
            ))
        })?;

        let host_header =
            HeaderValue::from_str(host).map_err(|_| StartError::InvalidHost)?;

        Ok(Self {
            transport,
            scheme,
            addr,
            host: host.to_string(),
            port,
            host_header,
            connect_timeout,
        })
    }

    /// Establish a connection within the configured timeout, retrying
    /// transient failures with exponential backoff.
    pub(crate) async fn connect_timeout(&self) -> Result<Connection, StartError> {
        let deadline = Instant::now() + self.connect_timeout;
        let backoff = Backoff::new(RETRY_MAX_DEFAULT, RETRY_MIN_PAUSE, RETRY_MAX_PAUSE);
        let mut last_error = None;

        for pause in &backoff {
            match timeout_at(deadline, self.connect()).await {
                Err(_) => break,
                Ok(Ok(connection)) => return Ok(connection),
                Ok(Err(e)) => {
                    last_error = Some(e);
                    if timeout_at(deadline, tokio::time::sleep(pause)).await.is_err() {
                        break;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(StartError::Timeout(self.connect_timeout)))
    }

    async fn connect(&self) -> Result<Connection, StartError> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(StartError::Connect)?;

        if self.transport == Transport::Fcgi {
            let conn = FcgiConnection::new(stream, self.host.clone(), self.port);
            return Ok(Connection::Fcgi(conn));
        }

        let mut conn_builder = conn::Builder::new();
        if self.transport.is_http2() {
            conn_builder.http2_only(true);
        }

        match &self.scheme {
            Scheme::Cleartext => self.handshake(conn_builder, stream).await,
            Scheme::Tls(tls) => {
                let stream = tls
                    .connect(&self.host, stream)
                    .await
                    .map_err(StartError::TlsHandshake)?;
                self.handshake(conn_builder, stream).await
            }
        }
    }

    async fn handshake<S>(
        &self,
        conn_builder: conn::Builder,
        stream: S,
    ) -> Result<Connection, StartError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, connection) = conn_builder
            .handshake(stream)
            .await
            .map_err(StartError::Handshake)?;
        let task = tokio::spawn(connection);
        Ok(Connection::Http(HttpStream {
            sender,
            task,
            http2: self.transport.is_http2(),
            host_header: self.host_header.clone(),
        }))
    }
}

/// One established connection to the target.
pub(crate) enum Connection {
    Http(HttpStream),
    Fcgi(FcgiConnection),
}

impl Connection {
    /// Issue `request` and resolve once the response head has arrived.
    /// The returned [`Exchange`] drains the rest of the payload.
    pub(crate) async fn send(
        &mut self,
        request: &Request<Bytes>,
    ) -> Result<Exchange, RequestError> {
        match self {
            Connection::Http(stream) => stream.send(request).await,
            Connection::Fcgi(conn) => conn.send(request).await,
        }
    }
}

/// An established hyper connection plus the task driving its I/O.
pub(crate) struct HttpStream {
    sender: SendRequest<Body>,
    task: JoinHandle<hyper::Result<()>>,
    http2: bool,
    host_header: HeaderValue,
}

impl HttpStream {
    async fn send(&mut self, request: &Request<Bytes>) -> Result<Exchange, RequestError> {
        let wire = self.wire_request(request)?;
        let response = self.sender.send_request(wire).await?;
        let response_begin_nanos = monotonic_nanos();
        let (parts, body) = response.into_parts();
        Ok(Exchange {
            parts,
            response_begin_nanos,
            body: ResponseBody::Streaming(body),
        })
    }

    /// Rebuild the request for the wire: origin-form URI and an explicit
    /// host header for HTTP/1, absolute-form for HTTP/2 pseudo-headers.
    fn wire_request(&self, request: &Request<Bytes>) -> Result<Request<Body>, RequestError> {
        let uri = if self.http2 {
            request.uri().clone()
        } else {
            let path = request
                .uri()
                .path_and_query()
                .cloned()
                .unwrap_or_else(|| PathAndQuery::from_static("/"));
            Uri::builder().path_and_query(path).build()?
        };

        let mut wire = Request::builder()
            .method(request.method().clone())
            .uri(uri)
            .body(Body::from(request.body().clone()))?;
        *wire.headers_mut() = request.headers().clone();
        if !self.http2 {
            wire.headers_mut()
                .insert(header::HOST, self.host_header.clone());
        }
        Ok(wire)
    }
}

impl Drop for HttpStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A response whose head has arrived and whose payload is still in flight.
pub(crate) struct Exchange {
    pub(crate) parts: Parts,
    pub(crate) response_begin_nanos: u64,
    pub(crate) body: ResponseBody,
}

pub(crate) enum ResponseBody {
    Streaming(Body),
    Ready(Bytes),
}

impl ResponseBody {
    /// Consume the payload to its end, returning the number of body bytes.
    pub(crate) async fn drain(self) -> Result<u64, RequestError> {
        match self {
            ResponseBody::Streaming(body) => {
                let bytes = hyper::body::to_bytes(body).await?;
                Ok(bytes.len() as u64)
            }
            ResponseBody::Ready(bytes) => Ok(bytes.len() as u64),
        }
    }
}
