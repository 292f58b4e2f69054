use std::sync::Arc;

use futures_util::future::join_all;
use http::Request;
use hyper::body::Bytes;

use crate::client::conn::{Connection, Connector, Exchange};
use crate::client::{RequestError, StartError};

/// A fixed-size set of connections to the target, one lease per in-flight
/// request. A slot whose connection died is re-established on its next
/// lease rather than eagerly.
pub(crate) struct ClientPool {
    connector: Arc<Connector>,
    slots: flume::Receiver<Option<Connection>>,
    returns: flume::Sender<Option<Connection>>,
}

impl ClientPool {
    /// Connect `size` connections up front, in waves of `parallelism` so
    /// startup does not overwhelm the listener backlog.
    pub(crate) async fn connect(
        connector: Connector,
        size: usize,
        parallelism: usize,
    ) -> Result<Self, StartError> {
        let connector = Arc::new(connector);
        let (returns, slots) = flume::unbounded();

        let mut remaining = size.max(1);
        while remaining > 0 {
            let wave = remaining.min(parallelism.max(1));
            let connections =
                join_all((0..wave).map(|_| connector.connect_timeout())).await;
            for connection in connections {
                let _ = returns.send(Some(connection?));
            }
            remaining -= wave;
        }

        Ok(Self {
            connector,
            slots,
            returns,
        })
    }

    /// Borrow a connection slot, reconnecting it first if its previous
    /// occupant died.
    pub(crate) async fn lease(&self) -> Result<Lease, RequestError> {
        let slot = self
            .slots
            .recv_async()
            .await
            .map_err(|_| RequestError::Closed)?;
        let connection = match slot {
            Some(connection) => connection,
            None => self.connector.connect_timeout().await?,
        };
        Ok(Lease {
            connection: Some(connection),
            dead: false,
            returns: self.returns.clone(),
        })
    }
}

/// Exclusive use of one pooled connection. Dropping the lease returns the
/// slot; a lease marked dead returns an empty slot instead.
pub(crate) struct Lease {
    connection: Option<Connection>,
    dead: bool,
    returns: flume::Sender<Option<Connection>>,
}

impl Lease {
    pub(crate) async fn send(
        &mut self,
        request: &Request<Bytes>,
    ) -> Result<Exchange, RequestError> {
        let connection = match self.connection.as_mut() {
            Some(connection) => connection,
            None => return Err(RequestError::Closed),
        };
        let result = connection.send(request).await;
        if result.is_err() {
            self.dead = true;
        }
        result
    }

    /// Discard the connection when the response payload failed mid-stream.
    pub(crate) fn mark_dead(&mut self) {
        self.dead = true;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let slot = if self.dead { None } else { self.connection.take() };
        // A disconnected return channel means the pool is already gone;
        // that is the normal shutdown order during drain.
        let _ = self.returns.send(slot);
    }
}
