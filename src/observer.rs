//! Capability traits through which applications hook into the server.
//!
//! Both callbacks run on the receive path: a slow implementation stalls
//! processing of subsequent datagrams. Implementations that need to do real
//! work should hand it off to their own tasks.

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::connection::Connection;

/// Notified once for every accepted connection, right after the SYN+ACK went
/// out. This is the place to store the connection handle and to register a
/// [ReceiveHandler] on it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionObserver: Send + Sync + 'static {
    async fn on_connection_accepted(&self, connection: &Arc<Connection>);
}

/// Notified for every in-order payload a connection accepts. Pure ACKs and
/// empty segments do not reach the handler.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReceiveHandler: Send + Sync + 'static {
    async fn on_data_received(&self, connection: &Arc<Connection>, payload: &[u8]);
}
