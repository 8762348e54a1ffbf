use std::net::IpAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::checksum;
use crate::config::ServerConfig;
use crate::conn_key::ConnectionKey;
use crate::connection::{Connection, ConnectionState};
use crate::network::{DatagramHandler, NetworkLayer};
use crate::observer::ConnectionObserver;
use crate::segment::{SegmentFlags, SegmentHeader};

/// The demultiplexer: validates inbound datagrams on one local port and
/// routes them to per-four-tuple [Connection]s, accepting new connections on
/// SYN.
///
/// The server is the only writer of the connection registry. Connections
/// announce themselves on an internal channel once they are fully closed, and
/// a reaper task owned by the server drops their entries.
pub struct TcpServer {
    port: u16,
    net: Arc<dyn NetworkLayer>,
    config: Arc<ServerConfig>,
    connections: Mutex<FxHashMap<ConnectionKey, Arc<Connection>>>,
    accept_observer: Mutex<Option<Arc<dyn ConnectionObserver>>>,
    defunct_tx: mpsc::UnboundedSender<ConnectionKey>,
}

impl TcpServer {
    /// Creates a server listening on `port`, registers it as the network
    /// layer's receiver and starts the reaper task.
    pub fn new(
        net: Arc<dyn NetworkLayer>,
        port: u16,
        config: ServerConfig,
    ) -> anyhow::Result<Arc<TcpServer>> {
        config.validate()?;

        let (defunct_tx, defunct_rx) = mpsc::unbounded_channel();
        let server = Arc::new(TcpServer {
            port,
            net: net.clone(),
            config: Arc::new(config),
            connections: Mutex::new(FxHashMap::default()),
            accept_observer: Mutex::new(None),
            defunct_tx,
        });

        tokio::spawn(TcpServer::reap_loop(Arc::downgrade(&server), defunct_rx));
        net.register_receiver(server.clone());

        info!("tcp server listening on port {}", port);
        Ok(server)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Registers the observer notified of accepted connections, replacing any
    /// previous one. SYNs accepted while no observer is registered create
    /// connections that nobody is told about; they are still reachable
    /// through [TcpServer::connection].
    pub async fn register_accept_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        *self.accept_observer.lock().await = Some(observer);
    }

    pub async fn connection(&self, key: &ConnectionKey) -> Option<Arc<Connection>> {
        self.connections.lock().await.get(key).cloned()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    async fn accept_connection(&self, key: ConnectionKey, header: &SegmentHeader) {
        let conn = Connection::accept(
            key,
            header.seq_no,
            header.ack_no,
            self.net.clone(),
            self.config.clone(),
            self.defunct_tx.clone(),
        )
        .await;

        let replaced = self.connections.lock().await.insert(key, conn.clone());
        if let Some(replaced) = replaced {
            let state = replaced.state().await;
            debug!("renewed SYN on {:?} replaces the connection in state {:?}", key, state);
        }

        let observer = self.accept_observer.lock().await.clone();
        if let Some(observer) = observer {
            observer.on_connection_accepted(&conn).await;
        }
    }

    /// Removes registry entries for connections that announced themselves as
    /// defunct, typically after their time-wait expired. Runs until the
    /// server and all its connections are gone.
    async fn reap_loop(
        server: Weak<TcpServer>,
        mut defunct_rx: mpsc::UnboundedReceiver<ConnectionKey>,
    ) {
        while let Some(key) = defunct_rx.recv().await {
            let Some(server) = server.upgrade() else {
                return;
            };

            let mut connections = server.connections.lock().await;
            let closed = match connections.get(&key) {
                Some(conn) => conn.state().await == ConnectionState::Closed,
                None => false,
            };
            if closed {
                connections.remove(&key);
                debug!("reaped closed connection {:?}", key);
            }
        }
    }
}

#[async_trait]
impl DatagramHandler for TcpServer {
    async fn on_datagram(&self, src_addr: IpAddr, dst_addr: IpAddr, datagram: &[u8]) {
        let header = match SegmentHeader::try_parse(&mut &datagram[..]) {
            Ok(header) => header,
            Err(e) => {
                warn!("dropping unparseable segment from {}: {}", src_addr, e);
                return;
            }
        };

        if header.dst_port != self.port {
            // not addressed to this server
            return;
        }

        if !self.net.ignore_checksum() && checksum::compute(datagram, src_addr, dst_addr) != 0 {
            warn!("dropping segment with invalid checksum from {}", src_addr);
            return;
        }

        let payload = match header.payload(datagram) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("dropping segment from {}: {}", src_addr, e);
                return;
            }
        };

        let key = ConnectionKey::new(src_addr, header.src_port, dst_addr, header.dst_port);

        if header.flags.contains(SegmentFlags::SYN) {
            self.accept_connection(key, &header).await;
            return;
        }

        let conn = self.connections.lock().await.get(&key).cloned();
        match conn {
            Some(conn) => {
                conn.on_segment(header.seq_no, header.ack_no, header.flags, payload)
                    .await;

                if conn.state().await == ConnectionState::Closed {
                    let mut connections = self.connections.lock().await;
                    if connections
                        .get(&key)
                        .is_some_and(|entry| Arc::ptr_eq(entry, &conn))
                    {
                        connections.remove(&key);
                        debug!("removed closed connection {:?}", key);
                    }
                }
            }
            None => debug!("dropping segment for unknown connection {:?}", key),
        }
    }
}
