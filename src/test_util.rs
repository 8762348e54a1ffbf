//! Test doubles and factories: an in-memory network layer that records
//! outbound datagrams, a receive handler that records delivered payloads, and
//! helpers for building and picking apart checksummed segments.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};

use crate::checksum;
use crate::conn_key::ConnectionKey;
use crate::connection::Connection;
use crate::network::{DatagramHandler, NetworkLayer};
use crate::observer::ReceiveHandler;
use crate::segment::{SegmentFlags, SegmentHeader};

/// In-memory [NetworkLayer]: records everything sent through it and lets
/// tests inject inbound datagrams into the registered receiver.
pub struct RecordingNetwork {
    ignore_checksum: bool,
    handler: Mutex<Option<Arc<dyn DatagramHandler>>>,
    sent: Mutex<Vec<(Vec<u8>, IpAddr)>>,
}

impl RecordingNetwork {
    pub fn new() -> RecordingNetwork {
        RecordingNetwork {
            ignore_checksum: false,
            handler: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn ignoring_checksum() -> RecordingNetwork {
        RecordingNetwork {
            ignore_checksum: true,
            ..RecordingNetwork::new()
        }
    }

    /// Feeds one datagram to the registered receiver, the way the network
    /// layer would on arrival. Panics if no receiver is registered.
    pub async fn deliver(&self, src_addr: IpAddr, dst_addr: IpAddr, datagram: &[u8]) {
        let handler = self
            .handler
            .lock()
            .unwrap()
            .clone()
            .expect("no receiver registered");
        handler.on_datagram(src_addr, dst_addr, datagram).await;
    }

    /// All datagrams sent since the last call, oldest first, each with its
    /// destination address.
    pub fn take_sent(&self) -> Vec<(Vec<u8>, IpAddr)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn assert_nothing_sent(&self) {
        assert!(self.sent.lock().unwrap().is_empty());
    }
}

#[async_trait]
impl NetworkLayer for RecordingNetwork {
    fn register_receiver(&self, handler: Arc<dyn DatagramHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    async fn send(&self, datagram: &[u8], to: IpAddr) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push((datagram.to_vec(), to));
        Ok(())
    }

    fn ignore_checksum(&self) -> bool {
        self.ignore_checksum
    }
}

/// [ReceiveHandler] that records every delivered payload.
pub struct TrackingReceiveHandler {
    received: Mutex<Vec<Vec<u8>>>,
}

impl TrackingReceiveHandler {
    pub fn new() -> TrackingReceiveHandler {
        TrackingReceiveHandler {
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().unwrap().clone()
    }

    pub fn assert_received(&self, expected: &[&[u8]]) {
        let received = self.received();
        let received: Vec<&[u8]> = received.iter().map(|payload| payload.as_slice()).collect();
        assert_eq!(received, expected);
    }

    pub fn assert_nothing_received(&self) {
        assert!(self.received.lock().unwrap().is_empty());
    }
}

#[async_trait]
impl ReceiveHandler for TrackingReceiveHandler {
    async fn on_data_received(&self, _connection: &Arc<Connection>, payload: &[u8]) {
        self.received.lock().unwrap().push(payload.to_vec());
    }
}

/// Builds a checksummed segment as the peer in `key` would send it, i.e. with
/// the key's `src` side as the sender.
pub fn peer_segment(
    key: &ConnectionKey,
    seq_no: u32,
    ack_no: u32,
    flags: SegmentFlags,
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    SegmentHeader::new(key.src_port, key.dst_port, seq_no, ack_no, flags).ser(&mut buf);
    buf.put_slice(payload);

    let mut datagram = buf.to_vec();
    checksum::fill(&mut datagram, key.src_addr, key.dst_addr);
    datagram
}

/// Splits a well-formed datagram into its header and payload. Panics on
/// malformed input.
pub fn parse_segment(datagram: &[u8]) -> (SegmentHeader, Vec<u8>) {
    let header = SegmentHeader::try_parse(&mut &datagram[..]).expect("malformed segment header");
    let payload = header.payload(datagram).expect("malformed payload offset");
    (header, payload.to_vec())
}
