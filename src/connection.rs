use std::sync::{Arc, Weak};

use bytes::{BufMut, BytesMut};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

use crate::checksum;
use crate::config::ServerConfig;
use crate::conn_key::ConnectionKey;
use crate::network::NetworkLayer;
use crate::observer::ReceiveHandler;
use crate::segment::{SegmentFlags, SegmentHeader, HEADER_LEN, MAX_SEGMENT_SIZE};
use crate::timer::OneShotTimer;

/// Lifecycle states of a [Connection].
///
/// A connection object only exists once a SYN was accepted, so `Established`
/// is the initial state; the remaining states track the FIN exchange. `LISTEN`
/// and the `SYN_*` states of full TCP have no counterpart here because the
/// handshake reply happens during construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Established,
    /// active close: our FIN is out and unacknowledged
    FinWait1,
    /// active close: our FIN is acknowledged, the peer's FIN is outstanding
    FinWait2,
    /// simultaneous close: both FINs are out, ours is unacknowledged
    Closing,
    /// the peer's FIN is acknowledged; lingering until the time-wait timeout
    /// expires in case our last ACK was lost
    TimeWait,
    /// passive close: the peer's FIN is acknowledged, the application has not
    /// closed its side yet
    CloseWait,
    /// passive close: our FIN is out, waiting for its acknowledgment
    LastAck,
    Closed,
}

struct ConnectionInner {
    state: ConnectionState,
    /// sequence number of the next byte to send
    seq_no: u32,
    /// next sequence number expected from the peer, i.e. the cumulative ack
    ack_no: u32,
    /// sequence number our FIN consumed, once one was sent
    fin_seq: Option<u32>,
    receive_handler: Option<Arc<dyn ReceiveHandler>>,
    retransmit_timer: OneShotTimer,
    time_wait_timer: OneShotTimer,
}

/// One established connection: the server-side send and receive state for a
/// single four-tuple.
///
/// All segment processing is driven by the demultiplexer through
/// [Connection::on_segment]; applications interact through [Connection::send],
/// [Connection::close] and the registered [ReceiveHandler].
///
/// NB: there is no server-chosen initial sequence number. The first send
/// sequence number is taken from the `ack_no` field of the peer's SYN, and
/// every accepted segment re-aligns `seq_no` to the peer's cumulative ack.
pub struct Connection {
    key: ConnectionKey,
    net: Arc<dyn NetworkLayer>,
    config: Arc<ServerConfig>,
    defunct: mpsc::UnboundedSender<ConnectionKey>,
    myself: Weak<Connection>,
    inner: Mutex<ConnectionInner>,
}

impl Connection {
    /// Creates the server-side endpoint for a peer's SYN and sends the
    /// handshake reply, a SYN+ACK without payload. The SYN consumes one
    /// sequence number, so the next expected byte is `syn_seq_no + 1`.
    ///
    /// Once the connection is fully closed its key is announced on `defunct`
    /// so the owner can drop its registry entry.
    pub async fn accept(
        key: ConnectionKey,
        syn_seq_no: u32,
        syn_ack_no: u32,
        net: Arc<dyn NetworkLayer>,
        config: Arc<ServerConfig>,
        defunct: mpsc::UnboundedSender<ConnectionKey>,
    ) -> Arc<Connection> {
        let conn = Arc::new_cyclic(|myself| Connection {
            key,
            net,
            config: config.clone(),
            defunct,
            myself: myself.clone(),
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Established,
                seq_no: syn_ack_no,
                ack_no: syn_seq_no.wrapping_add(1),
                fin_seq: None,
                receive_handler: None,
                retransmit_timer: OneShotTimer::new(),
                time_wait_timer: OneShotTimer::new(),
            }),
        });

        {
            let mut inner = conn.inner.lock().await;
            // TODO retransmit the oldest unacknowledged segment when this fires
            inner.retransmit_timer.arm(config.retransmit_timeout, async move {
                trace!("retransmit timer fired for {:?} - nothing to retransmit yet", key);
            });

            conn.do_send_segment(&inner, SegmentFlags::SYN | SegmentFlags::ACK, b"").await;
            debug!(
                "accepted connection {:?}: seq_no={}, ack_no={}",
                key, inner.seq_no, inner.ack_no,
            );
        }

        conn
    }

    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub async fn seq_no(&self) -> u32 {
        self.inner.lock().await.seq_no
    }

    pub async fn ack_no(&self) -> u32 {
        self.inner.lock().await.ack_no
    }

    /// Registers the handler for inbound payload, replacing any previous one.
    /// Payload that arrives while no handler is registered is acknowledged
    /// but discarded.
    pub async fn register_receive_handler(&self, handler: Arc<dyn ReceiveHandler>) {
        self.inner.lock().await.receive_handler = Some(handler);
    }

    /// Processes one validated inbound segment. Called by the demultiplexer
    /// with the parsed header fields and the payload.
    ///
    /// Acceptance is strictly in-order: a segment whose sequence number is
    /// not exactly the next expected byte is dropped without a reply or any
    /// state change. An accepted segment advances the cumulative ack by the
    /// payload length (plus one for a FIN), adopts the peer's ack as the next
    /// send sequence number, and is answered with at most one pure ACK.
    pub async fn on_segment(&self, seq_no: u32, ack_no: u32, flags: SegmentFlags, payload: &[u8]) {
        let mut inner = self.inner.lock().await;

        if inner.state == ConnectionState::Closed {
            trace!("dropping segment for closed connection {:?}", self.key);
            return;
        }
        if seq_no != inner.ack_no {
            trace!(
                "dropping out-of-order segment on {:?}: seq_no {} but {} expected",
                self.key, seq_no, inner.ack_no,
            );
            return;
        }

        inner.ack_no = inner.ack_no.wrapping_add(payload.len() as u32);
        inner.seq_no = ack_no;

        // the receive side stays open until the peer's FIN was accepted
        let receiving = matches!(
            inner.state,
            ConnectionState::Established | ConnectionState::FinWait1 | ConnectionState::FinWait2
        );
        let fin = receiving && flags.contains(SegmentFlags::FIN);
        let acks_our_fin = inner
            .fin_seq
            .is_some_and(|fin_seq| ack_no == fin_seq.wrapping_add(1));

        if fin {
            // the FIN consumes one sequence number
            inner.ack_no = inner.ack_no.wrapping_add(1);
        }

        match inner.state {
            ConnectionState::Established if fin => {
                debug!("peer closed {:?}: CloseWait", self.key);
                inner.state = ConnectionState::CloseWait;
            }
            ConnectionState::FinWait1 if fin && acks_our_fin => self.enter_time_wait(&mut inner),
            ConnectionState::FinWait1 if fin => {
                debug!("simultaneous close on {:?}: Closing", self.key);
                inner.state = ConnectionState::Closing;
            }
            ConnectionState::FinWait1 if acks_our_fin => {
                debug!("FIN on {:?} acknowledged: FinWait2", self.key);
                inner.state = ConnectionState::FinWait2;
            }
            ConnectionState::FinWait2 if fin => self.enter_time_wait(&mut inner),
            ConnectionState::Closing if acks_our_fin => self.enter_time_wait(&mut inner),
            ConnectionState::LastAck if acks_our_fin => self.set_closed(&mut inner),
            _ => {}
        }

        let deliver = receiving && !payload.is_empty();
        let send_ack = !payload.is_empty() || fin;
        let handler = inner.receive_handler.clone();
        drop(inner);

        // The handler is invoked without holding the lock so it can call
        // [Connection::send] on this same connection.
        if deliver {
            match handler {
                Some(handler) => {
                    trace!("delivering {} bytes on {:?}", payload.len(), self.key);
                    if let Some(me) = self.myself.upgrade() {
                        handler.on_data_received(&me, payload).await;
                    }
                }
                None => debug!(
                    "no receive handler on {:?} - discarding {} payload bytes",
                    self.key,
                    payload.len(),
                ),
            }
        }

        if send_ack {
            let inner = self.inner.lock().await;
            self.do_send_segment(&inner, SegmentFlags::ACK, b"").await;
        }
    }

    /// Sends application data, chunked into segments of at most
    /// [MAX_SEGMENT_SIZE] bytes. Data sent while the connection is not open
    /// for sending is dropped.
    pub async fn send(&self, data: &[u8]) {
        let mut inner = self.inner.lock().await;

        if !matches!(
            inner.state,
            ConnectionState::Established | ConnectionState::CloseWait
        ) {
            warn!(
                "dropping send of {} bytes on {:?}: connection is {:?}",
                data.len(),
                self.key,
                inner.state,
            );
            return;
        }

        for chunk in data.chunks(MAX_SEGMENT_SIZE) {
            self.do_send_segment(&inner, SegmentFlags::ACK, chunk).await;
            inner.seq_no = inner.seq_no.wrapping_add(chunk.len() as u32);
        }
    }

    /// Closes the sending side: sends a FIN and starts the close walk. The
    /// receive side stays open until the peer's FIN arrives. Calling close on
    /// a connection that already closed its sending side does nothing.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;

        let next_state = match inner.state {
            ConnectionState::Established => ConnectionState::FinWait1,
            ConnectionState::CloseWait => ConnectionState::LastAck,
            other => {
                debug!("ignoring close() on {:?} in state {:?}", self.key, other);
                return;
            }
        };

        inner.fin_seq = Some(inner.seq_no);
        inner.state = next_state;
        debug!("closing {:?}: {:?}", self.key, next_state);
        self.do_send_segment(&inner, SegmentFlags::FIN | SegmentFlags::ACK, b"").await;
    }

    fn enter_time_wait(&self, inner: &mut ConnectionInner) {
        debug!("{:?} entering TimeWait", self.key);
        inner.state = ConnectionState::TimeWait;
        inner.retransmit_timer.cancel();

        let myself = self.myself.clone();
        inner
            .time_wait_timer
            .arm(self.config.time_wait_timeout, async move {
                if let Some(conn) = myself.upgrade() {
                    conn.on_time_wait_expired().await;
                }
            });
    }

    async fn on_time_wait_expired(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == ConnectionState::TimeWait {
            self.set_closed(&mut inner);
        }
    }

    fn set_closed(&self, inner: &mut ConnectionInner) {
        inner.state = ConnectionState::Closed;
        inner.retransmit_timer.cancel();
        debug!("connection {:?} closed", self.key);
        // tell the demultiplexer to reclaim the registry entry
        self.defunct.send(self.key).ok();
    }

    /// Builds, checksums and hands one segment to the network layer. Sending
    /// is fire and forget; errors are logged and swallowed.
    async fn do_send_segment(&self, inner: &ConnectionInner, flags: SegmentFlags, payload: &[u8]) {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        SegmentHeader::new(
            self.key.dst_port,
            self.key.src_port,
            inner.seq_no,
            inner.ack_no,
            flags,
        )
        .ser(&mut buf);
        buf.put_slice(payload);
        checksum::fill(&mut buf, self.key.dst_addr, self.key.src_addr);

        trace!(
            "sending {:?} seq_no={} ack_no={} payload={}b on {:?}",
            flags,
            inner.seq_no,
            inner.ack_no,
            payload.len(),
            self.key,
        );
        if let Err(e) = self.net.send(&buf, self.key.src_addr).await {
            warn!("error sending segment on {:?}: {}", self.key, e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::{parse_segment, RecordingNetwork, TrackingReceiveHandler};
    use async_trait::async_trait;
    use std::time::Duration;

    const PEER_PORT: u16 = 5678;
    const SERVER_PORT: u16 = 7000;

    fn test_key() -> ConnectionKey {
        ConnectionKey::localhost(PEER_PORT, SERVER_PORT)
    }

    async fn accepted_conn(
        net: &Arc<RecordingNetwork>,
    ) -> (Arc<Connection>, mpsc::UnboundedReceiver<ConnectionKey>) {
        let (defunct_tx, defunct_rx) = mpsc::unbounded_channel();
        let conn = Connection::accept(
            test_key(),
            100,
            0,
            net.clone(),
            Arc::new(ServerConfig::default()),
            defunct_tx,
        )
        .await;
        net.take_sent();
        (conn, defunct_rx)
    }

    struct EchoHandler;

    #[async_trait]
    impl ReceiveHandler for EchoHandler {
        async fn on_data_received(&self, connection: &Arc<Connection>, payload: &[u8]) {
            connection.send(payload).await;
        }
    }

    #[tokio::test]
    async fn test_handshake_reply() {
        let net = Arc::new(RecordingNetwork::new());
        let (defunct_tx, _defunct_rx) = mpsc::unbounded_channel();

        let conn = Connection::accept(
            test_key(),
            100,
            0,
            net.clone(),
            Arc::new(ServerConfig::default()),
            defunct_tx,
        )
        .await;

        assert_eq!(conn.state().await, ConnectionState::Established);
        assert_eq!(conn.ack_no().await, 101);
        assert_eq!(conn.seq_no().await, 0);

        let sent = net.take_sent();
        assert_eq!(sent.len(), 1);
        let (datagram, to) = &sent[0];
        assert_eq!(*to, test_key().src_addr);
        assert_eq!(
            checksum::compute(datagram, test_key().dst_addr, test_key().src_addr),
            0
        );

        let (header, payload) = parse_segment(datagram);
        assert_eq!(header.flags, SegmentFlags::SYN | SegmentFlags::ACK);
        assert_eq!(header.src_port, SERVER_PORT);
        assert_eq!(header.dst_port, PEER_PORT);
        assert_eq!(header.seq_no, 0);
        assert_eq!(header.ack_no, 101);
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn test_initial_seq_no_comes_from_syn_ack_field() {
        let net = Arc::new(RecordingNetwork::new());
        let (defunct_tx, _defunct_rx) = mpsc::unbounded_channel();

        let conn = Connection::accept(
            test_key(),
            100,
            424242,
            net.clone(),
            Arc::new(ServerConfig::default()),
            defunct_tx,
        )
        .await;

        assert_eq!(conn.seq_no().await, 424242);
        let (header, _) = parse_segment(&net.take_sent()[0].0);
        assert_eq!(header.seq_no, 424242);
    }

    #[tokio::test]
    async fn test_in_order_payload_is_delivered_and_acked() {
        let net = Arc::new(RecordingNetwork::new());
        let (conn, _defunct_rx) = accepted_conn(&net).await;
        let handler = Arc::new(TrackingReceiveHandler::new());
        conn.register_receive_handler(handler.clone()).await;

        conn.on_segment(101, 0, SegmentFlags::ACK, b"hi").await;

        assert_eq!(conn.ack_no().await, 103);
        handler.assert_received(&[b"hi"]);

        let sent = net.take_sent();
        assert_eq!(sent.len(), 1);
        let (header, payload) = parse_segment(&sent[0].0);
        assert_eq!(header.flags, SegmentFlags::ACK);
        assert_eq!(header.ack_no, 103);
        assert_eq!(header.seq_no, 0);
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn test_consecutive_payloads_are_delivered_in_order() {
        let net = Arc::new(RecordingNetwork::new());
        let (conn, _defunct_rx) = accepted_conn(&net).await;
        let handler = Arc::new(TrackingReceiveHandler::new());
        conn.register_receive_handler(handler.clone()).await;

        conn.on_segment(101, 0, SegmentFlags::ACK, b"hi").await;
        conn.on_segment(103, 0, SegmentFlags::ACK, b"there").await;

        assert_eq!(conn.ack_no().await, 108);
        handler.assert_received(&[b"hi", b"there"]);

        // each accepted segment is answered with its own cumulative ack
        let sent = net.take_sent();
        assert_eq!(sent.len(), 2);
        let (first_ack, payload) = parse_segment(&sent[0].0);
        assert_eq!(first_ack.flags, SegmentFlags::ACK);
        assert_eq!(first_ack.ack_no, 103);
        assert!(payload.is_empty());
        let (second_ack, payload) = parse_segment(&sent[1].0);
        assert_eq!(second_ack.flags, SegmentFlags::ACK);
        assert_eq!(second_ack.ack_no, 108);
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn test_out_of_order_segment_is_dropped_silently() {
        let net = Arc::new(RecordingNetwork::new());
        let (conn, _defunct_rx) = accepted_conn(&net).await;
        let handler = Arc::new(TrackingReceiveHandler::new());
        conn.register_receive_handler(handler.clone()).await;

        conn.on_segment(50, 0, SegmentFlags::ACK, b"stale").await;
        conn.on_segment(102, 0, SegmentFlags::ACK, b"early").await;

        assert_eq!(conn.ack_no().await, 101);
        assert_eq!(conn.state().await, ConnectionState::Established);
        handler.assert_nothing_received();
        net.assert_nothing_sent();
    }

    #[tokio::test]
    async fn test_pure_ack_updates_counters_without_reply() {
        let net = Arc::new(RecordingNetwork::new());
        let (conn, _defunct_rx) = accepted_conn(&net).await;
        let handler = Arc::new(TrackingReceiveHandler::new());
        conn.register_receive_handler(handler.clone()).await;

        conn.on_segment(101, 7, SegmentFlags::ACK, b"").await;

        assert_eq!(conn.ack_no().await, 101);
        // the peer's cumulative ack becomes the next send sequence number
        assert_eq!(conn.seq_no().await, 7);
        handler.assert_nothing_received();
        net.assert_nothing_sent();
    }

    #[tokio::test]
    async fn test_payload_without_handler_is_acked_and_discarded() {
        let net = Arc::new(RecordingNetwork::new());
        let (conn, _defunct_rx) = accepted_conn(&net).await;

        conn.on_segment(101, 0, SegmentFlags::ACK, b"hi").await;

        assert_eq!(conn.ack_no().await, 103);
        let sent = net.take_sent();
        assert_eq!(sent.len(), 1);
        let (header, _) = parse_segment(&sent[0].0);
        assert_eq!(header.ack_no, 103);
    }

    #[tokio::test]
    async fn test_send_chunks_payload_by_max_segment_size() {
        let net = Arc::new(RecordingNetwork::new());
        let (conn, _defunct_rx) = accepted_conn(&net).await;

        let data = vec![0x61u8; 3000];
        conn.send(&data).await;

        let sent = net.take_sent();
        assert_eq!(sent.len(), 3);

        let expected = [(0u32, 1460usize), (1460, 1460), (2920, 80)];
        for ((datagram, _), (expected_seq, expected_len)) in sent.iter().zip(expected) {
            let (header, payload) = parse_segment(datagram);
            assert_eq!(header.flags, SegmentFlags::ACK);
            assert_eq!(header.seq_no, expected_seq);
            assert_eq!(header.ack_no, 101);
            assert_eq!(payload.len(), expected_len);
            assert_eq!(
                checksum::compute(datagram, test_key().dst_addr, test_key().src_addr),
                0
            );
        }

        assert_eq!(conn.seq_no().await, 3000);
    }

    #[tokio::test]
    async fn test_send_empty_data_sends_nothing() {
        let net = Arc::new(RecordingNetwork::new());
        let (conn, _defunct_rx) = accepted_conn(&net).await;

        conn.send(b"").await;

        net.assert_nothing_sent();
        assert_eq!(conn.seq_no().await, 0);
    }

    #[tokio::test]
    async fn test_send_in_close_wait_is_allowed() {
        let net = Arc::new(RecordingNetwork::new());
        let (conn, _defunct_rx) = accepted_conn(&net).await;

        conn.on_segment(101, 0, SegmentFlags::FIN | SegmentFlags::ACK, b"").await;
        assert_eq!(conn.state().await, ConnectionState::CloseWait);
        net.take_sent();

        // the peer closed its side, but ours stays open until close()
        conn.send(b"goodbye").await;

        let sent = net.take_sent();
        assert_eq!(sent.len(), 1);
        let (header, payload) = parse_segment(&sent[0].0);
        assert_eq!(payload, b"goodbye");
        assert_eq!(header.flags, SegmentFlags::ACK);
        assert_eq!(header.seq_no, 0);
        assert_eq!(header.ack_no, 102);
        assert_eq!(conn.seq_no().await, 7);
    }

    #[tokio::test]
    async fn test_echoing_from_the_receive_handler() {
        let net = Arc::new(RecordingNetwork::new());
        let (conn, _defunct_rx) = accepted_conn(&net).await;
        conn.register_receive_handler(Arc::new(EchoHandler)).await;

        conn.on_segment(101, 0, SegmentFlags::ACK, b"ping").await;

        let sent = net.take_sent();
        assert_eq!(sent.len(), 2);

        let (echo_header, echo_payload) = parse_segment(&sent[0].0);
        assert_eq!(echo_payload, b"ping");
        assert_eq!(echo_header.seq_no, 0);
        assert_eq!(echo_header.ack_no, 105);

        // the ack of the inbound segment goes out after the handler ran, with
        // the sequence number the echo advanced to
        let (ack_header, ack_payload) = parse_segment(&sent[1].0);
        assert!(ack_payload.is_empty());
        assert_eq!(ack_header.flags, SegmentFlags::ACK);
        assert_eq!(ack_header.seq_no, 4);
        assert_eq!(ack_header.ack_no, 105);
    }

    #[tokio::test]
    async fn test_passive_close_walk() {
        let net = Arc::new(RecordingNetwork::new());
        let (conn, mut defunct_rx) = accepted_conn(&net).await;

        conn.on_segment(101, 0, SegmentFlags::FIN | SegmentFlags::ACK, b"").await;
        assert_eq!(conn.state().await, ConnectionState::CloseWait);
        assert_eq!(conn.ack_no().await, 102);
        let (header, _) = parse_segment(&net.take_sent()[0].0);
        assert_eq!(header.flags, SegmentFlags::ACK);
        assert_eq!(header.ack_no, 102);

        conn.close().await;
        assert_eq!(conn.state().await, ConnectionState::LastAck);
        let (header, _) = parse_segment(&net.take_sent()[0].0);
        assert_eq!(header.flags, SegmentFlags::FIN | SegmentFlags::ACK);
        assert_eq!(header.seq_no, 0);

        conn.on_segment(102, 1, SegmentFlags::ACK, b"").await;
        assert_eq!(conn.state().await, ConnectionState::Closed);
        assert_eq!(defunct_rx.try_recv().unwrap(), test_key());
        net.assert_nothing_sent();
    }

    #[tokio::test]
    async fn test_fin_with_payload_delivers_then_acks_both() {
        let net = Arc::new(RecordingNetwork::new());
        let (conn, _defunct_rx) = accepted_conn(&net).await;
        let handler = Arc::new(TrackingReceiveHandler::new());
        conn.register_receive_handler(handler.clone()).await;

        conn.on_segment(101, 0, SegmentFlags::FIN | SegmentFlags::ACK, b"bye").await;

        assert_eq!(conn.state().await, ConnectionState::CloseWait);
        // 3 payload bytes plus one for the FIN
        assert_eq!(conn.ack_no().await, 105);
        handler.assert_received(&[b"bye"]);

        let sent = net.take_sent();
        assert_eq!(sent.len(), 1);
        let (header, _) = parse_segment(&sent[0].0);
        assert_eq!(header.ack_no, 105);
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_close_through_time_wait() {
        let net = Arc::new(RecordingNetwork::new());
        let (conn, mut defunct_rx) = accepted_conn(&net).await;

        conn.close().await;
        assert_eq!(conn.state().await, ConnectionState::FinWait1);
        let (header, _) = parse_segment(&net.take_sent()[0].0);
        assert_eq!(header.flags, SegmentFlags::FIN | SegmentFlags::ACK);
        assert_eq!(header.seq_no, 0);
        assert_eq!(header.ack_no, 101);

        conn.on_segment(101, 1, SegmentFlags::ACK, b"").await;
        assert_eq!(conn.state().await, ConnectionState::FinWait2);
        net.assert_nothing_sent();

        conn.on_segment(101, 1, SegmentFlags::FIN | SegmentFlags::ACK, b"").await;
        assert_eq!(conn.state().await, ConnectionState::TimeWait);
        assert_eq!(conn.ack_no().await, 102);
        let (header, _) = parse_segment(&net.take_sent()[0].0);
        assert_eq!(header.flags, SegmentFlags::ACK);
        assert_eq!(header.ack_no, 102);

        // a retransmitted FIN falls before the cumulative ack and is dropped
        conn.on_segment(101, 1, SegmentFlags::FIN | SegmentFlags::ACK, b"").await;
        assert_eq!(conn.state().await, ConnectionState::TimeWait);
        net.assert_nothing_sent();

        tokio::time::sleep(ServerConfig::default().time_wait_timeout + Duration::from_secs(1)).await;
        assert_eq!(conn.state().await, ConnectionState::Closed);
        assert_eq!(defunct_rx.try_recv().unwrap(), test_key());
    }

    #[tokio::test(start_paused = true)]
    async fn test_simultaneous_close() {
        let net = Arc::new(RecordingNetwork::new());
        let (conn, mut defunct_rx) = accepted_conn(&net).await;

        conn.close().await;
        net.take_sent();

        // the peer's FIN crossed ours on the wire, so it does not ack ours
        conn.on_segment(101, 0, SegmentFlags::FIN | SegmentFlags::ACK, b"").await;
        assert_eq!(conn.state().await, ConnectionState::Closing);
        let (header, _) = parse_segment(&net.take_sent()[0].0);
        assert_eq!(header.ack_no, 102);

        conn.on_segment(102, 1, SegmentFlags::ACK, b"").await;
        assert_eq!(conn.state().await, ConnectionState::TimeWait);
        net.assert_nothing_sent();

        tokio::time::sleep(ServerConfig::default().time_wait_timeout + Duration::from_secs(1)).await;
        assert_eq!(conn.state().await, ConnectionState::Closed);
        assert_eq!(defunct_rx.try_recv().unwrap(), test_key());
    }

    #[tokio::test]
    async fn test_half_close_still_receives_data() {
        let net = Arc::new(RecordingNetwork::new());
        let (conn, _defunct_rx) = accepted_conn(&net).await;
        let handler = Arc::new(TrackingReceiveHandler::new());
        conn.register_receive_handler(handler.clone()).await;

        conn.close().await;
        net.take_sent();

        conn.on_segment(101, 1, SegmentFlags::ACK, b"late").await;

        assert_eq!(conn.state().await, ConnectionState::FinWait2);
        assert_eq!(conn.ack_no().await, 105);
        handler.assert_received(&[b"late"]);
        let (header, _) = parse_segment(&net.take_sent()[0].0);
        assert_eq!(header.ack_no, 105);
    }

    #[tokio::test]
    async fn test_send_after_close_is_dropped() {
        let net = Arc::new(RecordingNetwork::new());
        let (conn, _defunct_rx) = accepted_conn(&net).await;

        conn.close().await;
        net.take_sent();

        conn.send(b"too late").await;

        net.assert_nothing_sent();
        assert_eq!(conn.seq_no().await, 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let net = Arc::new(RecordingNetwork::new());
        let (conn, _defunct_rx) = accepted_conn(&net).await;

        conn.close().await;
        assert_eq!(net.take_sent().len(), 1);

        conn.close().await;
        assert_eq!(conn.state().await, ConnectionState::FinWait1);
        net.assert_nothing_sent();
    }

    #[tokio::test]
    async fn test_segments_after_closed_are_dropped() {
        let net = Arc::new(RecordingNetwork::new());
        let (conn, _defunct_rx) = accepted_conn(&net).await;

        conn.on_segment(101, 0, SegmentFlags::FIN | SegmentFlags::ACK, b"").await;
        conn.close().await;
        conn.on_segment(102, 1, SegmentFlags::ACK, b"").await;
        assert_eq!(conn.state().await, ConnectionState::Closed);
        net.take_sent();

        conn.on_segment(102, 1, SegmentFlags::ACK, b"more").await;

        assert_eq!(conn.state().await, ConnectionState::Closed);
        net.assert_nothing_sent();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmit_timer_fires_without_effect() {
        let net = Arc::new(RecordingNetwork::new());
        let (conn, _defunct_rx) = accepted_conn(&net).await;

        tokio::time::sleep(ServerConfig::default().retransmit_timeout + Duration::from_secs(1)).await;

        assert_eq!(conn.state().await, ConnectionState::Established);
        net.assert_nothing_sent();
    }

    #[tokio::test]
    async fn test_network_errors_are_swallowed() {
        let mut net = crate::network::MockNetworkLayer::new();
        net.expect_send()
            .times(2)
            .returning(|_, _| Err(anyhow::anyhow!("interface down")));
        let (defunct_tx, _defunct_rx) = mpsc::unbounded_channel();

        let conn = Connection::accept(
            test_key(),
            100,
            0,
            Arc::new(net),
            Arc::new(ServerConfig::default()),
            defunct_tx,
        )
        .await;

        conn.send(b"x").await;

        // fire and forget: the counters advance whether or not the network
        // layer accepted the segment
        assert_eq!(conn.seq_no().await, 1);
        assert_eq!(conn.state().await, ConnectionState::Established);
    }
}
