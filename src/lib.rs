//! Server-side TCP core for user-space networking: the control logic between a
//! raw network layer (anything that can deliver and emit IP datagrams - a TUN
//! device, a packet socket, a simulated link) and application code, with no
//! kernel transport stack involved.
//!
//! ## Structure
//!
//! * [server::TcpServer] is the demultiplexer. It owns the registry of live
//!   connections keyed by the `(source address, source port, destination
//!   address, destination port)` four-tuple, validates every inbound datagram
//!   (addressed port, checksum, parseable header) and routes it to the right
//!   connection, creating one whenever a SYN arrives.
//! * [connection::Connection] is the per-four-tuple state machine: the
//!   handshake reply, cumulative acknowledgment bookkeeping, strictly in-order
//!   delivery to the application, MSS-sized chunking of outbound data, and the
//!   FIN/ACK close walk through `FIN_WAIT`/`CLOSING`/`TIME_WAIT` on the active
//!   side and `CLOSE_WAIT`/`LAST_ACK` on the passive side.
//! * [segment] and [checksum] are the wire codec: the segment header layout
//!   and the RFC 1071 internet checksum with its TCP pseudo-header.
//!
//! The raw network layer is consumed through [network::NetworkLayer] and not
//! implemented here; [test_util] has an in-memory implementation for tests.
//! Applications plug in through the capability traits in [observer] and the
//! `send`/`close` methods on [connection::Connection].
//!
//! ## Segment wire format
//!
//! The fixed header, all numbers in network byte order (BE):
//!
//! ```ascii
//!  0: source port (u16)
//!  2: destination port (u16)
//!  4: sequence number (u32)
//!  8: acknowledgment number (u32)
//! 12: data offset (4 bits, header length in 4-byte units)
//!      + reserved (3 bits, ignored)
//!      + flags (9 bits: FIN, SYN, RST, PSH, ACK, URG in the low bits)
//! 14: window size (u16) - emitted as a fixed default, never enforced
//! 16: checksum (u16) - RFC 1071 over pseudo-header plus segment; a segment
//!      whose embedded checksum is valid re-computes to zero
//! 18: urgent pointer (u16) - always 0 on the segments this crate builds
//! 20: options (if the data offset is larger than 5), then payload
//! ```
//!
//! ## Delivery model
//!
//! Delivery is strictly in-order with no reordering buffer: a segment whose
//! sequence number is not exactly the next expected byte is dropped without a
//! reply, and duplicates are indistinguishable from reordering. There is no
//! congestion control, no receive window enforcement and no retransmission -
//! each connection owns a cancellable retransmit timer, but its action is a
//! placeholder until a retransmission queue exists. Sending is fire and
//! forget: a segment counts as sent once the network layer accepted it.

pub mod checksum;
pub mod config;
pub mod conn_key;
pub mod connection;
pub mod network;
pub mod observer;
pub mod segment;
pub mod server;
pub mod test_util;
pub mod timer;
