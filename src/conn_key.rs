use std::fmt::{Debug, Formatter};
use std::net::{IpAddr, SocketAddr};

/// Identifies one connection by its four-tuple.
///
/// The tuple is oriented the way it appears in *inbound* segments: `src` is
/// the peer, `dst` is this server. Outbound segments swap the two sides.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct ConnectionKey {
    pub src_addr: IpAddr,
    pub src_port: u16,
    pub dst_addr: IpAddr,
    pub dst_port: u16,
}

impl ConnectionKey {
    pub fn new(src_addr: IpAddr, src_port: u16, dst_addr: IpAddr, dst_port: u16) -> ConnectionKey {
        ConnectionKey {
            src_addr,
            src_port,
            dst_addr,
            dst_port,
        }
    }

    #[cfg(test)]
    pub fn localhost(src_port: u16, dst_port: u16) -> ConnectionKey {
        let localhost: IpAddr = "127.0.0.1".parse().unwrap();
        ConnectionKey::new(localhost, src_port, localhost, dst_port)
    }
}

impl Debug for ConnectionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {}",
            SocketAddr::new(self.src_addr, self.src_port),
            SocketAddr::new(self.dst_addr, self.dst_port),
        )
    }
}
