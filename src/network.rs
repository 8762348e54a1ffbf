//! The seam towards the raw network layer. Everything below TCP is behind
//! [NetworkLayer], so the server core runs unchanged on top of a TUN device,
//! a raw socket or an in-memory test double.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

/// A network layer that can carry TCP segments inside IP datagrams.
///
/// Implementations are expected to be cheap to share; the server keeps an
/// `Arc<dyn NetworkLayer>` and hands clones to every connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NetworkLayer: Send + Sync + 'static {
    /// Registers the handler that receives all inbound datagrams. There is a
    /// single receiver; registering again replaces the previous one.
    fn register_receiver(&self, handler: Arc<dyn DatagramHandler>);

    /// Hands one fully built datagram (checksummed segment) to the network
    /// layer for delivery to `to`. Fire and forget: there is no delivery
    /// notification beyond the network layer having accepted the datagram.
    async fn send(&self, datagram: &[u8], to: IpAddr) -> anyhow::Result<()>;

    /// When true, receivers skip checksum verification on inbound segments.
    /// This is a debugging affordance of lower layers that cannot provide
    /// checksum-neutral datagrams, not a production setting.
    fn ignore_checksum(&self) -> bool;
}

/// Receiver side of [NetworkLayer::register_receiver].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramHandler: Send + Sync + 'static {
    /// Called for every inbound datagram, with the addresses taken from the
    /// IP layer and the raw segment bytes.
    async fn on_datagram(&self, src_addr: IpAddr, dst_addr: IpAddr, datagram: &[u8]);
}
