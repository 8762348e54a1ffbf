use std::time::Duration;

use anyhow::bail;

/// Tuning knobs for a [crate::server::TcpServer] and its connections.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Delay before a connection's retransmit timer fires. The timer is armed
    /// when the connection is created; until a retransmission queue exists
    /// its action only logs.
    pub retransmit_timeout: Duration,
    /// How long a connection lingers in `TIME_WAIT` before its registry entry
    /// is reclaimed. Stands in for the 2*MSL of a full implementation.
    pub time_wait_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            retransmit_timeout: Duration::from_secs(1),
            time_wait_timeout: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Checks the configuration for internal consistency. Meant to be called
    /// once on startup, to raise configuration errors early rather than on
    /// first use.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retransmit_timeout.is_zero() {
            bail!("retransmit timeout must not be zero");
        }
        if self.time_wait_timeout.is_zero() {
            bail!("time-wait timeout must not be zero");
        }
        Ok(())
    }
}
