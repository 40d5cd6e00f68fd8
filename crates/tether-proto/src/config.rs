//! Per-endpoint configuration.

use std::time::Duration;

/// Tunables for one endpoint (a server or a client).
///
/// The defaults suit one process talking to another over a LAN; tests
/// that host both endpoints in one process set an instance tag so the
/// two sides get distinct identities.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// How long the reverse-channel handler waits for the matching
    /// pre-accepted socket before giving up on the connection.
    pub(crate) reverse_wait: Duration,
    /// If set, a background thread sweeps expired proxies and reports
    /// them to the owner at this interval.
    pub(crate) gc_interval: Option<Duration>,
    /// Terminate the hosting process's server when the primary channel
    /// is lost.
    pub(crate) exit_on_disconnect: bool,
    /// Override for the process segment of the instance identifier.
    pub(crate) instance_tag: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            reverse_wait: Duration::from_secs(30),
            gc_interval: None,
            exit_on_disconnect: false,
            instance_tag: None,
        }
    }
}

impl ConnectionConfig {
    /// Start from the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how long to wait for a reverse socket to be matched.
    pub fn reverse_wait(mut self, dur: Duration) -> Self {
        self.reverse_wait = dur;
        self
    }

    /// Enable periodic proxy sweeps at the given interval.
    pub fn gc_interval(mut self, dur: Duration) -> Self {
        self.gc_interval = Some(dur);
        self
    }

    /// Shut the endpoint down when its primary channel is lost.
    pub fn exit_on_disconnect(mut self, yes: bool) -> Self {
        self.exit_on_disconnect = yes;
        self
    }

    /// Replace the process segment of the instance identifier.
    pub fn instance_tag(mut self, tag: impl Into<String>) -> Self {
        self.instance_tag = Some(tag.into());
        self
    }
}
