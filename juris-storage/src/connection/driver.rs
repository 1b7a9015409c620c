use async_trait::async_trait;
use juris_core::{ConnectOptions, ConnectionError};
use tokio::sync::broadcast;

/// Unsolicited signal from a driver about its open connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// The connection closed without being asked to.
    Disconnected { reason: String },
    /// The connection reported an error and can no longer be trusted.
    Error { reason: String },
}

/// Pluggable data-store driver.
///
/// The lifecycle manager owns when to connect, ping and disconnect; the
/// driver only knows how. `Handle` is what callers of `ensure_connection`
/// receive and must be cheap to clone.
#[async_trait]
pub trait StoreDriver: Send + Sync + 'static {
    type Handle: Clone + Send + Sync + 'static;

    /// Short name for logs and status reports.
    fn name(&self) -> &str;

    async fn connect(
        &self,
        uri: &str,
        options: &ConnectOptions,
    ) -> Result<Self::Handle, ConnectionError>;

    /// Cheap round trip proving the connection is usable.
    async fn ping(&self, handle: &Self::Handle) -> Result<(), ConnectionError>;

    /// Close the connection behind `handle`. Called for graceful shutdown
    /// and, best effort, for connections abandoned after a forced drop.
    async fn disconnect(&self, handle: Self::Handle) -> Result<(), ConnectionError>;

    /// Stream of drop and error signals for connections this driver opened.
    fn subscribe(&self) -> broadcast::Receiver<DriverEvent>;
}

/// Strip credentials from a connection URI before it reaches a log line.
pub fn redact_uri(uri: &str) -> String {
    match (uri.find("://"), uri.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &uri[..scheme_end], &uri[at..])
        }
        _ => uri.to_string(),
    }
}
