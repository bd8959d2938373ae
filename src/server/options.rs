use std::time::Duration;

use crate::registry::StorageKind;
use crate::stream::StreamOptions;
use crate::transport::framed::MAX_FRAME_LEN;
use crate::transport::tls::TlsServerOptions;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Serve TLS on accepted connections.
    pub tls: Option<TlsServerOptions>,
    /// Bearer token every connection must present in its preamble.
    pub auth_bearer: Option<String>,
    pub storage: StorageKind,
    /// Period of the reconciliation sweep, on top of dirty notifications.
    pub reconciliation_period: Duration,
    /// Timeouts and limits of every accepted stream.
    pub stream: StreamOptions,
    /// Upper bound for a new connection to complete TLS and its preamble.
    pub preamble_timeout: Duration,
    pub max_frame_len: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            tls: None,
            auth_bearer: None,
            storage: StorageKind::Nop,
            reconciliation_period: Duration::from_secs(5),
            stream: StreamOptions::default(),
            preamble_timeout: Duration::from_secs(10),
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

impl ServerOptions {
    pub fn with_tls(mut self, tls: TlsServerOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_auth_bearer(mut self, token: impl Into<String>) -> Self {
        self.auth_bearer = Some(token.into());
        self
    }

    pub fn with_storage(mut self, storage: StorageKind) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_reconciliation_period(mut self, period: Duration) -> Self {
        self.reconciliation_period = period;
        self
    }

    pub fn with_stream_options(mut self, stream: StreamOptions) -> Self {
        self.stream = stream;
        self
    }
}
