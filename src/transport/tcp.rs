use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::framed::{self, MAX_FRAME_LEN};
use super::tls::{self, TlsClientOptions};
use super::{auth, Connector, Duplex, TransportError};
use crate::messages::{Endpoint, Frame, Hello};

/// Client/sampler side connection settings.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub tls: Option<TlsClientOptions>,
    pub bearer_token: Option<String>,
    pub max_frame_len: usize,
    pub preamble_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            tls: None,
            bearer_token: None,
            max_frame_len: MAX_FRAME_LEN,
            preamble_timeout: Duration::from_secs(10),
        }
    }
}

impl ConnectOptions {
    pub fn with_tls(mut self, tls: TlsClientOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}

/// Opens framed CBOR connections over TCP, optionally wrapped in TLS.
pub struct TcpConnector {
    addr: String,
    endpoint: Endpoint,
    options: ConnectOptions,
    tls: Option<tokio_rustls::TlsConnector>,
}

impl TcpConnector {
    pub fn new(
        addr: impl Into<String>,
        endpoint: Endpoint,
        options: ConnectOptions,
    ) -> Result<Self, TransportError> {
        let tls = options.tls.as_ref().map(tls::client_connector).transpose()?;
        Ok(Self {
            addr: addr.into(),
            endpoint,
            options,
            tls,
        })
    }

    async fn finish<S, Out, In>(&self, io: S) -> Result<Duplex<Frame<Out>, Frame<In>>, TransportError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        Out: Serialize + Send + 'static,
        In: DeserializeOwned + Send + 'static,
    {
        let (mut sink, mut source) = framed::split(io, self.options.max_frame_len);
        let hello = Hello {
            endpoint: self.endpoint,
            bearer_token: self.options.bearer_token.clone(),
        };
        auth::client_hello(&mut sink, &mut source, &hello, self.options.preamble_timeout).await?;
        Ok(Duplex::new(sink, source))
    }
}

#[async_trait]
impl<Out, In> Connector<Out, In> for TcpConnector
where
    Out: Serialize + Send + 'static,
    In: DeserializeOwned + Send + 'static,
{
    async fn connect(&self) -> Result<Duplex<Frame<Out>, Frame<In>>, TransportError> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        match &self.tls {
            Some(connector) => {
                let name = tls::server_name(
                    &self.addr,
                    self.options.tls.as_ref().and_then(|t| t.server_name.as_deref()),
                )?;
                let stream = connector
                    .connect(name, stream)
                    .await
                    .map_err(|e| TransportError::Tls(e.to_string()))?;
                self.finish(stream).await
            }
            None => self.finish(stream).await,
        }
    }
}
