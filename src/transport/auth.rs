//! Connection preamble: endpoint selection and bearer-token check.
//!
//! Runs before any stream frame, so an unauthenticated peer never reaches a stream
//! engine.
use std::time::Duration;

use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time;

use super::framed::{CborSink, CborSource};
use super::TransportError;
use crate::messages::{Endpoint, Hello, HelloAck, Status};

/// Sends `hello` and waits for the server's verdict.
pub async fn client_hello<W, R>(
    sink: &mut CborSink<W>,
    source: &mut CborSource<R>,
    hello: &Hello,
    limit: Duration,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
{
    sink.send_value(hello).await?;
    let ack: HelloAck = match time::timeout(limit, source.recv_value()).await {
        Ok(res) => res?.ok_or(TransportError::Closed)?,
        Err(_) => return Err(TransportError::Timeout("preamble")),
    };
    if ack.status.is_ok() {
        Ok(())
    } else {
        Err(TransportError::Unauthenticated(ack.status.describe()))
    }
}

/// Reads the peer's [`Hello`] and checks its bearer token against `expected`.
///
/// # Errors
/// Returns [`TransportError::Unauthenticated`] after replying with an error status
/// when a token is required and missing or wrong.
pub async fn server_hello<W, R>(
    sink: &mut CborSink<W>,
    source: &mut CborSource<R>,
    expected: Option<&str>,
    limit: Duration,
) -> Result<Endpoint, TransportError>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
{
    let hello: Hello = match time::timeout(limit, source.recv_value()).await {
        Ok(res) => res?.ok_or(TransportError::Closed)?,
        Err(_) => return Err(TransportError::Timeout("preamble")),
    };

    if let Some(expected) = expected {
        let presented = hello.bearer_token.as_deref().unwrap_or_default();
        if !token_matches(presented, expected) {
            let reason = if hello.bearer_token.is_none() {
                "missing bearer token"
            } else {
                "invalid bearer token"
            };
            sink.send_value(&HelloAck {
                status: Status::error(reason),
            })
            .await?;
            return Err(TransportError::Unauthenticated(reason.into()));
        }
    }

    sink.send_value(&HelloAck {
        status: Status::ok(),
    })
    .await?;
    Ok(hello.endpoint)
}

fn token_matches(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}
