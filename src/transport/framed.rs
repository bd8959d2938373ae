use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use super::{MessageSink, MessageSource, TransportError};

/// Default upper bound for a single encoded frame.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

fn codec(max_frame_len: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_len)
        .new_codec()
}

fn encode<T: Serialize>(value: &T) -> Result<Bytes, TransportError> {
    serde_cbor::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| TransportError::Codec(format!("encode: {}", e)))
}

/// CBOR-over-length-delimited writer.
#[derive(Debug)]
pub struct CborSink<W> {
    inner: FramedWrite<W, LengthDelimitedCodec>,
}

impl<W: AsyncWrite + Unpin + Send> CborSink<W> {
    pub fn new(io: W, max_frame_len: usize) -> Self {
        Self {
            inner: FramedWrite::new(io, codec(max_frame_len)),
        }
    }

    pub async fn send_value<T: Serialize>(&mut self, value: &T) -> Result<(), TransportError> {
        let bytes = encode(value)?;
        self.send_bytes(bytes).await
    }

    async fn send_bytes(&mut self, bytes: Bytes) -> Result<(), TransportError> {
        self.inner.send(bytes).await?;
        Ok(())
    }
}

/// CBOR-over-length-delimited reader.
#[derive(Debug)]
pub struct CborSource<R> {
    inner: FramedRead<R, LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin + Send> CborSource<R> {
    pub fn new(io: R, max_frame_len: usize) -> Self {
        Self {
            inner: FramedRead::new(io, codec(max_frame_len)),
        }
    }

    pub async fn recv_value<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        match self.inner.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(e.into()),
            Some(Ok(buf)) => serde_cbor::from_slice(&buf)
                .map(Some)
                .map_err(|e| TransportError::Codec(format!("decode: {}", e))),
        }
    }
}

#[async_trait]
impl<W, M> MessageSink<M> for CborSink<W>
where
    W: AsyncWrite + Unpin + Send,
    M: Serialize + Send + 'static,
{
    async fn send(&mut self, msg: M) -> Result<(), TransportError> {
        // Encoded before awaiting, so no borrow of `msg` lives across the write.
        let bytes = encode(&msg)?;
        self.send_bytes(bytes).await
    }
}

#[async_trait]
impl<R, M> MessageSource<M> for CborSource<R>
where
    R: AsyncRead + Unpin + Send,
    M: DeserializeOwned + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<M>, TransportError> {
        self.recv_value().await
    }
}

/// Splits a byte stream into framed CBOR halves.
pub fn split<S>(io: S, max_frame_len: usize) -> (CborSink<WriteHalf<S>>, CborSource<ReadHalf<S>>)
where
    S: AsyncRead + AsyncWrite + Send,
{
    let (read, write) = tokio::io::split(io);
    (
        CborSink::new(write, max_frame_len),
        CborSource::new(read, max_frame_len),
    )
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::messages::{Envelope, Frame, Status};

    #[tokio::test]
    async fn frames_cross_a_byte_stream() {
        let (left, right) = tokio::io::duplex(1024);
        let (mut sink, _left_source) = split(left, MAX_FRAME_LEN);
        let (_right_sink, mut source) = split(right, MAX_FRAME_LEN);

        let frame = Frame::Message(Envelope::new("uid-1", Status::error("boom")));
        MessageSink::send(&mut sink, frame.clone()).await.unwrap();
        MessageSink::send(&mut sink, Frame::<Status>::KeepAlive).await.unwrap();

        let got: Option<Frame<Status>> = MessageSource::recv(&mut source).await.unwrap();
        assert_eq!(got, Some(frame));
        let got: Option<Frame<Status>> = MessageSource::recv(&mut source).await.unwrap();
        assert_eq!(got, Some(Frame::KeepAlive));
    }

    #[tokio::test]
    async fn messages_only_need_to_be_send() {
        let (left, right) = tokio::io::duplex(1024);
        let (mut sink, _left_source) = split(left, MAX_FRAME_LEN);
        let (_right_sink, mut source) = split(right, MAX_FRAME_LEN);

        // `Cell` is Send but not Sync.
        let sending = tokio::spawn(async move { MessageSink::send(&mut sink, Cell::new(7u32)).await });
        sending.await.unwrap().unwrap();

        let got: Option<Cell<u32>> = MessageSource::recv(&mut source).await.unwrap();
        assert_eq!(got.map(Cell::into_inner), Some(7));
    }
}
