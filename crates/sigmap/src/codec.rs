//! Frame transport for tagged calls
//!
//! Servers and the demux client talk to a transport only through
//! [`CallReader`] and [`CallWriter`]. The provided implementation frames each
//! call with a length prefix and encodes it with bincode.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::error::SigmaError;
use crate::MAX_FRAME;

/// Read side of a call transport
#[async_trait]
pub trait CallReader<C>: Send {
    /// Next whole call; any error means the transport is unusable
    async fn read_call(&mut self) -> Result<C, SigmaError>;
}

/// Write side of a call transport
#[async_trait]
pub trait CallWriter<C: Sync>: Send {
    async fn write_call(&mut self, call: &C) -> Result<(), SigmaError>;

    async fn shutdown(&mut self) -> Result<(), SigmaError> {
        Ok(())
    }
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME)
        .new_codec()
}

#[derive(Debug)]
pub struct FramedReader<R> {
    inner: FramedRead<R, LengthDelimitedCodec>,
}

impl<R: AsyncRead> FramedReader<R> {
    pub fn new(io: R) -> Self {
        Self {
            inner: FramedRead::new(io, codec()),
        }
    }
}

#[derive(Debug)]
pub struct FramedWriter<W> {
    inner: FramedWrite<W, LengthDelimitedCodec>,
}

impl<W: AsyncWrite> FramedWriter<W> {
    pub fn new(io: W) -> Self {
        Self {
            inner: FramedWrite::new(io, codec()),
        }
    }
}

/// Split a duplex stream into framed call halves
pub fn framed<T>(io: T) -> (FramedReader<ReadHalf<T>>, FramedWriter<WriteHalf<T>>)
where
    T: AsyncRead + AsyncWrite,
{
    let (r, w) = tokio::io::split(io);
    (FramedReader::new(r), FramedWriter::new(w))
}

#[async_trait]
impl<R, C> CallReader<C> for FramedReader<R>
where
    R: AsyncRead + Unpin + Send,
    C: DeserializeOwned + Send,
{
    async fn read_call(&mut self) -> Result<C, SigmaError> {
        match self.inner.next().await {
            Some(Ok(frame)) => Ok(bincode::deserialize(&frame)?),
            Some(Err(e)) => Err(SigmaError::Unreachable(e.to_string())),
            None => Err(SigmaError::Unreachable("connection closed".into())),
        }
    }
}

#[async_trait]
impl<W, C> CallWriter<C> for FramedWriter<W>
where
    W: AsyncWrite + Unpin + Send,
    C: Serialize + Sync,
{
    async fn write_call(&mut self, call: &C) -> Result<(), SigmaError> {
        let frame = bincode::serialize(call)?;
        self.inner
            .send(Bytes::from(frame))
            .await
            .map_err(|e| SigmaError::Unreachable(e.to_string()))
    }

    async fn shutdown(&mut self) -> Result<(), SigmaError> {
        SinkExt::<Bytes>::close(&mut self.inner)
            .await
            .map_err(|e| SigmaError::Unreachable(e.to_string()))
    }
}
