//! Exact-length framed I/O over the connection stream.
//!
//! Every read asks for a precise byte count; a short read, EOF or expired
//! deadline is fatal for the connection. Handlers are generic over the
//! stream so tests can drive them through an in-memory duplex pipe instead
//! of a TLS socket.

use std::io::ErrorKind;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use sphinx_core::{OracleError, FAIL_MARKER};

pub struct Framed<S> {
    stream: S,
    timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Framed<S> {
    pub fn new(stream: S, timeout: Duration) -> Self {
        Self { stream, timeout }
    }

    /// Read exactly `len` bytes or fail.
    pub async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, OracleError> {
        let mut buf = vec![0u8; len];
        let read = tokio::time::timeout(self.timeout, self.stream.read_exact(&mut buf))
            .await
            .map_err(|_| OracleError::Io(ErrorKind::TimedOut.into()))?;
        match read {
            Ok(_) => Ok(buf),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(OracleError::MalformedFraming),
            Err(e) => Err(e.into()),
        }
    }

    /// Read a fixed-size value.
    pub async fn read_array<const N: usize>(&mut self) -> Result<[u8; N], OracleError> {
        let buf = self.read_exact(N).await?;
        Ok(buf.try_into().expect("read_exact returned N bytes"))
    }

    pub async fn read_u8(&mut self) -> Result<u8, OracleError> {
        Ok(self.read_array::<1>().await?[0])
    }

    /// Send all of `data` and flush.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), OracleError> {
        tokio::time::timeout(self.timeout, async {
            self.stream.write_all(data).await?;
            self.stream.flush().await
        })
        .await
        .map_err(|_| OracleError::Io(ErrorKind::TimedOut.into()))??;
        Ok(())
    }

    /// Best-effort fail marker; the connection is torn down right after, so
    /// errors here are ignored.
    pub async fn send_fail(&mut self) {
        let _ = self.send(FAIL_MARKER).await;
        let _ = self.stream.shutdown().await;
    }

    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}
