// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::error::{Error, Result};
use crate::network::StreamBox;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Hard cap on a single frame. Auth and sync streams both use this framing.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Length-prefixed framing over a raw stream: 4-byte big-endian length, then the payload.
pub struct FramedStream {
    inner: StreamBox,
}

impl FramedStream {
    /// Wraps a raw stream.
    pub fn new(inner: StreamBox) -> Self {
        Self { inner }
    }

    /// Reads one frame.
    pub async fn read_frame(&mut self) -> Result<Bytes> {
        let mut len_bytes = [0u8; 4];
        self.inner
            .read_exact(&mut len_bytes)
            .await
            .map_err(|err| Error::StreamIo(err.to_string()))?;
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge(len));
        }
        let mut payload = vec![0u8; len];
        self.inner
            .read_exact(&mut payload)
            .await
            .map_err(|err| Error::StreamIo(err.to_string()))?;
        Ok(Bytes::from(payload))
    }

    /// Reads one frame, failing after `timeout`.
    pub async fn read_frame_timeout(&mut self, timeout: Duration) -> Result<Bytes> {
        tokio::time::timeout(timeout, self.read_frame())
            .await
            .map_err(|_| Error::Timeout("frame read".to_string()))?
    }

    /// Writes one frame.
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge(payload.len()));
        }
        let len = (payload.len() as u32).to_be_bytes();
        self.inner
            .write_all(&len)
            .await
            .map_err(|err| Error::StreamIo(err.to_string()))?;
        self.inner
            .write_all(payload)
            .await
            .map_err(|err| Error::StreamIo(err.to_string()))?;
        self.inner
            .flush()
            .await
            .map_err(|err| Error::StreamIo(err.to_string()))
    }

    /// Writes one frame, failing after `timeout`.
    pub async fn write_frame_timeout(&mut self, payload: &[u8], timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.write_frame(payload))
            .await
            .map_err(|_| Error::Timeout("frame write".to_string()))?
    }
}

impl std::fmt::Debug for FramedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedStream").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn frames_roundtrip() -> eyre::Result<()> {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut writer = FramedStream::new(Box::new(a));
        let mut reader = FramedStream::new(Box::new(b));

        writer.write_frame(b"hello realm").await?;
        writer.write_frame(&[]).await?;

        assert_eq!(&reader.read_frame().await?[..], b"hello realm");
        assert_eq!(reader.read_frame().await?.len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn oversized_frame_rejected_before_any_write() -> eyre::Result<()> {
        let (a, _b) = tokio::io::duplex(1024);
        let mut writer = FramedStream::new(Box::new(a));
        let huge = vec![0u8; MAX_FRAME_LEN + 1];
        assert_matches!(writer.write_frame(&huge).await, Err(Error::FrameTooLarge(_)));
        Ok(())
    }

    #[tokio::test]
    async fn oversized_length_prefix_rejected_on_read() -> eyre::Result<()> {
        let (a, b) = tokio::io::duplex(1024);
        let mut raw = a;
        raw.write_all(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes())
            .await?;
        let mut reader = FramedStream::new(Box::new(b));
        assert_matches!(reader.read_frame().await, Err(Error::FrameTooLarge(_)));
        Ok(())
    }
}
