//! Length-prefixed JSON framing.
//!
//! Each envelope travels as one frame: a 4-byte big-endian length followed by
//! that many bytes of JSON. The transport underneath only has to be an
//! ordered, reliable byte stream (a pipe pair, a socket, an in-memory duplex).

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;
use crate::message::Envelope;

/// Largest frame either side accepts (16 MB).
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Reads frames off a byte stream.
pub struct FrameReader<R> {
    inner: R,
    max_frame: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            max_frame: MAX_FRAME_BYTES,
        }
    }

    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// Read the next frame as raw JSON.
    ///
    /// Returns `Ok(None)` on a clean end of stream (the peer closed its end
    /// between frames).
    pub async fn read_value(&mut self) -> Result<Option<Value>, ProtocolError> {
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > self.max_frame {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: self.max_frame,
            });
        }

        let mut body = vec![0u8; len];
        self.inner.read_exact(&mut body).await?;
        let value = serde_json::from_slice(&body)
            .map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))?;
        Ok(Some(value))
    }
}

/// Serialize an envelope into a frame body no larger than `max`.
pub fn encode_body(envelope: &Envelope, max: usize) -> Result<Vec<u8>, ProtocolError> {
    let body = serde_json::to_vec(envelope)?;
    if body.len() > max {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len(),
            max,
        });
    }
    Ok(body)
}

/// Writes frames onto a byte stream.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_envelope(&mut self, envelope: &Envelope) -> Result<(), ProtocolError> {
        let body = encode_body(envelope, MAX_FRAME_BYTES)?;
        self.write_body(&body).await
    }

    /// Write an already encoded frame body. Only I/O can fail here.
    pub async fn write_body(&mut self, body: &[u8]) -> Result<(), ProtocolError> {
        self.inner
            .write_all(&(body.len() as u32).to_be_bytes())
            .await?;
        self.inner.write_all(body).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Raw access to the underlying stream.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Channel, Reply};
    use serde_json::json;

    #[tokio::test]
    async fn test_frame_layout() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client);
        writer
            .write_envelope(&Envelope::Reply(Reply::ok(Channel::from("c"), json!(7))))
            .await
            .unwrap();
        drop(writer);

        let mut raw = Vec::new();
        server.read_to_end(&mut raw).await.unwrap();
        let len = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
        assert_eq!(len, raw.len() - 4);
        let body: Value = serde_json::from_slice(&raw[4..]).unwrap();
        assert_eq!(body, json!({"channel": "c", "data": 7}));
    }

    #[tokio::test]
    async fn test_clean_eof_is_none() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut reader = FrameReader::new(server);
        assert!(reader.read_value().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&10u32.to_be_bytes()).await.unwrap();
        client.write_all(b"{\"a\"").await.unwrap();
        drop(client);
        let mut reader = FrameReader::new(server);
        assert!(matches!(
            reader.read_value().await,
            Err(ProtocolError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&1000u32.to_be_bytes()).await.unwrap();
        let mut reader = FrameReader::new(server).with_max_frame(100);
        let err = reader.read_value().await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::FrameTooLarge {
                size: 1000,
                max: 100
            }
        ));
    }

    #[test]
    fn test_encode_body_enforces_limit() {
        let envelope = Envelope::Reply(Reply::ok(Channel::from("c"), json!("x".repeat(200))));
        let err = encode_body(&envelope, 100).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { max: 100, .. }));
        assert!(encode_body(&envelope, MAX_FRAME_BYTES).is_ok());
    }

    #[tokio::test]
    async fn test_invalid_json_is_malformed() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&3u32.to_be_bytes()).await.unwrap();
        client.write_all(b"{{{").await.unwrap();
        let mut reader = FrameReader::new(server);
        assert!(matches!(
            reader.read_value().await,
            Err(ProtocolError::MalformedEnvelope(_))
        ));
    }
}
