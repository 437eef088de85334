//! Wire codec for the two message shapes carried over the link.
//!
//! | Message | Layout |
//! |---|---|
//! | [`SensorFrame`] | `[u32 big-endian length L][L bytes payload]`, `L ≤ max_frame_len` |
//! | [`ActuatorCommand`] | `[magA][magB][dirA ∈ {0,1,2}][dirB ∈ {0,1,2}]` |
//!
//! Decoding always reads the full declared message before interpreting it.
//! A short read is a transport disconnect, never a malformed message.

use std::io;

use async_trait::async_trait;
use carlink_types::{ActuatorCommand, COMMAND_LEN, FRAME_HEADER_LEN, LinkError, MAX_FRAME_LEN, SensorFrame};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size limits applied while encoding and decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecLimits {
    pub max_frame_len: usize,
}

impl Default for CodecLimits {
    fn default() -> Self {
        Self {
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

/// Why a message could not be decoded.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The stream ended or failed before the message was complete.
    #[error("transport disconnected mid-message: {0}")]
    Disconnected(#[from] io::Error),

    /// The peer declared a frame longer than allowed.  Framing cannot be
    /// trusted after this.
    #[error("declared frame length {declared} exceeds maximum {max}")]
    Oversize { declared: usize, max: usize },

    /// The message was read completely but its content is invalid.  The
    /// stream is still aligned on the next message.
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl DecodeError {
    /// `true` when only the offending message should be discarded and the
    /// stream can keep going.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DecodeError::Malformed(_))
    }
}

/// A message type that can travel over the link.
#[async_trait]
pub trait WireMessage: Sized + Send + Sync + 'static {
    /// Short name used in logs.
    const KIND: &'static str;

    /// Serialise into a single contiguous buffer.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Protocol`] if the message cannot be represented
    /// within `limits`.
    fn encode(&self, limits: &CodecLimits) -> Result<Vec<u8>, LinkError>;

    /// Read exactly one message from `reader`.
    async fn read_from<R>(reader: &mut R, limits: &CodecLimits) -> Result<Self, DecodeError>
    where
        R: AsyncRead + Unpin + Send;
}

#[async_trait]
impl WireMessage for SensorFrame {
    const KIND: &'static str = "frame";

    fn encode(&self, limits: &CodecLimits) -> Result<Vec<u8>, LinkError> {
        let len = self.len();
        if len > limits.max_frame_len {
            return Err(LinkError::Protocol(format!(
                "frame of {len} bytes exceeds maximum {}",
                limits.max_frame_len
            )));
        }
        let header = u32::try_from(len)
            .map_err(|_| LinkError::Protocol(format!("frame of {len} bytes overflows u32 header")))?;
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + len);
        buf.extend_from_slice(&header.to_be_bytes());
        buf.extend_from_slice(self.payload());
        Ok(buf)
    }

    async fn read_from<R>(reader: &mut R, limits: &CodecLimits) -> Result<Self, DecodeError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let declared = reader.read_u32().await? as usize;
        if declared > limits.max_frame_len {
            return Err(DecodeError::Oversize {
                declared,
                max: limits.max_frame_len,
            });
        }
        let mut payload = vec![0u8; declared];
        reader.read_exact(&mut payload).await?;
        Ok(SensorFrame::new(payload))
    }
}

#[async_trait]
impl WireMessage for ActuatorCommand {
    const KIND: &'static str = "command";

    fn encode(&self, _limits: &CodecLimits) -> Result<Vec<u8>, LinkError> {
        Ok(self.to_bytes().to_vec())
    }

    async fn read_from<R>(reader: &mut R, _limits: &CodecLimits) -> Result<Self, DecodeError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut buf = [0u8; COMMAND_LEN];
        reader.read_exact(&mut buf).await?;
        ActuatorCommand::from_bytes(buf).map_err(|e| DecodeError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_limits() -> CodecLimits {
        CodecLimits { max_frame_len: 64 }
    }

    #[tokio::test]
    async fn frame_roundtrip_preserves_payload_and_length() -> Result<(), Box<dyn std::error::Error>> {
        let limits = small_limits();
        for len in [0usize, 1, 63, 64] {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let frame = SensorFrame::new(payload.clone());
            let bytes = frame.encode(&limits)?;
            assert_eq!(bytes.len(), FRAME_HEADER_LEN + len);
            assert_eq!(&bytes[..4], &(len as u32).to_be_bytes());

            let mut rd: &[u8] = &bytes;
            let back = SensorFrame::read_from(&mut rd, &limits).await?;
            assert_eq!(back.payload(), payload.as_slice());
            assert_eq!(back.len(), len);
        }
        Ok(())
    }

    #[test]
    fn encoding_oversize_frame_is_rejected() {
        let frame = SensorFrame::new(vec![0u8; 65]);
        assert!(matches!(
            frame.encode(&small_limits()),
            Err(LinkError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn oversize_declared_length_is_unrecoverable() {
        let bytes = 65u32.to_be_bytes();
        let mut rd: &[u8] = &bytes;
        let err = SensorFrame::read_from(&mut rd, &small_limits())
            .await
            .unwrap_err();
        assert!(matches!(err, DecodeError::Oversize { declared: 65, max: 64 }));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn short_frame_read_is_a_disconnect() {
        let mut bytes = 10u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[1, 2, 3]);
        let mut rd: &[u8] = &bytes;
        let err = SensorFrame::read_from(&mut rd, &small_limits())
            .await
            .unwrap_err();
        match err {
            DecodeError::Disconnected(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected disconnect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn back_to_back_frames_decode_in_order() -> Result<(), Box<dyn std::error::Error>> {
        let limits = small_limits();
        let mut bytes = SensorFrame::new(b"first".to_vec()).encode(&limits)?;
        bytes.extend(SensorFrame::new(b"second".to_vec()).encode(&limits)?);

        let mut rd: &[u8] = &bytes;
        assert_eq!(SensorFrame::read_from(&mut rd, &limits).await?.payload(), b"first");
        assert_eq!(SensorFrame::read_from(&mut rd, &limits).await?.payload(), b"second");
        Ok(())
    }

    #[tokio::test]
    async fn command_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let limits = CodecLimits::default();
        let cmd = ActuatorCommand::forward(200);
        let bytes = cmd.encode(&limits)?;
        assert_eq!(bytes, vec![200, 200, 1, 1]);

        let mut rd: &[u8] = &bytes;
        assert_eq!(ActuatorCommand::read_from(&mut rd, &limits).await?, cmd);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_direction_is_recoverable_and_keeps_alignment() -> Result<(), Box<dyn std::error::Error>> {
        let limits = CodecLimits::default();
        let bytes = [50u8, 50, 1, 3, 80, 80, 0, 0];
        let mut rd: &[u8] = &bytes;

        let err = ActuatorCommand::read_from(&mut rd, &limits).await.unwrap_err();
        assert!(err.is_recoverable());

        let next = ActuatorCommand::read_from(&mut rd, &limits).await?;
        assert_eq!(next, ActuatorCommand::backward(80));
        Ok(())
    }

    #[tokio::test]
    async fn short_command_read_is_a_disconnect() {
        let bytes = [1u8, 2];
        let mut rd: &[u8] = &bytes;
        let err = ActuatorCommand::read_from(&mut rd, &CodecLimits::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DecodeError::Disconnected(_)));
        assert!(!err.is_recoverable());
    }
}
