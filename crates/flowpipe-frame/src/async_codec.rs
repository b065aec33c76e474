//! `tokio_util` codec over the frame wire format.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{decode_frame, encode_frame, incomplete_frame_error, Frame, FrameConfig};
use crate::error::FrameError;

/// Frame codec for `FramedRead` / `FramedWrite`.
#[derive(Debug, Clone, Default)]
pub struct FbpCodec {
    config: FrameConfig,
}

impl FbpCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: FrameConfig) -> Self {
        Self { config }
    }
}

impl Decoder for FbpCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        decode_frame(src, &self.config)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => {
                let err = incomplete_frame_error(src);
                src.clear();
                Err(err)
            }
        }
    }
}

impl Encoder<Frame> for FbpCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        if frame.body.len() > self.config.max_body_size {
            return Err(FrameError::BodyTooLarge {
                size: frame.body.len(),
                max: self.config.max_body_size,
            });
        }
        encode_frame(&frame, dst)
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;
    use crate::control::bracket_open;

    #[tokio::test]
    async fn framed_roundtrip_over_duplex() {
        let (client, server) = tokio::io::duplex(64);
        let mut sink = FramedWrite::new(client, FbpCodec::new());
        let mut stream = FramedRead::new(server, FbpCodec::new());

        let frames = vec![
            Frame::data("TCPPacket", vec![0u8; 300]).with_extension("conn-id", "3"),
            bracket_open("IN"),
            Frame::data("TCPPacket", ""),
        ];

        let expected = frames.clone();
        let writer = tokio::spawn(async move {
            for frame in frames {
                sink.send(frame).await.unwrap();
            }
        });

        for frame in expected {
            assert_eq!(stream.next().await.unwrap().unwrap(), frame);
        }
        writer.await.unwrap();
        assert!(stream.next().await.is_none(), "clean EOF ends the stream");
    }

    #[tokio::test]
    async fn truncated_frame_at_eof_is_an_error() {
        let bytes: &[u8] = b"Type: data.X\r\nContent-Length: 9\r\n\r\nabc";
        let mut stream = FramedRead::new(bytes, FbpCodec::new());
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            FrameError::ShortBody {
                expected: 9,
                actual: 3
            }
        ));
    }

    #[tokio::test]
    async fn malformed_header_is_an_error() {
        let bytes: &[u8] = b"Type: data.X\r\n\r\n";
        let mut stream = FramedRead::new(bytes, FbpCodec::new());
        assert!(matches!(
            stream.next().await.unwrap(),
            Err(FrameError::MissingField("Content-Length"))
        ));
    }
}
