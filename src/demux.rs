use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

/// Frame header layout: byte 0 selects the source stream, bytes 1-3 are
/// reserved, bytes 4-7 carry the payload length as a big-endian u32.
const HEADER_LEN: usize = 8;

const STDOUT_SOURCE: u8 = 1;
const STDERR_SOURCE: u8 = 2;

/// Incremental decoder for the multiplexed byte stream the daemon returns
/// when a non-TTY container's stdout and stderr are tailed together.
///
/// Payloads from both sources come out in arrival order; the selector byte
/// only gates validity, since downstream handling is identical for stdout
/// and stderr.
pub(crate) struct MuxFrameDecoder;

impl Decoder for MuxFrameDecoder {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let source = src[0];
        if source != STDOUT_SOURCE && source != STDERR_SOURCE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid stream selector byte: {source}"),
            ));
        }

        let payload_len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if src.len() < HEADER_LEN + payload_len {
            src.reserve(HEADER_LEN + payload_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(payload_len).freeze()))
    }
}
