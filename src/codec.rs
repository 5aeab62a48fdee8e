//! Framing for the NMDC wire: `|`-terminated commands with a binary escape
//! hatch for file payloads.
//!
//! Commands are kept as raw byte strings because `$Key` payloads may contain
//! arbitrary bytes. While a session is in binary mode the decoder forwards
//! buffered bytes to the caller as [`Frame::Data`] chunks instead of framing
//! them; the mode disengages automatically once the announced payload length
//! has been consumed.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Frame {
    /// One complete command, without the trailing `|`.
    Command(Bytes),
    /// A chunk of a binary payload.
    Data(Bytes),
}

impl Frame {
    pub(crate) fn command(cmd: impl Into<Bytes>) -> Self {
        Frame::Command(cmd.into())
    }
}

#[derive(Debug, Default)]
pub(crate) struct NmdcCodec {
    /// How many payload bytes are still owed to the active transfer. While
    /// non-zero, inbound bytes bypass command framing.
    binary_remaining: u64,
}

impl NmdcCodec {
    /// Switches the decoder into binary mode for the next `len` bytes.
    pub(crate) fn set_binary(&mut self, len: u64) {
        self.binary_remaining = len;
    }

    #[cfg(test)]
    pub(crate) fn is_binary(&self) -> bool {
        self.binary_remaining > 0
    }
}

impl Decoder for NmdcCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        if self.binary_remaining > 0 {
            if src.is_empty() {
                return Ok(None);
            }
            let take = src.len().min(self.binary_remaining as usize);
            self.binary_remaining -= take as u64;
            return Ok(Some(Frame::Data(src.split_to(take).freeze())));
        }
        loop {
            match src.iter().position(|&b| b == b'|') {
                // a terminator at position zero is an empty command; drop it
                Some(0) => src.advance(1),
                Some(pos) => {
                    let command = src.split_to(pos).freeze();
                    src.advance(1);
                    return Ok(Some(Frame::Command(command)));
                }
                None => return Ok(None),
            }
        }
    }
}

impl Encoder<Frame> for NmdcCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match frame {
            Frame::Command(command) => {
                dst.reserve(command.len() + 1);
                dst.extend_from_slice(&command);
                dst.put_u8(b'|');
            }
            Frame::Data(data) => dst.extend_from_slice(&data),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn decode_all(codec: &mut NmdcCodec, src: &mut BytesMut) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(src).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_decode_splits_commands() {
        let mut codec = NmdcCodec::default();
        let mut src = BytesMut::from(&b"$Hello nick|<chat> hi|"[..]);
        assert_eq!(
            decode_all(&mut codec, &mut src),
            vec![
                Frame::command(&b"$Hello nick"[..]),
                Frame::command(&b"<chat> hi"[..]),
            ]
        );
        assert!(src.is_empty());
    }

    #[test]
    fn test_decode_buffers_partial_command() {
        let mut codec = NmdcCodec::default();
        let mut src = BytesMut::from(&b"$Hel"[..]);
        assert_eq!(decode_all(&mut codec, &mut src), vec![]);
        src.extend_from_slice(b"lo nick|$Qu");
        assert_eq!(
            decode_all(&mut codec, &mut src),
            vec![Frame::command(&b"$Hello nick"[..])]
        );
        src.extend_from_slice(b"it nick|");
        assert_eq!(
            decode_all(&mut codec, &mut src),
            vec![Frame::command(&b"$Quit nick"[..])]
        );
    }

    #[test]
    fn test_decode_drops_stray_terminators() {
        let mut codec = NmdcCodec::default();
        let mut src = BytesMut::from(&b"||$Quit nick||"[..]);
        assert_eq!(
            decode_all(&mut codec, &mut src),
            vec![Frame::command(&b"$Quit nick"[..])]
        );
    }

    #[test]
    fn test_binary_mode_counts_down_and_disengages() {
        let mut codec = NmdcCodec::default();
        let mut src = BytesMut::from(&b"$ADCSND file x 0 5|abc"[..]);
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(Frame::command(&b"$ADCSND file x 0 5"[..]))
        );
        // the session announces the payload length before the bytes arrive
        codec.set_binary(5);
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(Frame::Data(Bytes::from_static(b"abc")))
        );
        assert_eq!(codec.decode(&mut src).unwrap(), None);

        // the remainder of the payload and the next command share a delivery
        src.extend_from_slice(b"de$Foo|");
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(Frame::Data(Bytes::from_static(b"de")))
        );
        assert!(!codec.is_binary());
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(Frame::command(&b"$Foo"[..]))
        );
    }

    #[test]
    fn test_binary_payload_may_contain_terminators() {
        let mut codec = NmdcCodec::default();
        codec.set_binary(4);
        let mut src = BytesMut::from(&b"a|b|$Next|"[..]);
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(Frame::Data(Bytes::from_static(b"a|b|")))
        );
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(Frame::command(&b"$Next"[..]))
        );
    }

    #[test]
    fn test_encode() {
        let mut codec = NmdcCodec::default();
        let mut dst = BytesMut::new();
        codec
            .encode(Frame::command(&b"$MyNick tester"[..]), &mut dst)
            .unwrap();
        codec
            .encode(Frame::Data(Bytes::from_static(b"raw")), &mut dst)
            .unwrap();
        assert_eq!(&dst[..], &b"$MyNick tester|raw"[..]);
    }
}
