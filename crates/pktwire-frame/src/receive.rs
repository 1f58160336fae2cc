use std::io::{self, Write};

use pktwire_transport::TransferBuffer;

use crate::codec::{FrameHeader, FrameType, PacketInfo};
use crate::error::Result;

#[derive(Debug)]
enum Body {
    PacketHeader(Vec<u8>),
    Entity,
    Control,
}

/// An inbound frame whose header has been decoded and whose body is being
/// consumed.
#[derive(Debug)]
pub struct ReceiveFrame {
    header: FrameHeader,
    body_remaining: usize,
    body: Body,
}

impl ReceiveFrame {
    pub fn new(header: FrameHeader) -> Self {
        let len = header.body_len as usize;
        let body = match header.frame_type {
            FrameType::PacketHeader => Body::PacketHeader(vec![0u8; len]),
            FrameType::PacketEntity => Body::Entity,
            FrameType::Cancel | FrameType::ReceiveReject | FrameType::Heartbeat => Body::Control,
        };
        Self {
            header,
            body_remaining: len,
            body,
        }
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    pub fn frame_type(&self) -> FrameType {
        self.header.frame_type
    }

    pub fn identifier(&self) -> u8 {
        self.header.identifier
    }

    pub fn body_remaining(&self) -> usize {
        self.body_remaining
    }

    pub fn is_complete(&self) -> bool {
        self.body_remaining == 0
    }

    /// Consume body bytes from a flipped buffer.
    ///
    /// Entity bytes go to `sink` when one is bound and are discarded
    /// otherwise. The bytes are accounted for even when the sink fails, so the
    /// frame stays aligned with the stream; the sink error is returned after.
    /// Returns whether the frame body is now complete.
    pub fn handle(&mut self, buf: &mut TransferBuffer, sink: Option<&mut dyn Write>) -> io::Result<bool> {
        let n = self.body_remaining.min(buf.remaining());
        let result = match &mut self.body {
            Body::PacketHeader(body) => {
                let offset = body.len() - self.body_remaining;
                body[offset..offset + n].copy_from_slice(&buf.as_slice()[..n]);
                Ok(())
            }
            Body::Entity => match sink {
                Some(sink) => sink.write_all(&buf.as_slice()[..n]),
                None => Ok(()),
            },
            Body::Control => Ok(()),
        };
        buf.set_empty(n);
        self.body_remaining -= n;
        result.map(|()| self.is_complete())
    }

    /// Decode the packet description of a completed packet-header frame.
    pub fn packet_info(&self) -> Option<Result<PacketInfo>> {
        match &self.body {
            Body::PacketHeader(body) if self.is_complete() => Some(PacketInfo::decode(body)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;
    use crate::packet::PacketKind;

    fn flipped(bytes: &[u8]) -> TransferBuffer {
        let mut buf = TransferBuffer::new(bytes.len().max(1));
        buf.start_writing();
        buf.read_from_slice(bytes);
        buf.finish_writing();
        buf
    }

    #[test]
    fn header_frame_body_assembles_across_buffers() {
        let info = PacketInfo {
            length: 42,
            kind: PacketKind::String,
            header_info: Some(b"hi".to_vec()),
        };
        let mut body = BytesMut::new();
        info.encode(&mut body).unwrap();
        let header = FrameHeader::new(body.len(), FrameType::PacketHeader, 8).unwrap();
        let mut frame = ReceiveFrame::new(header);

        let mut first = flipped(&body[..3]);
        assert!(!frame.handle(&mut first, None).unwrap());
        assert!(frame.packet_info().is_none());

        let mut rest = flipped(&body[3..]);
        assert!(frame.handle(&mut rest, None).unwrap());
        assert_eq!(frame.packet_info().unwrap().unwrap(), info);
    }

    #[test]
    fn entity_frame_writes_only_its_body() {
        let header = FrameHeader::new(4, FrameType::PacketEntity, 1).unwrap();
        let mut frame = ReceiveFrame::new(header);
        let mut buf = flipped(b"abcdNEXT");
        let mut sink = Vec::new();

        assert!(frame.handle(&mut buf, Some(&mut sink as &mut dyn Write)).unwrap());
        assert_eq!(sink, b"abcd");
        assert_eq!(buf.as_slice(), b"NEXT");
    }

    #[test]
    fn unbound_entity_is_discarded() {
        let header = FrameHeader::new(3, FrameType::PacketEntity, 1).unwrap();
        let mut frame = ReceiveFrame::new(header);
        let mut buf = flipped(b"xyz");
        assert!(frame.handle(&mut buf, None).unwrap());
        assert!(!buf.has_remaining());
    }

    #[test]
    fn failing_sink_still_consumes_bytes() {
        struct Full;
        impl Write for Full {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::Error::other("no space"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let header = FrameHeader::new(5, FrameType::PacketEntity, 2).unwrap();
        let mut frame = ReceiveFrame::new(header);
        let mut buf = flipped(b"12345");
        let mut sink = Full;
        assert!(frame.handle(&mut buf, Some(&mut sink as &mut dyn Write)).is_err());
        assert!(frame.is_complete());
        assert!(!buf.has_remaining());
    }

    #[test]
    fn control_frames_are_complete_immediately() {
        let decoded = FrameHeader::decode(&[0, 0, 41, 0, 3, 0]).unwrap();
        let frame = ReceiveFrame::new(decoded);
        assert!(frame.is_complete());
        assert_eq!(frame.frame_type(), FrameType::Cancel);
        assert_eq!(frame.identifier(), 3);
    }
}
