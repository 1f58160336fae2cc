//! Send-side frame state machines.
//!
//! A frame owns the packet it carries while it is on the wire. Completing a
//! frame hands the packet to the frame that continues it, or back to the
//! caller once the last entity frame is out.

use std::io;

use bytes::BytesMut;
use pktwire_transport::TransferBuffer;
use tracing::debug;

use crate::codec::{FrameHeader, FrameType, HEADER_SIZE, MAX_BODY_LEN};
use crate::packet::{PacketKind, SendPacket};

/// Priority of control frames (cancel, heartbeat).
pub const PRIORITY_CONTROL: u8 = 0;
/// Priority of packet data frames (header, entity).
pub const PRIORITY_DATA: u8 = 1;

/// A packet aborted because its payload stream failed.
#[derive(Debug)]
pub struct StreamFault {
    pub packet: SendPacket,
    pub error: io::Error,
}

/// What follows a completed frame.
#[derive(Debug, Default)]
pub struct Advance {
    /// The next frame of the same packet, if any.
    pub next: Option<SendFrame>,
    /// The packet, once its last frame has completed.
    pub completed: Option<SendPacket>,
}

#[derive(Debug)]
enum Body {
    PacketHeader {
        body: Vec<u8>,
        packet: Option<SendPacket>,
    },
    Entity {
        packet: Option<SendPacket>,
        after: u64,
    },
    DirectEntity {
        packet: Option<SendPacket>,
    },
    Cancel,
    Heartbeat,
}

/// One outgoing frame with its header and body progress.
#[derive(Debug)]
pub struct SendFrame {
    header: [u8; HEADER_SIZE],
    identifier: u8,
    header_remaining: usize,
    body_remaining: usize,
    body: Body,
}

impl SendFrame {
    /// The packet-header frame that opens `packet` on the wire.
    ///
    /// A packet whose description cannot be encoded is handed back.
    pub fn packet_header(identifier: u8, packet: SendPacket) -> std::result::Result<Self, StreamFault> {
        let info = packet.info();
        let mut body = BytesMut::with_capacity(info.body_len());
        if let Err(err) = info.encode(&mut body) {
            let error = io::Error::new(io::ErrorKind::InvalidInput, err);
            return Err(StreamFault { packet, error });
        }
        let body = body.to_vec();
        let len = body.len();
        let header = match FrameHeader::new(len, FrameType::PacketHeader, identifier) {
            Ok(header) => header,
            Err(err) => {
                let error = io::Error::new(io::ErrorKind::InvalidInput, err);
                return Err(StreamFault { packet, error });
            }
        };
        Ok(Self {
            header: header.to_bytes(),
            identifier,
            header_remaining: HEADER_SIZE,
            body_remaining: len,
            body: Body::PacketHeader {
                body,
                packet: Some(packet),
            },
        })
    }

    fn entity(identifier: u8, packet: SendPacket, remaining: u64, max_body: usize) -> Self {
        let len = remaining.min(max_body as u64) as usize;
        let after = remaining - len as u64;
        Self {
            header: entity_header(len, identifier),
            identifier,
            header_remaining: HEADER_SIZE,
            body_remaining: len,
            body: Body::Entity {
                packet: Some(packet),
                after,
            },
        }
    }

    fn direct_entity(
        identifier: u8,
        mut packet: SendPacket,
        max_body: usize,
    ) -> std::result::Result<Advance, StreamFault> {
        let available = match packet.open().and_then(|stream| stream.available()) {
            Ok(available) => available,
            Err(error) => return Err(StreamFault { packet, error }),
        };
        if available == 0 {
            // Stream drained: a cancel frame ends it on the wire.
            return Ok(Advance {
                next: Some(Self::cancel(identifier)),
                completed: Some(packet),
            });
        }
        let len = available.min(max_body);
        Ok(Advance {
            next: Some(Self {
                header: entity_header(len, identifier),
                identifier,
                header_remaining: HEADER_SIZE,
                body_remaining: len,
                body: Body::DirectEntity {
                    packet: Some(packet),
                },
            }),
            completed: None,
        })
    }

    pub fn cancel(identifier: u8) -> Self {
        Self::control(FrameType::Cancel, identifier, Body::Cancel)
    }

    pub fn heartbeat() -> Self {
        Self::control(FrameType::Heartbeat, 0, Body::Heartbeat)
    }

    fn control(frame_type: FrameType, identifier: u8, body: Body) -> Self {
        let len = 0u16.to_be_bytes();
        Self {
            header: [len[0], len[1], frame_type as u8, 0, identifier, 0],
            identifier,
            header_remaining: HEADER_SIZE,
            body_remaining: 0,
            body,
        }
    }

    pub fn identifier(&self) -> u8 {
        self.identifier
    }

    pub fn frame_type(&self) -> FrameType {
        match self.body {
            Body::PacketHeader { .. } => FrameType::PacketHeader,
            Body::Entity { .. } | Body::DirectEntity { .. } => FrameType::PacketEntity,
            Body::Cancel => FrameType::Cancel,
            Body::Heartbeat => FrameType::Heartbeat,
        }
    }

    pub fn priority(&self) -> u8 {
        match self.body {
            Body::Cancel | Body::Heartbeat => PRIORITY_CONTROL,
            _ => PRIORITY_DATA,
        }
    }

    /// Declared body length of this frame.
    pub fn body_len(&self) -> usize {
        u16::from_be_bytes([self.header[0], self.header[1]]) as usize
    }

    /// Whether any byte of this frame has been written out.
    pub fn is_started(&self) -> bool {
        self.header_remaining < HEADER_SIZE
    }

    pub fn is_finished(&self) -> bool {
        self.header_remaining == 0 && self.body_remaining == 0
    }

    /// The packet this frame belongs to, if it still carries one.
    pub fn packet(&self) -> Option<&SendPacket> {
        match &self.body {
            Body::PacketHeader { packet, .. }
            | Body::Entity { packet, .. }
            | Body::DirectEntity { packet } => packet.as_ref(),
            Body::Cancel | Body::Heartbeat => None,
        }
    }

    /// Detach the packet. The rest of the declared body is then sent as
    /// zero filler.
    pub fn abort(&mut self) -> Option<SendPacket> {
        match &mut self.body {
            Body::PacketHeader { packet, .. }
            | Body::Entity { packet, .. }
            | Body::DirectEntity { packet } => {
                let packet = packet.take();
                if let Some(packet) = &packet {
                    debug!(packet = %packet.id(), kind = %packet.kind(), "frame aborted");
                }
                packet
            }
            Body::Cancel | Body::Heartbeat => None,
        }
    }

    /// Copy as much of this frame into `buf` as fits, leaving `buf` flipped
    /// for draining. Returns whether the frame is now fully written.
    ///
    /// A payload read error aborts the packet: the frame dirty-fills its
    /// remaining body and the packet is returned in the fault.
    pub fn handle(&mut self, buf: &mut TransferBuffer) -> std::result::Result<bool, StreamFault> {
        buf.limit(self.header_remaining + self.body_remaining);
        buf.start_writing();

        if self.header_remaining > 0 && buf.has_remaining() {
            let offset = HEADER_SIZE - self.header_remaining;
            self.header_remaining -= buf.read_from_slice(&self.header[offset..]);
        }

        let mut fault = None;
        if self.header_remaining == 0 && self.body_remaining > 0 && buf.has_remaining() {
            let before = buf.remaining();
            let result = self.consume_body(buf);
            self.body_remaining -= before - buf.remaining();
            if let Err(error) = result {
                if let Some(packet) = self.abort() {
                    fault = Some(StreamFault { packet, error });
                }
                self.body_remaining -= buf.fill_empty(self.body_remaining);
            }
        }

        buf.finish_writing();
        match fault {
            Some(fault) => Err(fault),
            None => Ok(self.is_finished()),
        }
    }

    fn consume_body(&mut self, buf: &mut TransferBuffer) -> io::Result<()> {
        let remaining = self.body_remaining;
        match &mut self.body {
            Body::PacketHeader { body, .. } => {
                let offset = body.len() - remaining;
                buf.read_from_slice(&body[offset..]);
                Ok(())
            }
            Body::Entity { packet, .. } | Body::DirectEntity { packet } => match packet {
                Some(packet) => {
                    let stream = packet.open()?;
                    buf.read_from(stream).map(|_| ())
                }
                None => {
                    buf.fill_empty(remaining);
                    Ok(())
                }
            },
            Body::Cancel | Body::Heartbeat => Ok(()),
        }
    }

    /// Consume a finished frame and work out what follows it.
    pub fn next_frame(self, max_body: usize) -> std::result::Result<Advance, StreamFault> {
        let max_body = max_body.clamp(1, MAX_BODY_LEN);
        let identifier = self.identifier;
        match self.body {
            Body::PacketHeader {
                packet: Some(mut packet),
                ..
            } => {
                if let Err(error) = packet.open() {
                    return Err(StreamFault { packet, error });
                }
                if packet.kind() == PacketKind::Stream {
                    return Self::direct_entity(identifier, packet, max_body);
                }
                let length = packet.length();
                Ok(Advance {
                    next: Some(Self::entity(identifier, packet, length, max_body)),
                    completed: None,
                })
            }
            Body::Entity {
                packet: Some(packet),
                after,
            } => {
                if after == 0 {
                    Ok(Advance {
                        next: None,
                        completed: Some(packet),
                    })
                } else {
                    Ok(Advance {
                        next: Some(Self::entity(identifier, packet, after, max_body)),
                        completed: None,
                    })
                }
            }
            Body::DirectEntity {
                packet: Some(packet),
            } => Self::direct_entity(identifier, packet, max_body),
            _ => Ok(Advance::default()),
        }
    }
}

fn entity_header(len: usize, identifier: u8) -> [u8; HEADER_SIZE] {
    let len = (len as u16).to_be_bytes();
    [len[0], len[1], FrameType::PacketEntity as u8, 0, identifier, 0]
}
