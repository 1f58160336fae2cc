//! Receive-side frame consumer: decodes frames from inbound buffers and
//! reassembles packets, demultiplexed by frame identifier.

use std::collections::HashMap;
use std::io;

use pktwire_frame::{
    FrameError, FrameHeader, FrameType, PacketKind, ReceiveFrame, ReceivePacket, HEADER_SIZE,
};
use pktwire_transport::TransferBuffer;
use tracing::{debug, trace, warn};

/// Supplies receive packets and takes them back once they end.
pub trait ReceivePacketProvider {
    /// A packet was announced. `None` refuses it; its frames are then skipped.
    fn take_packet(&mut self, kind: PacketKind, length: u64, header_info: Option<&[u8]>) -> Option<ReceivePacket>;

    /// The packet finished (`ok`) or was cancelled or broken.
    fn completed_packet(&mut self, packet: ReceivePacket, ok: bool);

    fn on_heartbeat(&mut self);
}

struct PacketModel {
    packet: ReceivePacket,
    remaining: u64,
}

pub struct PacketWriter {
    models: HashMap<u8, PacketModel>,
    frame: Option<ReceiveFrame>,
    header: [u8; HEADER_SIZE],
    header_len: usize,
}

impl Default for PacketWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketWriter {
    pub fn new() -> Self {
        Self {
            models: HashMap::new(),
            frame: None,
            header: [0; HEADER_SIZE],
            header_len: 0,
        }
    }

    /// Packets currently being reassembled.
    pub fn in_progress(&self) -> usize {
        self.models.len()
    }

    /// Open `buf` for the next read, bounded to what the current frame (or
    /// the next frame header) still needs.
    pub fn prepare(&self, buf: &mut TransferBuffer) {
        let limit = match &self.frame {
            Some(frame) => frame.body_remaining(),
            None => HEADER_SIZE - self.header_len,
        };
        buf.limit(limit);
        buf.start_writing();
    }

    /// Consume every byte of a flipped buffer. A protocol violation is
    /// returned as an error and leaves the stream unusable.
    pub fn consume(
        &mut self,
        buf: &mut TransferBuffer,
        provider: &mut impl ReceivePacketProvider,
    ) -> Result<(), FrameError> {
        while buf.has_remaining() {
            let Some(frame) = self.frame.as_mut() else {
                self.header_len += buf.write_to_slice(&mut self.header[self.header_len..]);
                if self.header_len < HEADER_SIZE {
                    break;
                }
                self.header_len = 0;
                let frame = ReceiveFrame::new(FrameHeader::decode(&self.header)?);
                trace!(
                    frame_type = ?frame.frame_type(),
                    identifier = frame.identifier(),
                    len = frame.body_remaining(),
                    "frame header"
                );
                if frame.is_complete() {
                    self.on_frame_complete(frame, provider)?;
                } else {
                    self.frame = Some(frame);
                }
                continue;
            };

            let identifier = frame.identifier();
            let is_entity = frame.frame_type() == FrameType::PacketEntity;
            let model = if is_entity {
                self.models.get_mut(&identifier)
            } else {
                None
            };

            let before = buf.remaining();
            let (done, error) = match model {
                Some(model) => {
                    let (done, error) = feed(frame, buf, Some(&mut model.packet));
                    let consumed = (before - buf.remaining()) as u64;
                    model.remaining = model.remaining.saturating_sub(consumed);
                    (done, error)
                }
                None => feed(frame, buf, None),
            };

            if let Some(error) = error {
                warn!(identifier, %error, "failed to store packet data; dropping packet");
                if let Some(model) = self.models.remove(&identifier) {
                    provider.completed_packet(model.packet, false);
                }
            }
            if done {
                if let Some(frame) = self.frame.take() {
                    self.on_frame_complete(frame, provider)?;
                }
            }
        }
        Ok(())
    }

    fn on_frame_complete(
        &mut self,
        frame: ReceiveFrame,
        provider: &mut impl ReceivePacketProvider,
    ) -> Result<(), FrameError> {
        let identifier = frame.identifier();
        match frame.frame_type() {
            FrameType::PacketHeader => {
                let info = match frame.packet_info() {
                    Some(info) => info?,
                    None => return Ok(()),
                };
                if let Some(stale) = self.models.remove(&identifier) {
                    warn!(identifier, "identifier reused before packet ended");
                    provider.completed_packet(stale.packet, false);
                }
                match provider.take_packet(info.kind, info.length, info.header_info.as_deref()) {
                    Some(packet) => {
                        debug!(identifier, kind = %info.kind, len = info.length, "receiving packet");
                        self.models.insert(
                            identifier,
                            PacketModel {
                                packet,
                                remaining: info.length,
                            },
                        );
                    }
                    None => {
                        warn!(identifier, kind = %info.kind, len = info.length, "receive packet refused");
                    }
                }
            }
            FrameType::PacketEntity => {
                let finished = self
                    .models
                    .get(&identifier)
                    .is_some_and(|model| model.remaining == 0);
                if finished {
                    if let Some(model) = self.models.remove(&identifier) {
                        debug!(identifier, "packet received");
                        provider.completed_packet(model.packet, true);
                    }
                }
            }
            FrameType::Cancel | FrameType::ReceiveReject => {
                if let Some(model) = self.models.remove(&identifier) {
                    // A cancel is the natural end of a direct stream.
                    let ok = frame.frame_type() == FrameType::Cancel
                        && model.packet.kind() == PacketKind::Stream;
                    debug!(identifier, ok, "packet ended by peer");
                    provider.completed_packet(model.packet, ok);
                }
            }
            FrameType::Heartbeat => provider.on_heartbeat(),
        }
        Ok(())
    }

    /// Fail every packet still being reassembled.
    pub fn close(&mut self, provider: &mut impl ReceivePacketProvider) {
        self.frame = None;
        self.header_len = 0;
        for (_, model) in self.models.drain() {
            provider.completed_packet(model.packet, false);
        }
    }
}

/// Feed one frame, reporting completion and any sink failure separately.
fn feed(
    frame: &mut ReceiveFrame,
    buf: &mut TransferBuffer,
    packet: Option<&mut ReceivePacket>,
) -> (bool, Option<io::Error>) {
    let (sink, open_error) = match packet.map(|packet| packet.open()) {
        Some(Ok(sink)) => (Some(sink), None),
        Some(Err(error)) => (None, Some(error)),
        None => (None, None),
    };
    match frame.handle(buf, sink) {
        Ok(done) => (done, open_error),
        Err(error) => (frame.is_complete(), Some(error)),
    }
}
