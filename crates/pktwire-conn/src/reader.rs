//! Send-side frame producer: turns queued packets into prioritized frames and
//! fills transfer buffers from them.

use pktwire_frame::{
    Advance, FrameType, PacketId, PriorityList, SendFrame, SendPacket, StreamFault, MAX_IDENTIFIER,
    PRIORITY_CONTROL,
};
use pktwire_transport::TransferBuffer;
use tracing::{debug, warn};

/// The outbound packet queue a [`PacketReader`] pulls from.
pub trait PacketSource {
    fn take_packet(&mut self) -> Option<SendPacket>;

    /// The packet left the frame list, fully sent (`ok`) or not.
    fn completed(&mut self, packet: SendPacket, ok: bool);
}

pub struct PacketReader {
    frames: PriorityList<SendFrame>,
    last_identifier: u8,
    in_flight: usize,
    max_in_flight: usize,
    max_entity_body: usize,
}

impl PacketReader {
    pub fn new(max_in_flight: usize, max_entity_body: usize) -> Self {
        Self {
            frames: PriorityList::new(),
            last_identifier: 0,
            in_flight: 0,
            max_in_flight: max_in_flight.clamp(1, MAX_IDENTIFIER as usize),
            max_entity_body,
        }
    }

    /// Number of queued frames, including the one being written.
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Packets with frames in the list.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn has_pending(&self) -> bool {
        !self.frames.is_empty()
    }

    /// Pull packets until the in-flight bound is reached. Returns whether any
    /// frame is waiting to be written.
    pub fn request_take_packet(&mut self, source: &mut impl PacketSource) -> bool {
        while self.in_flight < self.max_in_flight {
            let Some(packet) = source.take_packet() else {
                break;
            };
            let identifier = self.next_identifier();
            match SendFrame::packet_header(identifier, packet) {
                Ok(frame) => {
                    debug!(
                        identifier,
                        packet = %frame.packet().map(|p| p.id().to_string()).unwrap_or_default(),
                        "queued packet header"
                    );
                    self.frames.push(frame.priority(), frame);
                    self.in_flight += 1;
                }
                Err(StreamFault { packet, error }) => {
                    warn!(packet = %packet.id(), %error, "packet cannot be framed");
                    source.completed(packet, false);
                }
            }
        }
        self.has_pending()
    }

    /// Fill `buf` from the head frame. Returns `false` when there is nothing
    /// to send; otherwise `buf` is flipped and holds at least one byte.
    pub fn fill_data(&mut self, buf: &mut TransferBuffer, source: &mut impl PacketSource) -> bool {
        let Some(frame) = self.frames.head_mut() else {
            return false;
        };

        match frame.handle(buf) {
            Ok(false) => {}
            Ok(true) => {
                if let Some(frame) = self.frames.pop_head() {
                    self.advance(frame, source);
                }
            }
            Err(StreamFault { packet, error }) => {
                let identifier = frame.identifier();
                let finished = frame.is_finished();
                warn!(packet = %packet.id(), identifier, %error, "packet stream failed");
                self.fail(packet, identifier, source);
                if finished {
                    // An aborted frame has no continuation.
                    self.frames.pop_head();
                    self.refill(source);
                }
            }
        }
        buf.has_remaining()
    }

    fn advance(&mut self, frame: SendFrame, source: &mut impl PacketSource) {
        let identifier = frame.identifier();
        match frame.next_frame(self.max_entity_body) {
            Ok(Advance { next, completed }) => {
                if let Some(next) = next {
                    self.frames.push(next.priority(), next);
                }
                if let Some(packet) = completed {
                    debug!(packet = %packet.id(), identifier, "packet sent");
                    self.in_flight -= 1;
                    source.completed(packet, true);
                }
            }
            Err(StreamFault { packet, error }) => {
                warn!(packet = %packet.id(), identifier, %error, "packet stream failed");
                self.fail(packet, identifier, source);
            }
        }
        self.refill(source);
    }

    fn fail(&mut self, mut packet: SendPacket, identifier: u8, source: &mut impl PacketSource) {
        packet.close();
        self.frames.push(PRIORITY_CONTROL, SendFrame::cancel(identifier));
        self.in_flight -= 1;
        source.completed(packet, false);
    }

    fn refill(&mut self, source: &mut impl PacketSource) {
        if self.in_flight < self.max_in_flight {
            self.request_take_packet(source);
        }
    }

    /// Cancel a packet that already has frames in the list.
    ///
    /// An unstarted header frame is dropped silently since the receiver never
    /// heard of the packet. Any other frame is dropped (unstarted) or
    /// dirty-filled to its declared length (started), and a cancel frame
    /// tells the receiver to discard the partial packet.
    pub fn cancel(&mut self, id: PacketId, source: &mut impl PacketSource) -> bool {
        let Some(index) = self
            .frames
            .position(|frame| frame.packet().is_some_and(|p| p.id() == id))
        else {
            return false;
        };

        let Some(frame) = self.frames.get_mut(index) else {
            return false;
        };
        let identifier = frame.identifier();
        let (packet, needs_cancel_frame) = if frame.is_started() {
            (frame.abort(), true)
        } else {
            let is_header = frame.frame_type() == FrameType::PacketHeader;
            let packet = self.frames.remove(index).and_then(|mut frame| frame.abort());
            (packet, !is_header)
        };

        let Some(mut packet) = packet else {
            return false;
        };
        debug!(packet = %id, identifier, needs_cancel_frame, "cancelled in-flight packet");
        packet.close();
        if needs_cancel_frame {
            self.frames.push(PRIORITY_CONTROL, SendFrame::cancel(identifier));
        }
        self.in_flight -= 1;
        source.completed(packet, false);
        self.refill(source);
        true
    }

    /// Queue a heartbeat unless data is queued or a heartbeat is already waiting.
    pub fn request_send_heartbeat(&mut self, queue_is_empty: bool) -> bool {
        if !queue_is_empty {
            return false;
        }
        if self
            .frames
            .iter()
            .any(|frame| frame.frame_type() == FrameType::Heartbeat)
        {
            return false;
        }
        self.frames.push(PRIORITY_CONTROL, SendFrame::heartbeat());
        true
    }

    /// Drop every frame, failing the packets they carried.
    pub fn close(&mut self, source: &mut impl PacketSource) {
        let packets: Vec<SendPacket> = self
            .frames
            .drain()
            .filter_map(|mut frame| frame.abort())
            .collect();
        self.in_flight = 0;
        for mut packet in packets {
            packet.close();
            source.completed(packet, false);
        }
    }

    fn next_identifier(&mut self) -> u8 {
        loop {
            self.last_identifier = if self.last_identifier >= MAX_IDENTIFIER {
                1
            } else {
                self.last_identifier + 1
            };
            let candidate = self.last_identifier;
            let in_use = self
                .frames
                .iter()
                .any(|frame| frame.packet().is_some() && frame.identifier() == candidate);
            if !in_use {
                return candidate;
            }
        }
    }
}
