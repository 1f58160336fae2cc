use std::fs::File;
use std::io::{self, BufReader, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tracing::debug;

use crate::codec::{PacketInfo, MAX_PACKET_LEN};
use crate::error::{FrameError, Result};

static NEXT_PACKET_ID: AtomicU64 = AtomicU64::new(1);

/// Payload kind, carried as the packet type byte of a header frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Bytes = 1,
    String = 2,
    File = 3,
    Stream = 4,
}

impl TryFrom<u8> for PacketKind {
    type Error = FrameError;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(PacketKind::Bytes),
            2 => Ok(PacketKind::String),
            3 => Ok(PacketKind::File),
            4 => Ok(PacketKind::Stream),
            other => Err(FrameError::UnknownPacketType(other)),
        }
    }
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PacketKind::Bytes => "bytes",
            PacketKind::String => "string",
            PacketKind::File => "file",
            PacketKind::Stream => "stream",
        };
        f.write_str(name)
    }
}

/// Process-unique handle for an outgoing packet, used to cancel it and to
/// match completion callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketId(u64);

impl PacketId {
    fn next() -> Self {
        Self(NEXT_PACKET_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for PacketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pkt-{}", self.0)
    }
}

/// A live byte source of unknown total length.
///
/// `available` reports how many bytes can be read right now without the
/// stream ending; 0 ends the stream.
pub trait DirectSource: Read + Send {
    fn available(&mut self) -> io::Result<usize>;
}

impl<T: AsRef<[u8]> + Send> DirectSource for Cursor<T> {
    fn available(&mut self) -> io::Result<usize> {
        let len = self.get_ref().as_ref().len() as u64;
        Ok(len.saturating_sub(self.position()) as usize)
    }
}

enum SendSource {
    Memory(Bytes),
    File(PathBuf),
    Direct(Box<dyn DirectSource>),
}

/// The opened read side of a [`SendPacket`].
pub enum PacketStream {
    Memory(Cursor<Bytes>),
    File(BufReader<File>),
    Direct(Box<dyn DirectSource>),
}

impl PacketStream {
    /// Bytes readable without blocking (direct streams) or left to read.
    pub fn available(&mut self) -> io::Result<usize> {
        match self {
            PacketStream::Memory(cursor) => {
                let len = cursor.get_ref().len() as u64;
                Ok(len.saturating_sub(cursor.position()) as usize)
            }
            PacketStream::File(reader) => Ok(reader.buffer().len()),
            PacketStream::Direct(source) => source.available(),
        }
    }
}

impl Read for PacketStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            PacketStream::Memory(cursor) => cursor.read(buf),
            PacketStream::File(reader) => reader.read(buf),
            PacketStream::Direct(source) => source.read(buf),
        }
    }
}

/// An outgoing packet.
pub struct SendPacket {
    id: PacketId,
    kind: PacketKind,
    length: u64,
    header_info: Option<Vec<u8>>,
    source: Option<SendSource>,
    stream: Option<PacketStream>,
}

impl SendPacket {
    fn with_source(kind: PacketKind, length: u64, source: SendSource) -> Self {
        Self {
            id: PacketId::next(),
            kind,
            length,
            header_info: None,
            source: Some(source),
            stream: None,
        }
    }

    pub fn bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self::with_source(PacketKind::Bytes, data.len() as u64, SendSource::Memory(data))
    }

    /// UTF-8 text, sent as its encoded bytes.
    pub fn string(text: impl Into<String>) -> Self {
        let data = Bytes::from(text.into().into_bytes());
        Self::with_source(PacketKind::String, data.len() as u64, SendSource::Memory(data))
    }

    /// A file on disk; its current size is the declared length.
    pub fn file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let length = std::fs::metadata(&path)?.len();
        if length > MAX_PACKET_LEN {
            return Err(FrameError::PacketTooLarge {
                len: length,
                max: MAX_PACKET_LEN,
            });
        }
        Ok(Self::with_source(PacketKind::File, length, SendSource::File(path)))
    }

    /// A live stream that ends when its source reports nothing available.
    pub fn direct(source: Box<dyn DirectSource>) -> Self {
        Self::with_source(PacketKind::Stream, MAX_PACKET_LEN, SendSource::Direct(source))
    }

    /// Attach header extension bytes carried in the packet-header frame.
    pub fn with_header_info(mut self, header_info: impl Into<Vec<u8>>) -> Self {
        self.header_info = Some(header_info.into());
        self
    }

    pub fn id(&self) -> PacketId {
        self.id
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn header_info(&self) -> Option<&[u8]> {
        self.header_info.as_deref()
    }

    pub fn info(&self) -> PacketInfo {
        PacketInfo {
            length: self.length,
            kind: self.kind,
            header_info: self.header_info.clone(),
        }
    }

    /// Open the payload stream. Later calls return the same stream.
    pub fn open(&mut self) -> io::Result<&mut PacketStream> {
        if self.stream.is_none() {
            let stream = match self.source.take() {
                Some(SendSource::Memory(data)) => PacketStream::Memory(Cursor::new(data)),
                Some(SendSource::File(path)) => {
                    debug!(packet = %self.id, path = %path.display(), "opening send file");
                    PacketStream::File(BufReader::new(File::open(path)?))
                }
                Some(SendSource::Direct(source)) => PacketStream::Direct(source),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "packet stream already closed",
                    ))
                }
            };
            self.stream = Some(stream);
        }
        match self.stream.as_mut() {
            Some(stream) => Ok(stream),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    /// Release the payload stream.
    pub fn close(&mut self) {
        self.source = None;
        self.stream = None;
    }
}

impl std::fmt::Debug for SendPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendPacket")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("length", &self.length)
            .finish()
    }
}

/// The reconstructed payload of a received packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Bytes(Bytes),
    String(String),
    File(PathBuf),
    /// The bytes went to the application's writer.
    Stream,
}

/// A fully received packet as handed to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    pub kind: PacketKind,
    pub length: u64,
    pub header_info: Option<Vec<u8>>,
    pub entity: Entity,
}

impl ReceivedPacket {
    pub fn as_str(&self) -> Option<&str> {
        match &self.entity {
            Entity::String(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.entity {
            Entity::Bytes(data) => Some(data),
            Entity::String(text) => Some(text.as_bytes()),
            _ => None,
        }
    }
}

enum ReceiveSink {
    Memory(Vec<u8>),
    File {
        path: PathBuf,
        file: Option<BufWriter<File>>,
    },
    Direct(Box<dyn Write + Send>),
}

/// Receive-side packet: a write target that turns into an [`Entity`] once
/// closed.
pub struct ReceivePacket {
    kind: PacketKind,
    length: u64,
    header_info: Option<Vec<u8>>,
    sink: ReceiveSink,
}

// Memory packets grow past this as data arrives.
const MAX_PREALLOC: u64 = 1 << 20;

impl ReceivePacket {
    fn with_sink(kind: PacketKind, length: u64, header_info: Option<Vec<u8>>, sink: ReceiveSink) -> Self {
        Self {
            kind,
            length,
            header_info,
            sink,
        }
    }

    fn memory(kind: PacketKind, length: u64, header_info: Option<Vec<u8>>) -> Self {
        let buf = Vec::with_capacity(length.min(MAX_PREALLOC) as usize);
        Self::with_sink(kind, length, header_info, ReceiveSink::Memory(buf))
    }

    pub fn bytes(length: u64, header_info: Option<Vec<u8>>) -> Self {
        Self::memory(PacketKind::Bytes, length, header_info)
    }

    pub fn string(length: u64, header_info: Option<Vec<u8>>) -> Self {
        Self::memory(PacketKind::String, length, header_info)
    }

    /// Receive into `path`, created (or truncated) when the first bytes land.
    pub fn file(length: u64, header_info: Option<Vec<u8>>, path: PathBuf) -> Self {
        Self::with_sink(
            PacketKind::File,
            length,
            header_info,
            ReceiveSink::File { path, file: None },
        )
    }

    pub fn direct(length: u64, header_info: Option<Vec<u8>>, writer: Box<dyn Write + Send>) -> Self {
        Self::with_sink(PacketKind::Stream, length, header_info, ReceiveSink::Direct(writer))
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn header_info(&self) -> Option<&[u8]> {
        self.header_info.as_deref()
    }

    /// Open the write target. Later calls return the same target.
    pub fn open(&mut self) -> io::Result<&mut dyn Write> {
        match &mut self.sink {
            ReceiveSink::Memory(buf) => Ok(buf),
            ReceiveSink::File { path, file } => {
                if file.is_none() {
                    debug!(path = %path.display(), len = self.length, "creating receive file");
                    *file = Some(BufWriter::new(File::create(path.as_path())?));
                }
                match file.as_mut() {
                    Some(file) => Ok(file),
                    None => Err(io::Error::from(io::ErrorKind::NotConnected)),
                }
            }
            ReceiveSink::Direct(writer) => Ok(writer.as_mut()),
        }
    }

    /// Flush the target and build the entity.
    pub fn close(self) -> io::Result<ReceivedPacket> {
        let entity = match self.sink {
            ReceiveSink::Memory(buf) => match self.kind {
                PacketKind::String => Entity::String(String::from_utf8_lossy(&buf).into_owned()),
                _ => Entity::Bytes(Bytes::from(buf)),
            },
            ReceiveSink::File { path, file } => {
                match file {
                    Some(mut file) => file.flush()?,
                    // Zero-length file packets never open the target.
                    None => {
                        File::create(&path)?;
                    }
                }
                Entity::File(path)
            }
            ReceiveSink::Direct(mut writer) => {
                writer.flush()?;
                Entity::Stream
            }
        };
        Ok(ReceivedPacket {
            kind: self.kind,
            length: self.length,
            header_info: self.header_info,
            entity,
        })
    }
}

impl std::fmt::Debug for ReceivePacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivePacket")
            .field("kind", &self.kind)
            .field("length", &self.length)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_ids_are_unique() {
        let a = SendPacket::bytes(vec![1, 2, 3]);
        let b = SendPacket::bytes(vec![1, 2, 3]);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn string_packet_declares_encoded_length() {
        let packet = SendPacket::string("héllo");
        assert_eq!(packet.kind(), PacketKind::String);
        assert_eq!(packet.length(), "héllo".len() as u64);
    }

    #[test]
    fn open_is_idempotent() {
        let mut packet = SendPacket::bytes(b"abcdef".to_vec());
        let mut first = [0u8; 2];
        packet.open().unwrap().read_exact(&mut first).unwrap();
        let mut rest = Vec::new();
        packet.open().unwrap().read_to_end(&mut rest).unwrap();
        assert_eq!(&first, b"ab");
        assert_eq!(rest, b"cdef");
    }

    #[test]
    fn open_after_close_fails() {
        let mut packet = SendPacket::bytes(b"x".to_vec());
        packet.close();
        assert!(packet.open().is_err());
    }

    #[test]
    fn direct_source_available_tracks_position() {
        let mut source = Cursor::new(b"0123456789".to_vec());
        assert_eq!(source.available().unwrap(), 10);
        source.read_exact(&mut [0u8; 4]).unwrap();
        assert_eq!(source.available().unwrap(), 6);

        let packet = SendPacket::direct(Box::new(source));
        assert_eq!(packet.length(), MAX_PACKET_LEN);
        assert_eq!(packet.kind(), PacketKind::Stream);
    }

    #[test]
    fn string_entity_is_lossy_utf8() {
        let mut packet = ReceivePacket::string(3, None);
        packet.open().unwrap().write_all(&[b'o', b'k', 0xFF]).unwrap();
        let received = packet.close().unwrap();
        assert_eq!(received.as_str(), Some("ok\u{FFFD}"));
    }

    #[test]
    fn file_packet_roundtrip() {
        let dir = std::env::temp_dir().join(format!("pktwire-packet-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let src = dir.join("src.bin");
        let dst = dir.join("dst.bin");
        std::fs::write(&src, b"file payload").unwrap();

        let mut send = SendPacket::file(&src).unwrap();
        assert_eq!(send.length(), 12);
        let mut data = Vec::new();
        send.open().unwrap().read_to_end(&mut data).unwrap();

        let mut recv = ReceivePacket::file(12, Some(b"name".to_vec()), dst.clone());
        recv.open().unwrap().write_all(&data).unwrap();
        let received = recv.close().unwrap();
        assert_eq!(received.entity, Entity::File(dst.clone()));
        assert_eq!(received.header_info.as_deref(), Some(&b"name"[..]));
        assert_eq!(std::fs::read(&dst).unwrap(), b"file payload");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn packet_kind_tags() {
        for kind in [
            PacketKind::Bytes,
            PacketKind::String,
            PacketKind::File,
            PacketKind::Stream,
        ] {
            assert_eq!(PacketKind::try_from(kind as u8).unwrap(), kind);
        }
        assert!(matches!(
            PacketKind::try_from(0),
            Err(FrameError::UnknownPacketType(0))
        ));
    }
}
