//! Streaming frame reassembly
//!
//! A [`StreamProducer`] runs in the endpoint callback. It reassembles the
//! packets of one streaming endpoint into whole frames, each held in one
//! block of a [`BlockPool`], and sends each complete frame to the pool's
//! ready ring. A [`StreamConsumer`] receives frames in another context, and
//! releases them back to the pool.
//!
//! Each block starts with [`FRAME_META_LEN`] bytes of bookkeeping: the
//! frame's format tag and payload size, both `u32` little endian. The rest of
//! the block holds the payload.
//!
//! The producer never blocks, and never writes past the end of a block. When
//! there's no free block, or when the framing is malformed, the producer drops
//! the frame, and picks up again at the next frame boundary.
//!
//! A [`Framing`] describes how the wire protocol marks frames. This module
//! provides
//!
//! - [`UvcFraming`], for UVC payload headers on every packet.
//! - [`SizedFraming`], for an 8-byte header on the first packet that declares
//!   the frame's size.
//! - [`TransferFraming`], for frames that end with a short packet.

use crate::{
    mempool::{Block, BlockPool, Error, PoolConsumer, PoolProducer},
    osal::{Semaphore, Timeout},
};
use core::fmt;

/// Bookkeeping bytes at the start of every frame block
pub const FRAME_META_LEN: usize = 8;

/// A frame, held in one pool block
pub struct StreamFrame<'p> {
    block: Block<'p>,
}

impl<'p> StreamFrame<'p> {
    fn new(mut block: Block<'p>) -> Self {
        block[..FRAME_META_LEN].fill(0);
        StreamFrame { block }
    }

    /// The format tag recorded by the framing
    pub fn format(&self) -> u32 {
        let mut tag = [0; 4];
        tag.copy_from_slice(&self.block[..4]);
        u32::from_le_bytes(tag)
    }

    /// The number of payload bytes
    pub fn len(&self) -> usize {
        let mut size = [0; 4];
        size.copy_from_slice(&self.block[4..FRAME_META_LEN]);
        u32::from_le_bytes(size) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The largest payload this frame can hold
    pub fn capacity(&self) -> usize {
        self.block.len() - FRAME_META_LEN
    }

    /// The frame's payload
    pub fn payload(&self) -> &[u8] {
        let len = self.len().min(self.capacity());
        &self.block[FRAME_META_LEN..FRAME_META_LEN + len]
    }

    fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.block[FRAME_META_LEN..]
    }

    fn finish(&mut self, format: u32, len: usize) {
        self.block[..4].copy_from_slice(&format.to_le_bytes());
        self.block[4..FRAME_META_LEN].copy_from_slice(&(len as u32).to_le_bytes());
    }

    /// Release the underlying block
    pub fn into_block(self) -> Block<'p> {
        self.block
    }
}

impl fmt::Debug for StreamFrame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamFrame")
            .field("block", &self.block.index())
            .field("format", &self.format())
            .field("len", &self.len())
            .finish()
    }
}

/// One endpoint packet, as understood by a [`Framing`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'d> {
    /// Frame bytes carried by the packet.
    pub payload: &'d [u8],
    /// The packet starts a new frame, even though the previous frame never
    /// saw its end.
    pub restart: bool,
    /// The packet is the last of its frame.
    pub end: bool,
    /// The frame size declared by the wire protocol. Only meaningful on the
    /// first packet of a frame.
    pub total: Option<usize>,
    /// The frame's format tag. Only meaningful on the first packet of a
    /// frame.
    pub format: u32,
    /// The sender flagged the frame as bad. The packet's `restart` and `end`
    /// still mark frame boundaries.
    pub error: Option<FramingError>,
}

impl<'d> Packet<'d> {
    /// A packet that carries `payload`, and nothing else
    pub const fn data(payload: &'d [u8]) -> Self {
        Packet {
            payload,
            restart: false,
            end: false,
            total: None,
            format: 0,
            error: None,
        }
    }
}

/// Why a [`Framing`] rejected a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum FramingError {
    /// The packet's header is malformed.
    BadHeader,
    /// The sender flagged an error in this frame.
    Transmission,
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramingError::BadHeader => f.write_str("malformed payload header"),
            FramingError::Transmission => f.write_str("sender reported a frame error"),
        }
    }
}

/// How a wire protocol marks frame boundaries
pub trait Framing {
    /// Interpret one endpoint packet
    ///
    /// `first` indicates that the producer expects this packet to start a
    /// frame.
    fn parse<'d>(&mut self, data: &'d [u8], first: bool) -> Result<Packet<'d>, FramingError>;

    /// Indicates that a rejected packet still ends its frame, so the next
    /// packet starts a new one
    fn ends_transfer(&self, data: &[u8]) -> bool;

    /// Forget any state carried between packets
    fn reset(&mut self) {}
}

bitflags::bitflags! {
    /// UVC payload header `bmHeaderInfo`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderInfo : u8 {
        /// Frame ID. Toggles at each frame start.
        const FID = 1 << 0;
        /// End of frame.
        const EOF = 1 << 1;
        /// Presentation time follows.
        const PTS = 1 << 2;
        /// Source clock reference follows.
        const SCR = 1 << 3;
        /// Still image.
        const STI = 1 << 5;
        /// Error in the device's stream.
        const ERR = 1 << 6;
        /// End of header.
        const EOH = 1 << 7;
    }
}

/// UVC payload headers
///
/// Every packet starts with a header. A frame ends at a packet with `EOF`, or
/// when `FID` toggles.
#[derive(Debug, Clone)]
pub struct UvcFraming {
    format: u32,
    fid: Option<bool>,
}

impl UvcFraming {
    /// Tag each frame with `format`, usually the negotiated format index
    pub const fn new(format: u32) -> Self {
        UvcFraming { format, fid: None }
    }

    fn header(data: &[u8]) -> Option<(usize, HeaderInfo)> {
        let (&len, &info) = (data.first()?, data.get(1)?);
        let len = usize::from(len);
        let info = HeaderInfo::from_bits_retain(info);
        let mut minimum = 2;
        if info.contains(HeaderInfo::PTS) {
            minimum += 4;
        }
        if info.contains(HeaderInfo::SCR) {
            minimum += 6;
        }
        (minimum..=data.len()).contains(&len).then_some((len, info))
    }
}

impl Framing for UvcFraming {
    fn parse<'d>(&mut self, data: &'d [u8], _: bool) -> Result<Packet<'d>, FramingError> {
        if data.is_empty() {
            return Ok(Packet::data(data));
        }
        let (len, info) = Self::header(data).ok_or(FramingError::BadHeader)?;
        let fid = info.contains(HeaderInfo::FID);
        let restart = self.fid.is_some_and(|last| last != fid);
        self.fid = Some(fid);
        Ok(Packet {
            payload: &data[len..],
            restart,
            end: info.contains(HeaderInfo::EOF),
            total: None,
            format: self.format,
            error: info
                .contains(HeaderInfo::ERR)
                .then_some(FramingError::Transmission),
        })
    }

    fn ends_transfer(&self, data: &[u8]) -> bool {
        Self::header(data).is_some_and(|(_, info)| info.contains(HeaderInfo::EOF))
    }

    fn reset(&mut self) {
        self.fid = None;
    }
}

/// Frames that start with a size header
///
/// The first packet of a frame starts with 8 bytes: the format (`u16` LE),
/// two reserved bytes, and the payload size (`u32` LE). The frame ends once
/// the payload is complete, or at a short packet.
#[derive(Debug, Clone)]
pub struct SizedFraming {
    max_packet_size: usize,
}

/// Size of the [`SizedFraming`] header
pub const SIZED_HEADER_LEN: usize = 8;

impl SizedFraming {
    pub const fn new(max_packet_size: usize) -> Self {
        SizedFraming { max_packet_size }
    }

    /// Build the header that starts a frame
    pub fn header(format: u16, payload_total: u32) -> [u8; SIZED_HEADER_LEN] {
        let mut header = [0; SIZED_HEADER_LEN];
        header[..2].copy_from_slice(&format.to_le_bytes());
        header[4..].copy_from_slice(&payload_total.to_le_bytes());
        header
    }
}

impl Framing for SizedFraming {
    fn parse<'d>(&mut self, data: &'d [u8], first: bool) -> Result<Packet<'d>, FramingError> {
        let end = self.ends_transfer(data);
        if !first {
            return Ok(Packet {
                end,
                ..Packet::data(data)
            });
        }
        match *data {
            [f0, f1, _, _, t0, t1, t2, t3, ..] => Ok(Packet {
                payload: &data[SIZED_HEADER_LEN..],
                restart: false,
                end,
                total: Some(u32::from_le_bytes([t0, t1, t2, t3]) as usize),
                format: u32::from(u16::from_le_bytes([f0, f1])),
                error: None,
            }),
            // A zero-length packet between frames
            [] => Ok(Packet::data(data)),
            _ => Err(FramingError::BadHeader),
        }
    }

    fn ends_transfer(&self, data: &[u8]) -> bool {
        data.len() < self.max_packet_size
    }
}

/// Frames that end with a short packet, and no header
#[derive(Debug, Clone)]
pub struct TransferFraming {
    max_packet_size: usize,
    format: u32,
}

impl TransferFraming {
    pub const fn new(max_packet_size: usize, format: u32) -> Self {
        TransferFraming {
            max_packet_size,
            format,
        }
    }
}

impl Framing for TransferFraming {
    fn parse<'d>(&mut self, data: &'d [u8], _: bool) -> Result<Packet<'d>, FramingError> {
        Ok(Packet {
            end: self.ends_transfer(data),
            format: self.format,
            ..Packet::data(data)
        })
    }

    fn ends_transfer(&self, data: &[u8]) -> bool {
        data.len() < self.max_packet_size
    }
}

/// Producer reassembly state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum StreamState {
    /// The next packet starts a frame.
    AwaitingFrameStart,
    /// Appending packets to the current frame.
    Accumulating,
    /// Discarding packets until the next frame boundary.
    Dropping,
}

/// Producer counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct StreamStats {
    /// Frames sent to the consumer.
    pub frames: u32,
    /// Frames dropped for lack of a free block.
    pub dropped: u32,
    /// Frames dropped for malformed framing, or overflow.
    pub errors: u32,
}

/// Reassembles endpoint packets into frames
pub struct StreamProducer<'p, 'a, S, F> {
    pool: PoolProducer<'p, 'a, S>,
    framing: F,
    /// Allocated ahead of the frame's first packet.
    frame: Option<StreamFrame<'p>>,
    state: StreamState,
    offset: usize,
    total: Option<usize>,
    format: u32,
    stats: StreamStats,
}

impl<'p, 'a, S: Semaphore, F: Framing> StreamProducer<'p, 'a, S, F> {
    /// Feed frames from `framing` into the pool
    ///
    /// Fails if the pool's blocks can't hold a payload after the frame
    /// bookkeeping.
    pub fn new(mut pool: PoolProducer<'p, 'a, S>, framing: F) -> Result<Self, Error> {
        if pool.block_size() <= FRAME_META_LEN {
            return Err(Error::InvalidBlockSize(pool.block_size()));
        }
        let frame = pool.alloc().map(StreamFrame::new);
        Ok(StreamProducer {
            pool,
            framing,
            frame,
            state: StreamState::AwaitingFrameStart,
            offset: 0,
            total: None,
            format: 0,
            stats: StreamStats::default(),
        })
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    /// The payload capacity of each frame
    pub fn frame_capacity(&self) -> usize {
        self.pool.block_size() - FRAME_META_LEN
    }

    /// Drop the frame in progress, and expect a frame start
    ///
    /// Call this when the stream is reconfigured. The producer keeps its
    /// block for the next frame.
    pub fn reset(&mut self) {
        self.framing.reset();
        self.offset = 0;
        self.total = None;
        self.state = StreamState::AwaitingFrameStart;
    }

    /// Process one packet received on the streaming endpoint
    pub fn packet(&mut self, data: &[u8]) {
        let first = self.state == StreamState::AwaitingFrameStart;
        let packet = match self.framing.parse(data, first) {
            Ok(packet) => packet,
            Err(_err) => {
                warn!("STREAM FRAMING ERROR {}", _err as u8);
                let end = self.framing.ends_transfer(data);
                self.fail(end);
                return;
            }
        };

        if packet.restart {
            match self.state {
                // The previous frame had no end marker.
                StreamState::Accumulating => self.complete(),
                StreamState::Dropping => self.state = StreamState::AwaitingFrameStart,
                StreamState::AwaitingFrameStart => {}
            }
        }

        if let Some(_err) = packet.error {
            warn!("STREAM FRAMING ERROR {}", _err as u8);
            self.fail(packet.end);
            return;
        }

        match self.state {
            StreamState::Dropping => {
                if packet.end {
                    self.state = StreamState::AwaitingFrameStart;
                }
                return;
            }
            StreamState::AwaitingFrameStart => {
                if packet.payload.is_empty() && packet.total.is_none() {
                    return;
                }
                if !self.start(&packet) {
                    return;
                }
            }
            StreamState::Accumulating => {}
        }

        if !self.append(packet.payload) {
            self.fail(packet.end);
            return;
        }

        let counted = self.total.is_some_and(|total| self.offset >= total);
        if packet.end && !counted && self.total.is_some() {
            warn!("STREAM FRAME TRUNCATED {} OF {}", self.offset, self.total.unwrap_or(0));
            self.fail(true);
        } else if packet.end || counted {
            self.complete();
        }
    }

    /// Begin a frame with its first packet. Returns `false` if the frame is
    /// dropped.
    fn start(&mut self, packet: &Packet<'_>) -> bool {
        if self.frame.is_none() {
            self.frame = self.pool.alloc().map(StreamFrame::new);
        }
        if self.frame.is_none() {
            trace!("STREAM NO FREE BLOCK");
            self.stats.dropped = self.stats.dropped.wrapping_add(1);
            self.state = if packet.end {
                StreamState::AwaitingFrameStart
            } else {
                StreamState::Dropping
            };
            return false;
        }
        if let Some(total) = packet.total {
            if total > self.frame_capacity() {
                warn!("STREAM FRAME TOO LARGE {} > {}", total, self.frame_capacity());
                self.fail(packet.end);
                return false;
            }
        }
        self.offset = 0;
        self.total = packet.total;
        self.format = packet.format;
        self.state = StreamState::Accumulating;
        true
    }

    /// Returns `false` if the payload doesn't fit.
    fn append(&mut self, payload: &[u8]) -> bool {
        let Some(frame) = self.frame.as_mut() else {
            return false;
        };
        let buffer = frame.buffer_mut();
        let end = self.offset + payload.len();
        if end > buffer.len() || self.total.is_some_and(|total| end > total) {
            warn!("STREAM FRAME OVERFLOW {}", end);
            return false;
        }
        buffer[self.offset..end].copy_from_slice(payload);
        self.offset = end;
        true
    }

    fn complete(&mut self) {
        self.state = StreamState::AwaitingFrameStart;
        let Some(mut frame) = self.frame.take() else {
            return;
        };
        frame.finish(self.format, self.offset);
        self.offset = 0;
        self.total = None;
        match self.pool.send(frame.into_block()) {
            Ok(()) => {
                self.stats.frames = self.stats.frames.wrapping_add(1);
                trace!("STREAM FRAME {}", self.stats.frames);
            }
            Err(_) => {
                error!("STREAM SEND FAILED");
                self.stats.errors = self.stats.errors.wrapping_add(1);
            }
        }
        self.frame = self.pool.alloc().map(StreamFrame::new);
    }

    /// Abandon the current frame. The block stays with the producer.
    fn fail(&mut self, end: bool) {
        self.stats.errors = self.stats.errors.wrapping_add(1);
        self.offset = 0;
        self.total = None;
        self.state = if end {
            StreamState::AwaitingFrameStart
        } else {
            StreamState::Dropping
        };
    }
}

/// Receives complete frames
pub struct StreamConsumer<'p, 'a, S> {
    pool: PoolConsumer<'p, 'a, S>,
}

impl<'p, 'a, S: Semaphore> StreamConsumer<'p, 'a, S> {
    pub fn new(pool: PoolConsumer<'p, 'a, S>) -> Self {
        StreamConsumer { pool }
    }

    /// Wait for the next complete frame
    ///
    /// Frames arrive in the order the producer completed them.
    pub fn recv(&mut self, timeout: Timeout) -> Result<StreamFrame<'p>, Error> {
        self.pool.recv(timeout).map(|block| StreamFrame { block })
    }

    /// Return a frame to the pool
    pub fn release(&mut self, frame: StreamFrame<'p>) -> Result<(), Error> {
        self.pool.free(frame.into_block())
    }

    /// The number of frames waiting for `recv()`
    pub fn pending(&self) -> usize {
        self.pool.ready_count()
    }
}

/// Split `pool` into a frame producer using `framing`, and a frame consumer
pub fn stream<'p, 'a, S: Semaphore, F: Framing>(
    pool: &'p mut BlockPool<'a, S>,
    framing: F,
) -> Result<(StreamProducer<'p, 'a, S, F>, StreamConsumer<'p, 'a, S>), Error> {
    let (producer, consumer) = pool.split();
    Ok((
        StreamProducer::new(producer, framing)?,
        StreamConsumer::new(consumer),
    ))
}
