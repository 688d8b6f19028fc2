//! In-memory packet stream shared by every traced thread.
//!
//! A packet is an 8-byte header followed by its payload:
//!
//! ```text
//!   0        2          4                  8
//!   +--------+----------+------------------+-------------...
//!   |  type  | reserved |   payload size   |  payload
//!   +--------+----------+------------------+-------------...
//! ```
//!
//! All fields are little-endian and every packet starts 4-byte aligned. Space is claimed
//! by a compare-and-swap on a single cursor, so packets appear in claim order and the
//! arena never grows.

use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

pub const HEADER_SIZE: usize = 8;
pub const PACKET_ALIGNMENT: usize = 4;

#[repr(u16)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PacketType {
    Invalid = 0,

    /// Full copy of the registered globals, laid out by offset.
    SaveState = 1,

    BeginEvent = 2,
    EndEvent = 3,

    /// A detected change to a registered global. See [`WritePacket`].
    Write = 4,
}

impl PacketType {
    pub fn from_raw(raw: u16) -> Option<Self> {
        let ty = match raw {
            0 => PacketType::Invalid,
            1 => PacketType::SaveState,
            2 => PacketType::BeginEvent,
            3 => PacketType::EndEvent,
            4 => PacketType::Write,
            _ => return None,
        };

        Some(ty)
    }
}

/// Identifies what an event span measures.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct EventType(pub u16);

impl EventType {
    pub const INSTRUCTION_EXECUTED: EventType = EventType(0);
}

/// Groups events into independent timelines.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Channel(pub u8);

impl Channel {
    pub const MAIN: Channel = Channel(0);
    pub const INSTRUCTIONS_EXECUTED: Channel = Channel(1);
}

/// Payload of `BeginEvent` and `EndEvent` packets.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EventPacket {
    pub event: EventType,
    pub channel: Channel,

    /// Kernel thread id of the emitting thread.
    pub thread: u32,

    /// Number of instructions traced when the packet was emitted.
    pub timestamp: u64,
}

impl EventPacket {
    pub const SIZE: usize = 16;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.event.0.to_le_bytes());
        out[2] = self.channel.0;
        out[3] = 0;
        out[4..8].copy_from_slice(&self.thread.to_le_bytes());
        out[8..16].copy_from_slice(&self.timestamp.to_le_bytes());
    }

    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < Self::SIZE {
            return None;
        }

        Some(Self {
            event: EventType(u16::from_le_bytes([payload[0], payload[1]])),
            channel: Channel(payload[2]),
            thread: read_u32(&payload[4..8]),
            timestamp: read_u64(&payload[8..16]),
        })
    }
}

/// Payload of a `Write` packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WritePacket {
    /// Registry offset of the first byte written.
    pub offset: u32,

    /// Number of meaningful low-order bytes in `old` and `new`.
    pub width: u32,

    pub old: u64,
    pub new: u64,
}

impl WritePacket {
    pub const SIZE: usize = 24;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.offset.to_le_bytes());
        out[4..8].copy_from_slice(&self.width.to_le_bytes());
        out[8..16].copy_from_slice(&self.old.to_le_bytes());
        out[16..24].copy_from_slice(&self.new.to_le_bytes());
    }

    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < Self::SIZE {
            return None;
        }

        Some(Self {
            offset: read_u32(&payload[0..4]),
            width: read_u32(&payload[4..8]),
            old: read_u64(&payload[8..16]),
            new: read_u64(&payload[16..24]),
        })
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(raw)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(raw)
}

/// Why a packet could not be claimed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClaimError {
    /// No arena has been allocated.
    Unallocated,

    /// The packet does not fit in the remaining space.
    Overflow,
}

/// A claimed packet whose payload may be filled in.
#[derive(Debug)]
pub struct PacketMut<'a> {
    payload: &'a mut [u8],
}

impl<'a> PacketMut<'a> {
    pub fn payload(&mut self) -> &mut [u8] {
        self.payload
    }
}

/// Fixed-capacity packet arena.
///
/// Claiming never blocks, locks or allocates, so it may be used from a signal handler.
#[derive(Debug)]
pub struct PacketBuffer {
    data: AtomicPtr<u8>,
    capacity: AtomicUsize,
    top: AtomicUsize,
}

impl PacketBuffer {
    /// A buffer with no arena. Every claim fails with [`ClaimError::Unallocated`].
    pub const fn empty() -> Self {
        Self {
            data: AtomicPtr::new(ptr::null_mut()),
            capacity: AtomicUsize::new(0),
            top: AtomicUsize::new(0),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let buffer = Self::empty();
        buffer.allocate(capacity);
        buffer
    }

    /// Give the buffer an empty arena of `capacity` bytes.
    ///
    /// An existing arena of the same size is reused. Must not be called while any
    /// thread may be claiming packets.
    pub fn allocate(&self, capacity: usize) {
        if !self.data.load(Ordering::Acquire).is_null() && self.capacity() == capacity {
            self.reset();
            return;
        }

        let arena = vec![0u8; capacity].into_boxed_slice();
        let data = Box::into_raw(arena) as *mut u8;

        self.top.store(0, Ordering::Release);
        let old_capacity = self.capacity.swap(capacity, Ordering::AcqRel);
        let old = self.data.swap(data, Ordering::AcqRel);

        if !old.is_null() {
            // SAFETY: `old` was produced by `Box::into_raw` on a slice of `old_capacity`.
            unsafe { drop(Box::from_raw(ptr::slice_from_raw_parts_mut(old, old_capacity))) };
        }
    }

    /// Discard every packet.
    pub fn reset(&self) {
        self.top.store(0, Ordering::Release);
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Number of bytes claimed so far.
    pub fn len(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_allocated(&self) -> bool {
        !self.data.load(Ordering::Acquire).is_null()
    }

    /// Claim space for a packet with a `payload_len`-byte payload and write its header.
    pub fn claim(&self, ty: PacketType, payload_len: usize) -> Result<PacketMut<'_>, ClaimError> {
        let data = self.data.load(Ordering::Acquire);
        if data.is_null() {
            return Err(ClaimError::Unallocated);
        }

        let capacity = self.capacity();
        let size = HEADER_SIZE + payload_len;
        let payload_size = u32::try_from(payload_len).map_err(|_| ClaimError::Overflow)?;

        let mut top = self.top.load(Ordering::Relaxed);
        let start = loop {
            let start = align_up_usize(top, PACKET_ALIGNMENT);
            let end = start.checked_add(size).ok_or(ClaimError::Overflow)?;

            if end > capacity {
                return Err(ClaimError::Overflow);
            }

            match self.top.compare_exchange_weak(top, end, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => break start,
                Err(current) => top = current,
            }
        };

        // SAFETY: `[start, start + size)` lies in the arena and was claimed by this call
        // alone, so no other reference to it exists.
        let packet = unsafe { slice::from_raw_parts_mut(data.add(start), size) };

        packet[0..2].copy_from_slice(&(ty as u16).to_le_bytes());
        packet[2..4].copy_from_slice(&0u16.to_le_bytes());
        packet[4..8].copy_from_slice(&payload_size.to_le_bytes());

        let (_, payload) = packet.split_at_mut(HEADER_SIZE);

        Ok(PacketMut { payload })
    }

    /// Claim a packet, aborting the process if the arena is exhausted.
    ///
    /// A truncated trace is worse than none, and the arena cannot safely grow from a
    /// signal handler. Returns `None` only if no arena is allocated.
    pub fn push(&self, ty: PacketType, payload_len: usize) -> Option<PacketMut<'_>> {
        match self.claim(ty, payload_len) {
            Ok(packet) => Some(packet),
            Err(ClaimError::Unallocated) => None,
            Err(ClaimError::Overflow) => std::process::abort(),
        }
    }

    /// Push a packet with the given payload. See [`push()`](Self::push()).
    pub fn push_bytes(&self, ty: PacketType, payload: &[u8]) -> bool {
        match self.push(ty, payload.len()) {
            Some(mut packet) => {
                packet.payload().copy_from_slice(payload);
                true
            },
            None => false,
        }
    }

    /// The claimed part of the arena.
    ///
    /// # Safety
    ///
    /// No thread may claim or fill a packet while the returned slice is alive.
    pub unsafe fn as_slice(&self) -> &[u8] {
        let data = self.data.load(Ordering::Acquire);
        if data.is_null() {
            return &[];
        }

        slice::from_raw_parts(data, self.len().min(self.capacity()))
    }
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        let data = *self.data.get_mut();
        let capacity = *self.capacity.get_mut();

        if !data.is_null() {
            // SAFETY: see `allocate()`.
            unsafe { drop(Box::from_raw(ptr::slice_from_raw_parts_mut(data, capacity))) };
        }
    }
}

fn align_up_usize(value: usize, alignment: usize) -> usize {
    (value + (alignment - 1)) & !(alignment - 1)
}

/// A packet read back from a stream.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PacketRef<'a> {
    pub ty: PacketType,
    pub payload: &'a [u8],
}

/// Iterator over the packets in a stream produced by [`PacketBuffer`].
///
/// Stops at the end of the stream, or at the first truncated or unknown packet.
#[derive(Clone, Debug)]
pub struct Packets<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> Packets<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, cursor: 0 }
    }
}

impl<'a> Iterator for Packets<'a> {
    type Item = PacketRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = align_up_usize(self.cursor, PACKET_ALIGNMENT);
        let header = self.data.get(start..start.checked_add(HEADER_SIZE)?)?;

        let ty = PacketType::from_raw(u16::from_le_bytes([header[0], header[1]]))?;
        let size = read_u32(&header[4..8]) as usize;

        let payload_start = start + HEADER_SIZE;
        let payload = self.data.get(payload_start..payload_start.checked_add(size)?)?;

        self.cursor = payload_start + size;

        Some(PacketRef { ty, payload })
    }
}
