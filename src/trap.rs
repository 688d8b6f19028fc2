//! The work done on every single-step trap.
//!
//! A write is seen across two traps: the trap before an instruction decodes it and
//! remembers the watched bytes it addresses, and the next trap compares them against
//! their new value. Everything here runs inside a signal handler, so it never
//! allocates, locks or logs.

use iced_x86::{Decoder, DecoderError, DecoderOptions, Instruction, Mnemonic, OpKind, Register};

use crate::packet::{PacketBuffer, PacketType, WritePacket};
use crate::registry::Registry;
use crate::x86::RegisterContext;

/// Longest possible x86 instruction.
pub const MAX_INSTRUCTION_LEN: usize = 15;

const PAGE_SIZE: u64 = 4096;

/// Per-thread memory access carried from one trap to the next.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TrapState {
    pending: bool,
    address: usize,
    offset: u32,
    width: u8,
    old_value: u64,
}

impl TrapState {
    pub const IDLE: TrapState = TrapState {
        pending: false,
        address: 0,
        offset: 0,
        width: 0,
        old_value: 0,
    };

    /// True if the last decoded instruction addressed a watched region.
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Host address remembered by the last trap, if any.
    pub fn pending_address(&self) -> Option<usize> {
        self.pending.then_some(self.address)
    }
}

/// How the previous instruction touched a watched region.
///
/// Either way a `Write` packet was emitted for it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Access {
    /// The watched bytes kept their value, e.g. a load or a same-value store.
    Unchanged(WritePacket),

    /// The watched bytes changed.
    Written(WritePacket),
}

impl Access {
    pub fn packet(&self) -> &WritePacket {
        match self {
            Access::Unchanged(packet) | Access::Written(packet) => packet,
        }
    }
}

/// Handle one trap.
///
/// `code` holds the bytes at `regs.rip`. Returns the access completed by the previous
/// instruction, if it addressed a watched region.
///
/// # Safety
///
/// Every region in `registry` must be valid for reads.
pub unsafe fn step(
    state: &mut TrapState,
    regs: &RegisterContext,
    code: &[u8],
    registry: &Registry,
    buffer: &PacketBuffer,
) -> Option<Access> {
    let access = if state.pending {
        state.pending = false;
        Some(finish_access(state, buffer))
    } else {
        None
    };

    let mut decoder = Decoder::with_ip(64, code, regs.rip, DecoderOptions::NONE);
    let instruction = decoder.decode();

    if !instruction.is_invalid() {
        begin_access(state, &instruction, regs, registry);
    }

    access
}

unsafe fn finish_access(state: &TrapState, buffer: &PacketBuffer) -> Access {
    let new = read_value(state.address, state.width);

    let write = WritePacket {
        offset: state.offset,
        width: state.width as u32,
        old: state.old_value,
        new,
    };

    if let Some(mut packet) = buffer.push(PacketType::Write, WritePacket::SIZE) {
        write.encode(packet.payload());
    }

    if new == state.old_value {
        Access::Unchanged(write)
    } else {
        Access::Written(write)
    }
}

unsafe fn begin_access(
    state: &mut TrapState,
    instruction: &Instruction,
    regs: &RegisterContext,
    registry: &Registry,
) {
    if matches!(instruction.mnemonic(), Mnemonic::Lea | Mnemonic::Nop) {
        return;
    }

    // Segment bases for `fs` and `gs` are not in the signal context.
    if matches!(instruction.memory_segment(), Register::FS | Register::GS) {
        return;
    }

    for operand in 0..instruction.op_count() {
        if instruction.op_kind(operand) != OpKind::Memory {
            continue;
        }

        let address = instruction.virtual_address(operand, 0, |reg, _, _| regs.value(reg));
        let address = match address {
            Some(address) => address as usize,
            None => continue,
        };

        let resolved = match registry.resolve(address) {
            Some(resolved) => resolved,
            None => continue,
        };

        let width = instruction.memory_size().size().clamp(1, 8) as u32;
        let width = width.min(resolved.remaining) as u8;

        state.pending = true;
        state.address = address;
        state.offset = resolved.offset;
        state.width = width;
        state.old_value = read_value(address, width);

        return;
    }
}

/// Read `width` (at most 8) bytes at `address` as a little-endian integer.
unsafe fn read_value(address: usize, width: u8) -> u64 {
    let mut raw = [0u8; 8];
    let width = (width as usize).min(raw.len());

    std::ptr::copy_nonoverlapping(address as *const u8, raw.as_mut_ptr(), width);

    u64::from_le_bytes(raw)
}

/// Bytes of the instruction at `rip` in our own address space.
///
/// Only reads past the end of `rip`'s page if the instruction actually continues there,
/// since the next page may be unmapped.
///
/// # Safety
///
/// `rip` must point at an executable, mapped instruction.
pub unsafe fn instruction_bytes(rip: u64) -> &'static [u8] {
    let to_page_end = (PAGE_SIZE - (rip % PAGE_SIZE)) as usize;
    let len = to_page_end.min(MAX_INSTRUCTION_LEN);
    let bytes = std::slice::from_raw_parts(rip as *const u8, len);

    if len == MAX_INSTRUCTION_LEN {
        return bytes;
    }

    let mut decoder = Decoder::with_ip(64, bytes, rip, DecoderOptions::NONE);
    let instruction = decoder.decode();

    if instruction.is_invalid() && decoder.last_error() == DecoderError::NoMoreBytes {
        std::slice::from_raw_parts(rip as *const u8, MAX_INSTRUCTION_LEN)
    } else {
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packets;

    // mov byte ptr [rax], 0x7f
    const MOV_BYTE_RAX: &[u8] = &[0xc6, 0x00, 0x7f];

    // mov dword ptr [rax+rcx*4+8], edx
    const MOV_DWORD_SIB: &[u8] = &[0x89, 0x54, 0x88, 0x08];

    // mov dword ptr fs:[rax], 1
    const MOV_FS: &[u8] = &[0x64, 0xc7, 0x00, 0x01, 0x00, 0x00, 0x00];

    // lea rdx, [rax]
    const LEA: &[u8] = &[0x48, 0x8d, 0x10];

    const NOP: &[u8] = &[0x90];

    #[test]
    fn test_memory_operand_sets_pending() {
        let watched = [0u8; 4];
        let mut registry = Registry::new();
        registry.register("watched", watched.as_ptr(), watched.len());

        let buffer = PacketBuffer::with_capacity(128);
        let mut regs = RegisterContext::new(0x1000);
        regs.set(Register::RAX, watched.as_ptr() as u64);

        let mut state = TrapState::IDLE;
        let access = unsafe { step(&mut state, &regs, MOV_BYTE_RAX, &registry, &buffer) };

        assert_eq!(access, None);
        assert_eq!(state.pending_address(), Some(watched.as_ptr() as usize));
        assert_eq!(state.width, 1);
    }

    #[test]
    fn test_scaled_index_addressing() {
        let watched = [0u8; 64];
        let mut registry = Registry::new();
        registry.register("watched", watched.as_ptr(), watched.len());

        let buffer = PacketBuffer::with_capacity(128);
        let mut regs = RegisterContext::new(0x1000);
        regs.set(Register::RAX, watched.as_ptr() as u64);
        regs.set(Register::RCX, 3);

        let mut state = TrapState::IDLE;
        unsafe { step(&mut state, &regs, MOV_DWORD_SIB, &registry, &buffer) };

        assert_eq!(state.pending_address(), Some(watched.as_ptr() as usize + 20));
        assert_eq!(state.offset, 20);
        assert_eq!(state.width, 4);
    }

    #[test]
    fn test_width_clamped_to_region_end() {
        let watched = [0u8; 22];
        let mut registry = Registry::new();
        registry.register("watched", watched.as_ptr(), watched.len());

        let buffer = PacketBuffer::with_capacity(128);
        let mut regs = RegisterContext::new(0x1000);
        regs.set(Register::RAX, watched.as_ptr() as u64);
        regs.set(Register::RCX, 3);

        let mut state = TrapState::IDLE;
        unsafe { step(&mut state, &regs, MOV_DWORD_SIB, &registry, &buffer) };

        assert_eq!(state.width, 2);
    }

    #[test]
    fn test_segment_relative_and_lea_are_skipped() {
        let watched = [0u8; 4];
        let mut registry = Registry::new();
        registry.register("watched", watched.as_ptr(), watched.len());

        let buffer = PacketBuffer::with_capacity(128);
        let mut regs = RegisterContext::new(0x1000);
        regs.set(Register::RAX, watched.as_ptr() as u64);

        for code in [MOV_FS, LEA] {
            let mut state = TrapState::IDLE;
            unsafe { step(&mut state, &regs, code, &registry, &buffer) };
            assert!(!state.is_pending());
        }
    }

    #[test]
    fn test_unwatched_address_is_ignored() {
        let watched = [0u8; 4];
        let other = [0u8; 4];
        let mut registry = Registry::new();
        registry.register("watched", watched.as_ptr(), watched.len());

        let buffer = PacketBuffer::with_capacity(128);
        let mut regs = RegisterContext::new(0x1000);
        regs.set(Register::RAX, other.as_ptr() as u64);

        let mut state = TrapState::IDLE;
        unsafe { step(&mut state, &regs, MOV_BYTE_RAX, &registry, &buffer) };

        assert!(!state.is_pending());
    }

    #[test]
    fn test_same_value_store_is_recorded_unchanged() {
        let watched = [0x7fu8; 3];
        let mut registry = Registry::new();
        registry.register("watched", watched.as_ptr(), watched.len());

        let buffer = PacketBuffer::with_capacity(128);
        let mut regs = RegisterContext::new(0x1000);
        regs.set(Register::RAX, watched.as_ptr() as u64);

        let mut state = TrapState::IDLE;
        unsafe { step(&mut state, &regs, MOV_BYTE_RAX, &registry, &buffer) };
        let access = unsafe { step(&mut state, &regs, NOP, &registry, &buffer) };

        let expected = WritePacket { offset: 0, width: 1, old: 0x7f, new: 0x7f };
        assert_eq!(access, Some(Access::Unchanged(expected)));
        assert!(!state.is_pending());

        let bytes = unsafe { buffer.as_slice() };
        let packets: Vec<_> = Packets::new(bytes).collect();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].ty, PacketType::Write);
        assert_eq!(WritePacket::decode(packets[0].payload), Some(expected));
    }

    #[test]
    fn test_instruction_bytes_stop_at_page_end() {
        // Two `nop`s at the end of a page decode without reading the next one.
        let page = vec![0x90u8; PAGE_SIZE as usize * 2];
        let base = page.as_ptr() as u64;
        let end = (base / PAGE_SIZE + 1) * PAGE_SIZE;

        let bytes = unsafe { instruction_bytes(end - 2) };
        assert_eq!(bytes.len(), 2);

        let bytes = unsafe { instruction_bytes(end) };
        assert_eq!(bytes.len(), MAX_INSTRUCTION_LEN);
    }

    #[test]
    fn test_undecodable_bytes_are_swallowed() {
        let registry = Registry::new();
        let buffer = PacketBuffer::with_capacity(128);
        let regs = RegisterContext::new(0x1000);

        let mut state = TrapState::IDLE;
        let access = unsafe { step(&mut state, &regs, &[0x0f], &registry, &buffer) };

        assert_eq!(access, None);
        assert!(!state.is_pending());
        assert_eq!(Packets::new(unsafe { buffer.as_slice() }).count(), 0);
    }
}
