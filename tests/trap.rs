use anyhow::Result;
use hosttrace::packet::{PacketBuffer, PacketType, Packets, WritePacket};
use hosttrace::registry::Registry;
use hosttrace::trap::{self, Access, TrapState};
use hosttrace::x86::RegisterContext;
use iced_x86::Register;
use pretty_assertions::assert_eq;

// mov byte ptr [rax], 0x7f
const MOV_BYTE_RAX: &[u8] = &[0xc6, 0x00, 0x7f];

// mov qword ptr [rax], rdx
const MOV_QWORD_RAX: &[u8] = &[0x48, 0x89, 0x10];

// add dword ptr [rip+0x10], 1
const ADD_RIP_RELATIVE: &[u8] = &[0x83, 0x05, 0x10, 0x00, 0x00, 0x00, 0x01];

const NOP: &[u8] = &[0x90];

fn writes(buffer: &PacketBuffer) -> Vec<WritePacket> {
    let bytes = unsafe { buffer.as_slice() }.to_vec();

    Packets::new(&bytes)
        .filter(|packet| packet.ty == PacketType::Write)
        .filter_map(|packet| WritePacket::decode(packet.payload))
        .collect()
}

#[test]
fn test_write_detection_round_trip() -> Result<()> {
    let a = [0u8; 10];
    let mut b = [0u8; 3];

    let mut registry = Registry::new();
    assert_eq!(registry.register("a", a.as_ptr(), a.len()), Some(0));
    assert_eq!(registry.register("b", b.as_ptr(), b.len()), Some(16));

    let buffer = PacketBuffer::with_capacity(1024);
    let mut state = TrapState::IDLE;

    let mut regs = RegisterContext::new(0x40_1000);
    regs.set(Register::RAX, b.as_ptr() as u64);

    // Trap before the store.
    let access = unsafe { trap::step(&mut state, &regs, MOV_BYTE_RAX, &registry, &buffer) };
    assert_eq!(access, None);

    // The store itself.
    unsafe { std::ptr::write_volatile(b.as_mut_ptr(), 0x7f) };

    // Trap after the store.
    regs.rip += MOV_BYTE_RAX.len() as u64;
    let access = unsafe { trap::step(&mut state, &regs, NOP, &registry, &buffer) };

    let expected = WritePacket { offset: 16, width: 1, old: 0, new: 0x7f };
    assert_eq!(access, Some(Access::Written(expected)));
    assert_eq!(writes(&buffer), vec![expected]);

    Ok(())
}

#[test]
fn test_qword_write_into_second_global() -> Result<()> {
    let a = [0u8; 4];
    let mut b = [0u64; 2];

    let mut registry = Registry::new();
    registry.register("a", a.as_ptr(), a.len());
    registry.register("b", b.as_ptr() as *const u8, std::mem::size_of_val(&b));

    let buffer = PacketBuffer::with_capacity(1024);
    let mut state = TrapState::IDLE;

    let mut regs = RegisterContext::new(0x40_1000);
    regs.set(Register::RAX, &b[1] as *const u64 as u64);
    regs.set(Register::RDX, 0x1122_3344_5566_7788);

    unsafe { trap::step(&mut state, &regs, MOV_QWORD_RAX, &registry, &buffer) };
    unsafe { std::ptr::write_volatile(&mut b[1], 0x1122_3344_5566_7788) };
    unsafe { trap::step(&mut state, &regs, NOP, &registry, &buffer) };

    assert_eq!(writes(&buffer), vec![WritePacket {
        offset: 24,
        width: 8,
        old: 0,
        new: 0x1122_3344_5566_7788,
    }]);

    Ok(())
}

#[test]
fn test_rip_relative_operand() -> Result<()> {
    let mut counter = [0u32; 1];

    let mut registry = Registry::new();
    registry.register("counter", counter.as_ptr() as *const u8, 4);

    let buffer = PacketBuffer::with_capacity(1024);
    let mut state = TrapState::IDLE;

    // Place the instruction so that `rip + len + 0x10` is the counter.
    let target = counter.as_ptr() as u64;
    let rip = target - 0x10 - ADD_RIP_RELATIVE.len() as u64;
    let regs = RegisterContext::new(rip);

    unsafe { trap::step(&mut state, &regs, ADD_RIP_RELATIVE, &registry, &buffer) };
    assert_eq!(state.pending_address(), Some(target as usize));

    unsafe { std::ptr::write_volatile(&mut counter[0], 1) };
    unsafe { trap::step(&mut state, &regs, NOP, &registry, &buffer) };

    assert_eq!(writes(&buffer), vec![WritePacket { offset: 0, width: 4, old: 0, new: 1 }]);

    Ok(())
}

#[test]
fn test_store_of_same_value_is_recorded() -> Result<()> {
    let a = [0u8; 10];
    let mut b = [0x7fu8; 3];

    let mut registry = Registry::new();
    registry.register("a", a.as_ptr(), a.len());
    registry.register("b", b.as_ptr(), b.len());

    let buffer = PacketBuffer::with_capacity(1024);
    let mut state = TrapState::IDLE;

    let mut regs = RegisterContext::new(0x40_1000);
    regs.set(Register::RAX, b.as_ptr() as u64);

    unsafe { trap::step(&mut state, &regs, MOV_BYTE_RAX, &registry, &buffer) };
    unsafe { std::ptr::write_volatile(b.as_mut_ptr(), 0x7f) };

    regs.rip += MOV_BYTE_RAX.len() as u64;
    let access = unsafe { trap::step(&mut state, &regs, NOP, &registry, &buffer) };

    let expected = WritePacket { offset: 16, width: 1, old: 0x7f, new: 0x7f };
    assert_eq!(access, Some(Access::Unchanged(expected)));
    assert_eq!(writes(&buffer), vec![expected]);

    Ok(())
}
