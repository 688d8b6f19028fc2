#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use anyhow::Result;
use hosttrace::packet::{EventPacket, PacketType, Packets, WritePacket};
use hosttrace::trace_file::TraceFile;
use hosttrace::{
    trace_global, trace_scoped_event, trace_scoped_promise, Channel, EventType, Promise, RecorderState,
    TraceConfig, RECORDER,
};
use ntest::timeout;
use pretty_assertions::assert_eq;

mod support;

use support::forbidden;

static COUNTER: AtomicU64 = AtomicU64::new(0);
static FLAGS: AtomicU32 = AtomicU32::new(0);

const LOOP_EVENT: EventType = EventType(7);

#[test]
#[timeout(120000)]
fn test_trace_own_writes() -> Result<()> {
    let counter = trace_global!(COUNTER).expect("registered before tracing");
    let flags = trace_global!(FLAGS).expect("registered before tracing");

    assert_eq!(counter, 0);
    assert_eq!(flags, 16);

    let mut config = TraceConfig::new();
    config.set_buffer_capacity(16 * 1024 * 1024);
    config.set_max_instructions(0);
    config.set_progress_interval(0);
    hosttrace::configure(config);

    match hosttrace::begin_trace() {
        Ok(()) => {},
        Err(err) if forbidden(&err) => {
            eprintln!("skipping, ptrace not permitted: {}", err);
            return Ok(());
        },
        Err(err) => return Err(err.into()),
    }

    {
        trace_scoped_event!(LOOP_EVENT, Channel::MAIN);

        for i in 1..=10 {
            COUNTER.store(i, Ordering::Relaxed);
        }
    }

    {
        trace_scoped_promise!(Promise::NO_WRITES);
        FLAGS.store(0xdead, Ordering::Relaxed);
    }

    // A second trace may not start while this one runs.
    assert!(matches!(hosttrace::begin_trace(), Err(hosttrace::Error::AlreadyTracing)));

    hosttrace::end_trace()?;

    assert_eq!(RECORDER.state(), RecorderState::Disabled);
    assert!(RECORDER.instructions() > 0);
    assert!(RECORDER.violations() >= 1);

    // Globals registered too late are refused.
    static LATE: AtomicU64 = AtomicU64::new(0);
    assert_eq!(trace_global!(LATE), None);

    let bytes = RECORDER.packets().expect("trace has ended");
    let packets: Vec<_> = Packets::new(&bytes).collect();

    // The trace opens with the state of every global.
    assert_eq!(packets[0].ty, PacketType::SaveState);
    assert_eq!(packets[0].payload.len(), 20);

    let counter_values: Vec<u64> = packets
        .iter()
        .filter(|packet| packet.ty == PacketType::Write)
        .filter_map(|packet| WritePacket::decode(packet.payload))
        .filter(|write| write.offset == counter)
        .map(|write| write.new)
        .collect();
    assert_eq!(counter_values, (1..=10).collect::<Vec<u64>>());

    let flag_writes: Vec<_> = packets
        .iter()
        .filter(|packet| packet.ty == PacketType::Write)
        .filter_map(|packet| WritePacket::decode(packet.payload))
        .filter(|write| write.offset == flags)
        .collect();
    assert_eq!(flag_writes, vec![WritePacket { offset: flags, width: 4, old: 0, new: 0xdead }]);

    let events: Vec<_> = packets
        .iter()
        .filter(|packet| matches!(packet.ty, PacketType::BeginEvent | PacketType::EndEvent))
        .filter_map(|packet| EventPacket::decode(packet.payload).map(|event| (packet.ty, event)))
        .filter(|(_, event)| event.event == LOOP_EVENT)
        .collect();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].0, PacketType::BeginEvent);
    assert_eq!(events[1].0, PacketType::EndEvent);
    assert!(events[0].1.timestamp < events[1].1.timestamp);
    assert_eq!(events[0].1.thread, nix::unistd::gettid().as_raw() as u32);

    let path = std::env::temp_dir().join(format!("hosttrace-recorder-{}.trace", std::process::id()));
    hosttrace::save_trace(&path)?;

    let trace = TraceFile::parse(&std::fs::read(&path)?)?;
    std::fs::remove_file(&path)?;

    assert!(trace.is_finished());
    assert_eq!(trace.globals.len(), 2);
    assert_eq!(trace.globals[0].name, "COUNTER");
    assert_eq!(trace.globals[1].name, "FLAGS");
    assert_eq!(trace.data, bytes);

    // Ending twice only warns.
    hosttrace::end_trace()?;

    Ok(())
}
