use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use anyhow::Result;
use hosttrace::packet::{PacketType, WritePacket};
use hosttrace::snapshot::{MachineState, RegisterValue, SnapshotTracer};
use hosttrace::trace_file::TraceFile;
use hosttrace::{trace_global, trace_scoped_event, Channel, EventType, TraceConfig};
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
enum Opt {
    /// Single-step this process and record its writes to two globals.
    Record {
        #[structopt(short, long, default_value = "100")]
        iterations: u64,

        #[structopt(short, long, default_value = "0")]
        max_instructions: u64,

        #[structopt(short, long, parse(from_os_str), default_value = "/tmp/trace")]
        output: PathBuf,

        #[structopt(short, long)]
        quiet: bool,
    },

    /// Run a toy machine and write one snapshot trace per program.
    Snapshot {
        #[structopt(short, long, parse(from_os_str), default_value = "/tmp/snapshots")]
        directory: PathBuf,

        #[structopt(short, long, default_value = "3")]
        programs: u32,
    },
}

static TOTAL: AtomicU64 = AtomicU64::new(0);
static LAST: AtomicU32 = AtomicU32::new(0);

const WORK: EventType = EventType(1);

fn main() -> Result<()> {
    env_logger::init();

    match Opt::from_args() {
        Opt::Record { iterations, max_instructions, output, quiet } => {
            record(iterations, max_instructions, output, quiet)
        },
        Opt::Snapshot { directory, programs } => snapshot(directory, programs),
    }
}

fn record(iterations: u64, max_instructions: u64, output: PathBuf, quiet: bool) -> Result<()> {
    if !hosttrace::supported() {
        eprintln!("tracing is not supported on this platform");
        return Ok(());
    }

    trace_global!(TOTAL);
    trace_global!(LAST);

    let mut config = TraceConfig::new();
    config.set_max_instructions(max_instructions);
    config.set_auto_save_path(&output);
    hosttrace::configure(config);

    hosttrace::begin_trace()?;

    {
        trace_scoped_event!(WORK, Channel::MAIN);

        for i in 0..iterations {
            TOTAL.fetch_add(i, Ordering::Relaxed);
            LAST.store(i as u32, Ordering::Relaxed);
        }
    }

    hosttrace::end_trace()?;
    hosttrace::save_trace(&output)?;

    let trace = TraceFile::parse(&std::fs::read(&output)?)?;

    for global in &trace.globals {
        println!("{:>8} +{:<4} {}", global.offset, global.size, global.name);
    }

    let mut writes = 0;

    for packet in trace.packets() {
        if packet.ty != PacketType::Write {
            continue;
        }

        writes += 1;

        if let (false, Some(write)) = (quiet, WritePacket::decode(packet.payload)) {
            println!("{:>8}: {:x} -> {:x} ({} bytes)", write.offset, write.old, write.new, write.width);
        }
    }

    println!("{} writes saved to {}", writes, output.display());

    Ok(())
}

// Four registers and sixteen bytes of memory, running a counting program.
fn snapshot(directory: PathBuf, programs: u32) -> Result<()> {
    let mut tracer = SnapshotTracer::new(directory);
    let code = [0x01, 0x02, 0x03];

    tracer.request();
    tracer.on_frame()?;

    for program in 0..programs {
        if program > 0 {
            tracer.on_program_start()?;
        }

        let mut registers: [RegisterValue; 4] = [[0; 16]; 4];
        let mut memory = [0u8; 16];

        for step in 0..8u8 {
            registers[0][0] = step;
            registers[1][0] = step.wrapping_mul(program as u8 + 1);

            let address = (step as usize % 4) * 4;
            memory[address] = registers[1][0];
            tracer.on_store(address as u32, 1);

            let state = MachineState { registers: &registers, memory: &memory, instructions: &code };
            tracer.on_instruction(&state)?;
        }
    }

    tracer.on_frame()?;

    for index in 0..programs {
        println!("{}", tracer.trace_path(index).display());
    }

    Ok(())
}
