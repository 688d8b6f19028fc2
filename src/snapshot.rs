//! Snapshot traces: full machine state per instruction, stored as diffs.
//!
//! This is the simpler sibling of the packet recorder, for machines whose state is
//! small and available after every instruction, like an interpreter's. Each file starts
//! with `"SNAP"` and a `u32` version, followed by 1-byte tagged packets. A snapshot is
//! built up from `Set*`/`Patch*` packets and closed by `PushSnapshot`.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::Result;

pub const MAGIC: &[u8; 4] = b"SNAP";
pub const VERSION: u32 = 1;

/// Registers are stored as 16 raw bytes, whatever their width.
pub type RegisterValue = [u8; 16];

/// Memory is diffed in words of this many bytes.
pub const PATCH_WORD: usize = 4;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Tag {
    /// A complete state has been written; later snapshots only carry patches.
    SaveState = b'F',

    PushSnapshot = b'P',

    /// `u8` count, then each register.
    SetRegisters = b'R',

    /// `u32` length, then the bytes.
    SetMemory = b'M',

    /// `u32` length, then the bytes. Written once per file.
    SetInstructions = b'I',

    /// `u32` address, `u32` size.
    LoadOp = b'L',

    /// `u32` address, `u32` size.
    StoreOp = b'S',

    /// `u8` index, then the register.
    PatchRegister = b'r',

    /// `u32` address, then one word.
    PatchMemory = b'm',
}

impl Tag {
    pub fn from_raw(raw: u8) -> Option<Self> {
        use Tag::*;

        let tag = match raw {
            b'F' => SaveState,
            b'P' => PushSnapshot,
            b'R' => SetRegisters,
            b'M' => SetMemory,
            b'I' => SetInstructions,
            b'L' => LoadOp,
            b'S' => StoreOp,
            b'r' => PatchRegister,
            b'm' => PatchMemory,
            _ => return None,
        };

        Some(tag)
    }
}

/// State of the traced machine after an instruction.
#[derive(Clone, Copy, Debug)]
pub struct MachineState<'a> {
    pub registers: &'a [RegisterValue],
    pub memory: &'a [u8],
    pub instructions: &'a [u8],
}

/// Writes one snapshot trace, diffing each state against the previous one.
#[derive(Debug)]
pub struct TraceWriter<W: Write> {
    out: W,

    // Bytes written after the file header.
    body_len: u64,

    wrote_instructions: bool,
    last_registers: Option<Vec<RegisterValue>>,
    last_memory: Option<Vec<u8>>,

    load: Option<(u32, u32)>,
    store: Option<(u32, u32)>,
}

impl<W: Write> TraceWriter<W> {
    pub fn new(mut out: W) -> io::Result<Self> {
        out.write_all(MAGIC)?;
        out.write_all(&VERSION.to_le_bytes())?;

        Ok(Self {
            out,
            body_len: 0,
            wrote_instructions: false,
            last_registers: None,
            last_memory: None,
            load: None,
            store: None,
        })
    }

    /// Record a load by the instruction currently executing.
    pub fn record_load(&mut self, address: u32, size: u32) {
        self.load = Some((address, size));
    }

    /// Record a store by the instruction currently executing.
    pub fn record_store(&mut self, address: u32, size: u32) {
        self.store = Some((address, size));
    }

    /// Start a new snapshot for the state after an instruction.
    pub fn instruction(&mut self, state: &MachineState<'_>) -> io::Result<()> {
        self.push_last_snapshot()?;

        if !self.wrote_instructions {
            self.tag(Tag::SetInstructions)?;
            self.write(&(state.instructions.len() as u32).to_le_bytes())?;
            self.write(state.instructions)?;
            self.wrote_instructions = true;
        }

        let mut full = false;

        match self.last_registers.take() {
            None => {
                self.tag(Tag::SetRegisters)?;
                self.write(&[state.registers.len() as u8])?;

                for register in state.registers {
                    self.write(register)?;
                }

                full = true;
            },
            Some(mut last) => {
                last.resize(state.registers.len(), [0; 16]);

                for (index, (register, previous)) in state.registers.iter().zip(last.iter()).enumerate() {
                    if register != previous {
                        self.tag(Tag::PatchRegister)?;
                        self.write(&[index as u8])?;
                        self.write(register)?;
                    }
                }
            },
        }

        self.last_registers = Some(state.registers.to_vec());

        match self.last_memory.take() {
            Some(mut last) if last.len() == state.memory.len() => {
                for (word, (current, previous)) in state.memory
                    .chunks(PATCH_WORD)
                    .zip(last.chunks_mut(PATCH_WORD))
                    .enumerate()
                {
                    if current != previous {
                        let mut padded = [0u8; PATCH_WORD];
                        padded[..current.len()].copy_from_slice(current);

                        self.tag(Tag::PatchMemory)?;
                        self.write(&((word * PATCH_WORD) as u32).to_le_bytes())?;
                        self.write(&padded)?;

                        previous.copy_from_slice(current);
                    }
                }

                self.last_memory = Some(last);
            },
            _ => {
                self.tag(Tag::SetMemory)?;
                self.write(&(state.memory.len() as u32).to_le_bytes())?;
                self.write(state.memory)?;
                self.last_memory = Some(state.memory.to_vec());

                full = true;
            },
        }

        if full {
            self.tag(Tag::SaveState)?;
        }

        if let Some((address, size)) = self.load.take() {
            self.tag(Tag::LoadOp)?;
            self.write(&address.to_le_bytes())?;
            self.write(&size.to_le_bytes())?;
        }

        if let Some((address, size)) = self.store.take() {
            self.tag(Tag::StoreOp)?;
            self.write(&address.to_le_bytes())?;
            self.write(&size.to_le_bytes())?;
        }

        Ok(())
    }

    /// Close the last snapshot and return the output.
    pub fn finish(mut self) -> io::Result<W> {
        self.push_last_snapshot()?;
        self.out.flush()?;

        Ok(self.out)
    }

    fn push_last_snapshot(&mut self) -> io::Result<()> {
        if self.body_len > 0 {
            self.tag(Tag::PushSnapshot)?;
        }

        Ok(())
    }

    fn tag(&mut self, tag: Tag) -> io::Result<()> {
        self.write(&[tag as u8])
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.out.write_all(bytes)?;
        self.body_len += bytes.len() as u64;

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SnapshotStatus {
    Disabled,

    /// Requested, waiting for the next frame boundary.
    Waiting,

    Tracing,
}

/// Traces whole frames of a machine, one file per program run.
///
/// [`request()`](Self::request()) arms the tracer; the next frame boundary starts a
/// session and the one after ends it. Each program started during the session gets its
/// own numbered file in the output directory.
#[derive(Debug)]
pub struct SnapshotTracer {
    status: SnapshotStatus,
    directory: PathBuf,
    next_index: u32,
    writer: Option<TraceWriter<BufWriter<File>>>,
}

impl SnapshotTracer {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            status: SnapshotStatus::Disabled,
            directory: directory.into(),
            next_index: 0,
            writer: None,
        }
    }

    pub fn status(&self) -> SnapshotStatus {
        self.status
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path of the `index`th trace of a session.
    pub fn trace_path(&self, index: u32) -> PathBuf {
        self.directory.join(format!("trace{:06}.bin", index))
    }

    pub fn request(&mut self) {
        if self.status == SnapshotStatus::Disabled {
            self.status = SnapshotStatus::Waiting;
        }
    }

    /// Called at every frame boundary.
    pub fn on_frame(&mut self) -> Result<()> {
        match self.status {
            SnapshotStatus::Disabled => Ok(()),
            SnapshotStatus::Waiting => {
                self.status = SnapshotStatus::Tracing;

                if let Err(err) = self.begin_session() {
                    self.status = SnapshotStatus::Disabled;
                    return Err(err);
                }

                Ok(())
            },
            SnapshotStatus::Tracing => {
                self.status = SnapshotStatus::Disabled;
                self.end_file()?;

                info!(files = self.next_index, "snapshot trace session finished");

                Ok(())
            },
        }
    }

    /// Called whenever the machine starts a new program.
    pub fn on_program_start(&mut self) -> Result<()> {
        if self.status != SnapshotStatus::Tracing {
            return Ok(());
        }

        self.end_file()?;
        self.begin_file()
    }

    pub fn on_instruction(&mut self, state: &MachineState<'_>) -> Result<()> {
        if let Some(writer) = &mut self.writer {
            writer.instruction(state)?;
        }

        Ok(())
    }

    pub fn on_load(&mut self, address: u32, size: u32) {
        if let Some(writer) = &mut self.writer {
            writer.record_load(address, size);
        }
    }

    pub fn on_store(&mut self, address: u32, size: u32) {
        if let Some(writer) = &mut self.writer {
            writer.record_store(address, size);
        }
    }

    fn begin_session(&mut self) -> Result<()> {
        fs::create_dir_all(&self.directory)?;
        self.next_index = 0;

        self.begin_file()
    }

    fn begin_file(&mut self) -> Result<()> {
        let path = self.trace_path(self.next_index);
        self.next_index += 1;

        info!(path = %path.display(), "snapshot tracing to file");

        let file = File::create(&path)?;
        self.writer = Some(TraceWriter::new(BufWriter::new(file))?);

        Ok(())
    }

    fn end_file(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finish()?;
            debug!("closed snapshot trace file");
        }

        Ok(())
    }
}
