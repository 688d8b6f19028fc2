//! Records every change to the traced globals, instruction by instruction.
//!
//! Tracing sets the trap flag in every thread of the process, so each retired
//! instruction raises `SIGTRAP`. The tracer lets the signal through to our own handler,
//! which runs on the traced thread and compares the globals addressed by the previous
//! instruction against their values before it ran.
//!
//! ```text
//!   Disabled --begin_trace--> Armed --first trap--> Tracing
//!       ^                                              |
//!       +----------- end_trace ------- Flushed <-------+
//!                                        ^   end_trace or max_instructions
//! ```
//!
//! A trace that stopped at `max_instructions` is finished, and its tracer reaped, by the
//! next call to `end_trace`, `begin_trace` or `save_trace`.

use std::cell::{Cell, RefCell};
use std::ffi::CString;
use std::fs::File;
use std::io::BufWriter;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::FromRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::gettid;
use tracing::{debug, error, info, warn};

use crate::attach::AttachThread;
use crate::config::TraceConfig;
use crate::error::{Error, Result, ResultExt};
use crate::instrument::Promise;
use crate::packet::{Channel, EventPacket, EventType, PacketBuffer, PacketType};
use crate::registry::{Registry, GLOBALS};
use crate::session::{Event, Session, ThreadId};
use crate::trace_file;
use crate::trap::{self, Access, TrapState};
use crate::x86::{self, RegisterContext, TRAP_FLAG};

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecorderState {
    Disabled = 0,

    /// The tracer is attaching. No trap has been handled yet.
    Armed = 1,

    Tracing = 2,

    /// No more packets are recorded. Threads disarm themselves on their next trap.
    Flushed = 3,
}

impl RecorderState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => RecorderState::Armed,
            2 => RecorderState::Tracing,
            3 => RecorderState::Flushed,
            _ => RecorderState::Disabled,
        }
    }
}

thread_local! {
    // Tagged with the trace it belongs to, so nothing leaks from one trace to the next.
    static TRAP: Cell<(u64, TrapState)> = const { Cell::new((0, TrapState::IDLE)) };

    static PROMISES: RefCell<Vec<Promise>> = const { RefCell::new(Vec::new()) };

    // Top of `PROMISES`, readable from the signal handler.
    static CURRENT_PROMISE: Cell<Promise> = const { Cell::new(Promise::NO_PROMISES) };
}

/// The process-wide recorder.
pub struct TraceRecorder {
    state: AtomicU8,
    generation: AtomicU64,
    buffer: PacketBuffer,

    instructions: AtomicU64,
    violations: AtomicU64,
    max_instructions: AtomicU64,

    // Last multiple of `progress_interval` passed, published by the tracer.
    progress: AtomicU64,

    // Leaked `Arc` and `CString`, released when the next trace replaces them. A thread
    // may still be inside the handler when a trace ends.
    interrupt: AtomicPtr<AtomicBool>,
    auto_save_path: AtomicPtr<libc::c_char>,

    config: Mutex<Option<TraceConfig>>,
    tracer: Mutex<Option<AttachThread>>,
}

pub static RECORDER: TraceRecorder = TraceRecorder::new();

impl TraceRecorder {
    const fn new() -> Self {
        Self {
            state: AtomicU8::new(RecorderState::Disabled as u8),
            generation: AtomicU64::new(0),
            buffer: PacketBuffer::empty(),
            instructions: AtomicU64::new(0),
            violations: AtomicU64::new(0),
            max_instructions: AtomicU64::new(0),
            progress: AtomicU64::new(0),
            interrupt: AtomicPtr::new(std::ptr::null_mut()),
            auto_save_path: AtomicPtr::new(std::ptr::null_mut()),
            config: Mutex::new(None),
            tracer: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RecorderState {
        RecorderState::from_raw(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: RecorderState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: RecorderState, to: RecorderState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn recording(&self) -> bool {
        matches!(self.state(), RecorderState::Armed | RecorderState::Tracing)
    }

    /// Number of instructions traced by the current or last trace.
    pub fn instructions(&self) -> u64 {
        self.instructions.load(Ordering::Acquire)
    }

    /// Last multiple of the progress interval reached by the current or last trace.
    ///
    /// Readable while tracing, unlike the tracer's own logs.
    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Acquire)
    }

    /// Number of broken promises seen by the current or last trace.
    pub fn violations(&self) -> u64 {
        self.violations.load(Ordering::Acquire)
    }

    /// Set the configuration used by the next trace.
    pub fn configure(&self, config: TraceConfig) {
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = Some(config);
    }

    pub fn begin_trace(&'static self) -> Result<()> {
        let mut tracer_slot = self.tracer.lock().unwrap_or_else(PoisonError::into_inner);

        self.finish_auto_stopped(&mut tracer_slot);

        if self.state() != RecorderState::Disabled {
            return Err(Error::AlreadyTracing);
        }

        let config = self.config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default();

        install_handler()?;

        let registry = GLOBALS.freeze();
        if registry.is_empty() {
            warn!("no traced globals registered, only events will be recorded");
        }

        self.buffer.allocate(config.buffer_capacity());
        self.instructions.store(0, Ordering::Release);
        self.violations.store(0, Ordering::Release);
        self.progress.store(0, Ordering::Release);
        self.max_instructions.store(config.max_instructions(), Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);

        let path = CString::new(config.auto_save_path().as_os_str().as_bytes())
            .map_err(|_| Error::Internal("auto-save path contains a NUL byte".into()))?;
        let old = self.auto_save_path.swap(path.into_raw(), Ordering::AcqRel);
        if !old.is_null() {
            // SAFETY: produced by `CString::into_raw()`, and no handler can be using it
            // while the recorder is disabled.
            drop(unsafe { CString::from_raw(old) });
        }

        let mut tracer = AttachThread::new();
        tracer.set_poll_delays(config.poll_delay(), config.max_poll_delay());

        let old = self.interrupt.swap(Arc::into_raw(tracer.interrupt_flag()) as *mut AtomicBool, Ordering::AcqRel);
        if !old.is_null() {
            // SAFETY: produced by `Arc::into_raw()`, see above.
            drop(unsafe { Arc::from_raw(old as *const AtomicBool) });
        }

        self.set_state(RecorderState::Armed);

        let progress_interval = config.progress_interval();
        let body = Box::new(move |session: &mut Session| self.run_debug_loop(session, registry, progress_interval));

        match tracer.start(config.tracer_stack_size(), body) {
            Ok(report) => {
                info!(threads = report.threads, passes = report.passes, "tracing started");
                *tracer_slot = Some(tracer);

                Ok(())
            },
            Err(err) => {
                error!(%err, "failed to start tracing");
                self.set_state(RecorderState::Disabled);

                Err(err)
            },
        }
    }

    /// Stop tracing and detach the tracer. Ending a trace that never began only warns.
    pub fn end_trace(&self) -> Result<()> {
        let mut tracer_slot = self.tracer.lock().unwrap_or_else(PoisonError::into_inner);

        if self.state() == RecorderState::Disabled {
            warn!("end_trace called while not tracing");
            return Ok(());
        }

        self.finish(&mut tracer_slot);

        Ok(())
    }

    // Reap the tracer of a trace that stopped itself at `max_instructions`.
    fn finish_auto_stopped(&self, tracer_slot: &mut Option<AttachThread>) {
        if self.state() == RecorderState::Flushed && tracer_slot.is_some() {
            debug!("finishing trace stopped by its instruction budget");
            self.finish(tracer_slot);
        }
    }

    fn finish(&self, tracer_slot: &mut Option<AttachThread>) {
        self.set_state(RecorderState::Flushed);

        if let Some(mut tracer) = tracer_slot.take() {
            tracer.stop();
        }

        let violations = self.violations();
        if violations > 0 {
            warn!(violations, "traced code broke its access promises");
        }

        info!(
            instructions = self.instructions(),
            progress = self.progress(),
            bytes = self.buffer.len(),
            "tracing stopped"
        );

        self.set_state(RecorderState::Disabled);
    }

    /// Write the recorded trace to `path`.
    pub fn save_trace(&self, path: &Path) -> Result<()> {
        {
            let mut tracer_slot = self.tracer.lock().unwrap_or_else(PoisonError::into_inner);
            self.finish_auto_stopped(&mut tracer_slot);
        }

        if self.recording() {
            return Err(Error::AlreadyTracing);
        }

        let mut out = BufWriter::new(File::create(path)?);
        self.write_trace(&mut out)?;

        info!(path = %path.display(), bytes = self.buffer.len(), "saved trace");

        Ok(())
    }

    fn write_trace<W: std::io::Write + std::io::Seek>(&self, out: &mut W) -> std::io::Result<()> {
        let globals = GLOBALS.frozen().map(Registry::globals).unwrap_or(&[]);

        // SAFETY: callers ensure no thread is recording.
        let packets = unsafe { self.buffer.as_slice() };

        trace_file::write_trace(out, globals, packets)
    }

    /// Copy of the packets recorded by the last trace, if it has ended.
    pub fn packets(&self) -> Option<Vec<u8>> {
        if self.recording() {
            return None;
        }

        // SAFETY: no thread is recording.
        Some(unsafe { self.buffer.as_slice() }.to_vec())
    }

    pub fn begin_event(&self, event: EventType, channel: Channel) {
        self.push_event(PacketType::BeginEvent, event, channel);
    }

    pub fn end_event(&self, event: EventType, channel: Channel) {
        self.push_event(PacketType::EndEvent, event, channel);
    }

    fn push_event(&self, ty: PacketType, event: EventType, channel: Channel) {
        if !self.recording() {
            return;
        }

        let packet = EventPacket {
            event,
            channel,
            thread: gettid().as_raw() as u32,
            timestamp: self.instructions(),
        };

        if let Some(mut raw) = self.buffer.push(ty, EventPacket::SIZE) {
            packet.encode(raw.payload());
        }
    }

    pub fn push_promise(&self, promise: Promise) {
        PROMISES.with(|stack| stack.borrow_mut().push(promise));
        CURRENT_PROMISE.with(|current| current.set(promise));
    }

    pub fn pop_promise(&self) {
        let top = PROMISES.with(|stack| {
            let mut stack = stack.borrow_mut();

            if stack.pop().is_none() {
                warn!("promise stack underflow");
            }

            stack.last().copied().unwrap_or(Promise::NO_PROMISES)
        });

        CURRENT_PROMISE.with(|current| current.set(top));
    }

    // Runs on the tracer. Every thread is stopped on entry, and detached on return.
    //
    // Nothing here logs until every thread is detached: one of ours stopped while
    // holding the logger's lock would never give it back.
    fn run_debug_loop(&self, session: &mut Session, registry: &Registry, progress_interval: u64) {
        let mut failures = vec![];

        self.save_state(registry);

        for tid in session.thread_ids() {
            match arm(session, tid) {
                Ok(()) => {},
                Err(err) if err.thread_died() => {},
                Err(err) => failures.push(err),
            }
        }

        match session.resume_all() {
            Ok(()) => {
                if let Some(err) = self.forward_traps(session, progress_interval) {
                    failures.push(err);
                }
            },
            Err(err) => failures.push(err),
        }

        if let Err(err) = session.stop_all() {
            failures.push(err);
        }

        for tid in session.thread_ids() {
            match disarm(session, tid) {
                Ok(()) => {},
                Err(err) if err.thread_died() => {},
                Err(err) => failures.push(err),
            }
        }

        if let Err(err) = session.detach() {
            failures.push(err);
        }

        for err in failures {
            error!(%err, "tracer failed");
        }
    }

    // Runs until interrupted, or until nothing is left to trace.
    fn forward_traps(&self, session: &mut Session, progress_interval: u64) -> Option<Error> {
        let mut next_progress = progress_interval;

        loop {
            let event = match session.wait_for_event() {
                Ok(Some(event)) => event,
                Ok(None) => return None,
                Err(err) if err.thread_died() => continue,
                Err(err) => return Some(err),
            };

            let res = match event {
                Event::ThreadExited { .. } | Event::ThreadKilled { .. } => Ok(()),
                // Our handler does the work.
                Event::Trap { tid } => session.resume(tid, Some(Signal::SIGTRAP)),
                Event::Signal { tid, signal } => session.resume(tid, Some(signal)),
                Event::GroupStop { tid, .. } => session.listen(tid),
                Event::Attached { tid } => arm(session, tid).and_then(|()| session.resume(tid, None)),
                Event::ThreadCreated { tid, .. } | Event::Interrupted { tid } => session.resume(tid, None),
            };

            match res {
                Ok(()) => {},
                Err(err) if err.thread_died() => {},
                Err(err) => return Some(err),
            }

            let instructions = self.instructions();

            if progress_interval != 0 && instructions >= next_progress {
                let milestone = instructions / progress_interval * progress_interval;
                self.progress.store(milestone, Ordering::Release);

                next_progress = milestone + progress_interval;
            }
        }
    }

    // Every thread is stopped, so the globals are consistent.
    fn save_state(&self, registry: &Registry) {
        if let Some(mut packet) = self.buffer.push(PacketType::SaveState, registry.size() as usize) {
            let payload = packet.payload();
            payload.fill(0);

            // SAFETY: registered globals outlive the trace.
            unsafe { registry.snapshot_into(payload) };
        }
    }

    // Runs on a traced thread, inside the `SIGTRAP` handler.
    fn on_trap(&self, context: &mut libc::ucontext_t) {
        match self.state() {
            RecorderState::Tracing => {},
            RecorderState::Armed => {
                self.transition(RecorderState::Armed, RecorderState::Tracing);
            },
            RecorderState::Disabled | RecorderState::Flushed => {
                x86::clear_trap_flag(context);
                return;
            },
        }

        let registry = match GLOBALS.frozen() {
            Some(registry) => registry,
            None => return,
        };

        let regs = RegisterContext::from_ucontext(context);
        let generation = self.generation.load(Ordering::Acquire);

        // SAFETY: we trapped just before `rip`, so it points at mapped code.
        let code = unsafe { trap::instruction_bytes(regs.rip) };

        let access = TRAP.try_with(|cell| {
            let (owner, mut state) = cell.get();

            if owner != generation {
                state = TrapState::IDLE;
            }

            // SAFETY: registered globals outlive the trace.
            let access = unsafe { trap::step(&mut state, &regs, code, registry, &self.buffer) };
            cell.set((generation, state));

            access
        });

        let promise = CURRENT_PROMISE.try_with(Cell::get).unwrap_or_default();

        match access {
            Ok(Some(Access::Written(_))) if promise.contains(Promise::NO_WRITES) => {
                self.violations.fetch_add(1, Ordering::AcqRel);
            },
            Ok(Some(Access::Unchanged(_))) if promise.contains(Promise::NO_READS) => {
                self.violations.fetch_add(1, Ordering::AcqRel);
            },
            _ => {},
        }

        let count = self.instructions.fetch_add(1, Ordering::AcqRel) + 1;
        let max = self.max_instructions.load(Ordering::Acquire);

        if max != 0 && count >= max {
            self.auto_stop();
        }
    }

    // Flush to the auto-save path and ask the tracer to detach. Allocation-free.
    fn auto_stop(&self) {
        if !self.transition(RecorderState::Tracing, RecorderState::Flushed) {
            return;
        }

        let path = self.auto_save_path.load(Ordering::Acquire);

        if !path.is_null() {
            // SAFETY: `path` is a live, NUL-terminated string.
            let fd = unsafe {
                libc::open(path, libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_CLOEXEC, 0o644)
            };

            if fd >= 0 {
                // SAFETY: we own the new descriptor.
                let mut file = unsafe { File::from_raw_fd(fd) };
                let _ = self.write_trace(&mut file);
            }
        }

        let interrupt = self.interrupt.load(Ordering::Acquire);

        if !interrupt.is_null() {
            // SAFETY: the flag is only released by a later `begin_trace()`.
            unsafe { (*interrupt).store(true, Ordering::Release) };
        }
    }
}

extern "C" fn handle_trap(_signal: libc::c_int, _info: *mut libc::siginfo_t, context: *mut libc::c_void) {
    if context.is_null() {
        return;
    }

    // SAFETY: the kernel passes the interrupted context to `SA_SIGINFO` handlers.
    let context = unsafe { &mut *(context as *mut libc::ucontext_t) };

    RECORDER.on_trap(context);
}

fn install_handler() -> Result<()> {
    let action = SigAction::new(SigHandler::SigAction(handle_trap), SaFlags::SA_SIGINFO, SigSet::empty());

    // SAFETY: the handler only touches atomics, thread-locals and traced memory.
    unsafe { signal::sigaction(Signal::SIGTRAP, &action) }.syscall("sigaction")?;

    Ok(())
}

fn arm(session: &Session, tid: ThreadId) -> Result<()> {
    let offset = x86::eflags_user_offset();
    let eflags = session.read_user(tid, offset)?;

    session.write_user(tid, offset, eflags | TRAP_FLAG)
}

fn disarm(session: &Session, tid: ThreadId) -> Result<()> {
    let offset = x86::eflags_user_offset();
    let eflags = session.read_user(tid, offset)?;

    session.write_user(tid, offset, eflags & !TRAP_FLAG)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_raw() {
        for state in [
            RecorderState::Disabled,
            RecorderState::Armed,
            RecorderState::Tracing,
            RecorderState::Flushed,
        ] {
            assert_eq!(RecorderState::from_raw(state as u8), state);
        }
    }

    #[test]
    fn test_promise_stack() {
        let recorder = TraceRecorder::new();

        recorder.push_promise(Promise::NO_WRITES);
        recorder.push_promise(Promise::NO_READS);
        assert_eq!(CURRENT_PROMISE.with(Cell::get), Promise::NO_READS);

        recorder.pop_promise();
        assert_eq!(CURRENT_PROMISE.with(Cell::get), Promise::NO_WRITES);

        recorder.pop_promise();
        assert_eq!(CURRENT_PROMISE.with(Cell::get), Promise::NO_PROMISES);

        // Underflow only warns.
        recorder.pop_promise();
        assert_eq!(CURRENT_PROMISE.with(Cell::get), Promise::NO_PROMISES);
    }

    #[test]
    fn test_events_are_dropped_while_disabled() {
        let recorder = TraceRecorder::new();
        recorder.buffer.allocate(64);

        recorder.begin_event(EventType(1), Channel::MAIN);
        recorder.end_event(EventType(1), Channel::MAIN);

        assert_eq!(recorder.packets(), Some(vec![]));
    }

    #[test]
    fn test_events_are_recorded_while_armed() {
        let recorder = TraceRecorder::new();
        recorder.buffer.allocate(64);
        recorder.set_state(RecorderState::Armed);

        recorder.begin_event(EventType(1), Channel::INSTRUCTIONS_EXECUTED);
        assert_eq!(recorder.packets(), None);

        recorder.set_state(RecorderState::Flushed);
        let bytes = recorder.packets().unwrap();

        let packets: Vec<_> = crate::packet::Packets::new(&bytes).collect();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].ty, PacketType::BeginEvent);

        let event = EventPacket::decode(packets[0].payload).unwrap();
        assert_eq!(event.channel, Channel::INSTRUCTIONS_EXECUTED);
        assert_eq!(event.thread, gettid().as_raw() as u32);
    }

    #[test]
    fn test_end_trace_without_begin_warns_only() {
        let recorder = TraceRecorder::new();

        assert!(recorder.end_trace().is_ok());
        assert_eq!(recorder.state(), RecorderState::Disabled);
    }
}
