//! Attaching a debugger to our own process.
//!
//! A process cannot ptrace itself, and no thread can trace a thread of its own thread
//! group. So we split off a second thread group that shares our address space with
//! `clone(CLONE_VM)`, grant it permission to trace us, and let it attach to every one
//! of our threads.
//!
//! Without `CLONE_SETTLS`, the tracer runs on the thread-local storage of the thread
//! that cloned it: `errno`, the allocator's thread cache, the logger's state. So the
//! clone is made from a host thread of its own, which then does nothing but block in
//! `waitpid()` until the tracer exits. None of our other threads share that storage.
//!
//! The tracer never logs while any of our threads is attached, since a thread stopped
//! while holding the logger's lock would never release it.

use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::{
    errno::Errno,
    sys::wait::{self, WaitPidFlag},
    unistd::{self, Pid},
};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::session::{AttachReport, Session};

pub const PTRACE_SCOPE_PATH: &str = "/proc/sys/kernel/yama/ptrace_scope";

/// Work run on the tracer once every thread is attached and stopped.
///
/// The session is stopped and detached after it returns.
pub type TracerFn = Box<dyn FnOnce(&mut Session) + Send>;

/// Check that the Yama LSM lets us trace ourselves.
pub fn preflight() -> Result<()> {
    preflight_from(Path::new(PTRACE_SCOPE_PATH))
}

/// Like [`preflight()`], reading the policy from `path`.
///
/// A missing file means Yama is not enabled, so there is no extra restriction.
pub fn preflight_from(path: &Path) -> Result<()> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    let scope = match contents.trim().parse::<u32>() {
        Ok(scope) => scope,
        Err(_) => {
            warn!(?contents, "unrecognized ptrace scope, assuming self-trace is allowed");
            return Ok(());
        },
    };

    // 2 is "admin-only attach", 3 is "no attach".
    if scope > 1 {
        return Err(Error::PolicyForbidden { scope });
    }

    Ok(())
}

// One-shot value handed from one thread group to the other.
#[derive(Debug)]
struct Latch<T> {
    slot: Mutex<Slot<T>>,
    cond: Condvar,
}

#[derive(Debug)]
enum Slot<T> {
    Empty,
    Set(T),
    Taken,
}

impl<T> Latch<T> {
    fn new() -> Self {
        Self { slot: Mutex::new(Slot::Empty), cond: Condvar::new() }
    }

    // Returns `false` if the latch had already fired.
    fn set(&self, value: T) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);

        if !matches!(*slot, Slot::Empty) {
            return false;
        }

        *slot = Slot::Set(value);
        self.cond.notify_all();

        true
    }

    // Block until the latch fires. Returns `None` if the value was already taken.
    fn wait(&self) -> Option<T> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);

        while matches!(*slot, Slot::Empty) {
            slot = self.cond.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }

        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Set(value) => Some(value),
            _ => None,
        }
    }
}

// State shared by the caller and the tracer thread group.
struct Shared {
    tracee: Pid,
    interrupt: Arc<AtomicBool>,
    poll_delay: Duration,
    max_poll_delay: Duration,

    // The tracer's pid, sent by the tracer itself, or why it could not be spawned.
    spawned: Latch<Result<Pid>>,

    // `false` tells the tracer to give up without attaching.
    permission: Latch<bool>,

    attached: Latch<Result<AttachReport>>,
}

struct TracerArgs {
    shared: Arc<Shared>,
    body: TracerFn,
}

#[derive(Debug)]
struct Tracer {
    pid: Pid,

    // Reaps the tracer, and owns its stack and thread-local storage.
    host: JoinHandle<()>,
}

#[derive(Debug)]
enum Phase {
    NotStarted,
    Started(Tracer),
    Stopped,
}

/// A second thread group, in our own address space, that traces every thread of ours.
#[derive(Debug)]
pub struct AttachThread {
    interrupt: Arc<AtomicBool>,
    poll_delay: Duration,
    max_poll_delay: Duration,
    phase: Phase,
}

impl AttachThread {
    pub fn new() -> Self {
        Self {
            interrupt: Arc::new(AtomicBool::new(false)),
            poll_delay: Duration::from_micros(1),
            max_poll_delay: Duration::from_millis(10),
            phase: Phase::NotStarted,
        }
    }

    /// The flag that tells the tracer's event loop to return.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub fn set_poll_delays(&mut self, poll_delay: Duration, max_poll_delay: Duration) {
        self.poll_delay = poll_delay;
        self.max_poll_delay = max_poll_delay;
    }

    pub fn is_started(&self) -> bool {
        matches!(self.phase, Phase::Started(_))
    }

    pub fn tracer_pid(&self) -> Option<Pid> {
        match &self.phase {
            Phase::Started(tracer) => Some(tracer.pid),
            _ => None,
        }
    }

    /// Spawn the tracer and block until it has attached to every thread of ours.
    ///
    /// `body` then runs on the tracer. Our threads, including the calling one, stay
    /// stopped until `body` resumes them.
    ///
    /// # Panics
    ///
    /// If the tracer has already been started.
    pub fn start(&mut self, stack_size: usize, body: TracerFn) -> Result<AttachReport> {
        assert!(matches!(self.phase, Phase::NotStarted), "tracer already started");

        preflight()?;

        let tracee = unistd::getpid();

        let shared = Arc::new(Shared {
            tracee,
            interrupt: Arc::clone(&self.interrupt),
            poll_delay: self.poll_delay,
            max_poll_delay: self.max_poll_delay,
            spawned: Latch::new(),
            permission: Latch::new(),
            attached: Latch::new(),
        });

        let args = TracerArgs { shared: Arc::clone(&shared), body };

        let host = thread::Builder::new()
            .name("hosttrace-tracer".into())
            .spawn(move || host_tracer(stack_size, args))?;

        let spawned = shared.spawned
            .wait()
            .unwrap_or_else(|| Err(Error::Internal("tracer reported its pid twice".into())));

        let pid = match spawned {
            Ok(pid) => pid,
            Err(err) => {
                join_host(host);
                return Err(err);
            },
        };

        debug!(tracer = pid.as_raw(), tracee = tracee.as_raw(), "spawned tracer");

        // Under Yama's "restricted" scope, only ancestors may trace, unless we name the
        // tracer. Without Yama, the call fails with `EINVAL` and is not needed.
        //
        // SAFETY: plain integer arguments.
        let res = unsafe { libc::prctl(libc::PR_SET_PTRACER, pid.as_raw() as libc::c_ulong, 0, 0, 0) };

        match Errno::result(res) {
            Ok(_) => {},
            Err(Errno::EINVAL) => {
                debug!("yama not enabled, no need to name the tracer");
            },
            Err(source) => {
                shared.permission.set(false);
                join_host(host);

                return Err(Error::Syscall { op: "prctl(PR_SET_PTRACER)", source });
            },
        }

        shared.permission.set(true);

        let outcome = shared.attached
            .wait()
            .unwrap_or_else(|| Err(Error::Internal("tracer reported attach twice".into())));

        match outcome {
            Ok(report) => {
                info!(tracer = pid.as_raw(), threads = report.threads, passes = report.passes, "tracer attached");
                self.phase = Phase::Started(Tracer { pid, host });

                Ok(report)
            },
            Err(err) => {
                join_host(host);

                Err(err)
            },
        }
    }

    /// Tell the tracer to detach, and wait for it to exit.
    ///
    /// # Panics
    ///
    /// If the tracer is not running.
    pub fn stop(&mut self) {
        let tracer = match std::mem::replace(&mut self.phase, Phase::Stopped) {
            Phase::Started(tracer) => tracer,
            phase => panic!("tracer not running: {:?}", phase),
        };

        self.interrupt.store(true, Ordering::Release);
        join_host(tracer.host);

        info!(tracer = tracer.pid.as_raw(), "tracer stopped");
    }
}

impl Default for AttachThread {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AttachThread {
    fn drop(&mut self) {
        if self.is_started() {
            self.stop();
        }
    }
}

// Runs on the host thread. Between `clone()` and the return of `waitpid()` the tracer
// owns this thread's thread-local storage, so nothing here may touch it.
fn host_tracer(stack_size: usize, args: TracerArgs) {
    let shared = Arc::clone(&args.shared);
    let mut stack = vec![0u8; stack_size];

    // The stack grows down from its 16-byte aligned top.
    let top = stack.as_mut_ptr() as usize + stack.len();
    let top = (top & !0xf) as *mut libc::c_void;

    let args = Box::into_raw(Box::new(args));

    // No exit signal: the tracer is reaped with `__WALL`.
    //
    // SAFETY: `top` is the top of a live stack that we keep until the tracer is
    // reaped, and `run_tracer()` takes ownership of `args`.
    let res = unsafe { libc::clone(run_tracer, top, libc::CLONE_VM, args as *mut libc::c_void) };

    if res == -1 {
        let source = Errno::last();

        // SAFETY: the tracer was not created, so nothing else owns `args`.
        drop(unsafe { Box::from_raw(args) });

        shared.spawned.set(Err(Error::Syscall { op: "clone", source }));
        return;
    }

    reap(Pid::from_raw(res));

    drop(stack);
}

fn join_host(host: JoinHandle<()>) {
    if host.join().is_err() {
        error!("tracer host thread panicked");
    }
}

fn reap(pid: Pid) {
    loop {
        match wait::waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Ok(status) => {
                debug!(tracer = pid.as_raw(), ?status, "reaped tracer");
                return;
            },
            Err(Errno::EINTR) => continue,
            Err(err) => {
                error!(tracer = pid.as_raw(), %err, "failed to reap tracer");
                return;
            },
        }
    }
}

extern "C" fn run_tracer(arg: *mut libc::c_void) -> libc::c_int {
    // SAFETY: `arg` came from `Box::into_raw()` in `host_tracer()`, which gave up
    // ownership.
    let args = unsafe { Box::from_raw(arg as *mut TracerArgs) };
    let shared = Arc::clone(&args.shared);

    match panic::catch_unwind(AssertUnwindSafe(move || trace_parent(*args))) {
        Ok(code) => code,
        Err(_) => {
            // Never leave `start()` waiting.
            shared.spawned.set(Err(Error::Internal("tracer panicked".into())));
            shared.attached.set(Err(Error::Internal("tracer panicked".into())));
            101
        },
    }
}

fn trace_parent(args: TracerArgs) -> libc::c_int {
    let TracerArgs { shared, body } = args;

    shared.spawned.set(Ok(unistd::getpid()));

    if shared.permission.wait() != Some(true) {
        return 1;
    }

    let mut session = Session::new(shared.tracee, Arc::clone(&shared.interrupt));
    session.set_poll_delay(shared.poll_delay);
    session.set_max_poll_delay(shared.max_poll_delay);

    match session.attach() {
        Ok(report) => {
            shared.attached.set(Ok(report));
        },
        Err(err) => {
            shared.attached.set(Err(err));
            return 1;
        },
    }

    body(&mut session);

    if !session.is_attached() {
        return 0;
    }

    let stopped = session.stop_all();
    let detached = session.detach();

    if let Err(err) = stopped {
        warn!(%err, "failed to stop threads before detach");
    }

    match detached {
        Ok(()) => 0,
        Err(err) => {
            error!(%err, "failed to detach from tracee");
            1
        },
    }
}
