//! Attaching to every thread of a process, and interpreting what they report.

use std::collections::BTreeMap;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::{
    errno::Errno,
    sys::{
        ptrace::{self, Options},
        signal::Signal,
        wait::{self, WaitPidFlag, WaitStatus},
    },
};
use tracing::{debug, info, warn};

use crate::error::{internal_error, Error, Result, ResultExt};

pub use nix::unistd::Pid;

pub type ProcessId = Pid;
pub type ThreadId = Pid;

const DEFAULT_POLL_DELAY: Duration = Duration::from_micros(1);
const DEFAULT_MAX_POLL_DELAY: Duration = Duration::from_millis(10);

/// Options set on every attached thread, so threads it creates are traced too.
pub const ATTACH_OPTIONS: Options = Options::PTRACE_O_TRACECLONE;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    // Seized, waiting for the attach-stop.
    Attaching,

    // In a ptrace-stop, ready for requests.
    Stopped,

    // Restarted, no expectations for the next stop.
    Running,
}

/// An attached thread.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Thread {
    status: Option<WaitStatus>,
    state: State,

    // Signal to deliver when the thread is detached.
    pending: Option<Signal>,
}

impl Thread {
    fn attaching() -> Self {
        Self { status: None, state: State::Attaching, pending: None }
    }

    /// Most recent `wait(2)` status reported for the thread.
    pub fn status(&self) -> Option<WaitStatus> {
        self.status
    }

    /// True if the thread is in a ptrace-stop.
    pub fn is_stopped(&self) -> bool {
        self.state == State::Stopped
    }
}

/// A state change of an attached thread.
///
/// Every variant except the exits leaves the thread stopped; restart it with
/// [`Session::resume()`] or, for group-stops, [`Session::listen()`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Event {
    /// `tid` created the thread `new`, which is already attached.
    ThreadCreated { tid: ThreadId, new: ThreadId },

    /// An automatically attached thread reported its first stop.
    Attached { tid: ThreadId },

    ThreadExited { tid: ThreadId, exit_code: i32 },

    ThreadKilled { tid: ThreadId, signal: Signal },

    /// Single-step trap, i.e. a signal-delivery-stop for `SIGTRAP`.
    Trap { tid: ThreadId },

    /// Signal-delivery-stop for any other signal.
    Signal { tid: ThreadId, signal: Signal },

    GroupStop { tid: ThreadId, signal: Signal },

    /// Stop requested by [`Session::stop_all()`] or a stray `PTRACE_INTERRUPT`.
    Interrupted { tid: ThreadId },
}

/// Summary of an attach.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AttachReport {
    /// Number of enumeration passes, including the final one that found nothing new.
    pub passes: usize,

    /// Number of attached threads.
    pub threads: usize,
}

/// Tracer for every thread of one process.
///
/// Each thread of a process must be attached separately. A thread is in
/// [`threads()`](Session::threads()) exactly when it is attached.
#[derive(Debug)]
pub struct Session {
    tracee: ProcessId,
    interrupt: Arc<AtomicBool>,
    attached: bool,
    threads: BTreeMap<ThreadId, Thread>,

    /// Time to sleep for before polling threads for new events.
    poll_delay: Duration,

    /// Upper bound on the exponential backoff between polls.
    max_poll_delay: Duration,
}

impl Session {
    pub fn new(tracee: ProcessId, interrupt: Arc<AtomicBool>) -> Self {
        Self {
            tracee,
            interrupt,
            attached: false,
            threads: BTreeMap::new(),
            poll_delay: DEFAULT_POLL_DELAY,
            max_poll_delay: DEFAULT_MAX_POLL_DELAY,
        }
    }

    pub fn tracee(&self) -> ProcessId {
        self.tracee
    }

    /// True once the controller has asked for the session to wind down.
    pub fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Acquire)
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn threads(&self) -> &BTreeMap<ThreadId, Thread> {
        &self.threads
    }

    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.threads.keys().copied().collect()
    }

    pub fn poll_delay(&self) -> Duration {
        self.poll_delay
    }

    pub fn set_poll_delay(&mut self, poll_delay: Duration) {
        self.poll_delay = poll_delay;
    }

    pub fn max_poll_delay(&self) -> Duration {
        self.max_poll_delay
    }

    pub fn set_max_poll_delay(&mut self, max_poll_delay: Duration) {
        self.max_poll_delay = max_poll_delay;
    }

    /// Attach to every thread of the tracee, leaving each one stopped.
    ///
    /// Threads may be created while we enumerate, so enumerate again until a whole pass
    /// attaches nothing new. If any thread fails to attach, every thread is detached.
    ///
    /// Logs nothing while any thread is attached, see [`resume_all()`](Session::resume_all()).
    pub fn attach(&mut self) -> Result<AttachReport> {
        assert!(!self.attached, "session is already attached");

        let mut passes = 0;

        loop {
            passes += 1;

            let mut added = false;

            for tid in enumerate_threads(self.tracee)? {
                if self.threads.contains_key(&tid) {
                    continue;
                }

                match self.attach_thread(tid) {
                    Ok(true) => added = true,
                    Ok(false) => {},
                    Err(err) => {
                        let detached = self.detach_all();

                        warn!(tid = tid.as_raw(), %err, "attach failed, detached from all threads");

                        if let Err(err) = detached {
                            warn!(%err, "failed to detach after failed attach");
                        }

                        return Err(err);
                    },
                }
            }

            if !added {
                break;
            }
        }

        self.attached = true;

        Ok(AttachReport { passes, threads: self.threads.len() })
    }

    // Returns `false` if the thread exited before we could attach.
    fn attach_thread(&mut self, tid: ThreadId) -> Result<bool> {
        match ptrace::seize(tid, Options::empty()) {
            Ok(()) => {},
            Err(Errno::ESRCH) => return Ok(false),
            Err(source) => return Err(Error::Attach { tid, source }),
        }

        self.threads.insert(tid, Thread::attaching());

        match ptrace::interrupt(tid) {
            Ok(()) => {},
            Err(Errno::ESRCH) => {
                self.threads.remove(&tid);
                return Ok(false);
            },
            // Left in the map, so the caller detaches it with the rest.
            Err(source) => return Err(Error::Attach { tid, source }),
        }

        if !self.wait_for_stop(tid)? {
            return Ok(false);
        }

        let res = ptrace::setoptions(tid, ATTACH_OPTIONS);
        self.after_setoptions(tid, res)
    }

    // A thread that died right after its attach-stop was never really attached.
    fn after_setoptions(&mut self, tid: ThreadId, res: nix::Result<()>) -> Result<bool> {
        match res {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => {
                self.threads.remove(&tid);
                Ok(false)
            },
            Err(source) => Err(Error::Attach { tid, source }),
        }
    }

    // Block until `tid` reaches a ptrace-stop. Returns `false` if it exited instead.
    fn wait_for_stop(&mut self, tid: ThreadId) -> Result<bool> {
        loop {
            let status = match wait::waitpid(tid, Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    self.threads.remove(&tid);
                    return Ok(false);
                },
                Err(source) => return Err(Error::Syscall { op: "waitpid", source }),
            };

            match status {
                WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                    self.threads.remove(&tid);
                    return Ok(false);
                },
                WaitStatus::Stopped(_, signal) => {
                    // A signal that arrived first, possibly a single-step trap. Hold it
                    // for restart or detach.
                    let thread = self.thread_mut(tid);
                    thread.status = Some(status);
                    thread.state = State::Stopped;
                    thread.pending = Some(signal);

                    return Ok(true);
                },
                WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_CLONE) => {
                    // The stopped thread just created another. It is auto-attached and
                    // will be picked up by the next enumeration pass or wait.
                    let new = Pid::from_raw(ptrace::getevent(tid).died_if_esrch(tid)? as i32);
                    self.threads.entry(new).or_insert_with(Thread::attaching);

                    let thread = self.thread_mut(tid);
                    thread.status = Some(status);
                    thread.state = State::Stopped;

                    return Ok(true);
                },
                WaitStatus::PtraceEvent(..) => {
                    let thread = self.thread_mut(tid);
                    thread.status = Some(status);
                    thread.state = State::Stopped;

                    return Ok(true);
                },
                WaitStatus::PtraceSyscall(_) |
                WaitStatus::Continued(_) |
                WaitStatus::StillAlive => {
                    internal_error!("unexpected wait status while waiting for a stop");
                },
            }
        }
    }

    fn thread_mut(&mut self, tid: ThreadId) -> &mut Thread {
        self.threads.entry(tid).or_insert_with(Thread::attaching)
    }

    /// Detach from every thread and forget them.
    ///
    /// Threads must be stopped, see [`stop_all()`](Session::stop_all()). A thread that
    /// no longer exists counts as detached.
    pub fn detach(&mut self) -> Result<()> {
        assert!(self.attached, "session is not attached");

        self.detach_all()?;
        self.attached = false;

        info!(pid = self.tracee.as_raw(), "detached from process");

        Ok(())
    }

    fn detach_all(&mut self) -> Result<()> {
        let mut result = Ok(());

        for (tid, thread) in std::mem::take(&mut self.threads) {
            match ptrace::detach(tid, thread.pending) {
                // Already gone, so as good as detached.
                Ok(()) | Err(Errno::ESRCH) => {},
                Err(source) => {
                    if result.is_ok() {
                        result = Err(Error::Detach { tid, source });
                    }
                },
            }
        }

        result
    }

    /// Bring every running thread to a ptrace-stop.
    ///
    /// Threads created in the meantime are waited for too. Signals that arrive first
    /// are held and delivered on the next restart or on detach. Nothing is logged until
    /// every thread has stopped.
    pub fn stop_all(&mut self) -> Result<()> {
        let running = self.threads
            .iter()
            .filter(|(_, thread)| thread.state == State::Running)
            .map(|(tid, _)| *tid);

        for tid in running {
            match ptrace::interrupt(tid) {
                // A thread that is gone reports its exit instead.
                Ok(()) | Err(Errno::ESRCH) => {},
                Err(source) => return Err(Error::Syscall { op: "ptrace(PTRACE_INTERRUPT)", source }),
            }
        }

        loop {
            let next = self.threads
                .iter()
                .find(|(_, thread)| thread.state != State::Stopped)
                .map(|(tid, _)| *tid);

            let tid = match next {
                Some(tid) => tid,
                None => break,
            };

            self.wait_for_stop(tid)?;
        }

        Ok(())
    }

    /// Wait for an attached thread to change state.
    ///
    /// Returns `None` if the session was interrupted or nothing is left to trace. The
    /// interruption flag is checked before every poll, so cancellation takes at most
    /// one [`max_poll_delay()`](Session::max_poll_delay()).
    pub fn wait_for_event(&mut self) -> Result<Option<Event>> {
        let mut poll_delay = self.poll_delay;

        let status = loop {
            if self.interrupted() {
                return Ok(None);
            }

            let flags = WaitPidFlag::__WALL | WaitPidFlag::WNOHANG;

            match wait::waitpid(None, Some(flags)) {
                Ok(WaitStatus::StillAlive) => {
                    std::thread::sleep(poll_delay);
                    poll_delay = (poll_delay * 2).min(self.max_poll_delay);
                },
                Ok(status) => break status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    debug!("no threads left to wait on");
                    return Ok(None);
                },
                Err(source) => return Err(Error::Syscall { op: "waitpid", source }),
            }
        };

        self.translate(status).map(Some)
    }

    fn translate(&mut self, status: WaitStatus) -> Result<Event> {
        let event = match status {
            WaitStatus::Exited(tid, exit_code) => {
                self.threads.remove(&tid);
                Event::ThreadExited { tid, exit_code }
            },
            WaitStatus::Signaled(tid, signal, _core_dumped) => {
                self.threads.remove(&tid);
                Event::ThreadKilled { tid, signal }
            },
            WaitStatus::Stopped(tid, signal) => {
                self.mark_stopped(tid, status);

                if signal == Signal::SIGTRAP {
                    Event::Trap { tid }
                } else {
                    Event::Signal { tid, signal }
                }
            },
            WaitStatus::PtraceEvent(tid, _, libc::PTRACE_EVENT_CLONE) => {
                let new = Pid::from_raw(ptrace::getevent(tid).died_if_esrch(tid)? as i32);

                // The new thread may already have reported its first stop.
                self.threads.entry(new).or_insert_with(Thread::attaching);
                self.mark_stopped(tid, status);

                Event::ThreadCreated { tid, new }
            },
            WaitStatus::PtraceEvent(tid, signal, libc::PTRACE_EVENT_STOP) => {
                let previous = self.threads.get(&tid).map(|thread| thread.state);
                self.mark_stopped(tid, status);

                match previous {
                    // First stop of an auto-attached thread, possibly seen before the
                    // clone event of its creator.
                    Some(State::Attaching) | None => {
                        // Fails only if the thread died, which it reports next.
                        let _ = ptrace::setoptions(tid, ATTACH_OPTIONS);

                        Event::Attached { tid }
                    },
                    Some(_) => {
                        if is_stopping_signal(signal) {
                            Event::GroupStop { tid, signal }
                        } else {
                            Event::Interrupted { tid }
                        }
                    },
                }
            },
            WaitStatus::PtraceEvent(..) => {
                internal_error!("unexpected ptrace-event-stop");
            },
            WaitStatus::PtraceSyscall(_) => {
                internal_error!("unexpected syscall-stop");
            },
            // Assume `!WCONTINUED`.
            WaitStatus::Continued(_) |
            WaitStatus::StillAlive => {
                internal_error!("unreachable `wait()` status");
            },
        };

        Ok(event)
    }

    fn mark_stopped(&mut self, tid: ThreadId, status: WaitStatus) {
        let thread = self.thread_mut(tid);
        thread.status = Some(status);
        thread.state = State::Stopped;
    }

    /// Restart a stopped thread, delivering `signal` if given.
    pub fn resume(&mut self, tid: ThreadId, signal: Option<Signal>) -> Result<()> {
        let res = ptrace::cont(tid, signal);
        self.after_restart(tid, res)
    }

    /// Restart a thread in group-stop without ending the group-stop.
    pub fn listen(&mut self, tid: ThreadId) -> Result<()> {
        // SAFETY: `PTRACE_LISTEN` ignores `addr` and `data`.
        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_LISTEN,
                tid.as_raw(),
                std::ptr::null_mut::<libc::c_void>(),
                std::ptr::null_mut::<libc::c_void>(),
            )
        };

        let res = Errno::result(res).map(drop);
        self.after_restart(tid, res)
    }

    fn after_restart(&mut self, tid: ThreadId, res: nix::Result<()>) -> Result<()> {
        match res {
            Ok(()) => {
                if let Some(thread) = self.threads.get_mut(&tid) {
                    thread.state = State::Running;
                    thread.pending = None;
                }

                Ok(())
            },
            Err(Errno::ESRCH) => Err(Error::ThreadDied { tid, source: Errno::ESRCH }),
            Err(source) => Err(Error::Restart { tid, source }),
        }
    }

    /// Restart every stopped thread, delivering any held signal.
    ///
    /// Logs nothing, since restarted threads may take the logger's lock.
    pub fn resume_all(&mut self) -> Result<()> {
        let stopped: Vec<(ThreadId, Option<Signal>)> = self.threads
            .iter()
            .filter(|(_, thread)| thread.state == State::Stopped)
            .map(|(tid, thread)| (*tid, thread.pending))
            .collect();

        for (tid, pending) in stopped {
            match self.resume(tid, pending) {
                // It reports its exit next.
                Ok(()) => {},
                Err(err) if err.thread_died() => {},
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    /// Resume every thread and let them run, untouched, until interrupted.
    ///
    /// Signals are delivered as they would be without a tracer.
    pub fn forward_events(&mut self) -> Result<()> {
        self.resume_all()?;

        loop {
            let event = match self.wait_for_event() {
                Ok(Some(event)) => event,
                Ok(None) => return Ok(()),
                Err(err) if err.thread_died() => continue,
                Err(err) => return Err(err),
            };

            let res = match event {
                Event::ThreadExited { .. } | Event::ThreadKilled { .. } => Ok(()),
                Event::Trap { tid } => self.resume(tid, Some(Signal::SIGTRAP)),
                Event::Signal { tid, signal } => self.resume(tid, Some(signal)),
                Event::GroupStop { tid, .. } => self.listen(tid),
                Event::ThreadCreated { tid, .. } |
                Event::Attached { tid } |
                Event::Interrupted { tid } => self.resume(tid, None),
            };

            match res {
                Ok(()) => {},
                Err(err) if err.thread_died() => {},
                Err(err) => return Err(err),
            }
        }
    }

    /// Read a word of a stopped thread's `user` area.
    pub fn read_user(&self, tid: ThreadId, offset: u64) -> Result<u64> {
        // SAFETY: `offset` is not used as a pointer by the kernel, only checked against
        // the size of the `user` struct.
        let data = unsafe {
            Errno::clear();
            libc::ptrace(
                libc::PTRACE_PEEKUSER,
                tid.as_raw(),
                offset as *mut libc::c_void,
                std::ptr::null_mut::<libc::c_void>(),
            )
        };

        if data == -1 {
            let errno = Errno::last();

            if errno != Errno::UnknownErrno {
                let res: nix::Result<u64> = Err(errno);
                return res.died_if_esrch(tid);
            }
        }

        Ok(data as u64)
    }

    /// Write a word of a stopped thread's `user` area.
    pub fn write_user(&self, tid: ThreadId, offset: u64, data: u64) -> Result<()> {
        // SAFETY: see `read_user()`.
        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_POKEUSER,
                tid.as_raw(),
                offset as *mut libc::c_void,
                data as *mut libc::c_void,
            )
        };

        Errno::result(res).map(drop).died_if_esrch(tid)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.attached {
            if let Err(err) = self.detach() {
                warn!(%err, "failed to detach while dropping session");
            }
        }
    }
}

/// List the threads of `pid` from `/proc/<pid>/task`.
pub fn enumerate_threads(pid: ProcessId) -> Result<Vec<ThreadId>> {
    let mut threads = vec![];

    for entry in fs::read_dir(format!("/proc/{}/task", pid.as_raw()))? {
        let name = entry?.file_name();

        if let Some(tid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) {
            if tid != 0 {
                threads.push(Pid::from_raw(tid));
            }
        }
    }

    threads.sort();

    Ok(threads)
}

// Only these four signals stop a thread group.
fn is_stopping_signal(signal: Signal) -> bool {
    use Signal::*;

    matches!(signal, SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enumerate_own_threads() {
        let pid = nix::unistd::getpid();
        let threads = enumerate_threads(pid).unwrap();

        assert!(threads.contains(&pid));
    }

    #[test]
    fn test_interrupted_session_returns_no_event() {
        let interrupt = Arc::new(AtomicBool::new(true));
        let mut session = Session::new(nix::unistd::getpid(), interrupt);

        assert_eq!(session.wait_for_event().unwrap(), None);
    }

    #[test]
    fn test_thread_dying_before_setoptions_is_skipped() {
        let interrupt = Arc::new(AtomicBool::new(false));
        let mut session = Session::new(nix::unistd::getpid(), interrupt);
        let tid = Pid::from_raw(12345);

        session.threads.insert(tid, Thread::attaching());
        assert!(!session.after_setoptions(tid, Err(Errno::ESRCH)).unwrap());
        assert!(session.threads().is_empty());

        session.threads.insert(tid, Thread::attaching());
        let err = session.after_setoptions(tid, Err(Errno::EPERM)).unwrap_err();
        assert!(matches!(err, Error::Attach { source: Errno::EPERM, .. }));
        assert!(session.threads().contains_key(&tid));

        assert!(session.after_setoptions(tid, Ok(())).unwrap());
    }

    #[test]
    fn test_stopping_signals() {
        assert!(is_stopping_signal(Signal::SIGTSTP));
        assert!(!is_stopping_signal(Signal::SIGTRAP));
    }
}
