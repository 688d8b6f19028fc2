use std::io;

use nix::errno::Errno;
use nix::unistd::Pid;


pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(
        "Not permitted to attach to our own process with ptrace (ptrace_scope = {scope}). \
         Try running: echo 1 | sudo tee /proc/sys/kernel/yama/ptrace_scope"
    )]
    PolicyForbidden { scope: u32 },

    #[error("Could not attach to thread = {tid}")]
    Attach { tid: Pid, source: nix::Error },

    #[error("Could not detach from thread = {tid}")]
    Detach { tid: Pid, source: nix::Error },

    #[error("Could not restart thread = {tid}")]
    Restart { tid: Pid, source: nix::Error },

    #[error("Thread = {tid} died")]
    ThreadDied { tid: Pid, source: nix::Error },

    #[error("{op} failed")]
    Syscall { op: &'static str, source: nix::Error },

    #[error("A trace is already being recorded")]
    AlreadyTracing,

    #[error("Malformed trace file: {0}")]
    Format(String),

    #[error("Input/output error")]
    IO(#[from] io::Error),

    #[error("OS error")]
    OS(#[from] nix::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True if the error was caused by the traced thread disappearing.
    pub fn thread_died(&self) -> bool {
        match self {
            Error::ThreadDied { .. } => true,
            Error::Attach { source, .. } |
            Error::Detach { source, .. } |
            Error::Restart { source, .. } => *source == Errno::ESRCH,
            _ => false,
        }
    }
}

pub(crate) trait ResultExt<T> {
    /// Map an `ESRCH` failure to [`Error::ThreadDied`] for `tid`.
    fn died_if_esrch(self, tid: Pid) -> Result<T>;

    /// Tag a failure with the name of the syscall that produced it.
    fn syscall(self, op: &'static str) -> Result<T>;
}

impl<T> ResultExt<T> for nix::Result<T> {
    fn died_if_esrch(self, tid: Pid) -> Result<T> {
        self.map_err(|source| {
            if source == Errno::ESRCH {
                Error::ThreadDied { tid, source }
            } else {
                Error::OS(source)
            }
        })
    }

    fn syscall(self, op: &'static str) -> Result<T> {
        self.map_err(|source| Error::Syscall { op, source })
    }
}

macro_rules! internal_error {
    ($msg: expr) => {
        return Err($crate::error::Error::Internal($msg.into()))
    };
}

pub(crate) use internal_error;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_esrch_is_thread_died() {
        let tid = Pid::from_raw(1234);
        let res: nix::Result<()> = Err(Errno::ESRCH);
        let err = res.died_if_esrch(tid).unwrap_err();

        assert!(matches!(err, Error::ThreadDied { .. }));
        assert!(err.thread_died());
    }

    #[test]
    fn test_other_errno_is_os_error() {
        let tid = Pid::from_raw(1234);
        let res: nix::Result<()> = Err(Errno::EPERM);
        let err = res.died_if_esrch(tid).unwrap_err();

        assert!(matches!(err, Error::OS(Errno::EPERM)));
        assert!(!err.thread_died());
    }

    #[test]
    fn test_policy_message_names_the_fix() {
        let err = Error::PolicyForbidden { scope: 3 };
        let msg = err.to_string();

        assert!(msg.contains("ptrace_scope = 3"));
        assert!(msg.contains("/proc/sys/kernel/yama/ptrace_scope"));
    }
}
