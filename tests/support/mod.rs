#![allow(unused)]

use std::process::{Child, Command};
use std::sync::{Mutex, MutexGuard, PoisonError};

use hosttrace::Error;
use lazy_static::lazy_static;
use nix::errno::Errno;

lazy_static! {
    // Sessions wait on any child, so tests that trace must not overlap.
    static ref TRACE_LOCK: Mutex<()> = Mutex::new(());
}

pub fn serialize() -> MutexGuard<'static, ()> {
    TRACE_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn spawn_sleep(seconds: &str) -> std::io::Result<Child> {
    Command::new("sleep").arg(seconds).spawn()
}

pub fn pid_of(child: &Child) -> hosttrace::Pid {
    hosttrace::Pid::from_raw(child.id() as i32)
}

/// True if the environment, rather than the code under test, refused `ptrace`.
pub fn forbidden(err: &Error) -> bool {
    match err {
        Error::PolicyForbidden { .. } => true,
        Error::Attach { source, .. } => *source == Errno::EPERM,
        _ => false,
    }
}
