//! Record the memory writes of a running process, from inside the process.
//!
//! The process registers the globals it wants traced, then calls [`begin_trace()`]. A
//! tracer thread group is split off, attaches to every thread with `ptrace(2)`, and
//! single-steps them. Each write to a traced global becomes a packet in an in-memory
//! buffer, saved with [`save_trace()`] once [`end_trace()`] returns.
//!
//! Only Linux on x86-64 can trace. Elsewhere the control functions do nothing, so
//! instrumented code builds unchanged.

pub mod config;
pub mod error;
pub mod instrument;
pub mod packet;
pub mod registry;
pub mod snapshot;
pub mod trace_file;
pub mod trap;
pub mod x86;

#[cfg(target_os = "linux")]
pub mod attach;
#[cfg(target_os = "linux")]
pub mod session;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod recorder;

pub use config::TraceConfig;
pub use error::{Error, Result};
pub use instrument::{Promise, ScopedEvent, ScopedPromise};
pub use packet::{Channel, EventType, PacketType};
pub use registry::translate_address;

#[cfg(target_os = "linux")]
pub use attach::AttachThread;
#[cfg(target_os = "linux")]
pub use session::{AttachReport, Event, Pid, Session};

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use recorder::{RecorderState, RECORDER};

/// True if this platform can record traces.
pub const fn supported() -> bool {
    cfg!(all(target_os = "linux", target_arch = "x86_64"))
}

pub use imp::*;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod imp {
    use std::path::Path;

    use crate::config::TraceConfig;
    use crate::error::Result;
    use crate::instrument::Promise;
    use crate::packet::{Channel, EventType};
    use crate::recorder::RECORDER;
    use crate::registry;

    /// Register `size` bytes at `pointer` for tracing, returning their stable offset.
    ///
    /// Returns `None` once the first trace has begun, or if the region does not fit in
    /// the 32-bit offset space.
    pub fn register_global(name: &'static str, pointer: *const u8, size: usize) -> Option<u32> {
        registry::register_global(name, pointer, size)
    }

    /// Set the configuration used by the next [`begin_trace()`].
    pub fn configure(config: TraceConfig) {
        RECORDER.configure(config)
    }

    pub fn begin_trace() -> Result<()> {
        RECORDER.begin_trace()
    }

    pub fn end_trace() -> Result<()> {
        RECORDER.end_trace()
    }

    pub fn save_trace(path: impl AsRef<Path>) -> Result<()> {
        RECORDER.save_trace(path.as_ref())
    }

    pub fn begin_event(event: EventType, channel: Channel) {
        RECORDER.begin_event(event, channel)
    }

    pub fn end_event(event: EventType, channel: Channel) {
        RECORDER.end_event(event, channel)
    }

    pub fn push_promise(promise: Promise) {
        RECORDER.push_promise(promise)
    }

    pub fn pop_promise() {
        RECORDER.pop_promise()
    }
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
mod imp {
    use std::path::Path;

    use crate::config::TraceConfig;
    use crate::error::Result;
    use crate::instrument::Promise;
    use crate::packet::{Channel, EventType};

    pub fn register_global(_name: &'static str, _pointer: *const u8, _size: usize) -> Option<u32> {
        None
    }

    pub fn configure(_config: TraceConfig) {}

    pub fn begin_trace() -> Result<()> {
        Ok(())
    }

    pub fn end_trace() -> Result<()> {
        Ok(())
    }

    pub fn save_trace(_path: impl AsRef<Path>) -> Result<()> {
        Ok(())
    }

    pub fn begin_event(_event: EventType, _channel: Channel) {}

    pub fn end_event(_event: EventType, _channel: Channel) {}

    pub fn push_promise(_promise: Promise) {}

    pub fn pop_promise() {}
}
