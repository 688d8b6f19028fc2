//! Annotations placed in traced code.
//!
//! Everything here compiles to nothing useful on platforms without a recorder, so
//! instrumented code does not need its own `cfg`s.

use std::ops::BitOr;

use crate::packet::{Channel, EventType};

/// What a thread promises about its accesses to traced globals.
///
/// Broken promises are counted while tracing and reported when the trace ends.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Promise(u32);

impl Promise {
    pub const NO_PROMISES: Promise = Promise(0);

    /// The thread won't read from a traced global.
    pub const NO_READS: Promise = Promise(1 << 0);

    /// The thread won't write to a traced global.
    pub const NO_WRITES: Promise = Promise(1 << 1);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Promise(bits)
    }

    pub const fn contains(self, other: Promise) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Promise {
    type Output = Promise;

    fn bitor(self, rhs: Promise) -> Promise {
        Promise(self.0 | rhs.0)
    }
}

/// Emits a begin event now and the matching end event when dropped.
#[must_use = "the event ends as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ScopedEvent {
    event: EventType,
    channel: Channel,
}

impl ScopedEvent {
    pub fn new(event: EventType, channel: Channel) -> Self {
        crate::begin_event(event, channel);
        Self { event, channel }
    }
}

impl Drop for ScopedEvent {
    fn drop(&mut self) {
        crate::end_event(self.event, self.channel);
    }
}

/// Holds a promise for the current thread until dropped.
#[must_use = "the promise is withdrawn as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ScopedPromise {
    _private: (),
}

impl ScopedPromise {
    pub fn new(promise: Promise) -> Self {
        crate::push_promise(promise);
        Self { _private: () }
    }
}

impl Drop for ScopedPromise {
    fn drop(&mut self) {
        crate::pop_promise();
    }
}

/// Register a static for tracing, under its own name.
///
/// ```ignore
/// static COUNTER: AtomicU64 = AtomicU64::new(0);
///
/// trace_global!(COUNTER);
/// ```
#[macro_export]
macro_rules! trace_global {
    ($global: expr) => {
        $crate::register_global(
            stringify!($global),
            ::std::ptr::addr_of!($global) as *const u8,
            ::std::mem::size_of_val(&$global),
        )
    };
}

#[macro_export]
macro_rules! trace_begin_event {
    ($event: expr) => {
        $crate::begin_event($event, $crate::Channel::MAIN)
    };
    ($event: expr, $channel: expr) => {
        $crate::begin_event($event, $channel)
    };
}

#[macro_export]
macro_rules! trace_end_event {
    ($event: expr) => {
        $crate::end_event($event, $crate::Channel::MAIN)
    };
    ($event: expr, $channel: expr) => {
        $crate::end_event($event, $channel)
    };
}

/// Trace an event spanning the rest of the enclosing block.
#[macro_export]
macro_rules! trace_scoped_event {
    ($event: expr) => {
        let _scoped_event = $crate::ScopedEvent::new($event, $crate::Channel::MAIN);
    };
    ($event: expr, $channel: expr) => {
        let _scoped_event = $crate::ScopedEvent::new($event, $channel);
    };
}

#[macro_export]
macro_rules! trace_push_promise {
    ($promise: expr) => {
        $crate::push_promise($promise)
    };
}

#[macro_export]
macro_rules! trace_pop_promise {
    () => {
        $crate::pop_promise()
    };
}

/// Hold a promise for the rest of the enclosing block.
#[macro_export]
macro_rules! trace_scoped_promise {
    ($promise: expr) => {
        let _scoped_promise = $crate::ScopedPromise::new($promise);
    };
}
