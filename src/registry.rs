//! Named host memory regions opted into tracing, and their stable offsets.
//!
//! Each region is assigned an offset in a virtual address space that does not depend on
//! where the region was loaded, so traces of two runs can be compared byte for byte.

use std::sync::{Mutex, OnceLock, PoisonError};

use tracing::{debug, warn};

/// Alignment of each region's offset.
pub const GLOBAL_ALIGNMENT: u32 = 16;

/// A registered region.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TracedGlobal {
    pub name: &'static str,
    pub address: usize,
    pub offset: u32,
    pub size: u32,
}

impl TracedGlobal {
    fn contains(&self, address: usize) -> bool {
        address >= self.address && address - self.address < self.size as usize
    }
}

/// Where a host address landed in the offset space.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Resolved {
    /// Offset of the address itself, including its delta into the region.
    pub offset: u32,

    /// Bytes left in the region from the address to its end.
    pub remaining: u32,
}

/// Append-only table of traced regions.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Registry {
    globals: Vec<TracedGlobal>,
    size: u32,
}

impl Registry {
    pub const fn new() -> Self {
        Self { globals: Vec::new(), size: 0 }
    }

    /// Register `size` bytes at `pointer` and return the region's offset.
    ///
    /// Registering the same name and pointer again returns the original offset. Returns
    /// `None` if the region does not fit in the 32-bit offset space.
    pub fn register(&mut self, name: &'static str, pointer: *const u8, size: usize) -> Option<u32> {
        let address = pointer as usize;

        if let Some(existing) = self.globals.iter().find(|g| g.name == name && g.address == address) {
            return Some(existing.offset);
        }

        let placed = u32::try_from(size).ok().and_then(|size| {
            let offset = align_up(self.size, GLOBAL_ALIGNMENT)?;
            let end = offset.checked_add(size)?;

            Some((offset, size, end))
        });

        let (offset, size, end) = match placed {
            Some(placed) => placed,
            None => {
                warn!(name, size, total = self.size, "traced global overflows the offset space, ignoring");
                return None;
            },
        };

        self.globals.push(TracedGlobal { name, address, offset, size });
        self.size = end;

        debug!(name, offset, size, "registered traced global");

        Some(offset)
    }

    /// Translate a host address into its offset, if it lies in a registered region.
    pub fn translate(&self, pointer: *const u8) -> Option<u32> {
        self.resolve(pointer as usize).map(|r| r.offset)
    }

    pub fn resolve(&self, address: usize) -> Option<Resolved> {
        self.globals.iter().find(|g| g.contains(address)).map(|g| {
            // Below `size`, and `offset + size` fits, see `register()`.
            let delta = (address - g.address) as u32;

            Resolved {
                offset: g.offset + delta,
                remaining: g.size - delta,
            }
        })
    }

    pub fn globals(&self) -> &[TracedGlobal] {
        &self.globals
    }

    /// Size of the offset space, i.e. of a full state snapshot.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.globals.is_empty()
    }

    /// Copy the current contents of every region into `state` at its offset.
    ///
    /// # Safety
    ///
    /// Every registered region must still be valid for reads.
    pub unsafe fn snapshot_into(&self, state: &mut [u8]) {
        for global in &self.globals {
            let start = global.offset as usize;
            let end = start + global.size as usize;

            if let Some(dst) = state.get_mut(start..end) {
                std::ptr::copy_nonoverlapping(global.address as *const u8, dst.as_mut_ptr(), dst.len());
            }
        }
    }
}

fn align_up(value: u32, alignment: u32) -> Option<u32> {
    debug_assert!(alignment.is_power_of_two());
    value.checked_add(alignment - 1).map(|value| value & !(alignment - 1))
}

/// The process-wide registry.
///
/// Registration is expected during start-up, from a single thread. The first trace
/// freezes the table; afterwards it is read without locking.
pub struct GlobalRegistry {
    pending: Mutex<Registry>,
    frozen: OnceLock<Registry>,
}

impl GlobalRegistry {
    pub const fn new() -> Self {
        Self {
            pending: Mutex::new(Registry::new()),
            frozen: OnceLock::new(),
        }
    }

    /// Register a region. Returns `None` if the registry has already been frozen, or if
    /// the region does not fit.
    pub fn register(&self, name: &'static str, pointer: *const u8, size: usize) -> Option<u32> {
        if self.frozen.get().is_some() {
            warn!(name, "traced global registered after the first trace started, ignoring");
            return None;
        }

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.register(name, pointer, size)
    }

    /// Translate through the frozen table, or through the pending one before any trace.
    pub fn translate(&self, pointer: *const u8) -> Option<u32> {
        if let Some(frozen) = self.frozen.get() {
            return frozen.translate(pointer);
        }

        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.translate(pointer)
    }

    /// Freeze the table. Later calls return the same table.
    pub fn freeze(&self) -> &Registry {
        self.frozen.get_or_init(|| {
            let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.clone()
        })
    }

    /// The frozen table, if tracing has ever started.
    pub fn frozen(&self) -> Option<&Registry> {
        self.frozen.get()
    }
}

impl Default for GlobalRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub static GLOBALS: GlobalRegistry = GlobalRegistry::new();

/// Register a region with the process-wide registry.
pub fn register_global(name: &'static str, pointer: *const u8, size: usize) -> Option<u32> {
    GLOBALS.register(name, pointer, size)
}

/// Translate a host address through the process-wide registry.
pub fn translate_address(pointer: *const u8) -> Option<u32> {
    GLOBALS.translate(pointer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_are_aligned_bump_allocated() {
        let a = [0u8; 10];
        let b = [0u8; 3];
        let c = [0u8; 32];

        let mut registry = Registry::new();

        assert_eq!(registry.register("a", a.as_ptr(), a.len()), Some(0));
        assert_eq!(registry.register("b", b.as_ptr(), b.len()), Some(16));
        assert_eq!(registry.register("c", c.as_ptr(), c.len()), Some(32));
        assert_eq!(registry.size(), 64);
    }

    #[test]
    fn test_register_is_idempotent() {
        let a = [0u8; 10];

        let mut registry = Registry::new();
        let first = registry.register("a", a.as_ptr(), a.len());
        let second = registry.register("a", a.as_ptr(), a.len());

        assert_eq!(first, second);
        assert_eq!(registry.globals().len(), 1);
    }

    #[test]
    fn test_translate_bounds() {
        let a = [0u8; 10];
        let b = [0u8; 3];

        let mut registry = Registry::new();
        registry.register("a", a.as_ptr(), a.len());
        registry.register("b", b.as_ptr(), b.len());

        let base = b.as_ptr();

        assert_eq!(registry.translate(base), Some(16));
        assert_eq!(registry.translate(base.wrapping_add(2)), Some(18));
        assert_eq!(registry.translate(base.wrapping_add(3)), None);
        assert_eq!(registry.translate(a.as_ptr().wrapping_add(9)), Some(9));
        assert_eq!(registry.translate(std::ptr::null()), None);
    }

    #[test]
    fn test_resolve_reports_remaining_bytes() {
        let a = [0u8; 10];

        let mut registry = Registry::new();
        registry.register("a", a.as_ptr(), a.len());

        let resolved = registry.resolve(a.as_ptr() as usize + 6).unwrap();
        assert_eq!(resolved, Resolved { offset: 6, remaining: 4 });
    }

    #[test]
    fn test_snapshot_copies_at_offsets() {
        let a = [1u8, 2, 3];
        let b = [9u8, 8];

        let mut registry = Registry::new();
        registry.register("a", a.as_ptr(), a.len());
        registry.register("b", b.as_ptr(), b.len());

        let mut state = vec![0u8; registry.size() as usize];
        unsafe { registry.snapshot_into(&mut state) };

        assert_eq!(&state[0..3], &a);
        assert_eq!(&state[16..18], &b);
        assert_eq!(state[3..16].iter().filter(|&&x| x != 0).count(), 0);
    }

    #[test]
    fn test_offset_space_overflow_is_rejected() {
        let a = [0u8; 4];
        let base = a.as_ptr();

        let mut registry = Registry::new();
        assert_eq!(registry.register("huge", base, u32::MAX as usize - 4), Some(0));

        // No room left to align the next offset.
        assert_eq!(registry.register("next", base.wrapping_add(1), 1), None);
        assert_eq!(registry.register("wide", base.wrapping_add(2), u32::MAX as usize + 1), None);

        assert_eq!(registry.globals().len(), 1);
        assert_eq!(registry.size(), u32::MAX - 4);

        let last = registry.resolve(base as usize + (u32::MAX as usize - 5));
        assert_eq!(last, Some(Resolved { offset: u32::MAX - 5, remaining: 1 }));
    }

    #[test]
    fn test_global_registry_translates_before_freeze() {
        let a = [0u8; 8];

        let registry = GlobalRegistry::new();
        assert_eq!(registry.register("a", a.as_ptr(), a.len()), Some(0));
        assert_eq!(registry.translate(a.as_ptr().wrapping_add(3)), Some(3));

        registry.freeze();
        assert_eq!(registry.translate(a.as_ptr().wrapping_add(3)), Some(3));
        assert_eq!(registry.translate(a.as_ptr().wrapping_add(8)), None);
    }

    #[test]
    fn test_global_registry_rejects_after_freeze() {
        let a = [0u8; 4];
        let b = [0u8; 4];

        let registry = GlobalRegistry::new();
        assert_eq!(registry.register("a", a.as_ptr(), a.len()), Some(0));

        let frozen = registry.freeze();
        assert_eq!(frozen.globals().len(), 1);

        assert_eq!(registry.register("b", b.as_ptr(), b.len()), None);
        assert_eq!(registry.freeze().globals().len(), 1);
    }
}
