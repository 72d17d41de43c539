//! Spin-locked wrapper usable as a `#[global_allocator]`.
//!
//! [`HalfFit`] itself is not `Sync`. The wrapper serializes every call with a
//! spin lock and only supports layouts aligned to at most
//! [`PAYLOAD_ALIGN`](crate::PAYLOAD_ALIGN).

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use log::warn;
use spin::Mutex;

use crate::{
    PAYLOAD_ALIGN,
    arena::{Arena, ArenaStorage},
    heap::HalfFit,
};

/// A [`HalfFit`] allocator behind a spin lock.
///
/// The allocator starts out empty and hands out null pointers until
/// [`init`](Self::init) gives it an arena, so it can be declared as a
/// `#[global_allocator]` static.
pub struct LockedHalfFit {
    inner: Mutex<Option<HalfFit<'static>>>,
}

impl Default for LockedHalfFit {
    fn default() -> Self {
        Self::new()
    }
}

impl LockedHalfFit {
    /// Creates an allocator without an arena.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Hands `storage` to the allocator and formats it.
    ///
    /// Calling this again replaces the arena; pointers allocated from the
    /// previous one must no longer be passed to this allocator.
    pub fn init(&self, storage: &'static mut ArenaStorage) {
        *self.inner.lock() = Some(HalfFit::new(Arena::new(storage)));
    }

    /// Returns `true` once [`init`](Self::init) has been called.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Runs `f` with exclusive access to the allocator, or returns `None` if
    /// it has no arena yet.
    pub fn with<F, T>(&self, f: F) -> Option<T>
    where
        F: FnOnce(&mut HalfFit<'static>) -> T,
    {
        self.inner.lock().as_mut().map(f)
    }
}

unsafe impl GlobalAlloc for LockedHalfFit {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > PAYLOAD_ALIGN {
            warn!("unsupported alignment: {layout:?}");
            return ptr::null_mut();
        }
        self.with(|heap| heap.allocate(layout.size()))
            .flatten()
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        self.with(|heap| unsafe { heap.deallocate(ptr) });
    }
}
