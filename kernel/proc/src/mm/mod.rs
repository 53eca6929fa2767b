//! Memory-management collaborator.
//!
//! The process core only needs a handful of operations from the memory
//! manager: single pages for trap frames, and opaque user address spaces
//! it can create, duplicate, resize and copy bytes into. [`SimMemory`] is
//! the in-process implementation used by [`Machine`](crate::Machine).

pub mod sim;

use core::fmt;

pub use sim::SimMemory;

use crate::config::PAGE_SIZE;
use crate::error::MemError;

/// A physical page frame handed out by the page allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame(u32);

impl Frame {
    /// Creates a frame handle from its index.
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the raw frame number.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the frame index.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame#{}", self.0)
    }
}

/// Handle to a user address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressSpaceId(u32);

impl AddressSpaceId {
    /// Creates a handle from its raw value.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for AddressSpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "as#{}", self.0)
    }
}

/// Rounds `size` up to a whole number of pages.
pub const fn pg_round_up(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Page allocator and user address spaces.
///
/// Implementations are shared between harts and must do their own
/// locking. Methods may be called with a PCB lock held.
pub trait MemoryManager: Send + Sync {
    /// Allocates one zeroed page.
    ///
    /// # Errors
    ///
    /// [`MemError::OutOfMemory`] if no page is free.
    fn alloc_page(&self) -> Result<Frame, MemError>;

    /// Returns a page to the allocator.
    ///
    /// # Panics
    ///
    /// Implementations panic on a frame they never handed out.
    fn free_page(&self, frame: Frame);

    /// Creates an empty user address space.
    ///
    /// # Errors
    ///
    /// [`MemError::OutOfMemory`] if the space's root page cannot be allocated.
    fn create(&self) -> Result<AddressSpaceId, MemError>;

    /// Frees an address space and every page mapped in it.
    fn destroy(&self, space: AddressSpaceId);

    /// Copies the first `size` bytes of `from` into the empty space `to`.
    ///
    /// # Errors
    ///
    /// On failure `to` is left empty and the error is returned.
    fn copy(&self, from: AddressSpaceId, to: AddressSpaceId, size: usize) -> Result<(), MemError>;

    /// Grows a space from `old` to `new` bytes, returning the new size.
    ///
    /// # Errors
    ///
    /// [`MemError::OutOfMemory`] if pages run out; the space keeps its old size.
    fn grow(&self, space: AddressSpaceId, old: usize, new: usize) -> Result<usize, MemError>;

    /// Shrinks a space from `old` to `new` bytes, returning the new size.
    fn shrink(&self, space: AddressSpaceId, old: usize, new: usize) -> usize;

    /// Copies `src` into user memory at `addr`.
    ///
    /// # Errors
    ///
    /// [`MemError::BadAddress`] if the range is not mapped.
    fn copy_out(&self, space: AddressSpaceId, addr: usize, src: &[u8]) -> Result<(), MemError>;

    /// Copies user memory at `addr` into `dst`.
    ///
    /// # Errors
    ///
    /// [`MemError::BadAddress`] if the range is not mapped.
    fn copy_in(&self, space: AddressSpaceId, addr: usize, dst: &mut [u8]) -> Result<(), MemError>;

    /// Returns the number of free bytes in the page allocator.
    fn free_memory(&self) -> usize;
}
