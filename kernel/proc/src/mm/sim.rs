//! In-process page allocator and address spaces.
//!
//! Physical memory is a boxed array of pages. Free pages form an intrusive
//! stack: the first four bytes of each free page hold the index of the
//! next one. Address spaces are plain page lists, one root page each.
//!
//! Lock order: `vm` before `kmem`.

use hearth_core::sync::SpinLock;

use super::{AddressSpaceId, Frame, MemoryManager};
use crate::config::PAGE_SIZE;
use crate::error::MemError;

const NIL: u32 = u32::MAX;
/// Fill byte for freed pages, to catch dangling users.
const JUNK: u8 = 1;

struct Pool {
    frames: Box<[[u8; PAGE_SIZE]]>,
    allocated: Box<[bool]>,
    head: u32,
    free: usize,
}

impl Pool {
    fn alloc(&mut self) -> Option<Frame> {
        if self.head == NIL {
            return None;
        }
        let frame = Frame::new(self.head);
        let page = &mut self.frames[frame.index()];
        let next = u32::from_ne_bytes([page[0], page[1], page[2], page[3]]);
        page.fill(0);
        self.allocated[frame.index()] = true;
        self.head = next;
        self.free -= 1;
        Some(frame)
    }

    fn free(&mut self, frame: Frame) {
        let index = frame.index();
        if index >= self.frames.len() || !self.allocated[index] {
            panic!("kfree: {frame} is not allocated");
        }
        let page = &mut self.frames[index];
        page.fill(JUNK);
        page[..4].copy_from_slice(&self.head.to_ne_bytes());
        self.allocated[index] = false;
        self.head = frame.as_u32();
        self.free += 1;
    }
}

struct Space {
    root: Frame,
    pages: Vec<Frame>,
}

/// Simulated physical memory and user address spaces.
pub struct SimMemory {
    kmem: SpinLock<Pool>,
    vm: SpinLock<Vec<Option<Space>>>,
    npages: usize,
}

impl SimMemory {
    /// Creates an allocator owning `npages` pages, all free.
    ///
    /// # Panics
    ///
    /// Panics if `npages` does not fit a frame index.
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(npages: usize) -> Self {
        assert!(
            u32::try_from(npages).is_ok_and(|n| n != NIL),
            "kinit: page count exceeds frame index range"
        );
        let mut frames = vec![[0u8; PAGE_SIZE]; npages].into_boxed_slice();
        // Thread the free stack through the pages, lowest index on top.
        for (i, page) in frames.iter_mut().enumerate() {
            let next = if i + 1 == npages { NIL } else { (i + 1) as u32 };
            page.fill(JUNK);
            page[..4].copy_from_slice(&next.to_ne_bytes());
        }
        Self {
            kmem: SpinLock::named(
                "kmem",
                Pool {
                    frames,
                    allocated: vec![false; npages].into_boxed_slice(),
                    head: if npages == 0 { NIL } else { 0 },
                    free: npages,
                },
            ),
            vm: SpinLock::named("vm", Vec::new()),
            npages,
        }
    }

    /// Returns the number of pages the allocator manages.
    pub fn total_pages(&self) -> usize {
        self.npages
    }

    /// Returns the number of free pages.
    pub fn free_pages(&self) -> usize {
        self.kmem.lock().free
    }

    /// Returns the number of live address spaces.
    pub fn spaces(&self) -> usize {
        self.vm.lock().iter().flatten().count()
    }

    /// Walks the user range `[addr, addr + len)` page by page, calling `f`
    /// with each frame, the offset within it and the chunk's offset in the
    /// range.
    fn walk(
        &self,
        space: AddressSpaceId,
        addr: usize,
        len: usize,
        mut f: impl FnMut(&mut Pool, Frame, usize, core::ops::Range<usize>),
    ) -> Result<(), MemError> {
        let vm = self.vm.lock();
        let sp = lookup(&vm, space)?;
        let end = addr.checked_add(len).ok_or(MemError::BadAddress)?;
        if end > sp.pages.len() * PAGE_SIZE {
            return Err(MemError::BadAddress);
        }
        let mut pool = self.kmem.lock();
        let mut va = addr;
        while va < end {
            let offset = va % PAGE_SIZE;
            let n = (PAGE_SIZE - offset).min(end - va);
            let done = va - addr;
            f(&mut pool, sp.pages[va / PAGE_SIZE], offset, done..done + n);
            va += n;
        }
        Ok(())
    }
}

fn lookup(spaces: &[Option<Space>], id: AddressSpaceId) -> Result<&Space, MemError> {
    spaces
        .get(id.as_usize())
        .and_then(Option::as_ref)
        .ok_or(MemError::NoSuchSpace)
}

fn lookup_mut(spaces: &mut [Option<Space>], id: AddressSpaceId) -> Result<&mut Space, MemError> {
    spaces
        .get_mut(id.as_usize())
        .and_then(Option::as_mut)
        .ok_or(MemError::NoSuchSpace)
}

impl MemoryManager for SimMemory {
    fn alloc_page(&self) -> Result<Frame, MemError> {
        self.kmem.lock().alloc().ok_or(MemError::OutOfMemory)
    }

    fn free_page(&self, frame: Frame) {
        self.kmem.lock().free(frame);
    }

    fn create(&self) -> Result<AddressSpaceId, MemError> {
        let mut vm = self.vm.lock();
        let root = self.alloc_page()?;
        let space = Space {
            root,
            pages: Vec::new(),
        };
        let index = match vm.iter().position(Option::is_none) {
            Some(i) => {
                vm[i] = Some(space);
                i
            }
            None => {
                vm.push(Some(space));
                vm.len() - 1
            }
        };
        let raw = u32::try_from(index).map_err(|_| MemError::OutOfMemory)?;
        Ok(AddressSpaceId::new(raw))
    }

    fn destroy(&self, space: AddressSpaceId) {
        let mut vm = self.vm.lock();
        let Some(sp) = vm.get_mut(space.as_usize()).and_then(Option::take) else {
            panic!("uvmfree: {space} does not exist");
        };
        let mut pool = self.kmem.lock();
        for frame in sp.pages {
            pool.free(frame);
        }
        pool.free(sp.root);
    }

    fn copy(&self, from: AddressSpaceId, to: AddressSpaceId, size: usize) -> Result<(), MemError> {
        let mut vm = self.vm.lock();
        let npages = size.div_ceil(PAGE_SIZE);
        let src = lookup(&vm, from)?;
        if src.pages.len() < npages {
            return Err(MemError::BadAddress);
        }
        let src: Vec<Frame> = src.pages[..npages].to_vec();
        let dst = lookup_mut(&mut vm, to)?;
        assert!(dst.pages.is_empty(), "uvmcopy: destination {to} is not empty");

        let mut pool = self.kmem.lock();
        let mut copied = Vec::with_capacity(npages);
        for frame in src {
            let Some(new) = pool.alloc() else {
                for f in copied {
                    pool.free(f);
                }
                return Err(MemError::OutOfMemory);
            };
            let data = pool.frames[frame.index()];
            pool.frames[new.index()] = data;
            copied.push(new);
        }
        dst.pages = copied;
        Ok(())
    }

    fn grow(&self, space: AddressSpaceId, old: usize, new: usize) -> Result<usize, MemError> {
        if new < old {
            return Ok(old);
        }
        let mut vm = self.vm.lock();
        let sp = lookup_mut(&mut vm, space)?;
        let target = new.div_ceil(PAGE_SIZE);
        let before = sp.pages.len();
        let mut pool = self.kmem.lock();
        while sp.pages.len() < target {
            if let Some(frame) = pool.alloc() {
                sp.pages.push(frame);
            } else {
                for frame in sp.pages.drain(before..) {
                    pool.free(frame);
                }
                return Err(MemError::OutOfMemory);
            }
        }
        Ok(new)
    }

    fn shrink(&self, space: AddressSpaceId, old: usize, new: usize) -> usize {
        if new >= old {
            return old;
        }
        let mut vm = self.vm.lock();
        let Ok(sp) = lookup_mut(&mut vm, space) else {
            panic!("uvmdealloc: {space} does not exist");
        };
        let keep = new.div_ceil(PAGE_SIZE);
        let mut pool = self.kmem.lock();
        while sp.pages.len() > keep {
            if let Some(frame) = sp.pages.pop() {
                pool.free(frame);
            }
        }
        new
    }

    fn copy_out(&self, space: AddressSpaceId, addr: usize, src: &[u8]) -> Result<(), MemError> {
        self.walk(space, addr, src.len(), |pool, frame, offset, chunk| {
            let n = chunk.len();
            pool.frames[frame.index()][offset..offset + n].copy_from_slice(&src[chunk]);
        })
    }

    fn copy_in(&self, space: AddressSpaceId, addr: usize, dst: &mut [u8]) -> Result<(), MemError> {
        self.walk(space, addr, dst.len(), |pool, frame, offset, chunk| {
            let n = chunk.len();
            dst[chunk].copy_from_slice(&pool.frames[frame.index()][offset..offset + n]);
        })
    }

    fn free_memory(&self) -> usize {
        self.free_pages() * PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaust_and_refill() {
        let mem = SimMemory::new(4);
        let frames: Vec<_> = (0..4).map(|_| mem.alloc_page().unwrap()).collect();
        assert_eq!(mem.alloc_page(), Err(MemError::OutOfMemory));
        assert_eq!(mem.free_memory(), 0);
        for f in frames {
            mem.free_page(f);
        }
        assert_eq!(mem.free_memory(), 4 * PAGE_SIZE);
    }

    #[test]
    fn freed_page_is_reused_zeroed() {
        let mem = SimMemory::new(2);
        let space = mem.create().unwrap();
        mem.grow(space, 0, PAGE_SIZE).unwrap();
        mem.copy_out(space, 0, &[0xAB; 16]).unwrap();
        mem.shrink(space, PAGE_SIZE, 0);
        mem.grow(space, 0, PAGE_SIZE).unwrap();
        let mut buf = [0xFFu8; 16];
        mem.copy_in(space, 0, &mut buf).unwrap();
        assert_eq!(buf, [0; 16]);
    }

    #[test]
    #[should_panic(expected = "is not allocated")]
    fn double_free_is_fatal() {
        let mem = SimMemory::new(2);
        let f = mem.alloc_page().unwrap();
        mem.free_page(f);
        mem.free_page(f);
    }

    #[test]
    fn copy_duplicates_contents() {
        let mem = SimMemory::new(8);
        let a = mem.create().unwrap();
        mem.grow(a, 0, 2 * PAGE_SIZE).unwrap();
        let msg = b"straddles a page boundary";
        mem.copy_out(a, PAGE_SIZE - 5, msg).unwrap();

        let b = mem.create().unwrap();
        mem.copy(a, b, 2 * PAGE_SIZE).unwrap();
        mem.copy_out(a, PAGE_SIZE - 5, &[0; 25]).unwrap();

        let mut buf = [0u8; 25];
        mem.copy_in(b, PAGE_SIZE - 5, &mut buf).unwrap();
        assert_eq!(&buf, msg);
        assert_eq!(mem.spaces(), 2);
    }

    #[test]
    fn failed_copy_leaves_destination_empty() {
        // Root pages for both spaces plus three user pages leave one free.
        let mem = SimMemory::new(6);
        let a = mem.create().unwrap();
        mem.grow(a, 0, 3 * PAGE_SIZE).unwrap();
        let b = mem.create().unwrap();
        assert_eq!(mem.free_pages(), 1);
        assert_eq!(mem.copy(a, b, 3 * PAGE_SIZE), Err(MemError::OutOfMemory));
        assert_eq!(mem.free_pages(), 1);
        assert_eq!(mem.copy_out(b, 0, &[1]), Err(MemError::BadAddress));
        mem.destroy(b);
        mem.destroy(a);
        assert_eq!(mem.free_pages(), 6);
    }

    #[test]
    fn grow_failure_keeps_old_size() {
        let mem = SimMemory::new(3);
        let a = mem.create().unwrap();
        assert_eq!(mem.grow(a, 0, 3 * PAGE_SIZE), Err(MemError::OutOfMemory));
        assert_eq!(mem.free_pages(), 2);
        assert_eq!(mem.grow(a, 0, 2 * PAGE_SIZE), Ok(2 * PAGE_SIZE));
        assert_eq!(mem.shrink(a, 2 * PAGE_SIZE, 1), 1);
        assert_eq!(mem.free_pages(), 1);
    }

    #[test]
    fn copy_out_checks_bounds() {
        let mem = SimMemory::new(4);
        let a = mem.create().unwrap();
        mem.grow(a, 0, PAGE_SIZE).unwrap();
        assert_eq!(mem.copy_out(a, PAGE_SIZE - 2, &[0; 4]), Err(MemError::BadAddress));
        assert_eq!(mem.copy_out(a, usize::MAX, &[0; 4]), Err(MemError::BadAddress));
        assert_eq!(
            mem.copy_out(AddressSpaceId::new(99), 0, &[0]),
            Err(MemError::NoSuchSpace)
        );
    }

    #[test]
    fn destroyed_slot_is_reused() {
        let mem = SimMemory::new(4);
        let a = mem.create().unwrap();
        let _b = mem.create().unwrap();
        mem.destroy(a);
        assert_eq!(mem.create().unwrap(), a);
    }
}
