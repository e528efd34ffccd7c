//! Multitasking core: process identity and address-space cloning, fork and
//! clone, scheduling and context switching, exit and reap, and the ring-3
//! entry trampoline.

extern crate alloc;

use alloc::boxed::Box;
use core::ops::Range;

pub mod directory;
pub mod exit;
pub mod fork;
pub mod id;
pub mod process;
pub mod stack;
pub mod switch;
pub mod tree;
pub mod usermode;

use crate::memory::address::VirtualAddress;
use crate::task::directory::PageDirectory;

#[cfg(not(test))]
extern "C" {
  static __kernel_text_start: u8;
  static __kernel_text_end: u8;
}

/// The span of addresses the linker placed kernel code at, used to tell a
/// fault inside the kernel's own code apart from one in a user process.
#[cfg(not(test))]
pub fn kernel_text_range() -> Range<VirtualAddress> {
  unsafe {
    let start = &__kernel_text_start as *const u8 as usize;
    let end = &__kernel_text_end as *const u8 as usize;
    VirtualAddress::new(start)..VirtualAddress::new(end)
  }
}

/// There is no linked kernel image to read a real range out of under a
/// hosted test, so tests that need one get a fixed placeholder instead.
#[cfg(test)]
pub fn kernel_text_range() -> Range<VirtualAddress> {
  VirtualAddress::new(0x0010_0000)..VirtualAddress::new(0x0020_0000)
}

/// Boot-time setup: reset all tasking state and register `kernel_directory`
/// as process 0's address space. Must run exactly once, before anything else
/// in this module is touched.
pub fn tasking_install(kernel_directory: Box<PageDirectory>) -> id::ProcessId {
  tree::initialize_process_tree();
  let stack = stack::allocate_stack().expect("no room for the init process's kernel stack");
  tree::spawn_init(stack, kernel_directory)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::memory::address::PAGE_SIZE;
  use crate::memory::heap;
  use crate::memory::physical;

  fn setup() {
    const FRAME_COUNT: usize = 64;
    let bitmap_storage: &'static mut [u8] = alloc::boxed::Box::leak(alloc::vec![0u8; FRAME_COUNT / 8].into_boxed_slice());
    let arena: &'static mut [u8] = alloc::boxed::Box::leak(alloc::vec![0u8; FRAME_COUNT * PAGE_SIZE].into_boxed_slice());
    physical::init(bitmap_storage, crate::memory::address::PhysicalAddress::new(arena.as_ptr() as usize), FRAME_COUNT);

    const HEAP_SIZE: usize = 0x80000;
    let heap_storage = alloc::boxed::Box::leak(alloc::vec![0u8; HEAP_SIZE].into_boxed_slice());
    heap::init_allocator(VirtualAddress::new(heap_storage.as_ptr() as usize), HEAP_SIZE);
  }

  #[test]
  fn tasking_install_registers_init_as_the_current_process() {
    setup();
    let init_id = tasking_install(PageDirectory::allocate());
    assert!(init_id.is_init());
    assert_eq!(tree::current_id(), init_id);
  }

  #[test]
  fn kernel_text_range_is_non_empty() {
    let range = kernel_text_range();
    assert!(range.start.as_usize() < range.end.as_usize());
  }
}
