pub mod list_allocator;

extern crate alloc;

use alloc::alloc::{GlobalAlloc, Layout};
use spin::Mutex;

use super::address::{PhysicalAddress, VirtualAddress};

/// Fixed distance between a kernel heap virtual address and its backing
/// physical page. The heap lives entirely within the identity-mapped region
/// used by `memory::physical::copy_page_physical`, so the offset is zero;
/// kept as a named constant rather than a literal `0` so a future higher-half
/// relocation only has to change this one value.
const KERNEL_HEAP_VIRTUAL_OFFSET: usize = 0;

struct Allocator {
  locked_allocator: Mutex<list_allocator::ListAllocator>,
}

impl Allocator {
  pub const fn new() -> Allocator {
    Allocator {
      locked_allocator: Mutex::new(list_allocator::ListAllocator::empty()),
    }
  }

  pub fn update_implementation(&self, start: VirtualAddress, size: usize) {
    let mut allocator = self.locked_allocator.lock();
    *allocator = list_allocator::ListAllocator::new(start, size);
  }
}

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    let mut allocator = self.locked_allocator.lock();
    allocator.alloc(layout)
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    let mut allocator = self.locked_allocator.lock();
    allocator.dealloc(ptr);
  }
}

// Only registered as the process-wide allocator on bare metal. Under a
// hosted `cargo test` std's own allocator is already in place and already
// serving every `vec!`/`Box` a test's own setup code needs before it ever
// gets around to calling `init_allocator` -- registering this one instead
// would make every test's first heap allocation fail against an allocator
// that has no backing region yet.
#[cfg_attr(not(test), global_allocator)]
static ALLOCATOR: Allocator = Allocator::new();

pub fn init_allocator(location: VirtualAddress, size: usize) {
  ALLOCATOR.update_implementation(location, size);
}

/// Allocate from the kernel heap and report both the virtual pointer and the
/// physical address backing it, for callers (`task::directory::clone_table`)
/// that need to hand a physical address to the CPU while reading/writing
/// through the virtual one.
///
/// # Safety
/// `layout` must have nonzero size. The returned virtual address is valid for
/// `layout.size()` bytes until passed to `free`.
pub unsafe fn kvmalloc_p(layout: Layout) -> (VirtualAddress, PhysicalAddress) {
  let ptr = alloc::alloc::alloc(layout);
  if ptr.is_null() {
    panic!("kvmalloc_p: heap exhausted allocating {:?}", layout);
  }
  let virt = VirtualAddress::new(ptr as usize);
  let phys = PhysicalAddress::new(virt.as_usize() + KERNEL_HEAP_VIRTUAL_OFFSET);
  (virt, phys)
}

/// # Safety
/// `ptr`/`layout` must match a prior `kvmalloc_p` call exactly.
pub unsafe fn free(ptr: VirtualAddress, layout: Layout) {
  alloc::alloc::dealloc(ptr.as_usize() as *mut u8, layout);
}

#[cfg(not(test))]
#[alloc_error_handler]
fn alloc_error_handler(layout: Layout) -> ! {
  panic!("Alloc error: {:?}", layout)
}
