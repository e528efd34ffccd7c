#![cfg_attr(not(test), no_std)]
#![feature(alloc_error_handler)]
#![feature(naked_functions)]

pub mod debug;
pub mod gdt;
pub mod memory;
pub mod panic;
pub mod task;
pub mod x86;

extern crate alloc;

use memory::address::{PhysicalAddress, VirtualAddress};

// Paging and the first few megabytes of identity-mapped physical memory are
// set up by the bootloader stage that hands off to `_start`; this crate owns
// scheduling and address-space cloning from there on, not the initial
// memory map (see DESIGN.md).
#[cfg(not(test))]
extern "C" {
  #[link_name = "__bss_start"]
  static label_bss_start: u8;
  #[link_name = "__bss_end"]
  static label_bss_end: u8;
  #[link_name = "__kernel_heap_start"]
  static label_kernel_heap_start: u8;
  #[link_name = "__frame_bitmap_start"]
  static label_frame_bitmap_start: u8;
}

#[cfg(not(test))]
const KERNEL_HEAP_SIZE: usize = 4 * 1024 * 1024;
#[cfg(not(test))]
const PHYSICAL_FRAME_COUNT: usize = 32 * 1024; // 128 MiB at 4KiB/frame

#[cfg(not(test))]
unsafe fn clear_bss() {
  let mut cursor = &label_bss_start as *const u8 as usize;
  let end = &label_bss_end as *const u8 as usize;
  while cursor < end {
    (cursor as *mut u8).write(0);
    cursor += 1;
  }
}

#[cfg(not(test))]
#[no_mangle]
pub extern "C" fn _start() -> ! {
  unsafe {
    clear_bss();

    gdt::init();

    let bitmap_storage = core::slice::from_raw_parts_mut(
      &label_frame_bitmap_start as *const u8 as *mut u8,
      (PHYSICAL_FRAME_COUNT + 7) / 8,
    );
    memory::physical::init(bitmap_storage, PhysicalAddress::new(0), PHYSICAL_FRAME_COUNT);

    let heap_start = VirtualAddress::new(&label_kernel_heap_start as *const u8 as usize);
    memory::heap::init_allocator(heap_start, KERNEL_HEAP_SIZE);

    kprintln!("kernel heap ready, {} frames free", memory::physical::count_free_frames());

    let kernel_directory = task::directory::PageDirectory::allocate();
    let init_id = task::tasking_install(kernel_directory);
    kprintln!("tasking installed, running as {:?}", init_id);

    x86::registers::enable_interrupts();
  }

  loop {
    task::switch::switch_next();
    unsafe {
      x86::registers::halt();
    }
  }
}
