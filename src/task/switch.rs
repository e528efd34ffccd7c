//! Component D: context switching.
//!
//! Escapes the process locks before touching raw stack pointers (the write
//! guards are taken just
//! long enough to get a raw pointer to each `Process`, then dropped -- they
//! can't be held across the switch itself, since control doesn't return here
//! until some *other* switch resumes this function later), point the TSS's
//! ring-0 stack at the next process's kernel stack so the next interrupt
//! lands somewhere valid, then hand off to a `#[naked]` routine that
//! atomically loads CR3, saves the outgoing `esp`, and loads the incoming
//! one. The `ret` at the end of that routine is what actually resumes the
//! next process: it pops whatever return address sits on top of its stack.

extern crate alloc;

use crate::task::id::ProcessId;
use crate::task::process::Process;
use crate::task::tree;
use crate::x86::registers::{disable_interrupts, enable_interrupts, without_interrupts};

/// Reap every process the exit path queued while execution was elsewhere.
/// Run on every switch so a chain of processes exiting back to back doesn't
/// leave them piling up unreaped.
fn drain_reapable() {
  while let Some(id) = tree::next_reapable_process() {
    crate::task::exit::reap_process(id);
  }
}

/// Switch directly to `id`, which must already be registered and not the
/// currently running process. Panics if either process is missing from the
/// registry -- a caller asking to switch to an unknown pid is a bug.
pub fn switch_to(id: ProcessId) {
  without_interrupts(|| {
    let current_id = tree::current_id();
    if current_id == id {
      return;
    }
    let current_lock = tree::get_process(current_id).expect("current process missing from task tree");
    let next_lock = tree::get_process(id).expect("switch target missing from task tree");

    let current_ptr: *mut Process = {
      let mut current = current_lock.write();
      &mut *current as *mut Process
    };
    let next_ptr: *mut Process = {
      let mut next = next_lock.write();
      &mut *next as *mut Process
    };

    tree::set_current_id(id);

    unsafe {
      let current = &mut *current_ptr;
      let next = &mut *next_ptr;
      switch_into(current, next);
    }
  });
  drain_reapable();
}

/// Switch away from `current`, whose write lock the caller is already
/// holding (and must not try to take again). Used by `task::exit::task_exit`,
/// which has to finish bookkeeping on its own `Process` before giving it up.
///
/// `current` is never resumed through this call (its caller is exiting), so
/// unlike `switch_to` there is no target to name: this picks whatever the
/// scheduler considers next itself, and if nothing is runnable, enables
/// interrupts and waits for the next tick rather than spinning with
/// interrupts disabled.
pub fn switch_from_cross_thread_lock(current: &mut Process) {
  loop {
    disable_interrupts();
    if let Some(id) = tree::next_ready_process() {
      let next_lock = tree::get_process(id).expect("switch target missing from task tree");
      let next_ptr: *mut Process = {
        let mut next = next_lock.write();
        &mut *next as *mut Process
      };
      tree::set_current_id(id);
      unsafe {
        let next = &mut *next_ptr;
        switch_into(current, next);
      }
      break;
    }
    enable_interrupts();
    crate::x86::registers::halt();
  }
  drain_reapable();
}

/// Pick whatever the scheduler considers next and switch to it. Does nothing
/// if nothing else is ready to run.
pub fn switch_next() {
  drain_reapable();
  if let Some(id) = tree::next_ready_process() {
    switch_to(id);
  }
}

unsafe fn switch_into(current: &mut Process, next: &mut Process) {
  assert_resumes_into_kernel_text(next);
  crate::gdt::set_tss_stack_pointer(next.thread.stack_top() as u32 - 4);
  perform_switch(
    next.thread.page_directory.physical_address.as_usize(),
    &mut current.thread.esp as *mut usize,
    next.thread.esp,
  );
}

/// I5: the address `next`'s stack will resume at -- whatever `perform_switch`'s
/// `ret` is about to pop -- must be a real kernel code address, not a
/// corrupted stack or an address that wandered into user space.
///
/// Only meaningful against the real linked kernel image: under a hosted test
/// a process's resume address is an ordinary host function pointer that has
/// no relation to `kernel_text_range`'s fixed placeholder, so the check is
/// compiled out there rather than made to pass vacuously.
#[cfg(not(test))]
unsafe fn assert_resumes_into_kernel_text(next: &Process) {
  let range = crate::task::kernel_text_range();
  let resume_address = *(next.thread.esp as *const usize);
  assert!(
    resume_address >= range.start.as_usize() && resume_address < range.end.as_usize(),
    "process {:?} would resume outside kernel text",
    next.id()
  );
}

#[cfg(test)]
unsafe fn assert_resumes_into_kernel_text(_next: &Process) {}

/// Atomically load `pagedir_addr` into CR3, save the outgoing stack pointer
/// through `current_sp_addr`, and load `next_sp` into esp. The `ret` that
/// follows resumes whatever the incoming stack's top return address points
/// at -- either the rest of this function for a process being switched back
/// into, or wherever `task::fork` left a freshly cloned child.
#[cfg(not(test))]
#[unsafe(naked)]
unsafe extern "cdecl" fn perform_switch(_pagedir_addr: usize, _current_sp_addr: *mut usize, _next_sp: usize) {
  core::arch::naked_asm!(
    "mov eax, [esp + 4]
     mov ecx, [esp + 8]
     mov edx, [esp + 12]
     mov cr3, eax
     mov [ecx], esp
     mov esp, edx
     ret",
  );
}

/// Host-test stand-in. There is no real second stack to jump onto outside a
/// hosted `cargo test` process, so this only performs the part of the switch
/// observable without executing on bare metal: loading CR3 and recording what
/// the real routine would have done, for assertions.
#[cfg(test)]
static LAST_SWITCH: spin::Mutex<Option<(usize, usize, usize)>> = spin::Mutex::new(None);

#[cfg(test)]
unsafe fn perform_switch(pagedir_addr: usize, current_sp_addr: *mut usize, next_sp: usize) {
  crate::x86::registers::set_cr3(pagedir_addr as u32);
  *LAST_SWITCH.lock() = Some((pagedir_addr, current_sp_addr as usize, next_sp));
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::memory::address::VirtualAddress;
  use crate::memory::heap;
  use crate::memory::physical;
  use crate::memory::address::PAGE_SIZE;
  use crate::task::directory::PageDirectory;

  fn setup() {
    const FRAME_COUNT: usize = 64;
    let bitmap_storage: &'static mut [u8] = alloc::boxed::Box::leak(alloc::vec![0u8; FRAME_COUNT / 8].into_boxed_slice());
    let arena: &'static mut [u8] = alloc::boxed::Box::leak(alloc::vec![0u8; FRAME_COUNT * PAGE_SIZE].into_boxed_slice());
    physical::init(bitmap_storage, crate::memory::address::PhysicalAddress::new(arena.as_ptr() as usize), FRAME_COUNT);

    const HEAP_SIZE: usize = 0x80000;
    let heap_storage = alloc::boxed::Box::leak(alloc::vec![0u8; HEAP_SIZE].into_boxed_slice());
    heap::init_allocator(VirtualAddress::new(heap_storage.as_ptr() as usize), HEAP_SIZE);

    tree::initialize_process_tree();
  }

  #[test]
  fn switch_to_updates_current_id() {
    setup();
    let stack = crate::task::stack::allocate_stack().unwrap();
    let init_id = tree::spawn_init(stack, PageDirectory::allocate());
    tree::set_current_id(init_id);

    let child = crate::task::process::spawn_process(init_id).unwrap();
    let child_id = child.id();
    tree::register_process(child);

    switch_to(child_id);
    assert_eq!(tree::current_id(), child_id);
  }

  #[test]
  fn switch_to_the_current_process_is_a_no_op() {
    setup();
    let stack = crate::task::stack::allocate_stack().unwrap();
    let init_id = tree::spawn_init(stack, PageDirectory::allocate());
    tree::set_current_id(init_id);

    switch_to(init_id);
    assert_eq!(tree::current_id(), init_id);
  }

  #[test]
  fn switch_next_does_nothing_when_nothing_is_ready() {
    setup();
    let stack = crate::task::stack::allocate_stack().unwrap();
    let init_id = tree::spawn_init(stack, PageDirectory::allocate());
    tree::set_current_id(init_id);

    while tree::process_available() {
      tree::next_ready_process();
    }

    switch_next();
    assert_eq!(tree::current_id(), init_id);
  }

  #[test]
  fn switch_next_follows_the_ready_queue() {
    setup();
    let stack = crate::task::stack::allocate_stack().unwrap();
    let init_id = tree::spawn_init(stack, PageDirectory::allocate());
    tree::set_current_id(init_id);

    while tree::process_available() {
      tree::next_ready_process();
    }

    let child = crate::task::process::spawn_process(init_id).unwrap();
    let child_id = child.id();
    tree::register_process(child);
    tree::make_process_ready(child_id);

    switch_next();
    assert_eq!(tree::current_id(), child_id);
  }

  #[test]
  fn switch_loads_the_target_directorys_cr3() {
    setup();
    let stack = crate::task::stack::allocate_stack().unwrap();
    let init_id = tree::spawn_init(stack, PageDirectory::allocate());
    tree::set_current_id(init_id);

    let child = crate::task::process::spawn_process(init_id).unwrap();
    let child_id = child.id();
    let expected_cr3 = child.thread.page_directory.physical_address.as_u32();
    tree::register_process(child);

    switch_to(child_id);
    assert_eq!(crate::x86::registers::get_cr3(), expected_cr3);
  }
}
