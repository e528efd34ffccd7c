//! Component E: process exit and reaping.
//!
//! Exiting a process happens in two steps, separating "this process is done
//! running" from "this process's resources are gone": `task_exit` records
//! the exit status, wakes everyone waiting on
//! it, and queues the process for reaping, but cannot free the process's own
//! kernel stack out from under itself since that stack is what the exit path
//! is currently running on. `reap_process` does the actual frees, and only
//! ever runs once execution is safely on some other process's stack --
//! `task::switch` drains the reapable queue after every switch for exactly
//! this reason.

use crate::task::id::ProcessId;
use crate::task::switch;
use crate::task::tree;
use crate::x86::registers::without_interrupts;

/// Mark the calling process finished with `status`, wake its waiters, queue
/// it for reaping, and switch away. Never returns.
pub fn task_exit(status: i32) -> ! {
  without_interrupts(|| {
    let current_id = tree::current_id();
    let process_lock = tree::get_process(current_id).expect("current process missing from task tree");

    {
      let mut process = process_lock.write();
      process.status = status;
      process.finished = true;
      tree::wakeup_queue(&process.wait_queue, status);
      process.wait_queue.clear();
      tree::make_process_reapable(current_id);
    }

    let mut process = process_lock.write();
    switch::switch_from_cross_thread_lock(&mut process);
  });

  unreachable!("switch_from_cross_thread_lock does not return into its caller");
}

/// Release everything a finished process owns: its address space and its
/// kernel stack, then drop it from the registry. Only valid to call for a
/// process that is no longer running (`finished` is set) and isn't the
/// process currently executing.
pub fn reap_process(id: ProcessId) {
  let removed = tree::remove_process(id);
  let process_lock = match removed {
    Some(lock) => lock,
    None => return,
  };

  let process = match alloc::sync::Arc::try_unwrap(process_lock) {
    Ok(lock) => lock.into_inner(),
    Err(_) => panic!("reap_process: process {:?} still has other live references", id),
  };

  debug_assert!(process.finished, "reaped a process that never exited");

  let kernel_directory_lock = tree::get_process(ProcessId::new(0)).expect("init process missing from task tree");
  let kernel_directory = &kernel_directory_lock.read().thread.page_directory;
  crate::task::directory::free_directory(process.thread.page_directory, kernel_directory);
  crate::task::stack::free_stack(process.thread.stack);
}

/// Terminate the calling process as if by a kernel-internal exit, bypassing
/// the userspace syscall ABI translation a real `exit()` syscall would do on
/// `status`.
pub fn kexit(status: i32) -> ! {
  task_exit(status)
}

extern crate alloc;

#[cfg(test)]
mod tests {
  use super::*;
  use crate::memory::address::VirtualAddress;
  use crate::memory::address::PAGE_SIZE;
  use crate::memory::heap;
  use crate::memory::physical;
  use crate::task::directory::PageDirectory;
  use crate::task::stack;

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
  fn reap_process_frees_the_stack_and_drops_the_registry_entry() {
    setup();
    let init_stack = stack::allocate_stack().unwrap();
    let init_id = tree::spawn_init(init_stack, PageDirectory::allocate());
    tree::set_current_id(init_id);

    let mut child = crate::task::process::spawn_process(init_id).unwrap();
    child.finished = true;
    let child_id = child.id();
    tree::register_process(child);

    let before = stack::live_stack_count();
    reap_process(child_id);
    assert_eq!(stack::live_stack_count(), before - 1);
    assert!(tree::get_process(child_id).is_none());
  }

  #[test]
  fn reap_process_on_an_unknown_pid_is_a_no_op() {
    setup();
    reap_process(ProcessId::new(9999));
  }

  #[test]
  fn task_exit_wakes_every_waiter_before_switching_away() {
    setup();
    let init_stack = stack::allocate_stack().unwrap();
    let init_id = tree::spawn_init(init_stack, PageDirectory::allocate());
    tree::set_current_id(init_id);

    let waiter = crate::task::process::spawn_process(init_id).unwrap();
    let waiter_id = waiter.id();
    tree::register_process(waiter);

    let mut exiting = crate::task::process::spawn_process(init_id).unwrap();
    exiting.wait_queue.push(waiter_id);
    let exiting_id = exiting.id();
    tree::register_process(exiting);
    tree::set_current_id(exiting_id);

    let caught = std::panic::catch_unwind(|| {
      task_exit(7);
    });
    assert!(caught.is_err(), "task_exit must not return");

    let waiter = tree::get_process(waiter_id).unwrap();
    assert_eq!(waiter.read().status, 7);
  }
}
