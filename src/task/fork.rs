//! Component C: fork and clone.
//!
//! `fork()` and `clone_thread()` share almost their entire body: allocate a
//! child, duplicate the address space and kernel stack, and give the child a
//! way to resume that doesn't depend on anything the parent does afterward.
//!
//! Resuming a child is not a matter of relocating saved registers -- there
//! are none to relocate, since nothing has switched this process out yet and
//! `thread.{esp,ebp,eip}` still hold whatever `process::spawn_process` set
//! them to. The live continuation has to be captured at the fork call site
//! itself (`ebp`, read with inline asm directly in `fork`'s own frame, not
//! inside a closure that might get its own) and relocated onto the child's
//! copy of the stack. `install_fork_continuation` then manufactures a small
//! hand-run epilogue under `fork_child_trampoline` -- the same trick
//! `task::usermode::prepare_user_entry` uses to make a fresh stack drop into
//! ring 3 the first time `task::switch` resumes it, applied here to make a
//! cloned stack unwind one level out of `fork`'s own frame and return 0 to
//! whoever called it, instead of dropping into ring 3.
//!
//! Only the immediate frame-pointer link is relocated. Frames further up the
//! parent's call chain keep their original, unrelocated saved-`ebp` values,
//! so code in the child that walks past its first frame reads garbage --
//! `examples/original_source/kernel/sys/task.c`'s `fork` has the same
//! limitation and nothing in this crate walks more than one frame up.

extern crate alloc;

use core::ptr::NonNull;

#[cfg(not(test))]
use core::arch::{asm, naked_asm};

use crate::task::directory::{self, PageDirectory};
use crate::task::id::ProcessId;
use crate::task::process::{self, Process, TrapFrame};
use crate::task::stack::StackLimitReached;
use crate::task::tree;
use crate::x86::registers::{disable_interrupts, enable_interrupts};

/// Forwarded from a `clone()` syscall: which user-mode stack the caller
/// wants the new thread switched onto. The kernel-stack snapshot this module
/// performs is unaffected by it -- the syscall layer is expected to apply it
/// when it resumes the new thread in user mode.
pub struct UserStackSwitch {
  pub new_stack_top: usize,
  pub old_stack_top: usize,
}

/// The snapshot of a live continuation this module carries across a fork:
/// the three registers a context switch would otherwise save, plus wherever
/// the syscall entry stub stashed the trap frame.
#[derive(Copy, Clone)]
pub struct Continuation {
  pub esp: usize,
  pub ebp: usize,
  pub eip: usize,
  pub syscall_registers: Option<NonNull<TrapFrame>>,
}

/// Recompute a continuation captured on one kernel stack as it would read on
/// another stack of the same size starting at a different base address,
/// using a single signed delta applied uniformly (see DESIGN.md).
pub fn relocate_continuation(parent_stack_top: usize, child_stack_top: usize, continuation: Continuation) -> Continuation {
  let delta = child_stack_top as isize - parent_stack_top as isize;
  let relocate = |addr: usize| -> usize { (addr as isize + delta) as usize };

  Continuation {
    esp: relocate(continuation.esp),
    ebp: relocate(continuation.ebp),
    eip: continuation.eip,
    syscall_registers: continuation
      .syscall_registers
      .map(|ptr| unsafe { NonNull::new_unchecked(relocate(ptr.as_ptr() as usize) as *mut TrapFrame) }),
  }
}

/// Build a child sharing `parent`'s identity, address space, and an exact
/// copy of its in-flight kernel stack.
///
/// `clone_thread` and `fork` both land here. True shared address-space
/// ownership would need reference counting, which this crate doesn't have
/// (no COW, see Non-goals), so both duplicate rather than alias the parent's
/// `PageDirectory`. Leaves `child.thread.{esp,ebp,eip}` at whatever
/// `process::spawn_process` assigned them -- `install_fork_continuation`
/// overwrites `esp` afterward to point the child somewhere useful.
fn build_child(parent: &Process, kernel_directory: &PageDirectory) -> Result<Process, StackLimitReached> {
  let mut child = process::spawn_process(parent.id())?;

  child.fd_table = parent.fd_table.clone();

  let cloned_directory = directory::clone_directory(&parent.thread.page_directory, kernel_directory);
  process::set_process_environment(&mut child, cloned_directory);

  crate::task::stack::duplicate_stack(&parent.thread.stack, &mut child.thread.stack);

  Ok(child)
}

/// Give `child` a stack that resumes, the first time `task::switch` switches
/// into it, as if it had just returned 0 from the fork call that created it.
///
/// Pushes, from deepest to shallowest: the relocated parent `ebp`, then the
/// address of `fork_child_trampoline` on top of it -- mirroring
/// `task::usermode::prepare_user_entry`'s layout. When `task::switch`'s `ret`
/// pops the trampoline address, esp is left pointing at the relocated `ebp`
/// and the trampoline's `pop ebp` consumes it.
fn install_fork_continuation(child: &mut Process, parent_stack_top: usize, parent_ebp: usize) {
  let child_stack_top = child.thread.stack_top();
  let relocated = relocate_continuation(
    parent_stack_top,
    child_stack_top,
    Continuation {
      esp: 0,
      ebp: parent_ebp,
      eip: 0,
      syscall_registers: None,
    },
  );

  process::stack_push_u32(&mut child.thread, relocated.ebp as u32);
  process::stack_push_u32(&mut child.thread, fork_child_trampoline as usize as u32);
}

/// Unwind exactly one level out of `fork`'s (or `clone_thread`'s) frame using
/// the relocated `ebp` `install_fork_continuation` left on top of the stack,
/// then return into whoever called it -- with `eax` cleared, so that call
/// site sees a 0 return value. Reads as a hand-run `leave; ret` for a frame
/// that was never actually entered on this stack.
///
/// Safe to treat `eax = 0` as a valid `ProcessId` here: `ProcessId` is
/// `#[repr(transparent)]` over `u32`, so the two have identical register
/// representation.
#[cfg(not(test))]
#[unsafe(naked)]
unsafe extern "cdecl" fn fork_child_trampoline() {
  naked_asm!(
    "pop ebp",
    "xor eax, eax",
    "mov esp, ebp",
    "pop ebp",
    "ret",
  );
}

#[cfg(test)]
unsafe extern "cdecl" fn fork_child_trampoline() {
  unreachable!("fork_child_trampoline only ever runs after a real switch resumes a forked child")
}

/// Placeholder continuation for the host test build, which has no real stack
/// frame to read `ebp` out of. Fixed rather than derived from anything live,
/// so tests can predict exactly what `install_fork_continuation` relocates
/// it to.
#[cfg(test)]
const TEST_PARENT_EBP: usize = 0xcafe_0000;

/// Duplicate the calling process, including its address space, and arrange
/// for the child to resume as if it had just returned 0 from this call.
/// Panics if the kernel is out of kernel stacks to hand out -- resource
/// exhaustion here has nowhere safe to unwind to, so it's treated the same
/// as any other kernel-fatal condition.
pub fn fork(kernel_directory: &PageDirectory) -> ProcessId {
  #[cfg(not(test))]
  let parent_ebp = unsafe {
    let ebp: usize;
    asm!("mov {0:e}, ebp", out(reg) ebp, options(nomem, nostack, preserves_flags));
    ebp
  };
  #[cfg(test)]
  let parent_ebp: usize = TEST_PARENT_EBP;

  disable_interrupts();
  let parent_id = tree::current_id();
  let parent_lock = tree::get_process(parent_id).expect("current process missing from task tree");
  let parent_stack_top = {
    let parent = parent_lock.read();
    crate::task::stack::stack_top(&parent.thread.stack)
  };
  let mut child = {
    let parent = parent_lock.read();
    build_child(&parent, kernel_directory)
  }
  .expect("fork: out of kernel stacks");

  install_fork_continuation(&mut child, parent_stack_top, parent_ebp);

  let child_id = child.id();
  tree::register_process(child);
  tree::make_process_ready(child_id);
  enable_interrupts();
  child_id
}

/// Spawn a new thread of execution sharing the caller's identity but
/// switching onto a separate user-mode stack described by `stack_switch`.
/// See `build_child` for why this duplicates the address space rather than
/// sharing it, and `fork` for how the child is made to resume.
pub fn clone_thread(kernel_directory: &PageDirectory, _stack_switch: UserStackSwitch) -> ProcessId {
  #[cfg(not(test))]
  let parent_ebp = unsafe {
    let ebp: usize;
    asm!("mov {0:e}, ebp", out(reg) ebp, options(nomem, nostack, preserves_flags));
    ebp
  };
  #[cfg(test)]
  let parent_ebp: usize = TEST_PARENT_EBP;

  disable_interrupts();
  let parent_id = tree::current_id();
  let parent_lock = tree::get_process(parent_id).expect("current process missing from task tree");
  let parent_stack_top = {
    let parent = parent_lock.read();
    crate::task::stack::stack_top(&parent.thread.stack)
  };
  let mut child = {
    let parent = parent_lock.read();
    build_child(&parent, kernel_directory)
  }
  .expect("clone_thread: out of kernel stacks");

  install_fork_continuation(&mut child, parent_stack_top, parent_ebp);

  let child_id = child.id();
  tree::register_process(child);
  tree::make_process_ready(child_id);
  enable_interrupts();
  child_id
}

pub fn getpid() -> ProcessId {
  tree::current_id()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::memory::address::VirtualAddress;
  use crate::memory::address::PAGE_SIZE;
  use crate::memory::heap;
  use crate::memory::physical;

  fn setup() {
    const FRAME_COUNT: usize = 128;
    let bitmap_storage: &'static mut [u8] = alloc::boxed::Box::leak(alloc::vec![0u8; FRAME_COUNT / 8].into_boxed_slice());
    let arena: &'static mut [u8] = alloc::boxed::Box::leak(alloc::vec![0u8; FRAME_COUNT * PAGE_SIZE].into_boxed_slice());
    physical::init(bitmap_storage, crate::memory::address::PhysicalAddress::new(arena.as_ptr() as usize), FRAME_COUNT);

    const HEAP_SIZE: usize = 0x80000;
    let heap_storage = alloc::boxed::Box::leak(alloc::vec![0u8; HEAP_SIZE].into_boxed_slice());
    heap::init_allocator(VirtualAddress::new(heap_storage.as_ptr() as usize), HEAP_SIZE);
  }

  #[test]
  fn relocate_continuation_handles_child_above_and_below_parent() {
    let parent_top = 0x2000;
    let higher_child_top = 0x1000; // child stack at a lower base address
    let lower_child_top = 0x3000; // child stack at a higher base address

    let continuation = Continuation {
      esp: parent_top - 0x40,
      ebp: parent_top - 0x10,
      eip: 0x1234,
      syscall_registers: None,
    };

    let up = relocate_continuation(parent_top, lower_child_top, continuation);
    assert_eq!(up.esp, continuation.esp + 0x1000);
    assert_eq!(up.ebp, continuation.ebp + 0x1000);

    let down = relocate_continuation(parent_top, higher_child_top, continuation);
    assert_eq!(down.esp, continuation.esp - 0x1000);
    assert_eq!(down.ebp, continuation.ebp - 0x1000);
  }

  #[test]
  fn relocate_continuation_applies_the_same_delta_to_esp_and_ebp() {
    // A relocation that moved esp and ebp by different amounts would desync
    // the frame pointer chain from the stack it's walking.
    let continuation = Continuation {
      esp: 0x5000,
      ebp: 0x5020,
      eip: 0,
      syscall_registers: None,
    };
    let relocated = relocate_continuation(0x6000, 0x4000, continuation);
    let esp_delta = relocated.esp as isize - continuation.esp as isize;
    let ebp_delta = relocated.ebp as isize - continuation.ebp as isize;
    assert_eq!(esp_delta, ebp_delta);
  }

  #[test]
  fn relocate_continuation_moves_the_trap_frame_pointer() {
    let mut frame = TrapFrame {
      eax: 0,
      ebx: 0,
      ecx: 0,
      edx: 0,
      esp: 0,
      eip: 0,
    };
    let ptr = NonNull::new(&mut frame as *mut TrapFrame).unwrap();
    let continuation = Continuation {
      esp: 0,
      ebp: 0,
      eip: 0,
      syscall_registers: Some(ptr),
    };
    let relocated = relocate_continuation(0x1000, 0x1100, continuation);
    let delta = relocated.syscall_registers.unwrap().as_ptr() as isize - ptr.as_ptr() as isize;
    assert_eq!(delta, 0x100);
  }

  #[test]
  fn fork_assigns_a_fresh_pid_parented_to_the_caller() {
    setup();
    crate::task::tree::initialize_process_tree();
    let kernel_directory = PageDirectory::allocate();
    let stack = crate::task::stack::allocate_stack().unwrap();
    let init_id = crate::task::tree::spawn_init(stack, PageDirectory::allocate());
    crate::task::tree::set_current_id(init_id);

    let child_id = fork(&kernel_directory);
    assert_ne!(child_id, init_id);

    let child = crate::task::tree::get_process(child_id).unwrap();
    assert_eq!(child.read().parent_id(), init_id);
  }

  #[test]
  fn fork_gives_the_child_its_own_stack_copy() {
    setup();
    crate::task::tree::initialize_process_tree();
    let kernel_directory = PageDirectory::allocate();
    let stack = crate::task::stack::allocate_stack().unwrap();
    let init_id = crate::task::tree::spawn_init(stack, PageDirectory::allocate());
    crate::task::tree::set_current_id(init_id);

    let parent_stack_ptr = {
      let parent = crate::task::tree::get_process(init_id).unwrap();
      let guard = parent.read();
      guard.thread.stack.as_ptr()
    };

    let child_id = fork(&kernel_directory);
    let child = crate::task::tree::get_process(child_id).unwrap();
    let child_stack_ptr = child.read().thread.stack.as_ptr();
    assert_ne!(parent_stack_ptr, child_stack_ptr);
    assert!(crate::task::stack::has_valid_magic(&child.read().thread.stack));
  }

  #[test]
  fn fork_points_the_child_at_fork_child_trampoline() {
    setup();
    crate::task::tree::initialize_process_tree();
    let kernel_directory = PageDirectory::allocate();
    let stack = crate::task::stack::allocate_stack().unwrap();
    let init_id = crate::task::tree::spawn_init(stack, PageDirectory::allocate());
    crate::task::tree::set_current_id(init_id);

    let parent_stack_top = {
      let parent = crate::task::tree::get_process(init_id).unwrap();
      let guard = parent.read();
      crate::task::stack::stack_top(&guard.thread.stack)
    };

    let child_id = fork(&kernel_directory);
    let child_lock = crate::task::tree::get_process(child_id).unwrap();
    let child = child_lock.read();
    let child_stack_top = child.thread.stack_top();

    let base = child.thread.stack.as_ptr() as usize;
    let read_u32 = |addr: usize| -> u32 {
      let offset = addr - base;
      u32::from_le_bytes([
        child.thread.stack[offset],
        child.thread.stack[offset + 1],
        child.thread.stack[offset + 2],
        child.thread.stack[offset + 3],
      ])
    };

    assert_eq!(child.thread.esp, child_stack_top - 8, "fork should leave exactly two words pushed");
    assert_eq!(read_u32(child.thread.esp), fork_child_trampoline as usize as u32);

    let expected = relocate_continuation(
      parent_stack_top,
      child_stack_top,
      Continuation {
        esp: 0,
        ebp: TEST_PARENT_EBP,
        eip: 0,
        syscall_registers: None,
      },
    );
    assert_eq!(read_u32(child.thread.esp + 4), expected.ebp as u32);
  }

  #[test]
  fn fork_does_not_disturb_the_parents_own_thread_state() {
    setup();
    crate::task::tree::initialize_process_tree();
    let kernel_directory = PageDirectory::allocate();
    let stack = crate::task::stack::allocate_stack().unwrap();
    let init_id = crate::task::tree::spawn_init(stack, PageDirectory::allocate());
    crate::task::tree::set_current_id(init_id);

    let (esp_before, ebp_before, eip_before) = {
      let parent = crate::task::tree::get_process(init_id).unwrap();
      let parent = parent.read();
      (parent.thread.esp, parent.thread.ebp, parent.thread.eip)
    };

    fork(&kernel_directory);

    let parent = crate::task::tree::get_process(init_id).unwrap();
    let parent = parent.read();
    assert_eq!(parent.thread.esp, esp_before);
    assert_eq!(parent.thread.ebp, ebp_before);
    assert_eq!(parent.thread.eip, eip_before);
  }
}
