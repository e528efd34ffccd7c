//! Component B: process records and their construction.
//!
//! A deliberately small `Process`: no IPC queue, no vterm, no subsystem, no
//! exec-file bookkeeping -- those belong to other subsystems this crate
//! doesn't own. Just the fields the tasking core itself needs: identity,
//! parent linkage, exit status, the processes waiting on it, an opaque
//! file-descriptor table, the syscall trap frame pointer fork relocates, and
//! the `ThreadImage` fork/switch actually operate on.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::task::directory::PageDirectory;
use crate::task::id::{next_process_id, ProcessId};
use crate::task::stack::{self, StackLimitReached};

/// Registers saved by the interrupt/syscall entry stub, living on the
/// process's own kernel stack. Fork must relocate this pointer along with
/// everything else when it moves a stack snapshot to a new address.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TrapFrame {
  pub eax: u32,
  pub ebx: u32,
  pub ecx: u32,
  pub edx: u32,
  pub esp: u32,
  pub eip: u32,
}

/// Opaque, owned region of file-descriptor bookkeeping. The tasking core
/// never interprets its contents, only clones it on fork and drops it on
/// reap -- the descriptor layout belongs to the filesystem subsystem.
#[derive(Clone, Default)]
pub struct FdTable(Vec<u8>);

impl FdTable {
  pub fn new() -> FdTable {
    FdTable(Vec::new())
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.0
  }
}

/// The register/address-space half of a process: what fork snapshots and
/// switch reloads.
pub struct ThreadImage {
  pub stack: Box<[u8]>,
  pub esp: usize,
  pub ebp: usize,
  pub eip: usize,
  pub page_directory: Box<PageDirectory>,
}

impl ThreadImage {
  pub fn stack_top(&self) -> usize {
    stack::stack_top(&self.stack)
  }
}

pub struct Process {
  id: ProcessId,
  parent_id: ProcessId,
  pub status: i32,
  pub finished: bool,
  pub wait_queue: Vec<ProcessId>,
  pub fd_table: FdTable,
  pub syscall_registers: Option<NonNull<TrapFrame>>,
  pub thread: ThreadImage,
}

// `syscall_registers` points into `thread.stack`, which this struct owns
// exclusively; there is no aliasing with another thread's state.
unsafe impl Send for Process {}
unsafe impl Sync for Process {}

impl Process {
  /// Build the very first process -- init -- around an already-running
  /// kernel stack and the kernel's own page directory. Should be called
  /// exactly once, by `task::tree::spawn_init`.
  pub fn bootstrap(mut stack: Box<[u8]>, page_directory: Box<PageDirectory>) -> Process {
    stack::stamp_magic(&mut stack);
    let stack_top = stack::stack_top(&stack);
    Process {
      id: next_process_id(),
      parent_id: ProcessId::new(0),
      status: 0,
      finished: false,
      wait_queue: Vec::new(),
      fd_table: FdTable::new(),
      syscall_registers: None,
      thread: ThreadImage {
        stack,
        esp: stack_top,
        ebp: stack_top,
        eip: 0,
        page_directory,
      },
    }
  }

  pub fn id(&self) -> ProcessId {
    self.id
  }

  pub fn parent_id(&self) -> ProcessId {
    self.parent_id
  }
}

impl core::fmt::Debug for Process {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Process")
      .field("id", &self.id)
      .field("parent_id", &self.parent_id)
      .field("finished", &self.finished)
      .finish()
  }
}

/// Allocate a process shell with a fresh kernel stack and the next pid,
/// parented to `parent_id`. The caller still has to install a page
/// directory via `set_process_environment` before the process is
/// schedulable.
pub fn spawn_process(parent_id: ProcessId) -> Result<Process, StackLimitReached> {
  let mut new_stack = stack::allocate_stack()?;
  stack::stamp_magic(&mut new_stack);
  let stack_top = stack::stack_top(&new_stack);
  Ok(Process {
    id: next_process_id(),
    parent_id,
    status: 0,
    finished: false,
    wait_queue: Vec::new(),
    fd_table: FdTable::new(),
    syscall_registers: None,
    thread: ThreadImage {
      stack: new_stack,
      esp: stack_top,
      ebp: stack_top,
      eip: 0,
      page_directory: PageDirectory::allocate(),
    },
  })
}

/// Install an address space into a process shell, taking ownership of it.
pub fn set_process_environment(process: &mut Process, page_directory: Box<PageDirectory>) {
  process.thread.page_directory = page_directory;
}

/// Push a 32-bit value onto a process's own kernel stack, decrementing esp.
/// Used by `task::usermode::enter_user_jmp` to build the initial argument
/// frame and iret frame.
pub fn stack_push_u32(thread: &mut ThreadImage, value: u32) {
  thread.esp -= 4;
  let offset = thread.esp - (thread.stack.as_ptr() as usize);
  thread.stack[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
