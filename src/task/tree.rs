//! Process registry, ready queue, and reapable queue.
//!
//! The registry that answers "does this pid exist, and what's its state" is
//! a single lock around a sorted map, rather than a lock per process.
//! Scheduling queues sit behind their own lock since they're touched far
//! more often than the registry itself is walked.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use spin::{Mutex, RwLock};

use crate::task::directory::PageDirectory;
use crate::task::id::ProcessId;
use crate::task::process::Process;

pub static TASK_MAP: RwLock<BTreeMap<ProcessId, Arc<RwLock<Process>>>> = RwLock::new(BTreeMap::new());
pub static CURRENT_ID: RwLock<ProcessId> = RwLock::new(ProcessId::new(0));

struct Queues {
  ready: VecDeque<ProcessId>,
  reapable: VecDeque<ProcessId>,
}

impl Queues {
  const fn new() -> Queues {
    Queues {
      ready: VecDeque::new(),
      reapable: VecDeque::new(),
    }
  }
}

static QUEUES: Mutex<Queues> = Mutex::new(Queues::new());

/// Reset all bookkeeping. Called once at boot, before `spawn_init`.
pub fn initialize_process_tree() {
  TASK_MAP.write().clear();
  let mut queues = QUEUES.lock();
  queues.ready.clear();
  queues.reapable.clear();
}

/// Register pid 0 as the running process. Must run after
/// `initialize_process_tree` and before anything else touches the tree.
pub fn spawn_init(stack: Box<[u8]>, page_directory: Box<PageDirectory>) -> ProcessId {
  let process = Process::bootstrap(stack, page_directory);
  let id = process.id();
  TASK_MAP.write().insert(id, Arc::new(RwLock::new(process)));
  *CURRENT_ID.write() = id;
  id
}

/// Publish a process constructed elsewhere (`task::process::spawn_process`,
/// `task::fork`) into the registry.
pub fn register_process(process: Process) -> ProcessId {
  let id = process.id();
  TASK_MAP.write().insert(id, Arc::new(RwLock::new(process)));
  id
}

pub fn get_process(id: ProcessId) -> Option<Arc<RwLock<Process>>> {
  TASK_MAP.read().get(&id).cloned()
}

pub fn remove_process(id: ProcessId) -> Option<Arc<RwLock<Process>>> {
  TASK_MAP.write().remove(&id)
}

pub fn current_id() -> ProcessId {
  *CURRENT_ID.read()
}

pub fn set_current_id(id: ProcessId) {
  *CURRENT_ID.write() = id;
}

pub fn make_process_ready(id: ProcessId) {
  QUEUES.lock().ready.push_back(id);
}

pub fn next_ready_process() -> Option<ProcessId> {
  QUEUES.lock().ready.pop_front()
}

pub fn process_available() -> bool {
  !QUEUES.lock().ready.is_empty()
}

pub fn make_process_reapable(id: ProcessId) {
  QUEUES.lock().reapable.push_back(id);
}

pub fn next_reapable_process() -> Option<ProcessId> {
  QUEUES.lock().reapable.pop_front()
}

pub fn should_reap() -> bool {
  !QUEUES.lock().reapable.is_empty()
}

/// Resume every process in `wait_queue` with the given exit code: record the
/// code and move it to the ready queue. `task::exit::task_exit` calls this
/// for the finishing process's own wait queue before marking it reapable.
pub fn wakeup_queue(wait_queue: &[ProcessId], code: i32) {
  for &id in wait_queue {
    if let Some(process) = get_process(id) {
      process.write().status = code;
      make_process_ready(id);
    }
  }
}

/// Pure form of the ready-queue push/pop pair, parameterized on an explicit
/// queue rather than the global `QUEUES` lock, so tests can exercise FIFO
/// ordering without racing other tests over shared state.
fn push_ready(queue: &mut VecDeque<ProcessId>, id: ProcessId) {
  queue.push_back(id);
}

fn pop_ready(queue: &mut VecDeque<ProcessId>) -> Option<ProcessId> {
  queue.pop_front()
}

/// Pure form of `wakeup_queue`, operating on a caller-supplied ready queue
/// and a lookup closure instead of the global registry.
fn wakeup_queue_into<F>(ready: &mut VecDeque<ProcessId>, wait_queue: &[ProcessId], code: i32, mut set_status: F)
where
  F: FnMut(ProcessId, i32),
{
  for &id in wait_queue {
    set_status(id, code);
    push_ready(ready, id);
  }
}
