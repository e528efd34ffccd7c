use core::cmp;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

#[derive(Copy, Clone)]
#[repr(transparent)]
pub struct ProcessId(u32);

impl ProcessId {
  pub const fn new(id: u32) -> ProcessId {
    ProcessId(id)
  }

  pub fn as_u32(&self) -> u32 {
    self.0
  }

  pub fn is_init(&self) -> bool {
    self.0 == 0
  }
}

impl cmp::Ord for ProcessId {
  fn cmp(&self, other: &Self) -> cmp::Ordering {
    self.0.cmp(&other.0)
  }
}

impl PartialOrd for ProcessId {
  fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
    Some(self.cmp(other))
  }
}

impl PartialEq for ProcessId {
  fn eq(&self, other: &Self) -> bool {
    self.0 == other.0
  }
}

impl Eq for ProcessId {}

impl fmt::Debug for ProcessId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "PID({})", self.0)
  }
}

struct IdGenerator(AtomicU32);

impl IdGenerator {
  const fn new() -> Self {
    Self(AtomicU32::new(0))
  }

  fn next(&self) -> ProcessId {
    let id = self.0.fetch_add(1, Ordering::SeqCst);
    ProcessId::new(id)
  }
}

static NEXT_ID: IdGenerator = IdGenerator::new();

/// Allocate the next process id. Pid 0 is reserved for init and is handed out
/// exactly once, by the first call after boot (`task::tree::spawn_init`).
pub fn next_process_id() -> ProcessId {
  NEXT_ID.next()
}
