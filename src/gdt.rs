//! Global descriptor table and task state segment.
//!
//! Six entries: null, kernel code/data (ring 0), user code/data (ring 3),
//! and a single TSS used only for its `esp0`/`ss0` fields -- this kernel
//! does hardware task switching for privilege-level changes only, never for
//! the cooperative process switch itself (`task::switch` does that in
//! software). `task::switch` updates `esp0` on every context switch so the
//! next ring-3-to-ring-0 transition (an interrupt or syscall) lands on the
//! new process's kernel stack.

use core::mem;

pub const GDT_ACCESS_PRESENT: u8 = 1 << 7;
pub const GDT_ACCESS_RING_0: u8 = 0;
pub const GDT_ACCESS_RING_3: u8 = 3 << 5;
pub const GDT_ACCESS_CODE_DATA_DESCRIPTOR: u8 = 1 << 4;
pub const GDT_ACCESS_SYSTEM_DESCRIPTOR: u8 = 0;
pub const GDT_ACCESS_EXECUTABLE: u8 = 1 << 3;
pub const GDT_ACCESS_RW: u8 = 1 << 1;
pub const GDT_ACCESS_ACCESSED: u8 = 1;

pub const GDT_FLAG_GRANULARITY_4KB: u8 = 1 << 7;
pub const GDT_FLAG_SIZE_32_BIT: u8 = 1 << 6;

#[repr(C, packed)]
pub struct GDTEntry {
  pub limit_low: u16,
  pub base_low: u16,
  pub base_middle: u8,
  pub access: u8,
  pub flags_and_limit_high: u8,
  pub base_high: u8,
}

impl GDTEntry {
  pub const fn new(base: u32, limit: u32, access: u8, flags: u8) -> GDTEntry {
    GDTEntry {
      limit_low: (limit & 0xffff) as u16,
      base_low: (base & 0xffff) as u16,
      base_middle: ((base >> 16) & 0xff) as u8,
      access,
      flags_and_limit_high: (flags & 0xe0) | (((limit >> 16) & 0xf) as u8),
      base_high: ((base >> 24) & 0xff) as u8,
    }
  }

  pub fn set_base(&mut self, base: u32) {
    self.base_low = (base & 0xffff) as u16;
    self.base_middle = ((base >> 16) & 0xff) as u8;
    self.base_high = ((base >> 24) & 0xff) as u8;
  }

  pub fn set_limit(&mut self, limit: u32) {
    self.limit_low = (limit & 0xffff) as u16;
    self.flags_and_limit_high = (self.flags_and_limit_high & 0xf0) | (((limit >> 16) & 0xf) as u8);
  }
}

#[repr(C, packed)]
pub struct GDTDescriptor {
  pub size: u16,
  pub offset: u32,
}

#[cfg(not(test))]
pub unsafe fn lgdt(desc: &GDTDescriptor) {
  core::arch::asm!("lgdt [{0}]", in(reg) desc, options(nostack, preserves_flags));
}

#[cfg(not(test))]
pub unsafe fn ltr(selector: u16) {
  core::arch::asm!("ltr {0:x}", in(reg) selector, options(nostack, preserves_flags));
}

// Global tables:

static mut GDTR: GDTDescriptor = GDTDescriptor { size: 0, offset: 0 };

static mut GDT: [GDTEntry; 6] = [
  // Null entry - 0x00
  GDTEntry::new(0, 0, 0, 0),
  // Kernel code - 0x08
  GDTEntry::new(
    0,
    0xffffffff,
    GDT_ACCESS_PRESENT | GDT_ACCESS_RING_0 | GDT_ACCESS_CODE_DATA_DESCRIPTOR | GDT_ACCESS_EXECUTABLE | GDT_ACCESS_RW,
    GDT_FLAG_GRANULARITY_4KB | GDT_FLAG_SIZE_32_BIT,
  ),
  // Kernel data - 0x10
  GDTEntry::new(
    0,
    0xffffffff,
    GDT_ACCESS_PRESENT | GDT_ACCESS_RING_0 | GDT_ACCESS_CODE_DATA_DESCRIPTOR | GDT_ACCESS_RW,
    GDT_FLAG_GRANULARITY_4KB | GDT_FLAG_SIZE_32_BIT,
  ),
  // User code - 0x18, selector 0x1B
  GDTEntry::new(
    0,
    0xffffffff,
    GDT_ACCESS_PRESENT | GDT_ACCESS_RING_3 | GDT_ACCESS_CODE_DATA_DESCRIPTOR | GDT_ACCESS_EXECUTABLE | GDT_ACCESS_RW,
    GDT_FLAG_GRANULARITY_4KB | GDT_FLAG_SIZE_32_BIT,
  ),
  // User data - 0x20, selector 0x23
  GDTEntry::new(
    0,
    0xffffffff,
    GDT_ACCESS_PRESENT | GDT_ACCESS_RING_3 | GDT_ACCESS_CODE_DATA_DESCRIPTOR | GDT_ACCESS_RW,
    GDT_FLAG_GRANULARITY_4KB | GDT_FLAG_SIZE_32_BIT,
  ),
  // TSS - 0x28
  GDTEntry::new(
    0,
    0xffffffff,
    GDT_ACCESS_PRESENT | GDT_ACCESS_RING_3 | GDT_ACCESS_SYSTEM_DESCRIPTOR | GDT_ACCESS_EXECUTABLE | GDT_ACCESS_ACCESSED,
    0,
  ),
];

const TSS_SELECTOR: u16 = 0x28;

#[repr(C, packed)]
pub struct TaskStateSegment {
  prev_tss: u32,
  esp0: u32,
  ss0: u32,
  esp1: u32,
  ss1: u32,
  esp2: u32,
  ss2: u32,
  cr3: u32,
  eip: u32,
  eflags: u32,
  eax: u32,
  ecx: u32,
  edx: u32,
  ebx: u32,
  esp: u32,
  ebp: u32,
  esi: u32,
  edi: u32,
  es: u32,
  cs: u32,
  ss: u32,
  ds: u32,
  fs: u32,
  gs: u32,
  ldt: u32,
  trap: u16,
  iomap_base: u16,
}

impl TaskStateSegment {
  pub const fn zero() -> TaskStateSegment {
    TaskStateSegment {
      prev_tss: 0,
      esp0: 0,
      ss0: 0,
      esp1: 0,
      ss1: 0,
      esp2: 0,
      ss2: 0,
      cr3: 0,
      eip: 0,
      eflags: 0,
      eax: 0,
      ecx: 0,
      edx: 0,
      ebx: 0,
      esp: 0,
      ebp: 0,
      esi: 0,
      edi: 0,
      es: 0,
      cs: 0,
      ss: 0,
      ds: 0,
      fs: 0,
      gs: 0,
      ldt: 0,
      trap: 0,
      iomap_base: 0,
    }
  }

  pub fn set_stack_segment(&mut self, segment: u32) {
    self.ss0 = segment;
  }

  pub fn set_stack_pointer(&mut self, pointer: u32) {
    self.esp0 = pointer;
  }

  pub fn stack_pointer(&self) -> u32 {
    self.esp0
  }
}

static mut TSS: TaskStateSegment = TaskStateSegment::zero();

#[cfg(not(test))]
pub unsafe fn init() {
  GDTR.size = (GDT.len() * mem::size_of::<GDTEntry>() - 1) as u16;
  GDTR.offset = GDT.as_ptr() as *const GDTEntry as u32;

  TSS = TaskStateSegment::zero();
  TSS.set_stack_segment(0x10);
  GDT[5].set_limit(mem::size_of::<TaskStateSegment>() as u32);
  GDT[5].set_base(&TSS as *const TaskStateSegment as u32);

  lgdt(&GDTR);
  ltr(TSS_SELECTOR | 3);
}

/// Point the TSS's ring-0 stack at `sp`, so the next interrupt or syscall
/// entered from ring 3 lands on that stack instead of whatever the
/// previously running process left behind.
pub unsafe fn set_tss_stack_pointer(sp: u32) {
  TSS.set_stack_pointer(sp);
}

#[cfg(test)]
pub unsafe fn set_tss_stack_pointer_for_test() -> u32 {
  TSS.stack_pointer()
}
