//! Thin wrappers around the handful of privileged instructions the tasking
//! core needs directly: reading/writing CR3, and masking interrupts around a
//! critical section.

#[cfg(not(test))]
use core::arch::asm;

#[cfg(not(test))]
pub fn get_cr3() -> u32 {
  let cr3: u32;
  unsafe {
    asm!("mov {0}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
  }
  cr3
}

#[cfg(not(test))]
pub fn set_cr3(value: u32) {
  unsafe {
    asm!("mov cr3, {0}", in(reg) value, options(nostack, preserves_flags));
  }
}

#[cfg(not(test))]
pub fn enable_paging() {
  unsafe {
    asm!(
      "mov eax, cr0",
      "or eax, 0x80000000",
      "mov cr0, eax",
      out("eax") _,
      options(nostack, preserves_flags),
    );
  }
}

#[cfg(not(test))]
pub fn disable_interrupts() {
  unsafe {
    asm!("cli", options(nomem, nostack));
  }
}

#[cfg(not(test))]
pub fn enable_interrupts() {
  unsafe {
    asm!("sti", options(nomem, nostack));
  }
}

#[cfg(not(test))]
pub fn halt() {
  unsafe {
    asm!("hlt", options(nomem, nostack));
  }
}

/// Read the IF bit out of EFLAGS without disturbing it -- `pushfd` followed
/// by popping into a general register touches no flags itself.
#[cfg(not(test))]
pub fn interrupts_enabled() -> bool {
  let flags: u32;
  unsafe {
    asm!("pushfd", "pop {0:e}", out(reg) flags, options(nomem, preserves_flags));
  }
  flags & 0x200 != 0
}

// On the host there is no CR3 or IF to manipulate. These mocks give the rest
// of the crate a single code path to call through regardless of target.
#[cfg(test)]
mod host_mocks {
  use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

  static MOCK_CR3: AtomicU32 = AtomicU32::new(0);
  static MOCK_INTERRUPTS_ENABLED: AtomicBool = AtomicBool::new(true);

  pub fn get_cr3() -> u32 {
    MOCK_CR3.load(Ordering::SeqCst)
  }

  pub fn set_cr3(value: u32) {
    MOCK_CR3.store(value, Ordering::SeqCst);
  }

  pub fn enable_paging() {}

  pub fn disable_interrupts() {
    MOCK_INTERRUPTS_ENABLED.store(false, Ordering::SeqCst);
  }

  pub fn enable_interrupts() {
    MOCK_INTERRUPTS_ENABLED.store(true, Ordering::SeqCst);
  }

  pub fn interrupts_enabled() -> bool {
    MOCK_INTERRUPTS_ENABLED.load(Ordering::SeqCst)
  }

  pub fn halt() {}
}

#[cfg(test)]
pub use host_mocks::{
  disable_interrupts, enable_interrupts, enable_paging, get_cr3, halt, interrupts_enabled,
  set_cr3,
};

/// Run `f` with interrupts disabled, restoring the previous state afterward.
/// `fork` and `enter_user_jmp` use this to make their critical sections
/// atomic with respect to the timer. Nests correctly: calling this from
/// inside an already-disabled section leaves interrupts disabled on exit
/// rather than turning them back on early.
pub fn without_interrupts<F, T>(f: F) -> T
where
  F: FnOnce() -> T,
{
  let was_enabled = interrupts_enabled();
  disable_interrupts();
  let result = f();
  if was_enabled {
    enable_interrupts();
  }
  result
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cr3_round_trips() {
    set_cr3(0xdead_b000);
    assert_eq!(get_cr3(), 0xdead_b000);
  }

  #[test]
  fn without_interrupts_restores_enabled_state() {
    enable_interrupts();
    without_interrupts(|| {
      assert!(!interrupts_enabled());
    });
    assert!(interrupts_enabled());
  }

  #[test]
  fn without_interrupts_restores_a_disabled_state() {
    disable_interrupts();
    without_interrupts(|| {
      assert!(!interrupts_enabled());
    });
    assert!(!interrupts_enabled());
    enable_interrupts();
  }
}
