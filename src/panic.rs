use core::panic::PanicInfo;
use crate::kprintln;
use crate::x86::io::Port;

/// QEMU's `isa-debug-exit` device: a single write shuts the VM down with an
/// exit code derived from the value written. Only meaningful under QEMU with
/// `-device isa-debug-exit,iobase=0xf4,iosize=0x04`, which is how the
/// `testing` feature's automated boot tests run.
const DEBUG_EXIT_PORT: u16 = 0xf4;

fn debug_exit(code: u32) {
  unsafe {
    Port::new(DEBUG_EXIT_PORT).write_u32(code);
  }
}

#[cfg(all(not(feature = "testing"), not(test)))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
  kprintln!("PANIC: {}", info);
  loop {
    crate::x86::registers::halt();
  }
}

#[cfg(feature = "testing")]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
  kprintln!("[FAILED] {}", info);
  debug_exit(3);
  loop {
    crate::x86::registers::halt();
  }
}
