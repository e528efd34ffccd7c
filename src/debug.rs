//! `kprint!`/`kprintln!`, backed by the COM1 serial port instead of the
//! teacher's VGA text buffer -- this crate has no video driver, and a serial
//! console is the standard way a headless QEMU kernel gets text out.

use core::fmt::{self, Write};
use spin::Mutex;

use crate::x86::io::Port;

const COM1: u16 = 0x3F8;
const LINE_STATUS_OFFSET: u16 = 5;
const TRANSMIT_EMPTY: u8 = 1 << 5;

struct SerialPort {
  data: Port,
  line_status: Port,
}

impl SerialPort {
  const fn new(base: u16) -> SerialPort {
    SerialPort {
      data: Port::new(base),
      line_status: Port::new(base + LINE_STATUS_OFFSET),
    }
  }

  fn write_byte(&self, byte: u8) {
    unsafe {
      while self.line_status.read_u8() & TRANSMIT_EMPTY == 0 {}
      self.data.write_u8(byte);
    }
  }
}

impl Write for SerialPort {
  fn write_str(&mut self, s: &str) -> fmt::Result {
    for byte in s.bytes() {
      self.write_byte(byte);
    }
    Ok(())
  }
}

static SERIAL: Mutex<SerialPort> = Mutex::new(SerialPort::new(COM1));

#[doc(hidden)]
pub fn _kprint(args: fmt::Arguments) {
  SERIAL.lock().write_fmt(args).unwrap();
}

#[macro_export]
macro_rules! kprint {
  ($($arg:tt)*) => ($crate::debug::_kprint(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! kprintln {
  () => ($crate::kprint!("\n"));
  ($($arg:tt)*) => ($crate::kprint!("{}\n", format_args!($($arg)*)));
}
