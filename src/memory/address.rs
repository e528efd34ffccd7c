use core::cmp;
use core::fmt;
use core::ops::{Add, Sub};

pub const PAGE_SIZE: usize = 0x1000;

#[derive(Copy, Clone, Eq)]
#[repr(transparent)]
pub struct PhysicalAddress(usize);

impl PhysicalAddress {
  pub const fn new(addr: usize) -> PhysicalAddress {
    PhysicalAddress(addr)
  }

  pub fn as_usize(&self) -> usize {
    self.0 as usize
  }

  pub fn as_u32(&self) -> u32 {
    self.0 as u32
  }

  pub fn is_page_aligned(&self) -> bool {
    self.0 & (PAGE_SIZE - 1) == 0
  }
}

impl cmp::Ord for PhysicalAddress {
  fn cmp(&self, other: &Self) -> cmp::Ordering {
    self.0.cmp(&other.0)
  }
}

impl PartialOrd for PhysicalAddress {
  fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
    Some(self.cmp(other))
  }
}

impl PartialEq for PhysicalAddress {
  fn eq(&self, other: &Self) -> bool {
    self.0 == other.0
  }
}

impl fmt::Debug for PhysicalAddress {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "PhysicalAddress({:#010x})", self.0)
  }
}

impl Add<usize> for PhysicalAddress {
  type Output = PhysicalAddress;
  fn add(self, rhs: usize) -> PhysicalAddress {
    PhysicalAddress(self.0 + rhs)
  }
}

#[derive(Copy, Clone, Eq)]
#[repr(transparent)]
pub struct VirtualAddress(usize);

impl VirtualAddress {
  pub const fn new(addr: usize) -> VirtualAddress {
    VirtualAddress(addr)
  }

  pub fn as_usize(&self) -> usize {
    self.0 as usize
  }

  pub fn as_u32(&self) -> u32 {
    self.0 as u32
  }

  pub fn is_page_aligned(&self) -> bool {
    self.0 & (PAGE_SIZE - 1) == 0
  }

  pub fn get_page_directory_index(&self) -> usize {
    self.0 >> 22
  }

  pub fn get_page_table_index(&self) -> usize {
    (self.0 >> 12) & 0x3ff
  }

  /// Signed distance from `other` to `self`, in bytes. Used to compute a
  /// single relocation delta when moving saved registers between two kernel
  /// stacks of the same size but different base addresses.
  pub fn offset_from(&self, other: VirtualAddress) -> isize {
    self.0 as isize - other.0 as isize
  }

  /// Apply a signed byte delta, as produced by `offset_from`.
  pub fn apply_offset(&self, delta: isize) -> VirtualAddress {
    VirtualAddress((self.0 as isize + delta) as usize)
  }
}

impl PartialEq for VirtualAddress {
  fn eq(&self, other: &Self) -> bool {
    self.0 == other.0
  }
}

impl PartialOrd for VirtualAddress {
  fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
    Some(self.0.cmp(&other.0))
  }
}

impl fmt::Debug for VirtualAddress {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "VirtualAddress({:#010x})", self.0)
  }
}

impl Add<usize> for VirtualAddress {
  type Output = VirtualAddress;
  fn add(self, rhs: usize) -> VirtualAddress {
    VirtualAddress(self.0 + rhs)
  }
}

impl Sub<usize> for VirtualAddress {
  type Output = VirtualAddress;
  fn sub(self, rhs: usize) -> VirtualAddress {
    VirtualAddress(self.0 - rhs)
  }
}

#[cfg(test)]
mod tests {
  use super::VirtualAddress;

  #[test]
  fn offset_from_handles_both_orderings() {
    let parent = VirtualAddress::new(0xffbfe000);
    let higher_child = VirtualAddress::new(0xffbfc000);
    let lower_child = VirtualAddress::new(0xffc00000);

    assert_eq!(higher_child.offset_from(parent), -0x2000);
    assert_eq!(lower_child.offset_from(parent), 0x2000);
  }

  #[test]
  fn apply_offset_round_trips() {
    let addr = VirtualAddress::new(0x1000_1000);
    let delta = VirtualAddress::new(0x1000_4000).offset_from(addr);
    assert_eq!(addr.apply_offset(delta), VirtualAddress::new(0x1000_4000));
  }

  #[test]
  fn page_directory_and_table_index() {
    let addr = VirtualAddress::new(0xc010_3000);
    assert_eq!(addr.get_page_directory_index(), 0xc010_3000usize >> 22);
    assert_eq!(addr.get_page_table_index(), (0xc010_3000usize >> 12) & 0x3ff);
  }
}
