// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::ops::{Add, BitAnd};
use std::ops::{Bound::*, RangeBounds};

fn numeric_bounds(
    bound: impl RangeBounds<usize>,
    len: usize,
) -> (usize, usize) {
    let start = match bound.start_bound() {
        Unbounded => 0,
        Included(i) => *i,
        Excluded(i) => i + 1,
    };
    let end = match bound.end_bound() {
        Unbounded => len,
        Included(i) => i + 1,
        Excluded(e) => *e,
    };
    assert!(start <= end && end <= len);
    (start, end)
}

/// A read access against an emulated resource (such as a register BAR).
///
/// The emulation fulfills the request through the various "write" methods,
/// which fill the caller-provided buffer in order.
pub struct ReadOp<'a> {
    buf: &'a mut [u8],
    offset: usize,
    write_offset: usize,
}

impl<'a> ReadOp<'a> {
    /// Initializes a new read operation from a buffer.
    ///
    /// # Arguments
    ///
    /// - `op_offset`: Offset within the emulated resource being read.
    /// - `buf`: Sink for the data produced by the read.
    pub fn from_buf(op_offset: usize, buf: &'a mut [u8]) -> Self {
        Self { buf, offset: op_offset, write_offset: 0 }
    }

    /// Carve a child operation out of `range` within `parent`.
    ///
    /// The child's `op_offset` need not correlate with the parent's.
    pub fn new_child<'b, R>(
        op_offset: usize,
        parent: &'b mut ReadOp<'_>,
        range: R,
    ) -> ReadOp<'b>
    where
        R: RangeBounds<usize>,
    {
        let (start, end) = numeric_bounds(range, parent.buf.len());
        ReadOp {
            buf: &mut parent.buf[start..end],
            offset: op_offset,
            write_offset: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
    pub fn avail(&self) -> usize {
        self.len() - self.write_offset
    }
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn write_u32(&mut self, val: u32) {
        self.write_bytes(&val.to_le_bytes()[..]);
    }
    pub fn write_u64(&mut self, val: u64) {
        self.write_bytes(&val.to_le_bytes()[..]);
    }
    pub fn write_bytes(&mut self, data: &[u8]) {
        let wr_off = self.write_offset;
        assert!(data.len() <= self.avail());

        self.buf[wr_off..(wr_off + data.len())].copy_from_slice(data);
        self.write_offset += data.len();
    }
    pub fn fill(&mut self, val: u8) {
        self.buf[self.write_offset..].fill(val);
        self.write_offset = self.len();
    }
}

/// A write access against an emulated resource.
///
/// The emulation consumes the written data through the various "read"
/// methods.
pub struct WriteOp<'a> {
    buf: &'a [u8],
    offset: usize,
    read_offset: usize,
}
impl<'a> WriteOp<'a> {
    /// Initializes a new write operation from a buffer.
    ///
    /// # Arguments
    ///
    /// - `op_offset`: Offset within the emulated resource being written.
    /// - `buf`: Source of the data being written.
    pub fn from_buf(op_offset: usize, buf: &'a [u8]) -> Self {
        Self { buf, offset: op_offset, read_offset: 0 }
    }

    /// Carve a child operation out of `range` within `parent`.
    pub fn new_child<'b, R>(
        op_offset: usize,
        parent: &'b WriteOp<'_>,
        range: R,
    ) -> WriteOp<'b>
    where
        R: RangeBounds<usize>,
    {
        let (start, end) = numeric_bounds(range, parent.buf.len());
        WriteOp {
            buf: &parent.buf[start..end],
            offset: op_offset,
            read_offset: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
    pub fn avail(&self) -> usize {
        self.len() - self.read_offset
    }
    pub fn offset(&self) -> usize {
        self.offset
    }

    fn read_val<const COUNT: usize>(&mut self) -> [u8; COUNT] {
        let mut buf = [0u8; COUNT];
        self.read_bytes(&mut buf);
        buf
    }
    pub fn read_u8(&mut self) -> u8 {
        u8::from_le_bytes(self.read_val())
    }
    pub fn read_u16(&mut self) -> u16 {
        u16::from_le_bytes(self.read_val())
    }
    pub fn read_u32(&mut self) -> u32 {
        u32::from_le_bytes(self.read_val())
    }
    pub fn read_u64(&mut self) -> u64 {
        u64::from_le_bytes(self.read_val())
    }
    pub fn read_bytes(&mut self, data: &mut [u8]) {
        let rd_off = self.read_offset;
        assert!(data.len() <= self.avail());

        data.copy_from_slice(&self.buf[rd_off..(rd_off + data.len())]);
        self.read_offset += data.len();
    }

    /// Zero-extend the (up to 8 byte) remainder of the write into a `u64`.
    pub fn read_extended(&mut self) -> u64 {
        let mut raw = [0u8; 8];
        let len = self.avail().min(raw.len());
        self.read_bytes(&mut raw[..len]);
        u64::from_le_bytes(raw)
    }
}

pub enum RWOp<'a, 'b> {
    Read(&'a mut ReadOp<'b>),
    Write(&'a mut WriteOp<'b>),
}
impl RWOp<'_, '_> {
    pub fn offset(&self) -> usize {
        match self {
            RWOp::Read(ro) => ro.offset,
            RWOp::Write(wo) => wo.offset,
        }
    }
    pub fn len(&self) -> usize {
        match self {
            RWOp::Read(ro) => ro.len(),
            RWOp::Write(wo) => wo.len(),
        }
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn is_read(&self) -> bool {
        matches!(self, RWOp::Read(_))
    }
    pub fn is_write(&self) -> bool {
        matches!(self, RWOp::Write(_))
    }
}

/// A guest physical address.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GuestAddr(pub u64);

/// A region of guest physical memory.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct GuestRegion(pub GuestAddr, pub usize);

impl Add<usize> for GuestAddr {
    type Output = Self;

    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs as u64)
    }
}
impl BitAnd<usize> for GuestAddr {
    type Output = Self;

    fn bitand(self, rhs: usize) -> Self::Output {
        Self(self.0 & rhs as u64)
    }
}

/// Smallest host memory page the controller will accept (CC.MPS of 0).
pub const PAGE_SIZE: usize = 0x1000;
pub const PAGE_OFFSET: usize = 0xfff;
pub const PAGE_MASK: usize = usize::MAX - PAGE_OFFSET;
pub const PAGE_SHIFT: usize = 12;

pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readop_base_size() {
        let mut buf = [0u8; 8];
        let mut ro8 = ReadOp::from_buf(0, &mut buf[0..1]);
        ro8.write_bytes(&[1]);
        assert_eq!(buf, [1, 0, 0, 0, 0, 0, 0, 0]);

        let mut ro32 = ReadOp::from_buf(0, &mut buf[0..4]);
        ro32.write_u32(0x4000_0000);
        assert_eq!(buf, [0, 0, 0, 0x40, 0, 0, 0, 0]);

        let mut ro64 = ReadOp::from_buf(0, &mut buf);
        ro64.write_u64(0x8000_0000_0000_0000);
        assert_eq!(buf, [0, 0, 0, 0, 0, 0, 0, 0x80]);
    }

    #[test]
    fn writeop_base_size() {
        let buf = [0x10, 0x20, 0x30, 0x40, 0x50, 0x60, 0x70, 0x80];
        let mut wo16 = WriteOp::from_buf(0, &buf[0..2]);
        assert_eq!(wo16.read_u16(), 0x2010);

        let mut wo64 = WriteOp::from_buf(0, &buf);
        assert_eq!(wo64.read_u64(), 0x8070605040302010);
    }

    #[test]
    fn writeop_extended() {
        let buf = [0xaa, 0xbb];
        let mut wo = WriteOp::from_buf(0x1000, &buf);
        assert_eq!(wo.read_extended(), 0xbbaa);
        assert_eq!(wo.avail(), 0);
    }

    #[test]
    fn child_ops() {
        let mut buf = [0u8; 8];
        let mut parent = ReadOp::from_buf(0x10, &mut buf);
        let mut child = ReadOp::new_child(2, &mut parent, 4..6);
        assert_eq!(child.offset(), 2);
        child.fill(0xff);
        assert_eq!(buf, [0, 0, 0, 0, 0xff, 0xff, 0, 0]);

        let src = [1u8, 2, 3, 4];
        let wparent = WriteOp::from_buf(0, &src);
        let mut wchild = WriteOp::new_child(0, &wparent, 1..=2);
        assert_eq!(wchild.read_u16(), 0x0302);
    }

    #[test]
    #[should_panic]
    fn readop_oversize() {
        let mut buf = [0u8];
        let mut ro8 = ReadOp::from_buf(0, &mut buf);
        ro8.write_u32(0x1000);
    }

    #[test]
    fn guest_addr_page_mask() {
        assert_eq!(GuestAddr(0x1234) & PAGE_MASK, GuestAddr(0x1000));
    }
}
