// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Controller Memory Buffer
//!
//! A region of device-resident memory, exposed to the host through its own
//! BAR, which may hold queues and data buffers in place of host memory.
//! Whenever the BAR is mapped, any DMA address falling inside it is served
//! from the buffer rather than through the host's memory.

use std::ops::Range;
use std::sync::Mutex;

use super::bits;
use crate::common::*;

/// BAR index reported in CMBLOC.BIR
pub const CMB_BAR: u8 = 2;

pub struct Cmb {
    /// Host address of the BAR, when mapped
    base: Option<u64>,
    buf: Mutex<Vec<u8>>,
}

impl Cmb {
    /// Create a buffer of `size_mb` MiB. A size of 0 means the controller
    /// has no CMB.
    pub fn new(size_mb: u32) -> Self {
        Self { base: None, buf: Mutex::new(vec![0; size_mb as usize * MB]) }
    }

    pub fn size(&self) -> usize {
        self.buf.lock().unwrap().len()
    }

    pub fn is_present(&self) -> bool {
        self.size() != 0
    }

    pub fn base(&self) -> Option<u64> {
        self.base
    }

    /// Record where the host has placed the BAR, or `None` if unmapped.
    pub fn map(&mut self, base: Option<u64>) {
        self.base = base.filter(|_| self.is_present());
    }

    /// Does `addr` fall within the mapped buffer?
    pub fn contains(&self, addr: u64) -> bool {
        self.offset_of(addr).is_some()
    }

    fn offset_of(&self, addr: u64) -> Option<usize> {
        let off = addr.checked_sub(self.base?)?;
        let off = usize::try_from(off).ok()?;
        (off < self.size()).then_some(off)
    }

    /// Buffer range backing [`addr`, `addr + len`), which must lie wholly
    /// inside the mapped buffer.
    pub fn region(&self, addr: u64, len: usize) -> Option<Range<usize>> {
        let start = self.offset_of(addr)?;
        let end = start.checked_add(len)?;
        (end <= self.size()).then_some(start..end)
    }

    pub fn read(&self, range: Range<usize>, data: &mut [u8]) {
        data.copy_from_slice(&self.buf.lock().unwrap()[range]);
    }

    pub fn write(&self, range: Range<usize>, data: &[u8]) {
        self.buf.lock().unwrap()[range].copy_from_slice(data);
    }

    /// Service a host access to the BAR. Bytes beyond the end of the buffer
    /// read as zero and ignore writes.
    pub fn bar_rw(&self, rwo: RWOp) {
        let mut buf = self.buf.lock().unwrap();
        let start = rwo.offset().min(buf.len());
        let end = (rwo.offset() + rwo.len()).min(buf.len());
        match rwo {
            RWOp::Read(ro) => {
                ro.write_bytes(&buf[start..end]);
                ro.fill(0);
            }
            RWOp::Write(wo) => {
                wo.read_bytes(&mut buf[start..end]);
            }
        }
    }

    /// Value of the CMBLOC register
    pub fn location(&self) -> bits::CmbLocation {
        match self.is_present() {
            true => bits::CmbLocation(0).with_bir(CMB_BAR),
            false => bits::CmbLocation(0),
        }
    }

    /// Value of the CMBSZ register
    pub fn size_reg(&self) -> bits::CmbSize {
        if !self.is_present() {
            return bits::CmbSize(0);
        }
        // Size units of 1MiB
        bits::CmbSize(0)
            .with_sqs(true)
            .with_cqs(true)
            .with_lists(false)
            .with_rds(true)
            .with_wds(true)
            .with_szu(2)
            .with_sz((self.size() / MB) as u32)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn absent() {
        let mut cmb = Cmb::new(0);
        assert!(!cmb.is_present());
        cmb.map(Some(0x1_0000_0000));
        assert_eq!(cmb.base(), None);
        assert!(!cmb.contains(0x1_0000_0000));
        assert_eq!(cmb.size_reg().0, 0);
        assert_eq!(cmb.location().0, 0);
    }

    #[test]
    fn mapped_regions() {
        let mut cmb = Cmb::new(1);
        assert!(!cmb.contains(0x8000_0000));
        cmb.map(Some(0x8000_0000));

        assert!(cmb.contains(0x8000_0000));
        assert!(cmb.contains(0x800f_ffff));
        assert!(!cmb.contains(0x8010_0000));
        assert!(!cmb.contains(0x7fff_ffff));

        assert_eq!(cmb.region(0x8000_1000, 0x100), Some(0x1000..0x1100));
        assert_eq!(cmb.region(0x800f_ff00, 0x200), None);

        cmb.write(0x10..0x14, &[1, 2, 3, 4]);
        let mut buf = [0u8; 8];
        let mut ro = ReadOp::from_buf(0x10, &mut buf);
        cmb.bar_rw(RWOp::Read(&mut ro));
        assert_eq!(buf, [1, 2, 3, 4, 0, 0, 0, 0]);

        let sz = cmb.size_reg();
        assert_eq!(sz.size_bytes(), MB as u64);
        assert!(sz.sqs() && sz.cqs() && sz.rds() && sz.wds());
        assert_eq!(cmb.location().bir(), CMB_BAR);
    }
}
