// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DMA on behalf of commands, and the Physical Region Page (PRP) entries
//! and lists which describe their data buffers.
//!
//! A PRP entry names a page of memory (PRP1 may start partway into its page).
//! A transfer covering more than two pages places a list of entries at PRP2,
//! the final slot of which chains to the next list page when the transfer
//! continues past it.
//!
//! See NVMe 1.3 Section 4.3 Physical Region Page Entry and List

use std::mem::size_of;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes};

use super::cmb::Cmb;
use crate::common::*;
use crate::mem::{self, DmaMemory};

/// A contiguous piece of a command's data buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    /// Host memory, reached through [DmaMemory]
    Host(GuestRegion),
    /// Controller Memory Buffer, as an offset and length within it
    Cmb(usize, usize),
}

impl Segment {
    pub fn len(&self) -> usize {
        match self {
            Segment::Host(GuestRegion(_, len)) => *len,
            Segment::Cmb(_, len) => *len,
        }
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PrpError {
    #[error("PRP1 is null")]
    NullPrp1,

    #[error("PRP2 required but null")]
    NullPrp2,

    #[error("PRP entry {0:#x} is null or not page aligned")]
    BadEntry(u64),

    #[error("buffer at {0:#x} straddles the controller memory buffer")]
    CmbBounds(u64),

    #[error("DMA failed: {0}")]
    Mem(#[from] mem::Error),
}

/// DMA access for the controller, routing addresses which fall within a
/// mapped [Cmb] to the buffer and everything else to host memory.
pub struct DmaCtx<'a> {
    mem: &'a dyn DmaMemory,
    cmb: &'a Cmb,
    page_size: usize,
}

impl<'a> DmaCtx<'a> {
    pub fn new(
        mem: &'a dyn DmaMemory,
        cmb: &'a Cmb,
        page_size: usize,
    ) -> Self {
        debug_assert!(page_size.is_power_of_two());
        Self { mem, cmb, page_size }
    }

    pub fn read_bytes(
        &self,
        addr: u64,
        buf: &mut [u8],
    ) -> Result<(), PrpError> {
        if self.cmb.contains(addr) {
            let range = self
                .cmb
                .region(addr, buf.len())
                .ok_or(PrpError::CmbBounds(addr))?;
            self.cmb.read(range, buf);
            return Ok(());
        }
        Ok(self.mem.read_bytes(GuestAddr(addr), buf)?)
    }

    pub fn write_bytes(&self, addr: u64, buf: &[u8]) -> Result<(), PrpError> {
        if self.cmb.contains(addr) {
            let range = self
                .cmb
                .region(addr, buf.len())
                .ok_or(PrpError::CmbBounds(addr))?;
            self.cmb.write(range, buf);
            return Ok(());
        }
        Ok(self.mem.write_bytes(GuestAddr(addr), buf)?)
    }

    pub fn read<T: FromBytes + IntoBytes>(
        &self,
        addr: u64,
    ) -> Result<T, PrpError> {
        let mut val = T::new_zeroed();
        self.read_bytes(addr, val.as_mut_bytes())?;
        Ok(val)
    }

    pub fn write<T: IntoBytes + Immutable>(
        &self,
        addr: u64,
        val: &T,
    ) -> Result<(), PrpError> {
        self.write_bytes(addr, val.as_bytes())
    }

    fn is_page_aligned(&self, addr: u64) -> bool {
        addr & (self.page_size as u64 - 1) == 0
    }

    /// Number of entries which fit in one page of a PRP list
    fn max_list_ents(&self) -> usize {
        self.page_size / size_of::<u64>()
    }

    /// Read as much of the PRP list at `addr` as is needed to describe
    /// `remain` bytes, up to one page worth of entries.
    fn read_list(
        &self,
        addr: u64,
        remain: usize,
    ) -> Result<Vec<u64>, PrpError> {
        let nents = (remain + self.page_size - 1) / self.page_size;
        let nents = nents.min(self.max_list_ents());
        let mut raw = vec![0u8; nents * size_of::<u64>()];
        self.read_bytes(addr, &mut raw)?;

        let mut list = vec![0u64; nents];
        LittleEndian::read_u64_into(&raw, &mut list);
        Ok(list)
    }

    fn segment(&self, addr: u64, len: usize) -> Result<Segment, PrpError> {
        if self.cmb.contains(addr) {
            let range =
                self.cmb.region(addr, len).ok_or(PrpError::CmbBounds(addr))?;
            Ok(Segment::Cmb(range.start, len))
        } else {
            Ok(Segment::Host(GuestRegion(GuestAddr(addr), len)))
        }
    }

    /// Resolve the `len` byte buffer described by `prp1` and `prp2` into the
    /// segments which make it up.
    pub fn map_prp(
        &self,
        prp1: u64,
        prp2: u64,
        len: usize,
    ) -> Result<Vec<Segment>, PrpError> {
        if prp1 == 0 {
            return Err(PrpError::NullPrp1);
        }
        let page = self.page_size;

        // The first entry may begin partway into its page
        let first = len.min(page - (prp1 as usize & (page - 1)));
        let mut segs = vec![self.segment(prp1, first)?];
        let mut remain = len - first;

        if remain != 0 {
            if prp2 == 0 {
                return Err(PrpError::NullPrp2);
            }
            if remain > page {
                let max_ents = self.max_list_ents();
                let mut list = self.read_list(prp2, remain)?;
                let mut i = 0;
                while remain != 0 {
                    let mut ent = list[i];
                    if i == max_ents - 1 && remain > page {
                        // Final slot of a full list page chains to the next
                        if ent == 0 || !self.is_page_aligned(ent) {
                            return Err(PrpError::BadEntry(ent));
                        }
                        list = self.read_list(ent, remain)?;
                        i = 0;
                        ent = list[i];
                    }
                    if ent == 0 || !self.is_page_aligned(ent) {
                        return Err(PrpError::BadEntry(ent));
                    }
                    let xfer = remain.min(page);
                    segs.push(self.segment(ent, xfer)?);
                    remain -= xfer;
                    i += 1;
                }
            } else {
                if !self.is_page_aligned(prp2) {
                    return Err(PrpError::BadEntry(prp2));
                }
                segs.push(self.segment(prp2, remain)?);
            }
        }
        Ok(segs)
    }

    /// Collect the contents of `segs` into a single buffer.
    pub fn gather(&self, segs: &[Segment]) -> Result<Vec<u8>, PrpError> {
        let total = segs.iter().map(Segment::len).sum();
        let mut data = vec![0u8; total];
        let mut off = 0;
        for seg in segs {
            let chunk = &mut data[off..off + seg.len()];
            match *seg {
                Segment::Host(GuestRegion(addr, _)) => {
                    self.mem.read_bytes(addr, chunk)?
                }
                Segment::Cmb(start, len) => {
                    self.cmb.read(start..start + len, chunk)
                }
            }
            off += seg.len();
        }
        Ok(data)
    }

    /// Spread `data` across `segs`, stopping when either runs out.
    pub fn scatter(
        &self,
        segs: &[Segment],
        data: &[u8],
    ) -> Result<(), PrpError> {
        let mut off = 0;
        for seg in segs {
            if off >= data.len() {
                break;
            }
            let len = seg.len().min(data.len() - off);
            let chunk = &data[off..off + len];
            match *seg {
                Segment::Host(GuestRegion(addr, _)) => {
                    self.mem.write_bytes(addr, chunk)?
                }
                Segment::Cmb(start, _) => {
                    self.cmb.write(start..start + len, chunk)
                }
            }
            off += len;
        }
        Ok(())
    }

    /// Copy `data` out to the buffer described by `prp1` and `prp2`.
    pub fn write_buf(
        &self,
        prp1: u64,
        prp2: u64,
        data: &[u8],
    ) -> Result<(), PrpError> {
        let segs = self.map_prp(prp1, prp2, data.len())?;
        self.scatter(&segs, data)
    }

    /// Fill `data` from the buffer described by `prp1` and `prp2`.
    pub fn read_buf(
        &self,
        prp1: u64,
        prp2: u64,
        data: &mut [u8],
    ) -> Result<(), PrpError> {
        let segs = self.map_prp(prp1, prp2, data.len())?;
        let buf = self.gather(&segs)?;
        data.copy_from_slice(&buf);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mem::GuestRam;

    use proptest::prelude::*;

    const PAGE: usize = 4096;
    const LIST_BASE: u64 = 0x100_0000;

    fn ram() -> GuestRam {
        GuestRam::new(0, 32 * MB)
    }

    fn host(addr: u64, len: usize) -> Segment {
        Segment::Host(GuestRegion(GuestAddr(addr), len))
    }

    #[test]
    fn single_and_double() {
        let ram = ram();
        let cmb = Cmb::new(0);
        let dma = DmaCtx::new(&ram, &cmb, PAGE);

        assert_eq!(
            dma.map_prp(0x2000, 0, 512).unwrap(),
            vec![host(0x2000, 512)]
        );
        // Offset PRP1 spilling into PRP2
        assert_eq!(
            dma.map_prp(0x2e00, 0x9000, 1024).unwrap(),
            vec![host(0x2e00, 512), host(0x9000, 512)]
        );
        assert_eq!(dma.map_prp(0, 0, 512), Err(PrpError::NullPrp1));
        assert_eq!(dma.map_prp(0x2e00, 0, 1024), Err(PrpError::NullPrp2));
        assert_eq!(
            dma.map_prp(0x2e00, 0x9010, 1024),
            Err(PrpError::BadEntry(0x9010))
        );
    }

    #[test]
    fn list_and_chain() {
        let ram = ram();
        let cmb = Cmb::new(0);
        let dma = DmaCtx::new(&ram, &cmb, PAGE);
        let mem: &dyn DmaMemory = &ram;

        // 600 pages after the first: the first list page holds 511 data
        // entries plus a chain pointer
        let pages = 600;
        for i in 0..511u64 {
            mem.write(GuestAddr(LIST_BASE + i * 8), &(0x20_0000 + i * 0x1000))
                .unwrap();
        }
        let next_list = LIST_BASE + 0x1000;
        mem.write(GuestAddr(LIST_BASE + 511 * 8), &next_list).unwrap();
        for i in 511..pages as u64 {
            mem.write(
                GuestAddr(next_list + (i - 511) * 8),
                &(0x20_0000 + i * 0x1000),
            )
            .unwrap();
        }

        let segs =
            dma.map_prp(0x1000, LIST_BASE, (pages + 1) * PAGE).unwrap();
        assert_eq!(segs.len(), pages + 1);
        assert_eq!(segs[0], host(0x1000, PAGE));
        for (i, seg) in segs[1..].iter().enumerate() {
            assert_eq!(*seg, host(0x20_0000 + i as u64 * 0x1000, PAGE));
        }

        // A bad chain pointer is refused
        mem.write(GuestAddr(LIST_BASE + 511 * 8), &(next_list + 8)).unwrap();
        assert_eq!(
            dma.map_prp(0x1000, LIST_BASE, (pages + 1) * PAGE),
            Err(PrpError::BadEntry(next_list + 8))
        );
    }

    #[test]
    fn cmb_buffers() {
        let ram = ram();
        let mut cmb = Cmb::new(1);
        cmb.map(Some(0x8000_0000));
        let dma = DmaCtx::new(&ram, &cmb, PAGE);

        assert_eq!(
            dma.map_prp(0x8000_1000, 0x8000_3000, 2 * PAGE).unwrap(),
            vec![Segment::Cmb(0x1000, PAGE), Segment::Cmb(0x3000, PAGE)]
        );
        assert_eq!(
            dma.map_prp(0x8000_1000, 0x3000, 2 * PAGE).unwrap(),
            vec![Segment::Cmb(0x1000, PAGE), host(0x3000, PAGE)]
        );
        // The page past the end of the buffer is host memory
        assert_eq!(
            dma.map_prp(0x800f_f000, 0x8010_0000, 2 * PAGE).unwrap(),
            vec![Segment::Cmb(0xff000, PAGE), host(0x8010_0000, PAGE)]
        );

        let segs = dma.map_prp(0x8000_1000, 0x5000, 512).unwrap();
        dma.scatter(&segs, &[0xa5; 512]).unwrap();
        let mut back = [0u8; 512];
        dma.read_bytes(0x8000_1000, &mut back).unwrap();
        assert!(back.iter().all(|b| *b == 0xa5));
        assert_eq!(
            dma.read_bytes(0x800f_ff00, &mut back),
            Err(PrpError::CmbBounds(0x800f_ff00))
        );
    }

    #[test]
    fn buffer_split_between_cmb_and_host() {
        let ram = ram();
        let mut cmb = Cmb::new(1);
        cmb.map(Some(0x8000_0000));
        let dma = DmaCtx::new(&ram, &cmb, PAGE);

        let data: Vec<u8> = (0..2 * PAGE).map(|i| (i % 251) as u8).collect();
        let segs = dma.map_prp(0x8000_2000, 0x6000, data.len()).unwrap();
        assert_eq!(segs, vec![Segment::Cmb(0x2000, PAGE), host(0x6000, PAGE)]);
        dma.scatter(&segs, &data).unwrap();

        let mut front = vec![0u8; PAGE];
        cmb.read(0x2000..0x2000 + PAGE, &mut front);
        assert_eq!(&front[..], &data[..PAGE]);
        let mut back = vec![0u8; PAGE];
        ram.read_bytes(GuestAddr(0x6000), &mut back).unwrap();
        assert_eq!(&back[..], &data[PAGE..]);

        assert_eq!(dma.gather(&segs).unwrap(), data);
    }

    #[test]
    fn larger_pages() {
        let ram = ram();
        let cmb = Cmb::new(0);
        let dma = DmaCtx::new(&ram, &cmb, 4 * PAGE);

        assert_eq!(
            dma.map_prp(0x1_0000, 0x4_0000, 8 * PAGE).unwrap(),
            vec![host(0x1_0000, 4 * PAGE), host(0x4_0000, 4 * PAGE)]
        );
        // Aligned to 4KiB but not to the 16KiB page
        assert_eq!(
            dma.map_prp(0x1_0000, 0x4_1000, 8 * PAGE),
            Err(PrpError::BadEntry(0x4_1000))
        );
    }

    proptest! {
        #[test]
        fn segments_cover_buffer(
            first_off in 0usize..(PAGE / 4),
            len in 1usize..(64 * PAGE),
        ) {
            let ram = ram();
            let cmb = Cmb::new(0);
            let dma = DmaCtx::new(&ram, &cmb, PAGE);
            let mem: &dyn DmaMemory = &ram;
            for i in 0..64u64 {
                mem.write(
                    GuestAddr(LIST_BASE + i * 8),
                    &(0x40_0000 + i * 0x1000),
                )
                .unwrap();
            }

            let prp1 = 0x1000 + (first_off * 4) as u64;
            let segs = dma.map_prp(prp1, LIST_BASE, len).unwrap();
            prop_assert_eq!(segs.iter().map(Segment::len).sum::<usize>(), len);
            for seg in segs {
                match seg {
                    Segment::Host(GuestRegion(addr, l)) => {
                        prop_assert!(l <= PAGE);
                        let page_off = addr.0 as usize & (PAGE - 1);
                        prop_assert!(page_off + l <= PAGE);
                    }
                    Segment::Cmb(..) => prop_assert!(false),
                }
            }
        }
    }
}
