// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decode of byte-granular accesses into accesses against named registers.
//!
//! An access which covers only part of a register is "extended" to the full
//! register width: reads are performed into a scratch buffer and the
//! requested bytes copied out, and writes are merged with the current value
//! of the register (read-modify-write) before being handed to the device.

use std::cmp::Ordering;
use std::ops::Bound::Included;

use super::aspace::ASpace;
use crate::common::*;

#[derive(Debug)]
struct RegDef<ID> {
    id: ID,
    flags: Flags,
}

/// A mapping of registers within a register window.
#[derive(Debug)]
pub struct RegMap<ID> {
    len: usize,
    space: ASpace<RegDef<ID>>,
}

bitflags! {
    #[derive(Default, Debug, Clone, Copy)]
    pub struct Flags: u8 {
        const DEFAULT = 0;
        /// Hand partial reads through without widening them
        const NO_READ_EXTEND = 0b00000001;
        /// Hand partial writes through without widening them
        const NO_WRITE_EXTEND = 0b00000010;
        /// Widen partial writes with zeroes rather than the current value
        const NO_READ_MOD_WRITE = 0b00000100;
        const PASSTHRU = Self::NO_READ_EXTEND.bits() |
            Self::NO_WRITE_EXTEND.bits();
    }
}

/// One register's share of an access.
struct RegXfer<'a, ID> {
    reg: &'a RegDef<ID>,
    reg_len: usize,
    /// Offset of the transfer within the register
    offset: usize,
    /// Bounds of the transfer within the original access
    skip_front_idx: usize,
    split_back_idx: usize,
}

impl<ID> RegMap<ID> {
    pub fn new(len: usize) -> Self {
        Self { len, space: ASpace::new(0, len - 1) }
    }

    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Define a register of `len` bytes at `start`.
    ///
    /// # Panics
    ///
    /// If the register overlaps an existing definition or falls outside the
    /// window. Register layouts are static, so this is a programming error.
    pub fn define_with_flags(
        &mut self,
        start: usize,
        len: usize,
        id: ID,
        flags: Flags,
    ) {
        if let Err(e) = self.space.register(start, len, RegDef { id, flags }) {
            panic!("bad register definition at {start:#x}+{len:#x}: {e}");
        }
    }

    /// Split `op` into per-register accesses, calling `f` for each.
    pub fn process<F>(&self, op: &mut RWOp<'_, '_>, mut f: F)
    where
        F: FnMut(&ID, RWOp),
    {
        match op {
            RWOp::Read(ro) => self.read(ro, &mut f),
            RWOp::Write(wo) => self.write(wo, &mut f),
        }
    }

    fn read<F>(&self, ro: &mut ReadOp, f: &mut F)
    where
        F: FnMut(&ID, RWOp),
    {
        assert!(!ro.is_empty());
        assert!(ro.offset() + ro.len() - 1 < self.len);

        self.iterate_transfers(ro.offset(), ro.len(), |xfer| {
            let mut copy_op = ReadOp::new_child(
                xfer.offset,
                ro,
                xfer.skip_front_idx..xfer.split_back_idx,
            );
            Self::reg_read(xfer.reg, xfer.reg_len, &mut copy_op, f);
        })
    }

    fn write<F>(&self, wo: &mut WriteOp, f: &mut F)
    where
        F: FnMut(&ID, RWOp),
    {
        assert!(!wo.is_empty());
        assert!(wo.offset() + wo.len() - 1 < self.len);

        self.iterate_transfers(wo.offset(), wo.len(), |xfer| {
            let mut copy_op = WriteOp::new_child(
                xfer.offset,
                wo,
                xfer.skip_front_idx..xfer.split_back_idx,
            );
            Self::reg_write(xfer.reg, xfer.reg_len, &mut copy_op, f);
        })
    }

    fn reg_read<F>(
        reg: &RegDef<ID>,
        reg_len: usize,
        copy_op: &mut ReadOp,
        f: &mut F,
    ) where
        F: FnMut(&ID, RWOp),
    {
        if reg_len == copy_op.len() || reg.flags.contains(Flags::NO_READ_EXTEND)
        {
            f(&reg.id, RWOp::Read(copy_op));
            return;
        }

        let mut scratch = vec![0; reg_len];
        f(&reg.id, RWOp::Read(&mut ReadOp::from_buf(0, &mut scratch)));
        let start = copy_op.offset();
        copy_op.write_bytes(&scratch[start..(start + copy_op.len())]);
    }

    fn reg_write<F>(
        reg: &RegDef<ID>,
        reg_len: usize,
        copy_op: &mut WriteOp,
        f: &mut F,
    ) where
        F: FnMut(&ID, RWOp),
    {
        if reg_len == copy_op.len()
            || reg.flags.contains(Flags::NO_WRITE_EXTEND)
        {
            f(&reg.id, RWOp::Write(copy_op));
            return;
        }

        let mut scratch = vec![0; reg_len];
        if !reg.flags.contains(Flags::NO_READ_MOD_WRITE) {
            f(&reg.id, RWOp::Read(&mut ReadOp::from_buf(0, &mut scratch)));
        }
        let start = copy_op.offset();
        let len = copy_op.len();
        copy_op.read_bytes(&mut scratch[start..(start + len)]);

        f(&reg.id, RWOp::Write(&mut WriteOp::from_buf(0, &scratch)));
    }

    fn iterate_transfers<F>(&self, offset: usize, len: usize, mut do_xfer: F)
    where
        F: FnMut(&RegXfer<'_, ID>),
    {
        let last_position = offset + len - 1;
        let mut position = offset;

        for (reg_start, reg_len, reg) in
            self.space.covered_by((Included(offset), Included(last_position)))
        {
            let mut skip_front = 0;
            let mut split_back = 0;
            let mut reg_offset = 0;

            let consumed = position - offset;
            let remain = len - consumed;

            match position.cmp(&reg_start) {
                Ordering::Equal => {
                    split_back = remain.saturating_sub(reg_len);
                }
                Ordering::Less => {
                    // Gap before this register (an undefined hole)
                    skip_front = reg_start - position;
                    split_back =
                        (remain - skip_front).saturating_sub(reg_len);
                }
                Ordering::Greater => {
                    // Access begins partway into this register
                    reg_offset = position - reg_start;
                    split_back = (reg_offset + remain).saturating_sub(reg_len);
                }
            };
            let xfer_len = remain - (skip_front + split_back);
            debug_assert!(xfer_len <= reg_len);

            do_xfer(&RegXfer {
                reg,
                reg_len,
                offset: reg_offset,
                skip_front_idx: consumed + skip_front,
                split_back_idx: consumed + skip_front + xfer_len,
            });

            position = reg_start + reg_offset + xfer_len;
        }
    }
}

impl<ID: Copy> RegMap<ID> {
    /// Build a map from registers laid end-to-end starting at offset 0.
    ///
    /// `flags` chooses how partial accesses to each register are widened.
    pub fn create_packed<F>(
        size: usize,
        regdef: &[(ID, usize)],
        flags: F,
    ) -> Self
    where
        F: Fn(ID) -> Flags,
    {
        let mut map = RegMap::new(size);
        let mut off = 0;
        for &(id, reg_size) in regdef {
            map.define_with_flags(off, reg_size, id, flags(id));
            off += reg_size;
        }
        assert_eq!(size, off);

        map
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Clone, Copy, Eq, PartialEq, Debug)]
    enum Reg {
        Cap,
        Vs,
        Cc,
        Resv,
    }

    #[derive(Clone, Copy, Eq, PartialEq, Debug)]
    struct Xfer {
        read: bool,
        reg: Reg,
        off: usize,
        len: usize,
    }

    fn layout() -> RegMap<Reg> {
        RegMap::create_packed(
            0x18,
            &[(Reg::Cap, 8), (Reg::Vs, 4), (Reg::Cc, 4), (Reg::Resv, 8)],
            |id| match id {
                Reg::Resv => Flags::PASSTHRU,
                _ => Flags::DEFAULT,
            },
        )
    }

    fn drive_read(map: &RegMap<Reg>, off: usize, len: usize) -> Vec<Xfer> {
        let mut res = Vec::new();
        let mut buf = vec![0; len];
        let mut ro = ReadOp::from_buf(off, &mut buf);
        map.process(&mut RWOp::Read(&mut ro), |id, rwo| {
            res.push(Xfer {
                read: rwo.is_read(),
                reg: *id,
                off: rwo.offset(),
                len: rwo.len(),
            })
        });
        res
    }

    #[test]
    fn whole_and_split_reads() {
        let map = layout();
        assert_eq!(
            drive_read(&map, 0, 8),
            vec![Xfer { read: true, reg: Reg::Cap, off: 0, len: 8 }]
        );
        // A 4-byte read of the top of CAP is widened to the whole register
        assert_eq!(
            drive_read(&map, 4, 4),
            vec![Xfer { read: true, reg: Reg::Cap, off: 0, len: 8 }]
        );
        // Straddling VS and CC yields two full-width accesses
        assert_eq!(
            drive_read(&map, 0xa, 4),
            vec![
                Xfer { read: true, reg: Reg::Vs, off: 0, len: 4 },
                Xfer { read: true, reg: Reg::Cc, off: 0, len: 4 },
            ]
        );
        // Reserved space is passed through as-is
        assert_eq!(
            drive_read(&map, 0x12, 2),
            vec![Xfer { read: true, reg: Reg::Resv, off: 2, len: 2 }]
        );
    }

    #[test]
    fn narrow_write_merges() {
        let map = layout();
        let mut cc: u32 = 0x0046_0001;

        let data = [0x00u8];
        let mut wo = WriteOp::from_buf(0xc, &data);
        map.process(&mut RWOp::Write(&mut wo), |id, rwo| {
            assert_eq!(*id, Reg::Cc);
            match rwo {
                RWOp::Read(ro) => ro.write_u32(cc),
                RWOp::Write(wo) => {
                    assert_eq!(wo.len(), 4);
                    cc = wo.read_u32();
                }
            }
        });
        assert_eq!(cc, 0x0046_0000);
    }
}
