// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host memory as seen by the controller's DMA engine.

use std::sync::Mutex;

use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::common::{GuestAddr, GuestRegion};

#[derive(Error, Debug, Eq, PartialEq)]
pub enum Error {
    #[error("no memory backing {0:?}")]
    Unmapped(GuestRegion),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Byte-level DMA access to host memory, provided by the embedder.
pub trait DmaMemory: Send + Sync + 'static {
    /// Fill `buf` from memory starting at `addr`.
    fn read_bytes(&self, addr: GuestAddr, buf: &mut [u8]) -> Result<()>;

    /// Store `buf` into memory starting at `addr`.
    fn write_bytes(&self, addr: GuestAddr, buf: &[u8]) -> Result<()>;
}

impl dyn DmaMemory {
    /// Read a fixed-layout object out of memory.
    pub fn read<T: FromBytes + IntoBytes>(&self, addr: GuestAddr) -> Result<T> {
        let mut val = T::new_zeroed();
        self.read_bytes(addr, val.as_mut_bytes())?;
        Ok(val)
    }

    /// Write a fixed-layout object into memory.
    pub fn write<T: IntoBytes + Immutable>(
        &self,
        addr: GuestAddr,
        val: &T,
    ) -> Result<()> {
        self.write_bytes(addr, val.as_bytes())
    }
}

/// Flat, zero-filled memory spanning [`base`, `base + len`).
///
/// Suitable for embedders which keep host memory in a single buffer, and for
/// exercising the controller without a hypervisor.
pub struct GuestRam {
    base: u64,
    bytes: Mutex<Vec<u8>>,
}

impl GuestRam {
    pub fn new(base: u64, len: usize) -> Self {
        Self { base, bytes: Mutex::new(vec![0; len]) }
    }

    fn span(&self, addr: GuestAddr, len: usize, total: usize) -> Result<usize> {
        let err = || Error::Unmapped(GuestRegion(addr, len));
        let start = addr.0.checked_sub(self.base).ok_or_else(err)?;
        let start = usize::try_from(start).map_err(|_| err())?;
        match start.checked_add(len) {
            Some(end) if end <= total => Ok(start),
            _ => Err(err()),
        }
    }
}

impl DmaMemory for GuestRam {
    fn read_bytes(&self, addr: GuestAddr, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock().unwrap();
        let start = self.span(addr, buf.len(), bytes.len())?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write_bytes(&self, addr: GuestAddr, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock().unwrap();
        let start = self.span(addr, buf.len(), bytes.len())?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bounds_enforced() {
        let ram = GuestRam::new(0x10_0000, 0x1000);
        let mut buf = [0u8; 16];

        assert!(ram.read_bytes(GuestAddr(0x10_0000), &mut buf).is_ok());
        assert!(ram.read_bytes(GuestAddr(0x10_0ff0), &mut buf).is_ok());
        assert_eq!(
            ram.read_bytes(GuestAddr(0x10_0ff8), &mut buf),
            Err(Error::Unmapped(GuestRegion(GuestAddr(0x10_0ff8), 16)))
        );
        assert!(ram.write_bytes(GuestAddr(0xf_fff8), &buf).is_err());
        assert!(ram.write_bytes(GuestAddr(u64::MAX), &buf).is_err());
    }

    #[test]
    fn typed_access() {
        let ram = GuestRam::new(0, 0x1000);
        let mem: &dyn DmaMemory = &ram;

        mem.write(GuestAddr(0x100), &0x1122_3344_5566_7788u64).unwrap();
        assert_eq!(mem.read::<u32>(GuestAddr(0x104)).unwrap(), 0x1122_3344);
        assert_eq!(mem.read::<u8>(GuestAddr(0x100)).unwrap(), 0x88);
    }
}
