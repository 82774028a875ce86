// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Block storage backing the controller's namespace.

use std::num::NonZeroUsize;
use std::sync::Arc;

use thiserror::Error;

use crate::tasks::Scheduler;

mod file;
pub use file::FileBackend;

mod in_memory;
pub use in_memory::InMemoryBackend;

pub type ByteOffset = usize;
pub type ByteLen = usize;

/// Block size used when the configuration does not choose one.
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

#[usdt::provider(provider = "nvme_emu")]
mod probes {
    fn block_begin(req_id: u64, op: u8, offset: u64, len: u64) {}
    fn block_complete(req_id: u64, result: u8) {}
}

/// Type of operations which may be issued to a block backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Read from `offset` for `len`
    Read(ByteOffset, ByteLen),
    /// Write to `offset` for `len`
    Write(ByteOffset, ByteLen),
    /// Zero the region at `offset` for `len`
    WriteZeroes(ByteOffset, ByteLen),
    /// Flush buffer(s)
    Flush,
}
impl Operation {
    /// Does the operation modify the contents of the device?
    pub const fn is_write(&self) -> bool {
        matches!(self, Operation::Write(..) | Operation::WriteZeroes(..))
    }

    const fn probe_code(&self) -> u8 {
        match self {
            Operation::Read(..) => 0,
            Operation::Write(..) => 1,
            Operation::WriteZeroes(..) => 2,
            Operation::Flush => 3,
        }
    }
}

/// Result of a block [`Request`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Result {
    /// Request succeeded
    Success = 0,
    /// Backend indicated failure for operation
    Failure,
    /// Underlying backend is read-only
    ReadOnly,
    /// Request was canceled before it completed
    Canceled,
}
impl Result {
    pub const fn is_err(&self) -> bool {
        !matches!(self, Result::Success)
    }
}

/// Identifier assigned to a [Request] by its submitter.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReqId(pub u64);

/// Block operation request
#[derive(Clone, Debug)]
pub struct Request {
    pub op: Operation,

    /// Data to be written for [Operation::Write], empty otherwise.
    pub data: Vec<u8>,
}
impl Request {
    pub fn new_read(off: ByteOffset, len: ByteLen) -> Self {
        Self { op: Operation::Read(off, len), data: Vec::new() }
    }

    pub fn new_write(off: ByteOffset, data: Vec<u8>) -> Self {
        Self { op: Operation::Write(off, data.len()), data }
    }

    pub fn new_write_zeroes(off: ByteOffset, len: ByteLen) -> Self {
        Self { op: Operation::WriteZeroes(off, len), data: Vec::new() }
    }

    pub fn new_flush() -> Self {
        Self { op: Operation::Flush, data: Vec::new() }
    }
}

/// Outcome of a [Request], reported back through [crate::tasks::Task::IoDone]
#[derive(Debug)]
pub struct IoCompletion {
    pub id: ReqId,
    pub op: Operation,
    pub result: Result,

    /// Data produced by a successful [Operation::Read].
    pub data: Vec<u8>,
}

/// Metadata regarding a block backend.
#[derive(Default, Debug, Copy, Clone)]
pub struct DeviceInfo {
    /// Size (in bytes) per block
    pub block_size: u32,
    /// Device size in blocks (see above)
    pub total_size: u64,
    /// Is the device read-only
    pub read_only: bool,
}
impl DeviceInfo {
    pub fn byte_len(&self) -> u64 {
        self.total_size * u64::from(self.block_size)
    }
}

/// Options to control behavior of block backend.
#[derive(Default, Copy, Clone)]
pub struct BackendOpts {
    /// Size (in bytes) per block
    pub block_size: Option<u32>,

    /// Disallow writes (returning errors if attempted)
    pub read_only: Option<bool>,

    /// Initial state of the volatile write cache
    pub write_cache: Option<bool>,
}
impl From<&nvme_emu_config::BlockOpts> for BackendOpts {
    fn from(opts: &nvme_emu_config::BlockOpts) -> Self {
        Self {
            block_size: opts.block_size,
            read_only: opts.read_only,
            write_cache: opts.write_cache,
        }
    }
}

/// Storage which services [Request]s on behalf of the controller.
///
/// Requests are submitted without blocking. Each one is answered by exactly
/// one [IoCompletion], delivered as a [crate::tasks::Task::IoDone] through
/// the [Scheduler] given to [Backend::attach()], unless it was canceled
/// first.
pub trait Backend: Send + Sync + 'static {
    fn info(&self) -> DeviceInfo;

    /// Route completions through `sched`.
    fn attach(&self, sched: Arc<dyn Scheduler>);

    fn submit(&self, id: ReqId, req: Request);

    /// Cancel request `id` if it is still in flight. Its completion will not
    /// be delivered.
    fn cancel(&self, id: ReqId);

    /// Block until every submitted request has finished.
    fn drain(&self);

    fn write_cache(&self) -> bool;
    fn set_write_cache(&self, enabled: bool);
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("backend IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid backend configuration: {0}")]
    Invalid(&'static str),
}

/// Create the backend described by the configuration.
pub fn create_backend(
    cfg: &nvme_emu_config::Backend,
) -> std::result::Result<Arc<dyn Backend>, Error> {
    let opts = BackendOpts::from(cfg.opts());
    let be: Arc<dyn Backend> = match cfg {
        nvme_emu_config::Backend::Memory { size, .. } => {
            let size = usize::try_from(*size)
                .map_err(|_| Error::Invalid("memory backend too large"))?;
            InMemoryBackend::create(vec![0; size], opts)?
        }
        nvme_emu_config::Backend::File { path, workers, .. } => {
            let workers = workers.unwrap_or(NonZeroUsize::MIN);
            FileBackend::create(path, opts, workers)?
        }
    };
    Ok(be)
}

/// Validate `block_size` against a backing length of `len` bytes.
fn check_geometry(block_size: u32, len: u64) -> std::io::Result<u64> {
    use std::io::{Error, ErrorKind};

    if block_size < 512 || !block_size.is_power_of_two() {
        return Err(Error::new(ErrorKind::InvalidInput, "invalid block size"));
    }
    if len == 0 || len % u64::from(block_size) != 0 {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!("size not multiple of block size {block_size}"),
        ));
    }
    Ok(len / u64::from(block_size))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn geometry() {
        assert_eq!(check_geometry(512, 4096).unwrap(), 8);
        assert!(check_geometry(500, 4096).is_err());
        assert!(check_geometry(512, 4000).is_err());
        assert!(check_geometry(4096, 0).is_err());
    }

    #[test]
    fn from_config() {
        let cfg = nvme_emu_config::Backend::Memory {
            size: 1 << 20,
            opts: nvme_emu_config::BlockOpts {
                write_cache: Some(false),
                ..Default::default()
            },
        };
        let be = create_backend(&cfg).unwrap();
        let info = be.info();
        assert_eq!(info.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(info.total_size, (1 << 20) / 512);
        assert!(!info.read_only);
        assert!(!be.write_cache());
    }
}
