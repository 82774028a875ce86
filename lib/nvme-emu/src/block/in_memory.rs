// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::{Error, ErrorKind, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::block::{self, probes, IoCompletion, ReqId, Request};
use crate::tasks::{Scheduler, Task};

/// Volatile backend which services each request as it is submitted.
///
/// The completion is still delivered through the scheduler, so the
/// controller observes the same asynchronous flow as with other backends.
pub struct InMemoryBackend {
    bytes: Mutex<Vec<u8>>,
    info: block::DeviceInfo,
    write_cache: AtomicBool,
    sched: Mutex<Option<Arc<dyn Scheduler>>>,
}

impl InMemoryBackend {
    pub fn create(
        bytes: Vec<u8>,
        opts: block::BackendOpts,
    ) -> Result<Arc<Self>> {
        let block_size = opts.block_size.unwrap_or(block::DEFAULT_BLOCK_SIZE);
        let total_size = block::check_geometry(block_size, bytes.len() as u64)?;

        let info = block::DeviceInfo {
            block_size,
            total_size,
            read_only: opts.read_only.unwrap_or(false),
        };
        Ok(Arc::new(Self {
            bytes: Mutex::new(bytes),
            info,
            write_cache: AtomicBool::new(opts.write_cache.unwrap_or(true)),
            sched: Mutex::new(None),
        }))
    }

    /// Copy out the current contents of the backend.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().unwrap().clone()
    }

    fn process_request(&self, req: Request) -> Result<Vec<u8>> {
        if self.info.read_only && req.op.is_write() {
            return Err(Error::new(
                ErrorKind::PermissionDenied,
                "backend is read-only",
            ));
        }

        let mut bytes = self.bytes.lock().unwrap();
        match req.op {
            block::Operation::Read(off, len) => {
                let range = checked_range(&bytes, off, len)?;
                Ok(bytes[range].to_vec())
            }
            block::Operation::Write(off, len) => {
                if req.data.len() != len {
                    return Err(Error::new(
                        ErrorKind::InvalidInput,
                        "write payload length mismatch",
                    ));
                }
                let range = checked_range(&bytes, off, len)?;
                bytes[range].copy_from_slice(&req.data);
                Ok(Vec::new())
            }
            block::Operation::WriteZeroes(off, len) => {
                let range = checked_range(&bytes, off, len)?;
                bytes[range].fill(0);
                Ok(Vec::new())
            }
            block::Operation::Flush => {
                // nothing to do
                Ok(Vec::new())
            }
        }
    }
}

fn checked_range(
    bytes: &[u8],
    off: usize,
    len: usize,
) -> Result<std::ops::Range<usize>> {
    match off.checked_add(len) {
        Some(end) if end <= bytes.len() => Ok(off..end),
        _ => Err(Error::new(
            ErrorKind::InvalidInput,
            format!(
                "invalid offset {off} and len {len} when bytes len is {}",
                bytes.len()
            ),
        )),
    }
}

impl block::Backend for InMemoryBackend {
    fn info(&self) -> block::DeviceInfo {
        self.info
    }

    fn attach(&self, sched: Arc<dyn Scheduler>) {
        *self.sched.lock().unwrap() = Some(sched);
    }

    fn submit(&self, id: ReqId, req: Request) {
        let op = req.op;
        let (off, len) = match op {
            block::Operation::Read(off, len)
            | block::Operation::Write(off, len)
            | block::Operation::WriteZeroes(off, len) => (off, len),
            block::Operation::Flush => (0, 0),
        };
        probes::block_begin!(|| {
            (id.0, op.probe_code(), off as u64, len as u64)
        });

        let is_write = req.op.is_write();
        let (result, data) = match self.process_request(req) {
            Ok(data) => (block::Result::Success, data),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                (block::Result::ReadOnly, Vec::new())
            }
            Err(_) => (block::Result::Failure, Vec::new()),
        };
        debug_assert!(!is_write || data.is_empty());
        probes::block_complete!(|| (id.0, result as u8));

        let sched = self.sched.lock().unwrap().clone();
        if let Some(sched) = sched {
            sched.schedule(Task::IoDone(IoCompletion { id, op, result, data }));
        }
    }

    fn cancel(&self, _id: ReqId) {
        // Requests finish within submit(), so there is never anything in
        // flight to cancel.
    }

    fn drain(&self) {}

    fn write_cache(&self) -> bool {
        self.write_cache.load(Ordering::Relaxed)
    }
    fn set_write_cache(&self, enabled: bool) {
        self.write_cache.store(enabled, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block::Backend;
    use crate::tasks::TaskQueue;

    fn completion(q: &TaskQueue) -> IoCompletion {
        match q.try_next() {
            Some(Task::IoDone(c)) => c,
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn read_write_zero() {
        let be = InMemoryBackend::create(
            vec![0xaa; 4096],
            block::BackendOpts::default(),
        )
        .unwrap();
        let q = Arc::new(TaskQueue::new());
        be.attach(q.clone());

        be.submit(ReqId(1), Request::new_write(512, vec![0x55; 512]));
        let c = completion(&q);
        assert_eq!(c.id, ReqId(1));
        assert_eq!(c.result, block::Result::Success);

        be.submit(ReqId(2), Request::new_write_zeroes(0, 512));
        assert_eq!(completion(&q).result, block::Result::Success);

        be.submit(ReqId(3), Request::new_read(0, 1024));
        let c = completion(&q);
        assert_eq!(c.result, block::Result::Success);
        assert!(c.data[..512].iter().all(|b| *b == 0));
        assert!(c.data[512..].iter().all(|b| *b == 0x55));

        be.submit(ReqId(4), Request::new_read(4000, 512));
        assert_eq!(completion(&q).result, block::Result::Failure);
    }

    #[test]
    fn read_only() {
        let be = InMemoryBackend::create(
            vec![0; 4096],
            block::BackendOpts { read_only: Some(true), ..Default::default() },
        )
        .unwrap();
        let q = Arc::new(TaskQueue::new());
        be.attach(q.clone());

        be.submit(ReqId(1), Request::new_write(0, vec![1; 512]));
        assert_eq!(completion(&q).result, block::Result::ReadOnly);
        be.submit(ReqId(2), Request::new_flush());
        assert_eq!(completion(&q).result, block::Result::Success);
    }
}
