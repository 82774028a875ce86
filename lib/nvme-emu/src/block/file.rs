// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashSet;
use std::fs::{metadata, File, OpenOptions};
use std::io::{Error, ErrorKind, Result};
use std::num::NonZeroUsize;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::block::{self, probes, DeviceInfo, IoCompletion, ReqId, Request};
use crate::tasks::{Scheduler, Task};

// XXX: completely arb for now
const MAX_WORKERS: usize = 32;

/// Chunk size used when zeroing a region of the file
const ZERO_CHUNK: usize = 64 * 1024;

/// Backend over a file (or device node), serviced by a pool of worker
/// threads.
pub struct FileBackend {
    state: Arc<WorkerState>,
    tx: Mutex<Option<Sender<(ReqId, Request)>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Default)]
struct Inflight {
    ids: HashSet<ReqId>,
    canceled: HashSet<ReqId>,
}

struct WorkerState {
    fp: File,
    info: DeviceInfo,
    write_cache: AtomicBool,
    sched: Mutex<Option<Arc<dyn Scheduler>>>,
    inflight: Mutex<Inflight>,
    idle: Condvar,
}
impl WorkerState {
    fn processing_loop(&self, rx: Receiver<(ReqId, Request)>) {
        while let Ok((id, req)) = rx.recv() {
            let op = req.op;
            let skip = self.inflight.lock().unwrap().canceled.contains(&id);
            let (result, data) = if skip {
                (block::Result::Canceled, Vec::new())
            } else if self.info.read_only && op.is_write() {
                (block::Result::ReadOnly, Vec::new())
            } else {
                match self.process_request(req) {
                    Ok(data) => (block::Result::Success, data),
                    Err(_) => (block::Result::Failure, Vec::new()),
                }
            };
            probes::block_complete!(|| (id.0, result as u8));
            self.finish(IoCompletion { id, op, result, data });
        }
    }

    fn process_request(&self, req: Request) -> Result<Vec<u8>> {
        match req.op {
            block::Operation::Read(off, len) => {
                let mut buf = vec![0; len];
                self.fp.read_exact_at(&mut buf, off as u64)?;
                Ok(buf)
            }
            block::Operation::Write(off, len) => {
                if req.data.len() != len {
                    return Err(Error::new(
                        ErrorKind::InvalidInput,
                        "write payload length mismatch",
                    ));
                }
                self.fp.write_all_at(&req.data, off as u64)?;
                self.write_through()?;
                Ok(Vec::new())
            }
            block::Operation::WriteZeroes(off, len) => {
                let zeroes = vec![0u8; len.min(ZERO_CHUNK)];
                let mut done = 0;
                while done < len {
                    let chunk = (len - done).min(ZERO_CHUNK);
                    self.fp
                        .write_all_at(&zeroes[..chunk], (off + done) as u64)?;
                    done += chunk;
                }
                self.write_through()?;
                Ok(Vec::new())
            }
            block::Operation::Flush => {
                self.fp.sync_data()?;
                Ok(Vec::new())
            }
        }
    }

    /// With the volatile write cache disabled, writes are durable on
    /// completion.
    fn write_through(&self) -> Result<()> {
        if !self.write_cache.load(Ordering::Relaxed) {
            self.fp.sync_data()?;
        }
        Ok(())
    }

    fn finish(&self, comp: IoCompletion) {
        let deliver = {
            let mut inflight = self.inflight.lock().unwrap();
            inflight.ids.remove(&comp.id);
            let deliver = !inflight.canceled.remove(&comp.id);
            if inflight.ids.is_empty() {
                self.idle.notify_all();
            }
            deliver
        };
        if !deliver {
            return;
        }
        let sched = self.sched.lock().unwrap().clone();
        if let Some(sched) = sched {
            sched.schedule(Task::IoDone(comp));
        }
    }
}

impl FileBackend {
    /// Creates a new block backend from a file or device at `path`.
    pub fn create(
        path: impl AsRef<Path>,
        opts: block::BackendOpts,
        worker_count: NonZeroUsize,
    ) -> Result<Arc<Self>> {
        if worker_count.get() > MAX_WORKERS {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "too many workers",
            ));
        }
        let p: &Path = path.as_ref();

        let meta = metadata(p)?;
        let read_only = match (opts.read_only, meta.permissions().readonly()) {
            (Some(false), true) => Err(Error::new(
                ErrorKind::Other,
                "writeable backend with read-only file not allowed",
            )),
            (Some(ro), false) => Ok(ro),
            (_, file_ro) => Ok(file_ro),
        }?;

        let fp = OpenOptions::new().read(true).write(!read_only).open(p)?;
        let len = fp.metadata()?.len();
        let block_size = opts.block_size.unwrap_or(block::DEFAULT_BLOCK_SIZE);
        let total_size = block::check_geometry(block_size, len)?;

        let state = Arc::new(WorkerState {
            fp,
            info: DeviceInfo { block_size, total_size, read_only },
            write_cache: AtomicBool::new(opts.write_cache.unwrap_or(true)),
            sched: Mutex::new(None),
            inflight: Mutex::new(Inflight::default()),
            idle: Condvar::new(),
        });

        let (tx, rx) = unbounded();
        let mut workers = Vec::with_capacity(worker_count.get());
        for n in 0..worker_count.get() {
            let worker_state = state.clone();
            let worker_rx = rx.clone();
            let hdl = std::thread::Builder::new()
                .name(format!("file worker {n}"))
                .spawn(move || worker_state.processing_loop(worker_rx))?;
            workers.push(hdl);
        }

        Ok(Arc::new(Self {
            state,
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }))
    }
}

impl block::Backend for FileBackend {
    fn info(&self) -> DeviceInfo {
        self.state.info
    }

    fn attach(&self, sched: Arc<dyn Scheduler>) {
        *self.state.sched.lock().unwrap() = Some(sched);
    }

    fn submit(&self, id: ReqId, req: Request) {
        let (off, len) = match req.op {
            block::Operation::Read(off, len)
            | block::Operation::Write(off, len)
            | block::Operation::WriteZeroes(off, len) => (off, len),
            block::Operation::Flush => (0, 0),
        };
        probes::block_begin!(|| {
            (id.0, req.op.probe_code(), off as u64, len as u64)
        });

        self.state.inflight.lock().unwrap().ids.insert(id);
        let op = req.op;
        let sent = match self.tx.lock().unwrap().as_ref() {
            Some(tx) => tx.send((id, req)).is_ok(),
            None => false,
        };
        if !sent {
            self.state.finish(IoCompletion {
                id,
                op,
                result: block::Result::Failure,
                data: Vec::new(),
            });
        }
    }

    fn cancel(&self, id: ReqId) {
        let mut inflight = self.state.inflight.lock().unwrap();
        if inflight.ids.contains(&id) {
            inflight.canceled.insert(id);
        }
    }

    fn drain(&self) {
        let mut inflight = self.state.inflight.lock().unwrap();
        while !inflight.ids.is_empty() {
            inflight = self.state.idle.wait(inflight).unwrap();
        }
    }

    fn write_cache(&self) -> bool {
        self.state.write_cache.load(Ordering::Relaxed)
    }
    fn set_write_cache(&self, enabled: bool) {
        self.state.write_cache.store(enabled, Ordering::Relaxed);
    }
}

impl Drop for FileBackend {
    fn drop(&mut self) {
        // Closing the channel lets the workers run dry and exit
        drop(self.tx.lock().unwrap().take());
        for hdl in self.workers.lock().unwrap().drain(..) {
            let _ = hdl.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block::Backend;
    use crate::tasks::TaskQueue;

    use std::io::Write;
    use std::time::Duration;

    fn backing(len: usize) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![0xee; len]).unwrap();
        f.flush().unwrap();
        f
    }

    fn completion(q: &TaskQueue) -> IoCompletion {
        match q.next_timeout(Duration::from_secs(10)) {
            Some(Task::IoDone(c)) => c,
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn bad_geometry() {
        let f = backing(1000);
        let res = FileBackend::create(
            f.path(),
            block::BackendOpts::default(),
            NonZeroUsize::MIN,
        );
        assert!(res.is_err());
    }

    #[test]
    fn write_then_read() {
        let f = backing(8192);
        let be = FileBackend::create(
            f.path(),
            block::BackendOpts {
                write_cache: Some(false),
                ..Default::default()
            },
            NonZeroUsize::new(2).unwrap(),
        )
        .unwrap();
        assert_eq!(be.info().total_size, 16);
        let q = Arc::new(TaskQueue::new());
        be.attach(q.clone());

        be.submit(ReqId(1), Request::new_write(1024, vec![0x12; 1024]));
        assert_eq!(completion(&q).result, block::Result::Success);
        be.submit(ReqId(2), Request::new_write_zeroes(0, 512));
        assert_eq!(completion(&q).result, block::Result::Success);
        be.submit(ReqId(3), Request::new_flush());
        assert_eq!(completion(&q).result, block::Result::Success);

        be.submit(ReqId(4), Request::new_read(0, 2048));
        let c = completion(&q);
        assert_eq!(c.id, ReqId(4));
        assert_eq!(c.result, block::Result::Success);
        assert!(c.data[..512].iter().all(|b| *b == 0));
        assert!(c.data[512..1024].iter().all(|b| *b == 0xee));
        assert!(c.data[1024..].iter().all(|b| *b == 0x12));

        // Past the end of the file
        be.submit(ReqId(5), Request::new_read(8000, 512));
        assert_eq!(completion(&q).result, block::Result::Failure);

        be.drain();
        assert!(q.is_empty());
    }

    #[test]
    fn read_only_file() {
        let f = backing(4096);
        let be = FileBackend::create(
            f.path(),
            block::BackendOpts { read_only: Some(true), ..Default::default() },
            NonZeroUsize::MIN,
        )
        .unwrap();
        assert!(be.info().read_only);
        let q = Arc::new(TaskQueue::new());
        be.attach(q.clone());

        be.submit(ReqId(9), Request::new_write(0, vec![0; 512]));
        assert_eq!(completion(&q).result, block::Result::ReadOnly);
    }
}
