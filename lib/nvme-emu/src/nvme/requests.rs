// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Submission queue processing, completion posting, and the I/O command set.

use slog::{debug, warn};

use super::bits::{self, CompletionQueueEntry, SubmissionQueueEntry};
use super::cmds::{CmdOutcome, Completion, NvmCmd};
use super::queue::{QueueId, ADMIN_QUEUE_ID};
use super::{probes, NvmeCtrl, LBA_SHIFT, NUM_NAMESPACES};
use crate::block::{self, IoCompletion, Operation, Request};
use crate::tasks::Task;

#[usdt::provider(provider = "nvme_emu")]
mod io_probes {
    // The (sqid, cid) pair identifies a command for as long as it is
    // outstanding, so it ties each enqueue to its completion.
    fn nvme_read_enqueue(sqid: u16, cid: u16, off: u64, sz: u64) {}
    fn nvme_read_complete(sqid: u16, cid: u16, res: u8) {}

    fn nvme_write_enqueue(sqid: u16, cid: u16, off: u64, sz: u64) {}
    fn nvme_write_complete(sqid: u16, cid: u16, res: u8) {}

    fn nvme_write_zeroes_enqueue(sqid: u16, cid: u16, off: u64, sz: u64) {}
    fn nvme_write_zeroes_complete(sqid: u16, cid: u16, res: u8) {}

    fn nvme_flush_enqueue(sqid: u16, cid: u16) {}
    fn nvme_flush_complete(sqid: u16, cid: u16, res: u8) {}
}

impl NvmeCtrl {
    /// Fetch and dispatch commands from Submission Queue `sqid` until it is
    /// empty or out of free slots.
    pub(super) fn process_sq(&mut self, sqid: QueueId) {
        loop {
            let Some(sq) = self.sq_mut(sqid) else {
                return;
            };
            if sq.is_empty() || !sq.has_free_slot() {
                return;
            }
            let Some(idx) = sq.pop_head() else {
                return;
            };
            let addr = sq.entry_addr(idx);

            let sqe = match self.dma().read::<SubmissionQueueEntry>(addr) {
                Ok(sqe) => sqe,
                Err(e) => {
                    warn!(self.log, "failed to read submission entry";
                        "sqid" => sqid, "idx" => idx, "error" => %e);
                    continue;
                }
            };
            let (opcode, cid) = (sqe.opcode(), sqe.cid());
            probes::nvme_sq_fetch!(|| (sqid, idx, opcode, cid));

            // Left behind by an Abort
            if opcode == bits::OPC_ABORTED {
                continue;
            }

            let Some(slot) = self.sq_mut(sqid).and_then(|sq| sq.take_slot(cid))
            else {
                return;
            };
            let outcome = if sqid == ADMIN_QUEUE_ID {
                self.admin_cmd(slot, &sqe)
            } else {
                self.io_cmd(sqid, slot, &sqe)
            };
            if let CmdOutcome::Complete(cqe) = outcome {
                self.enqueue_req_completion(sqid, slot, cqe);
            }
        }
    }

    /// Record the result for `slot` of `sqid` and queue it to be posted to
    /// the associated Completion Queue.
    pub(super) fn enqueue_req_completion(
        &mut self,
        sqid: QueueId,
        slot: u16,
        cqe: Completion,
    ) {
        let Some(sq) = self.sq_mut(sqid) else {
            return;
        };
        sq.complete_slot(slot, cqe);
        let cqid = sq.cqid();
        if let Some(cq) = self.cq_mut(cqid) {
            cq.push_pending(sqid, slot);
            self.schedule(Task::PostCq(cqid));
        }
    }

    /// Write pending completions into Completion Queue `cqid` while it has
    /// room.
    pub(super) fn post_cqes(&mut self, cqid: QueueId) {
        loop {
            let Some(cq) = self.cq_mut(cqid) else {
                return;
            };
            if cq.is_full() {
                break;
            }
            let Some((sqid, slot)) = cq.pop_pending() else {
                break;
            };

            let Some(sq) = self.sq(sqid) else {
                continue;
            };
            let (cid, result, sqhd) = {
                let s = sq.slot(slot);
                (s.cid, s.cqe, sq.head())
            };
            let mut cqe = CompletionQueueEntry::new(result, cid);
            cqe.sqhd = sqhd;
            cqe.sqid = sqid;

            let Some((idx, phase, addr)) = self.cq_mut(cqid).and_then(|cq| {
                let (idx, phase) = cq.push_tail()?;
                Some((idx, phase, cq.entry_addr(idx)))
            }) else {
                break;
            };
            cqe.set_phase(phase);
            if let Err(e) = self.dma().write(addr, &cqe) {
                warn!(self.log, "failed to write completion entry";
                    "cqid" => cqid, "idx" => idx, "error" => %e);
            }
            let status = cqe.status_phase;
            probes::nvme_cqe_post!(|| (cqid, idx, sqid, cid, status));

            if let Some(sq) = self.sq_mut(sqid) {
                sq.release_slot(slot);
                // Fetching may have stopped for want of a free slot
                if !sq.is_empty() {
                    self.schedule(Task::DrainSq(sqid));
                }
            }
        }

        if self.cq(cqid).map_or(false, |cq| !cq.is_empty()) {
            self.irq_assert(cqid);
        }
    }

    /// Execute an NVM command from I/O Submission Queue `sqid`.
    fn io_cmd(
        &mut self,
        sqid: QueueId,
        slot: u16,
        sqe: &SubmissionQueueEntry,
    ) -> CmdOutcome {
        let nsid = sqe.nsid;
        if nsid == 0 || nsid > NUM_NAMESPACES {
            return Completion::generic_err_dnr(bits::STS_INVALID_NS).into();
        }

        let cmd = match NvmCmd::parse(sqe) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(self.log, "failed to parse command";
                    "sqid" => sqid, "error" => %e);
                return Completion::from(e).into();
            }
        };

        match cmd {
            NvmCmd::Flush => self.submit_io(sqid, slot, Request::new_flush()),
            NvmCmd::WriteZeroes(cmd) => {
                let (off, len) = match self.lba_range(cmd.slba, cmd.nlb) {
                    Ok(range) => range,
                    Err(cqe) => return cqe.into(),
                };
                self.submit_io(sqid, slot, Request::new_write_zeroes(off, len))
            }
            NvmCmd::Write(cmd) => {
                let (off, len) = match self.lba_range(cmd.slba, cmd.nlb) {
                    Ok(range) => range,
                    Err(cqe) => return cqe.into(),
                };
                let data = {
                    let dma = self.dma();
                    let segs = match dma.map_prp(cmd.prp1, cmd.prp2, len) {
                        Ok(segs) => segs,
                        Err(e) => {
                            warn!(self.log, "bad PRP for write";
                                "sqid" => sqid, "error" => %e);
                            return Completion::generic_err_dnr(
                                bits::STS_INVAL_FIELD,
                            )
                            .into();
                        }
                    };
                    match dma.gather(&segs) {
                        Ok(data) => data,
                        Err(e) => {
                            warn!(self.log, "failed to read write payload";
                                "sqid" => sqid, "error" => %e);
                            return Completion::generic_err(
                                bits::STS_DATA_XFER_ERR,
                            )
                            .into();
                        }
                    }
                };
                self.submit_io(sqid, slot, Request::new_write(off, data))
            }
            NvmCmd::Read(cmd) => {
                let (off, len) = match self.lba_range(cmd.slba, cmd.nlb) {
                    Ok(range) => range,
                    Err(cqe) => return cqe.into(),
                };
                let segs = match self.dma().map_prp(cmd.prp1, cmd.prp2, len) {
                    Ok(segs) => segs,
                    Err(e) => {
                        warn!(self.log, "bad PRP for read";
                            "sqid" => sqid, "error" => %e);
                        return Completion::generic_err_dnr(
                            bits::STS_INVAL_FIELD,
                        )
                        .into();
                    }
                };
                // Filled in when the backend hands the data back
                if let Some(sq) = self.sq_mut(sqid) {
                    sq.slot_mut(slot).segs = segs;
                }
                self.submit_io(sqid, slot, Request::new_read(off, len))
            }
            NvmCmd::Unknown(_) => {
                Completion::generic_err_dnr(bits::STS_INVAL_OPC).into()
            }
        }
    }

    /// Translate a block range into a byte range within the namespace.
    fn lba_range(
        &self,
        slba: u64,
        nlb: u32,
    ) -> Result<(usize, usize), Completion> {
        let nlb = u64::from(nlb);
        match slba.checked_add(nlb) {
            Some(end) if end <= self.ns_blocks => {
                Ok(((slba << LBA_SHIFT) as usize, (nlb << LBA_SHIFT) as usize))
            }
            _ => Err(Completion::generic_err_dnr(bits::STS_LBA_RANGE)),
        }
    }

    /// Hand `req` to the backend on behalf of `slot`.
    fn submit_io(
        &mut self,
        sqid: QueueId,
        slot: u16,
        req: Request,
    ) -> CmdOutcome {
        let id = self.next_req_id();
        let Some(sq) = self.sq_mut(sqid) else {
            return Completion::generic_err(bits::STS_INTERNAL_ERR).into();
        };
        let s = sq.slot_mut(slot);
        s.req = Some(id);
        let cid = s.cid;
        self.inflight.insert(id, (sqid, slot));

        match req.op {
            Operation::Read(off, sz) => {
                io_probes::nvme_read_enqueue!(|| (
                    sqid, cid, off as u64, sz as u64
                ));
            }
            Operation::Write(off, sz) => {
                io_probes::nvme_write_enqueue!(|| (
                    sqid, cid, off as u64, sz as u64
                ));
            }
            Operation::WriteZeroes(off, sz) => {
                io_probes::nvme_write_zeroes_enqueue!(|| (
                    sqid, cid, off as u64, sz as u64
                ));
            }
            Operation::Flush => {
                io_probes::nvme_flush_enqueue!(|| (sqid, cid));
            }
        }
        self.backend.submit(id, req);
        CmdOutcome::Deferred
    }

    /// Finish the command waiting on a backend request.
    pub fn complete_io(&mut self, comp: IoCompletion) {
        let Some((sqid, slot)) = self.inflight.remove(&comp.id) else {
            debug!(self.log, "completion for unknown request";
                "id" => comp.id.0);
            return;
        };
        let Some(sq) = self.sq_mut(sqid) else {
            debug!(self.log, "completion for deleted queue";
                "id" => comp.id.0, "sqid" => sqid);
            return;
        };
        let s = sq.slot_mut(slot);
        if s.req != Some(comp.id) {
            debug!(self.log, "completion for recycled slot";
                "id" => comp.id.0, "sqid" => sqid, "slot" => slot);
            return;
        }
        let cid = s.cid;
        let segs = std::mem::take(&mut s.segs);

        let res = comp.result as u8;
        let mut cqe = Completion::from(comp.result);
        match comp.op {
            Operation::Read(..) => {
                if cqe.is_success() {
                    if let Err(e) = self.dma().scatter(&segs, &comp.data) {
                        warn!(self.log, "failed to write read data";
                            "sqid" => sqid, "error" => %e);
                        cqe = Completion::generic_err(bits::STS_DATA_XFER_ERR);
                    }
                }
                io_probes::nvme_read_complete!(|| (sqid, cid, res));
            }
            Operation::Write(..) => {
                io_probes::nvme_write_complete!(|| (sqid, cid, res));
            }
            Operation::WriteZeroes(..) => {
                io_probes::nvme_write_zeroes_complete!(|| (sqid, cid, res));
            }
            Operation::Flush => {
                io_probes::nvme_flush_complete!(|| (sqid, cid, res));
            }
        }
        if comp.result == block::Result::Canceled {
            debug!(self.log, "request canceled"; "sqid" => sqid, "cid" => cid);
        }
        self.enqueue_req_completion(sqid, slot, cqe);
    }
}
