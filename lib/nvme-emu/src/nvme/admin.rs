// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::cmp::min;

use slog::{debug, warn};
use zerocopy::{FromZeros, IntoBytes};

use super::bits::*;
use super::cmds::{self, AdminCmd, CmdOutcome, Completion, FeatureIdent};
use super::queue::{self, CompQueue, QueueId, SubQueue, ADMIN_QUEUE_ID};
use super::{
    aer, probes, NvmeCtrl, Params, LBA_SHIFT, NUM_NAMESPACES, TEMPERATURE,
};
use crate::common::PAGE_SIZE;
use crate::tasks::Task;

/// Error Log Page Entries (0's based)
const ELPE: u8 = 3;

/// Firmware revision reported in Identify Controller
const FIRMWARE_REV: &str = "1.0";

/// Warning and critical composite temperature thresholds, in Kelvin
const WCTEMP: u16 = 0x157;
const CCTEMP: u16 = 0x175;

/// NSID addressing every namespace
const NSID_BROADCAST: u32 = 0xffff_ffff;

/// Copy `s` into a space-padded ASCII field.
fn pad_ascii<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [b' '; N];
    let len = min(s.len(), N);
    out[..len].copy_from_slice(&s.as_bytes()[..len]);
    out
}

/// Build the Identify Controller data structure.
///
/// See NVMe 1.3 Section 5.15.2 Identify Controller data structure
pub(super) fn identify_controller(
    params: &Params,
    write_cache: bool,
) -> IdentifyController {
    let mut id = IdentifyController::new_zeroed();
    id.vid = params.vendor_id;
    id.ssvid = params.vendor_id;
    id.sn = pad_ascii(&params.serial);
    id.mn = pad_ascii(&params.model);
    id.fr = pad_ascii(FIRMWARE_REV);
    id.rab = 6;
    id.ieee = [0x00, 0x02, 0xb3];
    id.ver = NVME_VER_1_3;

    // Abort Command Limit and Asynchronous Event Request Limit (0's based)
    id.acl = 3;
    id.aerl = aer::AERL;
    // Seven firmware slots, slot 1 read/write
    id.frmw = 7 << 1;
    // Extended data for Get Log Page
    id.lpa = 1 << 2;
    id.elpe = ELPE;
    id.wctemp = WCTEMP;
    id.cctemp = CCTEMP;

    // Submission/Completion Queue entry sizes, as 2^n (max << 4 | min)
    id.sqes = 0x66;
    id.cqes = 0x44;
    id.nn = NUM_NAMESPACES;
    id.oncs = ONCS_WRITE_ZEROES | ONCS_TIMESTAMP;
    id.vwc = u8::from(write_cache);

    let nqn = format!("nqn.2014-08.org.nvmexpress:uuid:{}", params.uuid);
    let mut subnqn = [0u8; 256];
    let len = min(nqn.len(), subnqn.len());
    subnqn[..len].copy_from_slice(&nqn.as_bytes()[..len]);
    id.subnqn = subnqn;

    let mut psd = [PowerStateDescriptor::default(); 32];
    psd[0] = PowerStateDescriptor {
        mp: 0x9c4,
        enlat: 0x10,
        exlat: 0x4,
        ..Default::default()
    };
    id.psd = psd;

    id
}

impl NvmeCtrl {
    /// Execute a command from the Admin Submission Queue.
    pub(super) fn admin_cmd(
        &mut self,
        slot: u16,
        sqe: &SubmissionQueueEntry,
    ) -> CmdOutcome {
        let (opcode, prp1, prp2) = (sqe.opcode(), sqe.prp1, sqe.prp2);
        probes::nvme_admin_cmd!(|| (opcode, prp1, prp2));

        let cmd = match AdminCmd::parse(sqe) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(self.log, "failed to parse admin command";
                    "opcode" => opcode, "error" => %e);
                return Completion::from(e).into();
            }
        };

        let comp = match cmd {
            AdminCmd::DeleteIOSubQ(sqid) => self.acmd_delete_io_sq(sqid),
            AdminCmd::CreateIOSubQ(cmd) => self.acmd_create_io_sq(&cmd),
            AdminCmd::GetLogPage(cmd) => self.acmd_get_log_page(&cmd),
            AdminCmd::DeleteIOCompQ(cqid) => self.acmd_delete_io_cq(cqid),
            AdminCmd::CreateIOCompQ(cmd) => self.acmd_create_io_cq(&cmd),
            AdminCmd::Identify(cmd) => self.acmd_identify(&cmd),
            AdminCmd::Abort(cmd) => self.acmd_abort(&cmd),
            AdminCmd::SetFeatures(cmd) => self.acmd_set_features(&cmd),
            AdminCmd::GetFeatures(cmd) => self.acmd_get_features(&cmd),
            AdminCmd::AsyncEventReq => return self.acmd_async_event_req(slot),
            AdminCmd::Unknown(_) => {
                debug!(self.log, "unsupported admin command";
                    "opcode" => opcode);
                Completion::generic_err_dnr(STS_INVAL_OPC)
            }
        };
        comp.into()
    }

    /// Is `addr` a usable queue base for the current memory page size?
    fn valid_queue_base(&self, addr: u64) -> bool {
        addr != 0 && addr & (self.page_size as u64 - 1) == 0
    }

    /// Is `qid` a possible I/O queue ID for this controller?
    fn valid_io_qid(&self, qid: QueueId) -> bool {
        qid != ADMIN_QUEUE_ID && u32::from(qid) < self.params.num_queues
    }

    /// Service Create I/O Completion Queue command.
    ///
    /// See NVMe 1.3 Section 5.3 Create I/O Completion Queue command
    fn acmd_create_io_cq(&mut self, cmd: &cmds::CreateIOCQCmd) -> Completion {
        let cqid = cmd.qid;
        if !self.valid_io_qid(cqid) || self.cq(cqid).is_some() {
            return Completion::cmd_err_dnr(STS_CREATE_IO_Q_INVAL_QID);
        }
        if cmd.qsize == 0 || u32::from(cmd.qsize) >= queue::MAX_QUEUE_SIZE {
            return Completion::cmd_err_dnr(STS_CREATE_IO_Q_INVAL_QSIZE);
        }
        if !self.valid_queue_base(cmd.prp) {
            return Completion::generic_err_dnr(STS_INVAL_FIELD);
        }
        if u32::from(cmd.intr_vector) > self.params.num_queues {
            return Completion::cmd_err_dnr(STS_CREATE_IO_Q_INVAL_INT_VEC);
        }
        // Only physically contiguous queues are supported
        if !cmd.phys_contig {
            return Completion::generic_err_dnr(STS_INVAL_FIELD);
        }

        match CompQueue::new(
            cqid,
            cmd.intr_vector,
            cmd.intr_enable,
            u32::from(cmd.qsize) + 1,
            cmd.prp,
            self.page_size as u64,
        ) {
            Ok(cq) => {
                self.cqs[cqid as usize] = Some(cq);
                self.qs_created += 1;
                debug!(self.log, "created completion queue";
                    "cqid" => cqid,
                    "size" => u32::from(cmd.qsize) + 1,
                    "vector" => cmd.intr_vector,
                    "ien" => cmd.intr_enable,
                );
                Completion::success()
            }
            Err(e) => e.into(),
        }
    }

    /// Service Create I/O Submission Queue command.
    ///
    /// See NVMe 1.3 Section 5.4 Create I/O Submission Queue command
    fn acmd_create_io_sq(&mut self, cmd: &cmds::CreateIOSQCmd) -> Completion {
        let sqid = cmd.qid;
        if cmd.cqid == ADMIN_QUEUE_ID || self.cq(cmd.cqid).is_none() {
            return Completion::cmd_err_dnr(STS_CREATE_IO_Q_INVAL_CQ);
        }
        if !self.valid_io_qid(sqid) || self.sq(sqid).is_some() {
            return Completion::cmd_err_dnr(STS_CREATE_IO_Q_INVAL_QID);
        }
        if cmd.qsize == 0 || u32::from(cmd.qsize) >= queue::MAX_QUEUE_SIZE {
            return Completion::cmd_err_dnr(STS_CREATE_IO_Q_INVAL_QSIZE);
        }
        if !self.valid_queue_base(cmd.prp) {
            return Completion::generic_err_dnr(STS_INVAL_FIELD);
        }
        if !cmd.phys_contig {
            return Completion::generic_err_dnr(STS_INVAL_FIELD);
        }

        match SubQueue::new(
            sqid,
            cmd.cqid,
            u32::from(cmd.qsize) + 1,
            cmd.prp,
            self.page_size as u64,
        ) {
            Ok(sq) => {
                self.sqs[sqid as usize] = Some(sq);
                if let Some(cq) = self.cq_mut(cmd.cqid) {
                    cq.attach(sqid);
                }
                self.qs_created += 1;
                debug!(self.log, "created submission queue";
                    "sqid" => sqid,
                    "cqid" => cmd.cqid,
                    "size" => u32::from(cmd.qsize) + 1,
                    "prio" => ?cmd.queue_prio,
                );
                Completion::success()
            }
            Err(e) => e.into(),
        }
    }

    /// Service Delete I/O Submission Queue command.
    ///
    /// Commands still with the backend are canceled and completed as
    /// aborted, and whatever fits is posted before the queue goes away.
    ///
    /// See NVMe 1.3 Section 5.6 Delete I/O Submission Queue command
    fn acmd_delete_io_sq(&mut self, sqid: QueueId) -> Completion {
        if sqid == ADMIN_QUEUE_ID {
            return Completion::cmd_err_dnr(STS_DELETE_IO_Q_INVAL_QID);
        }
        let Some(sq) = self.sq(sqid) else {
            return Completion::cmd_err_dnr(STS_DELETE_IO_Q_INVAL_QID);
        };
        let cqid = sq.cqid();
        let reqs: Vec<_> = sq.outstanding_reqs().collect();

        for id in reqs {
            self.backend.cancel(id);
            if let Some((_, slot)) = self.inflight.remove(&id) {
                self.enqueue_req_completion(
                    sqid,
                    slot,
                    Completion::generic_err(STS_ABORT_SQ_DEL),
                );
            }
        }
        self.post_cqes(cqid);
        self.free_sq(sqid);

        debug!(self.log, "deleted submission queue"; "sqid" => sqid);
        Completion::success()
    }

    /// Service Delete I/O Completion Queue command.
    ///
    /// See NVMe 1.3 Section 5.5 Delete I/O Completion Queue command
    fn acmd_delete_io_cq(&mut self, cqid: QueueId) -> Completion {
        if cqid == ADMIN_QUEUE_ID {
            return Completion::cmd_err_dnr(STS_DELETE_IO_Q_INVAL_QID);
        }
        let Some(cq) = self.cq(cqid) else {
            return Completion::cmd_err_dnr(STS_DELETE_IO_Q_INVAL_QID);
        };
        // Submission Queues must be deleted first
        if cq.has_sqs() {
            return Completion::cmd_err_dnr(STS_DELETE_IO_Q_INVAL_Q_DELETION);
        }
        self.free_cq(cqid);

        debug!(self.log, "deleted completion queue"; "cqid" => cqid);
        Completion::success()
    }

    /// Copy `data` out to the host buffer of an admin command.
    fn write_admin_data(
        &self,
        prp1: u64,
        prp2: u64,
        data: &[u8],
    ) -> Completion {
        match self.dma().write_buf(prp1, prp2, data) {
            Ok(()) => Completion::success(),
            Err(e) => {
                warn!(self.log, "failed to write admin command data";
                    "prp1" => prp1, "prp2" => prp2, "error" => %e);
                Completion::generic_err_dnr(STS_INVAL_FIELD)
            }
        }
    }

    /// Service Identify command.
    ///
    /// See NVMe 1.3 Section 5.15 Identify command
    fn acmd_identify(&self, cmd: &cmds::IdentifyCmd) -> Completion {
        let valid_ns = cmd.nsid != 0 && cmd.nsid <= NUM_NAMESPACES;
        match cmd.cns {
            IDENT_CNS_NAMESPACE => {
                if !valid_ns {
                    return Completion::generic_err_dnr(STS_INVALID_NS);
                }
                let ns = self.identify_namespace();
                self.write_admin_data(cmd.prp1, cmd.prp2, ns.as_bytes())
            }
            IDENT_CNS_CONTROLLER => self.write_admin_data(
                cmd.prp1,
                cmd.prp2,
                self.ctrl_ident.as_bytes(),
            ),
            IDENT_CNS_ACTIVE_NS_LIST => {
                // Active NSIDs greater than the one given, ascending
                if cmd.nsid >= NSID_BROADCAST - 1 {
                    return Completion::generic_err_dnr(STS_INVALID_NS);
                }
                let mut list = [0u8; PAGE_SIZE];
                let active = (1..=NUM_NAMESPACES).filter(|ns| *ns > cmd.nsid);
                for (ent, nsid) in list.chunks_exact_mut(4).zip(active) {
                    ent.copy_from_slice(&nsid.to_le_bytes());
                }
                self.write_admin_data(cmd.prp1, cmd.prp2, &list)
            }
            IDENT_CNS_NS_DESCRIPTORS => {
                if !valid_ns {
                    return Completion::generic_err_dnr(STS_INVALID_NS);
                }
                // A single UUID descriptor, the NSID filling the final
                // four bytes of the UUID value
                let mut list = [0u8; PAGE_SIZE];
                list[0] = NIDT_UUID;
                list[1] = NIDL_UUID;
                list[16..20].copy_from_slice(&cmd.nsid.to_be_bytes());
                self.write_admin_data(cmd.prp1, cmd.prp2, &list)
            }
            cns => {
                debug!(self.log, "unsupported identify CNS"; "cns" => cns);
                Completion::generic_err_dnr(STS_INVAL_FIELD)
            }
        }
    }

    fn identify_namespace(&self) -> IdentifyNamespace {
        let mut ns = IdentifyNamespace::new_zeroed();
        ns.nsze = self.ns_blocks;
        ns.ncap = self.ns_blocks;
        ns.nuse = self.ns_blocks;
        // One LBA format, in use
        ns.nlbaf = 0;
        ns.flbas = 0;
        let mut lbaf = [LbaFormat::default(); 16];
        lbaf[0].lbads = LBA_SHIFT as u8;
        ns.lbaf = lbaf;
        ns
    }

    /// Service Abort command.
    ///
    /// Only commands which have not yet been fetched can be aborted. A
    /// match is completed immediately and its ring entry overwritten so
    /// that fetching skips it. Completion Dword 0 is 0 if the command was
    /// aborted and 1 otherwise.
    ///
    /// See NVMe 1.3 Section 5.1 Abort command
    fn acmd_abort(&mut self, cmd: &cmds::AbortCmd) -> Completion {
        let Some(sq) = self.sq(cmd.sqid) else {
            return Completion::generic_err_dnr(STS_INVAL_FIELD);
        };
        let cqid = sq.cqid();
        let entries: Vec<u64> =
            sq.unfetched().map(|idx| sq.entry_addr(idx)).collect();

        for addr in entries {
            let sqe = match self.dma().read::<SubmissionQueueEntry>(addr) {
                Ok(sqe) => sqe,
                Err(e) => {
                    warn!(self.log, "failed to read entry for abort";
                        "sqid" => cmd.sqid, "error" => %e);
                    continue;
                }
            };
            if sqe.cid() != cmd.cid || sqe.opcode() == OPC_ABORTED {
                continue;
            }

            let Some(sq) = self.sq_mut(cmd.sqid) else {
                break;
            };
            let Some(slot) = sq.take_slot(cmd.cid) else {
                break;
            };
            sq.complete_slot(slot, Completion::generic_err(STS_ABORT_REQ));
            if let Err(e) = self.dma().write_bytes(addr, &[OPC_ABORTED]) {
                warn!(self.log, "failed to mark aborted entry";
                    "sqid" => cmd.sqid, "error" => %e);
            }
            if let Some(cq) = self.cq_mut(cqid) {
                cq.push_pending(cmd.sqid, slot);
                self.schedule(Task::PostCq(cqid));
            }
            debug!(self.log, "aborted command";
                "sqid" => cmd.sqid, "cid" => cmd.cid);
            return Completion::success_val(0);
        }
        Completion::success_val(1)
    }

    /// Number of Queues result: the count of I/O queues (0's based)
    fn num_queues_result(&self) -> u32 {
        let n = self.params.num_queues.saturating_sub(2);
        n | n << 16
    }

    /// Service Get Features command.
    ///
    /// See NVMe 1.3 Section 5.14 Get Features command
    fn acmd_get_features(&self, cmd: &cmds::FeatureCmd) -> Completion {
        let feat = &self.features;
        match cmd.fid {
            FeatureIdent::Arbitration => {
                Completion::success_val(feat.arbitration)
            }
            FeatureIdent::PowerManagement => {
                Completion::success_val(feat.power_mgmt)
            }
            FeatureIdent::TemperatureThreshold => {
                Completion::success_val(u32::from(feat.temp_thresh))
            }
            FeatureIdent::ErrorRecovery => {
                Completion::success_val(feat.err_rec)
            }
            FeatureIdent::VolatileWriteCache => {
                Completion::success_val(u32::from(self.backend.write_cache()))
            }
            FeatureIdent::NumberOfQueues { .. } => {
                Completion::success_val(self.num_queues_result())
            }
            FeatureIdent::InterruptCoalescing => {
                Completion::success_val(feat.int_coalescing)
            }
            FeatureIdent::InterruptVectorConfiguration => {
                let iv = (cmd.cdw11 & 0xffff) as usize;
                match feat.int_vector_config.get(iv) {
                    Some(val) => Completion::success_val(*val),
                    None => Completion::generic_err_dnr(STS_INVAL_FIELD),
                }
            }
            FeatureIdent::WriteAtomicity => {
                Completion::success_val(feat.write_atomicity)
            }
            FeatureIdent::AsynchronousEventConfiguration => {
                Completion::success_val(feat.async_config)
            }
            FeatureIdent::Timestamp => {
                let ts = feat.timestamp().0.to_le_bytes();
                self.write_admin_data(cmd.prp1, cmd.prp2, &ts)
            }
            FeatureIdent::Reserved
            | FeatureIdent::LbaRangeType
            | FeatureIdent::SoftwareProgressMarker
            | FeatureIdent::Vendor(_) => {
                Completion::generic_err_dnr(STS_INVAL_FIELD)
            }
        }
    }

    /// Service Set Features command.
    ///
    /// See NVMe 1.3 Section 5.21 Set Features command
    fn acmd_set_features(&mut self, cmd: &cmds::FeatureCmd) -> Completion {
        match cmd.fid {
            FeatureIdent::TemperatureThreshold => {
                self.features.temp_thresh = cmd.cdw11 as u16;
                if self.features.temp_thresh <= TEMPERATURE {
                    self.enqueue_event(
                        AER_TYPE_SMART,
                        AER_INFO_SMART_TEMP_THRESH,
                        LOG_SMART_INFO,
                    );
                }
                Completion::success()
            }
            FeatureIdent::VolatileWriteCache => {
                self.backend.set_write_cache(cmd.cdw11 & 1 != 0);
                Completion::success()
            }
            FeatureIdent::NumberOfQueues { ncqr, nsqr } => {
                // Fixed once I/O queues exist
                if self.qs_created > 2 {
                    return Completion::generic_err_dnr(STS_COMMAND_SEQ_ERR);
                }
                if ncqr == 0xffff || nsqr == 0xffff {
                    return Completion::generic_err_dnr(STS_INVAL_FIELD);
                }
                Completion::success_val(self.num_queues_result())
            }
            FeatureIdent::Timestamp => {
                let mut raw = [0u8; 8];
                if let Err(e) =
                    self.dma().read_buf(cmd.prp1, cmd.prp2, &mut raw)
                {
                    warn!(self.log, "failed to read timestamp";
                        "error" => %e);
                    return Completion::generic_err_dnr(STS_INVAL_FIELD);
                }
                let ts = Timestamp(u64::from_le_bytes(raw)).timestamp();
                self.features.set_timestamp(ts);
                Completion::success()
            }
            FeatureIdent::AsynchronousEventConfiguration => {
                self.features.async_config = cmd.cdw11;
                Completion::success()
            }
            FeatureIdent::Arbitration
            | FeatureIdent::PowerManagement
            | FeatureIdent::ErrorRecovery
            | FeatureIdent::InterruptCoalescing
            | FeatureIdent::InterruptVectorConfiguration
            | FeatureIdent::WriteAtomicity => {
                Completion::cmd_err_dnr(STS_FEAT_NOT_CHANGEABLE)
            }
            FeatureIdent::Reserved
            | FeatureIdent::LbaRangeType
            | FeatureIdent::SoftwareProgressMarker
            | FeatureIdent::Vendor(_) => {
                Completion::generic_err_dnr(STS_INVAL_FIELD)
            }
        }
    }

    /// Service Get Log Page command.
    ///
    /// See NVMe 1.3 Section 5.14 Get Log Page command
    fn acmd_get_log_page(&mut self, cmd: &cmds::GetLogPageCmd) -> Completion {
        if cmd.offset & 0b11 != 0 {
            return Completion::generic_err_dnr(STS_INVAL_FIELD);
        }
        match cmd.ident() {
            cmds::LogPageIdent::Error => {
                let log = [ErrorLogEntry::default(); ELPE as usize + 1];
                let comp = self.write_log(cmd, log.as_bytes());
                if comp.is_success() && !cmd.rae {
                    self.clear_events(AER_TYPE_ERROR);
                }
                comp
            }
            cmds::LogPageIdent::Smart => {
                if cmd.nsid != 0 && cmd.nsid != NSID_BROADCAST {
                    return Completion::generic_err_dnr(STS_INVAL_FIELD);
                }
                let log = self.smart_log();
                let comp = self.write_log(cmd, log.as_bytes());
                if comp.is_success() && !cmd.rae {
                    self.clear_events(AER_TYPE_SMART);
                }
                comp
            }
            cmds::LogPageIdent::Firmware => {
                let log = FwSlotLog::new_zeroed();
                self.write_log(cmd, log.as_bytes())
            }
            lid => {
                debug!(self.log, "unsupported log page"; "lid" => ?lid);
                Completion::cmd_err_dnr(STS_INVALID_LOG_PAGE)
            }
        }
    }

    /// Copy the requested window of `log` out to the host. Reads extending
    /// past the end of the log are truncated.
    fn write_log(&self, cmd: &cmds::GetLogPageCmd, log: &[u8]) -> Completion {
        let size = log.len() as u64;
        if cmd.offset > size {
            return Completion::generic_err_dnr(STS_INVAL_FIELD);
        }
        let start = cmd.offset as usize;
        let len = min(size - cmd.offset, cmd.len) as usize;
        self.write_admin_data(cmd.prp1, cmd.prp2, &log[start..start + len])
    }

    fn smart_log(&self) -> SmartLog {
        let mut log = SmartLog::new_zeroed();
        log.temperature = TEMPERATURE;
        if self.features.temp_thresh <= TEMPERATURE {
            log.critical_warning |= SMART_WARN_TEMPERATURE;
        }
        let hours = self.start_time.elapsed().as_secs() / 3600;
        log.power_on_hours = [hours, 0];
        log
    }
}
