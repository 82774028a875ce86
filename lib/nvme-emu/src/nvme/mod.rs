// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::block::{self, ReqId, Request};
use crate::common::*;
use crate::intr::InterruptSink;
use crate::mem::DmaMemory;
use crate::tasks::{Scheduler, Task, TaskQueue};
use crate::util::regmap::{Flags, RegMap};

use lazy_static::lazy_static;
use slog::{error, info, o, warn, Logger};
use thiserror::Error;
use uuid::Uuid;

mod admin;
mod aer;
mod bits;
mod cmb;
mod cmds;
mod prp;
mod queue;
mod requests;


use bits::*;
use cmb::Cmb;
use prp::DmaCtx;
use queue::{CompQueue, QueueId, SubQueue, ADMIN_QUEUE_ID};

pub use cmb::CMB_BAR;

#[usdt::provider(provider = "nvme_emu")]
mod probes {
    fn nvme_doorbell(off: u64, qid: u16, is_cq: u8, val: u16) {}
    fn nvme_admin_cmd(opcode: u8, prp1: u64, prp2: u64) {}
    fn nvme_sq_fetch(sqid: u16, idx: u16, opcode: u8, cid: u16) {}
    fn nvme_cqe_post(cqid: u16, idx: u16, sqid: u16, cid: u16, status: u16) {}
}

/// The most queue pairs a controller may be configured with, admin pair
/// included.
pub const MAX_NUM_QUEUES: u32 = 2047;

/// Largest Controller Memory Buffer, in MiB. The buffer is allocated up
/// front, so this sits well below the 20-bit limit of CMBSZ.SZ.
pub const MAX_CMB_SIZE_MB: u32 = 1024;

/// PCI Vendor ID reported when none is configured
pub const DEFAULT_VENDOR_ID: u16 = 0x01de;

/// Offset of the first doorbell register in BAR0
const DOORBELL_BASE: usize = 0x1000;

/// Namespaces are formatted with 512-byte logical blocks.
const LBA_SHIFT: u32 = 9;

/// Only a single namespace (NSID 1) is exposed.
const NUM_NAMESPACES: u32 = 1;

/// Maximum supported value of CC.MPS (a 64KiB memory page)
const MPS_MAX: u8 = 4;

/// Required entry sizes (as powers of two) for I/O queues
const IOSQES: u8 = 6;
const IOCQES: u8 = 4;

/// Composite temperature reported in SMART data, in Kelvin
const TEMPERATURE: u16 = 0x143;

/// Default over-temperature threshold, in Kelvin
const TEMPERATURE_THRESHOLD: u16 = 0x14d;

/// NVMe errors
#[derive(Debug, Error)]
pub enum NvmeError {
    #[error("serial number must be 1 to 20 ASCII characters")]
    InvalidSerial,

    #[error("model number must be at most 40 ASCII characters")]
    InvalidModel,

    #[error("queue count {0} outside of 1..={MAX_NUM_QUEUES}")]
    InvalidQueueCount(u32),

    #[error("controller memory buffer of {0} MiB exceeds {MAX_CMB_SIZE_MB}")]
    InvalidCmbSize(u32),

    /// Controller enabled while the admin queues were still in place
    #[error("the admin queues already exist")]
    AdminQueuesExist,

    /// ASQ or ACQ is zero or not aligned to the memory page size
    #[error("the admin queue base address is invalid")]
    InvalidAdminQueueBase,

    /// AQA specifies an empty admin queue
    #[error("the admin queue size is invalid")]
    InvalidAdminQueueSize,

    /// Unsupported MPS requested
    #[error("the requested memory page size is unsupported")]
    UnsupportedMemPageSize,

    /// Unsupported CQES requested
    #[error("the requested CQ entry size is unsupported")]
    UnsupportedCompQueueEntrySize,

    /// Unsupported SQES requested
    #[error("the requested SQ entry size is unsupported")]
    UnsupportedSubQueueEntrySize,

    /// The specified Completion Queue ID did not correspond to a valid
    /// Completion Queue
    #[error("the completion queue specified ({0}) is invalid")]
    InvalidCompQueue(QueueId),

    /// The specified Submission Queue ID did not correspond to a valid
    /// Submission Queue
    #[error("the submission queue specified ({0}) is invalid")]
    InvalidSubQueue(QueueId),

    /// Failed to create Queue
    #[error("failed to create queue: {0}")]
    QueueCreateErr(#[from] queue::QueueCreateErr),

    #[error("failed to update queue: {0}")]
    QueueUpdateError(#[from] queue::QueueUpdateError),
}

/// Static parameters of an emulated controller
#[derive(Clone, Debug)]
pub struct Params {
    /// Serial Number (SN)
    pub serial: String,
    /// Model Number (MN)
    pub model: String,
    /// Number of queue pairs supported, including the admin pair
    pub num_queues: u32,
    /// Size of the Controller Memory Buffer in MiB, 0 for none
    pub cmb_size_mb: u32,
    /// Folded into the NVM Subsystem NVMe Qualified Name
    pub uuid: Uuid,
    /// PCI Vendor ID, also reported as the subsystem vendor
    pub vendor_id: u16,
}

impl Params {
    /// Parameters with default values for everything but the serial number
    pub fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            model: nvme_emu_config::DEFAULT_MODEL.to_string(),
            num_queues: nvme_emu_config::DEFAULT_NUM_QUEUES,
            cmb_size_mb: 0,
            uuid: Uuid::new_v4(),
            vendor_id: DEFAULT_VENDOR_ID,
        }
    }

    fn validate(&self) -> Result<(), NvmeError> {
        if self.serial.is_empty()
            || self.serial.len() > 20
            || !self.serial.is_ascii()
        {
            return Err(NvmeError::InvalidSerial);
        }
        if self.model.len() > 40 || !self.model.is_ascii() {
            return Err(NvmeError::InvalidModel);
        }
        if !(1..=MAX_NUM_QUEUES).contains(&self.num_queues) {
            return Err(NvmeError::InvalidQueueCount(self.num_queues));
        }
        if self.cmb_size_mb > MAX_CMB_SIZE_MB {
            return Err(NvmeError::InvalidCmbSize(self.cmb_size_mb));
        }
        Ok(())
    }
}

impl TryFrom<&nvme_emu_config::Config> for Params {
    type Error = NvmeError;

    fn try_from(cfg: &nvme_emu_config::Config) -> Result<Self, Self::Error> {
        let ctrl = &cfg.controller;
        let params = Params {
            serial: ctrl.serial.clone(),
            model: ctrl.model.clone(),
            num_queues: ctrl.num_queues,
            cmb_size_mb: ctrl.cmb_size_mb,
            uuid: ctrl.uuid.unwrap_or_else(Uuid::new_v4),
            vendor_id: ctrl.vendor_id.unwrap_or(DEFAULT_VENDOR_ID),
        };
        params.validate()?;
        Ok(params)
    }
}

/// Controller register state
#[derive(Debug, Default)]
struct CtrlState {
    /// Controller Capabilities
    cap: Capabilities,

    /// Controller Configuration
    cc: Configuration,

    /// Controller Status
    csts: Status,

    /// Admin Queue Attributes
    aqa: AdminQueueAttrs,

    /// Admin Submission Queue Base Address (ASQ)
    asq: u64,

    /// Admin Completion Queue Base Address (ACQ)
    acq: u64,

    /// Interrupt mask, as set through INTMS and cleared through INTMC
    intms: u32,
}

impl CtrlState {
    fn new() -> Self {
        let cap = Capabilities(0)
            .with_mqes((queue::MAX_QUEUE_SIZE - 1) as u16)
            .with_cqr(true)
            .with_to(0xf)
            .with_css_nvm(true)
            .with_mpsmin(0)
            .with_mpsmax(MPS_MAX);
        Self { cap, ..Default::default() }
    }
}

/// Values managed through Get/Set Features
#[derive(Debug)]
struct Features {
    arbitration: u32,
    power_mgmt: u32,
    temp_thresh: u16,
    err_rec: u32,
    int_coalescing: u32,
    /// Per-vector Interrupt Vector Configuration
    int_vector_config: Vec<u32>,
    write_atomicity: u32,
    async_config: u32,

    /// Timestamp last set by the host, in milliseconds
    host_timestamp: u64,
    /// When `host_timestamp` was set
    timestamp_set_at: Instant,
}

impl Features {
    fn new(num_queues: u32) -> Self {
        Self {
            arbitration: 0,
            power_mgmt: 0,
            temp_thresh: TEMPERATURE_THRESHOLD,
            err_rec: 0,
            int_coalescing: 0,
            // Coalescing Disable set for every vector
            int_vector_config: (0..=num_queues)
                .map(|iv| iv | 1 << 16)
                .collect(),
            write_atomicity: 0,
            async_config: 0,
            host_timestamp: 0,
            timestamp_set_at: Instant::now(),
        }
    }

    fn set_timestamp(&mut self, ts: u64) {
        self.host_timestamp = ts;
        self.timestamp_set_at = Instant::now();
    }

    /// Current value of the Timestamp feature
    fn timestamp(&self) -> Timestamp {
        let elapsed = self.timestamp_set_at.elapsed().as_millis() as u64;
        Timestamp(0)
            .with_timestamp(
                self.host_timestamp.wrapping_add(elapsed) & ((1 << 48) - 1),
            )
            .with_origin(u8::from(self.host_timestamp != 0))
    }
}

/// NVMe Controller
///
/// Owns the register file, the queues, and everything else which makes up
/// the controller's state. All of its entry points take `&mut self`: the
/// embedder serializes register accesses, [Task]s, and backend completions
/// onto a single context.
pub struct NvmeCtrl {
    params: Params,

    /// Register state
    ctrl: CtrlState,

    /// Memory page size, from CC.MPS at enable time
    page_size: usize,

    /// Submission Queues, indexed by queue ID
    sqs: Vec<Option<SubQueue>>,

    /// Completion Queues, indexed by queue ID
    cqs: Vec<Option<CompQueue>>,

    /// Count of existing queues, admin queues included
    qs_created: u32,

    /// Pin interrupt status, one bit per Completion Queue
    irq_status: u32,

    features: Features,
    aer: aer::AerState,
    cmb: Cmb,

    /// Backend requests in flight, and the (sqid, slot) awaiting each
    inflight: HashMap<ReqId, (QueueId, u16)>,
    next_req_id: u64,

    /// Tasks currently scheduled, so that they are not scheduled twice
    sq_sched: Vec<bool>,
    cq_sched: Vec<bool>,
    aer_sched: bool,

    /// Namespace size in logical blocks
    ns_blocks: u64,

    /// The Identify structure returned for Identify controller commands
    ctrl_ident: Box<IdentifyController>,

    /// Power-on time, for SMART data
    start_time: Instant,

    mem: Arc<dyn DmaMemory>,
    intr: Arc<dyn InterruptSink>,
    backend: Arc<dyn block::Backend>,
    sched: Arc<dyn Scheduler>,
    log: Logger,
}

impl NvmeCtrl {
    /// Create a controller in its power-on state.
    ///
    /// Completions from `backend` are routed through `sched`, alongside the
    /// controller's own deferred work.
    pub fn new(
        params: Params,
        mem: Arc<dyn DmaMemory>,
        intr: Arc<dyn InterruptSink>,
        backend: Arc<dyn block::Backend>,
        sched: Arc<dyn Scheduler>,
        log: Logger,
    ) -> Result<Self, NvmeError> {
        params.validate()?;
        let log = log.new(o!("component" => "nvme"));

        let info = backend.info();
        let ns_blocks = info.byte_len() >> LBA_SHIFT;
        backend.attach(sched.clone());

        let nq = params.num_queues as usize;
        let ctrl_ident = Box::new(admin::identify_controller(
            &params,
            backend.write_cache(),
        ));

        info!(log, "NVMe controller created";
            "serial" => &params.serial,
            "num_queues" => params.num_queues,
            "ns_blocks" => ns_blocks,
            "cmb_mb" => params.cmb_size_mb,
        );

        Ok(Self {
            ctrl: CtrlState::new(),
            page_size: PAGE_SIZE,
            sqs: (0..nq).map(|_| None).collect(),
            cqs: (0..nq).map(|_| None).collect(),
            qs_created: 0,
            irq_status: 0,
            features: Features::new(params.num_queues),
            aer: aer::AerState::default(),
            cmb: Cmb::new(params.cmb_size_mb),
            inflight: HashMap::new(),
            next_req_id: 0,
            sq_sched: vec![false; nq],
            cq_sched: vec![false; nq],
            aer_sched: false,
            ns_blocks,
            ctrl_ident,
            start_time: Instant::now(),
            params,
            mem,
            intr,
            backend,
            sched,
            log,
        })
    }

    /// Size of the register BAR, doorbells included
    pub fn reg_size(&self) -> usize {
        (DOORBELL_BASE + 4 + 2 * (self.params.num_queues as usize + 1) * 4)
            .next_power_of_two()
    }

    /// Size of the Controller Memory Buffer BAR, 0 if there is none
    pub fn cmb_size(&self) -> usize {
        self.cmb.size()
    }

    /// Record where the host placed the Controller Memory Buffer BAR.
    pub fn map_cmb(&mut self, base: Option<u64>) {
        self.cmb.map(base);
    }

    /// Service an access to the Controller Memory Buffer BAR.
    pub fn cmb_rw(&self, rwo: RWOp) {
        self.cmb.bar_rw(rwo);
    }

    /// Service an access to the register BAR.
    pub fn bar_rw(&mut self, mut rwo: RWOp) {
        let off = rwo.offset();
        let end = off + rwo.len();
        if rwo.is_empty() {
            return;
        }

        if end > self.reg_size() || (off < DOORBELL_BASE && end > DOORBELL_BASE)
        {
            warn!(self.log, "register access outside of any register";
                "offset" => off, "len" => rwo.len());
            if let RWOp::Read(ro) = rwo {
                ro.fill(0);
            }
            return;
        }

        if off >= DOORBELL_BASE {
            match rwo {
                RWOp::Read(ro) => {
                    warn!(self.log, "read of doorbell register";
                        "offset" => off);
                    ro.fill(0);
                }
                RWOp::Write(wo) => self.doorbell_write(off, wo),
            }
            return;
        }

        if off & 0b11 != 0 || rwo.len() < 4 {
            warn!(self.log, "misaligned or sub-dword register access";
                "offset" => off, "len" => rwo.len());
        }
        CONTROLLER_REGS.process(&mut rwo, |id, rwo| match rwo {
            RWOp::Read(ro) => self.reg_read(id, ro),
            RWOp::Write(wo) => self.reg_write(id, wo),
        });
    }

    /// Run a previously scheduled task.
    pub fn run_task(&mut self, task: Task) {
        match task {
            Task::DrainSq(qid) => {
                if let Some(pending) = self.sq_sched.get_mut(qid as usize) {
                    *pending = false;
                }
                self.process_sq(qid);
            }
            Task::PostCq(qid) => {
                if let Some(pending) = self.cq_sched.get_mut(qid as usize) {
                    *pending = false;
                }
                self.post_cqes(qid);
            }
            Task::ProcessAers => {
                self.aer_sched = false;
                self.process_aers();
            }
            Task::IoDone(comp) => self.complete_io(comp),
        }
    }

    /// Run tasks from `tq` until it is empty.
    ///
    /// `tq` should be the [Scheduler] the controller was created with.
    pub fn run_until_idle(&mut self, tq: &TaskQueue) {
        while let Some(task) = tq.try_next() {
            self.run_task(task);
        }
    }

    /// Return the controller to its power-on state.
    pub fn reset(&mut self) {
        info!(self.log, "controller reset");
        self.clear_ctrl();
        self.ctrl = CtrlState::new();
        self.page_size = PAGE_SIZE;
        self.features = Features::new(self.params.num_queues);
        self.irq_status = 0;
        self.intr.pin().deassert();
    }

    fn reg_read(&self, id: &CtrlrReg, ro: &mut ReadOp) {
        match id {
            CtrlrReg::CtrlrCaps => ro.write_u64(self.ctrl.cap.0),
            CtrlrReg::Version => ro.write_u32(NVME_VER_1_3),
            CtrlrReg::IntrMaskSet | CtrlrReg::IntrMaskClear => {
                ro.write_u32(self.ctrl.intms)
            }
            CtrlrReg::CtrlrCfg => ro.write_u32(self.ctrl.cc.0),
            CtrlrReg::CtrlrStatus => ro.write_u32(self.ctrl.csts.0),
            CtrlrReg::SubsysReset => ro.write_u32(0),
            CtrlrReg::AdminQueueAttr => ro.write_u32(self.ctrl.aqa.0),
            CtrlrReg::AdminSubQAddrLo => ro.write_u32(self.ctrl.asq as u32),
            CtrlrReg::AdminSubQAddrHi => {
                ro.write_u32((self.ctrl.asq >> 32) as u32)
            }
            CtrlrReg::AdminCompQAddrLo => ro.write_u32(self.ctrl.acq as u32),
            CtrlrReg::AdminCompQAddrHi => {
                ro.write_u32((self.ctrl.acq >> 32) as u32)
            }
            CtrlrReg::CmbLoc => ro.write_u32(self.cmb.location().0),
            CtrlrReg::CmbSz => ro.write_u32(self.cmb.size_reg().0),
            CtrlrReg::Reserved => ro.fill(0),
        }
    }

    fn reg_write(&mut self, id: &CtrlrReg, wo: &mut WriteOp) {
        match id {
            CtrlrReg::CtrlrCaps | CtrlrReg::Version => {
                warn!(self.log, "write to read-only register";
                    "register" => ?id);
            }
            CtrlrReg::IntrMaskSet | CtrlrReg::IntrMaskClear => {
                let val = wo.read_u32();
                if self.intr.msix_enabled() {
                    warn!(self.log, "interrupt mask written with MSI-X enabled";
                        "register" => ?id, "value" => val);
                }
                match id {
                    CtrlrReg::IntrMaskSet => self.ctrl.intms |= val,
                    _ => self.ctrl.intms &= !val,
                }
                self.irq_check();
            }
            CtrlrReg::CtrlrCfg => {
                self.cc_write(Configuration(wo.read_u32()));
            }
            CtrlrReg::CtrlrStatus => {
                let val = wo.read_u32();
                if Status(val).nssro() {
                    warn!(self.log, "clearing CSTS.NSSRO is unsupported");
                } else if val != 0 {
                    warn!(self.log, "write to read-only CSTS bits";
                        "value" => val);
                }
            }
            CtrlrReg::SubsysReset => {
                if wo.read_u32() == NSSR_RESET_MAGIC {
                    info!(self.log, "NVM subsystem reset is unsupported");
                }
            }
            CtrlrReg::AdminQueueAttr => {
                self.ctrl.aqa = AdminQueueAttrs(wo.read_u32());
            }
            CtrlrReg::AdminSubQAddrLo => {
                self.ctrl.asq = u64::from(wo.read_u32());
            }
            CtrlrReg::AdminSubQAddrHi => {
                self.ctrl.asq |= u64::from(wo.read_u32()) << 32;
            }
            CtrlrReg::AdminCompQAddrLo => {
                self.ctrl.acq = u64::from(wo.read_u32());
            }
            CtrlrReg::AdminCompQAddrHi => {
                self.ctrl.acq |= u64::from(wo.read_u32()) << 32;
            }
            CtrlrReg::CmbLoc | CtrlrReg::CmbSz => {
                warn!(self.log, "write to read-only CMB register";
                    "register" => ?id);
            }
            CtrlrReg::Reserved => {
                warn!(self.log, "write to reserved register space";
                    "len" => wo.len());
            }
        }
    }

    /// Service a write to the Controller Configuration register.
    fn cc_write(&mut self, new: Configuration) {
        let cur = self.ctrl.cc;
        let none = ShutdownNotification::None;

        // Configuration may be written ahead of the enable bit
        if !new.enabled()
            && !cur.enabled()
            && new.shn() == none
            && cur.shn() == none
        {
            self.ctrl.cc = new;
        }

        if new.enabled() && !cur.enabled() {
            self.ctrl.cc = new;
            match self.start_ctrl() {
                Ok(()) => {
                    info!(self.log, "controller enabled";
                        "page_size" => self.page_size);
                    self.ctrl.csts = Status(0).with_ready(true);
                }
                Err(e) => {
                    error!(self.log, "failed to enable controller";
                        "error" => %e);
                    self.ctrl.csts = Status(0).with_cfs(true);
                }
            }
        } else if !new.enabled() && cur.enabled() {
            info!(self.log, "controller disabled");
            self.clear_ctrl();
            self.ctrl.csts.set_ready(false);
        }

        if new.shn() != none && self.ctrl.cc.shn() == none {
            info!(self.log, "controller shutdown");
            self.clear_ctrl();
            self.ctrl.cc = new;
            self.ctrl.csts.set_shst(ShutdownStatus::Complete);
        } else if new.shn() == none && self.ctrl.cc.shn() != none {
            self.ctrl.csts.set_shst(ShutdownStatus::Normal);
            self.ctrl.cc = new;
        }
    }

    /// Validate the configuration and create the admin queues.
    fn start_ctrl(&mut self) -> Result<(), NvmeError> {
        let cc = self.ctrl.cc;
        let aqa = self.ctrl.aqa;

        if self.sqs[0].is_some() || self.cqs[0].is_some() {
            return Err(NvmeError::AdminQueuesExist);
        }
        let cap = self.ctrl.cap;
        if cc.mps() < cap.mpsmin() || cc.mps() > cap.mpsmax() {
            return Err(NvmeError::UnsupportedMemPageSize);
        }
        let page_size = 1usize << (12 + cc.mps());
        let misaligned = |addr: u64| addr & (page_size as u64 - 1) != 0;
        let (asq, acq) = (self.ctrl.asq, self.ctrl.acq);
        if asq == 0 || acq == 0 || misaligned(asq) || misaligned(acq) {
            return Err(NvmeError::InvalidAdminQueueBase);
        }
        if cc.iocqes() != IOCQES {
            return Err(NvmeError::UnsupportedCompQueueEntrySize);
        }
        if cc.iosqes() != IOSQES {
            return Err(NvmeError::UnsupportedSubQueueEntrySize);
        }
        if aqa.asqs() == 0 || aqa.acqs() == 0 {
            return Err(NvmeError::InvalidAdminQueueSize);
        }

        let mut cq = CompQueue::new(
            ADMIN_QUEUE_ID,
            0,
            true,
            u32::from(aqa.acqs()) + 1,
            acq,
            page_size as u64,
        )?;
        let sq = SubQueue::new(
            ADMIN_QUEUE_ID,
            ADMIN_QUEUE_ID,
            u32::from(aqa.asqs()) + 1,
            asq,
            page_size as u64,
        )?;
        cq.attach(ADMIN_QUEUE_ID);

        self.page_size = page_size;
        self.cqs[0] = Some(cq);
        self.sqs[0] = Some(sq);
        self.qs_created = 2;
        self.features.set_timestamp(0);
        self.aer.reset();
        self.schedule(Task::DrainSq(ADMIN_QUEUE_ID));
        Ok(())
    }

    /// Quiesce the controller: wait out backend I/O, tear down every queue
    /// and forget any pending events.
    fn clear_ctrl(&mut self) {
        self.backend.drain();

        for qid in 0..self.sqs.len() {
            self.free_sq(qid as QueueId);
        }
        for qid in 0..self.cqs.len() {
            self.free_cq(qid as QueueId);
        }
        self.inflight.clear();
        self.aer.reset();

        // Push out anything the backend is still caching
        let id = self.next_req_id();
        self.backend.submit(id, Request::new_flush());
        self.backend.drain();

        self.ctrl.cc = Configuration(0);
        self.qs_created = 0;
        self.irq_status = 0;
        self.irq_check();
    }

    /// Remove a Submission Queue, abandoning its outstanding requests.
    fn free_sq(&mut self, sqid: QueueId) {
        let Some(sq) = self.sqs.get_mut(sqid as usize).and_then(Option::take)
        else {
            return;
        };
        for id in sq.outstanding_reqs() {
            self.backend.cancel(id);
            self.inflight.remove(&id);
        }
        if let Some(cq) = self.cq_mut(sq.cqid()) {
            cq.detach(sqid);
            cq.drop_pending(sqid);
        }
        self.qs_created = self.qs_created.saturating_sub(1);
    }

    fn free_cq(&mut self, cqid: QueueId) {
        if self.cq(cqid).is_none() {
            return;
        }
        self.irq_deassert(cqid);
        self.cqs[cqid as usize] = None;
        self.qs_created = self.qs_created.saturating_sub(1);
    }

    fn sq(&self, qid: QueueId) -> Option<&SubQueue> {
        self.sqs.get(qid as usize)?.as_ref()
    }
    fn sq_mut(&mut self, qid: QueueId) -> Option<&mut SubQueue> {
        self.sqs.get_mut(qid as usize)?.as_mut()
    }
    fn cq(&self, qid: QueueId) -> Option<&CompQueue> {
        self.cqs.get(qid as usize)?.as_ref()
    }
    fn cq_mut(&mut self, qid: QueueId) -> Option<&mut CompQueue> {
        self.cqs.get_mut(qid as usize)?.as_mut()
    }

    /// DMA access to host memory and the CMB
    fn dma(&self) -> DmaCtx<'_> {
        DmaCtx::new(&*self.mem, &self.cmb, self.page_size)
    }

    fn next_req_id(&mut self) -> ReqId {
        let id = ReqId(self.next_req_id);
        self.next_req_id += 1;
        id
    }

    /// Hand `task` to the scheduler unless an identical one is pending.
    fn schedule(&mut self, task: Task) {
        let pending = match &task {
            Task::DrainSq(qid) => self.sq_sched.get_mut(*qid as usize),
            Task::PostCq(qid) => self.cq_sched.get_mut(*qid as usize),
            Task::ProcessAers => Some(&mut self.aer_sched),
            Task::IoDone(_) => None,
        };
        if let Some(pending) = pending {
            if *pending {
                return;
            }
            *pending = true;
        }
        self.sched.schedule(task);
    }

    fn schedule_aers(&mut self) {
        self.schedule(Task::ProcessAers);
    }

    fn doorbell_write(&mut self, off: usize, wo: &mut WriteOp) {
        if off & 0b11 != 0 {
            warn!(self.log, "misaligned doorbell write"; "offset" => off);
            return;
        }

        // Submission Queue y Tail Doorbell offset
        //  = 0x1000 + (2y * (4 << CAP.DSTRD))
        // Completion Queue y Head Doorbell offset
        //  = 0x1000 + ((2y + 1) * (4 << CAP.DSTRD))
        //
        // See NVMe 1.3 Section 3.1.16 & 3.1.17
        //
        // But note that we only support CAP.DSTRD = 0
        let db = off - DOORBELL_BASE;
        let is_cq = (db >> 2) & 0b1 == 0b1;
        // The doorbell region is sized from the queue count, so the queue
        // ID always fits.
        let qid = (if is_cq { (db - 4) >> 3 } else { db >> 3 }) as QueueId;

        // 32-bit register but ignore reserved top 16-bits
        let val = (wo.read_extended() & 0xffff) as u16;
        probes::nvme_doorbell!(|| (off as u64, qid, is_cq as u8, val));

        let res = match is_cq {
            true => self.cq_doorbell(qid, val),
            false => self.sq_doorbell(qid, val),
        };
        if let Err(e) = res {
            warn!(self.log, "doorbell write ignored";
                "offset" => off, "qid" => qid, "value" => val, "error" => %e);
            let info = match e {
                NvmeError::QueueUpdateError(_) => {
                    AER_INFO_ERR_INVALID_DB_VALUE
                }
                _ => AER_INFO_ERR_INVALID_DB_REGISTER,
            };
            if self.aer.outstanding() > 0 {
                self.enqueue_event(AER_TYPE_ERROR, info, LOG_ERROR_INFO);
            }
        }
    }

    /// Completion Queue y Head Doorbell
    fn cq_doorbell(&mut self, qid: QueueId, val: u16) -> Result<(), NvmeError> {
        let cq = self.cq_mut(qid).ok_or(NvmeError::InvalidCompQueue(qid))?;
        let was_full = cq.is_full();
        cq.notify_head(val)?;
        let drained = cq.is_empty();

        if was_full {
            // Submission Queues may have stalled for lack of space in this
            // queue, and completions may be waiting to be posted.
            let sqs: Vec<QueueId> = cq.sqs().collect();
            for sqid in sqs {
                self.schedule(Task::DrainSq(sqid));
            }
            self.schedule(Task::PostCq(qid));
        }
        if drained {
            self.irq_deassert(qid);
        }
        Ok(())
    }

    /// Submission Queue y Tail Doorbell
    fn sq_doorbell(&mut self, qid: QueueId, val: u16) -> Result<(), NvmeError> {
        let sq = self.sq_mut(qid).ok_or(NvmeError::InvalidSubQueue(qid))?;
        sq.notify_tail(val)?;
        self.schedule(Task::DrainSq(qid));
        Ok(())
    }

    /// Bit of `irq_status` used by Completion Queue `cqid`. Queues beyond
    /// the width of INTMS share the last bit.
    fn pin_bit(cqid: QueueId) -> u32 {
        1 << cqid.min(31)
    }

    /// Drive the interrupt pin from the unmasked pin status.
    fn irq_check(&self) {
        if self.intr.msix_enabled() {
            return;
        }
        let pin = self.intr.pin();
        if self.irq_status & !self.ctrl.intms != 0 {
            pin.assert();
        } else {
            pin.deassert();
        }
    }

    /// Signal the host that Completion Queue `cqid` has new entries.
    fn irq_assert(&mut self, cqid: QueueId) {
        let Some(cq) = self.cq(cqid) else {
            return;
        };
        if !cq.intr_enabled() {
            return;
        }
        if self.intr.msix_enabled() {
            self.intr.msix_notify(cq.vector());
        } else {
            self.irq_status |= Self::pin_bit(cqid);
            self.irq_check();
        }
    }

    /// Withdraw the pin interrupt for a drained Completion Queue.
    fn irq_deassert(&mut self, cqid: QueueId) {
        let Some(cq) = self.cq(cqid) else {
            return;
        };
        if !cq.intr_enabled() || self.intr.msix_enabled() {
            return;
        }
        let bit = Self::pin_bit(cqid);
        let shared = self.cqs.iter().flatten().any(|other| {
            other.id() != cqid
                && Self::pin_bit(other.id()) == bit
                && other.intr_enabled()
                && !other.is_empty()
        });
        if !shared {
            self.irq_status &= !bit;
        }
        self.irq_check();
    }
}

/// NVMe Controller Registers
///
/// See NVMe 1.3 Section 3.1 Register Definition
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum CtrlrReg {
    /// Reserved register.
    Reserved,

    /// Controller Capabilities (CAP)
    CtrlrCaps,
    /// Version (VS)
    Version,
    /// Interrupt Mask Set (INTMS)
    IntrMaskSet,
    /// Interrupt Mask Clear (INTMC)
    IntrMaskClear,
    /// Controller Configuration (CC)
    CtrlrCfg,
    /// Controller Status (CSTS)
    CtrlrStatus,
    /// NVM Subsystem Reset (NSSR)
    SubsysReset,
    /// Admin Queue Attributes (AQA)
    AdminQueueAttr,
    /// Admin Submission Queue Base Address (ASQ), bits 31:0
    AdminSubQAddrLo,
    /// Admin Submission Queue Base Address (ASQ), bits 63:32
    AdminSubQAddrHi,
    /// Admin Completion Queue Base Address (ACQ), bits 31:0
    AdminCompQAddrLo,
    /// Admin Completion Queue Base Address (ACQ), bits 63:32
    AdminCompQAddrHi,
    /// Controller Memory Buffer Location (CMBLOC)
    CmbLoc,
    /// Controller Memory Buffer Size (CMBSZ)
    CmbSz,
}

lazy_static! {
    static ref CONTROLLER_REGS: RegMap<CtrlrReg> = {
        let layout = [
            (CtrlrReg::CtrlrCaps, 8),
            (CtrlrReg::Version, 4),
            (CtrlrReg::IntrMaskSet, 4),
            (CtrlrReg::IntrMaskClear, 4),
            (CtrlrReg::CtrlrCfg, 4),
            (CtrlrReg::Reserved, 4),
            (CtrlrReg::CtrlrStatus, 4),
            (CtrlrReg::SubsysReset, 4),
            (CtrlrReg::AdminQueueAttr, 4),
            (CtrlrReg::AdminSubQAddrLo, 4),
            (CtrlrReg::AdminSubQAddrHi, 4),
            (CtrlrReg::AdminCompQAddrLo, 4),
            (CtrlrReg::AdminCompQAddrHi, 4),
            (CtrlrReg::CmbLoc, 4),
            (CtrlrReg::CmbSz, 4),
            (CtrlrReg::Reserved, 0xfc0),
        ];

        RegMap::create_packed(DOORBELL_BASE, &layout, |id| match id {
            CtrlrReg::Reserved => Flags::PASSTHRU,
            // Set/clear semantics: bytes outside a narrow write are zero
            // rather than the current value.
            CtrlrReg::IntrMaskSet
            | CtrlrReg::IntrMaskClear
            | CtrlrReg::SubsysReset => Flags::NO_READ_MOD_WRITE,
            _ => Flags::DEFAULT,
        })
    };
}
