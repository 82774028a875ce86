// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::bits::{self, StatusCodeType, SubmissionQueueEntry};
use super::queue::{QueueCreateErr, QueueId};
use crate::block;

use thiserror::Error;

/// Errors that may be encounted during command parsing.
#[derive(Debug, Error)]
pub enum ParseErr {
    /// Encounted a fused operation which we don't currently support.
    #[error("Fused ops not supported")]
    Fused,

    /// An invalid value was specified in the FUSE bits of `CDW0`.
    #[error("reserved FUSE value specified")]
    ReservedFuse,
}

fn check_fuse(raw: &SubmissionQueueEntry) -> Result<(), ParseErr> {
    match (raw.cdw0 >> 8) & 0b11 {
        0b00 => Ok(()),               // Normal (non-fused) operation
        0b01 => Err(ParseErr::Fused), // First fused op
        0b10 => Err(ParseErr::Fused), // Second fused op
        _ => Err(ParseErr::ReservedFuse),
    }
}

/// A parsed Admin Command
#[derive(Debug)]
pub enum AdminCmd {
    /// Delete the specified I/O Submission Queue
    DeleteIOSubQ(QueueId),
    /// Create the specified I/O Submission Queue
    CreateIOSubQ(CreateIOSQCmd),
    /// Get Log Page Command
    GetLogPage(GetLogPageCmd),
    /// Delete the specified I/O Completion Queue
    DeleteIOCompQ(QueueId),
    /// Create the specified I/O Completion Queue
    CreateIOCompQ(CreateIOCQCmd),
    /// Identify Command
    Identify(IdentifyCmd),
    /// Abort Command
    Abort(AbortCmd),
    /// Set Features Command
    SetFeatures(FeatureCmd),
    /// Get Features Command
    GetFeatures(FeatureCmd),
    /// Asynchronous Event Request Command
    AsyncEventReq,
    /// An unknown admin command
    Unknown(SubmissionQueueEntry),
}

impl AdminCmd {
    /// Try to parse an `AdminCmd` out of a raw Submission Entry.
    pub fn parse(raw: &SubmissionQueueEntry) -> Result<Self, ParseErr> {
        check_fuse(raw)?;
        let cmd = match raw.opcode() {
            bits::ADMIN_OPC_DELETE_IO_SQ => {
                AdminCmd::DeleteIOSubQ(raw.cdw10 as u16)
            }
            bits::ADMIN_OPC_CREATE_IO_SQ => {
                AdminCmd::CreateIOSubQ(CreateIOSQCmd {
                    prp: raw.prp1,
                    qsize: (raw.cdw10 >> 16) as u16,
                    qid: raw.cdw10 as u16,
                    cqid: (raw.cdw11 >> 16) as u16,
                    queue_prio: QueuePriority::from((raw.cdw11 >> 1) as u8),
                    phys_contig: (raw.cdw11 & 1) != 0,
                })
            }
            bits::ADMIN_OPC_GET_LOG_PAGE => {
                let numdl = u64::from(raw.cdw10 >> 16);
                let numdu = u64::from(raw.cdw11 & 0xffff);
                AdminCmd::GetLogPage(GetLogPageCmd {
                    nsid: raw.nsid,
                    lid: raw.cdw10 as u8,
                    rae: (raw.cdw10 & (1 << 15)) != 0,
                    // Convert from 0's based dword count
                    len: ((numdu << 16 | numdl) + 1) * 4,
                    offset: u64::from(raw.cdw13) << 32 | u64::from(raw.cdw12),
                    prp1: raw.prp1,
                    prp2: raw.prp2,
                })
            }
            bits::ADMIN_OPC_DELETE_IO_CQ => {
                AdminCmd::DeleteIOCompQ(raw.cdw10 as u16)
            }
            bits::ADMIN_OPC_CREATE_IO_CQ => {
                AdminCmd::CreateIOCompQ(CreateIOCQCmd {
                    prp: raw.prp1,
                    qsize: (raw.cdw10 >> 16) as u16,
                    qid: raw.cdw10 as u16,
                    intr_vector: (raw.cdw11 >> 16) as u16,
                    intr_enable: (raw.cdw11 & 0b10) != 0,
                    phys_contig: (raw.cdw11 & 0b1) != 0,
                })
            }
            bits::ADMIN_OPC_IDENTIFY => AdminCmd::Identify(IdentifyCmd {
                cns: raw.cdw10 as u8,
                nsid: raw.nsid,
                prp1: raw.prp1,
                prp2: raw.prp2,
            }),
            bits::ADMIN_OPC_ABORT => AdminCmd::Abort(AbortCmd {
                sqid: raw.cdw10 as u16,
                cid: (raw.cdw10 >> 16) as u16,
            }),
            bits::ADMIN_OPC_SET_FEATURES => {
                AdminCmd::SetFeatures(FeatureCmd::new(raw))
            }
            bits::ADMIN_OPC_GET_FEATURES => {
                AdminCmd::GetFeatures(FeatureCmd::new(raw))
            }
            bits::ADMIN_OPC_ASYNC_EVENT_REQ => AdminCmd::AsyncEventReq,
            _ => AdminCmd::Unknown(*raw),
        };
        Ok(cmd)
    }
}

/// Create I/O Completion Queue Command Parameters
#[derive(Debug)]
pub struct CreateIOCQCmd {
    /// PRP Entry 1 (PRP1)
    ///
    /// Base address of the (physically contiguous) queue in host memory.
    pub prp: u64,

    /// Queue Size (QSIZE)
    ///
    /// NOTE: This is left as the raw 0's based value from the command.
    pub qsize: u16,

    /// Queue Identifier (QID)
    pub qid: QueueId,

    /// Interrupt Vector (IV)
    ///
    /// The Interrupt Vector used to signal to the host upon pushing
    /// entries onto the Completion Queue.
    pub intr_vector: u16,

    /// Interrupts Enabled (IEN)
    pub intr_enable: bool,

    /// Physically Contiguous (PC)
    pub phys_contig: bool,
}

/// Create I/O Submission Queue Command Parameters
#[derive(Debug)]
pub struct CreateIOSQCmd {
    /// PRP Entry 1 (PRP1)
    ///
    /// Base address of the (physically contiguous) queue in host memory.
    pub prp: u64,

    /// Queue Size (QSIZE)
    ///
    /// NOTE: This is left as the raw 0's based value from the command.
    pub qsize: u16,

    /// Queue Identifier (QID)
    pub qid: QueueId,

    /// Completion Queue Identifier (CQID)
    ///
    /// The ID of the corresponding Completion Queue for this Submission Queue.
    pub cqid: QueueId,

    /// Queue Priority (QPRIO)
    ///
    /// Only meaningful under weighted round robin arbitration, which is not
    /// offered, so it is recorded and otherwise ignored.
    pub queue_prio: QueuePriority,

    /// Physically Contiguous (PC)
    pub phys_contig: bool,
}

/// Priority Levels
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum QueuePriority {
    Urgent,
    High,
    Medium,
    Low,
}

impl From<u8> for QueuePriority {
    fn from(raw: u8) -> Self {
        match raw & 0b11 {
            0b00 => QueuePriority::Urgent,
            0b01 => QueuePriority::High,
            0b10 => QueuePriority::Medium,
            _ => QueuePriority::Low,
        }
    }
}

/// Get Log Page Command Parameters
#[derive(Debug)]
pub struct GetLogPageCmd {
    /// Namespace Identifier (NSID)
    pub nsid: u32,

    /// Log Page Identifier (LID)
    pub lid: u8,

    /// Retain Asynchronous Event (RAE)
    ///
    /// When clear, reading the log acknowledges the corresponding event type.
    pub rae: bool,

    /// The number of bytes to return.
    pub len: u64,

    /// Byte offset into the log page to start returning data from.
    pub offset: u64,

    pub prp1: u64,
    pub prp2: u64,
}

impl GetLogPageCmd {
    pub fn ident(&self) -> LogPageIdent {
        LogPageIdent::from(self.lid)
    }
}

/// The type of Log pages that may be retrieved with the Get Log Page command.
#[derive(Debug, PartialEq, Eq)]
pub enum LogPageIdent {
    /// Reserved Log Page
    Reserved,
    /// Error Information Log Page
    Error,
    /// SMART / Health Information Log Page
    Smart,
    /// Firmware Slot Information Log Page
    Firmware,
    /// I/O Command Set Specific Log Page
    IOSpecifc(u8),
    /// Vendor Specific Log Page
    Vendor(u8),
}

impl From<u8> for LogPageIdent {
    fn from(ident: u8) -> Self {
        match ident {
            0 => LogPageIdent::Reserved,
            bits::LOG_ERROR_INFO => LogPageIdent::Error,
            bits::LOG_SMART_INFO => LogPageIdent::Smart,
            bits::LOG_FW_SLOT_INFO => LogPageIdent::Firmware,
            0x04..=0x7F => LogPageIdent::Reserved,
            0x80..=0xBF => LogPageIdent::IOSpecifc(ident),
            0xC0..=0xFF => LogPageIdent::Vendor(ident),
        }
    }
}

/// Identify Command Parameters
#[derive(Debug)]
pub struct IdentifyCmd {
    /// Controller or Namespace Structure (CNS)
    pub cns: u8,

    /// Namespace Identifier (NSID)
    pub nsid: u32,

    pub prp1: u64,
    pub prp2: u64,
}

/// Abort Command Parameters
#[derive(Debug)]
pub struct AbortCmd {
    /// Submission Queue on which the command to abort was issued
    pub sqid: QueueId,
    /// Command Identifier of the command to abort
    pub cid: u16,
}

/// Get/Set Features Command Parameters
#[derive(Debug)]
pub struct FeatureCmd {
    /// Feature Identifier (FID)
    pub fid: FeatureIdent,

    /// Feature-specific value (Set) or selector (Get)
    pub cdw11: u32,

    pub prp1: u64,
    pub prp2: u64,
}

impl FeatureCmd {
    fn new(raw: &SubmissionQueueEntry) -> Self {
        Self {
            fid: FeatureIdent::from((raw.cdw10, raw.cdw11)),
            cdw11: raw.cdw11,
            prp1: raw.prp1,
            prp2: raw.prp2,
        }
    }
}

/// Feature Identifiers
#[derive(Debug, PartialEq, Eq)]
pub enum FeatureIdent {
    /// Reserved or unknown feature identifier
    ///
    /// Any of the upper bits of CDW10 (Save, Select) being set also lands
    /// here, as neither saving nor selecting feature values is supported.
    Reserved,
    /// Arbitration
    Arbitration,
    /// Power Management
    PowerManagement,
    /// LBA Range Type
    LbaRangeType,
    /// Temperature Threshold
    ///
    /// Threshold for the temperature of the overall device, in Kelvin.
    TemperatureThreshold,
    /// Error Recovery
    ErrorRecovery,
    /// Volatile Write Cache
    VolatileWriteCache,
    /// Number of Queues
    ///
    /// Only allowed during initialization and cannot change between resets.
    NumberOfQueues {
        /// Number of I/O Completion Queues Requested (NCQR), 0's based
        ncqr: u16,
        /// Number of I/O Submission Queues Requested (NSQR), 0's based
        nsqr: u16,
    },
    /// Interrupt Coalescing
    InterruptCoalescing,
    /// Interrupt Vector Configuration
    InterruptVectorConfiguration,
    /// Write Atomicity Normal
    WriteAtomicity,
    /// Asynchronous Event Configuration
    AsynchronousEventConfiguration,
    /// Timestamp
    ///
    /// The value itself is transferred through the data buffer.
    Timestamp,
    /// Software Progress Marker
    SoftwareProgressMarker,
    /// Vendor specific feature.
    Vendor(u8),
}

impl From<(u32, u32)> for FeatureIdent {
    fn from((cdw10, cdw11): (u32, u32)) -> Self {
        use FeatureIdent::*;
        let Ok(id) = u8::try_from(cdw10) else {
            return Reserved;
        };
        match id {
            0 => Reserved,
            bits::FEAT_ID_ARBITRATION => Arbitration,
            bits::FEAT_ID_POWER_MGMT => PowerManagement,
            bits::FEAT_ID_LBA_RANGE_TYPE => LbaRangeType,
            bits::FEAT_ID_TEMP_THRESH => TemperatureThreshold,
            bits::FEAT_ID_ERROR_RECOVERY => ErrorRecovery,
            bits::FEAT_ID_VOLATILE_WRITE_CACHE => VolatileWriteCache,
            bits::FEAT_ID_NUM_QUEUES => NumberOfQueues {
                ncqr: (cdw11 >> 16) as u16,
                nsqr: cdw11 as u16,
            },
            bits::FEAT_ID_INTR_COALESCE => InterruptCoalescing,
            bits::FEAT_ID_INTR_VEC_CFG => InterruptVectorConfiguration,
            bits::FEAT_ID_WRITE_ATOMIC => WriteAtomicity,
            bits::FEAT_ID_ASYNC_EVENT_CFG => AsynchronousEventConfiguration,
            bits::FEAT_ID_TIMESTAMP => Timestamp,
            0x0C..=0x7F => Reserved,
            0x80 => SoftwareProgressMarker,
            0x81..=0xBF => Reserved,
            0xC0..=0xFF => Vendor(id),
        }
    }
}

/// A parsed NVM Command
#[derive(Debug)]
pub enum NvmCmd {
    /// Commit data and metadata
    Flush,
    /// Write data and metadata
    Write(RwCmd),
    /// Read data and metadata
    Read(RwCmd),
    /// Zero a range of logical blocks
    WriteZeroes(WriteZeroesCmd),
    /// An unknown NVM command
    Unknown(SubmissionQueueEntry),
}

impl NvmCmd {
    /// Try to parse an `NvmCmd` out of a raw Submission Entry.
    pub fn parse(raw: &SubmissionQueueEntry) -> Result<Self, ParseErr> {
        check_fuse(raw)?;
        let slba = u64::from(raw.cdw11) << 32 | u64::from(raw.cdw10);
        // Convert from 0's based value
        let nlb = (raw.cdw12 & 0xffff) + 1;
        let cmd = match raw.opcode() {
            bits::NVM_OPC_FLUSH => NvmCmd::Flush,
            bits::NVM_OPC_WRITE => NvmCmd::Write(RwCmd {
                slba,
                nlb,
                prp1: raw.prp1,
                prp2: raw.prp2,
            }),
            bits::NVM_OPC_READ => NvmCmd::Read(RwCmd {
                slba,
                nlb,
                prp1: raw.prp1,
                prp2: raw.prp2,
            }),
            bits::NVM_OPC_WRITE_ZEROES => {
                NvmCmd::WriteZeroes(WriteZeroesCmd { slba, nlb })
            }
            _ => NvmCmd::Unknown(*raw),
        };
        Ok(cmd)
    }
}

/// Read or Write Command Parameters
#[derive(Debug)]
pub struct RwCmd {
    /// Starting LBA (SLBA)
    pub slba: u64,

    /// Number of Logical Blocks (NLB)
    ///
    /// NOTE: This has already been converted from a 0's based value.
    pub nlb: u32,

    /// PRP Entry 1 (PRP1)
    ///
    /// The first PRP entry specifying the start of the data buffer.
    pub prp1: u64,

    /// PRP Entry 2 (PRP2)
    ///
    /// If PRP1 specifies enough space, then PRP2 is reserved. Otherwise
    /// PRP2 may either be another PRP entry or a PRP list as necessary.
    pub prp2: u64,
}

/// Write Zeroes Command Parameters
#[derive(Debug)]
pub struct WriteZeroesCmd {
    pub slba: u64,
    /// NOTE: This has already been converted from a 0's based value.
    pub nlb: u32,
}

/// A Command Completion result
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Status Code Type and Status Code, positioned as in the completion
    /// entry's status field (bit 0 is left for the phase tag)
    pub status: u16,
    /// Command Specific Result (DW0)
    pub dw0: u32,
}

impl Completion {
    /// Create a successful Completion result
    pub fn success() -> Self {
        Self {
            dw0: 0,
            status: Self::status_field(
                StatusCodeType::Generic,
                bits::STS_SUCCESS,
                0,
            ),
        }
    }

    /// Create a successful Completion result with a specific value
    pub fn success_val(cdw0: u32) -> Self {
        Self { dw0: cdw0, ..Self::success() }
    }

    /// Create an error Completion result with a specific type and status
    pub fn specific_err(sct: StatusCodeType, status: u8) -> Self {
        Self { dw0: 0, status: Self::status_field(sct, status, 0) }
    }

    /// Create a generic error Completion result with a specific status
    pub fn generic_err(status: u8) -> Self {
        // success doesn't belong in an error
        assert_ne!(status, bits::STS_SUCCESS);

        Self {
            dw0: 0,
            status: Self::status_field(StatusCodeType::Generic, status, 0),
        }
    }

    /// Create a generic error Completion result with a specific status
    /// and the do-not-retry bit set.
    pub fn generic_err_dnr(status: u8) -> Self {
        Self::generic_err(status).dnr()
    }

    /// Command-specific error with the do-not-retry bit set.
    pub fn cmd_err_dnr(status: u8) -> Self {
        Self::specific_err(StatusCodeType::CmdSpecific, status).dnr()
    }

    /// Set the do-not-retry bit.
    pub fn dnr(self) -> Self {
        Self { status: self.status | 1 << 15, ..self }
    }

    pub fn is_success(&self) -> bool {
        self.status == 0
    }

    /// Status Code (SC)
    pub fn sc(&self) -> u8 {
        (self.status >> 1) as u8
    }

    /// Status Code Type (SCT)
    pub fn sct(&self) -> u8 {
        ((self.status >> 9) & 0b111) as u8
    }

    pub fn has_dnr(&self) -> bool {
        self.status & (1 << 15) != 0
    }

    /// Helper method to combine StatusCodeType and status code
    fn status_field(sct: StatusCodeType, sc: u8, dnr: u8) -> u16 {
        (sc as u16) << 1 | ((sct as u8) as u16) << 9 | (dnr as u16) << 15
    }
}

impl From<QueueCreateErr> for Completion {
    fn from(e: QueueCreateErr) -> Self {
        match e {
            QueueCreateErr::InvalidBaseAddr => {
                Completion::generic_err_dnr(bits::STS_INVAL_FIELD)
            }
            QueueCreateErr::InvalidSize => {
                Completion::cmd_err_dnr(bits::STS_CREATE_IO_Q_INVAL_QSIZE)
            }
        }
    }
}

impl From<ParseErr> for Completion {
    fn from(_: ParseErr) -> Self {
        Completion::generic_err_dnr(bits::STS_INVAL_FIELD)
    }
}

impl From<block::Result> for Completion {
    fn from(res: block::Result) -> Completion {
        match res {
            block::Result::Success => Completion::success(),
            block::Result::Failure | block::Result::ReadOnly => {
                Completion::generic_err(bits::STS_INTERNAL_ERR)
            }
            block::Result::Canceled => {
                Completion::generic_err(bits::STS_ABORT_SQ_DEL)
            }
        }
    }
}

/// What the dispatcher should do with a command once its handler returns.
#[derive(Debug, PartialEq, Eq)]
pub enum CmdOutcome {
    /// Post the completion now.
    Complete(Completion),
    /// The command finishes later, either from a block backend callback or
    /// from an asynchronous event being delivered.
    Deferred,
}

impl From<Completion> for CmdOutcome {
    fn from(comp: Completion) -> Self {
        CmdOutcome::Complete(comp)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sqe(opc: u8, cdw10: u32, cdw11: u32) -> SubmissionQueueEntry {
        SubmissionQueueEntry {
            cdw0: u32::from(opc) | 0x1234 << 16,
            cdw10,
            cdw11,
            prp1: 0x1000,
            prp2: 0x2000,
            ..Default::default()
        }
    }

    #[test]
    fn create_queue_fields() {
        let raw = sqe(bits::ADMIN_OPC_CREATE_IO_SQ, 0x003f_0003, 0x0002_0005);
        match AdminCmd::parse(&raw).unwrap() {
            AdminCmd::CreateIOSubQ(cmd) => {
                assert_eq!(cmd.qid, 3);
                assert_eq!(cmd.qsize, 0x3f);
                assert_eq!(cmd.cqid, 2);
                assert_eq!(cmd.queue_prio, QueuePriority::Medium);
                assert!(cmd.phys_contig);
                assert_eq!(cmd.prp, 0x1000);
            }
            other => panic!("unexpected {other:?}"),
        }

        let raw = sqe(bits::ADMIN_OPC_CREATE_IO_CQ, 0x00ff_0001, 0x0004_0003);
        match AdminCmd::parse(&raw).unwrap() {
            AdminCmd::CreateIOCompQ(cmd) => {
                assert_eq!(cmd.qid, 1);
                assert_eq!(cmd.qsize, 0xff);
                assert_eq!(cmd.intr_vector, 4);
                assert!(cmd.intr_enable);
                assert!(cmd.phys_contig);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn log_page_length() {
        // NUMDL = 0x7f, RAE set, LID = SMART
        let mut raw = sqe(bits::ADMIN_OPC_GET_LOG_PAGE, 0x007f_8002, 0x1);
        raw.cdw12 = 0x200;
        raw.cdw13 = 0x1;
        match AdminCmd::parse(&raw).unwrap() {
            AdminCmd::GetLogPage(cmd) => {
                assert_eq!(cmd.ident(), LogPageIdent::Smart);
                assert!(cmd.rae);
                assert_eq!(cmd.len, ((1 << 16 | 0x7f) + 1) * 4);
                assert_eq!(cmd.offset, 1 << 32 | 0x200);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn feature_ident() {
        assert_eq!(
            FeatureIdent::from((7, 0x0003_0001)),
            FeatureIdent::NumberOfQueues { ncqr: 3, nsqr: 1 }
        );
        assert_eq!(FeatureIdent::from((0x0e, 0)), FeatureIdent::Timestamp);
        // Select bits are not supported
        assert_eq!(FeatureIdent::from((0x104, 0)), FeatureIdent::Reserved);
        assert_eq!(FeatureIdent::from((0xc1, 0)), FeatureIdent::Vendor(0xc1));
    }

    #[test]
    fn nvm_parse() {
        let mut raw = sqe(bits::NVM_OPC_READ, 0x10, 0x1);
        raw.cdw12 = 0xffff_0007;
        match NvmCmd::parse(&raw).unwrap() {
            NvmCmd::Read(cmd) => {
                assert_eq!(cmd.slba, 1 << 32 | 0x10);
                assert_eq!(cmd.nlb, 8);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            NvmCmd::parse(&sqe(0x7f, 0, 0)).unwrap(),
            NvmCmd::Unknown(_)
        ));

        let mut fused = sqe(bits::NVM_OPC_WRITE, 0, 0);
        fused.cdw0 |= 1 << 8;
        assert!(matches!(NvmCmd::parse(&fused), Err(ParseErr::Fused)));
    }

    #[test]
    fn completion_status() {
        let c = Completion::generic_err_dnr(bits::STS_INVAL_FIELD);
        assert_eq!(c.status, 0x8004);
        assert_eq!(c.sc(), bits::STS_INVAL_FIELD);
        assert!(c.has_dnr());

        let c = Completion::cmd_err_dnr(bits::STS_CREATE_IO_Q_INVAL_QID);
        assert_eq!(c.sct(), StatusCodeType::CmdSpecific as u8);
        assert_eq!(c.sc(), 1);

        assert!(Completion::success_val(5).is_success());
        assert_eq!(
            Completion::from(block::Result::Failure).sc(),
            bits::STS_INTERNAL_ERR
        );
    }
}
