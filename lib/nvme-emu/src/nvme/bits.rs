// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory formats and constants from the NVMe 1.3 base specification.

#![allow(dead_code)]

use bitstruct::bitstruct;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Submission Queue Entry (NVMe 1.3 Section 4.2)
#[derive(
    Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C, packed(1))]
pub struct SubmissionQueueEntry {
    /// Command Dword 0: CID in bits 31:16, FUSE in 9:8, opcode in 7:0
    pub cdw0: u32,
    pub nsid: u32,
    pub rsvd: u64,
    /// Metadata Pointer
    pub mptr: u64,
    /// PRP Entry 1
    pub prp1: u64,
    /// PRP Entry 2, or a pointer to a PRP list
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

impl SubmissionQueueEntry {
    /// Command Identifier, unique per submission queue
    pub fn cid(&self) -> u16 {
        (self.cdw0 >> 16) as u16
    }

    pub fn opcode(&self) -> u8 {
        self.cdw0 as u8
    }
}

/// Completion Queue Entry (NVMe 1.3 Section 4.6)
#[derive(
    Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C, packed(1))]
pub struct CompletionQueueEntry {
    /// Command-specific result
    pub dw0: u32,
    pub rsvd: u32,
    /// Submission queue head as of posting
    pub sqhd: u16,
    pub sqid: u16,
    pub cid: u16,
    /// Status Field (bits 15:1) and Phase Tag (bit 0)
    pub status_phase: u16,
}

impl CompletionQueueEntry {
    pub fn new(comp: super::cmds::Completion, cid: u16) -> Self {
        Self {
            dw0: comp.dw0,
            rsvd: 0,
            sqhd: 0,
            sqid: 0,
            cid,
            status_phase: comp.status,
        }
    }

    pub fn set_phase(&mut self, phase: bool) {
        match phase {
            true => self.status_phase |= 0b1,
            false => self.status_phase &= !0b1,
        }
    }

    pub fn phase(&self) -> bool {
        self.status_phase & 0b1 != 0
    }

    /// Status Field, shifted down out of the phase position
    pub fn status(&self) -> u16 {
        self.status_phase >> 1
    }
}

// Register bits

bitstruct! {
    /// Controller Capabilities (CAP), offset 00h
    #[derive(Clone, Copy, Debug, Default)]
    pub struct Capabilities(pub u64) {
        /// Maximum Queue Entries Supported (0's based)
        pub mqes: u16 = 0..16;

        /// Contiguous Queues Required
        pub cqr: bool = 16;

        /// Weighted Round Robin with Urgent arbitration supported
        pub ams_wrr: bool = 17;

        /// Vendor-specific arbitration supported
        pub ams_vendor: bool = 18;

        reserved1: u8 = 19..24;

        /// Worst-case ready time, in 500ms units
        pub to: u8 = 24..32;

        /// Doorbell stride, as 2^(2 + DSTRD) bytes
        pub dstrd: u8 = 32..36;

        /// NVM Subsystem Reset Supported
        pub nssrs: bool = 36;

        /// NVM command set supported
        pub css_nvm: bool = 37;

        css_reserved: u8 = 38..45;

        /// Boot Partition Support
        pub bps: bool = 45;

        reserved2: u8 = 46..48;

        /// Minimum host page size, as 2^(12 + MPSMIN)
        pub mpsmin: u8 = 48..52;

        /// Maximum host page size, as 2^(12 + MPSMAX)
        pub mpsmax: u8 = 52..56;

        reserved3: u8 = 56..64;
    }
}

bitstruct! {
    /// Controller Configuration (CC), offset 14h
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Configuration(pub u32) {
        /// Enable. A 1 -> 0 transition resets the controller.
        pub enabled: bool = 0;

        reserved1: u8 = 1..4;

        /// I/O Command Set Selected
        pub css: IOCommandSet = 4..7;

        /// Host memory page size, as 2^(12 + MPS)
        pub mps: u8 = 7..11;

        /// Arbitration Mechanism Selected
        pub ams: ArbitrationMechanism = 11..14;

        /// Shutdown Notification
        pub shn: ShutdownNotification = 14..16;

        /// I/O submission queue entry size, as 2^IOSQES
        pub iosqes: u8 = 16..20;

        /// I/O completion queue entry size, as 2^IOCQES
        pub iocqes: u8 = 20..24;

        reserved2: u8 = 24..32;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IOCommandSet {
    Nvm,
    Reserved(u8),
}

impl bitstruct::FromRaw<u8, IOCommandSet> for Configuration {
    fn from_raw(raw: u8) -> IOCommandSet {
        match raw {
            0b000 => IOCommandSet::Nvm,
            _ => IOCommandSet::Reserved(raw),
        }
    }
}

impl bitstruct::IntoRaw<u8, IOCommandSet> for Configuration {
    fn into_raw(target: IOCommandSet) -> u8 {
        match target {
            IOCommandSet::Nvm => 0b000,
            IOCommandSet::Reserved(raw) => raw,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArbitrationMechanism {
    RoundRobin,
    WeightedRoundRobinWithUrgent,
    Reserved(u8),
    Vendor,
}

impl bitstruct::FromRaw<u8, ArbitrationMechanism> for Configuration {
    fn from_raw(raw: u8) -> ArbitrationMechanism {
        match raw {
            0b000 => ArbitrationMechanism::RoundRobin,
            0b001 => ArbitrationMechanism::WeightedRoundRobinWithUrgent,
            0b111 => ArbitrationMechanism::Vendor,
            _ => ArbitrationMechanism::Reserved(raw),
        }
    }
}

impl bitstruct::IntoRaw<u8, ArbitrationMechanism> for Configuration {
    fn into_raw(target: ArbitrationMechanism) -> u8 {
        match target {
            ArbitrationMechanism::RoundRobin => 0b000,
            ArbitrationMechanism::WeightedRoundRobinWithUrgent => 0b001,
            ArbitrationMechanism::Reserved(raw) => raw,
            ArbitrationMechanism::Vendor => 0b111,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShutdownNotification {
    None,
    Normal,
    Abrupt,
    Reserved,
}

impl bitstruct::FromRaw<u8, ShutdownNotification> for Configuration {
    fn from_raw(raw: u8) -> ShutdownNotification {
        match raw & 0b11 {
            0b00 => ShutdownNotification::None,
            0b01 => ShutdownNotification::Normal,
            0b10 => ShutdownNotification::Abrupt,
            _ => ShutdownNotification::Reserved,
        }
    }
}

impl bitstruct::IntoRaw<u8, ShutdownNotification> for Configuration {
    fn into_raw(target: ShutdownNotification) -> u8 {
        match target {
            ShutdownNotification::None => 0b00,
            ShutdownNotification::Normal => 0b01,
            ShutdownNotification::Abrupt => 0b10,
            ShutdownNotification::Reserved => 0b11,
        }
    }
}

bitstruct! {
    /// Controller Status (CSTS), offset 1Ch
    #[derive(Clone, Copy, Debug, Default)]
    pub struct Status(pub u32) {
        /// Ready
        pub ready: bool = 0;

        /// Controller Fatal Status
        pub cfs: bool = 1;

        /// Shutdown Status
        pub shst: ShutdownStatus = 2..4;

        /// NVM Subsystem Reset Occurred
        pub nssro: bool = 4;

        reserved: u32 = 5..32;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShutdownStatus {
    Normal,
    Processing,
    Complete,
    Reserved,
}

impl bitstruct::FromRaw<u8, ShutdownStatus> for Status {
    fn from_raw(raw: u8) -> ShutdownStatus {
        match raw & 0b11 {
            0b00 => ShutdownStatus::Normal,
            0b01 => ShutdownStatus::Processing,
            0b10 => ShutdownStatus::Complete,
            _ => ShutdownStatus::Reserved,
        }
    }
}

impl bitstruct::IntoRaw<u8, ShutdownStatus> for Status {
    fn into_raw(target: ShutdownStatus) -> u8 {
        match target {
            ShutdownStatus::Normal => 0b00,
            ShutdownStatus::Processing => 0b01,
            ShutdownStatus::Complete => 0b10,
            ShutdownStatus::Reserved => 0b11,
        }
    }
}

bitstruct! {
    /// Admin Queue Attributes (AQA), offset 24h
    #[derive(Clone, Copy, Debug, Default)]
    pub struct AdminQueueAttrs(pub u32) {
        /// Admin submission queue size (0's based)
        pub asqs: u16 = 0..12;

        reserved1: u8 = 12..16;

        /// Admin completion queue size (0's based)
        pub acqs: u16 = 16..28;

        reserved2: u8 = 28..32;
    }
}

bitstruct! {
    /// Controller Memory Buffer Location (CMBLOC), offset 38h
    #[derive(Clone, Copy, Debug, Default)]
    pub struct CmbLocation(pub u32) {
        /// Base Indicator Register: the BAR holding the buffer
        pub bir: u8 = 0..3;

        reserved: u16 = 3..12;

        /// Offset within the BAR, in CMBSZ.SZU units
        pub ofst: u32 = 12..32;
    }
}

bitstruct! {
    /// Controller Memory Buffer Size (CMBSZ), offset 3Ch
    #[derive(Clone, Copy, Debug, Default)]
    pub struct CmbSize(pub u32) {
        /// Submission queues may reside in the buffer
        pub sqs: bool = 0;
        /// Completion queues may reside in the buffer
        pub cqs: bool = 1;
        /// PRP lists may reside in the buffer
        pub lists: bool = 2;
        /// Read data may reside in the buffer
        pub rds: bool = 3;
        /// Write data may reside in the buffer
        pub wds: bool = 4;

        reserved: u8 = 5..8;

        /// Size unit, as 4KiB * 16^SZU
        pub szu: u8 = 8..12;

        /// Size, in SZU units
        pub sz: u32 = 12..32;
    }
}
impl CmbSize {
    /// Size of the buffer in bytes
    pub fn size_bytes(&self) -> u64 {
        let unit = 1u64 << (12 + 4 * u32::from(self.szu()));
        unit * u64::from(self.sz())
    }
}

bitstruct! {
    /// Value exchanged through the Timestamp feature (NVMe 1.3 Section
    /// 5.21.1.14)
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Timestamp(pub u64) {
        /// Milliseconds since midnight, 01-Jan-1970 UTC
        pub timestamp: u64 = 0..48;

        /// The controller may have stopped counting (e.g. while powered off)
        pub sync: bool = 48;

        /// 0: reset to zero at controller reset; 1: set by the host
        pub origin: u8 = 49..52;

        reserved: u16 = 52..64;
    }
}

/// Controller Version NVM Express 1.3.0
pub const NVME_VER_1_3: u32 = 0x0001_0300;

/// Value for NSSR which requests an NVM subsystem reset ("NVMe")
pub const NSSR_RESET_MAGIC: u32 = 0x4E56_4D65;

// Admin Command Opcodes (NVMe 1.3 Figure 41)

pub const ADMIN_OPC_DELETE_IO_SQ: u8 = 0x00;
pub const ADMIN_OPC_CREATE_IO_SQ: u8 = 0x01;
pub const ADMIN_OPC_GET_LOG_PAGE: u8 = 0x02;
pub const ADMIN_OPC_DELETE_IO_CQ: u8 = 0x04;
pub const ADMIN_OPC_CREATE_IO_CQ: u8 = 0x05;
pub const ADMIN_OPC_IDENTIFY: u8 = 0x06;
pub const ADMIN_OPC_ABORT: u8 = 0x08;
pub const ADMIN_OPC_SET_FEATURES: u8 = 0x09;
pub const ADMIN_OPC_GET_FEATURES: u8 = 0x0A;
pub const ADMIN_OPC_ASYNC_EVENT_REQ: u8 = 0x0C;

// NVM Command Opcodes (NVMe 1.3 Figure 188)

pub const NVM_OPC_FLUSH: u8 = 0x00;
pub const NVM_OPC_WRITE: u8 = 0x01;
pub const NVM_OPC_READ: u8 = 0x02;
pub const NVM_OPC_WRITE_ZEROES: u8 = 0x08;

/// Opcode written over a submission queue entry which has been aborted
pub const OPC_ABORTED: u8 = 0xff;

// Generic Command Status values (NVMe 1.3 Figure 31)

/// Successful Completion
pub const STS_SUCCESS: u8 = 0x0;

/// Invalid Command Opcode
pub const STS_INVAL_OPC: u8 = 0x1;

/// Invalid Field in Command
pub const STS_INVAL_FIELD: u8 = 0x2;

/// Data Transfer Error
///
/// Transferring the data or metadata associated with a command had an error.
pub const STS_DATA_XFER_ERR: u8 = 0x4;

/// Internal Device Error
///
/// The command was not completed successfully due to an internal device error.
pub const STS_INTERNAL_ERR: u8 = 0x6;

/// Command Abort Requested
pub const STS_ABORT_REQ: u8 = 0x7;

/// Command Aborted due to SQ Deletion
pub const STS_ABORT_SQ_DEL: u8 = 0x8;

/// Invalid Namespace or Format
pub const STS_INVALID_NS: u8 = 0xB;

/// Command Sequence Error
pub const STS_COMMAND_SEQ_ERR: u8 = 0xC;

/// LBA Out of Range (NVM command set)
pub const STS_LBA_RANGE: u8 = 0x80;

// Command Specific Status values (NVMe 1.3 Figure 33)

/// Completion Queue Invalid
pub const STS_CREATE_IO_Q_INVAL_CQ: u8 = 0x0;

/// Invalid Queue Identifier (Queue Creation)
pub const STS_CREATE_IO_Q_INVAL_QID: u8 = 0x1;

/// Invalid Queue Size (Queue Creation)
pub const STS_CREATE_IO_Q_INVAL_QSIZE: u8 = 0x2;

/// Asynchronous Event Request Limit Exceeded
pub const STS_AER_LIMIT_EXCEEDED: u8 = 0x5;

/// Invalid Interrupt Vector (Queue Creation)
pub const STS_CREATE_IO_Q_INVAL_INT_VEC: u8 = 0x8;

/// Invalid Log Page
pub const STS_INVALID_LOG_PAGE: u8 = 0x9;

/// Invalid Queue Identifier (Queue Deletion)
pub const STS_DELETE_IO_Q_INVAL_QID: u8 = 0x1;

/// Invalid Queue Deletion
pub const STS_DELETE_IO_Q_INVAL_Q_DELETION: u8 = 0xC;

/// Feature Identifier Not Saveable
pub const STS_FEAT_ID_NOT_SAVEABLE: u8 = 0xD;

/// Feature Not Changeable
pub const STS_FEAT_NOT_CHANGEABLE: u8 = 0xE;

// Feature identifiers (NVMe 1.3 Figure 111)

pub const FEAT_ID_ARBITRATION: u8 = 0x01;
pub const FEAT_ID_POWER_MGMT: u8 = 0x02;
pub const FEAT_ID_LBA_RANGE_TYPE: u8 = 0x03;
pub const FEAT_ID_TEMP_THRESH: u8 = 0x04;
pub const FEAT_ID_ERROR_RECOVERY: u8 = 0x05;
pub const FEAT_ID_VOLATILE_WRITE_CACHE: u8 = 0x06;
pub const FEAT_ID_NUM_QUEUES: u8 = 0x07;
pub const FEAT_ID_INTR_COALESCE: u8 = 0x08;
pub const FEAT_ID_INTR_VEC_CFG: u8 = 0x09;
pub const FEAT_ID_WRITE_ATOMIC: u8 = 0x0A;
pub const FEAT_ID_ASYNC_EVENT_CFG: u8 = 0x0B;
pub const FEAT_ID_TIMESTAMP: u8 = 0x0E;

// Identify CNS values (NVMe 1.3 Figure 109)

/// Identify Namespace data structure for the given NSID
pub const IDENT_CNS_NAMESPACE: u8 = 0x0;
/// Identify Controller data structure
pub const IDENT_CNS_CONTROLLER: u8 = 0x1;
/// Active Namespace ID list
pub const IDENT_CNS_ACTIVE_NS_LIST: u8 = 0x2;
/// Namespace Identification Descriptor list
pub const IDENT_CNS_NS_DESCRIPTORS: u8 = 0x3;

/// Namespace Identifier Type for a 128-bit UUID descriptor
pub const NIDT_UUID: u8 = 0x3;
/// Length of a UUID namespace descriptor
pub const NIDL_UUID: u8 = 0x10;

// Log page identifiers (NVMe 1.3 Figure 91)

pub const LOG_ERROR_INFO: u8 = 0x01;
pub const LOG_SMART_INFO: u8 = 0x02;
pub const LOG_FW_SLOT_INFO: u8 = 0x03;

// Asynchronous event types and information (NVMe 1.3 Figures 44-47)

pub const AER_TYPE_ERROR: u8 = 0;
pub const AER_TYPE_SMART: u8 = 1;
pub const AER_TYPE_IO_SPECIFIC: u8 = 6;
pub const AER_TYPE_VENDOR_SPECIFIC: u8 = 7;

pub const AER_INFO_ERR_INVALID_DB_REGISTER: u8 = 0;
pub const AER_INFO_ERR_INVALID_DB_VALUE: u8 = 1;
pub const AER_INFO_SMART_TEMP_THRESH: u8 = 1;

/// SMART critical warning: temperature threshold crossed
pub const SMART_WARN_TEMPERATURE: u8 = 1 << 1;

/// Optional NVM command support: Write Zeroes
pub const ONCS_WRITE_ZEROES: u16 = 1 << 3;
/// Optional NVM command support: Timestamp feature
pub const ONCS_TIMESTAMP: u16 = 1 << 6;

/// The type of value specified in the Status Field (SF) of a command
/// completion.
#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum StatusCodeType {
    Generic = 0,
    CmdSpecific = 1,
    MediaDataIntegrity = 2,
    VendorSpecific = 7,
}

/// Power State Descriptor (NVMe 1.3 Figure 113)
#[derive(
    Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C, packed(1))]
pub struct PowerStateDescriptor {
    /// Maximum power, in 0.01W units
    pub mp: u16,
    pub _resv1: u8,
    /// Max Power Scale and Non-Operational State flags
    pub flags: u8,
    /// Entry latency, in microseconds
    pub enlat: u32,
    /// Exit latency, in microseconds
    pub exlat: u32,
    pub rrt: u8,
    pub rrl: u8,
    pub rwt: u8,
    pub rwl: u8,
    pub _resv2: [u8; 16],
}

/// Identify Controller data structure (NVMe 1.3 Figure 109)
#[derive(Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed(1))]
pub struct IdentifyController {
    // bytes 0-255 - Controller Capabilities and Features
    pub vid: u16,
    pub ssvid: u16,
    /// Serial Number, space padded ASCII
    pub sn: [u8; 20],
    /// Model Number, space padded ASCII
    pub mn: [u8; 40],
    /// Firmware Revision, space padded ASCII
    pub fr: [u8; 8],
    /// Recommended Arbitration Burst
    pub rab: u8,
    pub ieee: [u8; 3],
    pub cmic: u8,
    /// Maximum Data Transfer Size, 0 for unlimited
    pub mdts: u8,
    pub cntlid: u16,
    pub ver: u32,
    pub rtd3r: u32,
    pub rtd3e: u32,
    pub oaes: u32,
    pub ctratt: u32,
    pub _resv1: [u8; 156],

    // bytes 256-511 - Admin Command Set Attributes
    /// Optional Admin Command Support
    pub oacs: u16,
    /// Abort Command Limit (0's based)
    pub acl: u8,
    /// Asynchronous Event Request Limit (0's based)
    pub aerl: u8,
    /// Firmware Updates: slot count in bits 3:1
    pub frmw: u8,
    /// Log Page Attributes
    pub lpa: u8,
    /// Error Log Page Entries (0's based)
    pub elpe: u8,
    /// Number of Power States Supported (0's based)
    pub npss: u8,
    pub avscc: u8,
    pub apsta: u8,
    pub wctemp: u16,
    pub cctemp: u16,
    pub _resv2: [u8; 242],

    // bytes 512-2047 - NVM Command Set Attributes
    /// Submission Queue Entry Size: max in bits 7:4, required in 3:0
    pub sqes: u8,
    /// Completion Queue Entry Size: max in bits 7:4, required in 3:0
    pub cqes: u8,
    pub maxcmd: u16,
    /// Number of Namespaces
    pub nn: u32,
    /// Optional NVM Command Support
    pub oncs: u16,
    pub fuses: u16,
    pub fna: u8,
    /// Volatile Write Cache present
    pub vwc: u8,
    pub awun: u16,
    pub awupf: u16,
    pub nvscc: u8,
    pub _resv3: [u8; 237],
    /// NVM Subsystem NVMe Qualified Name, NUL padded
    pub subnqn: [u8; 256],
    pub _resv4: [u8; 1024],

    // bytes 2048-3071 - Power State Descriptors
    pub psd: [PowerStateDescriptor; 32],

    // bytes 3072-4095 - Vendor Specific
    pub vs: [u8; 1024],
}

/// LBA Format data structure (NVMe 1.3 Figure 116)
#[derive(
    Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C, packed(1))]
pub struct LbaFormat {
    /// Metadata bytes per LBA
    pub ms: u16,
    /// LBA data size, as 2^LBADS
    pub lbads: u8,
    /// Relative Performance
    pub rp: u8,
}

/// Identify Namespace data structure (NVMe 1.3 Figure 114)
#[derive(Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed(1))]
pub struct IdentifyNamespace {
    /// Namespace Size, in logical blocks
    pub nsze: u64,
    /// Namespace Capacity
    pub ncap: u64,
    /// Namespace Utilization
    pub nuse: u64,
    pub nsfeat: u8,
    /// Number of LBA formats (0's based)
    pub nlbaf: u8,
    /// Formatted LBA Size: index into `lbaf` in bits 3:0
    pub flbas: u8,
    pub mc: u8,
    pub dpc: u8,
    pub dps: u8,
    pub _resv1: [u8; 98],
    pub lbaf: [LbaFormat; 16],
    pub _resv2: [u8; 192],
    pub vs: [u8; 3712],
}

/// Error Information log entry (NVMe 1.3 Figure 93)
#[derive(
    Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C, packed(1))]
pub struct ErrorLogEntry {
    pub error_count: u64,
    pub sqid: u16,
    pub cid: u16,
    pub status_field: u16,
    pub param_error_location: u16,
    pub lba: u64,
    pub nsid: u32,
    pub vs: u8,
    pub _resv1: [u8; 3],
    pub cs: u64,
    pub _resv2: [u8; 24],
}

/// SMART / Health Information log (NVMe 1.3 Figure 94)
#[derive(Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed(1))]
pub struct SmartLog {
    pub critical_warning: u8,
    /// Composite temperature, in Kelvin
    pub temperature: u16,
    pub available_spare: u8,
    pub available_spare_threshold: u8,
    pub percentage_used: u8,
    pub _resv1: [u8; 26],
    pub data_units_read: [u64; 2],
    pub data_units_written: [u64; 2],
    pub host_read_commands: [u64; 2],
    pub host_write_commands: [u64; 2],
    pub controller_busy_time: [u64; 2],
    pub power_cycles: [u64; 2],
    pub power_on_hours: [u64; 2],
    pub unsafe_shutdowns: [u64; 2],
    pub media_errors: [u64; 2],
    pub number_of_error_log_entries: [u64; 2],
    pub _resv2: [u8; 320],
}

/// Firmware Slot Information log (NVMe 1.3 Figure 95)
#[derive(Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed(1))]
pub struct FwSlotLog {
    /// Active Firmware Info
    pub afi: u8,
    pub _resv1: [u8; 7],
    /// Firmware revisions for slots 1-7
    pub frs: [[u8; 8]; 7],
    pub _resv2: [u8; 448],
}

#[cfg(test)]
mod test {
    use super::*;
    use std::mem::size_of;
    use zerocopy::FromZeros;

    #[test]
    fn entry_sizing() {
        assert_eq!(size_of::<SubmissionQueueEntry>(), 64);
        assert_eq!(size_of::<CompletionQueueEntry>(), 16);
        assert_eq!(size_of::<PowerStateDescriptor>(), 32);
        assert_eq!(size_of::<IdentifyController>(), 4096);
        assert_eq!(size_of::<LbaFormat>(), 4);
        assert_eq!(size_of::<IdentifyNamespace>(), 4096);
        assert_eq!(size_of::<ErrorLogEntry>(), 64);
        assert_eq!(size_of::<SmartLog>(), 512);
        assert_eq!(size_of::<FwSlotLog>(), 512);
    }

    #[test]
    fn identify_layout() {
        let mut id = IdentifyController::new_zeroed();
        id.ver = 0x0001_0300;
        id.oacs = 0xaaaa;
        id.sqes = 0x66;
        id.nn = 1;
        id.vwc = 1;
        id.subnqn[0] = b'n';
        id.psd[0].mp = 0x9c4;
        id.vs[0] = 0xff;

        let raw = id.as_bytes();
        assert_eq!(&raw[80..84], &[0x00, 0x03, 0x01, 0x00]);
        assert_eq!(&raw[256..258], &[0xaa, 0xaa]);
        assert_eq!(raw[512], 0x66);
        assert_eq!(&raw[516..520], &[1, 0, 0, 0]);
        assert_eq!(raw[525], 1);
        assert_eq!(raw[768], b'n');
        assert_eq!(&raw[2048..2050], &[0xc4, 0x09]);
        assert_eq!(raw[3072], 0xff);

        let mut smart = SmartLog::new_zeroed();
        smart.temperature = 0x143;
        smart.power_on_hours[0] = 7;
        let raw = smart.as_bytes();
        assert_eq!(&raw[1..3], &[0x43, 0x01]);
        assert_eq!(raw[128], 7);
    }

    #[test]
    fn cmb_size() {
        let sz = CmbSize(0).with_szu(2).with_sz(4);
        assert_eq!(sz.size_bytes(), 4 << 20);
    }

    #[test]
    fn timestamp_fields() {
        let ts = Timestamp(0).with_timestamp(0x1234).with_origin(1);
        assert_eq!(ts.0, 0x1234 | (1 << 49));
        assert!(!ts.sync());
    }
}
