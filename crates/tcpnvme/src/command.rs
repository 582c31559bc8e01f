//! NVMe command structures
//!
//! Submission queue entries, completion queue entries and the opcode and
//! selector enums the target dispatches on.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::NvmeStatus;

/// NVMe Admin command opcodes handled by the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AdminOpcode {
    /// Get Log Page
    GetLogPage = 0x02,
    /// Identify
    Identify = 0x06,
    /// Set Features
    SetFeatures = 0x09,
    /// Keep Alive
    KeepAlive = 0x18,
    /// Fabrics command (Property Get/Set, Connect)
    Fabrics = 0x7F,
}

impl AdminOpcode {
    /// Create from raw opcode
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0x02 => Some(Self::GetLogPage),
            0x06 => Some(Self::Identify),
            0x09 => Some(Self::SetFeatures),
            0x18 => Some(Self::KeepAlive),
            0x7F => Some(Self::Fabrics),
            _ => None,
        }
    }
}

/// NVMe I/O command opcodes (NVM Command Set)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IoOpcode {
    /// Flush
    Flush = 0x00,
    /// Write
    Write = 0x01,
    /// Read
    Read = 0x02,
}

impl IoOpcode {
    /// Create from raw opcode
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Flush),
            0x01 => Some(Self::Write),
            0x02 => Some(Self::Read),
            _ => None,
        }
    }
}

/// Fabrics command types (fctype)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FabricsType {
    /// Property Set
    PropertySet = 0x00,
    /// Connect
    Connect = 0x01,
    /// Property Get
    PropertyGet = 0x04,
}

impl FabricsType {
    /// Create from raw type
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::PropertySet),
            0x01 => Some(Self::Connect),
            0x04 => Some(Self::PropertyGet),
            _ => None,
        }
    }
}

/// CNS (Controller or Namespace Structure) values for Identify command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IdentifyCns {
    /// Identify Namespace (NSID specified)
    Namespace = 0x00,
    /// Identify Controller
    Controller = 0x01,
    /// Active Namespace ID list
    ActiveNamespaceList = 0x02,
    /// Namespace Identification Descriptor list
    NamespaceIdDescriptorList = 0x03,
}

impl IdentifyCns {
    /// Create from raw value
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Namespace),
            0x01 => Some(Self::Controller),
            0x02 => Some(Self::ActiveNamespaceList),
            0x03 => Some(Self::NamespaceIdDescriptorList),
            _ => None,
        }
    }
}

/// Feature identifiers accepted by Set Features
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FeatureId {
    /// Number of Queues
    NumberOfQueues = 0x07,
    /// Asynchronous Event Configuration
    AsyncEventConfig = 0x0B,
    /// Controller reset request sent by some hosts before teardown
    ControllerReset = 0x20,
}

impl FeatureId {
    /// Create from raw value
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0x07 => Some(Self::NumberOfQueues),
            0x0B => Some(Self::AsyncEventConfig),
            0x20 => Some(Self::ControllerReset),
            _ => None,
        }
    }
}

/// Log page identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogPageId {
    /// Discovery Log Page
    Discovery = 0x70,
}

impl LogPageId {
    /// Create from raw value
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0x70 => Some(Self::Discovery),
            _ => None,
        }
    }
}

/// SGL Data Block descriptor carried in the SQE data pointer (16 bytes)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SglDescriptor {
    /// Address (offset for in-capsule data)
    pub address: u64,
    /// Length in bytes
    pub length: u32,
    /// Reserved
    pub reserved: [u8; 3],
    /// SGL descriptor type and subtype
    pub sgl_id: u8,
}

impl SglDescriptor {
    /// Size of an SGL descriptor
    pub const SIZE: usize = 16;

    /// Descriptor pointing at in-capsule data of `length` bytes
    pub fn in_capsule(length: u32) -> Self {
        Self {
            address: 0,
            length,
            reserved: [0; 3],
            // Data Block descriptor, offset subtype
            sgl_id: 0x01,
        }
    }
}

/// NVMe Submission Queue Entry (SQE) - 64 bytes
#[derive(Clone, Default, PartialEq, Eq)]
pub struct NvmeCommand {
    /// Opcode
    pub opcode: u8,
    /// Fused operation and PSDT flags
    pub flags: u8,
    /// Command Identifier
    pub cid: u16,
    /// Namespace Identifier (fctype in the low byte for Fabrics commands)
    pub nsid: u32,
    /// Reserved (CDW2)
    pub cdw2: u32,
    /// Reserved (CDW3)
    pub cdw3: u32,
    /// Metadata Pointer
    pub mptr: u64,
    /// Data Pointer (SGL1)
    pub sgl: SglDescriptor,
    /// Command Dword 10
    pub cdw10: u32,
    /// Command Dword 11
    pub cdw11: u32,
    /// Command Dword 12
    pub cdw12: u32,
    /// Command Dword 13
    pub cdw13: u32,
    /// Command Dword 14
    pub cdw14: u32,
    /// Command Dword 15
    pub cdw15: u32,
}

impl NvmeCommand {
    /// Size of an NVMe command in bytes
    pub const SIZE: usize = 64;

    /// Create a zeroed command with the given opcode and CID
    pub fn new(opcode: u8, cid: u16) -> Self {
        Self {
            opcode,
            cid,
            ..Self::default()
        }
    }

    /// Get the fabrics command type (only valid for Fabrics commands)
    pub fn fctype(&self) -> u8 {
        (self.nsid & 0xFF) as u8
    }

    /// Check if this is a fabrics command
    pub fn is_fabrics(&self) -> bool {
        self.opcode == AdminOpcode::Fabrics as u8
    }

    /// Check if this is a Fabrics Connect
    pub fn is_connect(&self) -> bool {
        self.is_fabrics() && self.fctype() == FabricsType::Connect as u8
    }

    /// Parse from bytes
    pub fn from_bytes(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }

        let opcode = buf.get_u8();
        let flags = buf.get_u8();
        let cid = buf.get_u16_le();
        let nsid = buf.get_u32_le();
        let cdw2 = buf.get_u32_le();
        let cdw3 = buf.get_u32_le();
        let mptr = buf.get_u64_le();
        let address = buf.get_u64_le();
        let length = buf.get_u32_le();
        let mut reserved = [0u8; 3];
        buf.copy_to_slice(&mut reserved);
        let sgl_id = buf.get_u8();

        Some(Self {
            opcode,
            flags,
            cid,
            nsid,
            cdw2,
            cdw3,
            mptr,
            sgl: SglDescriptor {
                address,
                length,
                reserved,
                sgl_id,
            },
            cdw10: buf.get_u32_le(),
            cdw11: buf.get_u32_le(),
            cdw12: buf.get_u32_le(),
            cdw13: buf.get_u32_le(),
            cdw14: buf.get_u32_le(),
            cdw15: buf.get_u32_le(),
        })
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u8(self.opcode);
        buf.put_u8(self.flags);
        buf.put_u16_le(self.cid);
        buf.put_u32_le(self.nsid);
        buf.put_u32_le(self.cdw2);
        buf.put_u32_le(self.cdw3);
        buf.put_u64_le(self.mptr);
        buf.put_u64_le(self.sgl.address);
        buf.put_u32_le(self.sgl.length);
        buf.put_slice(&self.sgl.reserved);
        buf.put_u8(self.sgl.sgl_id);
        buf.put_u32_le(self.cdw10);
        buf.put_u32_le(self.cdw11);
        buf.put_u32_le(self.cdw12);
        buf.put_u32_le(self.cdw13);
        buf.put_u32_le(self.cdw14);
        buf.put_u32_le(self.cdw15);
        buf.freeze()
    }

    // ======== Fabrics helpers ========

    /// Build a Fabrics command of the given type
    pub fn fabrics(fctype: FabricsType, cid: u16) -> Self {
        Self {
            nsid: fctype as u32,
            ..Self::new(AdminOpcode::Fabrics as u8, cid)
        }
    }

    /// Build a Connect command (`sqsize` is taken as-is)
    pub fn connect(cid: u16, qid: u16, sqsize: u16, kato: u32) -> Self {
        let mut cmd = Self::fabrics(FabricsType::Connect, cid);
        cmd.cdw10 = u32::from(qid) << 16;
        cmd.cdw11 = u32::from(sqsize);
        cmd.cdw12 = kato;
        cmd.sgl = SglDescriptor::in_capsule(1024);
        cmd
    }

    /// Build a Property Get command
    pub fn property_get(cid: u16, offset: u32, eight_bytes: bool) -> Self {
        let mut cmd = Self::fabrics(FabricsType::PropertyGet, cid);
        cmd.cdw10 = u32::from(eight_bytes);
        cmd.cdw11 = offset;
        cmd
    }

    /// Build a Property Set command
    pub fn property_set(cid: u16, offset: u32, value: u64) -> Self {
        let mut cmd = Self::fabrics(FabricsType::PropertySet, cid);
        cmd.cdw11 = offset;
        cmd.cdw12 = value as u32;
        cmd.cdw13 = (value >> 32) as u32;
        cmd
    }

    /// Connect record format
    pub fn connect_recfmt(&self) -> u16 {
        (self.cdw10 & 0xFFFF) as u16
    }

    /// Connect queue ID (0 is the admin queue)
    pub fn connect_qid(&self) -> u16 {
        (self.cdw10 >> 16) as u16
    }

    /// Connect submission queue size
    pub fn connect_sqsize(&self) -> u16 {
        (self.cdw11 & 0xFFFF) as u16
    }

    /// Connect keep alive timeout in milliseconds
    pub fn connect_kato(&self) -> u32 {
        self.cdw12
    }

    /// Property offset for Property Get/Set
    pub fn property_offset(&self) -> u32 {
        self.cdw11
    }

    /// Property Get requests an 8-byte value
    pub fn property_is_8_bytes(&self) -> bool {
        (self.cdw10 & 0x07) == 1
    }

    /// Property Set value
    pub fn property_value(&self) -> u64 {
        (u64::from(self.cdw13) << 32) | u64::from(self.cdw12)
    }

    // ======== Read/Write command helpers ========

    /// Get the starting LBA for read/write commands
    pub fn slba(&self) -> u64 {
        (u64::from(self.cdw11) << 32) | u64::from(self.cdw10)
    }

    /// Set the starting LBA for read/write commands
    pub fn set_slba(&mut self, lba: u64) {
        self.cdw10 = (lba & 0xFFFF_FFFF) as u32;
        self.cdw11 = (lba >> 32) as u32;
    }

    /// Get the number of logical blocks (0-based, actual count = nlb + 1)
    pub fn nlb(&self) -> u16 {
        (self.cdw12 & 0xFFFF) as u16
    }

    /// Set the number of logical blocks (0-based)
    pub fn set_nlb(&mut self, nlb: u16) {
        self.cdw12 = (self.cdw12 & !0xFFFF) | u32::from(nlb);
    }

    /// Number of logical blocks addressed
    pub fn block_count(&self) -> u32 {
        u32::from(self.nlb()) + 1
    }

    // ======== Admin command helpers ========

    /// Get the Controller or Namespace Structure (CNS) for Identify command
    pub fn identify_cns(&self) -> u8 {
        (self.cdw10 & 0xFF) as u8
    }

    /// Get the Feature Identifier (FID)
    pub fn feature_id(&self) -> u8 {
        (self.cdw10 & 0xFF) as u8
    }

    /// Get the Log Page Identifier (LID)
    pub fn log_page_id(&self) -> u8 {
        (self.cdw10 & 0xFF) as u8
    }

    /// Requested log page length in bytes, from NUMDL
    pub fn log_page_len(&self) -> usize {
        (((self.cdw10 >> 16) as usize) + 1) * 4
    }

    /// Log page offset in bytes
    pub fn log_page_offset(&self) -> u64 {
        (u64::from(self.cdw13) << 32) | u64::from(self.cdw12)
    }
}

impl fmt::Debug for NvmeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NvmeCommand")
            .field("opcode", &format_args!("{:#04x}", self.opcode))
            .field("cid", &self.cid)
            .field("nsid", &self.nsid)
            .field("cdw10", &format_args!("{:#010x}", self.cdw10))
            .field("cdw11", &format_args!("{:#010x}", self.cdw11))
            .field("cdw12", &format_args!("{:#010x}", self.cdw12))
            .finish()
    }
}

/// NVMe Completion Queue Entry (CQE) - 16 bytes
#[derive(Clone, Default, PartialEq, Eq)]
pub struct NvmeCompletion {
    /// Command-specific result (DW0)
    pub dw0: u32,
    /// Command-specific result (DW1)
    pub dw1: u32,
    /// SQ Head Pointer
    pub sq_head: u16,
    /// SQ Identifier
    pub sq_id: u16,
    /// Command Identifier
    pub cid: u16,
    /// Status Field
    pub status: u16,
}

impl NvmeCompletion {
    /// Size of an NVMe completion in bytes
    pub const SIZE: usize = 16;

    /// Create a zeroed (successful) completion
    pub fn new(cid: u16, sq_id: u16, sq_head: u16) -> Self {
        Self {
            sq_head,
            sq_id,
            cid,
            ..Self::default()
        }
    }

    /// Set the status field from a status value
    pub fn set_status(&mut self, status: NvmeStatus) {
        self.status = status.status_field();
    }

    /// Decoded status, if it is one the target knows
    pub fn nvme_status(&self) -> Option<NvmeStatus> {
        NvmeStatus::from_status_field(self.status)
    }

    /// Check if command completed successfully
    pub fn is_success(&self) -> bool {
        self.status >> 1 == 0
    }

    /// Parse from bytes
    pub fn from_bytes(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }

        Some(Self {
            dw0: buf.get_u32_le(),
            dw1: buf.get_u32_le(),
            sq_head: buf.get_u16_le(),
            sq_id: buf.get_u16_le(),
            cid: buf.get_u16_le(),
            status: buf.get_u16_le(),
        })
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u32_le(self.dw0);
        buf.put_u32_le(self.dw1);
        buf.put_u16_le(self.sq_head);
        buf.put_u16_le(self.sq_id);
        buf.put_u16_le(self.cid);
        buf.put_u16_le(self.status);
        buf.freeze()
    }
}

impl fmt::Debug for NvmeCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NvmeCompletion")
            .field("cid", &self.cid)
            .field("sq_id", &self.sq_id)
            .field("sq_head", &self.sq_head)
            .field("status", &format_args!("{:#06x}", self.status))
            .field("dw0", &format_args!("{:#010x}", self.dw0))
            .field("dw1", &format_args!("{:#010x}", self.dw1))
            .finish()
    }
}

/// What a handler produced for a successful command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Completion DW0
    pub dw0: u32,
    /// Completion DW1
    pub dw1: u32,
    /// Data to send to the host ahead of the completion
    pub data: Option<Bytes>,
}

impl CommandOutcome {
    /// Success with no result and no data
    pub fn empty() -> Self {
        Self::default()
    }

    /// Success carrying a DW0 result
    pub fn with_dw0(dw0: u32) -> Self {
        Self {
            dw0,
            ..Self::default()
        }
    }

    /// Success carrying a data buffer
    pub fn with_data(data: Bytes) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }
}

/// Handler result: an outcome, or the status the completion reports
pub type CommandResult = Result<CommandOutcome, NvmeStatus>;
