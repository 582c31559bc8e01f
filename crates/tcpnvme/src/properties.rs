//! Controller properties
//!
//! Fabrics controllers have no BAR. The host reads and writes CAP, VS, CC
//! and CSTS with Property Get/Set capsules instead, and each queue keeps its
//! own copy of the registers.
//!
//! Only CC is writable. After every write to a known offset CSTS is derived
//! again from the stored CC: `CSTS.RDY = CC.EN`, and `CSTS.SHST` reports
//! shutdown complete while `CC.SHN` is non-zero.

use tracing::{debug, trace};

use crate::command::{CommandOutcome, CommandResult, FabricsType, NvmeCommand};
use crate::error::NvmeStatus;

/// NVMe version reported in VS and Identify Controller (1.4.0)
pub const NVME_VERSION: u32 = 0x0001_0400;

/// Fabrics Property Get/Set offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PropertyOffset {
    /// Controller Capabilities (8 bytes)
    Cap = 0x00,
    /// Version (4 bytes)
    Vs = 0x08,
    /// Controller Configuration (4 bytes)
    Cc = 0x14,
    /// Controller Status (4 bytes)
    Csts = 0x1C,
}

impl PropertyOffset {
    /// Create from raw offset
    pub fn from_raw(value: u32) -> Option<Self> {
        match value {
            0x00 => Some(Self::Cap),
            0x08 => Some(Self::Vs),
            0x14 => Some(Self::Cc),
            0x1C => Some(Self::Csts),
            _ => None,
        }
    }
}

/// Controller Capabilities Register (CAP)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControllerCapabilities {
    /// Maximum Queue Entries Supported (0-15), 0-based
    pub mqes: u16,
    /// Contiguous Queues Required (16)
    pub cqr: bool,
    /// Timeout (24-31) in 500ms units
    pub to: u8,
    /// Command Sets Supported (37-44)
    pub css: u8,
}

impl ControllerCapabilities {
    /// Capabilities for a queue of `queue_depth` entries
    pub fn for_queue_depth(queue_depth: u16) -> Self {
        Self {
            mqes: queue_depth.saturating_sub(1),
            cqr: true,
            to: 4,
            css: 0x01,
        }
    }

    /// Convert to 64-bit register value
    pub fn to_u64(&self) -> u64 {
        let mut val: u64 = 0;
        val |= u64::from(self.mqes);
        val |= u64::from(self.cqr) << 16;
        val |= u64::from(self.to) << 24;
        val |= u64::from(self.css) << 37;
        val
    }
}

/// Controller Configuration Register (CC)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ControllerConfiguration {
    /// Enable (0)
    pub en: bool,
    /// I/O Command Set Selected (4-6)
    pub css: u8,
    /// Memory Page Size (7-10)
    pub mps: u8,
    /// Arbitration Mechanism Selected (11-13)
    pub ams: u8,
    /// Shutdown Notification (14-15)
    pub shn: u8,
    /// I/O Submission Queue Entry Size (16-19)
    pub iosqes: u8,
    /// I/O Completion Queue Entry Size (20-23)
    pub iocqes: u8,
}

impl ControllerConfiguration {
    /// Parse from 32-bit register value
    pub fn from_u32(val: u32) -> Self {
        Self {
            en: (val & 0x01) != 0,
            css: ((val >> 4) & 0x07) as u8,
            mps: ((val >> 7) & 0x0F) as u8,
            ams: ((val >> 11) & 0x07) as u8,
            shn: ((val >> 14) & 0x03) as u8,
            iosqes: ((val >> 16) & 0x0F) as u8,
            iocqes: ((val >> 20) & 0x0F) as u8,
        }
    }

    /// Convert to 32-bit register value
    pub fn to_u32(&self) -> u32 {
        let mut val: u32 = 0;
        val |= u32::from(self.en);
        val |= (u32::from(self.css) & 0x07) << 4;
        val |= (u32::from(self.mps) & 0x0F) << 7;
        val |= (u32::from(self.ams) & 0x07) << 11;
        val |= (u32::from(self.shn) & 0x03) << 14;
        val |= (u32::from(self.iosqes) & 0x0F) << 16;
        val |= (u32::from(self.iocqes) & 0x0F) << 20;
        val
    }

    /// CC the Linux host writes to enable a controller (64-byte SQE,
    /// 16-byte CQE, EN=1)
    pub fn enabled() -> Self {
        Self {
            en: true,
            iosqes: 6,
            iocqes: 4,
            ..Self::default()
        }
    }
}

/// Shutdown Status values for CSTS.SHST
pub mod shst {
    /// Normal operation
    pub const NORMAL: u8 = 0b00;
    /// Shutdown processing complete
    pub const COMPLETE: u8 = 0b10;
}

/// Controller Status Register (CSTS)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ControllerStatus {
    /// Ready (0)
    pub rdy: bool,
    /// Controller Fatal Status (1)
    pub cfs: bool,
    /// Shutdown Status (2-3)
    pub shst: u8,
}

impl ControllerStatus {
    /// Parse from 32-bit register value
    pub fn from_u32(val: u32) -> Self {
        Self {
            rdy: (val & 0x01) != 0,
            cfs: (val & 0x02) != 0,
            shst: ((val >> 2) & 0x03) as u8,
        }
    }

    /// Convert to 32-bit register value
    pub fn to_u32(&self) -> u32 {
        let mut val: u32 = 0;
        val |= u32::from(self.rdy);
        val |= u32::from(self.cfs) << 1;
        val |= (u32::from(self.shst) & 0x03) << 2;
        val
    }
}

/// Per-queue controller register state
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerProperties {
    cap: ControllerCapabilities,
    vs: u32,
    cc: u32,
    csts: ControllerStatus,
}

impl ControllerProperties {
    /// Disabled controller (CC.EN=0) for a queue of `queue_depth` entries
    pub fn new(queue_depth: u16) -> Self {
        Self {
            cap: ControllerCapabilities::for_queue_depth(queue_depth),
            vs: NVME_VERSION,
            cc: 0,
            csts: ControllerStatus::default(),
        }
    }

    /// Controller that starts out enabled and ready
    pub fn enabled(queue_depth: u16) -> Self {
        let mut props = Self::new(queue_depth);
        props.cc = ControllerConfiguration::enabled().to_u32();
        props.sync_status();
        props
    }

    /// CC.EN
    pub fn is_enabled(&self) -> bool {
        self.cc & 0x01 != 0
    }

    /// Decoded CC
    pub fn configuration(&self) -> ControllerConfiguration {
        ControllerConfiguration::from_u32(self.cc)
    }

    /// Decoded CSTS
    pub fn status(&self) -> ControllerStatus {
        self.csts
    }

    /// Read a property, `None` for unknown offsets
    pub fn get(&self, offset: u32) -> Option<u64> {
        let value = match PropertyOffset::from_raw(offset)? {
            PropertyOffset::Cap => self.cap.to_u64(),
            PropertyOffset::Vs => u64::from(self.vs),
            PropertyOffset::Cc => u64::from(self.cc),
            PropertyOffset::Csts => u64::from(self.csts.to_u32()),
        };
        Some(value)
    }

    /// Write a property, `None` for unknown offsets
    ///
    /// Writes to CAP, VS and CSTS are accepted and dropped.
    pub fn set(&mut self, offset: u32, value: u64) -> Option<()> {
        if PropertyOffset::from_raw(offset)? == PropertyOffset::Cc {
            let was_enabled = self.is_enabled();
            self.cc = value as u32;
            if was_enabled != self.is_enabled() {
                debug!(enabled = self.is_enabled(), "controller enable changed");
            }
        }
        self.sync_status();
        Some(())
    }

    fn sync_status(&mut self) {
        let cc = self.configuration();
        self.csts.rdy = cc.en;
        self.csts.shst = if cc.shn != 0 {
            shst::COMPLETE
        } else {
            shst::NORMAL
        };
    }

    /// Execute a Fabrics command that arrived on an established queue
    pub fn handle_fabrics(&mut self, cmd: &NvmeCommand) -> CommandResult {
        match FabricsType::from_raw(cmd.fctype()) {
            Some(FabricsType::PropertyGet) => {
                let offset = cmd.property_offset();
                let value = self.get(offset).ok_or(NvmeStatus::InvalidField)?;
                trace!(offset, value, "property get");
                let dw1 = if cmd.property_is_8_bytes() {
                    (value >> 32) as u32
                } else {
                    0
                };
                Ok(CommandOutcome {
                    dw0: value as u32,
                    dw1,
                    data: None,
                })
            }
            Some(FabricsType::PropertySet) => {
                let offset = cmd.property_offset();
                let value = cmd.property_value();
                self.set(offset, value).ok_or(NvmeStatus::InvalidField)?;
                trace!(offset, value, "property set");
                Ok(CommandOutcome::with_dw0(value as u32))
            }
            Some(FabricsType::Connect) => Err(NvmeStatus::CommandSequenceError),
            None => Err(NvmeStatus::InvalidField),
        }
    }
}
