//! Identify data structures
//!
//! Each structure serializes into a fixed 4096-byte buffer. Fields are
//! written at their NVMe Base Specification byte offsets; the `offset`
//! modules list the ones this target fills in.

use bytes::{BufMut, Bytes, BytesMut};

use crate::config::TargetConfig;
use crate::properties::NVME_VERSION;
use crate::queue::DISCOVERY_QUEUE_DEPTH;

/// Size of every Identify data structure
pub const NVME_IDENTIFY_DATA_LEN: usize = 4096;

/// Size of Identify Controller data
pub const NVME_ID_CTRL_LEN: usize = NVME_IDENTIFY_DATA_LEN;

/// Controller ID handed out by the Connect completion and Identify
pub const CONTROLLER_ID: u16 = 1;

/// Controller type reported in CNTRLTYPE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControllerType {
    /// I/O controller
    Io = 1,
    /// Discovery controller
    Discovery = 2,
    /// Administrative controller
    Administrative = 3,
}

mod ctrl_offset {
    pub const VID: usize = 0;
    pub const SSVID: usize = 2;
    pub const SN: usize = 4;
    pub const MN: usize = 24;
    pub const FR: usize = 64;
    pub const RAB: usize = 72;
    pub const IEEE: usize = 73;
    pub const CMIC: usize = 76;
    pub const MDTS: usize = 77;
    pub const CNTLID: usize = 78;
    pub const VER: usize = 80;
    pub const OAES: usize = 92;
    pub const CTRATT: usize = 96;
    pub const CNTRLTYPE: usize = 111;
    pub const OACS: usize = 256;
    pub const ACL: usize = 258;
    pub const AERL: usize = 259;
    pub const FRMW: usize = 260;
    pub const LPA: usize = 261;
    pub const ELPE: usize = 262;
    pub const NPSS: usize = 263;
    pub const KAS: usize = 320;
    pub const SQES: usize = 512;
    pub const CQES: usize = 513;
    pub const MAXCMD: usize = 514;
    pub const NN: usize = 516;
    pub const ONCS: usize = 520;
    pub const FUSES: usize = 522;
    pub const VWC: usize = 525;
    pub const SGLS: usize = 536;
    pub const MNAN: usize = 540;
    pub const SUBNQN: usize = 768;
    pub const IOCCSZ: usize = 1792;
    pub const IORCSZ: usize = 1796;
    pub const ICDOFF: usize = 1800;
    pub const FCATT: usize = 1802;
    pub const MSDBD: usize = 1803;
}

/// Identify Controller data structure (CNS 01h)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentifyController {
    /// PCI Vendor ID
    pub vid: u16,
    /// PCI Subsystem Vendor ID
    pub ssvid: u16,
    /// Serial Number (20 bytes, ASCII, space padded)
    pub sn: String,
    /// Model Number (40 bytes, ASCII, space padded)
    pub mn: String,
    /// Firmware Revision (8 bytes, ASCII, space padded)
    pub fr: String,
    /// Recommended Arbitration Burst
    pub rab: u8,
    /// IEEE OUI Identifier
    pub ieee: [u8; 3],
    /// Controller Multi-Path I/O and Namespace Sharing
    pub cmic: u8,
    /// Maximum Data Transfer Size (power of two, in minimum page units)
    pub mdts: u8,
    /// Controller ID
    pub cntlid: u16,
    /// Version
    pub ver: u32,
    /// Optional Async Events Supported
    pub oaes: u32,
    /// Controller Attributes
    pub ctratt: u32,
    /// Controller Type
    pub cntrltype: ControllerType,
    /// Optional Admin Command Support
    pub oacs: u16,
    /// Abort Command Limit
    pub acl: u8,
    /// Asynchronous Event Request Limit
    pub aerl: u8,
    /// Firmware Updates
    pub frmw: u8,
    /// Log Page Attributes
    pub lpa: u8,
    /// Error Log Page Entries
    pub elpe: u8,
    /// Number of Power States Support
    pub npss: u8,
    /// Keep Alive Support (100ms units)
    pub kas: u16,
    /// Submission Queue Entry Size
    pub sqes: u8,
    /// Completion Queue Entry Size
    pub cqes: u8,
    /// Maximum Outstanding Commands
    pub maxcmd: u16,
    /// Number of Namespaces
    pub nn: u32,
    /// Optional NVM Command Support
    pub oncs: u16,
    /// Fused Operation Support
    pub fuses: u16,
    /// Volatile Write Cache
    pub vwc: u8,
    /// SGL Support
    pub sgls: u32,
    /// Maximum Number of Allowed Namespaces
    pub mnan: u32,
    /// NVM Subsystem NQN
    pub subnqn: String,
    /// I/O Queue Command Capsule Supported Size (16-byte units)
    pub ioccsz: u32,
    /// I/O Queue Response Capsule Supported Size (16-byte units)
    pub iorcsz: u32,
    /// In Capsule Data Offset (16-byte units)
    pub icdoff: u16,
    /// Fabrics Controller Attributes
    pub fcatt: u8,
    /// Maximum SGL Data Block Descriptors
    pub msdbd: u8,
}

impl IdentifyController {
    /// Size of Identify Controller data
    pub const SIZE: usize = NVME_ID_CTRL_LEN;

    /// MDTS advertised by the target: 2^1 pages of 4 KiB
    pub const MDTS: u8 = 1;

    /// Largest transfer allowed by MDTS, in bytes
    pub const MAX_TRANSFER: u32 = 4096 << Self::MDTS;

    fn base(cntrltype: ControllerType, subnqn: &str, maxcmd: u16) -> Self {
        Self {
            vid: 0,
            ssvid: 0,
            sn: String::new(),
            mn: String::new(),
            fr: String::new(),
            rab: 0,
            ieee: [0; 3],
            cmic: 0,
            mdts: Self::MDTS,
            cntlid: CONTROLLER_ID,
            ver: NVME_VERSION,
            oaes: 0,
            ctratt: 0,
            cntrltype,
            oacs: 0,
            acl: 0,
            aerl: 0,
            frmw: 0,
            lpa: 0,
            elpe: 0,
            npss: 0,
            kas: 0,
            sqes: 0,
            cqes: 0,
            maxcmd,
            nn: 0,
            oncs: 0,
            fuses: 0,
            vwc: 0,
            sgls: 0,
            mnan: 0,
            subnqn: subnqn.to_string(),
            ioccsz: 0,
            iorcsz: 0,
            icdoff: 0,
            fcatt: 0,
            msdbd: 0,
        }
    }

    /// Identify data for the NVM subsystem's admin controller
    pub fn io_controller(config: &TargetConfig) -> Self {
        let mut ctrl = Self::base(
            ControllerType::Io,
            &config.subsystem_nqn,
            config.max_queue_depth,
        );
        ctrl.sn = config.controller.serial.clone();
        ctrl.mn = config.controller.model.clone();
        ctrl.fr = config.controller.firmware.clone();
        ctrl.nn = 1;
        ctrl.kas = config.controller.keep_alive_granularity;
        ctrl.sqes = 0x66;
        ctrl.cqes = 0x44;
        ctrl.sgls = 0x0000_0001;
        // A whole MDTS-sized transfer fits in-capsule after the 64-byte SQE
        ctrl.ioccsz = (64 + Self::MAX_TRANSFER) / 16;
        ctrl.iorcsz = 1;
        ctrl.msdbd = 1;
        ctrl
    }

    /// Identify data for the discovery controller
    pub fn discovery_controller(config: &TargetConfig) -> Self {
        let mut ctrl = Self::base(
            ControllerType::Discovery,
            &config.discovery_nqn,
            DISCOVERY_QUEUE_DEPTH,
        );
        ctrl.fr = config.controller.firmware.clone();
        ctrl.lpa = 0x04;
        ctrl.sgls = 0x0000_0001;
        ctrl
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Bytes {
        use ctrl_offset::*;

        let mut buf = BytesMut::zeroed(Self::SIZE);
        put_u16(&mut buf, VID, self.vid);
        put_u16(&mut buf, SSVID, self.ssvid);
        put_padded(&mut buf, SN, 20, &self.sn, b' ');
        put_padded(&mut buf, MN, 40, &self.mn, b' ');
        put_padded(&mut buf, FR, 8, &self.fr, b' ');
        buf[RAB] = self.rab;
        buf[IEEE..IEEE + 3].copy_from_slice(&self.ieee);
        buf[CMIC] = self.cmic;
        buf[MDTS] = self.mdts;
        put_u16(&mut buf, CNTLID, self.cntlid);
        put_u32(&mut buf, VER, self.ver);
        put_u32(&mut buf, OAES, self.oaes);
        put_u32(&mut buf, CTRATT, self.ctratt);
        buf[CNTRLTYPE] = self.cntrltype as u8;
        put_u16(&mut buf, OACS, self.oacs);
        buf[ACL] = self.acl;
        buf[AERL] = self.aerl;
        buf[FRMW] = self.frmw;
        buf[LPA] = self.lpa;
        buf[ELPE] = self.elpe;
        buf[NPSS] = self.npss;
        put_u16(&mut buf, KAS, self.kas);
        buf[SQES] = self.sqes;
        buf[CQES] = self.cqes;
        put_u16(&mut buf, MAXCMD, self.maxcmd);
        put_u32(&mut buf, NN, self.nn);
        put_u16(&mut buf, ONCS, self.oncs);
        put_u16(&mut buf, FUSES, self.fuses);
        buf[VWC] = self.vwc;
        put_u32(&mut buf, SGLS, self.sgls);
        put_u32(&mut buf, MNAN, self.mnan);
        put_padded(&mut buf, SUBNQN, 256, &self.subnqn, 0);
        put_u32(&mut buf, IOCCSZ, self.ioccsz);
        put_u32(&mut buf, IORCSZ, self.iorcsz);
        put_u16(&mut buf, ICDOFF, self.icdoff);
        buf[FCATT] = self.fcatt;
        buf[MSDBD] = self.msdbd;
        buf.freeze()
    }
}

mod ns_offset {
    pub const NSZE: usize = 0;
    pub const NCAP: usize = 8;
    pub const NUSE: usize = 16;
    pub const NSFEAT: usize = 24;
    pub const NLBAF: usize = 25;
    pub const FLBAS: usize = 26;
    pub const DLFEAT: usize = 33;
    pub const NGUID: usize = 104;
    pub const EUI64: usize = 120;
    pub const LBAF0: usize = 128;
}

/// Identify Namespace data structure (CNS 00h)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentifyNamespace {
    /// Namespace Size (blocks)
    pub nsze: u64,
    /// Namespace Capacity (blocks)
    pub ncap: u64,
    /// Namespace Utilization (blocks)
    pub nuse: u64,
    /// Namespace Features
    pub nsfeat: u8,
    /// Number of LBA Formats (0-based)
    pub nlbaf: u8,
    /// Formatted LBA Size
    pub flbas: u8,
    /// Deallocate Logical Block Features
    pub dlfeat: u8,
    /// Namespace Globally Unique Identifier
    pub nguid: [u8; 16],
    /// IEEE Extended Unique Identifier
    pub eui64: [u8; 8],
    /// LBA Format 0: metadata size
    pub lbaf0_ms: u16,
    /// LBA Format 0: LBA data size (log2)
    pub lbaf0_lbads: u8,
    /// LBA Format 0: relative performance
    pub lbaf0_rp: u8,
}

impl IdentifyNamespace {
    /// Size of Identify Namespace data
    pub const SIZE: usize = NVME_IDENTIFY_DATA_LEN;

    /// Create a new namespace identity with given size
    pub fn new(size_bytes: u64, block_size: u32) -> Self {
        let num_blocks = size_bytes / u64::from(block_size);

        Self {
            nsze: num_blocks,
            ncap: num_blocks,
            nuse: num_blocks,
            nsfeat: 0,
            nlbaf: 0,
            flbas: 0,
            dlfeat: 0,
            nguid: [0; 16],
            eui64: [0; 8],
            lbaf0_ms: 0,
            lbaf0_lbads: block_size.trailing_zeros() as u8,
            lbaf0_rp: 0,
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Bytes {
        use ns_offset::*;

        let mut buf = BytesMut::zeroed(Self::SIZE);
        put_u64(&mut buf, NSZE, self.nsze);
        put_u64(&mut buf, NCAP, self.ncap);
        put_u64(&mut buf, NUSE, self.nuse);
        buf[NSFEAT] = self.nsfeat;
        buf[NLBAF] = self.nlbaf;
        buf[FLBAS] = self.flbas;
        buf[DLFEAT] = self.dlfeat;
        buf[NGUID..NGUID + 16].copy_from_slice(&self.nguid);
        buf[EUI64..EUI64 + 8].copy_from_slice(&self.eui64);
        put_u16(&mut buf, LBAF0, self.lbaf0_ms);
        buf[LBAF0 + 2] = self.lbaf0_lbads;
        buf[LBAF0 + 3] = self.lbaf0_rp & 0x03;
        buf.freeze()
    }
}

/// Active Namespace ID list (CNS 02h)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActiveNamespaceList {
    /// Namespace IDs in increasing order
    pub nsids: Vec<u32>,
}

impl ActiveNamespaceList {
    /// Maximum number of entries
    pub const MAX_ENTRIES: usize = NVME_IDENTIFY_DATA_LEN / 4;

    /// Active namespaces strictly greater than `start`, out of `active`
    pub fn after(start: u32, active: &[u32]) -> Self {
        let mut nsids: Vec<u32> = active.iter().copied().filter(|&id| id > start).collect();
        nsids.sort_unstable();
        nsids.truncate(Self::MAX_ENTRIES);
        Self { nsids }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(NVME_IDENTIFY_DATA_LEN);
        for nsid in &self.nsids {
            buf.put_u32_le(*nsid);
        }
        buf.resize(NVME_IDENTIFY_DATA_LEN, 0);
        buf.freeze()
    }
}

/// Namespace Identifier Type for descriptor lists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NamespaceIdType {
    /// IEEE Extended Unique Identifier (8 bytes)
    Eui64 = 1,
    /// Namespace Globally Unique Identifier (16 bytes)
    Nguid = 2,
    /// Namespace UUID (16 bytes)
    Uuid = 3,
}

/// One Namespace Identification Descriptor
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceIdDescriptor {
    /// Identifier type
    pub nidt: NamespaceIdType,
    /// Identifier value
    pub nid: Vec<u8>,
}

/// Namespace Identification Descriptor list (CNS 03h)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NamespaceIdDescriptorList {
    /// Descriptors in list order
    pub descriptors: Vec<NamespaceIdDescriptor>,
}

impl NamespaceIdDescriptorList {
    /// List with a single UUID descriptor
    pub fn uuid(uuid: [u8; 16]) -> Self {
        Self {
            descriptors: vec![NamespaceIdDescriptor {
                nidt: NamespaceIdType::Uuid,
                nid: uuid.to_vec(),
            }],
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(NVME_IDENTIFY_DATA_LEN);
        for desc in &self.descriptors {
            if buf.len() + 4 + desc.nid.len() > NVME_IDENTIFY_DATA_LEN {
                break;
            }
            buf.put_u8(desc.nidt as u8);
            buf.put_u8(desc.nid.len() as u8);
            buf.put_u16_le(0);
            buf.put_slice(&desc.nid);
        }
        buf.resize(NVME_IDENTIFY_DATA_LEN, 0);
        buf.freeze()
    }
}

fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Copy `value` into a `width`-byte field, truncating and filling the rest
/// with `pad`
fn put_padded(buf: &mut [u8], offset: usize, width: usize, value: &str, pad: u8) {
    let field = &mut buf[offset..offset + width];
    field.fill(pad);
    let bytes = value.as_bytes();
    let len = bytes.len().min(width);
    field[..len].copy_from_slice(&bytes[..len]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TargetConfig {
        TargetConfig::default()
    }

    #[test]
    fn test_identify_controller_layout() {
        let cfg = config();
        let bytes = IdentifyController::io_controller(&cfg).to_bytes();
        assert_eq!(bytes.len(), NVME_ID_CTRL_LEN);

        let sn = &bytes[4..24];
        assert!(sn.starts_with(cfg.controller.serial.as_bytes()));
        assert_eq!(sn[19], b' ');
        assert!(bytes[24..64].starts_with(cfg.controller.model.as_bytes()));
        assert!(bytes[64..72].starts_with(cfg.controller.firmware.as_bytes()));

        assert_eq!(bytes[77], 1);
        assert_eq!(&bytes[78..80], &1u16.to_le_bytes());
        assert_eq!(&bytes[80..84], &0x0001_0400u32.to_le_bytes());
        assert_eq!(bytes[111], ControllerType::Io as u8);
        assert_eq!(bytes[512], 0x66);
        assert_eq!(bytes[513], 0x44);
        assert_eq!(&bytes[514..516], &cfg.max_queue_depth.to_le_bytes());
        assert_eq!(&bytes[516..520], &1u32.to_le_bytes());
        assert_eq!(&bytes[536..540], &1u32.to_le_bytes());
        assert_eq!(&bytes[1792..1796], &((64u32 + 8192) / 16).to_le_bytes());
        assert_eq!(&bytes[1796..1800], &1u32.to_le_bytes());
    }

    #[test]
    fn test_identify_controller_subnqn() {
        let cfg = config();
        let bytes = IdentifyController::io_controller(&cfg).to_bytes();
        let nqn = &bytes[768..1024];
        let len = nqn.iter().position(|&b| b == 0).unwrap();
        assert_eq!(&nqn[..len], cfg.subsystem_nqn.as_bytes());
    }

    #[test]
    fn test_discovery_controller() {
        let cfg = config();
        let bytes = IdentifyController::discovery_controller(&cfg).to_bytes();
        assert_eq!(bytes.len(), NVME_ID_CTRL_LEN);
        assert_eq!(bytes[111], ControllerType::Discovery as u8);
        assert!(bytes[768..].starts_with(cfg.discovery_nqn.as_bytes()));
        // No serial or model on the discovery controller
        assert!(bytes[4..64].iter().all(|&b| b == b' '));
        assert_eq!(&bytes[516..520], &0u32.to_le_bytes());
    }

    #[test]
    fn test_discovery_maxcmd_is_discovery_queue_depth() {
        let cfg = TargetConfig {
            max_queue_depth: 128,
            ..config()
        };
        let ctrl = IdentifyController::discovery_controller(&cfg);
        assert_eq!(ctrl.maxcmd, DISCOVERY_QUEUE_DEPTH);
        assert_eq!(&ctrl.to_bytes()[514..516], &64u16.to_le_bytes());
        assert_eq!(IdentifyController::io_controller(&cfg).maxcmd, 128);
    }

    #[test]
    fn test_identify_namespace() {
        let ns = IdentifyNamespace::new(1024 * 1024 * 1024, 4096);
        assert_eq!(ns.nsze, 262144);

        let bytes = ns.to_bytes();
        assert_eq!(bytes.len(), IdentifyNamespace::SIZE);
        assert_eq!(&bytes[0..8], &262144u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &262144u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &262144u64.to_le_bytes());
        assert_eq!(bytes[25], 0);
        assert_eq!(bytes[26], 0);
        assert_eq!(&bytes[128..132], &[0, 0, 12, 0]);
    }

    #[test]
    fn test_active_namespace_list() {
        let bytes = ActiveNamespaceList::after(0, &[1]).to_bytes();
        assert_eq!(bytes.len(), 4096);
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert!(bytes[4..].iter().all(|&b| b == 0));

        assert!(ActiveNamespaceList::after(1, &[1]).nsids.is_empty());
    }

    #[test]
    fn test_namespace_descriptor_list() {
        let uuid = [0xA5; 16];
        let bytes = NamespaceIdDescriptorList::uuid(uuid).to_bytes();
        assert_eq!(bytes.len(), 4096);
        assert_eq!(&bytes[0..4], &[3, 16, 0, 0]);
        assert_eq!(&bytes[4..20], &uuid);
        assert!(bytes[20..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_padded_truncates() {
        let mut buf = [0u8; 8];
        put_padded(&mut buf, 0, 4, "abcdef", b' ');
        assert_eq!(&buf[..4], b"abcd");
        put_padded(&mut buf, 4, 4, "x", b' ');
        assert_eq!(&buf[4..], b"x   ");
    }
}
