//! Discovery Log Page
//!
//! The page is a 1024-byte header followed by one 1024-byte entry per
//! advertised subsystem port. Hosts usually read it twice: once for the
//! header to learn `numrec`, then again for the entries.

use bytes::{Bytes, BytesMut};
use std::net::IpAddr;
use tracing::debug;

use crate::config::TargetConfig;
use crate::identify::CONTROLLER_ID;

/// Size of the Discovery Log Page header
pub const DISCOVERY_LOG_HEADER_LEN: usize = 1024;

/// Size of one Discovery Log Page entry
pub const DISCOVERY_LOG_ENTRY_LEN: usize = 1024;

/// Size of a Discovery Log Page holding a single entry
pub const NVME_DISCOVERY_LOG_PAGE_LEN: usize = DISCOVERY_LOG_HEADER_LEN + DISCOVERY_LOG_ENTRY_LEN;

/// Transport type (TRTYPE)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportType {
    /// RDMA
    Rdma = 1,
    /// Fibre Channel
    Fc = 2,
    /// TCP
    Tcp = 3,
    /// Intra-host
    Loop = 254,
}

/// Address family (ADRFAM)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressFamily {
    /// IPv4
    Ipv4 = 1,
    /// IPv6
    Ipv6 = 2,
    /// InfiniBand
    Ib = 3,
    /// Fibre Channel
    Fc = 4,
    /// Intra-host
    Loop = 254,
}

impl From<IpAddr> for AddressFamily {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::Ipv4,
            IpAddr::V6(_) => Self::Ipv6,
        }
    }
}

/// Subsystem type (SUBTYPE)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubsystemType {
    /// Referral to another discovery subsystem
    Referral = 1,
    /// NVM subsystem (for I/O)
    Nvm = 2,
    /// The discovery subsystem being queried
    CurrentDiscovery = 3,
}

mod entry_offset {
    pub const TRTYPE: usize = 0;
    pub const ADRFAM: usize = 1;
    pub const SUBTYPE: usize = 2;
    pub const TREQ: usize = 3;
    pub const PORTID: usize = 4;
    pub const CNTLID: usize = 6;
    pub const ASQSZ: usize = 8;
    pub const EFLAGS: usize = 10;
    pub const TRSVCID: usize = 32;
    pub const SUBNQN: usize = 256;
    pub const TRADDR: usize = 512;
    pub const TSAS: usize = 768;
}

/// One Discovery Log Page entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryLogEntry {
    /// Transport type
    pub trtype: TransportType,
    /// Address family
    pub adrfam: AddressFamily,
    /// Subsystem type
    pub subtype: SubsystemType,
    /// Transport requirements
    pub treq: u8,
    /// NVM subsystem port ID
    pub portid: u16,
    /// Controller ID
    pub cntlid: u16,
    /// Admin max SQ size
    pub asqsz: u16,
    /// Entry flags
    pub eflags: u16,
    /// Transport service identifier (port as string)
    pub trsvcid: String,
    /// Subsystem NQN
    pub subnqn: String,
    /// Transport address
    pub traddr: String,
    /// TCP security type (TSAS.SECTYPE)
    pub sectype: u8,
}

impl DiscoveryLogEntry {
    /// Entry advertising the NVM subsystem of `config`
    pub fn for_target(config: &TargetConfig) -> Self {
        let traddr = config.traddr();
        Self {
            trtype: TransportType::Tcp,
            adrfam: AddressFamily::from(traddr),
            subtype: SubsystemType::Nvm,
            treq: 0,
            portid: 0,
            cntlid: CONTROLLER_ID,
            asqsz: config.max_queue_depth,
            eflags: 0,
            trsvcid: config.port.to_string(),
            subnqn: config.subsystem_nqn.clone(),
            traddr: traddr.to_string(),
            sectype: 0,
        }
    }

    /// Write the entry into a 1024-byte slot
    fn write_to(&self, slot: &mut [u8]) {
        use entry_offset::*;

        slot[TRTYPE] = self.trtype as u8;
        slot[ADRFAM] = self.adrfam as u8;
        slot[SUBTYPE] = self.subtype as u8;
        slot[TREQ] = self.treq;
        slot[PORTID..PORTID + 2].copy_from_slice(&self.portid.to_le_bytes());
        slot[CNTLID..CNTLID + 2].copy_from_slice(&self.cntlid.to_le_bytes());
        slot[ASQSZ..ASQSZ + 2].copy_from_slice(&self.asqsz.to_le_bytes());
        slot[EFLAGS..EFLAGS + 2].copy_from_slice(&self.eflags.to_le_bytes());
        put_str(slot, TRSVCID, 32, &self.trsvcid);
        put_str(slot, SUBNQN, 256, &self.subnqn);
        put_str(slot, TRADDR, 256, &self.traddr);
        slot[TSAS] = self.sectype;
    }
}

/// Discovery Log Page (log identifier 70h)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryLogPage {
    /// Generation counter
    pub genctr: u64,
    /// Record format
    pub recfmt: u16,
    /// Entries
    pub entries: Vec<DiscoveryLogEntry>,
}

impl DiscoveryLogPage {
    /// Page advertising the NVM subsystem of `config`
    pub fn for_target(config: &TargetConfig) -> Self {
        Self {
            genctr: 0,
            recfmt: 0,
            entries: vec![DiscoveryLogEntry::for_target(config)],
        }
    }

    /// Serialized length of the page
    pub fn len(&self) -> usize {
        DISCOVERY_LOG_HEADER_LEN + self.entries.len() * DISCOVERY_LOG_ENTRY_LEN
    }

    /// True when the page carries no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn write_to(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.genctr.to_le_bytes());
        buf[8..16].copy_from_slice(&(self.entries.len() as u64).to_le_bytes());
        buf[16..18].copy_from_slice(&self.recfmt.to_le_bytes());

        for (i, entry) in self.entries.iter().enumerate() {
            let start = DISCOVERY_LOG_HEADER_LEN + i * DISCOVERY_LOG_ENTRY_LEN;
            entry.write_to(&mut buf[start..start + DISCOVERY_LOG_ENTRY_LEN]);
        }
    }

    /// Serialize the whole page
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::zeroed(self.len());
        self.write_to(&mut buf);
        buf.freeze()
    }

    /// Exactly `len` bytes of the page starting at `offset`, zero-padded
    /// past its end. `None` when `offset` lies beyond the page.
    pub fn read(&self, offset: u64, len: usize) -> Option<Bytes> {
        let page_len = self.len().max(NVME_DISCOVERY_LOG_PAGE_LEN);
        let offset = usize::try_from(offset).ok().filter(|&o| o <= page_len)?;

        let mut buf = BytesMut::zeroed(page_len.max(offset + len));
        self.write_to(&mut buf[..self.len()]);
        debug!(
            offset,
            len,
            numrec = self.entries.len(),
            "discovery log page read"
        );
        Some(buf.freeze().slice(offset..offset + len))
    }
}

fn put_str(buf: &mut [u8], offset: usize, width: usize, value: &str) {
    let bytes = value.as_bytes();
    // Keep a terminating NUL
    let len = bytes.len().min(width - 1);
    buf[offset..offset + len].copy_from_slice(&bytes[..len]);
}
