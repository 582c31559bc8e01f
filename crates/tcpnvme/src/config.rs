//! Target configuration
//!
//! Every section has defaults, so a TOML file only needs the keys it
//! changes.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use uuid::Uuid;

use crate::error::{NvmeOfError, NvmeOfResult};
use crate::{validate_nqn, DISCOVERY_NQN, NVME_TCP_PORT, TARGET_NQN};

/// Logical block size the target exposes
pub const BLOCK_SIZE: u32 = 4096;

/// Main target configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Address to bind to for incoming connections
    pub bind_addr: IpAddr,

    /// Port to listen on (default: 4420)
    pub port: u16,

    /// Address published in the discovery log (defaults to `bind_addr`,
    /// or loopback when binding the unspecified address)
    pub advertised_addr: Option<IpAddr>,

    /// NQN of the NVM subsystem
    pub subsystem_nqn: String,

    /// NQN of the discovery subsystem
    pub discovery_nqn: String,

    /// Maximum queue depth for admin and I/O queues
    pub max_queue_depth: u16,

    /// Backing store for namespace data
    pub store: StoreKind,

    /// Identify Controller strings and limits
    pub controller: ControllerIdentity,

    /// The single namespace exported by the subsystem
    pub namespace: NamespaceConfig,

    /// TCP socket options
    pub tcp: TcpConfig,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: NVME_TCP_PORT,
            advertised_addr: None,
            subsystem_nqn: TARGET_NQN.to_string(),
            discovery_nqn: DISCOVERY_NQN.to_string(),
            controller: ControllerIdentity::default(),
            max_queue_depth: 128,
            namespace: NamespaceConfig::default(),
            tcp: TcpConfig::default(),
            store: StoreKind::default(),
        }
    }
}

impl TargetConfig {
    /// Socket address to listen on
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    /// Address reported in discovery log entries
    pub fn traddr(&self) -> IpAddr {
        match self.advertised_addr {
            Some(addr) => addr,
            None if self.bind_addr.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            None => self.bind_addr,
        }
    }

    /// Check the configuration, reporting every problem at once
    pub fn validate(&self) -> NvmeOfResult<()> {
        let mut errors = Vec::new();

        if self.port == 0 {
            errors.push("port must be non-zero".to_string());
        }
        if !validate_nqn(&self.subsystem_nqn) {
            errors.push(format!("invalid subsystem NQN: {:?}", self.subsystem_nqn));
        }
        if !validate_nqn(&self.discovery_nqn) {
            errors.push(format!("invalid discovery NQN: {:?}", self.discovery_nqn));
        }
        if self.subsystem_nqn == self.discovery_nqn {
            errors.push("subsystem NQN and discovery NQN must differ".to_string());
        }
        if self.max_queue_depth < 2 {
            errors.push(format!(
                "max_queue_depth must be at least 2, got {}",
                self.max_queue_depth
            ));
        }
        if self.controller.serial.len() > 20 {
            errors.push("controller serial is longer than 20 bytes".to_string());
        }
        if self.controller.model.len() > 40 {
            errors.push("controller model is longer than 40 bytes".to_string());
        }
        if self.controller.firmware.len() > 8 {
            errors.push("controller firmware is longer than 8 bytes".to_string());
        }
        errors.extend(self.namespace.problems());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(NvmeOfError::Config(errors.join("; ")))
        }
    }
}

/// Strings and limits reported by Identify Controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerIdentity {
    /// Serial number (up to 20 ASCII bytes)
    pub serial: String,

    /// Model number (up to 40 ASCII bytes)
    pub model: String,

    /// Firmware revision (up to 8 ASCII bytes)
    pub firmware: String,

    /// Keep Alive Support granularity in 100ms units
    pub keep_alive_granularity: u16,
}

impl Default for ControllerIdentity {
    fn default() -> Self {
        Self {
            serial: "SN1234567890".to_string(),
            model: "tcpnvme NVMe/TCP Target".to_string(),
            firmware: "0.0.1".to_string(),
            keep_alive_granularity: 10,
        }
    }
}

/// Namespace configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    /// Namespace ID
    pub nsid: u32,

    /// Size in bytes
    pub size_bytes: u64,

    /// Block size in bytes
    pub block_size: u32,

    /// Namespace UUID reported in the descriptor list
    pub uuid: Uuid,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            nsid: 1,
            size_bytes: 1024 * 1024 * 1024,
            block_size: BLOCK_SIZE,
            uuid: Uuid::from_u128(0x5a1c_0de0_7c9e_4e11_9a4d_6e766d65_0001),
        }
    }
}

impl NamespaceConfig {
    /// Number of logical blocks
    pub fn num_blocks(&self) -> u64 {
        if self.block_size == 0 {
            0
        } else {
            self.size_bytes / u64::from(self.block_size)
        }
    }

    fn problems(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.nsid == 0 || self.nsid == u32::MAX {
            errors.push(format!("invalid namespace id {}", self.nsid));
        }
        if self.block_size != BLOCK_SIZE {
            errors.push(format!(
                "block_size must be {}, got {}",
                BLOCK_SIZE, self.block_size
            ));
        }
        if self.size_bytes == 0 {
            errors.push("namespace size must be non-zero".to_string());
        } else if self.block_size != 0 && self.size_bytes % u64::from(self.block_size) != 0 {
            errors.push(format!(
                "namespace size {} is not a multiple of the block size",
                self.size_bytes
            ));
        }
        errors
    }
}

/// TCP transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Enable TCP_NODELAY on accepted sockets
    pub nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

/// Backing store selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Reads return zeroes, writes are discarded
    #[default]
    Zero,
    /// Sparse in-memory blocks
    Memory,
}
