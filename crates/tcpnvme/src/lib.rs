//! NVMe over TCP target
//!
//! A small NVMe/TCP target that exposes one namespace to standard hosts
//! such as the Linux kernel initiator and `nvme-cli`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    NvmeTcpTarget                         │
//! │  TcpListener ── accept ──► one task per connection       │
//! ├──────────────────────────────────────────────────────────┤
//! │  Connection                                              │
//! │    ICReq/ICResp handshake                                │
//! │    Connect ──► Discovery │ Admin │ I/O queue dispatcher  │
//! ├──────────────────────────────────────────────────────────┤
//! │  QueueDispatcher                                         │
//! │    Fabrics ──► ControllerProperties (CAP/VS/CC/CSTS)     │
//! │    Admin   ──► Identify, Get Log Page, Set Features, ... │
//! │    I/O     ──► Namespace ──► BlockStore                  │
//! ├──────────────────────────────────────────────────────────┤
//! │  NvmeTcpStream: PDU framing over any AsyncRead+AsyncWrite│
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use tcpnvme::{NvmeTcpTarget, TargetConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let target = NvmeTcpTarget::new(TargetConfig::default())?;
//! target.run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Host Access
//!
//! ```bash
//! nvme discover -t tcp -a 127.0.0.1 -s 4420
//! nvme connect -t tcp -a 127.0.0.1 -s 4420 -n nqn.2019-11.fun.adamdjudge.tcpnvme
//! ```

#![warn(missing_docs)]

pub mod admin;
pub mod capsule;
pub mod command;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod identify;
pub mod io;
pub mod namespace;
pub mod pdu;
pub mod properties;
pub mod queue;
pub mod target;
pub mod transport;

// Re-exports
pub use capsule::{CommandCapsule, ConnectData, ResponseCapsule};
pub use command::{
    AdminOpcode, CommandOutcome, CommandResult, FabricsType, FeatureId, IdentifyCns, IoOpcode,
    LogPageId, NvmeCommand, NvmeCompletion,
};
pub use config::{StoreKind, TargetConfig};
pub use connection::{Connection, QueueAssignment};
pub use discovery::DiscoveryLogPage;
pub use error::{NvmeOfError, NvmeOfResult, NvmeStatus, StatusCodeType};
pub use identify::{IdentifyController, IdentifyNamespace};
pub use namespace::{BlockStore, MemoryStore, Namespace, ZeroStore};
pub use pdu::{C2HDataHeader, IcReq, IcResp, Pdu, PduHeader, PduType};
pub use properties::ControllerProperties;
pub use queue::{QueueCommand, QueueDispatcher, QueueRole};
pub use target::{NvmeTcpTarget, TargetContext};
pub use transport::NvmeTcpStream;

/// IANA port for NVMe/TCP
pub const NVME_TCP_PORT: u16 = 4420;

/// Discovery NQN (well-known)
pub const DISCOVERY_NQN: &str = "nqn.2014-08.org.nvmexpress.discovery";

/// NQN of the NVM subsystem served by default
pub const TARGET_NQN: &str = "nqn.2019-11.fun.adamdjudge.tcpnvme";

/// Maximum NQN length in bytes
pub const MAX_NQN_LEN: usize = 223;

/// Validate an NQN format
pub fn validate_nqn(nqn: &str) -> bool {
    // nqn.YYYY-MM.reverse.domain[:name] or nqn.2014-08.org.nvmexpress:uuid:<uuid>
    if !nqn.starts_with("nqn.") || nqn.len() > MAX_NQN_LEN {
        return false;
    }
    if !nqn.is_ascii() || nqn.bytes().any(|b| b.is_ascii_control() || b == b' ') {
        return false;
    }

    // The date must look like YYYY-MM
    let date = nqn.get(4..11).unwrap_or_default().as_bytes();
    let date_ok = date.len() == 7
        && date[..4].iter().all(u8::is_ascii_digit)
        && date[4] == b'-'
        && date[5..].iter().all(u8::is_ascii_digit);

    // Followed by a reverse domain
    date_ok && nqn.len() > 12 && nqn.as_bytes()[11] == b'.'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_nqn() {
        assert!(validate_nqn(TARGET_NQN));
        assert!(validate_nqn(DISCOVERY_NQN));
        assert!(validate_nqn("nqn.2024-01.io.example:storage"));
        assert!(validate_nqn(
            "nqn.2014-08.org.nvmexpress:uuid:f81d4fae-7dec-11d0-a765-00a0c91e6bf6"
        ));
        assert!(!validate_nqn("invalid"));
        assert!(!validate_nqn("nq.2024-01.io.example:storage"));
        assert!(!validate_nqn("nqn.24-01.io.example"));
        assert!(!validate_nqn("nqn.2024-01"));
        assert!(!validate_nqn("nqn.2024-01.io.example:with space"));
    }

    #[test]
    fn test_validate_nqn_length() {
        let long = format!("nqn.2024-01.io.example:{}", "x".repeat(200));
        assert!(!validate_nqn(&long));
        let max = format!("nqn.2024-01.io.example:{}", "x".repeat(MAX_NQN_LEN - 23));
        assert_eq!(max.len(), MAX_NQN_LEN);
        assert!(validate_nqn(&max));
    }
}
