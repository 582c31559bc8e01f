//! Command and response capsules
//!
//! A command capsule is a CapsuleCmd PDU whose PSH is the 64-byte SQE and
//! whose data, if any, is in-capsule data. A response capsule is a
//! CapsuleResp PDU carrying the 16-byte CQE.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use crate::command::{NvmeCommand, NvmeCompletion};
use crate::error::{NvmeOfError, NvmeOfResult};
use crate::pdu::{Pdu, PduType};

/// Command Capsule
#[derive(Clone)]
pub struct CommandCapsule {
    /// NVMe Command (SQE)
    pub command: NvmeCommand,
    /// In-capsule data (if any)
    pub data: Option<Bytes>,
}

impl CommandCapsule {
    /// Create a new command capsule without data
    pub fn new(command: NvmeCommand) -> Self {
        Self {
            command,
            data: None,
        }
    }

    /// Create a command capsule with in-capsule data
    pub fn with_data(command: NvmeCommand, data: Bytes) -> Self {
        Self {
            command,
            data: Some(data),
        }
    }

    /// Extract the capsule from a CapsuleCmd PDU
    pub fn from_pdu(pdu: Pdu) -> NvmeOfResult<Self> {
        if pdu.pdu_type() != PduType::CapsuleCmd {
            return Err(NvmeOfError::UnexpectedPdu {
                expected: PduType::CapsuleCmd,
                got: pdu.pdu_type(),
            });
        }

        let psh = pdu.psh.unwrap_or_default();
        let command = NvmeCommand::from_bytes(&psh).ok_or_else(|| {
            NvmeOfError::InvalidCapsule(format!("SQE too short: {} bytes", psh.len()))
        })?;

        Ok(Self {
            command,
            data: pdu.data,
        })
    }

    /// Wrap into a CapsuleCmd PDU
    pub fn to_pdu(&self) -> NvmeOfResult<Pdu> {
        Pdu::new(
            PduType::CapsuleCmd,
            0,
            Some(self.command.to_bytes()),
            self.data.clone(),
        )
    }

    /// Length of the in-capsule data
    pub fn data_len(&self) -> usize {
        self.data.as_ref().map_or(0, Bytes::len)
    }
}

impl fmt::Debug for CommandCapsule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandCapsule")
            .field("command", &self.command)
            .field("data_len", &self.data.as_ref().map(|d| d.len()))
            .finish()
    }
}

/// Response Capsule
#[derive(Clone, Debug)]
pub struct ResponseCapsule {
    /// NVMe Completion (CQE)
    pub completion: NvmeCompletion,
}

impl ResponseCapsule {
    /// Create a new response capsule
    pub fn new(completion: NvmeCompletion) -> Self {
        Self { completion }
    }

    /// Extract the completion from a CapsuleResp PDU
    pub fn from_pdu(pdu: &Pdu) -> NvmeOfResult<Self> {
        if pdu.pdu_type() != PduType::CapsuleResp {
            return Err(NvmeOfError::UnexpectedPdu {
                expected: PduType::CapsuleResp,
                got: pdu.pdu_type(),
            });
        }
        let psh = pdu.psh.as_deref().unwrap_or_default();
        let completion = NvmeCompletion::from_bytes(psh)
            .ok_or_else(|| NvmeOfError::InvalidCapsule("CQE too short".to_string()))?;
        Ok(Self { completion })
    }

    /// Wrap into a CapsuleResp PDU
    pub fn to_pdu(&self) -> NvmeOfResult<Pdu> {
        Pdu::new(
            PduType::CapsuleResp,
            0,
            Some(self.completion.to_bytes()),
            None,
        )
    }
}

/// Fabrics Connect command data
#[derive(Clone, Debug)]
pub struct ConnectData {
    /// Host Identifier (16 bytes)
    pub hostid: [u8; 16],
    /// Controller ID (0xFFFF for dynamic allocation)
    pub cntlid: u16,
    /// Subsystem NQN (256 bytes, null-terminated)
    pub subnqn: [u8; 256],
    /// Host NQN (256 bytes, null-terminated)
    pub hostnqn: [u8; 256],
}

impl ConnectData {
    /// Size of connect data
    pub const SIZE: usize = 1024;

    const SUBNQN_OFFSET: usize = 256;
    const HOSTNQN_OFFSET: usize = 512;
    const NQN_LEN: usize = 256;

    /// Create new connect data
    pub fn new(hostid: [u8; 16], subnqn: &str, hostnqn: &str) -> Self {
        let mut data = Self {
            hostid,
            cntlid: 0xFFFF,
            subnqn: [0; 256],
            hostnqn: [0; 256],
        };

        let subnqn_len = subnqn.len().min(Self::NQN_LEN - 1);
        let hostnqn_len = hostnqn.len().min(Self::NQN_LEN - 1);
        data.subnqn[..subnqn_len].copy_from_slice(&subnqn.as_bytes()[..subnqn_len]);
        data.hostnqn[..hostnqn_len].copy_from_slice(&hostnqn.as_bytes()[..hostnqn_len]);

        data
    }

    /// Get subsystem NQN as string
    pub fn subnqn_str(&self) -> &str {
        nul_terminated(&self.subnqn)
    }

    /// Get host NQN as string
    pub fn hostnqn_str(&self) -> &str {
        nul_terminated(&self.hostnqn)
    }

    /// Parse from bytes
    pub fn from_bytes(buf: &[u8]) -> NvmeOfResult<Self> {
        if buf.len() < Self::SIZE {
            return Err(NvmeOfError::InvalidCapsule(format!(
                "Connect data too short: {} bytes",
                buf.len()
            )));
        }

        let mut hostid = [0u8; 16];
        hostid.copy_from_slice(&buf[..16]);
        let cntlid = u16::from_le_bytes([buf[16], buf[17]]);

        let mut subnqn = [0u8; 256];
        subnqn.copy_from_slice(&buf[Self::SUBNQN_OFFSET..Self::SUBNQN_OFFSET + Self::NQN_LEN]);
        let mut hostnqn = [0u8; 256];
        hostnqn.copy_from_slice(&buf[Self::HOSTNQN_OFFSET..Self::HOSTNQN_OFFSET + Self::NQN_LEN]);

        Ok(Self {
            hostid,
            cntlid,
            subnqn,
            hostnqn,
        })
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_slice(&self.hostid);
        buf.put_u16_le(self.cntlid);
        buf.resize(Self::SUBNQN_OFFSET, 0);
        buf.put_slice(&self.subnqn);
        buf.put_slice(&self.hostnqn);
        buf.resize(Self::SIZE, 0);
        buf.freeze()
    }
}

fn nul_terminated(raw: &[u8]) -> &str {
    let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    std::str::from_utf8(&raw[..len]).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::AdminOpcode;

    #[test]
    fn test_command_capsule_pdu() {
        let cmd = NvmeCommand::new(AdminOpcode::Identify as u8, 42);
        let pdu = CommandCapsule::new(cmd.clone()).to_pdu().unwrap();
        assert_eq!(pdu.header.hlen, 72);
        assert_eq!(pdu.header.plen, 72);

        let parsed = CommandCapsule::from_pdu(pdu).unwrap();
        assert_eq!(parsed.command, cmd);
        assert!(parsed.data.is_none());
    }

    #[test]
    fn test_command_capsule_with_data() {
        let cmd = NvmeCommand::connect(1, 0, 32, 0);
        let data = ConnectData::new([7; 16], "nqn.a", "nqn.b").to_bytes();
        let pdu = CommandCapsule::with_data(cmd, data.clone()).to_pdu().unwrap();
        assert_eq!(pdu.header.pdo, 72);
        assert_eq!(pdu.header.plen, 72 + 1024);

        let parsed = CommandCapsule::from_pdu(pdu).unwrap();
        assert_eq!(parsed.data, Some(data));
        assert_eq!(parsed.data_len(), 1024);
    }

    #[test]
    fn test_short_sqe_rejected() {
        let pdu = Pdu::new(PduType::CapsuleCmd, 0, Some(Bytes::from(vec![0u8; 32])), None).unwrap();
        assert!(matches!(
            CommandCapsule::from_pdu(pdu),
            Err(NvmeOfError::InvalidCapsule(_))
        ));
    }

    #[test]
    fn test_wrong_pdu_type_rejected() {
        let pdu = Pdu::new(PduType::IcReq, 0, Some(Bytes::from(vec![0u8; 120])), None).unwrap();
        assert!(matches!(
            CommandCapsule::from_pdu(pdu),
            Err(NvmeOfError::UnexpectedPdu { .. })
        ));
    }

    #[test]
    fn test_response_capsule_pdu() {
        let cqe = NvmeCompletion::new(42, 0, 1);
        let pdu = ResponseCapsule::new(cqe.clone()).to_pdu().unwrap();
        assert_eq!(pdu.header.hlen, 24);
        assert_eq!(pdu.header.plen, 24);

        let parsed = ResponseCapsule::from_pdu(&pdu).unwrap();
        assert_eq!(parsed.completion, cqe);
    }

    #[test]
    fn test_connect_data_layout() {
        let hostid = [1u8; 16];
        let data = ConnectData::new(
            hostid,
            "nqn.2019-11.fun.adamdjudge.tcpnvme",
            "nqn.2014-08.org.nvmexpress:uuid:host",
        );

        let bytes = data.to_bytes();
        assert_eq!(bytes.len(), ConnectData::SIZE);
        assert_eq!(&bytes[16..18], &[0xFF, 0xFF]);
        assert_eq!(&bytes[256..260], b"nqn.");
        assert_eq!(&bytes[512..516], b"nqn.");

        let parsed = ConnectData::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.hostid, hostid);
        assert_eq!(parsed.subnqn_str(), "nqn.2019-11.fun.adamdjudge.tcpnvme");
        assert_eq!(parsed.hostnqn_str(), "nqn.2014-08.org.nvmexpress:uuid:host");
    }

    #[test]
    fn test_connect_data_too_short() {
        assert!(ConnectData::from_bytes(&[0u8; 512]).is_err());
    }
}
