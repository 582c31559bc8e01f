//! Error and status types
//!
//! Two kinds of failure exist on an NVMe/TCP connection. Transport and
//! framing failures are [`NvmeOfError`]s and end the connection. Command
//! failures are [`NvmeStatus`] values that travel back to the host inside a
//! completion entry.

use std::io;
use thiserror::Error;

use crate::pdu::PduType;

/// Result type for NVMe/TCP target operations
pub type NvmeOfResult<T> = Result<T, NvmeOfError>;

/// NVMe/TCP target error types
#[derive(Debug, Error)]
pub enum NvmeOfError {
    /// I/O error on the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Peer closed the stream
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// Malformed PDU (bad type, inconsistent lengths, oversize)
    #[error("Invalid PDU: {0}")]
    InvalidPdu(String),

    /// Well-formed PDU that is not valid in the current state
    #[error("Unexpected PDU: expected {expected:?}, got {got:?}")]
    UnexpectedPdu {
        /// PDU type the connection was waiting for
        expected: PduType,
        /// PDU type that arrived
        got: PduType,
    },

    /// Invalid capsule format
    #[error("Invalid capsule: {0}")]
    InvalidCapsule(String),

    /// Backing store error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl NvmeOfError {
    /// True when the error means the peer went away rather than misbehaved
    pub fn is_disconnect(&self) -> bool {
        match self {
            NvmeOfError::Disconnected(_) => true,
            NvmeOfError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Status Code Type (SCT), bits 9-11 of the status field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCodeType {
    /// Generic command status
    Generic = 0x0,
    /// Command specific status
    CommandSpecific = 0x1,
    /// Media and data integrity errors
    MediaError = 0x2,
    /// Path related status
    Path = 0x3,
    /// Vendor specific
    VendorSpecific = 0x7,
}

impl StatusCodeType {
    /// Create from raw value
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Generic),
            0x1 => Some(Self::CommandSpecific),
            0x2 => Some(Self::MediaError),
            0x3 => Some(Self::Path),
            0x7 => Some(Self::VendorSpecific),
            _ => None,
        }
    }
}

/// Do Not Retry bit of the status field, set for every non-success status
pub const STATUS_DNR: u16 = 1 << 15;

/// Encode a status code type and status code into the 16-bit completion
/// status field.
pub fn status_field(sct: u8, sc: u8) -> u16 {
    let mut sf = 0u16;
    if sct != 0 || sc != 0 {
        sf |= STATUS_DNR;
    }
    sf |= u16::from(sct & 0x7) << 9;
    sf |= u16::from(sc) << 1;
    sf
}

/// NVMe completion status
///
/// The discriminant packs the status code type in the high byte and the
/// status code in the low byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NvmeStatus {
    /// Command completed successfully
    Success = 0x0000,

    /// Invalid command opcode
    InvalidOpcode = 0x0001,

    /// Invalid field in command
    InvalidField = 0x0002,

    /// Internal error
    InternalError = 0x0006,

    /// Invalid namespace or format
    InvalidNamespaceOrFormat = 0x000B,

    /// Command sequence error
    CommandSequenceError = 0x000C,

    /// Data SGL length invalid
    DataSglLengthInvalid = 0x000F,

    /// LBA out of range
    LbaOutOfRange = 0x0080,

    // Fabrics command specific codes
    /// Connect invalid parameters
    ConnectInvalidParams = 0x0182,
}

impl NvmeStatus {
    /// Create from a packed `(sct << 8) | sc` value
    pub fn from_raw(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(Self::Success),
            0x0001 => Some(Self::InvalidOpcode),
            0x0002 => Some(Self::InvalidField),
            0x0006 => Some(Self::InternalError),
            0x000B => Some(Self::InvalidNamespaceOrFormat),
            0x000C => Some(Self::CommandSequenceError),
            0x000F => Some(Self::DataSglLengthInvalid),
            0x0080 => Some(Self::LbaOutOfRange),
            0x0182 => Some(Self::ConnectInvalidParams),
            _ => None,
        }
    }

    /// Decode the status field of a completion entry
    pub fn from_status_field(sf: u16) -> Option<Self> {
        let sct = (sf >> 9) & 0x7;
        let sc = (sf >> 1) & 0xFF;
        Self::from_raw((sct << 8) | sc)
    }

    /// Packed `(sct << 8) | sc` value
    pub fn to_raw(self) -> u16 {
        self as u16
    }

    /// Status code type
    pub fn sct(self) -> StatusCodeType {
        StatusCodeType::from_raw((self.to_raw() >> 8) as u8).unwrap_or(StatusCodeType::Generic)
    }

    /// Status code
    pub fn sc(self) -> u8 {
        (self.to_raw() & 0xFF) as u8
    }

    /// Encoded completion status field
    pub fn status_field(self) -> u16 {
        status_field(self.sct() as u8, self.sc())
    }

    /// Check if status indicates success
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_status_field_success_is_zero() {
        assert_eq!(status_field(0, 0), 0);
        assert_eq!(NvmeStatus::Success.status_field(), 0);
    }

    #[test]
    fn test_status_field_known_values() {
        // Generic / Command Sequence Error
        assert_eq!(NvmeStatus::CommandSequenceError.status_field(), 0x8018);
        // Generic / Invalid Field
        assert_eq!(NvmeStatus::InvalidField.status_field(), 0x8004);
        // Command Specific / Connect Invalid Parameters
        assert_eq!(NvmeStatus::ConnectInvalidParams.status_field(), 0x8304);
    }

    #[test]
    fn test_status_sct_sc_split() {
        assert_eq!(NvmeStatus::LbaOutOfRange.sct(), StatusCodeType::Generic);
        assert_eq!(NvmeStatus::LbaOutOfRange.sc(), 0x80);
        assert_eq!(
            NvmeStatus::ConnectInvalidParams.sct(),
            StatusCodeType::CommandSpecific
        );
        assert_eq!(NvmeStatus::ConnectInvalidParams.sc(), 0x82);
    }

    #[test]
    fn test_status_decode_from_field() {
        for status in [
            NvmeStatus::Success,
            NvmeStatus::InvalidOpcode,
            NvmeStatus::InvalidField,
            NvmeStatus::CommandSequenceError,
            NvmeStatus::LbaOutOfRange,
            NvmeStatus::ConnectInvalidParams,
        ] {
            assert_eq!(
                NvmeStatus::from_status_field(status.status_field()),
                Some(status)
            );
        }
        assert_eq!(NvmeStatus::from_status_field(0x8000 | (0x55 << 1)), None);
    }

    #[test]
    fn test_disconnect_classification() {
        assert!(NvmeOfError::Disconnected("eof".into()).is_disconnect());
        assert!(NvmeOfError::Io(io::Error::from(io::ErrorKind::BrokenPipe)).is_disconnect());
        assert!(!NvmeOfError::InvalidPdu("bad type".into()).is_disconnect());
    }

    proptest! {
        #[test]
        fn prop_status_field_law(sct in 0u8..8, sc in any::<u8>()) {
            let more = u16::from(sct != 0 || sc != 0);
            let expected = (more << 15) | (u16::from(sct & 7) << 9) | (u16::from(sc) << 1);
            prop_assert_eq!(status_field(sct, sc), expected);
        }

        #[test]
        fn prop_status_field_bit0_clear(sct in any::<u8>(), sc in any::<u8>()) {
            // Phase tag bit is owned by the transport, never by the encoder
            prop_assert_eq!(status_field(sct, sc) & 1, 0);
        }
    }
}
