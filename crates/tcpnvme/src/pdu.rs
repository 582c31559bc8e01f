//! NVMe/TCP PDU framing
//!
//! Every PDU starts with an 8-byte common header. `hlen` counts the common
//! header plus the PDU-specific header (PSH) in bytes, `plen` counts the
//! whole PDU. Whatever follows the PSH is data:
//!
//! ```text
//! +--------+-------+------+-----+-----------+-----------------+----------+
//! | type   | flags | hlen | pdo | plen (LE) | PSH             | data     |
//! | 1 byte | 1     | 1    | 1   | 4         | hlen - 8 bytes  | plen-hlen|
//! +--------+-------+------+-----+-----------+-----------------+----------+
//! ```
//!
//! Reads are complete-or-fail: a PDU is only handed to the caller once every
//! declared byte has arrived.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{NvmeOfError, NvmeOfResult};

/// Largest PDU the codec will accept from a peer
pub const MAX_PDU_LEN: u32 = 1 << 24;

/// NVMe/TCP PDU type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PduType {
    /// ICReq - Initialize Connection Request
    IcReq = 0x00,
    /// ICResp - Initialize Connection Response
    IcResp = 0x01,
    /// CapsuleCmd - Command Capsule
    CapsuleCmd = 0x04,
    /// CapsuleResp - Response Capsule
    CapsuleResp = 0x05,
    /// C2HData - Controller to Host Data
    C2HData = 0x07,
}

impl PduType {
    /// Create from raw value
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::IcReq),
            0x01 => Some(Self::IcResp),
            0x04 => Some(Self::CapsuleCmd),
            0x05 => Some(Self::CapsuleResp),
            0x07 => Some(Self::C2HData),
            _ => None,
        }
    }
}

/// PDU flag bits
pub mod flags {
    /// Last data PDU of a transfer (C2HData)
    pub const LAST_PDU: u8 = 0x04;
}

/// NVMe/TCP PDU Common Header (8 bytes)
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PduHeader {
    /// PDU Type
    pub pdu_type: PduType,
    /// PDU Specific Flags
    pub flags: u8,
    /// Header Length in bytes (common header + PSH)
    pub hlen: u8,
    /// PDU Data Offset in bytes
    pub pdo: u8,
    /// PDU Length (entire PDU including header)
    pub plen: u32,
}

impl PduHeader {
    /// Size of PDU common header
    pub const SIZE: usize = 8;

    /// Parse from bytes, rejecting unknown PDU types
    pub fn from_bytes(mut buf: &[u8]) -> NvmeOfResult<Self> {
        if buf.len() < Self::SIZE {
            return Err(NvmeOfError::InvalidPdu("PDU header too short".to_string()));
        }

        let pdu_type_raw = buf.get_u8();
        let pdu_type = PduType::from_raw(pdu_type_raw).ok_or_else(|| {
            NvmeOfError::InvalidPdu(format!("Unknown PDU type: {:#04x}", pdu_type_raw))
        })?;

        Ok(Self {
            pdu_type,
            flags: buf.get_u8(),
            hlen: buf.get_u8(),
            pdo: buf.get_u8(),
            plen: buf.get_u32_le(),
        })
    }

    /// Serialize into a buffer
    pub fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.pdu_type as u8);
        buf.put_u8(self.flags);
        buf.put_u8(self.hlen);
        buf.put_u8(self.pdo);
        buf.put_u32_le(self.plen);
    }

    /// Check `SIZE <= hlen <= plen <= MAX_PDU_LEN`
    pub fn validate(&self) -> NvmeOfResult<()> {
        if (self.hlen as usize) < Self::SIZE {
            return Err(NvmeOfError::InvalidPdu(format!(
                "hlen {} shorter than common header",
                self.hlen
            )));
        }
        if u32::from(self.hlen) > self.plen {
            return Err(NvmeOfError::InvalidPdu(format!(
                "hlen {} exceeds plen {}",
                self.hlen, self.plen
            )));
        }
        if self.plen > MAX_PDU_LEN {
            return Err(NvmeOfError::InvalidPdu(format!(
                "plen {} exceeds limit {}",
                self.plen, MAX_PDU_LEN
            )));
        }
        Ok(())
    }

    /// PDU-specific header length in bytes
    pub fn psh_len(&self) -> usize {
        (self.hlen as usize).saturating_sub(Self::SIZE)
    }

    /// Trailing data length in bytes
    pub fn data_len(&self) -> usize {
        self.plen.saturating_sub(u32::from(self.hlen)) as usize
    }
}

impl fmt::Debug for PduHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PduHeader")
            .field("pdu_type", &self.pdu_type)
            .field("flags", &format_args!("{:#04x}", self.flags))
            .field("hlen", &self.hlen)
            .field("pdo", &self.pdo)
            .field("plen", &self.plen)
            .finish()
    }
}

/// One framed PDU
#[derive(Clone, PartialEq, Eq)]
pub struct Pdu {
    /// Common header
    pub header: PduHeader,
    /// PDU-specific header, if any
    pub psh: Option<Bytes>,
    /// Data, if any
    pub data: Option<Bytes>,
}

impl Pdu {
    /// Build a PDU, computing `hlen`, `pdo` and `plen` from the parts
    pub fn new(
        pdu_type: PduType,
        flags: u8,
        psh: Option<Bytes>,
        data: Option<Bytes>,
    ) -> NvmeOfResult<Self> {
        let psh = psh.filter(|p| !p.is_empty());
        let data = data.filter(|d| !d.is_empty());

        let psh_len = psh.as_ref().map_or(0, Bytes::len);
        let data_len = data.as_ref().map_or(0, Bytes::len);

        let hlen = u8::try_from(PduHeader::SIZE + psh_len).map_err(|_| {
            NvmeOfError::InvalidPdu(format!("PDU-specific header too long: {} bytes", psh_len))
        })?;
        let plen = u32::try_from(usize::from(hlen) + data_len)
            .ok()
            .filter(|&plen| plen <= MAX_PDU_LEN)
            .ok_or_else(|| {
                NvmeOfError::InvalidPdu(format!("PDU data too long: {} bytes", data_len))
            })?;
        let pdo = if data.is_some() { hlen } else { 0 };

        Ok(Self {
            header: PduHeader {
                pdu_type,
                flags,
                hlen,
                pdo,
                plen,
            },
            psh,
            data,
        })
    }

    /// PDU type
    pub fn pdu_type(&self) -> PduType {
        self.header.pdu_type
    }

    /// Encode the whole PDU into one contiguous buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.header.plen as usize);
        self.header.put(&mut buf);
        if let Some(psh) = &self.psh {
            buf.put_slice(psh);
        }
        if let Some(data) = &self.data {
            buf.put_slice(data);
        }
        buf.freeze()
    }

    /// Decode one PDU from the front of `buf`
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a complete PDU.
    pub fn decode(buf: &[u8]) -> NvmeOfResult<Option<(Self, usize)>> {
        if buf.len() < PduHeader::SIZE {
            return Ok(None);
        }
        let header = PduHeader::from_bytes(buf)?;
        header.validate()?;

        let plen = header.plen as usize;
        if buf.len() < plen {
            return Ok(None);
        }

        let hlen = header.hlen as usize;
        let psh = (hlen > PduHeader::SIZE)
            .then(|| Bytes::copy_from_slice(&buf[PduHeader::SIZE..hlen]));
        let data = (plen > hlen).then(|| Bytes::copy_from_slice(&buf[hlen..plen]));

        Ok(Some((Self { header, psh, data }, plen)))
    }
}

impl fmt::Debug for Pdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pdu")
            .field("header", &self.header)
            .field("psh_len", &self.psh.as_ref().map(|p| p.len()))
            .field("data_len", &self.data.as_ref().map(|d| d.len()))
            .finish()
    }
}

/// Read one complete PDU from `reader`
pub async fn read_pdu<R>(reader: &mut R) -> NvmeOfResult<Pdu>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; PduHeader::SIZE];
    read_full(reader, &mut raw, "common header").await?;
    let header = PduHeader::from_bytes(&raw)?;
    header.validate()?;

    let psh = read_field(reader, header.psh_len(), "PDU-specific header").await?;
    let data = read_field(reader, header.data_len(), "PDU data").await?;

    trace!(pdu_type = ?header.pdu_type, hlen = header.hlen, plen = header.plen, "PDU received");
    Ok(Pdu { header, psh, data })
}

/// Write one PDU to `writer` as a single buffer and flush it
pub async fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> NvmeOfResult<()>
where
    W: AsyncWrite + Unpin,
{
    let buf = pdu.encode();
    writer.write_all(&buf).await?;
    writer.flush().await?;
    trace!(pdu_type = ?pdu.header.pdu_type, plen = pdu.header.plen, "PDU sent");
    Ok(())
}

async fn read_field<R>(reader: &mut R, len: usize, what: &str) -> NvmeOfResult<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    if len == 0 {
        return Ok(None);
    }
    let mut buf = BytesMut::zeroed(len);
    read_full(reader, &mut buf, what).await?;
    Ok(Some(buf.freeze()))
}

async fn read_full<R>(reader: &mut R, buf: &mut [u8], what: &str) -> NvmeOfResult<()>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(NvmeOfError::Disconnected(
            format!("stream closed while reading {}", what),
        )),
        Err(e) => Err(e.into()),
    }
}

/// C2HData PDU-specific header (16 bytes)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct C2HDataHeader {
    /// Command Capsule CID the data belongs to
    pub cccid: u16,
    /// Offset of this chunk within the transfer
    pub datao: u32,
    /// Length of this chunk
    pub datal: u32,
}

impl C2HDataHeader {
    /// Size of the C2HData PSH
    pub const SIZE: usize = 16;

    /// Parse from bytes
    pub fn from_bytes(mut buf: &[u8]) -> NvmeOfResult<Self> {
        if buf.len() < Self::SIZE {
            return Err(NvmeOfError::InvalidPdu("C2HData header too short".to_string()));
        }
        let cccid = buf.get_u16_le();
        buf.advance(2);
        let datao = buf.get_u32_le();
        let datal = buf.get_u32_le();
        Ok(Self {
            cccid,
            datao,
            datal,
        })
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u16_le(self.cccid);
        buf.put_u16_le(0);
        buf.put_u32_le(self.datao);
        buf.put_u32_le(self.datal);
        buf.put_u32_le(0);
        buf.freeze()
    }
}

/// Initialize Connection Request (ICReq) PDU-specific header
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IcReq {
    /// PDU Format Version
    pub pfv: u16,
    /// Host PDU Data Alignment
    pub hpda: u8,
    /// Digest types requested
    pub digest: u8,
    /// Maximum R2T Outstanding
    pub maxr2t: u32,
}

impl IcReq {
    /// Size of ICReq specific header (after common header)
    pub const SIZE: usize = 120;

    /// Parse from bytes (after common header)
    pub fn from_bytes(mut buf: &[u8]) -> NvmeOfResult<Self> {
        if buf.len() < Self::SIZE {
            return Err(NvmeOfError::InvalidPdu("ICReq too short".to_string()));
        }

        Ok(Self {
            pfv: buf.get_u16_le(),
            hpda: buf.get_u8(),
            digest: buf.get_u8(),
            maxr2t: buf.get_u32_le(),
        })
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u16_le(self.pfv);
        buf.put_u8(self.hpda);
        buf.put_u8(self.digest);
        buf.put_u32_le(self.maxr2t);
        buf.resize(Self::SIZE, 0);
        buf.freeze()
    }

    /// Wrap into a PDU
    pub fn to_pdu(&self) -> NvmeOfResult<Pdu> {
        Pdu::new(PduType::IcReq, 0, Some(self.to_bytes()), None)
    }
}

/// Initialize Connection Response (ICResp) PDU-specific header
///
/// The default value is all zero: no digests, no alignment requirement.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IcResp {
    /// PDU Format Version
    pub pfv: u16,
    /// Controller PDU Data Alignment
    pub cpda: u8,
    /// Digest types enabled
    pub digest: u8,
    /// Maximum Host to Controller Data
    pub maxh2cdata: u32,
}

impl IcResp {
    /// Size of ICResp specific header (after common header)
    pub const SIZE: usize = 120;

    /// Parse from bytes (after common header)
    pub fn from_bytes(mut buf: &[u8]) -> NvmeOfResult<Self> {
        if buf.len() < Self::SIZE {
            return Err(NvmeOfError::InvalidPdu("ICResp too short".to_string()));
        }

        Ok(Self {
            pfv: buf.get_u16_le(),
            cpda: buf.get_u8(),
            digest: buf.get_u8(),
            maxh2cdata: buf.get_u32_le(),
        })
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u16_le(self.pfv);
        buf.put_u8(self.cpda);
        buf.put_u8(self.digest);
        buf.put_u32_le(self.maxh2cdata);
        buf.resize(Self::SIZE, 0);
        buf.freeze()
    }

    /// Wrap into a PDU
    pub fn to_pdu(&self) -> NvmeOfResult<Pdu> {
        Pdu::new(PduType::IcResp, 0, Some(self.to_bytes()), None)
    }
}
