//! NVMe/TCP stream transport
//!
//! [`NvmeTcpStream`] wraps any byte stream (a `TcpStream` in production,
//! a `tokio::io::duplex` pipe in tests) and speaks whole PDUs over it:
//! the ICReq/ICResp exchange, command and response capsules, and C2HData.
//! Both the target side and the host side helpers live here so tests can
//! drive a target end to end.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use crate::capsule::{CommandCapsule, ResponseCapsule};
use crate::command::NvmeCompletion;
use crate::error::{NvmeOfError, NvmeOfResult};
use crate::pdu::{flags, read_pdu, write_pdu, C2HDataHeader, IcReq, IcResp, Pdu, PduType};

/// Largest data payload carried by one C2HData PDU
pub const C2H_DATA_CHUNK: usize = 1 << 20;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the ICReq/ICResp exchange
    AwaitingIcReq,
    /// Handshake done, capsules may flow
    Established,
    /// A framing or I/O failure ended the connection
    Failed,
}

/// PDU-level view of one NVMe/TCP connection
pub struct NvmeTcpStream<S> {
    stream: S,
    state: ConnectionState,
    pdus_received: u64,
    pdus_sent: u64,
}

impl<S> NvmeTcpStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a freshly connected stream
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            state: ConnectionState::AwaitingIcReq,
            pdus_received: 0,
            pdus_sent: 0,
        }
    }

    /// Get connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Number of PDUs received so far
    pub fn pdus_received(&self) -> u64 {
        self.pdus_received
    }

    /// Number of PDUs sent so far
    pub fn pdus_sent(&self) -> u64 {
        self.pdus_sent
    }

    /// Unwrap the underlying stream
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Receive one complete PDU
    pub async fn recv_pdu(&mut self) -> NvmeOfResult<Pdu> {
        match read_pdu(&mut self.stream).await {
            Ok(pdu) => {
                self.pdus_received += 1;
                Ok(pdu)
            }
            Err(e) => {
                self.state = ConnectionState::Failed;
                Err(e)
            }
        }
    }

    /// Send one complete PDU
    pub async fn send_pdu(&mut self, pdu: &Pdu) -> NvmeOfResult<()> {
        match write_pdu(&mut self.stream, pdu).await {
            Ok(()) => {
                self.pdus_sent += 1;
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Failed;
                Err(e)
            }
        }
    }

    async fn recv_expected(&mut self, expected: PduType) -> NvmeOfResult<Pdu> {
        let pdu = self.recv_pdu().await?;
        if pdu.pdu_type() != expected {
            self.state = ConnectionState::Failed;
            return Err(NvmeOfError::UnexpectedPdu {
                expected,
                got: pdu.pdu_type(),
            });
        }
        Ok(pdu)
    }

    // ======== Target side ========

    /// Perform ICReq/ICResp handshake (target side)
    pub async fn accept_handshake(&mut self) -> NvmeOfResult<IcReq> {
        let pdu = self.recv_expected(PduType::IcReq).await?;
        let icreq = IcReq::from_bytes(pdu.psh.as_deref().unwrap_or_default())?;
        trace!(pfv = icreq.pfv, hpda = icreq.hpda, digest = icreq.digest, "ICReq received");

        self.send_pdu(&IcResp::default().to_pdu()?).await?;
        self.state = ConnectionState::Established;
        debug!("NVMe/TCP connection initialized (target)");
        Ok(icreq)
    }

    /// Receive the next command capsule
    pub async fn recv_command(&mut self) -> NvmeOfResult<CommandCapsule> {
        let pdu = self.recv_expected(PduType::CapsuleCmd).await?;
        let capsule = CommandCapsule::from_pdu(pdu)?;
        trace!(
            cid = capsule.command.cid,
            opcode = capsule.command.opcode,
            data_len = capsule.data_len(),
            "command capsule received"
        );
        Ok(capsule)
    }

    /// Send a completion in a response capsule
    pub async fn send_completion(&mut self, completion: &NvmeCompletion) -> NvmeOfResult<()> {
        let pdu = ResponseCapsule::new(completion.clone()).to_pdu()?;
        self.send_pdu(&pdu).await
    }

    /// Send `data` for command `cccid` as C2HData PDUs
    ///
    /// Transfers larger than [`C2H_DATA_CHUNK`] are split; only the final
    /// PDU carries `LAST_PDU`.
    pub async fn send_data(&mut self, cccid: u16, data: Bytes) -> NvmeOfResult<()> {
        let total = data.len();
        let mut offset = 0;
        loop {
            let end = total.min(offset + C2H_DATA_CHUNK);
            let chunk = data.slice(offset..end);
            let psh = C2HDataHeader {
                cccid,
                datao: transfer_u32(offset)?,
                datal: transfer_u32(chunk.len())?,
            };
            let last = end == total;
            let pdu_flags = if last { flags::LAST_PDU } else { 0 };
            let pdu = Pdu::new(PduType::C2HData, pdu_flags, Some(psh.to_bytes()), Some(chunk))?;
            trace!(cccid, datao = psh.datao, datal = psh.datal, last, "C2HData sent");
            self.send_pdu(&pdu).await?;

            if last {
                return Ok(());
            }
            offset = end;
        }
    }

    // ======== Host side ========

    /// Perform ICReq/ICResp handshake (host side)
    pub async fn initiate_handshake(&mut self, icreq: &IcReq) -> NvmeOfResult<IcResp> {
        self.send_pdu(&icreq.to_pdu()?).await?;
        let pdu = self.recv_expected(PduType::IcResp).await?;
        let icresp = IcResp::from_bytes(pdu.psh.as_deref().unwrap_or_default())?;
        self.state = ConnectionState::Established;
        debug!("NVMe/TCP connection initialized (host)");
        Ok(icresp)
    }

    /// Send a command capsule
    pub async fn send_command(&mut self, capsule: &CommandCapsule) -> NvmeOfResult<()> {
        self.send_pdu(&capsule.to_pdu()?).await
    }

    /// Receive the next completion
    pub async fn recv_completion(&mut self) -> NvmeOfResult<NvmeCompletion> {
        let pdu = self.recv_expected(PduType::CapsuleResp).await?;
        Ok(ResponseCapsule::from_pdu(&pdu)?.completion)
    }

    /// Receive C2HData PDUs up to `LAST_PDU` and reassemble the transfer
    pub async fn recv_transfer(&mut self) -> NvmeOfResult<(u16, Bytes)> {
        let mut buf = BytesMut::new();
        let mut cccid = None;
        loop {
            let pdu = self.recv_expected(PduType::C2HData).await?;
            let last = pdu.header.flags & flags::LAST_PDU != 0;
            let header = C2HDataHeader::from_bytes(pdu.psh.as_deref().unwrap_or_default())?;
            let data = pdu.data.unwrap_or_default();

            let expected = *cccid.get_or_insert(header.cccid);
            if expected != header.cccid {
                return Err(NvmeOfError::InvalidPdu(format!(
                    "C2HData for cid {} inside transfer for cid {}",
                    header.cccid, expected
                )));
            }
            if header.datao as usize != buf.len() || header.datal as usize != data.len() {
                return Err(NvmeOfError::InvalidPdu(format!(
                    "C2HData out of order: datao {} datal {} after {} bytes",
                    header.datao,
                    header.datal,
                    buf.len()
                )));
            }
            buf.extend_from_slice(&data);

            if last {
                return Ok((header.cccid, buf.freeze()));
            }
        }
    }
}

fn transfer_u32(len: usize) -> NvmeOfResult<u32> {
    u32::try_from(len)
        .map_err(|_| NvmeOfError::InvalidPdu(format!("data transfer too long: {} bytes", len)))
}

impl<S> std::fmt::Debug for NvmeTcpStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvmeTcpStream")
            .field("state", &self.state)
            .field("pdus_received", &self.pdus_received)
            .field("pdus_sent", &self.pdus_sent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::NvmeCommand;
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn test_handshake_both_sides() {
        let (host, target) = duplex(4096);
        let mut host = NvmeTcpStream::new(host);
        let mut target = NvmeTcpStream::new(target);

        let target_task = tokio::spawn(async move {
            let icreq = target.accept_handshake().await.unwrap();
            (icreq, target.state())
        });

        let icreq = IcReq {
            maxr2t: 4,
            ..IcReq::default()
        };
        let icresp = host.initiate_handshake(&icreq).await.unwrap();
        assert_eq!(icresp, IcResp::default());
        assert_eq!(host.state(), ConnectionState::Established);

        let (received, state) = target_task.await.unwrap();
        assert_eq!(received.maxr2t, 4);
        assert_eq!(state, ConnectionState::Established);
    }

    #[tokio::test]
    async fn test_handshake_rejects_other_pdu() {
        let (host, target) = duplex(4096);
        let mut host = NvmeTcpStream::new(host);
        let mut target = NvmeTcpStream::new(target);

        let capsule = CommandCapsule::new(NvmeCommand::connect(1, 0, 31, 0));
        host.send_command(&capsule).await.unwrap();

        let err = target.accept_handshake().await.unwrap_err();
        assert!(matches!(
            err,
            NvmeOfError::UnexpectedPdu {
                expected: PduType::IcReq,
                got: PduType::CapsuleCmd
            }
        ));
        assert_eq!(target.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_send_data_layout() {
        let (host, target) = duplex(16384);
        let mut host = NvmeTcpStream::new(host);
        let mut target = NvmeTcpStream::new(target);

        target
            .send_data(7, Bytes::from(vec![0xAB; 4096]))
            .await
            .unwrap();

        let pdu = host.recv_pdu().await.unwrap();
        assert_eq!(pdu.pdu_type(), PduType::C2HData);
        assert_eq!(pdu.header.flags & flags::LAST_PDU, flags::LAST_PDU);
        assert_eq!(pdu.header.hlen, 24);
        assert_eq!(pdu.header.pdo, 24);
        assert_eq!(pdu.header.plen, 24 + 4096);

        let header = C2HDataHeader::from_bytes(pdu.psh.as_deref().unwrap()).unwrap();
        assert_eq!(header.cccid, 7);
        assert_eq!(header.datao, 0);
        assert_eq!(header.datal, 4096);
    }

    #[tokio::test]
    async fn test_large_transfer_is_split() {
        let (host, target) = duplex(1 << 16);
        let mut host = NvmeTcpStream::new(host);
        let mut target = NvmeTcpStream::new(target);

        let len = 2 * C2H_DATA_CHUNK + 4096;
        let payload = Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>());
        let sent = payload.clone();
        let sender = tokio::spawn(async move {
            target.send_data(3, sent).await.unwrap();
            target.pdus_sent()
        });

        let (cccid, data) = host.recv_transfer().await.unwrap();
        assert_eq!(cccid, 3);
        assert_eq!(data, payload);
        assert_eq!(host.pdus_received(), 3);
        assert_eq!(sender.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_chunk_offsets_and_last_flag() {
        let (host, target) = duplex(1 << 16);
        let mut host = NvmeTcpStream::new(host);
        let mut target = NvmeTcpStream::new(target);

        let sender = tokio::spawn(async move {
            target
                .send_data(9, Bytes::from(vec![0u8; C2H_DATA_CHUNK + 1]))
                .await
                .unwrap();
        });

        let first = host.recv_pdu().await.unwrap();
        let header = C2HDataHeader::from_bytes(first.psh.as_deref().unwrap()).unwrap();
        assert_eq!(first.header.flags & flags::LAST_PDU, 0);
        assert_eq!((header.datao, header.datal), (0, C2H_DATA_CHUNK as u32));

        let second = host.recv_pdu().await.unwrap();
        let header = C2HDataHeader::from_bytes(second.psh.as_deref().unwrap()).unwrap();
        assert_eq!(second.header.flags & flags::LAST_PDU, flags::LAST_PDU);
        assert_eq!((header.datao, header.datal), (C2H_DATA_CHUNK as u32, 1));
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_stream_is_disconnect() {
        let (mut host, target) = duplex(64);
        let mut target = NvmeTcpStream::new(target);

        host.write_all(&[0x04, 0x00, 72]).await.unwrap();
        drop(host);

        let err = target.recv_command().await.unwrap_err();
        assert!(err.is_disconnect());
        assert_eq!(target.pdus_received(), 0);
    }
}
