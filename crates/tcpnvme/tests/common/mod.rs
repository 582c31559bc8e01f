//! Host-side helpers shared by the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;
use tcpnvme::{
    CommandCapsule, Connection, ConnectData, IcReq, NvmeCommand, NvmeCompletion, NvmeOfResult,
    NvmeTcpStream, TargetConfig, TargetContext,
};
use tokio::io::{duplex, AsyncRead, AsyncWrite, DuplexStream};
use tokio::task::JoinHandle;

pub const HOSTNQN: &str = "nqn.2014-08.org.nvmexpress:uuid:8e3c1b57-2f29-4e0e-9a8b-4a9b1a7e6c10";

/// A host talking to a target over some stream
pub struct Host<S> {
    pub stream: NvmeTcpStream<S>,
    next_cid: u16,
}

impl<S> Host<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream: NvmeTcpStream::new(stream),
            next_cid: 1,
        }
    }

    pub fn next_cid(&mut self) -> u16 {
        let cid = self.next_cid;
        self.next_cid = self.next_cid.wrapping_add(1);
        cid
    }

    pub async fn handshake(&mut self) {
        let icresp = self.stream.initiate_handshake(&IcReq::default()).await.unwrap();
        assert_eq!(icresp.to_bytes().len(), 120);
    }

    pub async fn connect(&mut self, subnqn: &str, qid: u16, qsize: u16) -> NvmeCompletion {
        let cid = self.next_cid();
        let data = ConnectData::new([0x11; 16], subnqn, HOSTNQN).to_bytes();
        let capsule = CommandCapsule::with_data(NvmeCommand::connect(cid, qid, qsize, 0), data);
        self.submit(capsule).await
    }

    pub async fn submit(&mut self, capsule: CommandCapsule) -> NvmeCompletion {
        self.stream.send_command(&capsule).await.unwrap();
        self.stream.recv_completion().await.unwrap()
    }

    pub async fn command(&mut self, cmd: NvmeCommand) -> NvmeCompletion {
        self.submit(CommandCapsule::new(cmd)).await
    }

    /// Send a command that returns data; yields the data and the completion
    pub async fn command_with_data(&mut self, cmd: NvmeCommand) -> (Bytes, NvmeCompletion) {
        let cid = cmd.cid;
        self.stream
            .send_command(&CommandCapsule::new(cmd))
            .await
            .unwrap();
        let (cccid, data) = self.stream.recv_transfer().await.unwrap();
        assert_eq!(cccid, cid);
        let completion = self.stream.recv_completion().await.unwrap();
        (data, completion)
    }

    pub async fn enable(&mut self) -> NvmeCompletion {
        let cid = self.next_cid();
        self.command(NvmeCommand::property_set(cid, 0x14, 0x0046_0001))
            .await
    }
}

/// Start a connection task over an in-memory pipe
pub fn start(config: TargetConfig) -> (Host<DuplexStream>, JoinHandle<NvmeOfResult<()>>) {
    start_with_context(Arc::new(TargetContext::new(config)))
}

pub fn start_with_context(
    ctx: Arc<TargetContext>,
) -> (Host<DuplexStream>, JoinHandle<NvmeOfResult<()>>) {
    let (host, target) = duplex(1 << 20);
    let task = tokio::spawn(Connection::new(0, target, ctx).run());
    (Host::new(host), task)
}

/// NUL-terminated string inside a fixed-width field
pub fn field_str(raw: &[u8]) -> &str {
    let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    std::str::from_utf8(&raw[..len]).unwrap()
}
