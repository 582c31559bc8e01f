//! Queue dispatcher
//!
//! One dispatcher serves one established queue: it owns the queue's
//! controller properties and submission queue head, receives commands one
//! at a time, runs them through the role's handler table and answers each
//! with exactly one completion (preceded by a C2HData PDU when the command
//! returns data).

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use crate::admin;
use crate::capsule::CommandCapsule;
use crate::command::{AdminOpcode, CommandResult, IoOpcode, NvmeCompletion};
use crate::error::{NvmeOfResult, NvmeStatus};
use crate::io;
use crate::properties::ControllerProperties;
use crate::target::TargetContext;
use crate::transport::NvmeTcpStream;

/// Queue identifier (0 = admin, 1+ = I/O)
pub type QueueId = u16;

/// Command identifier
pub type CommandId = u16;

/// Queue depth advertised on discovery controllers
pub const DISCOVERY_QUEUE_DEPTH: u16 = 64;

/// What kind of queue a connection carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRole {
    /// Admin queue of the NVM subsystem
    Admin,
    /// Admin queue of the discovery subsystem
    Discovery,
    /// I/O queue of the NVM subsystem
    Io,
}

impl QueueRole {
    /// Controller properties a fresh queue of this role starts with
    ///
    /// I/O queues start enabled; hosts never write CC on them.
    pub fn initial_properties(self, max_queue_depth: u16) -> ControllerProperties {
        match self {
            QueueRole::Admin => ControllerProperties::new(max_queue_depth),
            QueueRole::Discovery => ControllerProperties::new(DISCOVERY_QUEUE_DEPTH),
            QueueRole::Io => ControllerProperties::enabled(max_queue_depth),
        }
    }
}

/// Command a queue knows how to run, resolved from the opcode and role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueCommand {
    /// Property Get/Set or Connect
    Fabrics,
    /// Identify
    Identify,
    /// Get Log Page
    GetLogPage,
    /// Set Features
    SetFeatures,
    /// Keep Alive
    KeepAlive,
    /// Flush
    Flush,
    /// Write
    Write,
    /// Read
    Read,
    /// Opcode with no handler on this queue
    Unsupported(u8),
}

impl QueueCommand {
    /// Look `opcode` up in the handler table of `role`
    pub fn resolve(role: QueueRole, opcode: u8) -> Self {
        if opcode == AdminOpcode::Fabrics as u8 {
            return Self::Fabrics;
        }

        match role {
            QueueRole::Admin => match AdminOpcode::from_raw(opcode) {
                Some(AdminOpcode::Identify) => Self::Identify,
                Some(AdminOpcode::GetLogPage) => Self::GetLogPage,
                Some(AdminOpcode::SetFeatures) => Self::SetFeatures,
                Some(AdminOpcode::KeepAlive) => Self::KeepAlive,
                _ => Self::Unsupported(opcode),
            },
            QueueRole::Discovery => match AdminOpcode::from_raw(opcode) {
                Some(AdminOpcode::Identify) => Self::Identify,
                Some(AdminOpcode::GetLogPage) => Self::GetLogPage,
                _ => Self::Unsupported(opcode),
            },
            QueueRole::Io => match IoOpcode::from_raw(opcode) {
                Some(IoOpcode::Flush) => Self::Flush,
                Some(IoOpcode::Write) => Self::Write,
                Some(IoOpcode::Read) => Self::Read,
                None => Self::Unsupported(opcode),
            },
        }
    }

    /// Name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Fabrics => "fabrics",
            Self::Identify => "identify",
            Self::GetLogPage => "get_log_page",
            Self::SetFeatures => "set_features",
            Self::KeepAlive => "keep_alive",
            Self::Flush => "flush",
            Self::Write => "write",
            Self::Read => "read",
            Self::Unsupported(_) => "unsupported",
        }
    }
}

/// Submission queue head pointer reported in completions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionQueueHead {
    head: u32,
    size: u32,
}

impl SubmissionQueueHead {
    /// Head value carried by the Connect completion
    pub const AFTER_CONNECT: u16 = 1;

    /// Counter for a queue of `qsize` entries, positioned after the Connect
    ///
    /// A size of 0 never wraps before the 16-bit field does.
    pub fn new(qsize: u16) -> Self {
        let size = if qsize == 0 { 0x1_0000 } else { u32::from(qsize) };
        Self {
            head: u32::from(Self::AFTER_CONNECT),
            size,
        }
    }

    /// Current head
    pub fn get(&self) -> u16 {
        self.head as u16
    }

    /// Consume one entry and return the new head
    pub fn advance(&mut self) -> u16 {
        self.head = (self.head + 1) % self.size;
        self.head as u16
    }
}

/// Serves the commands of one established queue
pub struct QueueDispatcher<S> {
    stream: NvmeTcpStream<S>,
    ctx: Arc<TargetContext>,
    role: QueueRole,
    qid: QueueId,
    sq_head: SubmissionQueueHead,
    properties: ControllerProperties,
    commands_processed: u64,
}

impl<S> QueueDispatcher<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Dispatcher for a queue established by a Connect with `qid` and `qsize`
    pub fn new(
        stream: NvmeTcpStream<S>,
        ctx: Arc<TargetContext>,
        role: QueueRole,
        qid: QueueId,
        qsize: u16,
    ) -> Self {
        let properties = role.initial_properties(ctx.config.max_queue_depth);
        Self {
            stream,
            ctx,
            role,
            qid,
            sq_head: SubmissionQueueHead::new(qsize),
            properties,
            commands_processed: 0,
        }
    }

    /// Queue role
    pub fn role(&self) -> QueueRole {
        self.role
    }

    /// Queue ID
    pub fn qid(&self) -> QueueId {
        self.qid
    }

    /// Controller properties of this queue
    pub fn properties(&self) -> &ControllerProperties {
        &self.properties
    }

    /// Number of commands completed
    pub fn commands_processed(&self) -> u64 {
        self.commands_processed
    }

    /// Serve commands until the transport fails
    pub async fn run(mut self) -> NvmeOfResult<()> {
        loop {
            self.process_one().await?;
        }
    }

    /// Receive, execute and complete one command
    pub async fn process_one(&mut self) -> NvmeOfResult<NvmeCompletion> {
        let capsule = self.stream.recv_command().await?;
        let cid: CommandId = capsule.command.cid;
        let command = QueueCommand::resolve(self.role, capsule.command.opcode);

        let sq_head = self.sq_head.advance();
        let mut completion = NvmeCompletion::new(cid, self.qid, sq_head);

        let status = match self.execute(command, capsule).await {
            Ok(outcome) => {
                completion.dw0 = outcome.dw0;
                completion.dw1 = outcome.dw1;
                if let Some(data) = outcome.data {
                    self.stream.send_data(cid, data).await?;
                }
                NvmeStatus::Success
            }
            Err(status) => {
                completion.set_status(status);
                status
            }
        };

        debug!(
            command = command.name(),
            cid,
            ?status,
            sq_head,
            "command completed"
        );
        self.stream.send_completion(&completion).await?;
        self.commands_processed += 1;
        Ok(completion)
    }

    async fn execute(&mut self, command: QueueCommand, capsule: CommandCapsule) -> CommandResult {
        let cmd = &capsule.command;
        trace!(?cmd, "executing");

        match command {
            QueueCommand::Fabrics => self.properties.handle_fabrics(cmd),
            _ if !self.properties.is_enabled() => Err(NvmeStatus::CommandSequenceError),
            QueueCommand::Identify => admin::identify(&self.ctx, self.role, cmd),
            QueueCommand::GetLogPage => admin::get_log_page(&self.ctx, cmd),
            QueueCommand::SetFeatures => admin::set_features(cmd),
            QueueCommand::KeepAlive => admin::keep_alive(cmd),
            QueueCommand::Flush => io::flush(&self.ctx.namespace, cmd).await,
            QueueCommand::Read => io::read(&self.ctx.namespace, cmd).await,
            QueueCommand::Write => io::write(&self.ctx.namespace, cmd, capsule.data).await,
            QueueCommand::Unsupported(opcode) => {
                debug!(opcode, role = ?self.role, "unsupported opcode");
                Err(NvmeStatus::InvalidOpcode)
            }
        }
    }
}

impl<S> std::fmt::Debug for QueueDispatcher<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueDispatcher")
            .field("role", &self.role)
            .field("qid", &self.qid)
            .field("sq_head", &self.sq_head)
            .field("properties", &self.properties)
            .field("commands_processed", &self.commands_processed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::NvmeCommand;
    use crate::config::TargetConfig;
    use crate::pdu::PduType;
    use tokio::io::{duplex, DuplexStream};

    type Host = NvmeTcpStream<DuplexStream>;

    fn setup(role: QueueRole, qsize: u16) -> (Host, QueueDispatcher<DuplexStream>) {
        let (host, target) = duplex(64 * 1024);
        let ctx = Arc::new(TargetContext::new(TargetConfig::default()));
        let dispatcher = QueueDispatcher::new(NvmeTcpStream::new(target), ctx, role, 0, qsize);
        (NvmeTcpStream::new(host), dispatcher)
    }

    async fn roundtrip(
        host: &mut Host,
        dispatcher: &mut QueueDispatcher<DuplexStream>,
        cmd: NvmeCommand,
    ) -> NvmeCompletion {
        host.send_command(&CommandCapsule::new(cmd)).await.unwrap();
        dispatcher.process_one().await.unwrap();
        host.recv_completion().await.unwrap()
    }

    #[test]
    fn test_resolve_tables() {
        assert_eq!(QueueCommand::resolve(QueueRole::Admin, 0x02), QueueCommand::GetLogPage);
        assert_eq!(QueueCommand::resolve(QueueRole::Io, 0x02), QueueCommand::Read);
        assert_eq!(QueueCommand::resolve(QueueRole::Io, 0x7F), QueueCommand::Fabrics);
        assert_eq!(
            QueueCommand::resolve(QueueRole::Discovery, 0x09),
            QueueCommand::Unsupported(0x09)
        );
        assert_eq!(
            QueueCommand::resolve(QueueRole::Admin, 0x01),
            QueueCommand::Unsupported(0x01)
        );
        assert_eq!(QueueCommand::resolve(QueueRole::Admin, 0x18), QueueCommand::KeepAlive);
    }

    #[test]
    fn test_sq_head_wraps() {
        let mut head = SubmissionQueueHead::new(4);
        assert_eq!(head.get(), 1);
        let seq: Vec<u16> = (0..6).map(|_| head.advance()).collect();
        assert_eq!(seq, vec![2, 3, 0, 1, 2, 3]);
    }

    #[test]
    fn test_sq_head_zero_size() {
        let mut head = SubmissionQueueHead::new(0);
        assert_eq!(head.advance(), 2);
        for _ in 0..0xFFFD {
            head.advance();
        }
        assert_eq!(head.get(), 0xFFFF);
        assert_eq!(head.advance(), 0);
    }

    #[tokio::test]
    async fn test_disabled_controller_rejects_admin_commands() {
        let (mut host, mut dispatcher) = setup(QueueRole::Admin, 32);

        let mut identify = NvmeCommand::new(AdminOpcode::Identify as u8, 10);
        identify.cdw10 = 1;
        let cqe = roundtrip(&mut host, &mut dispatcher, identify.clone()).await;
        assert_eq!(cqe.nvme_status(), Some(NvmeStatus::CommandSequenceError));
        assert_eq!(cqe.cid, 10);
        assert_eq!(cqe.sq_head, 2);

        let enable = NvmeCommand::property_set(11, 0x14, 0x0046_0001);
        let cqe = roundtrip(&mut host, &mut dispatcher, enable).await;
        assert!(cqe.is_success());
        assert_eq!(cqe.dw0, 0x0046_0001);
        assert_eq!(cqe.sq_head, 3);

        host.send_command(&CommandCapsule::new(identify)).await.unwrap();
        dispatcher.process_one().await.unwrap();
        let pdu = host.recv_pdu().await.unwrap();
        assert_eq!(pdu.pdu_type(), PduType::C2HData);
        let cqe = host.recv_completion().await.unwrap();
        assert!(cqe.is_success());
        assert_eq!(cqe.sq_head, 4);
        assert_eq!(dispatcher.commands_processed(), 3);
    }

    #[tokio::test]
    async fn test_unsupported_opcode() {
        let (mut host, mut dispatcher) = setup(QueueRole::Io, 32);
        let cqe = roundtrip(&mut host, &mut dispatcher, NvmeCommand::new(0x05, 3)).await;
        assert_eq!(cqe.nvme_status(), Some(NvmeStatus::InvalidOpcode));
    }

    #[tokio::test]
    async fn test_second_connect_rejected() {
        let (mut host, mut dispatcher) = setup(QueueRole::Discovery, 32);
        let cqe = roundtrip(&mut host, &mut dispatcher, NvmeCommand::connect(4, 0, 31, 0)).await;
        assert_eq!(cqe.nvme_status(), Some(NvmeStatus::CommandSequenceError));
    }

    #[tokio::test]
    async fn test_io_queue_starts_enabled() {
        let (mut host, mut dispatcher) = setup(QueueRole::Io, 32);
        assert!(dispatcher.properties().is_enabled());

        let mut flush = NvmeCommand::new(IoOpcode::Flush as u8, 8);
        flush.nsid = 1;
        let cqe = roundtrip(&mut host, &mut dispatcher, flush).await;
        assert!(cqe.is_success());
    }
}
