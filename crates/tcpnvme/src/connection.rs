//! Per-connection state machine
//!
//! ```text
//! AwaitingIcReq --ICReq/ICResp--> Established --Connect--> queue dispatcher
//! ```
//!
//! The first capsule after the handshake must be a Fabrics Connect. Its
//! subsystem NQN picks the queue role; anything else is answered with an
//! error completion and the connection is closed.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use crate::capsule::{CommandCapsule, ConnectData};
use crate::command::NvmeCompletion;
use crate::error::{NvmeOfResult, NvmeStatus};
use crate::identify::CONTROLLER_ID;
use crate::queue::{QueueDispatcher, QueueId, QueueRole, SubmissionQueueHead};
use crate::target::TargetContext;
use crate::transport::NvmeTcpStream;

/// Queue established by an accepted Connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueAssignment {
    /// Role picked from the subsystem NQN and QID
    pub role: QueueRole,
    /// Queue ID
    pub qid: QueueId,
    /// Queue size from the Connect command
    pub qsize: u16,
    /// Keep alive timeout requested by the host, in milliseconds
    pub kato: u32,
    /// Host NQN
    pub hostnqn: String,
}

/// Pick the queue role for a Connect, or the status rejecting it
pub fn route_connect(
    ctx: &TargetContext,
    capsule: &CommandCapsule,
) -> Result<QueueAssignment, NvmeStatus> {
    let cmd = &capsule.command;
    if !cmd.is_connect() {
        return Err(NvmeStatus::CommandSequenceError);
    }

    let data = capsule
        .data
        .as_deref()
        .ok_or(NvmeStatus::ConnectInvalidParams)?;
    let connect = ConnectData::from_bytes(data).map_err(|_| NvmeStatus::ConnectInvalidParams)?;

    let qid = cmd.connect_qid();
    let subnqn = connect.subnqn_str();
    let role = if subnqn == ctx.config.discovery_nqn && qid == 0 {
        QueueRole::Discovery
    } else if subnqn == ctx.config.subsystem_nqn {
        if qid == 0 {
            QueueRole::Admin
        } else {
            QueueRole::Io
        }
    } else {
        warn!(subnqn, qid, "connect to unknown subsystem");
        return Err(NvmeStatus::ConnectInvalidParams);
    };

    Ok(QueueAssignment {
        role,
        qid,
        qsize: cmd.connect_sqsize(),
        kato: cmd.connect_kato(),
        hostnqn: connect.hostnqn_str().to_string(),
    })
}

/// Receive the first command and answer it
///
/// Returns `None` when the Connect was rejected; the error completion has
/// already been sent and the caller should close the connection.
pub async fn accept_connect<S>(
    stream: &mut NvmeTcpStream<S>,
    ctx: &TargetContext,
) -> NvmeOfResult<Option<QueueAssignment>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let capsule = stream.recv_command().await?;
    let cid = capsule.command.cid;

    match route_connect(ctx, &capsule) {
        Ok(assignment) => {
            let mut completion =
                NvmeCompletion::new(cid, assignment.qid, SubmissionQueueHead::AFTER_CONNECT);
            completion.dw0 = u32::from(CONTROLLER_ID);
            stream.send_completion(&completion).await?;
            Ok(Some(assignment))
        }
        Err(status) => {
            warn!(
                cid,
                opcode = capsule.command.opcode,
                ?status,
                "first command rejected"
            );
            let mut completion = NvmeCompletion::new(cid, 0, SubmissionQueueHead::AFTER_CONNECT);
            completion.set_status(status);
            stream.send_completion(&completion).await?;
            Ok(None)
        }
    }
}

/// One accepted NVMe/TCP connection
pub struct Connection<S> {
    id: u64,
    stream: S,
    ctx: Arc<TargetContext>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an accepted stream
    pub fn new(id: u64, stream: S, ctx: Arc<TargetContext>) -> Self {
        Self { id, stream, ctx }
    }

    /// Run the connection until the host goes away
    ///
    /// A host closing the stream is a normal end and returns `Ok`.
    pub async fn run(self) -> NvmeOfResult<()> {
        let Self { id, stream, ctx } = self;
        let mut stream = NvmeTcpStream::new(stream);

        let result = async {
            stream.accept_handshake().await?;

            let Some(assignment) = accept_connect(&mut stream, &ctx).await? else {
                return Ok(());
            };
            info!(
                conn = id,
                role = ?assignment.role,
                qid = assignment.qid,
                qsize = assignment.qsize,
                kato = assignment.kato,
                hostnqn = %assignment.hostnqn,
                "queue established"
            );

            QueueDispatcher::new(
                stream,
                Arc::clone(&ctx),
                assignment.role,
                assignment.qid,
                assignment.qsize,
            )
            .run()
            .await
        }
        .await;

        match result {
            Err(e) if e.is_disconnect() => {
                info!(conn = id, "host disconnected");
                Ok(())
            }
            other => other,
        }
    }
}
