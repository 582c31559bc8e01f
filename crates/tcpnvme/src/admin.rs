//! Admin and discovery command handlers

use tracing::{debug, trace};

use crate::command::{
    CommandOutcome, CommandResult, FeatureId, IdentifyCns, LogPageId, NvmeCommand,
};
use crate::discovery::DiscoveryLogPage;
use crate::error::NvmeStatus;
use crate::identify::{ActiveNamespaceList, IdentifyController, NamespaceIdDescriptorList};
use crate::queue::QueueRole;
use crate::target::TargetContext;

/// Identify, dispatched on CNS
///
/// Discovery controllers only answer Identify Controller.
pub fn identify(ctx: &TargetContext, role: QueueRole, cmd: &NvmeCommand) -> CommandResult {
    let cns = IdentifyCns::from_raw(cmd.identify_cns()).ok_or(NvmeStatus::InvalidField)?;
    trace!(?cns, nsid = cmd.nsid, ?role, "identify");

    let data = match (role, cns) {
        (QueueRole::Discovery, IdentifyCns::Controller) => {
            IdentifyController::discovery_controller(&ctx.config).to_bytes()
        }
        (QueueRole::Discovery, _) => return Err(NvmeStatus::InvalidField),
        (_, IdentifyCns::Controller) => IdentifyController::io_controller(&ctx.config).to_bytes(),
        (_, IdentifyCns::Namespace) => {
            check_nsid(ctx, cmd)?;
            ctx.namespace.identify().to_bytes()
        }
        (_, IdentifyCns::ActiveNamespaceList) => {
            ActiveNamespaceList::after(cmd.nsid, &[ctx.namespace.nsid()]).to_bytes()
        }
        (_, IdentifyCns::NamespaceIdDescriptorList) => {
            check_nsid(ctx, cmd)?;
            NamespaceIdDescriptorList::uuid(ctx.namespace.uuid().into_bytes()).to_bytes()
        }
    };

    Ok(CommandOutcome::with_data(data))
}

fn check_nsid(ctx: &TargetContext, cmd: &NvmeCommand) -> Result<(), NvmeStatus> {
    if cmd.nsid == ctx.namespace.nsid() {
        Ok(())
    } else {
        Err(NvmeStatus::InvalidField)
    }
}

/// Get Log Page; only the Discovery Log Page exists
pub fn get_log_page(ctx: &TargetContext, cmd: &NvmeCommand) -> CommandResult {
    let lid = cmd.log_page_id();
    let Some(LogPageId::Discovery) = LogPageId::from_raw(lid) else {
        debug!(lid, "unsupported log page");
        return Err(NvmeStatus::InvalidField);
    };

    let offset = cmd.log_page_offset();
    let len = cmd.log_page_len();
    let data = DiscoveryLogPage::for_target(&ctx.config)
        .read(offset, len)
        .ok_or(NvmeStatus::InvalidField)?;

    Ok(CommandOutcome::with_data(data))
}

/// Set Features
pub fn set_features(cmd: &NvmeCommand) -> CommandResult {
    match FeatureId::from_raw(cmd.feature_id()) {
        // One I/O submission and one completion queue, 0-based
        Some(FeatureId::NumberOfQueues) => Ok(CommandOutcome::with_dw0(0)),
        Some(FeatureId::AsyncEventConfig) => Ok(CommandOutcome::with_dw0(cmd.cdw11)),
        Some(FeatureId::ControllerReset) => Ok(CommandOutcome::empty()),
        None => {
            debug!(fid = cmd.feature_id(), "unsupported feature");
            Err(NvmeStatus::InvalidField)
        }
    }
}

/// Keep Alive
pub fn keep_alive(_cmd: &NvmeCommand) -> CommandResult {
    Ok(CommandOutcome::empty())
}
